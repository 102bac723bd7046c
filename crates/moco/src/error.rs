//! Error types for construction, collectives, the negative queue, and
//! checkpoint import/export.

use std::path::PathBuf;

/// Configuration errors. Detected once at construction and fatal.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Queue capacity is not a whole number of enqueue batches.
    #[error("queue capacity {capacity} is not divisible by the enqueue batch size {batch_size}")]
    QueueNotDivisible { capacity: usize, batch_size: usize },

    /// Cross-entropy needs a candidate set; it cannot run on positives alone.
    #[error("loss type `ce` requires negative examples (use `ip` or `bce` without negatives)")]
    CrossEntropyWithoutNegatives,

    /// Configured embedding width disagrees with what the encoder produces.
    #[error("embedding dimension mismatch: configured {configured}, encoder produces {actual}")]
    EmbeddingDimMismatch { configured: usize, actual: usize },

    /// Unknown optimizer identifier.
    #[error("unsupported optimizer `{0}` (expected one of: sgd, adam, lars)")]
    UnsupportedOptimizer(String),

    /// Unknown MLP normalization identifier.
    #[error("unsupported normalization `{0}` (expected one of: none, batch_norm, layer_norm)")]
    UnsupportedNormalization(String),

    /// Unknown loss identifier.
    #[error("unsupported loss type `{0}` (expected one of: ce, ip, bce)")]
    UnsupportedLoss(String),

    /// Unknown string-valued option other than the above.
    #[error("unsupported value `{value}` for `{field}`")]
    UnsupportedValue { field: &'static str, value: String },

    /// Momentum must lie in [0, 1).
    #[error("momentum {0} outside [0, 1)")]
    MomentumOutOfRange(f64),

    /// Temperature must be strictly positive.
    #[error("temperature must be > 0, got {0}")]
    NonPositiveTemperature(f64),

    /// A size that must be non-zero was zero.
    #[error("`{0}` must be greater than zero")]
    ZeroSized(&'static str),
}

/// Failures of the collective layer that can be detected locally.
///
/// A peer that never reaches a barrier is not one of them: that stalls.
#[derive(Debug, thiserror::Error)]
pub enum DistributedError {
    /// A rank outside `0..world_size` was used.
    #[error("rank {rank} out of range for world size {world_size}")]
    RankOutOfRange { rank: usize, world_size: usize },

    /// Another worker panicked while holding the shared exchange slot.
    #[error("collective state poisoned: {0}")]
    Poisoned(String),

    /// A worker read the exchange slot before its peer wrote it.
    #[error("collective slot for rank {0} was empty")]
    MissingContribution(usize),

    /// Workers contributed incompatible tensors.
    #[error("shape mismatch across workers: {0}")]
    ShapeMismatch(String),

    /// The permutation does not cover the global batch.
    #[error("invalid permutation: {0}")]
    InvalidPermutation(String),
}

/// Failures when writing into the negative queue.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// The batch would straddle the end of the buffer.
    #[error("enqueue of {batch} rows at cursor {cursor} would overflow capacity {capacity}")]
    Overflow {
        batch: usize,
        cursor: usize,
        capacity: usize,
    },

    /// Row width differs from the queue's embedding dimension.
    #[error("enqueued embeddings have dim {actual}, queue holds dim {expected}")]
    DimMismatch { expected: usize, actual: usize },

    /// Persisted state is internally inconsistent.
    #[error("invalid queue state: {0}")]
    InvalidState(String),
}

/// Failures during checkpoint export/import.
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    /// A required field is absent from the checkpoint metadata.
    #[error("checkpoint {path} is missing required field `{field}`")]
    MissingField { path: PathBuf, field: &'static str },

    /// The checkpoint was produced for a different embedding width.
    #[error("checkpoint embedding_dim {found} does not match expected {expected}")]
    DimensionMismatch { expected: usize, found: usize },

    /// Encoder architecture in the checkpoint differs from the requested one.
    #[error("checkpoint encoder {found} does not match expected {expected}")]
    EncoderMismatch { expected: String, found: String },

    /// Loaded weights do not have the structure the caller's config builds.
    #[error("checkpoint weights do not match the expected structure: {0}")]
    StructureMismatch(String),

    /// Weight file could not be loaded by the burn recorder.
    #[error("failed to load weights from {path}: {message}")]
    Recorder { path: PathBuf, message: String },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// Umbrella error returned by the per-step training call.
#[derive(Debug, thiserror::Error)]
pub enum MocoError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("distributed error: {0}")]
    Distributed(#[from] DistributedError),

    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    /// Two views of a batch disagree in shape.
    #[error("view shape mismatch: {0:?} vs {1:?}")]
    ViewShapeMismatch([usize; 2], [usize; 2]),

    /// Step inputs inconsistent with the resolved configuration.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Reading tensor data back to the host failed.
    #[error("tensor data error: {0}")]
    Data(String),
}
