//! TOML-loadable settings and their one-time resolution.
//!
//! String identifiers (`loss_type`, `mlp_normalization`, `optimizer`, ...)
//! stay strings in [`MocoConfig`] so a config file round-trips verbatim.
//! [`MocoConfig::validate`] resolves them into closed enums, checks every
//! construction-time invariant, and returns a [`ResolvedConfig`] that the
//! learner consumes.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::model::encoder::EncoderArch;
use crate::model::mlp::MlpNorm;
use crate::model::momentum::MomentumPairConfig;
use crate::model::tower::TowerConfig;
use crate::training::loss::{LossConfig, LossType, NegativeSource};
use crate::training::optim::{OptimizerKind, OptimizerSettings};
use crate::training::queue::QueueInit;

/// Settings for one contrastive training run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MocoConfig {
    #[serde(default)]
    pub encoder: EncoderArch,

    /// Width of the normalized embeddings.
    #[serde(default = "default_embedding_dim")]
    pub embedding_dim: usize,

    /// Linear layers in the projection head (0 = identity).
    #[serde(default = "default_projection_mlp_layers")]
    pub projection_mlp_layers: usize,

    /// Linear layers in the online-only prediction head (0 = none).
    #[serde(default)]
    pub prediction_mlp_layers: usize,

    #[serde(default = "default_mlp_hidden_dim")]
    pub mlp_hidden_dim: usize,

    /// `"none" | "batch_norm" | "layer_norm"`
    #[serde(default = "default_mlp_normalization")]
    pub mlp_normalization: String,

    /// Negative queue capacity K.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Per-worker batch size.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Base EMA coefficient.
    #[serde(default = "default_momentum")]
    pub momentum: f64,

    #[serde(default = "default_temperature")]
    pub temperature: f64,

    /// `"ce" | "ip" | "bce"`
    #[serde(default = "default_loss_type")]
    pub loss_type: String,

    #[serde(default = "default_true")]
    pub use_negative_examples: bool,

    /// `"queue" | "batch"`
    #[serde(default = "default_negative_source")]
    pub negative_source: String,

    #[serde(default)]
    pub use_both_augmentations_as_queries: bool,

    #[serde(default)]
    pub use_momentum_schedule: bool,

    #[serde(default = "default_true")]
    pub use_lagging_model: bool,

    /// Shuffle key views across workers before the target forward pass.
    #[serde(default = "default_true")]
    pub shuffle_batch_norm: bool,

    /// Enqueue keys gathered from every worker instead of the local batch.
    #[serde(default = "default_true")]
    pub gather_keys_for_queue: bool,

    #[serde(default)]
    pub queue_init: QueueInit,

    #[serde(default = "default_seed")]
    pub seed: u64,

    /// `"sgd" | "adam" | "lars"`
    #[serde(default = "default_optimizer")]
    pub optimizer: String,

    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,

    #[serde(default = "default_weight_decay")]
    pub weight_decay: f64,

    #[serde(default = "default_lars_eta")]
    pub lars_eta: f64,

    #[serde(default = "default_optimizer_momentum")]
    pub optimizer_momentum: f64,

    /// Parameter-path substrings that skip weight decay and LARS scaling.
    #[serde(default)]
    pub exclude_matching_parameters: Vec<String>,

    /// Horizon for the momentum and learning-rate schedules.
    #[serde(default = "default_total_steps")]
    pub total_steps: usize,

    #[serde(default)]
    pub warmup_steps: usize,
}

fn default_embedding_dim() -> usize {
    128
}
fn default_projection_mlp_layers() -> usize {
    2
}
fn default_mlp_hidden_dim() -> usize {
    2048
}
fn default_mlp_normalization() -> String {
    "none".to_string()
}
fn default_queue_capacity() -> usize {
    65536
}
fn default_batch_size() -> usize {
    256
}
fn default_momentum() -> f64 {
    0.999
}
fn default_temperature() -> f64 {
    0.2
}
fn default_loss_type() -> String {
    "ce".to_string()
}
fn default_negative_source() -> String {
    "queue".to_string()
}
fn default_true() -> bool {
    true
}
fn default_seed() -> u64 {
    42
}
fn default_optimizer() -> String {
    "sgd".to_string()
}
fn default_learning_rate() -> f64 {
    0.03
}
fn default_weight_decay() -> f64 {
    1e-4
}
fn default_lars_eta() -> f64 {
    1e-3
}
fn default_optimizer_momentum() -> f64 {
    0.9
}
fn default_total_steps() -> usize {
    100_000
}

impl Default for MocoConfig {
    fn default() -> Self {
        Self {
            encoder: EncoderArch::default(),
            embedding_dim: default_embedding_dim(),
            projection_mlp_layers: default_projection_mlp_layers(),
            prediction_mlp_layers: 0,
            mlp_hidden_dim: default_mlp_hidden_dim(),
            mlp_normalization: default_mlp_normalization(),
            queue_capacity: default_queue_capacity(),
            batch_size: default_batch_size(),
            momentum: default_momentum(),
            temperature: default_temperature(),
            loss_type: default_loss_type(),
            use_negative_examples: true,
            negative_source: default_negative_source(),
            use_both_augmentations_as_queries: false,
            use_momentum_schedule: false,
            use_lagging_model: true,
            shuffle_batch_norm: true,
            gather_keys_for_queue: true,
            queue_init: QueueInit::default(),
            seed: default_seed(),
            optimizer: default_optimizer(),
            learning_rate: default_learning_rate(),
            weight_decay: default_weight_decay(),
            lars_eta: default_lars_eta(),
            optimizer_momentum: default_optimizer_momentum(),
            exclude_matching_parameters: Vec::new(),
            total_steps: default_total_steps(),
            warmup_steps: 0,
        }
    }
}

/// Queue geometry after accounting for cross-worker gathering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueSettings {
    pub capacity: usize,
    pub dim: usize,
    /// Rows written per enqueue: the global batch when gathering.
    pub enqueue_batch: usize,
    pub init: QueueInit,
}

/// Validated settings with every identifier resolved.
#[derive(Debug)]
pub struct ResolvedConfig {
    pub pair: MomentumPairConfig,
    pub loss: LossConfig,
    /// `None` when negatives do not come from a queue.
    pub queue: Option<QueueSettings>,
    pub optimizer: OptimizerSettings,
    pub world_size: usize,
    pub batch_size: usize,
    /// Effective: requested and more than one worker.
    pub shuffle_batch_norm: bool,
    /// Effective: requested and more than one worker.
    pub gather_keys_for_queue: bool,
    pub seed: u64,
    pub learning_rate: f64,
    pub total_steps: usize,
    pub warmup_steps: usize,
}

impl MocoConfig {
    /// Check every construction-time invariant for a run over `world_size`
    /// workers and resolve string identifiers.
    pub fn validate(&self, world_size: usize) -> Result<ResolvedConfig, ConfigError> {
        if world_size == 0 {
            return Err(ConfigError::ZeroSized("world_size"));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::ZeroSized("batch_size"));
        }

        let mlp_norm: MlpNorm = self.mlp_normalization.parse()?;
        let loss_type: LossType = self.loss_type.parse()?;
        let negative_source: NegativeSource = self.negative_source.parse()?;
        let optimizer: OptimizerKind = self.optimizer.parse()?;

        let loss = LossConfig {
            loss_type,
            use_negative_examples: self.use_negative_examples,
            negative_source,
            use_both_augmentations_as_queries: self.use_both_augmentations_as_queries,
            temperature: self.temperature,
        };
        if !(self.temperature > 0.0 && self.temperature.is_finite()) {
            return Err(ConfigError::NonPositiveTemperature(self.temperature));
        }
        if !self.use_negative_examples && loss_type == LossType::CrossEntropy {
            return Err(ConfigError::CrossEntropyWithoutNegatives);
        }

        let tower = TowerConfig::new(self.encoder.clone(), self.embedding_dim)
            .with_projection_layers(self.projection_mlp_layers)
            .with_mlp_hidden_dim(self.mlp_hidden_dim)
            .with_mlp_norm(mlp_norm);
        let pair = MomentumPairConfig::new(tower)
            .with_prediction_layers(self.prediction_mlp_layers)
            .with_momentum(self.momentum)
            .with_use_momentum_schedule(self.use_momentum_schedule)
            .with_use_lagging_model(self.use_lagging_model);
        pair.validate()?;

        let distributed = world_size > 1;
        let gather = self.gather_keys_for_queue && distributed;
        let shuffle = self.shuffle_batch_norm && distributed;

        let queue = (self.use_negative_examples && negative_source == NegativeSource::Queue)
            .then(|| {
                let enqueue_batch = if gather {
                    self.batch_size * world_size
                } else {
                    self.batch_size
                };
                if self.queue_capacity == 0 {
                    return Err(ConfigError::ZeroSized("queue_capacity"));
                }
                if self.queue_capacity % enqueue_batch != 0 {
                    return Err(ConfigError::QueueNotDivisible {
                        capacity: self.queue_capacity,
                        batch_size: enqueue_batch,
                    });
                }
                Ok(QueueSettings {
                    capacity: self.queue_capacity,
                    dim: self.embedding_dim,
                    enqueue_batch,
                    init: self.queue_init,
                })
            })
            .transpose()?;

        if shuffle && mlp_norm != MlpNorm::BatchNorm {
            tracing::warn!(
                mlp_normalization = %self.mlp_normalization,
                "shuffle_batch_norm enabled without batch norm in the heads; \
                 shuffling only matters if the backbone normalizes per worker"
            );
        }
        if !self.use_lagging_model && self.use_momentum_schedule {
            tracing::warn!("use_momentum_schedule has no effect without a lagging target");
        }

        tracing::info!(
            world_size,
            batch_size = self.batch_size,
            loss_type = %loss_type,
            optimizer = %optimizer,
            shuffle,
            gather,
            "Configuration validated"
        );

        Ok(ResolvedConfig {
            pair,
            loss,
            queue,
            optimizer: OptimizerSettings {
                kind: optimizer,
                weight_decay: self.weight_decay,
                momentum: self.optimizer_momentum,
                lars_eta: self.lars_eta,
                exclude_patterns: self.exclude_matching_parameters.clone(),
            },
            world_size,
            batch_size: self.batch_size,
            shuffle_batch_norm: shuffle,
            gather_keys_for_queue: gather,
            seed: self.seed,
            learning_rate: self.learning_rate,
            total_steps: self.total_steps,
            warmup_steps: self.warmup_steps,
        })
    }
}

/// Load and deserialize a [`MocoConfig`] from a TOML file.
pub fn load_config(path: &Path) -> anyhow::Result<MocoConfig> {
    let contents = std::fs::read_to_string(path)?;
    let config: MocoConfig = toml::from_str(&contents)?;
    tracing::info!(path = %path.display(), "Loaded config");
    Ok(config)
}
