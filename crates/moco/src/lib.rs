//! Momentum contrastive representation learning (MoCo, MoCo v2, BYOL) on burn.
//!
//! An online tower is trained by gradient descent while a target tower
//! follows it by exponential moving average. Queries from the online tower
//! are contrasted against keys from the target tower and, optionally,
//! negatives from a rolling queue of past keys. Across data-parallel
//! workers, key views are shuffled before the target forward pass so
//! per-worker normalization statistics cannot leak pairing information.

pub mod distributed;
pub mod error;
pub mod model;
pub mod training;

pub use distributed::{Collective, LocalGroup, LocalWorker, SingleProcess};
pub use error::{CheckpointError, ConfigError, DistributedError, MocoError, QueueError};
pub use model::momentum::{MomentumPair, MomentumPairConfig};
pub use training::config::{load_config, MocoConfig, ResolvedConfig};
pub use training::learner::{init_queue, ContrastiveLearner, StepOutput};
pub use training::loss::{LossConfig, LossEngine, LossType, NegativeSource};
pub use training::optim::{ContrastiveOptimizer, OptimizerKind};
pub use training::queue::NegativeQueue;
