//! Contrastive training machinery: negative queue, cross-worker shuffling,
//! the loss engine, optimizer groups, checkpoints and the per-step learner.

pub mod checkpoint;
pub mod config;
pub mod learner;
pub mod loss;
pub mod metrics;
pub mod optim;
pub mod queue;
pub mod shuffle;
