//! The per-step boundary operation.
//!
//! ```text
//! training_step(view1, view2):
//!   negatives = queue.snapshot()                      (before this step's keys)
//!   q1 = online(view1)
//!   k2 = unshuffle(target(shuffle(view2)))            (shuffle only across workers)
//!   [q2 = online(view2), k1 = unshuffle(target(shuffle(view1)))]   symmetric
//!   loss = engine(q, k, negatives)
//!   queue.enqueue(gather(k2))
//!
//! driver: backward → optimizer.step → learner.momentum_update(pair)
//! ```

use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;

use crate::distributed::Collective;
use crate::error::{ConfigError, DistributedError, MocoError};
use crate::model::bridge::tensor_to_f64;
use crate::model::momentum::MomentumPair;
use crate::training::config::ResolvedConfig;
use crate::training::loss::LossEngine;
use crate::training::metrics::StepMetrics;
use crate::training::queue::NegativeQueue;
use crate::training::shuffle::BatchShuffler;

/// Result of one training step.
pub struct StepOutput<B: Backend> {
    /// Scalar loss on the online tower's gradient graph.
    pub loss: Tensor<B, 1>,
    pub metrics: StepMetrics,
}

/// Allocate the negative queue described by `resolved`, if it uses one.
pub fn init_queue<B: Backend>(
    resolved: &ResolvedConfig,
    device: &B::Device,
) -> Result<Option<NegativeQueue<B>>, ConfigError> {
    resolved
        .queue
        .map(|q| NegativeQueue::new(q.capacity, q.dim, q.enqueue_batch, q.init, device))
        .transpose()
}

/// Drives the contrastive step for one worker.
pub struct ContrastiveLearner {
    engine: LossEngine,
    collective: Box<dyn Collective>,
    shuffler: Option<BatchShuffler>,
    gather_keys: bool,
    batch_size: usize,
    total_steps: usize,
    step: usize,
}

impl ContrastiveLearner {
    pub fn new(resolved: &ResolvedConfig, collective: Box<dyn Collective>) -> Result<Self, MocoError> {
        if collective.world_size() != resolved.world_size {
            return Err(DistributedError::ShapeMismatch(format!(
                "configured for {} workers, collective has {}",
                resolved.world_size,
                collective.world_size()
            ))
            .into());
        }
        let engine = LossEngine::new(resolved.loss)?;
        let shuffler = resolved
            .shuffle_batch_norm
            .then(|| BatchShuffler::new(resolved.seed));

        tracing::info!(
            rank = collective.rank(),
            world_size = collective.world_size(),
            shuffle = shuffler.is_some(),
            gather = resolved.gather_keys_for_queue,
            "Contrastive learner ready"
        );

        Ok(Self {
            engine,
            collective,
            shuffler,
            gather_keys: resolved.gather_keys_for_queue,
            batch_size: resolved.batch_size,
            total_steps: resolved.total_steps,
            step: 0,
        })
    }

    /// Steps completed (momentum updates applied).
    pub fn step(&self) -> usize {
        self.step
    }

    /// Resume the step counter, e.g. after loading a checkpoint.
    pub fn set_step(&mut self, step: usize) {
        self.step = step;
    }

    pub fn total_steps(&self) -> usize {
        self.total_steps
    }

    pub fn rank(&self) -> usize {
        self.collective.rank()
    }

    pub fn engine(&self) -> &LossEngine {
        &self.engine
    }

    /// Compute the loss for two augmented views of this worker's batch and
    /// enqueue the keys. Does not touch parameters.
    ///
    /// # Arguments
    /// - `queue`: required when negatives come from the queue, ignored otherwise
    /// - `view1`, `view2`: shape `(batch, input_dim)`, two augmentations of the
    ///   same examples; `batch` must equal the configured `batch_size` whenever
    ///   a queue or a collective is involved
    ///
    /// # Returns
    /// The scalar loss on the online tower's graph, ready for `backward()`,
    /// and this step's [`StepMetrics`]. On error nothing has been enqueued.
    pub fn training_step<B: AutodiffBackend>(
        &mut self,
        pair: &MomentumPair<B>,
        queue: Option<&mut NegativeQueue<B>>,
        view1: Tensor<B, 2>,
        view2: Tensor<B, 2>,
    ) -> Result<StepOutput<B>, MocoError> {
        if view1.dims() != view2.dims() {
            return Err(MocoError::ViewShapeMismatch(view1.dims(), view2.dims()));
        }
        let batch = view1.dims()[0];
        if batch == 0 {
            return Err(MocoError::InvalidInput("empty batch".to_string()));
        }
        // Collectives need equal shards, and the queue advances on a grid of
        // whole batches.
        let fixed_batch = self.shuffler.is_some() || self.gather_keys || self.engine.needs_queue();
        if fixed_batch && batch != self.batch_size {
            return Err(MocoError::InvalidInput(format!(
                "batch of {batch} rows, every worker must contribute {}",
                self.batch_size
            )));
        }
        if self.engine.needs_queue() && queue.is_none() {
            return Err(MocoError::InvalidInput(
                "queue negatives enabled but no queue supplied".to_string(),
            ));
        }

        // Negatives must predate this step's keys.
        let negatives = match &queue {
            Some(q) if self.engine.needs_queue() => Some(q.snapshot()),
            _ => None,
        };

        let q1 = pair.forward_online(view1.clone());
        let k2 = self.keys(pair, view2.clone())?;

        let (queries, keys) = if self.engine.symmetric() {
            let q2 = pair.forward_online(view2);
            let k1 = self.keys(pair, view1)?;
            (vec![q1, q2], vec![k2.clone(), k1])
        } else {
            (vec![q1], vec![k2.clone()])
        };

        let out = self.engine.compute_loss(queries, keys, negatives)?;

        if let Some(queue) = queue {
            if self.engine.needs_queue() {
                if self.gather_keys {
                    queue.enqueue_from_all(self.collective.as_ref(), k2)?;
                } else {
                    queue.enqueue(k2.detach())?;
                }
            }
        }

        let loss_value = tensor_to_f64(out.loss.clone());
        let metrics = StepMetrics::new(
            loss_value,
            &out.diagnostics,
            pair.momentum(self.step, self.total_steps),
        );
        let warnings = metrics.health_check();
        if !warnings.is_empty() {
            tracing::warn!(step = self.step, "Health check warnings: {:?}", warnings);
        }
        tracing::debug!(
            step = self.step,
            loss = loss_value,
            pos_cos = metrics.pos_cos,
            neg_cos = metrics.neg_cos,
            "Step computed"
        );

        Ok(StepOutput {
            loss: out.loss,
            metrics,
        })
    }

    /// Momentum hook: blend the online tower into the target after the
    /// optimizer step, then advance the step counter.
    pub fn momentum_update<B: Backend>(&mut self, pair: MomentumPair<B>) -> MomentumPair<B> {
        let pair = pair.update_momentum(self.step, self.total_steps);
        self.step += 1;
        pair
    }

    fn keys<B: AutodiffBackend>(
        &mut self,
        pair: &MomentumPair<B>,
        view: Tensor<B, 2>,
    ) -> Result<Tensor<B, 2>, MocoError> {
        match &mut self.shuffler {
            Some(shuffler) => {
                let (shard, perm) = shuffler.shuffle(self.collective.as_ref(), view)?;
                let keys = pair.forward_target(shard);
                shuffler.unshuffle(self.collective.as_ref(), keys, &perm)
            }
            None => Ok(pair.forward_target(view)),
        }
    }
}
