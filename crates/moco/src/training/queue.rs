//! Fixed-capacity circular buffer of key embeddings used as negatives.
//!
//! Capacity `K` must be a multiple of the enqueue batch (the global batch
//! when keys are gathered across workers), so every write lands entirely
//! inside the buffer and wraparound never splits a batch. Entries leave only
//! by being overwritten `K` rows later.
//!
//! Call order within a step matters: take [`NegativeQueue::snapshot`] for
//! the loss *before* enqueueing that step's keys, otherwise a sample would
//! act as its own negative.

use burn::prelude::*;
use burn::tensor::{Distribution, TensorData};
use serde::{Deserialize, Serialize};

use crate::distributed::{gather_rows, Collective};
use crate::error::{ConfigError, MocoError, QueueError};
use crate::model::bridge::data_to_vec;
use crate::model::tower::l2_normalize;

/// Initial queue contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueInit {
    Zeros,
    /// Random unit vectors.
    #[default]
    Random,
}

/// Host-side snapshot of a queue, for checkpointing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueState {
    pub capacity: usize,
    pub dim: usize,
    pub enqueue_batch: usize,
    pub cursor: usize,
    pub total_enqueued: u64,
    /// Row-major `(capacity, dim)` contents.
    pub values: Vec<f32>,
}

#[derive(Debug, Clone)]
pub struct NegativeQueue<B: Backend> {
    buffer: Tensor<B, 2>,
    cursor: usize,
    enqueue_batch: usize,
    total_enqueued: u64,
}

impl<B: Backend> NegativeQueue<B> {
    /// Allocate a `(capacity, dim)` queue written `enqueue_batch` rows at a time.
    pub fn new(
        capacity: usize,
        dim: usize,
        enqueue_batch: usize,
        init: QueueInit,
        device: &B::Device,
    ) -> Result<Self, ConfigError> {
        if capacity == 0 {
            return Err(ConfigError::ZeroSized("queue_capacity"));
        }
        if dim == 0 {
            return Err(ConfigError::ZeroSized("embedding_dim"));
        }
        if enqueue_batch == 0 {
            return Err(ConfigError::ZeroSized("batch_size"));
        }
        if capacity % enqueue_batch != 0 {
            return Err(ConfigError::QueueNotDivisible {
                capacity,
                batch_size: enqueue_batch,
            });
        }

        let buffer = match init {
            QueueInit::Zeros => Tensor::zeros([capacity, dim], device),
            QueueInit::Random => l2_normalize(Tensor::random(
                [capacity, dim],
                Distribution::Normal(0.0, 1.0),
                device,
            )),
        };

        tracing::info!(capacity, dim, enqueue_batch, ?init, "Negative queue allocated");

        Ok(Self {
            buffer,
            cursor: 0,
            enqueue_batch,
            total_enqueued: 0,
        })
    }

    pub fn capacity(&self) -> usize {
        self.buffer.dims()[0]
    }

    pub fn dim(&self) -> usize {
        self.buffer.dims()[1]
    }

    /// Next row to be written.
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Rows written since allocation (or since the restored checkpoint's allocation).
    pub fn total_enqueued(&self) -> u64 {
        self.total_enqueued
    }

    /// Current contents in storage order, detached. Shape `(capacity, dim)`.
    pub fn snapshot(&self) -> Tensor<B, 2> {
        self.buffer.clone().detach()
    }

    /// Write `keys` at the cursor, overwriting the oldest rows.
    pub fn enqueue(&mut self, keys: Tensor<B, 2>) -> Result<(), QueueError> {
        let [batch, dim] = keys.dims();
        let capacity = self.capacity();
        if dim != self.dim() {
            return Err(QueueError::DimMismatch {
                expected: self.dim(),
                actual: dim,
            });
        }
        if batch == 0 {
            return Ok(());
        }
        if self.cursor + batch > capacity {
            return Err(QueueError::Overflow {
                batch,
                cursor: self.cursor,
                capacity,
            });
        }

        let start = self.cursor;
        self.buffer = self
            .buffer
            .clone()
            .slice_assign([start..start + batch, 0..dim], keys.detach());
        self.cursor = (start + batch) % capacity;
        self.total_enqueued += batch as u64;
        Ok(())
    }

    /// Gather every worker's keys in rank order, then enqueue them as one
    /// write so all replicas end the step identical.
    pub fn enqueue_from_all(
        &mut self,
        collective: &dyn Collective,
        keys: Tensor<B, 2>,
    ) -> Result<(), MocoError> {
        let gathered = gather_rows(collective, keys.detach())?;
        self.enqueue(gathered)?;
        Ok(())
    }

    /// The enqueue batch this queue was sized for.
    pub fn enqueue_batch(&self) -> usize {
        self.enqueue_batch
    }

    pub fn state(&self) -> Result<QueueState, MocoError> {
        Ok(QueueState {
            capacity: self.capacity(),
            dim: self.dim(),
            enqueue_batch: self.enqueue_batch,
            cursor: self.cursor,
            total_enqueued: self.total_enqueued,
            values: data_to_vec(self.buffer.clone().into_data())?,
        })
    }

    pub fn from_state(state: QueueState, device: &B::Device) -> Result<Self, QueueError> {
        let QueueState {
            capacity,
            dim,
            enqueue_batch,
            cursor,
            total_enqueued,
            values,
        } = state;
        if capacity == 0 || dim == 0 || enqueue_batch == 0 || capacity % enqueue_batch != 0 {
            return Err(QueueError::InvalidState(format!(
                "capacity {capacity}, dim {dim}, enqueue_batch {enqueue_batch}"
            )));
        }
        if cursor >= capacity || cursor % enqueue_batch != 0 {
            return Err(QueueError::InvalidState(format!(
                "cursor {cursor} not on the enqueue grid of capacity {capacity}"
            )));
        }
        if values.len() != capacity * dim {
            return Err(QueueError::InvalidState(format!(
                "{} values for a {capacity}x{dim} queue",
                values.len()
            )));
        }
        Ok(Self {
            buffer: Tensor::from_data(TensorData::new(values, [capacity, dim]), device),
            cursor,
            enqueue_batch,
            total_enqueued,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::bridge::{rows_to_tensor, tensor_to_rows};
    use burn::backend::ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    fn row(v: f32) -> Vec<f32> {
        vec![v, -v]
    }

    fn batch(vals: &[f32]) -> Tensor<TestBackend, 2> {
        let rows: Vec<Vec<f32>> = vals.iter().map(|&v| row(v)).collect();
        rows_to_tensor(&rows, &Default::default())
    }

    fn contents(q: &NegativeQueue<TestBackend>) -> Vec<f32> {
        tensor_to_rows(q.snapshot())
            .unwrap()
            .into_iter()
            .map(|r| r[0])
            .collect()
    }

    #[test]
    fn test_wraparound_evicts_oldest_pair() {
        // a..f = 1..6
        let mut q =
            NegativeQueue::<TestBackend>::new(4, 2, 2, QueueInit::Zeros, &Default::default()).unwrap();
        q.enqueue(batch(&[1.0, 2.0])).unwrap();
        q.enqueue(batch(&[3.0, 4.0])).unwrap();
        assert_eq!(q.cursor(), 0);
        q.enqueue(batch(&[5.0, 6.0])).unwrap();
        assert_eq!(contents(&q), vec![5.0, 6.0, 3.0, 4.0]);
        assert_eq!(q.cursor(), 2);
        assert_eq!(q.total_enqueued(), 6);
    }

    #[test]
    fn test_holds_most_recent_k_after_many_writes() {
        let mut q =
            NegativeQueue::<TestBackend>::new(6, 2, 2, QueueInit::Zeros, &Default::default()).unwrap();
        let mut written = Vec::new();
        for step in 0..7 {
            let vals = [step as f32 * 2.0 + 1.0, step as f32 * 2.0 + 2.0];
            written.extend_from_slice(&vals);
            q.enqueue(batch(&vals)).unwrap();
        }
        let mut got = contents(&q);
        let mut recent = written[written.len() - 6..].to_vec();
        got.sort_by(|a, b| a.partial_cmp(b).unwrap());
        recent.sort_by(|a, b| a.partial_cmp(b).unwrap());
        assert_eq!(got, recent);

        // Reading from the cursor yields write order.
        let raw = contents(&q);
        let c = q.cursor();
        let ordered: Vec<f32> = raw[c..].iter().chain(&raw[..c]).copied().collect();
        assert_eq!(ordered, written[written.len() - 6..].to_vec());
    }

    #[test]
    fn test_capacity_must_divide() {
        let err = NegativeQueue::<TestBackend>::new(5, 2, 2, QueueInit::Zeros, &Default::default());
        assert!(matches!(
            err,
            Err(ConfigError::QueueNotDivisible {
                capacity: 5,
                batch_size: 2
            })
        ));
    }

    #[test]
    fn test_overflow_is_an_error_not_truncation() {
        let mut q =
            NegativeQueue::<TestBackend>::new(4, 2, 2, QueueInit::Zeros, &Default::default()).unwrap();
        q.enqueue(batch(&[1.0, 2.0])).unwrap();
        let err = q.enqueue(batch(&[3.0, 4.0, 5.0]));
        assert!(matches!(err, Err(QueueError::Overflow { batch: 3, cursor: 2, capacity: 4 })));
        assert_eq!(contents(&q), vec![1.0, 2.0, 0.0, 0.0]);
    }

    #[test]
    fn test_dim_mismatch() {
        let mut q =
            NegativeQueue::<TestBackend>::new(4, 3, 2, QueueInit::Zeros, &Default::default()).unwrap();
        assert!(matches!(
            q.enqueue(batch(&[1.0, 2.0])),
            Err(QueueError::DimMismatch { expected: 3, actual: 2 })
        ));
    }

    #[test]
    fn test_random_init_is_unit_norm() {
        let q =
            NegativeQueue::<TestBackend>::new(8, 5, 4, QueueInit::Random, &Default::default()).unwrap();
        for r in tensor_to_rows(q.snapshot()).unwrap() {
            let n: f32 = r.iter().map(|v| v * v).sum::<f32>().sqrt();
            assert!((n - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn test_state_round_trip_preserves_cursor() {
        let device = Default::default();
        let mut q = NegativeQueue::<TestBackend>::new(4, 2, 2, QueueInit::Zeros, &device).unwrap();
        q.enqueue(batch(&[7.0, 8.0])).unwrap();
        let state = q.state().unwrap();
        let json = serde_json::to_string(&state).unwrap();
        let restored =
            NegativeQueue::<TestBackend>::from_state(serde_json::from_str(&json).unwrap(), &device)
                .unwrap();
        assert_eq!(restored.cursor(), 2);
        assert_eq!(contents(&restored), vec![7.0, 8.0, 0.0, 0.0]);
    }

    #[test]
    fn test_from_state_rejects_off_grid_cursor() {
        let state = QueueState {
            capacity: 4,
            dim: 1,
            enqueue_batch: 2,
            cursor: 1,
            total_enqueued: 1,
            values: vec![0.0; 4],
        };
        assert!(matches!(
            NegativeQueue::<TestBackend>::from_state(state, &Default::default()),
            Err(QueueError::InvalidState(_))
        ));
    }
}
