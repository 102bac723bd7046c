//! Collective primitives used by the queue gather and the batch shuffler.
//!
//! Every collective is a blocking barrier: all workers must call the same
//! operations in the same order. A worker that never arrives stalls the
//! others indefinitely; supervision belongs to whatever runs the workers.
//!
//! Implementations:
//! - [`SingleProcess`]: world size 1, identity gather/broadcast.
//! - [`LocalGroup`]: N workers inside one process (one per thread),
//!   exchanging host tensors through a shared slot guarded by a barrier.
//!
//! A multi-process backend (NCCL, MPI, TCP ring) implements [`Collective`]
//! with its own transport.

use std::sync::{Arc, Barrier, Mutex};

use burn::prelude::*;
use burn::tensor::TensorData;

use crate::error::{DistributedError, MocoError};

/// Synchronization provider for data-parallel workers.
pub trait Collective: Send + Sync {
    /// This worker's rank in `0..world_size()`.
    fn rank(&self) -> usize;

    fn world_size(&self) -> usize;

    /// Every worker's `local`, in rank order.
    fn all_gather(&self, local: TensorData) -> Result<Vec<TensorData>, DistributedError>;

    /// Every worker receives `root`'s `indices`; other workers' arguments are ignored.
    fn broadcast_indices(
        &self,
        root: usize,
        indices: Vec<usize>,
    ) -> Result<Vec<usize>, DistributedError>;
}

/// Single-worker default: gather returns the local contribution, broadcast is identity.
#[derive(Debug, Clone, Copy, Default)]
pub struct SingleProcess;

impl Collective for SingleProcess {
    fn rank(&self) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        1
    }

    fn all_gather(&self, local: TensorData) -> Result<Vec<TensorData>, DistributedError> {
        Ok(vec![local])
    }

    fn broadcast_indices(
        &self,
        root: usize,
        indices: Vec<usize>,
    ) -> Result<Vec<usize>, DistributedError> {
        if root != 0 {
            return Err(DistributedError::RankOutOfRange {
                rank: root,
                world_size: 1,
            });
        }
        Ok(indices)
    }
}

struct Exchange {
    barrier: Barrier,
    tensors: Mutex<Vec<Option<TensorData>>>,
    indices: Mutex<Option<Vec<usize>>>,
}

/// Factory for in-process worker handles.
pub struct LocalGroup;

impl LocalGroup {
    /// One handle per rank, all sharing one exchange. Move each handle to
    /// its own thread.
    pub fn new(world_size: usize) -> Vec<LocalWorker> {
        let world_size = world_size.max(1);
        let shared = Arc::new(Exchange {
            barrier: Barrier::new(world_size),
            tensors: Mutex::new(vec![None; world_size]),
            indices: Mutex::new(None),
        });
        (0..world_size)
            .map(|rank| LocalWorker {
                rank,
                world_size,
                shared: Arc::clone(&shared),
            })
            .collect()
    }
}

/// One rank of a [`LocalGroup`].
pub struct LocalWorker {
    rank: usize,
    world_size: usize,
    shared: Arc<Exchange>,
}

fn poisoned<T>(e: std::sync::PoisonError<T>) -> DistributedError {
    DistributedError::Poisoned(e.to_string())
}

impl Collective for LocalWorker {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn all_gather(&self, local: TensorData) -> Result<Vec<TensorData>, DistributedError> {
        let written = self
            .shared
            .tensors
            .lock()
            .map(|mut slots| slots[self.rank] = Some(local))
            .map_err(poisoned);
        self.shared.barrier.wait();

        let gathered = written.and_then(|_| {
            let slots = self.shared.tensors.lock().map_err(poisoned)?;
            slots
                .iter()
                .enumerate()
                .map(|(rank, slot)| slot.clone().ok_or(DistributedError::MissingContribution(rank)))
                .collect::<Result<Vec<_>, _>>()
        });
        // Nobody may overwrite a slot until every worker has read all of them.
        self.shared.barrier.wait();
        gathered
    }

    fn broadcast_indices(
        &self,
        root: usize,
        indices: Vec<usize>,
    ) -> Result<Vec<usize>, DistributedError> {
        if root >= self.world_size {
            return Err(DistributedError::RankOutOfRange {
                rank: root,
                world_size: self.world_size,
            });
        }
        let written = if self.rank == root {
            self.shared
                .indices
                .lock()
                .map(|mut slot| *slot = Some(indices))
                .map_err(poisoned)
        } else {
            Ok(())
        };
        self.shared.barrier.wait();

        let received = written.and_then(|_| {
            let slot = self.shared.indices.lock().map_err(poisoned)?;
            slot.clone().ok_or(DistributedError::MissingContribution(root))
        });
        self.shared.barrier.wait();
        received
    }
}

/// Concatenate every worker's `(rows, dim)` tensor along dim 0, in rank order.
pub fn gather_rows<B: Backend>(
    collective: &dyn Collective,
    local: Tensor<B, 2>,
) -> Result<Tensor<B, 2>, MocoError> {
    if collective.world_size() == 1 {
        return Ok(local);
    }
    let device = local.device();
    let [_, dim] = local.dims();
    let parts = collective.all_gather(local.into_data())?;

    let mut tensors = Vec::with_capacity(parts.len());
    for (rank, part) in parts.into_iter().enumerate() {
        if part.shape.len() != 2 || part.shape[1] != dim {
            return Err(DistributedError::ShapeMismatch(format!(
                "rank {rank} sent shape {:?}, expected (_, {dim})",
                part.shape
            ))
            .into());
        }
        tensors.push(Tensor::<B, 2>::from_data(part, &device));
    }
    Ok(Tensor::cat(tensors, 0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::ndarray::NdArray;
    use std::thread;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_single_process_identity() {
        let sp = SingleProcess;
        assert_eq!(sp.rank(), 0);
        assert_eq!(sp.world_size(), 1);
        let data = TensorData::from([[1.0_f32, 2.0]]);
        let gathered = sp.all_gather(data).unwrap();
        assert_eq!(gathered.len(), 1);
        assert_eq!(gathered[0].shape, vec![1, 2]);
        assert_eq!(gathered[0].to_vec::<f32>().unwrap(), vec![1.0, 2.0]);
        assert_eq!(sp.broadcast_indices(0, vec![2, 0, 1]).unwrap(), vec![2, 0, 1]);
        assert!(sp.broadcast_indices(1, vec![]).is_err());
    }

    #[test]
    fn test_local_group_gather_rank_order() {
        let workers = LocalGroup::new(3);
        let handles: Vec<_> = workers
            .into_iter()
            .map(|w| {
                thread::spawn(move || {
                    let device = Default::default();
                    let local = Tensor::<TestBackend, 2>::full([2, 2], w.rank() as f32, &device);
                    let all = gather_rows(&w, local).unwrap();
                    let v: Vec<f32> = all.into_data().to_vec().unwrap();
                    v
                })
            })
            .collect();

        let expected = vec![0.0, 0.0, 0.0, 0.0, 1.0, 1.0, 1.0, 1.0, 2.0, 2.0, 2.0, 2.0];
        for h in handles {
            assert_eq!(h.join().unwrap(), expected);
        }
    }

    #[test]
    fn test_local_group_broadcast_from_root() {
        let workers = LocalGroup::new(2);
        let handles: Vec<_> = workers
            .into_iter()
            .map(|w| {
                thread::spawn(move || {
                    let mine = if w.rank() == 1 { vec![3, 1, 2, 0] } else { vec![] };
                    w.broadcast_indices(1, mine).unwrap()
                })
            })
            .collect();
        for h in handles {
            assert_eq!(h.join().unwrap(), vec![3, 1, 2, 0]);
        }
    }

    #[test]
    fn test_repeated_collectives_do_not_mix_rounds() {
        let workers = LocalGroup::new(2);
        let handles: Vec<_> = workers
            .into_iter()
            .map(|w| {
                thread::spawn(move || {
                    let mut seen = Vec::new();
                    for round in 0..5 {
                        let data = TensorData::new(vec![(round * 10 + w.rank()) as f32], [1, 1]);
                        let all = w.all_gather(data).unwrap();
                        let vals: Vec<f32> = all
                            .into_iter()
                            .flat_map(|d| d.to_vec::<f32>().unwrap())
                            .collect();
                        seen.push(vals);
                    }
                    seen
                })
            })
            .collect();
        for h in handles {
            let seen = h.join().unwrap();
            for (round, vals) in seen.iter().enumerate() {
                let base = (round * 10) as f32;
                assert_eq!(vals, &vec![base, base + 1.0]);
            }
        }
    }

    #[test]
    fn test_broadcast_root_out_of_range() {
        let workers = LocalGroup::new(1);
        assert!(matches!(
            workers[0].broadcast_indices(4, vec![]),
            Err(DistributedError::RankOutOfRange { rank: 4, world_size: 1 })
        ));
    }
}
