//! Shuffling batch normalization across workers.
//!
//! With per-worker batch statistics, a query and its key computed on the
//! same device share normalization statistics, which the network can exploit
//! as a pairing signal instead of learning content. Before the target
//! forward pass, the key views are redistributed across workers by a random
//! permutation of the global batch; afterwards the outputs travel back and
//! are reordered by the inverse.
//!
//! ```text
//! gather(local views) ─► global[N]           (rank order)
//! rank 0 draws perm, broadcast to all
//! shard_r = global[perm[r·b .. (r+1)·b]]     ─► target forward
//! gather(outputs) ─► shuffled[N]
//! local = shuffled[inverse[r·b .. (r+1)·b]]
//! ```

use burn::prelude::*;
use burn::tensor::{Int, TensorData};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::distributed::{gather_rows, Collective};
use crate::error::{DistributedError, MocoError};

/// Rank that draws the permutation.
const PERMUTATION_ROOT: usize = 0;

/// A bijection on `0..n` with its inverse. `forward[j]` is the original
/// index placed at position `j`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Permutation {
    forward: Vec<usize>,
    inverse: Vec<usize>,
}

impl Permutation {
    /// Validate `forward` as a bijection on `0..forward.len()`.
    pub fn new(forward: Vec<usize>) -> Result<Self, DistributedError> {
        let n = forward.len();
        let mut inverse = vec![usize::MAX; n];
        for (pos, &src) in forward.iter().enumerate() {
            if src >= n {
                return Err(DistributedError::InvalidPermutation(format!(
                    "index {src} out of range for length {n}"
                )));
            }
            if inverse[src] != usize::MAX {
                return Err(DistributedError::InvalidPermutation(format!(
                    "index {src} appears twice"
                )));
            }
            inverse[src] = pos;
        }
        Ok(Self { forward, inverse })
    }

    pub fn random(n: usize, rng: &mut impl rand::Rng) -> Self {
        let mut forward: Vec<usize> = (0..n).collect();
        forward.shuffle(rng);
        let mut inverse = vec![0; n];
        for (pos, &src) in forward.iter().enumerate() {
            inverse[src] = pos;
        }
        Self { forward, inverse }
    }

    pub fn len(&self) -> usize {
        self.forward.len()
    }

    pub fn is_empty(&self) -> bool {
        self.forward.is_empty()
    }

    pub fn forward(&self) -> &[usize] {
        &self.forward
    }

    pub fn inverse(&self) -> &[usize] {
        &self.inverse
    }
}

fn index_tensor<B: Backend>(indices: &[usize], device: &B::Device) -> Tensor<B, 1, Int> {
    let data: Vec<i64> = indices.iter().map(|&i| i as i64).collect();
    Tensor::from_data(TensorData::new(data, [indices.len()]), device)
}

/// Redistributes key views across workers and restores their order.
pub struct BatchShuffler {
    rng: StdRng,
}

impl BatchShuffler {
    /// Only the root rank's generator is ever consulted.
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Returns this worker's shard of the permuted global batch, plus the
    /// permutation every worker agreed on.
    pub fn shuffle<B: Backend>(
        &mut self,
        collective: &dyn Collective,
        batch: Tensor<B, 2>,
    ) -> Result<(Tensor<B, 2>, Permutation), MocoError> {
        let [local_batch, dim] = batch.dims();
        let world = collective.world_size();
        let rank = collective.rank();
        let device = batch.device();

        let global = gather_rows(collective, batch.detach())?;
        let n = global.dims()[0];
        if n != local_batch * world {
            return Err(DistributedError::ShapeMismatch(format!(
                "global batch {n} is not {world} × {local_batch}"
            ))
            .into());
        }

        let proposal = if rank == PERMUTATION_ROOT {
            Permutation::random(n, &mut self.rng).forward
        } else {
            Vec::new()
        };
        let perm = Permutation::new(collective.broadcast_indices(PERMUTATION_ROOT, proposal)?)?;
        if perm.len() != n {
            return Err(DistributedError::InvalidPermutation(format!(
                "received length {}, global batch is {n}",
                perm.len()
            ))
            .into());
        }

        let shard = &perm.forward[rank * local_batch..(rank + 1) * local_batch];
        let local = global.select(0, index_tensor::<B>(shard, &device));
        debug_assert_eq!(local.dims(), [local_batch, dim]);
        Ok((local, perm))
    }

    /// Bring outputs computed on shuffled shards back to their owners, in
    /// original order.
    pub fn unshuffle<B: Backend>(
        &self,
        collective: &dyn Collective,
        result: Tensor<B, 2>,
        perm: &Permutation,
    ) -> Result<Tensor<B, 2>, MocoError> {
        let [local_batch, _] = result.dims();
        let world = collective.world_size();
        let rank = collective.rank();
        let device = result.device();

        let shuffled = gather_rows(collective, result)?;
        let n = shuffled.dims()[0];
        if n != perm.len() || n != local_batch * world {
            return Err(DistributedError::ShapeMismatch(format!(
                "gathered {n} rows, permutation covers {}",
                perm.len()
            ))
            .into());
        }

        let mine = &perm.inverse[rank * local_batch..(rank + 1) * local_batch];
        Ok(shuffled.select(0, index_tensor::<B>(mine, &device)))
    }
}
