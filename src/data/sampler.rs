//! Rank-sharded sampling

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

/// Splits a dataset into disjoint per-rank shards.
///
/// The index list is shuffled with `seed + epoch`, padded by wrapping
/// around to a multiple of the world size, and rank `r` takes every
/// `world`-th index starting at `r`.
#[derive(Debug, Clone, PartialEq)]
pub struct DistributedSampler {
    dataset_len: usize,
    num_replicas: usize,
    rank: usize,
    shuffle: bool,
    seed: u64,
    epoch: usize,
}

impl DistributedSampler {
    pub fn new(dataset_len: usize, num_replicas: usize, rank: usize, shuffle: bool, seed: u64) -> Self {
        let num_replicas = num_replicas.max(1);
        Self {
            dataset_len,
            num_replicas,
            rank: rank.min(num_replicas - 1),
            shuffle,
            seed,
            epoch: 0,
        }
    }

    pub fn set_epoch(&mut self, epoch: usize) {
        self.epoch = epoch;
    }

    pub fn epoch(&self) -> usize {
        self.epoch
    }

    /// Indices per rank, `ceil(len / world)`
    pub fn num_samples(&self) -> usize {
        self.dataset_len.div_ceil(self.num_replicas)
    }

    pub fn indices(&self) -> Vec<usize> {
        if self.dataset_len == 0 {
            return Vec::new();
        }
        let mut order: Vec<usize> = (0..self.dataset_len).collect();
        if self.shuffle {
            let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(self.epoch as u64));
            order.shuffle(&mut rng);
        }
        let total = self.num_samples() * self.num_replicas;
        let mut i = 0;
        while order.len() < total {
            order.push(order[i]);
            i += 1;
        }
        order
            .into_iter()
            .skip(self.rank)
            .step_by(self.num_replicas)
            .collect()
    }
}
