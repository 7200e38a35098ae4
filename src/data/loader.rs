//! Prefetching batch loader

use super::{collate, Batch, Dataset, DistributedSampler};
use crate::error::{Error, Result};
use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;
use std::thread;

/// Batches a [`Dataset`] through a [`DistributedSampler`].
///
/// With `num_workers > 0` each worker thread builds whole batches into its
/// own bounded channel; batches are read round-robin so they arrive in
/// sampler order regardless of which worker finishes first.
pub struct DataLoader {
    dataset: Arc<dyn Dataset>,
    sampler: DistributedSampler,
    batch_size: usize,
    drop_last: bool,
    num_workers: usize,
    prefetch_factor: usize,
}

impl DataLoader {
    pub fn new(
        dataset: Arc<dyn Dataset>,
        sampler: DistributedSampler,
        batch_size: usize,
        drop_last: bool,
        num_workers: usize,
    ) -> Self {
        Self {
            dataset,
            sampler,
            batch_size: batch_size.max(1),
            drop_last,
            num_workers,
            prefetch_factor: 2,
        }
    }

    pub fn with_prefetch_factor(mut self, prefetch_factor: usize) -> Self {
        self.prefetch_factor = prefetch_factor.max(1);
        self
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Batches per epoch on this rank
    pub fn len(&self) -> usize {
        let n = self.sampler.num_samples();
        if self.drop_last {
            n / self.batch_size
        } else {
            n.div_ceil(self.batch_size)
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn set_epoch(&mut self, epoch: usize) {
        self.sampler.set_epoch(epoch);
    }

    fn batch_indices(&self) -> Vec<Vec<usize>> {
        let mut chunks: Vec<Vec<usize>> = self
            .sampler
            .indices()
            .chunks(self.batch_size)
            .map(<[usize]>::to_vec)
            .collect();
        if self.drop_last && chunks.last().is_some_and(|c| c.len() < self.batch_size) {
            chunks.pop();
        }
        chunks
    }

    /// Iterate over the current epoch's batches
    pub fn iter(&self) -> Batches {
        let epoch = self.sampler.epoch();
        let chunks = self.batch_indices();
        if self.num_workers == 0 {
            return Batches::Inline {
                dataset: Arc::clone(&self.dataset),
                chunks: chunks.into_iter(),
                epoch,
            };
        }

        let workers = self.num_workers.min(chunks.len()).max(1);
        let chunks = Arc::new(chunks);
        let mut receivers = Vec::with_capacity(workers);
        let mut handles = Vec::with_capacity(workers);
        for w in 0..workers {
            let (tx, rx) = mpsc::sync_channel(self.prefetch_factor);
            let dataset = Arc::clone(&self.dataset);
            let chunks = Arc::clone(&chunks);
            handles.push(thread::spawn(move || {
                for chunk in chunks.iter().skip(w).step_by(workers) {
                    if tx.send(load(dataset.as_ref(), chunk, epoch)).is_err() {
                        return;
                    }
                }
            }));
            receivers.push(rx);
        }
        Batches::Prefetch {
            receivers,
            handles,
            next: 0,
            remaining: chunks.len(),
        }
    }
}

fn load(dataset: &dyn Dataset, indices: &[usize], epoch: usize) -> Result<Batch> {
    let samples = indices
        .iter()
        .map(|&i| dataset.get(i, epoch))
        .collect::<Result<Vec<_>>>()?;
    collate(samples)
}

/// Iterator returned by [`DataLoader::iter`]
pub enum Batches {
    Inline {
        dataset: Arc<dyn Dataset>,
        chunks: std::vec::IntoIter<Vec<usize>>,
        epoch: usize,
    },
    Prefetch {
        receivers: Vec<Receiver<Result<Batch>>>,
        handles: Vec<thread::JoinHandle<()>>,
        next: usize,
        remaining: usize,
    },
}

impl Iterator for Batches {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        match self {
            Batches::Inline {
                dataset,
                chunks,
                epoch,
            } => chunks.next().map(|c| load(dataset.as_ref(), &c, *epoch)),
            Batches::Prefetch {
                receivers,
                next,
                remaining,
                ..
            } => {
                if *remaining == 0 {
                    return None;
                }
                let worker = *next % receivers.len();
                let batch = *next;
                *next += 1;
                *remaining -= 1;
                Some(receivers[worker].recv().unwrap_or_else(|_| {
                    Err(Error::Data(format!(
                        "loader worker {worker} exited before producing batch {batch}"
                    )))
                }))
            }
        }
    }
}

impl Drop for Batches {
    fn drop(&mut self) {
        if let Batches::Prefetch {
            receivers, handles, ..
        } = self
        {
            // unblock workers waiting on a full channel before joining them
            receivers.clear();
            for handle in handles.drain(..) {
                let _ = handle.join();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Sample;
    use ndarray::{Array2, Array4};

    struct Counting(usize);

    impl Dataset for Counting {
        fn len(&self) -> usize {
            self.0
        }

        fn get(&self, index: usize, epoch: usize) -> Result<Sample> {
            Ok(Sample {
                views: vec![Array4::from_elem((1, 1, 1, 1), (index + 100 * epoch) as f32)],
                masks: vec![Array2::from_elem((1, 1), false)],
                flow: None,
                index,
            })
        }
    }

    fn loader(workers: usize, drop_last: bool) -> DataLoader {
        DataLoader::new(
            Arc::new(Counting(10)),
            DistributedSampler::new(10, 1, 0, false, 0),
            4,
            drop_last,
            workers,
        )
    }

    #[test]
    fn test_len_with_and_without_drop_last() {
        assert_eq!(loader(0, true).len(), 2);
        assert_eq!(loader(0, false).len(), 3);
    }

    #[test]
    fn test_prefetch_preserves_sampler_order() {
        for workers in [0, 1, 3] {
            let mut l = loader(workers, false);
            l.set_epoch(2);
            let indices: Vec<usize> = l
                .iter()
                .map(|b| b.unwrap())
                .flat_map(|b| b.indices)
                .collect();
            assert_eq!(indices, (0..10).collect::<Vec<_>>());
        }
    }

    #[test]
    fn test_epoch_reaches_dataset() {
        let mut l = loader(2, true);
        l.set_epoch(3);
        let first = l.iter().next().unwrap().unwrap();
        assert_eq!(first.views[0][[0, 0, 0, 0, 0]], 300.0);
    }

    struct Exploding;

    impl Dataset for Exploding {
        fn len(&self) -> usize {
            4
        }

        fn get(&self, index: usize, _epoch: usize) -> Result<Sample> {
            panic!("corrupt clip {index}");
        }
    }

    #[test]
    fn test_dead_worker_is_an_error() {
        let l = DataLoader::new(
            Arc::new(Exploding),
            DistributedSampler::new(4, 1, 0, false, 0),
            2,
            true,
            1,
        );
        let batches: Vec<Result<Batch>> = l.iter().collect();
        assert_eq!(batches.len(), 2);
        assert!(matches!(batches[0], Err(Error::Data(_))));
    }

    #[test]
    fn test_early_drop_does_not_hang() {
        let l = DataLoader::new(
            Arc::new(Counting(64)),
            DistributedSampler::new(64, 1, 0, false, 0),
            1,
            false,
            2,
        )
        .with_prefetch_factor(1);
        let mut it = l.iter();
        assert!(it.next().is_some());
        drop(it);
    }
}
