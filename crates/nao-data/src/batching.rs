//! Batching, prefetching and pass repetition over language-pair datasets.

use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{bounded, Receiver};
use nao_types::{DataError, NaoResult};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::dataset::LanguagePairDataset;

/// A batch of sentence pairs, identified by their dataset indices.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub ids: Vec<usize>,
    pub src_tokens: Vec<Vec<u32>>,
    pub trg_tokens: Vec<Vec<u32>>,
    /// Number of target tokens (including EOS).
    pub ntokens: usize,
}

impl Batch {
    pub fn from_indices(dataset: &LanguagePairDataset, ids: &[usize]) -> Self {
        let src_tokens: Vec<Vec<u32>> = ids.iter().map(|&i| dataset.source(i).to_vec()).collect();
        let trg_tokens: Vec<Vec<u32>> = ids.iter().map(|&i| dataset.target(i).to_vec()).collect();
        let ntokens = trg_tokens.iter().map(Vec::len).sum();
        Self {
            ids: ids.to_vec(),
            src_tokens,
            trg_tokens,
            ntokens,
        }
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// How a split is cut into batches.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchingOptions {
    pub max_sentences: usize,
    pub max_tokens: Option<usize>,
    pub sort_by_length: bool,
    /// Shuffle the batch order with this seed.
    pub shuffle_seed: Option<u64>,
}

impl BatchingOptions {
    pub fn new(max_sentences: usize) -> Self {
        Self {
            max_sentences: max_sentences.max(1),
            max_tokens: None,
            sort_by_length: false,
            shuffle_seed: None,
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: Option<usize>) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn sorted(mut self, sort_by_length: bool) -> Self {
        self.sort_by_length = sort_by_length;
        self
    }

    pub fn shuffled(mut self, seed: u64) -> Self {
        self.shuffle_seed = Some(seed);
        self
    }
}

/// Group dataset indices into batches.
pub fn batch_indices(dataset: &LanguagePairDataset, options: &BatchingOptions) -> Vec<Vec<usize>> {
    let mut order: Vec<usize> = (0..dataset.len()).collect();
    if options.sort_by_length {
        order.sort_by_key(|&i| dataset.src_len(i));
    }

    let mut batches = Vec::new();
    let mut current: Vec<usize> = Vec::new();
    let mut longest = 0usize;
    for index in order {
        let tokens = dataset.num_tokens(index);
        let would_be = longest.max(tokens) * (current.len() + 1);
        let over_tokens = options.max_tokens.is_some_and(|max| would_be > max);
        if !current.is_empty() && (current.len() >= options.max_sentences || over_tokens) {
            batches.push(std::mem::take(&mut current));
            longest = 0;
        }
        longest = longest.max(tokens);
        current.push(index);
    }
    if !current.is_empty() {
        batches.push(current);
    }

    if let Some(seed) = options.shuffle_seed {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        batches.shuffle(&mut rng);
    }
    batches
}

/// One pass over a split.
#[derive(Debug, Clone)]
pub struct EpochBatchIterator {
    dataset: Arc<LanguagePairDataset>,
    plan: Vec<Vec<usize>>,
    cursor: usize,
}

impl EpochBatchIterator {
    pub fn new(dataset: Arc<LanguagePairDataset>, options: &BatchingOptions) -> Self {
        let plan = batch_indices(&dataset, options);
        Self {
            dataset,
            plan,
            cursor: 0,
        }
    }
}

impl Iterator for EpochBatchIterator {
    type Item = Batch;

    fn next(&mut self) -> Option<Batch> {
        let ids = self.plan.get(self.cursor)?;
        self.cursor += 1;
        Some(Batch::from_indices(&self.dataset, ids))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.plan.len() - self.cursor;
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for EpochBatchIterator {}

/// Builds batches on a worker thread ahead of consumption.
///
/// Items arrive in exactly the order the wrapped iterator yields them.
pub struct PrefetchIter<T> {
    rx: Option<Receiver<T>>,
    worker: Option<JoinHandle<()>>,
    remaining: usize,
}

impl<T: Send + 'static> PrefetchIter<T> {
    pub fn new<I>(iter: I, buffer: usize) -> Self
    where
        I: ExactSizeIterator<Item = T> + Send + 'static,
    {
        let remaining = iter.len();
        let (tx, rx) = bounded(buffer.max(1));
        let worker = std::thread::spawn(move || {
            for item in iter {
                if tx.send(item).is_err() {
                    // Consumer went away.
                    break;
                }
            }
        });
        Self {
            rx: Some(rx),
            worker: Some(worker),
            remaining,
        }
    }
}

impl<T> Iterator for PrefetchIter<T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        let item = self.rx.as_ref()?.recv().ok()?;
        self.remaining = self.remaining.saturating_sub(1);
        Some(item)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl<T> ExactSizeIterator for PrefetchIter<T> {}

impl<T> Drop for PrefetchIter<T> {
    fn drop(&mut self) {
        // Disconnect first so a blocked producer wakes up and exits.
        self.rx.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::warn!("Prefetch worker panicked");
            }
        }
    }
}

/// Passes chained by [`cover_with_repeats`].
pub type Covered<I> = std::iter::Take<std::iter::Flatten<std::vec::IntoIter<I>>>;

/// Chain freshly created passes until `count` items are available and yield
/// exactly `count` of them.
///
/// Every pass comes from a new call to `make_pass`; no pass is cached. With
/// `n` items per pass, `ceil(count / n)` passes are created.
pub fn cover_with_repeats<I, F>(mut make_pass: F, count: usize) -> NaoResult<Covered<I>>
where
    I: ExactSizeIterator,
    F: FnMut() -> I,
{
    let first = make_pass();
    let per_pass = first.len();
    if per_pass == 0 {
        return Err(DataError::EmptySplit {
            split: "evaluation".to_string(),
        }
        .into());
    }
    let passes = count.div_ceil(per_pass).max(1);
    let mut chain = Vec::with_capacity(passes);
    chain.push(first);
    for _ in 1..passes {
        chain.push(make_pass());
    }
    Ok(chain.into_iter().flatten().take(count))
}

#[cfg(test)]
mod tests {
    use super::*;
    use nao_types::Split;
    use std::collections::HashMap;

    fn dataset(n: usize) -> Arc<LanguagePairDataset> {
        let src: Vec<Vec<u32>> = (0..n).map(|i| vec![3; 1 + (i * 7) % 5]).collect();
        let trg: Vec<Vec<u32>> = (0..n).map(|i| vec![4; 1 + i % 3]).collect();
        Arc::new(LanguagePairDataset::new(Split::Dev, src, trg).unwrap())
    }

    #[test]
    fn batches_respect_max_sentences() {
        let data = dataset(10);
        let plan = batch_indices(&data, &BatchingOptions::new(4));
        assert_eq!(plan.len(), 3);
        assert_eq!(plan[2], vec![8, 9]);
    }

    #[test]
    fn batches_respect_max_tokens() {
        let data = dataset(10);
        let plan = batch_indices(&data, &BatchingOptions::new(100).with_max_tokens(Some(6)));
        for batch in &plan {
            let longest = batch.iter().map(|&i| data.num_tokens(i)).max().unwrap();
            assert!(batch.len() == 1 || longest * batch.len() <= 6);
        }
        let total: usize = plan.iter().map(Vec::len).sum();
        assert_eq!(total, 10);
    }

    #[test]
    fn sorted_batches_are_length_ordered() {
        let data = dataset(9);
        let plan = batch_indices(&data, &BatchingOptions::new(3).sorted(true));
        let lengths: Vec<usize> = plan.iter().flatten().map(|&i| data.src_len(i)).collect();
        assert!(lengths.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn shuffle_is_deterministic_per_seed() {
        let data = dataset(20);
        let a = batch_indices(&data, &BatchingOptions::new(2).shuffled(3));
        let b = batch_indices(&data, &BatchingOptions::new(2).shuffled(3));
        assert_eq!(a, b);
    }

    #[test]
    fn epoch_iterator_is_exact_size() {
        let data = dataset(5);
        let mut iter = EpochBatchIterator::new(data, &BatchingOptions::new(2));
        assert_eq!(iter.len(), 3);
        let first = iter.next().unwrap();
        assert_eq!(first.ids, vec![0, 1]);
        assert_eq!(first.ntokens, 1 + 2);
        assert_eq!(iter.len(), 2);
    }

    #[test]
    fn prefetch_preserves_order() {
        let data = dataset(50);
        let direct: Vec<Vec<usize>> = EpochBatchIterator::new(data.clone(), &BatchingOptions::new(3))
            .map(|b| b.ids)
            .collect();
        let prefetched = PrefetchIter::new(EpochBatchIterator::new(data, &BatchingOptions::new(3)), 2);
        assert_eq!(prefetched.len(), direct.len());
        let ids: Vec<Vec<usize>> = prefetched.map(|b| b.ids).collect();
        assert_eq!(ids, direct);
    }

    #[test]
    fn prefetch_can_be_dropped_early() {
        let mut iter = PrefetchIter::new(0..10_000usize, 1);
        assert_eq!(iter.next(), Some(0));
        drop(iter);
    }

    #[test]
    fn cover_yields_exactly_count_with_fresh_passes() {
        let data = dataset(10);
        let options = BatchingOptions::new(4); // 3 batches per pass
        let mut passes = 0;
        let covered: Vec<Batch> = cover_with_repeats(
            || {
                passes += 1;
                EpochBatchIterator::new(data.clone(), &options)
            },
            8,
        )
        .unwrap()
        .collect();

        assert_eq!(covered.len(), 8);
        assert_eq!(passes, 3);

        let mut uses: HashMap<Vec<usize>, usize> = HashMap::new();
        for batch in &covered {
            *uses.entry(batch.ids.clone()).or_default() += 1;
        }
        assert!(uses.values().all(|&n| n <= 3));
    }

    #[test]
    fn cover_single_pass_when_enough_batches() {
        let data = dataset(10);
        let mut passes = 0;
        let covered = cover_with_repeats(
            || {
                passes += 1;
                EpochBatchIterator::new(data.clone(), &BatchingOptions::new(1))
            },
            4,
        )
        .unwrap()
        .count();
        assert_eq!(covered, 4);
        assert_eq!(passes, 1);
    }

    #[test]
    fn cover_fails_on_empty_pass() {
        let empty = Arc::new(LanguagePairDataset::new(Split::Dev, vec![], vec![]).unwrap());
        let result = cover_with_repeats(
            || EpochBatchIterator::new(empty.clone(), &BatchingOptions::new(2)),
            3,
        );
        assert!(result.is_err());
    }
}
