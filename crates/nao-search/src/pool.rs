//! The architecture pool of one search step.

use nao_types::{NaoResult, NetCode, SearchError};
use rand::distributions::{Distribution, WeightedIndex};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// One ranked pool entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchRecord {
    pub net_code: NetCode,
    /// `1 - quality`, lower is better.
    pub error_rate: f64,
}

/// Candidate architectures plus their sampling distribution and, once
/// evaluated, their error rates.
#[derive(Debug, Clone, Default)]
pub struct ArchPool {
    arches: Vec<NetCode>,
    probabilities: Option<Vec<f64>>,
    performances: Option<Vec<f64>>,
}

impl ArchPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.arches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arches.is_empty()
    }

    pub fn arches(&self) -> &[NetCode] {
        &self.arches
    }

    pub fn probabilities(&self) -> Option<&[f64]> {
        self.probabilities.as_deref()
    }

    /// Error rates in pool order, present after [`ArchPool::rank_and_store`].
    pub fn performances(&self) -> Option<&[f64]> {
        self.performances.as_deref()
    }

    /// Fill an empty pool with `count` architectures from `generate`.
    ///
    /// Returns whether the pool was seeded; a non-empty pool is left alone.
    pub fn seed<F>(&mut self, count: usize, generate: F) -> NaoResult<bool>
    where
        F: FnOnce(usize) -> NaoResult<Vec<NetCode>>,
    {
        if !self.arches.is_empty() {
            debug!("Arch pool already holds {} arches, not seeding", self.arches.len());
            return Ok(false);
        }
        self.arches = generate(count)?;
        self.probabilities = None;
        self.performances = None;
        info!("Seeded arch pool with {} arches", self.arches.len());
        Ok(true)
    }

    /// Replace the whole pool. Sampling becomes uniform again.
    pub fn replace(&mut self, arches: Vec<NetCode>) {
        self.arches = arches;
        self.probabilities = None;
        self.performances = None;
    }

    /// Categorical sampling vector, or `None` for uniform sampling.
    pub fn set_probabilities(&mut self, probabilities: Option<Vec<f64>>) -> NaoResult<()> {
        if let Some(probs) = &probabilities {
            if probs.len() != self.arches.len() {
                return Err(SearchError::InvalidProbabilities {
                    message: format!("{} probabilities for {} arches", probs.len(), self.arches.len()),
                }
                .into());
            }
            if probs.iter().any(|p| !p.is_finite() || *p < 0.0) {
                return Err(SearchError::InvalidProbabilities {
                    message: "probabilities must be finite and non-negative".to_string(),
                }
                .into());
            }
            let total: f64 = probs.iter().sum();
            if (total - 1.0).abs() > 1e-6 {
                return Err(SearchError::InvalidProbabilities {
                    message: format!("probabilities sum to {}", total),
                }
                .into());
            }
        }
        self.probabilities = probabilities;
        Ok(())
    }

    /// Draw one architecture. Model size is not taken into account.
    pub fn sample_one<R: Rng + ?Sized>(&self, rng: &mut R) -> NaoResult<&NetCode> {
        if self.arches.is_empty() {
            return Err(SearchError::EmptyPool.into());
        }
        let index = match &self.probabilities {
            None => rng.gen_range(0..self.arches.len()),
            Some(probs) => WeightedIndex::new(probs)
                .map_err(|e| SearchError::InvalidProbabilities { message: e.to_string() })?
                .sample(rng),
        };
        debug!("Sampled arch {} of {}", index, self.arches.len());
        Ok(&self.arches[index])
    }

    /// Sort the pool by ascending error rate and keep the rates alongside.
    ///
    /// Architectures, error rates and any sampling vector are reordered by the
    /// same permutation. Ties keep their pool order.
    pub fn rank_and_store(&mut self, performances: Vec<f64>) -> NaoResult<Vec<ArchRecord>> {
        if performances.len() != self.arches.len() {
            return Err(SearchError::PerformanceLength {
                expected: self.arches.len(),
                actual: performances.len(),
            }
            .into());
        }
        let mut order: Vec<usize> = (0..performances.len()).collect();
        order.sort_by(|&a, &b| performances[a].total_cmp(&performances[b]));

        self.arches = order.iter().map(|&i| self.arches[i].clone()).collect();
        if let Some(probs) = &self.probabilities {
            self.probabilities = Some(order.iter().map(|&i| probs[i]).collect());
        }
        let sorted: Vec<f64> = order.iter().map(|&i| performances[i]).collect();
        self.performances = Some(sorted);
        Ok(self.records())
    }

    /// `(arch, error rate)` pairs in pool order; empty before ranking.
    pub fn records(&self) -> Vec<ArchRecord> {
        match &self.performances {
            Some(perfs) => self
                .arches
                .iter()
                .zip(perfs)
                .map(|(net_code, &error_rate)| ArchRecord {
                    net_code: net_code.clone(),
                    error_rate,
                })
                .collect(),
            None => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nao_types::{NaoError, SearchSpace};
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn arches(n: usize) -> Vec<NetCode> {
        let space = SearchSpace::normal();
        let mut rng = ChaCha8Rng::seed_from_u64(5);
        (0..n).map(|_| space.sample_net_code(&mut rng, 1, 1)).collect()
    }

    #[test]
    fn seed_is_idempotent() {
        let mut pool = ArchPool::new();
        assert!(pool.seed(4, |n| Ok(arches(n))).unwrap());
        let first = pool.arches().to_vec();
        assert!(!pool.seed(4, |_| panic!("must not regenerate")).unwrap());
        assert_eq!(pool.arches(), first.as_slice());
    }

    #[test]
    fn sampling_empty_pool_fails() {
        let pool = ArchPool::new();
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        assert!(matches!(
            pool.sample_one(&mut rng),
            Err(NaoError::Search(SearchError::EmptyPool))
        ));
    }

    #[test]
    fn weighted_sampling_follows_probabilities() {
        let mut pool = ArchPool::new();
        pool.replace(arches(3));
        pool.set_probabilities(Some(vec![0.0, 1.0, 0.0])).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(9);
        for _ in 0..20 {
            assert_eq!(pool.sample_one(&mut rng).unwrap(), &pool.arches()[1]);
        }
    }

    #[test]
    fn rejects_bad_probabilities() {
        let mut pool = ArchPool::new();
        pool.replace(arches(2));
        assert!(pool.set_probabilities(Some(vec![1.0])).is_err());
        assert!(pool.set_probabilities(Some(vec![0.7, 0.7])).is_err());
        assert!(pool.set_probabilities(Some(vec![-0.5, 1.5])).is_err());
        assert!(pool.set_probabilities(None).is_ok());
    }

    #[test]
    fn rank_sorts_arches_and_rates_together() {
        let original = arches(5);
        let mut pool = ArchPool::new();
        pool.replace(original.clone());
        let perfs = vec![0.4, 0.1, 0.9, 0.1, 0.3];

        let records = pool.rank_and_store(perfs.clone()).unwrap();
        let rates: Vec<f64> = records.iter().map(|r| r.error_rate).collect();
        assert_eq!(rates, vec![0.1, 0.1, 0.3, 0.4, 0.9]);
        for record in &records {
            let index = original.iter().position(|a| a == &record.net_code).unwrap();
            assert_eq!(perfs[index], record.error_rate);
        }
        // Stable for ties.
        assert_eq!(records[0].net_code, original[1]);
        assert_eq!(records[1].net_code, original[3]);
        assert_eq!(pool.performances().unwrap(), rates.as_slice());
    }

    #[test]
    fn rank_reorders_probabilities() {
        let mut pool = ArchPool::new();
        pool.replace(arches(3));
        pool.set_probabilities(Some(vec![0.2, 0.3, 0.5])).unwrap();
        pool.rank_and_store(vec![0.9, 0.5, 0.1]).unwrap();
        assert_eq!(pool.probabilities().unwrap(), &[0.5, 0.3, 0.2]);
    }

    #[test]
    fn rank_rejects_length_mismatch() {
        let mut pool = ArchPool::new();
        pool.replace(arches(3));
        assert!(matches!(
            pool.rank_and_store(vec![0.1]),
            Err(NaoError::Search(SearchError::PerformanceLength { expected: 3, actual: 1 }))
        ));
        assert!(pool.records().is_empty());
    }
}
