//! Corpus-level BLEU over token ids.

use std::collections::HashMap;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

pub const BLEU_ORDER: usize = 4;

/// Sufficient statistics of one or more sentence pairs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BleuStats {
    pub matches: [usize; BLEU_ORDER],
    pub totals: [usize; BLEU_ORDER],
    pub hyp_len: usize,
    pub ref_len: usize,
}

impl BleuStats {
    pub fn sentence(hypothesis: &[u32], reference: &[u32]) -> Self {
        let mut stats = Self {
            hyp_len: hypothesis.len(),
            ref_len: reference.len(),
            ..Self::default()
        };
        for n in 1..=BLEU_ORDER {
            let ref_counts = ngram_counts(reference, n);
            let hyp_counts = ngram_counts(hypothesis, n);
            stats.totals[n - 1] = hypothesis.len().saturating_sub(n - 1);
            stats.matches[n - 1] = hyp_counts
                .iter()
                .map(|(gram, &count)| count.min(ref_counts.get(gram).copied().unwrap_or(0)))
                .sum();
        }
        stats
    }

    pub fn merge(mut self, other: BleuStats) -> Self {
        for n in 0..BLEU_ORDER {
            self.matches[n] += other.matches[n];
            self.totals[n] += other.totals[n];
        }
        self.hyp_len += other.hyp_len;
        self.ref_len += other.ref_len;
        self
    }

    /// BLEU-4 with brevity penalty, in `[0, 100]`.
    pub fn score(&self) -> f64 {
        if self.hyp_len == 0 || self.matches.iter().any(|&m| m == 0) {
            return 0.0;
        }
        let log_precision: f64 = self
            .matches
            .iter()
            .zip(&self.totals)
            .map(|(&m, &t)| (m as f64 / t as f64).ln())
            .sum::<f64>()
            / BLEU_ORDER as f64;
        let brevity = if self.hyp_len >= self.ref_len {
            1.0
        } else {
            (1.0 - self.ref_len as f64 / self.hyp_len as f64).exp()
        };
        (100.0 * brevity * log_precision.exp()).clamp(0.0, 100.0)
    }
}

fn ngram_counts(tokens: &[u32], n: usize) -> HashMap<&[u32], usize> {
    let mut counts = HashMap::new();
    if tokens.len() >= n {
        for gram in tokens.windows(n) {
            *counts.entry(gram).or_insert(0) += 1;
        }
    }
    counts
}

/// Corpus BLEU of `(hypothesis, reference)` pairs.
pub fn corpus_bleu(pairs: &[(Vec<u32>, Vec<u32>)]) -> f64 {
    pairs
        .par_iter()
        .map(|(hyp, reference)| BleuStats::sentence(hyp, reference))
        .reduce(BleuStats::default, BleuStats::merge)
        .score()
}
