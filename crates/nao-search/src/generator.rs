//! Greedy translation of evaluation batches and their BLEU score.

use nao_data::{Batch, Dictionary, Tokenizer};
use nao_model::{readout, BleuStats, SharedWeights, TranslationModel};
use nao_types::{DataError, NaoResult, EOS_ID, PAD_ID};
use rayon::prelude::*;

/// Maximum output length `a * src_len + b`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MaxLen {
    pub a: f64,
    pub b: usize,
}

impl MaxLen {
    pub fn for_source(&self, src_len: usize) -> usize {
        (self.a * src_len as f64).max(0.0) as usize + self.b
    }
}

/// One decoded sentence.
#[derive(Debug, Clone, PartialEq)]
pub struct Hypothesis {
    /// Sample id in the evaluated split.
    pub id: usize,
    /// Output tokens without the final EOS.
    pub tokens: Vec<u32>,
}

#[derive(Debug, Clone)]
pub struct SequenceGenerator {
    maxlen: MaxLen,
}

impl SequenceGenerator {
    pub fn new(maxlen: MaxLen) -> Self {
        Self { maxlen }
    }

    pub fn maxlen(&self) -> MaxLen {
        self.maxlen
    }

    /// Decode one source sentence, taking the most likely token at every step.
    pub fn generate(&self, model: &dyn TranslationModel, weights: &SharedWeights, src: &[u32]) -> NaoResult<Vec<u32>> {
        let max_len = self.maxlen.for_source(src.len());
        let mut prev_output = vec![EOS_ID];
        let mut tokens = Vec::new();
        while tokens.len() < max_len {
            let states = model.decoder_states(weights, src, &prev_output, None)?;
            let logits = readout(weights, &states);
            let last = logits.row(logits.nrows() - 1);
            let next = last
                .iter()
                .enumerate()
                .filter(|&(token, _)| token as u32 != PAD_ID)
                .max_by(|a, b| a.1.total_cmp(b.1))
                .map(|(token, _)| token as u32)
                .unwrap_or(EOS_ID);
            if next == EOS_ID {
                break;
            }
            tokens.push(next);
            prev_output.push(next);
        }
        Ok(tokens)
    }

    /// Decode every sentence of `batch`, in batch order.
    pub fn generate_batch(&self, model: &dyn TranslationModel, batch: &Batch) -> NaoResult<Vec<Hypothesis>> {
        let guard = model.shared().read();
        let weights: &SharedWeights = &guard;
        batch
            .ids
            .par_iter()
            .zip(batch.src_tokens.par_iter())
            .map(|(&id, src)| -> NaoResult<Hypothesis> {
                Ok(Hypothesis {
                    id,
                    tokens: self.generate(model, weights, src)?,
                })
            })
            .collect()
    }
}

/// Tokenized held-out references, indexed by sample id.
#[derive(Debug, Clone)]
pub struct References {
    dict: Dictionary,
    tokens: Vec<Vec<u32>>,
    bpe_symbol: Option<String>,
}

impl References {
    /// Tokenize raw reference lines with a copy of the target dictionary that
    /// grows to cover unseen words.
    pub fn new(target_dict: &Dictionary, lines: &[String], bpe_symbol: Option<&str>) -> Self {
        let mut dict = target_dict.clone();
        let tokens = lines
            .iter()
            .map(|line| Tokenizer::tokenize_adding(line, &mut dict))
            .collect();
        Self {
            dict,
            tokens,
            bpe_symbol: bpe_symbol.map(str::to_string),
        }
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn dict(&self) -> &Dictionary {
        &self.dict
    }

    /// Reference of sample `id` without EOS and padding.
    pub fn reference(&self, id: usize) -> NaoResult<Vec<u32>> {
        let tokens = self.tokens.get(id).ok_or_else(|| DataError::MissingReferences {
            message: format!("no reference for sample {} ({} available)", id, self.tokens.len()),
        })?;
        Ok(strip_special(tokens))
    }

    /// Map hypothesis ids of `target_dict` into the reference vocabulary.
    pub fn retokenize(&self, target_dict: &Dictionary, hypothesis: &[u32]) -> Vec<u32> {
        let text = Tokenizer::remove_bpe(&target_dict.string(hypothesis), self.bpe_symbol.as_deref());
        strip_special(&Tokenizer::tokenize(&text, &self.dict))
    }

    /// Corpus BLEU of one batch of hypotheses.
    pub fn batch_bleu(&self, target_dict: &Dictionary, hypotheses: &[Hypothesis]) -> NaoResult<f64> {
        let mut stats = BleuStats::default();
        for hypothesis in hypotheses {
            let reference = self.reference(hypothesis.id)?;
            let tokens = self.retokenize(target_dict, &hypothesis.tokens);
            stats = stats.merge(BleuStats::sentence(&tokens, &reference));
        }
        Ok(stats.score())
    }
}

fn strip_special(tokens: &[u32]) -> Vec<u32> {
    tokens
        .iter()
        .copied()
        .filter(|&t| t != EOS_ID && t != PAD_ID)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use nao_model::{ModelDims, SharedModel};
    use nao_types::SearchSpace;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn model() -> SharedModel {
        let dims = ModelDims {
            src_vocab: 10,
            trg_vocab: 10,
            hidden_size: 8,
            num_enc_layers: 1,
            num_dec_layers: 1,
        };
        let weights = SharedWeights::new(dims, &SearchSpace::normal(), &mut ChaCha8Rng::seed_from_u64(4));
        SharedModel::new(weights.into_handle())
    }

    #[test]
    fn maxlen_bounds_output() {
        let model = model();
        let generator = SequenceGenerator::new(MaxLen { a: 0.0, b: 3 });
        let batch = Batch {
            ids: vec![0, 1],
            src_tokens: vec![vec![3, 4, 1], vec![5, 1]],
            trg_tokens: vec![vec![3, 1], vec![4, 1]],
            ntokens: 4,
        };
        let hypotheses = generator.generate_batch(&model, &batch).unwrap();
        assert_eq!(hypotheses.iter().map(|h| h.id).collect::<Vec<_>>(), vec![0, 1]);
        for hypothesis in &hypotheses {
            assert!(hypothesis.tokens.len() <= 3);
            assert!(hypothesis.tokens.iter().all(|&t| t != EOS_ID && t != PAD_ID));
        }
    }

    #[test]
    fn zero_maxlen_yields_empty_output() {
        let model = model();
        let generator = SequenceGenerator::new(MaxLen { a: 0.0, b: 0 });
        let weights = model.shared().read();
        assert!(generator.generate(&model, &weights, &[3, 1]).unwrap().is_empty());
        assert_eq!(MaxLen { a: 1.5, b: 2 }.for_source(4), 8);
    }

    #[test]
    fn references_extend_a_copy_of_the_dictionary() {
        let target = Dictionary::from_symbols(["hello", "world"]);
        let refs = References::new(&target, &["hello there world".to_string()], None);
        assert_eq!(target.len(), 5);
        assert_eq!(refs.dict().len(), 6);
        assert_eq!(refs.len(), 1);
        assert_eq!(refs.reference(0).unwrap().len(), 3);
        assert!(refs.reference(1).is_err());
    }

    #[test]
    fn perfect_hypothesis_scores_100() {
        let target = Dictionary::from_symbols(["a", "b", "c", "d", "e"]);
        let refs = References::new(&target, &["a b c d e".to_string()], None);
        let hypothesis = Hypothesis {
            id: 0,
            tokens: Tokenizer::tokenize("a b c d e", &target),
        };
        let bleu = refs.batch_bleu(&target, &[hypothesis]).unwrap();
        assert!((bleu - 100.0).abs() < 1e-9);
    }

    #[test]
    fn bpe_is_removed_before_scoring() {
        let target = Dictionary::from_symbols(["hel@@", "lo", "there"]);
        let refs = References::new(&target, &["hello there".to_string()], Some("@@ "));
        let hypothesis = Tokenizer::tokenize("hel@@ lo there", &target);
        let retokenized = refs.retokenize(&target, &hypothesis);
        assert_eq!(retokenized, refs.reference(0).unwrap());
    }
}
