//! Training criteria and their registry.

use std::collections::BTreeMap;
use std::f64::consts::LN_2;

use nao_types::{config_error, HParams, NaoResult, PAD_ID};
use ndarray::{Array2, ArrayView2};
use serde::{Deserialize, Serialize};

/// Per-sentence statistics summed across a batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LoggingOutput {
    /// Summed loss in nats.
    pub loss: f64,
    pub nll_loss: f64,
    pub ntokens: usize,
    pub nsentences: usize,
    pub sample_size: usize,
}

impl LoggingOutput {
    pub fn merge(&mut self, other: &LoggingOutput) {
        self.loss += other.loss;
        self.nll_loss += other.nll_loss;
        self.ntokens += other.ntokens;
        self.nsentences += other.nsentences;
        self.sample_size += other.sample_size;
    }
}

/// Losses in base 2, normalized by sample size and token count.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregatedLoss {
    pub loss: f64,
    pub nll_loss: f64,
    pub ntokens: usize,
    pub nsentences: usize,
    pub sample_size: usize,
}

#[derive(Debug, Clone)]
pub struct CriterionOutput {
    pub logging: LoggingOutput,
    /// d(loss)/d(logits), present when requested.
    pub grad_logits: Option<Array2<f64>>,
}

pub trait Criterion: Send + Sync {
    fn name(&self) -> &'static str;

    /// Score the logits of one sentence against its target tokens.
    fn forward(&self, logits: ArrayView2<'_, f64>, target: &[u32], need_grad: bool) -> CriterionOutput;

    fn aggregate_logging_outputs(&self, outputs: &[LoggingOutput]) -> AggregatedLoss;
}

/// Cross entropy against a target distribution that spreads `eps` over the vocabulary.
#[derive(Debug, Clone)]
pub struct LabelSmoothedCrossEntropy {
    eps: f64,
    sentence_avg: bool,
}

impl LabelSmoothedCrossEntropy {
    pub fn new(eps: f64, sentence_avg: bool) -> Self {
        Self { eps, sentence_avg }
    }

    pub fn from_hparams(hparams: &HParams) -> Self {
        Self::new(hparams.label_smoothing, hparams.sentence_avg)
    }
}

impl Criterion for LabelSmoothedCrossEntropy {
    fn name(&self) -> &'static str {
        "label_smoothed_cross_entropy"
    }

    fn forward(&self, logits: ArrayView2<'_, f64>, target: &[u32], need_grad: bool) -> CriterionOutput {
        let vocab = logits.ncols();
        let eps_i = self.eps / vocab as f64;
        let mut grad = need_grad.then(|| Array2::zeros(logits.raw_dim()));
        let mut logging = LoggingOutput {
            nsentences: 1,
            ..LoggingOutput::default()
        };

        for (t, &y) in target.iter().enumerate().take(logits.nrows()) {
            if y == PAD_ID {
                continue;
            }
            let y = (y as usize).min(vocab - 1);
            let row = logits.row(t);
            let max = row.fold(f64::NEG_INFINITY, |a, &b| a.max(b));
            let log_z = max + row.iter().map(|&z| (z - max).exp()).sum::<f64>().ln();

            let nll = log_z - row[y];
            let smooth: f64 = row.iter().map(|&z| log_z - z).sum();
            logging.loss += (1.0 - self.eps) * nll + eps_i * smooth;
            logging.nll_loss += nll;
            logging.ntokens += 1;

            if let Some(grad) = grad.as_mut() {
                let mut g = grad.row_mut(t);
                for (v, &z) in row.iter().enumerate() {
                    g[v] = (z - log_z).exp() - eps_i;
                }
                g[y] -= 1.0 - self.eps;
            }
        }

        logging.sample_size = if self.sentence_avg { 1 } else { logging.ntokens };
        CriterionOutput {
            logging,
            grad_logits: grad,
        }
    }

    fn aggregate_logging_outputs(&self, outputs: &[LoggingOutput]) -> AggregatedLoss {
        let mut total = LoggingOutput::default();
        for output in outputs {
            total.merge(output);
        }
        let per = |sum: f64, count: usize| if count == 0 { 0.0 } else { sum / count as f64 / LN_2 };
        AggregatedLoss {
            loss: per(total.loss, total.sample_size),
            nll_loss: per(total.nll_loss, total.ntokens),
            ntokens: total.ntokens,
            nsentences: total.nsentences,
            sample_size: total.sample_size,
        }
    }
}

pub type CriterionFactory = fn(&HParams) -> Box<dyn Criterion>;

fn build_label_smoothed_cross_entropy(hparams: &HParams) -> Box<dyn Criterion> {
    Box::new(LabelSmoothedCrossEntropy::from_hparams(hparams))
}

/// Name to constructor mapping, built once at startup.
#[derive(Debug, Clone, Default)]
pub struct CriterionRegistry {
    factories: BTreeMap<String, CriterionFactory>,
}

impl CriterionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in criteria.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.factories.insert(
            "label_smoothed_cross_entropy".to_string(),
            build_label_smoothed_cross_entropy,
        );
        registry
    }

    pub fn register(&mut self, name: &str, factory: CriterionFactory) -> NaoResult<()> {
        if self.factories.contains_key(name) {
            return Err(config_error!("Name {} already exists", name));
        }
        self.factories.insert(name.to_string(), factory);
        Ok(())
    }

    pub fn build(&self, name: &str, hparams: &HParams) -> NaoResult<Box<dyn Criterion>> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| config_error!("Unknown criterion '{}'", name))?;
        Ok(factory(hparams))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }
}
