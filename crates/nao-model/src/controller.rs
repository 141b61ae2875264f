//! The NAO controller: owner of the shared weights and the EPD network.

use std::collections::HashSet;

use nao_types::{HParams, NaoResult, NetCode, SearchError, SearchSpace};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tracing::{debug, info};

use crate::child::{ChildNet, SharedModel};
use crate::epd::{Epd, EpdConfig, EpdLoss};
use crate::seq::ArchSeqCodec;
use crate::shared::{ModelDims, SharedHandle, SharedWeights};

/// Controller settings taken from the search hyperparameters.
#[derive(Debug, Clone, PartialEq)]
pub struct ControllerConfig {
    pub num_enc_layers: usize,
    pub num_dec_layers: usize,
    pub child_hidden_size: usize,
    pub dropout: f64,
    pub epd: EpdConfig,
    pub batch_size: usize,
    pub train_epochs: usize,
    pub max_predict_lambda: usize,
    pub seed: u64,
}

impl ControllerConfig {
    pub fn from_hparams(hparams: &HParams) -> Self {
        Self {
            num_enc_layers: hparams.num_enc_layers,
            num_dec_layers: hparams.num_dec_layers,
            child_hidden_size: hparams.hidden_size,
            dropout: hparams.dropout,
            epd: EpdConfig {
                hidden_size: hparams.ctrl_hidden_size,
                trade_off: hparams.ctrl_trade_off,
                lr: hparams.ctrl_lr,
            },
            batch_size: hparams.ctrl_batch_size,
            train_epochs: hparams.ctrl_train_epochs,
            max_predict_lambda: hparams.max_predict_lambda,
            seed: hparams.seed,
        }
    }
}

pub struct NaoController {
    config: ControllerConfig,
    space: SearchSpace,
    codec: ArchSeqCodec,
    epd: Epd,
    shared: SharedHandle,
    rng: ChaCha8Rng,
}

impl NaoController {
    pub fn new(config: ControllerConfig, space: SearchSpace, src_vocab: usize, trg_vocab: usize) -> Self {
        let mut rng = ChaCha8Rng::seed_from_u64(config.seed);
        let dims = ModelDims {
            src_vocab,
            trg_vocab,
            hidden_size: config.child_hidden_size,
            num_enc_layers: config.num_enc_layers,
            num_dec_layers: config.num_dec_layers,
        };
        let shared = SharedWeights::new(dims, &space, &mut rng).into_handle();
        let codec = ArchSeqCodec::new(space.clone(), config.num_enc_layers, config.num_dec_layers);
        let epd = Epd::new(codec.clone(), config.epd.clone(), &mut rng);
        info!(
            "Controller ready: {} arch tokens, sequence length {}, {} shared parameters",
            codec.vocab_size(),
            codec.seq_len(),
            shared.read().num_parameters()
        );
        Self {
            config,
            space,
            codec,
            epd,
            shared,
            rng,
        }
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn search_space(&self) -> &SearchSpace {
        &self.space
    }

    pub fn codec(&self) -> &ArchSeqCodec {
        &self.codec
    }

    /// Handle to the shared weights; clones point at the same store.
    pub fn shared(&self) -> SharedHandle {
        self.shared.clone()
    }

    pub fn shared_model(&self) -> SharedModel {
        SharedModel::new(self.shared())
    }

    pub fn build_child(&self, code: &NetCode) -> NaoResult<ChildNet> {
        ChildNet::new(code.clone(), &self.space, self.shared(), self.config.dropout)
    }

    /// `n` distinct, uniformly sampled architectures.
    pub fn generate_arch(&mut self, n: usize) -> NaoResult<Vec<NetCode>> {
        let mut seen = HashSet::with_capacity(n);
        let mut arches = Vec::with_capacity(n);
        let max_attempts = n.saturating_mul(100).max(100);
        for _ in 0..max_attempts {
            if arches.len() == n {
                break;
            }
            let code = self.space.sample_net_code(
                &mut self.rng,
                self.config.num_enc_layers,
                self.config.num_dec_layers,
            );
            if seen.insert(code.clone()) {
                arches.push(code);
            }
        }
        if arches.len() < n {
            return Err(SearchError::SearchSpaceExhausted {
                lambda: 0,
                generated: arches.len(),
                needed: n,
            }
            .into());
        }
        Ok(arches)
    }

    pub fn parse_arch_to_seq(&self, code: &NetCode) -> NaoResult<Vec<usize>> {
        self.codec.encode(code)
    }

    pub fn parse_seq_to_arch(&self, seq: &[usize]) -> NaoResult<NetCode> {
        self.codec.decode(seq)
    }

    pub fn predict(&self, code: &NetCode) -> NaoResult<f64> {
        self.epd.predict(&self.parse_arch_to_seq(code)?)
    }

    /// Whether `candidate` is predicted to score better than `source`.
    pub fn predicted_to_beat(&self, candidate: &NetCode, source: &NetCode) -> NaoResult<bool> {
        Ok(self.predict(candidate)? > self.predict(source)?)
    }

    /// Train the EPD on `(sequence, normalized performance)` pairs for the
    /// configured number of epochs, reshuffling every epoch.
    pub fn train(&mut self, data: &[(Vec<usize>, f64)]) -> NaoResult<EpdLoss> {
        if data.is_empty() {
            return Err(SearchError::ControllerTraining {
                message: "no training pairs".to_string(),
            }
            .into());
        }
        let batch_size = self.config.batch_size.max(1);
        let mut order: Vec<usize> = (0..data.len()).collect();
        let mut last = EpdLoss::default();

        for epoch in 1..=self.config.train_epochs {
            order.shuffle(&mut self.rng);
            let mut epoch_loss = EpdLoss::default();
            let mut num_batches = 0usize;
            for chunk in order.chunks(batch_size) {
                let batch: Vec<(Vec<usize>, f64)> = chunk.iter().map(|&i| data[i].clone()).collect();
                let loss = self.epd.train_batch(&batch)?;
                epoch_loss.mse += loss.mse;
                epoch_loss.cross_entropy += loss.cross_entropy;
                epoch_loss.total += loss.total;
                num_batches += 1;
            }
            let n = num_batches.max(1) as f64;
            last = EpdLoss {
                mse: epoch_loss.mse / n,
                cross_entropy: epoch_loss.cross_entropy / n,
                total: epoch_loss.total / n,
            };
            debug!(
                "Controller epoch {}: loss {:.4} (mse {:.4}, ce {:.4})",
                epoch, last.total, last.mse, last.cross_entropy
            );
        }
        info!(
            "Controller trained on {} arches for {} epochs, final loss {:.4}",
            data.len(),
            self.config.train_epochs,
            last.total
        );
        Ok(last)
    }

    /// Decode `num_new` architectures predicted to beat `top`, none of them
    /// in `top`, `exclude` or each other.
    ///
    /// The step size grows by one until enough are found; running past
    /// `max_predict_lambda` is an error.
    pub fn generate(&self, top: &[NetCode], num_new: usize, exclude: &HashSet<NetCode>) -> NaoResult<Vec<NetCode>> {
        let mut sources = Vec::with_capacity(top.len());
        for code in top {
            sources.push((code, self.parse_arch_to_seq(code)?));
        }
        let mut known: HashSet<NetCode> = exclude.iter().cloned().chain(top.iter().cloned()).collect();
        let mut new_arches = Vec::with_capacity(num_new);
        let mut lambda = 0usize;
        let mut not_better = 0usize;

        while new_arches.len() < num_new {
            if lambda >= self.config.max_predict_lambda || sources.is_empty() {
                return Err(SearchError::SearchSpaceExhausted {
                    lambda,
                    generated: new_arches.len(),
                    needed: num_new,
                }
                .into());
            }
            lambda += 1;
            for (source, seq) in &sources {
                let candidate = self.parse_seq_to_arch(&self.epd.improve(seq, lambda as f64)?)?;
                if known.contains(&candidate) {
                    continue;
                }
                if !self.predicted_to_beat(&candidate, source)? {
                    not_better += 1;
                    continue;
                }
                known.insert(candidate.clone());
                new_arches.push(candidate);
                if new_arches.len() == num_new {
                    break;
                }
            }
            debug!(
                "Predict lambda {}: {} of {} new arches ({} rejected as not better)",
                lambda,
                new_arches.len(),
                num_new,
                not_better
            );
        }
        info!("Generated {} new arches (lambda reached {})", new_arches.len(), lambda);
        Ok(new_arches)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nao_types::NaoError;
    use std::sync::Arc;

    fn controller(max_predict_lambda: usize) -> NaoController {
        let hparams = HParams::default().with_layers(1, 1);
        let mut config = ControllerConfig::from_hparams(&hparams);
        config.child_hidden_size = 8;
        config.epd.hidden_size = 16;
        config.train_epochs = 3;
        config.max_predict_lambda = max_predict_lambda;
        NaoController::new(config, SearchSpace::normal(), 12, 12)
    }

    #[test]
    fn seed_arches_are_distinct_and_valid() {
        let mut ctrl = controller(100);
        let arches = ctrl.generate_arch(10).unwrap();
        assert_eq!(arches.len(), 10);
        let unique: HashSet<_> = arches.iter().collect();
        assert_eq!(unique.len(), 10);
        for arch in &arches {
            ctrl.search_space().check_correctness(arch).unwrap();
        }
    }

    #[test]
    fn children_share_the_controller_store() {
        let mut ctrl = controller(100);
        let arch = ctrl.generate_arch(1).unwrap().remove(0);
        let child = ctrl.build_child(&arch).unwrap();
        assert!(Arc::ptr_eq(crate::child::TranslationModel::shared(&child), &ctrl.shared()));
    }

    #[test]
    fn seq_round_trip_through_controller() {
        let mut ctrl = controller(100);
        for arch in ctrl.generate_arch(5).unwrap() {
            let seq = ctrl.parse_arch_to_seq(&arch).unwrap();
            assert_eq!(ctrl.parse_seq_to_arch(&seq).unwrap(), arch);
        }
    }

    #[test]
    fn train_rejects_empty_data() {
        let mut ctrl = controller(100);
        assert!(matches!(
            ctrl.train(&[]),
            Err(NaoError::Search(SearchError::ControllerTraining { .. }))
        ));
    }

    #[test]
    fn three_top_arches_fill_pool_of_five() {
        let mut ctrl = controller(100);
        let top = ctrl.generate_arch(3).unwrap();
        let data: Vec<(Vec<usize>, f64)> = top
            .iter()
            .zip([1.0, 0.5, 0.0])
            .map(|(a, p)| (ctrl.parse_arch_to_seq(a).unwrap(), p))
            .collect();
        ctrl.train(&data).unwrap();

        let target_pool_size = 5;
        match ctrl.generate(&top, target_pool_size - top.len(), &HashSet::new()) {
            Ok(new_arches) => {
                assert_eq!(new_arches.len(), 2);
                let worst_source = top
                    .iter()
                    .map(|a| ctrl.predict(a).unwrap())
                    .fold(f64::INFINITY, f64::min);
                for arch in &new_arches {
                    ctrl.search_space().check_correctness(arch).unwrap();
                    assert!(!top.contains(arch));
                    // Each arch beats its own source, so at least the worst one.
                    assert!(ctrl.predict(arch).unwrap() > worst_source);
                }
                assert_ne!(new_arches[0], new_arches[1]);
            }
            Err(NaoError::Search(SearchError::SearchSpaceExhausted { needed, .. })) => assert_eq!(needed, 2),
            Err(other) => panic!("unexpected error {}", other),
        }
    }

    #[test]
    fn only_predicted_improvements_count() {
        let mut ctrl = controller(100);
        let arches = ctrl.generate_arch(8).unwrap();
        let by_prediction = |a: &&NetCode, b: &&NetCode| ctrl.predict(a).unwrap().total_cmp(&ctrl.predict(b).unwrap());
        let best = arches.iter().max_by(by_prediction).unwrap();
        let worst = arches.iter().min_by(by_prediction).unwrap();
        assert_ne!(best, worst);

        assert!(ctrl.predicted_to_beat(best, worst).unwrap());
        assert!(!ctrl.predicted_to_beat(worst, best).unwrap());
        assert!(!ctrl.predicted_to_beat(best, best).unwrap());
    }

    #[test]
    fn generated_arches_beat_their_sources() {
        let mut ctrl = controller(100);
        let top = ctrl.generate_arch(4).unwrap();
        let data: Vec<(Vec<usize>, f64)> = top
            .iter()
            .zip([1.0, 0.7, 0.3, 0.0])
            .map(|(a, p)| (ctrl.parse_arch_to_seq(a).unwrap(), p))
            .collect();
        ctrl.train(&data).unwrap();

        // With a single source every new arch must beat that source.
        for source in &top {
            match ctrl.generate(std::slice::from_ref(source), 1, &HashSet::new()) {
                Ok(new_arches) => {
                    assert_eq!(new_arches.len(), 1);
                    assert!(ctrl.predicted_to_beat(&new_arches[0], source).unwrap());
                }
                Err(NaoError::Search(SearchError::SearchSpaceExhausted { generated, needed, .. })) => {
                    assert_eq!((generated, needed), (0, 1));
                }
                Err(other) => panic!("unexpected error {}", other),
            }
        }
    }

    #[test]
    fn zero_lambda_budget_is_exhausted() {
        let mut ctrl = controller(0);
        let top = ctrl.generate_arch(3).unwrap();
        assert!(matches!(
            ctrl.generate(&top, 2, &HashSet::new()),
            Err(NaoError::Search(SearchError::SearchSpaceExhausted { lambda: 0, generated: 0, needed: 2 }))
        ));
        assert!(ctrl.generate(&top, 0, &HashSet::new()).unwrap().is_empty());
    }
}
