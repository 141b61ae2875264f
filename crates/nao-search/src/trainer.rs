//! Child training and evaluation on top of the controller's shared weights.

use std::collections::HashSet;
use std::sync::Arc;

use nao_data::{
    cover_with_repeats, BatchingOptions, EpochBatchIterator, LanguageDatasets, LanguagePairDataset,
    PrefetchIter,
};
use nao_model::{
    batch_loss, build_lr_scheduler, build_optimizer, forward_backward, AggregatedLoss, ControllerConfig,
    Criterion, EpdLoss, LoggingOutput, NaoController, TranslationModel,
};
use nao_types::{internal_error, HParams, NaoError, NaoResult, NetCode, SearchSpace, Split};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing::{debug, info, warn};

use crate::env::{ChildEnvGuard, TrainContext};
use crate::generator::{MaxLen, References, SequenceGenerator};
use crate::meters::{AverageMeter, StopwatchMeter};
use crate::pool::{ArchPool, ArchRecord};
use crate::progress::{NoopProgress, ProgressReporter};

/// Per-architecture evaluation results, in pool order.
#[derive(Debug, Clone, PartialEq)]
pub struct EvalResult {
    /// BLEU in `[0, 100]`.
    pub bleus: Vec<f64>,
    /// Validation loss (base 2), when requested.
    pub losses: Option<Vec<f64>>,
}

/// Error rate of a BLEU score.
pub fn error_rate(bleu: f64) -> f64 {
    1.0 - bleu / 100.0
}

/// Map error rates onto `[0, 1]` with the lowest error at 1 and the highest at 0.
///
/// When all rates are equal every entry becomes 0.5.
pub fn normalized_perf(error_rates: &[f64]) -> Vec<f64> {
    if error_rates.is_empty() {
        return Vec::new();
    }
    let max = error_rates.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let min = error_rates.iter().copied().fold(f64::INFINITY, f64::min);
    let range = max - min;
    if range.is_nan() || range <= 0.0 {
        warn!("All {} performances equal {}, normalizing to 0.5", error_rates.len(), min);
        return vec![0.5; error_rates.len()];
    }
    error_rates.iter().map(|v| (max - v) / range).collect()
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

/// Drives child training and evaluation for the search loop and owns the
/// architecture pool and the controller.
pub struct NaoTrainer {
    hparams: HParams,
    datasets: Arc<LanguageDatasets>,
    controller: NaoController,
    criterion: Box<dyn Criterion>,
    context: TrainContext,
    pool: ArchPool,
    rng: ChaCha8Rng,
    references: Option<Arc<References>>,
    progress: Box<dyn ProgressReporter>,
}

impl NaoTrainer {
    pub fn new(hparams: HParams, datasets: Arc<LanguageDatasets>, criterion: Box<dyn Criterion>) -> NaoResult<Self> {
        hparams.validate()?;
        let controller = NaoController::new(
            ControllerConfig::from_hparams(&hparams),
            SearchSpace::normal(),
            datasets.source_dict.len(),
            datasets.target_dict.len(),
        );
        let model: Arc<dyn TranslationModel> = Arc::new(controller.shared_model());
        let context = TrainContext::new(model, build_optimizer(&hparams)?, build_lr_scheduler(&hparams)?);
        info!("Model: {}, criterion: {}", context.model.describe(), criterion.name());
        info!("Num. model params: {}", context.model.num_parameters());
        info!(
            "Training on {} sentences per batch, child eval batch size {}",
            hparams.max_sentences, hparams.child_eval_batch_size
        );
        let rng = ChaCha8Rng::seed_from_u64(hparams.seed);
        Ok(Self {
            hparams,
            datasets,
            controller,
            criterion,
            context,
            pool: ArchPool::new(),
            rng,
            references: None,
            progress: Box::new(NoopProgress),
        })
    }

    pub fn with_progress(mut self, progress: Box<dyn ProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    pub fn hparams(&self) -> &HParams {
        &self.hparams
    }

    pub fn controller(&self) -> &NaoController {
        &self.controller
    }

    pub fn pool(&self) -> &ArchPool {
        &self.pool
    }

    pub fn pool_mut(&mut self) -> &mut ArchPool {
        &mut self.pool
    }

    /// The model the training loop currently works on.
    pub fn model(&self) -> &Arc<dyn TranslationModel> {
        &self.context.model
    }

    pub fn context(&self) -> &TrainContext {
        &self.context
    }

    /// Reseed child sampling and data shuffling for a search step.
    pub fn set_seed(&mut self, step: u64) {
        self.rng = ChaCha8Rng::seed_from_u64(self.hparams.seed.wrapping_add(step));
    }

    /// Child network over the shared weights.
    pub fn new_model(&self, code: &NetCode) -> NaoResult<Arc<dyn TranslationModel>> {
        Ok(Arc::new(self.controller.build_child(code)?))
    }

    /// Seed the pool from the controller unless it already holds arches.
    pub fn init_arch_pool(&mut self) -> NaoResult<bool> {
        let controller = &mut self.controller;
        self.pool
            .seed(self.hparams.num_seed_arch, |count| controller.generate_arch(count))
    }

    /// Train one sampled child for `child_eval_freq` epochs with its own
    /// optimizer and LR schedule.
    pub fn train_children(&mut self) -> NaoResult<()> {
        info!("Training children, arch pool size = {}", self.pool.len());
        if !self.hparams.is_single_gpu() {
            let message = if self.hparams.arch_dist {
                "Arch dist multi-gpu training not supported yet"
            } else {
                "Non-arch dist multi-gpu training not supported yet"
            };
            return Err(NaoError::NotImplemented(message.to_string()));
        }

        let arch = self.pool.sample_one(&mut self.rng)?.clone();
        let child = self.new_model(&arch)?;
        let optimizer = build_optimizer(&self.hparams)?;
        let lr_scheduler = build_lr_scheduler(&self.hparams)?;

        let mut env = ChildEnvGuard::train(&mut self.context, child, optimizer, lr_scheduler);
        info!("Number of child model parameters: {}", env.model.num_parameters());
        info!("Architecture: {}", arch);

        let train = self.datasets.split(Split::Train)?;
        let lr = env.lr_scheduler.step_update(0);
        env.optimizer.set_lr(lr);
        for epoch in 1..=self.hparams.child_eval_freq {
            train_epoch(&self.hparams, &train, self.criterion.as_ref(), &mut env, epoch, &mut self.rng)?;
        }
        Ok(())
    }

    /// Score every pool architecture on one dev batch each.
    ///
    /// Dev passes are repeated when the pool is larger than one pass.
    pub fn eval_children(&mut self, compute_loss: bool) -> NaoResult<EvalResult> {
        let references = self.references()?;
        let dev = self.datasets.split(Split::Dev)?;
        let generator = SequenceGenerator::new(MaxLen {
            a: 0.0,
            b: self.hparams.gen_maxlen_b,
        });
        let options = BatchingOptions::new(self.hparams.child_eval_batch_size).sorted(self.hparams.gen_sort_by_length);
        let arches = self.pool.arches().to_vec();
        let batches = cover_with_repeats(|| EpochBatchIterator::new(dev.clone(), &options), arches.len())?;

        let mut timer = StopwatchMeter::started();
        let mut bleus = Vec::with_capacity(arches.len());
        let mut losses = compute_loss.then(Vec::new);
        self.progress.begin("Evaluating arches", arches.len());
        for (i, (arch, batch)) in arches.iter().zip(batches).enumerate() {
            let child = self.new_model(arch)?;
            if let Some(losses) = losses.as_mut() {
                let env = ChildEnvGuard::eval(&mut self.context, child.clone());
                losses.push(validate(&self.hparams, &dev, self.criterion.as_ref(), &env)?.loss);
            }
            let hypotheses = generator.generate_batch(child.as_ref(), &batch)?;
            let bleu = references.batch_bleu(&self.datasets.target_dict, &hypotheses)?;
            debug!("Arch {} ({}): BLEU {:.2} on {} sentences", i, arch, bleu, batch.len());
            bleus.push(bleu);
            self.progress.advance("Evaluating arches", i + 1, arches.len());
        }
        self.progress.finish("Evaluating arches");
        timer.stop();

        if bleus.len() != arches.len() {
            return Err(internal_error!("evaluated {} of {} arches", bleus.len(), arches.len()));
        }
        let loss_text = match &losses {
            Some(losses) => format!("{:.6}", mean(losses)),
            None => "[NotComputed]".to_string(),
        };
        info!("Evaluation on valid data: totally validated {} architectures", arches.len());
        info!(
            "Metrics: loss={}, valid_accuracy={:.6}, secs={:.2}",
            loss_text,
            mean(&bleus),
            timer.sum()
        );
        Ok(EvalResult { bleus, losses })
    }

    /// Tokenized references, built on first use and kept for the trainer's lifetime.
    fn references(&mut self) -> NaoResult<Arc<References>> {
        if let Some(references) = &self.references {
            return Ok(references.clone());
        }
        let lines = self.datasets.read_references()?;
        let references = Arc::new(References::new(
            &self.datasets.target_dict,
            &lines,
            self.datasets.task.bpe_symbol.as_deref(),
        ));
        info!("Tokenized {} reference sentences", references.len());
        self.references = Some(references.clone());
        Ok(references)
    }

    /// Fit the controller to ranked `(arch, error rate)` pairs.
    pub fn controller_train_step(&mut self, records: &[ArchRecord]) -> NaoResult<EpdLoss> {
        info!("Training Encoder-Predictor-Decoder");
        let error_rates: Vec<f64> = records.iter().map(|r| r.error_rate).collect();
        let targets = normalized_perf(&error_rates);
        let data = records
            .iter()
            .zip(targets)
            .map(|(record, target)| Ok((self.controller.parse_arch_to_seq(&record.net_code)?, target)))
            .collect::<NaoResult<Vec<_>>>()?;
        self.controller.train(&data)
    }

    /// Keep the best `num_remain_top` arches and fill the pool back up to
    /// `num_seed_arch` with arches generated from the best `num_pred_top`.
    pub fn controller_generate_step(&mut self, records: &[ArchRecord]) -> NaoResult<Vec<NetCode>> {
        let old: Vec<NetCode> = records
            .iter()
            .take(self.hparams.num_remain_top)
            .map(|r| r.net_code.clone())
            .collect();
        let top = &old[..self.hparams.num_pred_top.min(old.len())];
        let needed = self.hparams.num_seed_arch.saturating_sub(old.len());
        let exclude: HashSet<NetCode> = old.iter().cloned().collect();

        let new_arches = self.controller.generate(top, needed, &exclude)?;
        info!("Keeping {} old arches, generated {} new arches", old.len(), new_arches.len());

        let mut next = old;
        next.extend(new_arches);
        self.pool.replace(next.clone());
        Ok(next)
    }
}

fn train_epoch(
    hparams: &HParams,
    train: &Arc<LanguagePairDataset>,
    criterion: &dyn Criterion,
    context: &mut TrainContext,
    epoch: usize,
    rng: &mut ChaCha8Rng,
) -> NaoResult<AggregatedLoss> {
    let options = BatchingOptions::new(hparams.max_sentences)
        .with_max_tokens(hparams.max_tokens)
        .shuffled(rng.gen());
    let batches = PrefetchIter::new(EpochBatchIterator::new(train.clone(), &options), hparams.prefetch);
    let num_batches = batches.len();

    let mut outputs: Vec<LoggingOutput> = Vec::with_capacity(num_batches);
    let mut loss_meter = AverageMeter::new();
    for (i, batch) in batches.enumerate() {
        let output = forward_backward(context.model.as_ref(), &batch, criterion, Some(rng.gen()))?;
        let mut grads = output.grads;
        if hparams.clip_norm > 0.0 {
            grads.clip_norm(hparams.clip_norm);
        }
        context
            .model
            .shared()
            .write()
            .apply_grads(&grads, context.optimizer.as_mut())?;
        let lr = context.lr_scheduler.step_update(context.optimizer.num_steps());
        context.optimizer.set_lr(lr);

        let aggregated = criterion.aggregate_logging_outputs(std::slice::from_ref(&output.logging));
        loss_meter.update(aggregated.loss, aggregated.sample_size as f64);
        outputs.push(output.logging);
        if (i + 1) % hparams.log_interval == 0 {
            debug!(
                "epoch {:03} | {:>5} / {} | loss {:.3} | lr {:.6}",
                epoch,
                i + 1,
                num_batches,
                loss_meter.avg(),
                lr
            );
        }
    }

    let aggregated = criterion.aggregate_logging_outputs(&outputs);
    info!(
        "epoch {:03} | loss {:.3} | nll_loss {:.3} | updates {} | lr {:.6}",
        epoch,
        aggregated.loss,
        aggregated.nll_loss,
        context.optimizer.num_steps(),
        context.optimizer.get_lr()
    );
    Ok(aggregated)
}

/// Loss of the context's model over a whole split.
fn validate(
    hparams: &HParams,
    split: &Arc<LanguagePairDataset>,
    criterion: &dyn Criterion,
    context: &TrainContext,
) -> NaoResult<AggregatedLoss> {
    let options = BatchingOptions::new(hparams.max_sentences).with_max_tokens(hparams.max_tokens);
    let outputs = EpochBatchIterator::new(split.clone(), &options)
        .map(|batch| batch_loss(context.model.as_ref(), &batch, criterion))
        .collect::<NaoResult<Vec<_>>>()?;
    Ok(criterion.aggregate_logging_outputs(&outputs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use nao_model::{LabelSmoothedCrossEntropy, LayerKey};
    use nao_types::{LayerKind, SearchError, Side, TaskSpec};

    fn hparams() -> HParams {
        let mut hparams = HParams::new("tiny")
            .with_layers(1, 1)
            .with_seed_arch(5)
            .with_top_k(3, 3)
            .with_child_eval(1, 2)
            .with_ctrl_training(5, 2);
        hparams.hidden_size = 8;
        hparams.ctrl_hidden_size = 8;
        hparams.max_sentences = 2;
        hparams.gen_maxlen_b = 4;
        hparams.warmup_updates = 2;
        hparams
    }

    fn model_addr(model: &Arc<dyn TranslationModel>) -> *const () {
        Arc::as_ptr(model) as *const ()
    }

    fn datasets(dev_pairs: usize) -> Arc<LanguageDatasets> {
        let train = vec![
            ("a b c", "x y z"),
            ("b c", "y z"),
            ("c a", "z x"),
            ("a", "x"),
        ];
        let dev = [("a b", "x y"), ("c b", "z y"), ("a c", "x z")];
        let splits = vec![
            (Split::Train, train),
            (Split::Dev, dev.iter().copied().take(dev_pairs).collect()),
        ];
        Arc::new(LanguageDatasets::from_raw_pairs(TaskSpec::new("tiny", "en", "fr"), &splits).unwrap())
    }

    fn trainer(hparams: HParams, datasets: Arc<LanguageDatasets>) -> NaoTrainer {
        let criterion = Box::new(LabelSmoothedCrossEntropy::from_hparams(&hparams));
        NaoTrainer::new(hparams, datasets, criterion).unwrap()
    }

    #[test]
    fn normalized_perf_polarity() {
        let perf = normalized_perf(&[0.2, 0.5, 0.8]);
        for (value, expected) in perf.iter().zip([1.0, 0.5, 0.0]) {
            assert!((value - expected).abs() < 1e-9);
        }
        assert_eq!(normalized_perf(&[0.3, 0.3]), vec![0.5, 0.5]);
        assert!(normalized_perf(&[]).is_empty());
        assert_eq!(normalized_perf(&[0.4]), vec![0.5]);
        assert!((error_rate(25.0) - 0.75).abs() < 1e-12);
    }

    #[test]
    fn multi_gpu_is_not_implemented() {
        for (arch_dist, expected) in [
            (true, "Arch dist multi-gpu training not supported yet"),
            (false, "Non-arch dist multi-gpu training not supported yet"),
        ] {
            let mut hparams = hparams();
            hparams.num_gpus = 2;
            hparams.arch_dist = arch_dist;
            let mut trainer = trainer(hparams, datasets(3));
            trainer.init_arch_pool().unwrap();
            match trainer.train_children() {
                Err(NaoError::NotImplemented(message)) => assert_eq!(message, expected),
                other => panic!("expected NotImplemented, got {:?}", other.err()),
            }
        }
    }

    #[test]
    fn training_without_pool_is_empty_pool_error() {
        let mut trainer = trainer(hparams(), datasets(3));
        assert!(matches!(
            trainer.train_children(),
            Err(NaoError::Search(SearchError::EmptyPool))
        ));
    }

    #[test]
    fn train_children_restores_shared_model() {
        let mut trainer = trainer(hparams(), datasets(3));
        assert!(trainer.init_arch_pool().unwrap());
        assert!(!trainer.init_arch_pool().unwrap());
        let before = trainer.model().clone();
        let updates_before = trainer.controller().shared().read().num_updates();

        trainer.train_children().unwrap();

        assert_eq!(model_addr(trainer.model()), model_addr(&before));
        // 4 training pairs in batches of 2.
        assert_eq!(trainer.controller().shared().read().num_updates(), updates_before + 2);
    }

    #[test]
    fn train_children_updates_sampled_arch_slot() {
        let mut trainer = trainer(hparams(), datasets(3));
        trainer.init_arch_pool().unwrap();
        let arch = trainer.pool().arches()[0].clone();
        trainer.pool_mut().replace(vec![arch.clone()]);

        let top = arch.decoder().last().unwrap();
        let kind = LayerKind::from_code(top[0]).unwrap();
        let key = LayerKey {
            side: Side::Decoder,
            index: arch.decoder().len() - 1,
            kind,
        };
        let untouched = LayerKey {
            kind: LayerKind::ALL.into_iter().find(|k| *k != kind).unwrap(),
            ..key
        };
        let shared = trainer.controller().shared().clone();
        let before = shared.read().layer(key).unwrap().clone();
        let other_before = shared.read().layer(untouched).unwrap().clone();

        trainer.train_children().unwrap();

        assert_ne!(shared.read().layer(key).unwrap(), &before);
        assert_eq!(shared.read().layer(untouched).unwrap(), &other_before);
    }

    #[test]
    fn failed_training_restores_shared_model() {
        let splits = vec![(Split::Dev, vec![("a b", "x y")])];
        let datasets = Arc::new(LanguageDatasets::from_raw_pairs(TaskSpec::new("tiny", "en", "fr"), &splits).unwrap());
        let mut trainer = trainer(hparams(), datasets);
        trainer.init_arch_pool().unwrap();
        let before = trainer.model().clone();
        assert!(trainer.train_children().is_err());
        assert_eq!(model_addr(trainer.model()), model_addr(&before));
    }

    #[test]
    fn eval_repeats_dev_passes_to_cover_pool() {
        // 3 dev pairs in batches of 2: 2 batches per pass, 5 arches.
        let mut trainer = trainer(hparams(), datasets(3));
        trainer.init_arch_pool().unwrap();
        let result = trainer.eval_children(true).unwrap();
        assert_eq!(result.bleus.len(), 5);
        assert!(result.bleus.iter().all(|b| (0.0..=100.0).contains(b)));
        let losses = result.losses.unwrap();
        assert_eq!(losses.len(), 5);
        assert!(losses.iter().all(|l| l.is_finite() && *l > 0.0));
        assert!(trainer.references.is_some());
    }

    #[test]
    fn controller_steps_refill_pool() {
        let mut trainer = trainer(hparams(), datasets(3));
        trainer.init_arch_pool().unwrap();
        let records = trainer
            .pool_mut()
            .rank_and_store(vec![0.9, 0.1, 0.5, 0.7, 0.3])
            .unwrap();
        let loss = trainer.controller_train_step(&records).unwrap();
        assert!(loss.total.is_finite());

        match trainer.controller_generate_step(&records) {
            Ok(next) => {
                assert_eq!(next.len(), 5);
                let kept: Vec<NetCode> = records.iter().take(3).map(|r| r.net_code.clone()).collect();
                assert_eq!(&next[..3], kept.as_slice());
                let unique: HashSet<&NetCode> = next.iter().collect();
                assert_eq!(unique.len(), 5);
                assert_eq!(trainer.pool().arches(), next.as_slice());
                assert!(trainer.pool().performances().is_none());
            }
            Err(NaoError::Search(SearchError::SearchSpaceExhausted { needed, .. })) => assert_eq!(needed, 2),
            Err(other) => panic!("unexpected error {}", other),
        }
    }
}
