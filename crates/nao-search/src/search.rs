//! The search loop: train, evaluate, rank, persist, retrain the controller,
//! generate, repeat.

use std::sync::Arc;

use nao_model::EpdLoss;
use nao_types::{NaoResult, NetCode};
use tracing::info;

use crate::meters::StopwatchMeter;
use crate::persistence::ArchStore;
use crate::pool::ArchRecord;
use crate::trainer::{error_rate, NaoTrainer};

/// Outcome of one search step.
#[derive(Debug, Clone)]
pub struct StepReport {
    pub step: u64,
    /// BLEU per arch, in the pool order before ranking.
    pub bleus: Vec<f64>,
    /// The ranked pool as persisted.
    pub records: Vec<ArchRecord>,
    pub controller_loss: EpdLoss,
    /// Pool for the next step.
    pub next_pool: Vec<NetCode>,
}

#[derive(Debug, Clone)]
pub struct SearchSummary {
    pub steps: u64,
    pub elapsed_secs: f64,
    pub last_step: Option<StepReport>,
}

pub struct NaoSearch {
    trainer: NaoTrainer,
    store: Arc<dyn ArchStore>,
    step: u64,
}

impl NaoSearch {
    pub fn new(trainer: NaoTrainer, store: Arc<dyn ArchStore>) -> Self {
        Self {
            trainer,
            store,
            step: 1,
        }
    }

    pub fn trainer(&self) -> &NaoTrainer {
        &self.trainer
    }

    /// Number of the next step to run.
    pub fn step(&self) -> u64 {
        self.step
    }

    fn has_steps_left(&self) -> bool {
        self.trainer
            .hparams()
            .max_ctrl_step
            .map_or(true, |max| self.step <= max)
    }

    /// Run one full step. Any failure aborts the step; nothing is retried.
    pub async fn run_step(&mut self) -> NaoResult<StepReport> {
        let step = self.step;
        info!("Training step {}", step);
        self.trainer.set_seed(step);

        self.trainer.init_arch_pool()?;
        self.trainer.train_children()?;

        let compute_loss = self.trainer.hparams().compute_eval_loss;
        let eval = self.trainer.eval_children(compute_loss)?;

        let error_rates = eval.bleus.iter().map(|&bleu| error_rate(bleu)).collect();
        let records = self.trainer.pool_mut().rank_and_store(error_rates)?;
        if let Some(best) = records.first() {
            info!("Best arch of step {}: error rate {:.4}, {}", step, best.error_rate, best.net_code);
        }

        self.store.save_arches(step, &records).await?;

        let controller_loss = self.trainer.controller_train_step(&records)?;
        let next_pool = self.trainer.controller_generate_step(&records)?;

        self.step += 1;
        Ok(StepReport {
            step,
            bleus: eval.bleus,
            records,
            controller_loss,
            next_pool,
        })
    }

    /// Run steps until `max_ctrl_step` is reached, or forever when unset.
    pub async fn run(&mut self) -> NaoResult<SearchSummary> {
        let mut timer = StopwatchMeter::started();
        let first_step = self.step;
        let mut last_step = None;
        while self.has_steps_left() {
            last_step = Some(self.run_step().await?);
        }
        timer.stop();
        info!("Training done in {:.1} seconds", timer.sum());
        Ok(SearchSummary {
            steps: self.step - first_step,
            elapsed_secs: timer.sum(),
            last_step,
        })
    }
}
