//! Strongly typed search hyperparameters.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::errors::{NaoError, NaoResult};

/// All hyperparameters of a search run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HParams {
    /// Registered task name (e.g. "de_en_iwslt").
    pub task: String,
    pub data_dir: PathBuf,
    /// Where ranked architecture pools are written.
    pub save_dir: PathBuf,
    pub seed: u64,

    // Child network shape.
    pub num_enc_layers: usize,
    pub num_dec_layers: usize,
    pub hidden_size: usize,
    pub dropout: f64,

    // Child training.
    pub criterion: String,
    pub label_smoothing: f64,
    /// Use sentence count instead of token count as the loss denominator.
    pub sentence_avg: bool,
    pub optimizer: String,
    pub lr: f64,
    pub momentum: f64,
    pub adam_betas: (f64, f64),
    pub adam_eps: f64,
    pub weight_decay: f64,
    pub clip_norm: f64,
    pub lr_scheduler: String,
    pub warmup_updates: usize,
    pub max_sentences: usize,
    pub max_tokens: Option<usize>,
    pub log_interval: usize,
    /// Batches preloaded by the data worker.
    pub prefetch: usize,

    // Search.
    pub num_seed_arch: usize,
    /// Child training epochs per search step.
    pub child_eval_freq: usize,
    pub child_eval_batch_size: usize,
    pub ctrl_batch_size: usize,
    pub ctrl_train_epochs: usize,
    pub ctrl_lr: f64,
    pub ctrl_hidden_size: usize,
    /// Weight of the predictor loss against the reconstruction loss.
    pub ctrl_trade_off: f64,
    pub num_remain_top: usize,
    pub num_pred_top: usize,
    pub max_predict_lambda: usize,
    pub max_ctrl_step: Option<u64>,
    pub compute_eval_loss: bool,
    pub gen_maxlen_b: usize,
    pub gen_sort_by_length: bool,

    // Devices.
    pub num_gpus: usize,
    /// Train different architectures on different devices.
    pub arch_dist: bool,
}

impl Default for HParams {
    fn default() -> Self {
        Self {
            task: "test".to_string(),
            data_dir: PathBuf::from("data"),
            save_dir: PathBuf::from("arch_pools"),
            seed: 1,
            num_enc_layers: 2,
            num_dec_layers: 2,
            hidden_size: 32,
            dropout: 0.1,
            criterion: "label_smoothed_cross_entropy".to_string(),
            label_smoothing: 0.1,
            sentence_avg: false,
            optimizer: "adam".to_string(),
            lr: 1e-3,
            momentum: 0.9,
            adam_betas: (0.9, 0.98),
            adam_eps: 1e-8,
            weight_decay: 0.0,
            clip_norm: 25.0,
            lr_scheduler: "inverse_sqrt".to_string(),
            warmup_updates: 100,
            max_sentences: 32,
            max_tokens: None,
            log_interval: 50,
            prefetch: 4,
            num_seed_arch: 20,
            child_eval_freq: 1,
            child_eval_batch_size: 32,
            ctrl_batch_size: 10,
            ctrl_train_epochs: 10,
            ctrl_lr: 0.1,
            ctrl_hidden_size: 32,
            ctrl_trade_off: 0.8,
            num_remain_top: 10,
            num_pred_top: 10,
            max_predict_lambda: 100,
            max_ctrl_step: None,
            compute_eval_loss: false,
            gen_maxlen_b: 100,
            gen_sort_by_length: false,
            num_gpus: 1,
            arch_dist: false,
        }
    }
}

impl HParams {
    pub fn new(task: &str) -> Self {
        Self {
            task: task.to_string(),
            ..Self::default()
        }
    }

    /// Load from a JSON file; missing fields take their defaults.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> NaoResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn with_seed_arch(mut self, num_seed_arch: usize) -> Self {
        self.num_seed_arch = num_seed_arch;
        self
    }

    pub fn with_layers(mut self, num_enc_layers: usize, num_dec_layers: usize) -> Self {
        self.num_enc_layers = num_enc_layers;
        self.num_dec_layers = num_dec_layers;
        self
    }

    pub fn with_top_k(mut self, num_remain_top: usize, num_pred_top: usize) -> Self {
        self.num_remain_top = num_remain_top;
        self.num_pred_top = num_pred_top;
        self
    }

    pub fn with_max_ctrl_step(mut self, steps: Option<u64>) -> Self {
        self.max_ctrl_step = steps;
        self
    }

    pub fn with_ctrl_training(mut self, batch_size: usize, epochs: usize) -> Self {
        self.ctrl_batch_size = batch_size;
        self.ctrl_train_epochs = epochs;
        self
    }

    pub fn with_child_eval(mut self, eval_freq: usize, eval_batch_size: usize) -> Self {
        self.child_eval_freq = eval_freq;
        self.child_eval_batch_size = eval_batch_size;
        self
    }

    pub fn with_save_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.save_dir = dir.into();
        self
    }

    pub fn is_single_gpu(&self) -> bool {
        self.num_gpus <= 1
    }

    /// Reject inconsistent settings before anything is built.
    pub fn validate(&self) -> NaoResult<()> {
        fn positive(name: &str, value: usize) -> NaoResult<()> {
            if value == 0 {
                return Err(NaoError::Config(format!("{} must be positive", name)));
            }
            Ok(())
        }

        if self.task.is_empty() {
            return Err(NaoError::Config("task must be set".to_string()));
        }
        positive("num_enc_layers", self.num_enc_layers)?;
        positive("num_dec_layers", self.num_dec_layers)?;
        positive("hidden_size", self.hidden_size)?;
        positive("max_sentences", self.max_sentences)?;
        positive("num_seed_arch", self.num_seed_arch)?;
        positive("child_eval_batch_size", self.child_eval_batch_size)?;
        positive("ctrl_batch_size", self.ctrl_batch_size)?;
        positive("ctrl_hidden_size", self.ctrl_hidden_size)?;
        positive("num_gpus", self.num_gpus)?;
        positive("log_interval", self.log_interval)?;

        if self.num_remain_top > self.num_seed_arch {
            return Err(NaoError::Config(format!(
                "num_remain_top ({}) exceeds num_seed_arch ({})",
                self.num_remain_top, self.num_seed_arch
            )));
        }
        // Generation refills the pool from the kept and predicted top arches.
        if self.num_remain_top < self.num_seed_arch {
            positive("num_remain_top", self.num_remain_top)?;
            positive("num_pred_top", self.num_pred_top)?;
        }
        if !(0.0..1.0).contains(&self.label_smoothing) {
            return Err(NaoError::Config(format!(
                "label_smoothing must be in [0, 1), got {}",
                self.label_smoothing
            )));
        }
        if !(0.0..=1.0).contains(&self.ctrl_trade_off) {
            return Err(NaoError::Config(format!(
                "ctrl_trade_off must be in [0, 1], got {}",
                self.ctrl_trade_off
            )));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(NaoError::Config(format!("dropout must be in [0, 1), got {}", self.dropout)));
        }
        if self.lr <= 0.0 || self.ctrl_lr <= 0.0 {
            return Err(NaoError::Config("learning rates must be positive".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        HParams::default().validate().unwrap();
    }

    #[test]
    fn builder_chain() {
        let hparams = HParams::new("de_en_iwslt")
            .with_seed_arch(5)
            .with_top_k(3, 3)
            .with_layers(1, 1)
            .with_max_ctrl_step(Some(2));
        assert_eq!(hparams.task, "de_en_iwslt");
        assert_eq!(hparams.num_seed_arch, 5);
        assert_eq!(hparams.max_ctrl_step, Some(2));
        hparams.validate().unwrap();
    }

    #[test]
    fn rejects_remain_top_above_pool_size() {
        let hparams = HParams::default().with_seed_arch(4).with_top_k(5, 5);
        assert!(matches!(hparams.validate(), Err(NaoError::Config(_))));
    }

    #[test]
    fn rejects_empty_top_k_when_generating() {
        let no_pred = HParams::default().with_seed_arch(5).with_top_k(3, 0);
        let err = no_pred.validate().unwrap_err();
        assert!(matches!(err, NaoError::Config(_)));
        assert!(err.to_string().contains("num_pred_top"));

        let no_remain = HParams::default().with_seed_arch(5).with_top_k(0, 3);
        assert!(no_remain.validate().unwrap_err().to_string().contains("num_remain_top"));

        // A pool that is kept whole never generates.
        HParams::default().with_seed_arch(5).with_top_k(5, 0).validate().unwrap();
    }

    #[test]
    fn rejects_zero_batch_size() {
        let mut hparams = HParams::default();
        hparams.ctrl_batch_size = 0;
        let err = hparams.validate().unwrap_err();
        assert!(err.to_string().contains("ctrl_batch_size"));
    }

    #[test]
    fn rejects_bad_label_smoothing() {
        let mut hparams = HParams::default();
        hparams.label_smoothing = 1.0;
        assert!(hparams.validate().is_err());
    }

    #[test]
    fn partial_json_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hparams.json");
        std::fs::write(&path, r#"{"task": "de_en_iwslt", "num_seed_arch": 8}"#).unwrap();

        let hparams = HParams::from_json_file(&path).unwrap();
        assert_eq!(hparams.task, "de_en_iwslt");
        assert_eq!(hparams.num_seed_arch, 8);
        assert_eq!(hparams.ctrl_train_epochs, HParams::default().ctrl_train_epochs);
        assert!(hparams.is_single_gpu());
    }
}
