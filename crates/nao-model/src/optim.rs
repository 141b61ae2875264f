//! Optimizers and learning-rate schedulers built per child-training scope.

use std::collections::HashMap;

use nao_types::{config_error, HParams, NaoResult};
use ndarray::{ArrayD, ArrayViewD, ArrayViewMutD, Zip};

/// In-place parameter update rule.
pub trait Optimizer: Send + Sync {
    fn name(&self) -> &'static str;

    fn get_lr(&self) -> f64;

    fn set_lr(&mut self, lr: f64);

    /// Mark the start of one update of all parameters.
    fn begin_step(&mut self);

    /// Update the parameter registered under `key` with its gradient.
    fn update(&mut self, key: &str, param: ArrayViewMutD<'_, f64>, grad: ArrayViewD<'_, f64>);

    fn num_steps(&self) -> u64;
}

/// SGD with optional momentum and weight decay.
#[derive(Debug, Clone)]
pub struct Sgd {
    lr: f64,
    momentum: f64,
    weight_decay: f64,
    velocity: HashMap<String, ArrayD<f64>>,
    steps: u64,
}

impl Sgd {
    pub fn new(lr: f64, momentum: f64, weight_decay: f64) -> Self {
        Self {
            lr,
            momentum,
            weight_decay,
            velocity: HashMap::new(),
            steps: 0,
        }
    }
}

impl Optimizer for Sgd {
    fn name(&self) -> &'static str {
        "sgd"
    }

    fn get_lr(&self) -> f64 {
        self.lr
    }

    fn set_lr(&mut self, lr: f64) {
        self.lr = lr;
    }

    fn begin_step(&mut self) {
        self.steps += 1;
    }

    fn update(&mut self, key: &str, mut param: ArrayViewMutD<'_, f64>, grad: ArrayViewD<'_, f64>) {
        let (lr, momentum, decay) = (self.lr, self.momentum, self.weight_decay);
        if momentum == 0.0 {
            Zip::from(&mut param).and(&grad).for_each(|p, &g| {
                *p -= lr * (g + decay * *p);
            });
            return;
        }
        let velocity = self
            .velocity
            .entry(key.to_string())
            .or_insert_with(|| ArrayD::zeros(grad.raw_dim()));
        Zip::from(&mut param).and(velocity).and(&grad).for_each(|p, v, &g| {
            *v = momentum * *v + g + decay * *p;
            *p -= lr * *v;
        });
    }

    fn num_steps(&self) -> u64 {
        self.steps
    }
}

/// Adam with decoupled weight decay.
#[derive(Debug, Clone)]
pub struct Adam {
    lr: f64,
    beta1: f64,
    beta2: f64,
    eps: f64,
    weight_decay: f64,
    m: HashMap<String, ArrayD<f64>>,
    v: HashMap<String, ArrayD<f64>>,
    steps: u64,
}

impl Adam {
    pub fn new(lr: f64, betas: (f64, f64), eps: f64, weight_decay: f64) -> Self {
        Self {
            lr,
            beta1: betas.0,
            beta2: betas.1,
            eps,
            weight_decay,
            m: HashMap::new(),
            v: HashMap::new(),
            steps: 0,
        }
    }
}

impl Optimizer for Adam {
    fn name(&self) -> &'static str {
        "adam"
    }

    fn get_lr(&self) -> f64 {
        self.lr
    }

    fn set_lr(&mut self, lr: f64) {
        self.lr = lr;
    }

    fn begin_step(&mut self) {
        self.steps += 1;
    }

    fn update(&mut self, key: &str, mut param: ArrayViewMutD<'_, f64>, grad: ArrayViewD<'_, f64>) {
        let step = self.steps.max(1) as i32;
        let bias_correction1 = 1.0 - self.beta1.powi(step);
        let bias_correction2 = 1.0 - self.beta2.powi(step);
        let (lr, beta1, beta2, eps, decay) = (self.lr, self.beta1, self.beta2, self.eps, self.weight_decay);

        let m = self
            .m
            .entry(key.to_string())
            .or_insert_with(|| ArrayD::zeros(grad.raw_dim()));
        let v = self
            .v
            .entry(key.to_string())
            .or_insert_with(|| ArrayD::zeros(grad.raw_dim()));

        Zip::from(&mut param)
            .and(m)
            .and(v)
            .and(&grad)
            .for_each(|p, m, v, &g| {
                *m = beta1 * *m + (1.0 - beta1) * g;
                *v = beta2 * *v + (1.0 - beta2) * g * g;
                let m_hat = *m / bias_correction1;
                let v_hat = *v / bias_correction2;
                *p -= lr * (m_hat / (v_hat.sqrt() + eps) + decay * *p);
            });
    }

    fn num_steps(&self) -> u64 {
        self.steps
    }
}

/// Learning-rate schedule driven by the number of updates.
pub trait LrScheduler: Send + Sync {
    fn name(&self) -> &'static str;

    /// Learning rate to use after `num_updates` updates.
    fn step_update(&mut self, num_updates: u64) -> f64;

    fn get_lr(&self) -> f64;
}

#[derive(Debug, Clone)]
pub struct FixedSchedule {
    lr: f64,
}

impl FixedSchedule {
    pub fn new(lr: f64) -> Self {
        Self { lr }
    }
}

impl LrScheduler for FixedSchedule {
    fn name(&self) -> &'static str {
        "fixed"
    }

    fn step_update(&mut self, _num_updates: u64) -> f64 {
        self.lr
    }

    fn get_lr(&self) -> f64 {
        self.lr
    }
}

/// Linear warmup, then decay proportional to the inverse square root of the update number.
#[derive(Debug, Clone)]
pub struct InverseSqrtSchedule {
    peak_lr: f64,
    warmup_updates: u64,
    lr: f64,
}

impl InverseSqrtSchedule {
    pub fn new(peak_lr: f64, warmup_updates: u64) -> Self {
        let warmup_updates = warmup_updates.max(1);
        Self {
            peak_lr,
            warmup_updates,
            lr: peak_lr / warmup_updates as f64,
        }
    }
}

impl LrScheduler for InverseSqrtSchedule {
    fn name(&self) -> &'static str {
        "inverse_sqrt"
    }

    fn step_update(&mut self, num_updates: u64) -> f64 {
        let step = num_updates.max(1);
        self.lr = if step < self.warmup_updates {
            self.peak_lr * step as f64 / self.warmup_updates as f64
        } else {
            self.peak_lr * (self.warmup_updates as f64 / step as f64).sqrt()
        };
        self.lr
    }

    fn get_lr(&self) -> f64 {
        self.lr
    }
}

pub fn build_optimizer(hparams: &HParams) -> NaoResult<Box<dyn Optimizer>> {
    match hparams.optimizer.as_str() {
        "sgd" => Ok(Box::new(Sgd::new(hparams.lr, hparams.momentum, hparams.weight_decay))),
        "adam" => Ok(Box::new(Adam::new(
            hparams.lr,
            hparams.adam_betas,
            hparams.adam_eps,
            hparams.weight_decay,
        ))),
        other => Err(config_error!("Unknown optimizer '{}'", other)),
    }
}

pub fn build_lr_scheduler(hparams: &HParams) -> NaoResult<Box<dyn LrScheduler>> {
    match hparams.lr_scheduler.as_str() {
        "fixed" => Ok(Box::new(FixedSchedule::new(hparams.lr))),
        "inverse_sqrt" => Ok(Box::new(InverseSqrtSchedule::new(
            hparams.lr,
            hparams.warmup_updates as u64,
        ))),
        other => Err(config_error!("Unknown lr scheduler '{}'", other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nao_types::NaoError;
    use ndarray::{arr1, Array1};

    #[test]
    fn sgd_descends() {
        let mut param: Array1<f64> = arr1(&[1.0, -1.0]);
        let grad = arr1(&[0.5, -0.5]);
        let mut sgd = Sgd::new(0.1, 0.0, 0.0);
        sgd.begin_step();
        sgd.update("w", param.view_mut().into_dyn(), grad.view().into_dyn());
        assert!((param[0] - 0.95).abs() < 1e-12);
        assert!((param[1] + 0.95).abs() < 1e-12);
    }

    #[test]
    fn sgd_momentum_accumulates() {
        let mut param: Array1<f64> = arr1(&[0.0]);
        let grad = arr1(&[1.0]);
        let mut sgd = Sgd::new(1.0, 0.5, 0.0);
        for _ in 0..2 {
            sgd.begin_step();
            sgd.update("w", param.view_mut().into_dyn(), grad.view().into_dyn());
        }
        // v1 = 1, v2 = 1.5
        assert!((param[0] + 2.5).abs() < 1e-12);
        assert_eq!(sgd.num_steps(), 2);
    }

    #[test]
    fn adam_first_step_is_lr_sized() {
        let mut param: Array1<f64> = arr1(&[0.0, 0.0]);
        let grad = arr1(&[3.0, -0.01]);
        let mut adam = Adam::new(0.1, (0.9, 0.999), 1e-8, 0.0);
        adam.begin_step();
        adam.update("w", param.view_mut().into_dyn(), grad.view().into_dyn());
        assert!((param[0] + 0.1).abs() < 1e-6);
        assert!((param[1] - 0.1).abs() < 1e-6);
    }

    #[test]
    fn inverse_sqrt_warms_up_then_decays() {
        let mut sched = InverseSqrtSchedule::new(1.0, 4);
        assert!((sched.step_update(1) - 0.25).abs() < 1e-12);
        assert!((sched.step_update(4) - 1.0).abs() < 1e-12);
        assert!((sched.step_update(16) - 0.5).abs() < 1e-12);
        assert!((sched.get_lr() - 0.5).abs() < 1e-12);
    }

    #[test]
    fn builders_reject_unknown_names() {
        let mut hparams = HParams::default();
        hparams.optimizer = "lamb".to_string();
        assert!(matches!(build_optimizer(&hparams), Err(NaoError::Config(_))));

        let mut hparams = HParams::default();
        hparams.lr_scheduler = "cosine".to_string();
        assert!(matches!(build_lr_scheduler(&hparams), Err(NaoError::Config(_))));
    }

    #[test]
    fn builders_follow_hparams() {
        let mut hparams = HParams::default();
        hparams.optimizer = "sgd".to_string();
        hparams.lr_scheduler = "fixed".to_string();
        assert_eq!(build_optimizer(&hparams).unwrap().name(), "sgd");
        let mut sched = build_lr_scheduler(&hparams).unwrap();
        assert_eq!(sched.step_update(100), hparams.lr);
    }
}
