//! Scoped swap of the trainer's model, optimizer and LR scheduler.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use nao_model::{LrScheduler, Optimizer, TranslationModel};
use tracing::info;

/// What the training loop reads and updates.
pub struct TrainContext {
    pub model: Arc<dyn TranslationModel>,
    pub optimizer: Box<dyn Optimizer>,
    pub lr_scheduler: Box<dyn LrScheduler>,
}

impl TrainContext {
    pub fn new(
        model: Arc<dyn TranslationModel>,
        optimizer: Box<dyn Optimizer>,
        lr_scheduler: Box<dyn LrScheduler>,
    ) -> Self {
        Self {
            model,
            optimizer,
            lr_scheduler,
        }
    }
}

struct Saved {
    model: Arc<dyn TranslationModel>,
    training: Option<(Box<dyn Optimizer>, Box<dyn LrScheduler>)>,
}

/// Installs a child into a [`TrainContext`] and puts the previous state back
/// when dropped, whether the scope returns normally, early or by unwinding.
pub struct ChildEnvGuard<'a> {
    context: &'a mut TrainContext,
    saved: Option<Saved>,
}

impl<'a> ChildEnvGuard<'a> {
    /// Swap in a child together with its own optimizer and scheduler.
    pub fn train(
        context: &'a mut TrainContext,
        model: Arc<dyn TranslationModel>,
        optimizer: Box<dyn Optimizer>,
        lr_scheduler: Box<dyn LrScheduler>,
    ) -> Self {
        info!("Creating child train environment");
        info!("Child optimizer: {}", optimizer.name());
        info!("Child LR scheduler: {}", lr_scheduler.name());
        let saved = Saved {
            model: std::mem::replace(&mut context.model, model),
            training: Some((
                std::mem::replace(&mut context.optimizer, optimizer),
                std::mem::replace(&mut context.lr_scheduler, lr_scheduler),
            )),
        };
        Self {
            context,
            saved: Some(saved),
        }
    }

    /// Swap in a child for evaluation; optimizer and scheduler stay put.
    pub fn eval(context: &'a mut TrainContext, model: Arc<dyn TranslationModel>) -> Self {
        info!("Creating child valid environment");
        let saved = Saved {
            model: std::mem::replace(&mut context.model, model),
            training: None,
        };
        Self {
            context,
            saved: Some(saved),
        }
    }
}

impl Deref for ChildEnvGuard<'_> {
    type Target = TrainContext;

    fn deref(&self) -> &TrainContext {
        self.context
    }
}

impl DerefMut for ChildEnvGuard<'_> {
    fn deref_mut(&mut self) -> &mut TrainContext {
        self.context
    }
}

impl Drop for ChildEnvGuard<'_> {
    fn drop(&mut self) {
        if let Some(saved) = self.saved.take() {
            self.context.model = saved.model;
            if let Some((optimizer, lr_scheduler)) = saved.training {
                self.context.optimizer = optimizer;
                self.context.lr_scheduler = lr_scheduler;
            }
            info!("Trainer restored");
        }
    }
}
