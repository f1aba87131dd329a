//! Keeps the optimizer's learning rate in lockstep with the schedule.

use candle_core::backprop::GradStore;

use crate::config::TrainingConfig;
use crate::error::Result;
use crate::optimizer::{AdamW, AdamWState, OptimizerConfig};
use crate::params::ParameterSet;
use crate::scheduler::{LRScheduler, SchedulerState, SchedulerType};

/// AdamW plus its learning-rate schedule.
///
/// Every [`step`](Self::step) uses the schedule value for the current step,
/// then advances the schedule by one.
#[derive(Debug)]
pub struct OptimizerCoordinator {
    optimizer: AdamW,
    scheduler: LRScheduler,
}

impl OptimizerCoordinator {
    #[must_use]
    pub fn new(optimizer: AdamW, scheduler: LRScheduler) -> Self {
        Self {
            optimizer,
            scheduler,
        }
    }

    /// Build from training configuration.
    #[must_use]
    pub fn from_config(config: &TrainingConfig) -> Self {
        let optimizer = OptimizerConfig {
            learning_rate: config.learning_rate,
            weight_decay: config.weight_decay,
            ..Default::default()
        }
        .build_adamw();
        let scheduler = LRScheduler::new(SchedulerType::from_config(config), config.learning_rate);
        Self::new(optimizer, scheduler)
    }

    /// Apply one optimizer step at the scheduled rate. Returns the rate used.
    ///
    /// # Errors
    ///
    /// Returns an error if the AdamW update fails.
    pub fn step(&mut self, params: &ParameterSet, grads: &GradStore) -> Result<f64> {
        self.scheduler.apply(&mut self.optimizer);
        let lr = self.optimizer.learning_rate();
        self.optimizer.step(params, grads)?;
        self.scheduler.step(&mut self.optimizer);
        Ok(lr)
    }

    /// Rate the next step will use.
    #[must_use]
    pub fn current_lr(&self) -> f64 {
        self.scheduler.get_lr()
    }

    #[must_use]
    pub fn optimizer(&self) -> &AdamW {
        &self.optimizer
    }

    #[must_use]
    pub fn scheduler(&self) -> &LRScheduler {
        &self.scheduler
    }

    pub fn optimizer_state(&self) -> Result<AdamWState> {
        self.optimizer.state()
    }

    #[must_use]
    pub fn scheduler_state(&self) -> SchedulerState {
        self.scheduler.state()
    }

    /// Restore both states exactly.
    ///
    /// # Errors
    ///
    /// Returns [`LatteError::ShapeMismatch`](crate::LatteError::ShapeMismatch)
    /// if a moment disagrees with its parameter. Neither state is changed then.
    pub fn load_state(
        &mut self,
        optimizer: AdamWState,
        scheduler: SchedulerState,
        params: &ParameterSet,
    ) -> Result<()> {
        self.optimizer.load_state(optimizer, params)?;
        self.scheduler.load_state(scheduler);
        self.scheduler.apply(&mut self.optimizer);
        Ok(())
    }
}
