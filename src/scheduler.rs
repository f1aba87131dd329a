//! Learning rate schedulers.
//!
//! The learning rate is a pure function of the scheduler's step counter,
//! which the trainer keeps equal to `global_step`.

use serde::{Deserialize, Serialize};

use crate::config::{LrScheduler, TrainingConfig};
use crate::optimizer::AdamW;

/// Learning rate scheduler types.
#[derive(Debug, Clone, PartialEq)]
pub enum SchedulerType {
    /// Constant learning rate
    Constant,
    /// Linear warmup then constant
    ConstantWithWarmup {
        /// Number of warmup steps
        warmup_steps: u64,
    },
    /// Linear warmup then linear decay
    Linear {
        /// Number of warmup steps
        warmup_steps: u64,
        /// Total number of training steps
        total_steps: u64,
    },
    /// Cosine annealing with warmup
    Cosine {
        /// Number of warmup steps
        warmup_steps: u64,
        /// Total number of training steps
        total_steps: u64,
    },
}

impl SchedulerType {
    /// Scheduler described by the training configuration.
    #[must_use]
    pub fn from_config(config: &TrainingConfig) -> Self {
        let warmup_steps = config.lr_warmup_steps;
        let total_steps = config.max_train_steps;
        match config.lr_scheduler {
            LrScheduler::Constant => Self::Constant,
            LrScheduler::ConstantWithWarmup => Self::ConstantWithWarmup { warmup_steps },
            LrScheduler::Linear => Self::Linear {
                warmup_steps,
                total_steps,
            },
            LrScheduler::Cosine => Self::Cosine {
                warmup_steps,
                total_steps,
            },
        }
    }
}

/// Serializable scheduler position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerState {
    /// Steps taken so far.
    pub current_step: u64,
}

/// Learning rate scheduler.
#[derive(Debug, Clone)]
pub struct LRScheduler {
    /// Scheduler type
    scheduler_type: SchedulerType,
    /// Base learning rate
    base_lr: f64,
    /// Current step
    current_step: u64,
}

impl LRScheduler {
    /// Create a new scheduler.
    #[must_use]
    pub fn new(scheduler_type: SchedulerType, base_lr: f64) -> Self {
        Self {
            scheduler_type,
            base_lr,
            current_step: 0,
        }
    }

    /// Get learning rate for current step.
    #[must_use]
    pub fn get_lr(&self) -> f64 {
        match &self.scheduler_type {
            SchedulerType::Constant => self.base_lr,

            SchedulerType::ConstantWithWarmup { warmup_steps } => {
                self.warmup(*warmup_steps).unwrap_or(self.base_lr)
            }

            SchedulerType::Linear {
                warmup_steps,
                total_steps,
            } => self.linear_schedule(*warmup_steps, *total_steps),

            SchedulerType::Cosine {
                warmup_steps,
                total_steps,
            } => self.cosine_schedule(*warmup_steps, *total_steps),
        }
    }

    /// Set the optimizer to the learning rate of the current step.
    pub fn apply(&self, optimizer: &mut AdamW) {
        optimizer.set_learning_rate(self.get_lr());
    }

    /// Step the scheduler and update optimizer.
    pub fn step(&mut self, optimizer: &mut AdamW) {
        self.current_step += 1;
        optimizer.set_learning_rate(self.get_lr());
    }

    #[must_use]
    pub fn current_step(&self) -> u64 {
        self.current_step
    }

    #[must_use]
    pub fn scheduler_type(&self) -> &SchedulerType {
        &self.scheduler_type
    }

    #[must_use]
    pub fn state(&self) -> SchedulerState {
        SchedulerState {
            current_step: self.current_step,
        }
    }

    pub fn load_state(&mut self, state: SchedulerState) {
        self.current_step = state.current_step;
    }

    /// Linear warmup from 0, or `None` once warmup is over.
    fn warmup(&self, warmup_steps: u64) -> Option<f64> {
        (self.current_step < warmup_steps)
            .then(|| self.base_lr * (self.current_step as f64 / warmup_steps as f64))
    }

    fn decay_progress(&self, warmup_steps: u64, total_steps: u64) -> f64 {
        let span = total_steps.saturating_sub(warmup_steps).max(1);
        (self.current_step - warmup_steps) as f64 / span as f64
    }

    /// Linear warmup then linear decay.
    fn linear_schedule(&self, warmup_steps: u64, total_steps: u64) -> f64 {
        self.warmup(warmup_steps).unwrap_or_else(|| {
            let progress = self.decay_progress(warmup_steps, total_steps);
            self.base_lr * (1.0 - progress).max(0.0)
        })
    }

    /// Cosine annealing with linear warmup.
    fn cosine_schedule(&self, warmup_steps: u64, total_steps: u64) -> f64 {
        self.warmup(warmup_steps).unwrap_or_else(|| {
            let progress = self.decay_progress(warmup_steps, total_steps).min(1.0);
            let cosine_decay = 0.5 * (1.0 + (std::f64::consts::PI * progress).cos());
            self.base_lr * cosine_decay
        })
    }
}
