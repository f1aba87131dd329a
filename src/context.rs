//! Per-worker execution context, cross-worker gradient sync and cancellation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use candle_core::{backprop::GradStore, Device};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::error::Result;
use crate::params::ParameterSet;

/// Where this worker runs and how it seeds randomness.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub rank: usize,
    pub world_size: usize,
    pub device: Device,
    pub seed: u64,
}

impl ExecutionContext {
    /// Single-process context on `device`.
    #[must_use]
    pub fn single(device: Device, seed: u64) -> Self {
        Self {
            rank: 0,
            world_size: 1,
            device,
            seed,
        }
    }

    /// Single-process CPU context.
    #[must_use]
    pub fn cpu(seed: u64) -> Self {
        Self::single(Device::Cpu, seed)
    }

    /// Rank 0 logs and writes checkpoints.
    #[must_use]
    pub fn is_main_process(&self) -> bool {
        self.rank == 0
    }

    /// Random stream for `global_step` on this rank.
    ///
    /// Depends only on the seed, the rank and the step, so a resumed run
    /// draws the same timesteps and noise as an uninterrupted one.
    #[must_use]
    pub fn step_rng(&self, global_step: u64) -> ChaCha8Rng {
        let mut rng = ChaCha8Rng::seed_from_u64(self.seed.wrapping_add(self.rank as u64));
        rng.set_stream(global_step);
        rng
    }
}

/// Averages gradients across workers.
///
/// Called once per step, after backward and before clipping.
pub trait GradientSync {
    fn sync(&self, params: &ParameterSet, grads: &mut GradStore) -> Result<()>;
}

/// Single-process sync: leaves gradients untouched.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalGradientSync;

impl GradientSync for LocalGradientSync {
    fn sync(&self, _params: &ParameterSet, _grads: &mut GradStore) -> Result<()> {
        Ok(())
    }
}

/// Shared cancellation flag, checked between steps.
#[derive(Debug, Clone, Default)]
pub struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_stop_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}
