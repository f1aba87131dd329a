//! Exponential moving average of model weights.
//!
//! The shadow set is a deep copy of the live parameters that only this module
//! writes. It is never part of a forward or backward pass.

use std::collections::HashMap;

use candle_core::Tensor;

use crate::error::{LatteError, Result};
use crate::params::{LoadReport, ParameterSet};

/// Owner of the shadow parameter set.
#[derive(Debug)]
pub struct EmaShadow {
    shadow: ParameterSet,
}

impl EmaShadow {
    /// Create a shadow that starts exactly equal to `live`.
    pub fn new(live: &ParameterSet) -> Result<Self> {
        let ema = Self {
            shadow: live.deep_copy()?,
        };
        ema.update(live, 0.0)?;
        Ok(ema)
    }

    /// Blend `live` into the shadow: `shadow·d + live·(1 - d)`.
    ///
    /// `decay == 0` copies `live` exactly.
    pub fn update(&self, live: &ParameterSet, decay: f64) -> Result<()> {
        if !(0.0..=1.0).contains(&decay) {
            return Err(LatteError::Config(format!(
                "EMA decay must be in [0, 1], got {decay}"
            )));
        }
        self.shadow.check_compatible(live)?;

        let shadow_vars = self.shadow.named_vars()?;
        let live_vars = live.named_vars()?;
        for ((_, s), (_, l)) in shadow_vars.iter().zip(live_vars.iter()) {
            let l = l.as_tensor().detach();
            let next = if decay == 0.0 {
                l.to_dtype(s.dtype())?
            } else {
                let s_t = s.as_tensor().detach();
                let delta = l.to_dtype(s.dtype())?.sub(&s_t)?;
                s_t.add(&delta.affine(1.0 - decay, 0.0)?)?
            };
            s.set(&next)?;
        }
        Ok(())
    }

    /// Read-only view of the shadow parameters.
    #[must_use]
    pub fn shadow(&self) -> &ParameterSet {
        &self.shadow
    }

    /// Detached copies of the shadow parameters.
    pub fn snapshot(&self) -> Result<Vec<(String, Tensor)>> {
        self.shadow.snapshot()
    }

    /// Fail if [`restore`](Self::restore) would hit a shape mismatch.
    ///
    /// # Errors
    ///
    /// Returns [`LatteError::ShapeMismatch`] for the first mismatched key.
    pub fn check_restore(&self, tensors: &HashMap<String, Tensor>) -> Result<()> {
        self.shadow.check_loadable(tensors)
    }

    /// Overwrite the shadow from checkpointed tensors (partial-load policy).
    pub fn restore(&self, tensors: &HashMap<String, Tensor>) -> Result<LoadReport> {
        self.shadow.load_partial(tensors)
    }

    /// Re-bootstrap the shadow from `live`.
    pub fn resync(&self, live: &ParameterSet) -> Result<()> {
        self.update(live, 0.0)
    }
}
