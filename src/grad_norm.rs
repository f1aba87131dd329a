//! Global gradient-norm observation and clipping.

use candle_core::{backprop::GradStore, DType};

use crate::error::{LatteError, Result};
use crate::params::ParameterSet;

/// What the governor saw on one step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GradNormReport {
    /// Global L2 norm before any clipping.
    pub norm: f64,
    /// Whether the gradients were rescaled.
    pub clipped: bool,
    /// Parameters that had no gradient and were left out.
    pub skipped: usize,
}

/// Decides when clipping is enforced and applies it.
#[derive(Debug, Clone)]
pub struct GradNormGovernor {
    start_clip_step: u64,
    max_norm: f64,
    error_if_nonfinite: bool,
}

impl GradNormGovernor {
    /// Clip to `max_norm` from `start_clip_step` on.
    #[must_use]
    pub fn new(start_clip_step: u64, max_norm: f64) -> Self {
        Self {
            start_clip_step,
            max_norm,
            error_if_nonfinite: false,
        }
    }

    /// Abort on a NaN or infinite norm instead of reporting it.
    #[must_use]
    pub fn with_error_if_nonfinite(mut self, enabled: bool) -> Self {
        self.error_if_nonfinite = enabled;
        self
    }

    #[must_use]
    pub fn max_norm(&self) -> f64 {
        self.max_norm
    }

    #[must_use]
    pub fn start_clip_step(&self) -> u64 {
        self.start_clip_step
    }

    /// Whether clipping applies at `global_step` (the step about to complete).
    #[must_use]
    pub fn should_enforce(&self, global_step: u64) -> bool {
        global_step >= self.start_clip_step
    }

    /// Observe the norm at `global_step` and clip when enforced.
    pub fn govern(
        &self,
        params: &ParameterSet,
        grads: &mut GradStore,
        global_step: u64,
    ) -> Result<GradNormReport> {
        let enforce = self.should_enforce(global_step);
        let report = observe_and_clip(params, grads, self.max_norm, enforce)?;
        if self.error_if_nonfinite && !report.norm.is_finite() {
            return Err(LatteError::NonFiniteGradient {
                step: global_step,
                value: report.norm,
            });
        }
        Ok(report)
    }
}

/// Global L2 norm over all parameters that have a gradient.
///
/// Accumulated in `f64` regardless of the gradient dtype.
pub fn global_norm(params: &ParameterSet, grads: &GradStore) -> Result<(f64, usize)> {
    let mut sum_sq = 0f64;
    let mut skipped = 0usize;
    for (_, var) in params.named_vars()? {
        match grads.get(var.as_tensor()) {
            Some(g) => {
                sum_sq += g.to_dtype(DType::F64)?.sqr()?.sum_all()?.to_scalar::<f64>()?;
            }
            None => skipped += 1,
        }
    }
    Ok((sum_sq.sqrt(), skipped))
}

/// Compute the global norm and, when `enforce` is set and the norm exceeds
/// `max_norm`, rescale every gradient by `max_norm / norm` in place.
///
/// Parameters without a gradient are excluded and never given one.
pub fn observe_and_clip(
    params: &ParameterSet,
    grads: &mut GradStore,
    max_norm: f64,
    enforce: bool,
) -> Result<GradNormReport> {
    let (norm, skipped) = global_norm(params, grads)?;

    let clipped = enforce && norm.is_finite() && norm > max_norm;
    if clipped {
        let coef = max_norm / norm;
        for (_, var) in params.named_vars()? {
            if let Some(g) = grads.get(var.as_tensor()) {
                let scaled = g.affine(coef, 0.0)?;
                grads.insert(var.as_tensor(), scaled);
            }
        }
    }

    Ok(GradNormReport {
        norm,
        clipped,
        skipped,
    })
}
