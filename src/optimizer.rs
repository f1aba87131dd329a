//! AdamW with decoupled weight decay and exportable state.
//!
//! Moments are keyed by parameter name so the optimizer state can be written
//! to a checkpoint and restored onto a freshly built model.

use std::collections::BTreeMap;

use candle_core::{backprop::GradStore, DType, Tensor};

use crate::error::{LatteError, Result};
use crate::params::ParameterSet;

/// Optimizer configuration.
#[derive(Debug, Clone)]
pub struct OptimizerConfig {
    /// Learning rate
    pub learning_rate: f64,
    /// Beta1 for Adam
    pub beta1: f64,
    /// Beta2 for Adam
    pub beta2: f64,
    /// Weight decay
    pub weight_decay: f64,
    /// Epsilon for numerical stability
    pub eps: f64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            learning_rate: 1e-4,
            beta1: 0.9,
            beta2: 0.999,
            weight_decay: 0.0,
            eps: 1e-8,
        }
    }
}

impl OptimizerConfig {
    /// Create an AdamW optimizer with these parameters.
    pub fn build_adamw(&self) -> AdamW {
        AdamW::new(self.clone())
    }
}

/// Exported AdamW state.
#[derive(Debug, Clone, Default)]
pub struct AdamWState {
    /// Number of optimizer steps taken.
    pub t: u64,
    /// Bias-correction counter per parameter: updates that parameter received.
    pub steps: BTreeMap<String, u64>,
    /// First moments by parameter name.
    pub exp_avg: BTreeMap<String, Tensor>,
    /// Second moments by parameter name.
    pub exp_avg_sq: BTreeMap<String, Tensor>,
}

/// AdamW optimizer.
#[derive(Debug)]
pub struct AdamW {
    config: OptimizerConfig,
    lr: f64,
    /// First moment estimates
    m: BTreeMap<String, Tensor>,
    /// Second moment estimates
    v: BTreeMap<String, Tensor>,
    /// Bias-correction counters, one per parameter
    steps: BTreeMap<String, u64>,
    /// Calls to `step`
    t: u64,
}

impl AdamW {
    /// Create a new optimizer with no accumulated state.
    #[must_use]
    pub fn new(config: OptimizerConfig) -> Self {
        Self {
            lr: config.learning_rate,
            config,
            m: BTreeMap::new(),
            v: BTreeMap::new(),
            steps: BTreeMap::new(),
            t: 0,
        }
    }

    /// Apply one update to every parameter that has a gradient.
    ///
    /// Parameters without a gradient keep their value, their moments and
    /// their bias-correction counter, so a parameter first updated at step
    /// `n` is corrected as if it were on its first step.
    ///
    /// # Errors
    ///
    /// Returns an error if a tensor operation fails.
    pub fn step(&mut self, params: &ParameterSet, grads: &GradStore) -> Result<()> {
        self.t += 1;

        let beta1 = self.config.beta1;
        let beta2 = self.config.beta2;

        for (name, var) in params.named_vars()? {
            let Some(grad) = grads.get(var.as_tensor()) else {
                continue;
            };
            let n = self.steps.get(&name).copied().unwrap_or(0) + 1;
            let exp = i32::try_from(n).unwrap_or(i32::MAX);
            let bc1 = 1.0 - beta1.powi(exp);
            let bc2 = 1.0 - beta2.powi(exp);
            let grad = grad.detach().to_dtype(DType::F32)?;
            let w = var.as_tensor().detach();

            let (m, v) = match (self.m.get(&name), self.v.get(&name)) {
                (Some(m), Some(v)) => (m.clone(), v.clone()),
                _ => (grad.zeros_like()?, grad.zeros_like()?),
            };

            // m = b1 * m + (1 - b1) * g
            let m_new = ((m * beta1)? + (&grad * (1.0 - beta1))?)?;
            // v = b2 * v + (1 - b2) * g^2
            let v_new = ((v * beta2)? + (grad.sqr()? * (1.0 - beta2))?)?;

            let m_hat = (&m_new / bc1)?;
            let v_hat = (&v_new / bc2)?;
            let update = ((m_hat / (v_hat.sqrt()? + self.config.eps)?)? * self.lr)?;

            // decoupled decay: w = w - lr * wd * w
            let decay = (&w * (self.lr * self.config.weight_decay))?;
            let update = update.to_dtype(w.dtype())?;
            let new_w = ((&w - &update)? - &decay)?;
            var.set(&new_w)?;

            self.m.insert(name.clone(), m_new);
            self.v.insert(name.clone(), v_new);
            self.steps.insert(name, n);
        }

        Ok(())
    }

    /// Current learning rate.
    #[must_use]
    pub fn learning_rate(&self) -> f64 {
        self.lr
    }

    /// Set learning rate (used by schedulers).
    pub fn set_learning_rate(&mut self, lr: f64) {
        self.lr = lr;
    }

    /// Steps taken so far.
    #[must_use]
    pub fn step_count(&self) -> u64 {
        self.t
    }

    #[must_use]
    pub fn config(&self) -> &OptimizerConfig {
        &self.config
    }

    /// Copy out the step counters and moments.
    ///
    /// # Errors
    ///
    /// Returns an error if a moment tensor cannot be copied.
    pub fn state(&self) -> Result<AdamWState> {
        let copy = |map: &BTreeMap<String, Tensor>| -> Result<BTreeMap<String, Tensor>> {
            map.iter()
                .map(|(k, t)| Ok((k.clone(), t.copy()?)))
                .collect()
        };
        Ok(AdamWState {
            t: self.t,
            steps: self.steps.clone(),
            exp_avg: copy(&self.m)?,
            exp_avg_sq: copy(&self.v)?,
        })
    }

    /// Fail if `state` holds a moment whose shape disagrees with the
    /// parameter of the same name. Nothing is written.
    ///
    /// # Errors
    ///
    /// Returns [`LatteError::ShapeMismatch`] for the first mismatched moment.
    pub fn check_state(state: &AdamWState, params: &ParameterSet) -> Result<()> {
        for (name, var) in params.named_vars()? {
            for moment in [state.exp_avg.get(&name), state.exp_avg_sq.get(&name)]
                .into_iter()
                .flatten()
            {
                if moment.dims() != var.dims() {
                    return Err(LatteError::ShapeMismatch {
                        key: format!("optimizer moment for {name}"),
                        expected: var.dims().to_vec(),
                        got: moment.dims().to_vec(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Replace the step counters and moments.
    ///
    /// Moments for names not in `params` are dropped. A parameter with
    /// moments but no recorded counter is assumed to have been updated on
    /// every one of the `t` steps.
    ///
    /// # Errors
    ///
    /// A moment whose shape disagrees with its parameter fails before any
    /// state is replaced (see [`check_state`](Self::check_state)).
    pub fn load_state(&mut self, state: AdamWState, params: &ParameterSet) -> Result<()> {
        Self::check_state(&state, params)?;

        let mut m = BTreeMap::new();
        let mut v = BTreeMap::new();
        let mut steps = BTreeMap::new();
        for (name, var) in params.named_vars()? {
            let (Some(ea), Some(eas)) = (state.exp_avg.get(&name), state.exp_avg_sq.get(&name))
            else {
                continue;
            };
            let dev = var.device();
            m.insert(name.clone(), ea.to_device(dev)?.to_dtype(DType::F32)?);
            v.insert(name.clone(), eas.to_device(dev)?.to_dtype(DType::F32)?);
            steps.insert(name.clone(), state.steps.get(&name).copied().unwrap_or(state.t));
        }
        self.t = state.t;
        self.m = m;
        self.v = v;
        self.steps = steps;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn one_param(value: f32) -> (ParameterSet, candle_core::Var) {
        let params = ParameterSet::new();
        let var = params
            .insert("w", &Tensor::new(&[value], &Device::Cpu).unwrap())
            .unwrap();
        (params, var)
    }

    fn value(var: &candle_core::Var) -> f32 {
        var.as_tensor().to_vec1::<f32>().unwrap()[0]
    }

    #[test]
    fn test_optimizer_config_default() {
        let config = OptimizerConfig::default();
        assert_eq!(config.learning_rate, 1e-4);
        assert_eq!(config.beta1, 0.9);
        assert_eq!(config.beta2, 0.999);
        assert_eq!(config.weight_decay, 0.0);
    }

    #[test]
    fn test_first_step_moves_by_lr() {
        let (params, var) = one_param(1.0);
        let grads = var.as_tensor().affine(2.0, 0.0).unwrap().sum_all().unwrap().backward().unwrap();

        let mut opt = AdamW::new(OptimizerConfig {
            learning_rate: 0.1,
            ..Default::default()
        });
        opt.step(&params, &grads).unwrap();

        // bias-corrected first step is lr * sign(g)
        assert!((value(&var) - 0.9).abs() < 1e-5);
        assert_eq!(opt.step_count(), 1);
    }

    #[test]
    fn test_zero_lr_leaves_weights_untouched() {
        let (params, var) = one_param(0.123_456_7);
        let grads = var.as_tensor().sqr().unwrap().sum_all().unwrap().backward().unwrap();

        let mut opt = AdamW::new(OptimizerConfig {
            weight_decay: 0.1,
            ..Default::default()
        });
        opt.set_learning_rate(0.0);
        opt.step(&params, &grads).unwrap();
        assert_eq!(value(&var), 0.123_456_7);
    }

    #[test]
    fn test_weight_decay_is_decoupled() {
        let (params, var) = one_param(2.0);
        // an explicit zero gradient: only the decay term acts
        let mut grads = var.as_tensor().sum_all().unwrap().backward().unwrap();
        grads.insert(var.as_tensor(), var.as_tensor().zeros_like().unwrap());

        let mut opt = AdamW::new(OptimizerConfig {
            learning_rate: 0.1,
            weight_decay: 0.5,
            ..Default::default()
        });
        opt.step(&params, &grads).unwrap();
        assert!((value(&var) - (2.0 - 0.1 * 0.5 * 2.0)).abs() < 1e-6);
    }

    #[test]
    fn test_params_without_grads_are_skipped() {
        let params = ParameterSet::new();
        let a = params.insert("a", &Tensor::new(&[1f32], &Device::Cpu).unwrap()).unwrap();
        let b = params.insert("b", &Tensor::new(&[1f32], &Device::Cpu).unwrap()).unwrap();
        let grads = a.as_tensor().sum_all().unwrap().backward().unwrap();

        let mut opt = AdamW::new(OptimizerConfig {
            learning_rate: 0.1,
            weight_decay: 0.1,
            ..Default::default()
        });
        opt.step(&params, &grads).unwrap();

        assert_eq!(value(&b), 1.0);
        let state = opt.state().unwrap();
        assert!(state.exp_avg.contains_key("a"));
        assert!(!state.exp_avg.contains_key("b"));
    }

    #[test]
    fn test_late_parameter_gets_first_step_correction() {
        let params = ParameterSet::new();
        let a = params.insert("a", &Tensor::new(&[1f32], &Device::Cpu).unwrap()).unwrap();
        let b = params.insert("b", &Tensor::new(&[1f32], &Device::Cpu).unwrap()).unwrap();
        let mut opt = AdamW::new(OptimizerConfig {
            learning_rate: 0.1,
            ..Default::default()
        });

        let grads = a.as_tensor().sum_all().unwrap().backward().unwrap();
        opt.step(&params, &grads).unwrap();
        assert_eq!(value(&b), 1.0);

        let loss = a
            .as_tensor()
            .sum_all()
            .unwrap()
            .add(&b.as_tensor().affine(3.0, 0.0).unwrap().sum_all().unwrap())
            .unwrap();
        opt.step(&params, &loss.backward().unwrap()).unwrap();

        // b's first update is lr * sign(g), whatever the global step
        assert!((value(&b) - 0.9).abs() < 1e-5);
        let state = opt.state().unwrap();
        assert_eq!(state.t, 2);
        assert_eq!(state.steps["a"], 2);
        assert_eq!(state.steps["b"], 1);
    }

    #[test]
    fn test_load_state_defaults_missing_counters_to_t() {
        let (params, _) = one_param(1.0);
        let mut state = AdamWState {
            t: 4,
            ..Default::default()
        };
        state
            .exp_avg
            .insert("w".into(), Tensor::zeros(1, DType::F32, &Device::Cpu).unwrap());
        state
            .exp_avg_sq
            .insert("w".into(), Tensor::zeros(1, DType::F32, &Device::Cpu).unwrap());

        let mut opt = AdamW::new(OptimizerConfig::default());
        opt.load_state(state, &params).unwrap();
        assert_eq!(opt.state().unwrap().steps["w"], 4);
    }

    #[test]
    fn test_state_round_trip_continues_identically() {
        let run = |restore_midway: bool| -> f32 {
            let (params, var) = one_param(1.0);
            let mut opt = AdamW::new(OptimizerConfig {
                learning_rate: 0.05,
                ..Default::default()
            });
            for i in 0..4 {
                if restore_midway && i == 2 {
                    let state = opt.state().unwrap();
                    opt = AdamW::new(opt.config().clone());
                    opt.load_state(state, &params).unwrap();
                }
                let grads = var.as_tensor().sqr().unwrap().sum_all().unwrap().backward().unwrap();
                opt.step(&params, &grads).unwrap();
            }
            value(&var)
        };
        assert_eq!(run(false), run(true));
    }

    #[test]
    fn test_load_state_shape_mismatch() {
        let (params, _) = one_param(1.0);
        let mut state = AdamWState {
            t: 3,
            ..Default::default()
        };
        state
            .exp_avg
            .insert("w".into(), Tensor::zeros(2, DType::F32, &Device::Cpu).unwrap());
        state
            .exp_avg_sq
            .insert("w".into(), Tensor::zeros(2, DType::F32, &Device::Cpu).unwrap());

        assert!(matches!(
            AdamW::check_state(&state, &params),
            Err(LatteError::ShapeMismatch { .. })
        ));
        let mut opt = AdamW::new(OptimizerConfig::default());
        assert!(matches!(
            opt.load_state(state, &params),
            Err(LatteError::ShapeMismatch { .. })
        ));
        assert_eq!(opt.step_count(), 0);
    }
}
