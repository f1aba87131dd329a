//! Gaussian diffusion: the noise schedule and the training loss.
//!
//! The schedule tables are computed once in `f64` and never change. The loss
//! noises a clean latent batch to a random timestep, asks the model for a
//! prediction and returns the per-sample mean squared error against the
//! configured target.

use candle_core::{DType, Device, Tensor, D};
use rand::Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};

use crate::config::DiffusionSettings;
use crate::error::{LatteError, Result};
use crate::model::DenoisingModel;

/// Shape of the beta schedule.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BetaSchedule {
    /// Evenly spaced betas from `beta_start` to `beta_end`.
    #[default]
    Linear,
    /// Evenly spaced square roots, squared.
    ScaledLinear,
    /// Squared-cosine `alpha_bar`, betas capped at 0.999.
    Cosine,
}

/// Quantity the model is trained to predict.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PredictionTarget {
    /// The injected noise.
    #[default]
    Epsilon,
    /// The clean latent.
    Sample,
    /// `sqrt(a)·noise - sqrt(1-a)·x0`.
    Velocity,
}

/// Precomputed per-timestep coefficients.
#[derive(Debug, Clone)]
pub struct NoiseSchedule {
    betas: Vec<f64>,
    alphas_cumprod: Vec<f64>,
    sqrt_alphas_cumprod: Vec<f64>,
    sqrt_one_minus_alphas_cumprod: Vec<f64>,
}

impl NoiseSchedule {
    /// Build the tables for `settings.num_timesteps` steps.
    ///
    /// Fails if the step count is zero or any beta falls outside `(0, 1]`.
    pub fn new(settings: &DiffusionSettings) -> Result<Self> {
        let steps = settings.num_timesteps;
        if steps == 0 {
            return Err(LatteError::Config("diffusion.num_timesteps must be > 0".into()));
        }

        let betas = match settings.beta_schedule {
            BetaSchedule::Linear => linspace(settings.beta_start, settings.beta_end, steps),
            BetaSchedule::ScaledLinear => {
                linspace(settings.beta_start.sqrt(), settings.beta_end.sqrt(), steps)
                    .into_iter()
                    .map(|b| b * b)
                    .collect()
            }
            BetaSchedule::Cosine => cosine_betas(steps, 0.999),
        };
        Self::from_betas(betas)
    }

    /// Build the tables from an explicit beta sequence.
    pub fn from_betas(betas: Vec<f64>) -> Result<Self> {
        if betas.is_empty() {
            return Err(LatteError::Config("beta schedule is empty".into()));
        }
        if let Some((i, b)) = betas
            .iter()
            .enumerate()
            .find(|(_, b)| !(b.is_finite() && **b > 0.0 && **b <= 1.0))
        {
            return Err(LatteError::Config(format!(
                "beta[{i}] = {b} is outside (0, 1]"
            )));
        }

        let mut alphas_cumprod = Vec::with_capacity(betas.len());
        let mut acc = 1.0;
        for b in &betas {
            acc *= 1.0 - b;
            alphas_cumprod.push(acc);
        }
        let sqrt_alphas_cumprod = alphas_cumprod.iter().map(|a| a.sqrt()).collect();
        let sqrt_one_minus_alphas_cumprod =
            alphas_cumprod.iter().map(|a| (1.0 - a).sqrt()).collect();

        Ok(Self {
            betas,
            alphas_cumprod,
            sqrt_alphas_cumprod,
            sqrt_one_minus_alphas_cumprod,
        })
    }

    /// Number of timesteps `T`.
    #[must_use]
    pub fn num_timesteps(&self) -> usize {
        self.betas.len()
    }

    pub fn betas(&self) -> &[f64] {
        &self.betas
    }

    pub fn alphas_cumprod(&self) -> &[f64] {
        &self.alphas_cumprod
    }

    pub fn sqrt_alphas_cumprod(&self) -> &[f64] {
        &self.sqrt_alphas_cumprod
    }

    pub fn sqrt_one_minus_alphas_cumprod(&self) -> &[f64] {
        &self.sqrt_one_minus_alphas_cumprod
    }
}

fn linspace(start: f64, end: f64, n: usize) -> Vec<f64> {
    if n == 1 {
        return vec![start];
    }
    let step = (end - start) / (n - 1) as f64;
    (0..n).map(|i| start + step * i as f64).collect()
}

fn cosine_betas(n: usize, max_beta: f64) -> Vec<f64> {
    let alpha_bar = |t: f64| ((t + 0.008) / 1.008 * std::f64::consts::FRAC_PI_2).cos().powi(2);
    (0..n)
        .map(|i| {
            let t1 = i as f64 / n as f64;
            let t2 = (i + 1) as f64 / n as f64;
            (1.0 - alpha_bar(t2) / alpha_bar(t1)).min(max_beta)
        })
        .collect()
}

/// Training-time view of the diffusion process.
#[derive(Debug, Clone)]
pub struct GaussianDiffusion {
    schedule: NoiseSchedule,
    target: PredictionTarget,
}

impl GaussianDiffusion {
    /// Create the process from configuration.
    pub fn new(settings: &DiffusionSettings) -> Result<Self> {
        Ok(Self {
            schedule: NoiseSchedule::new(settings)?,
            target: settings.prediction_target,
        })
    }

    /// Create the process from an existing schedule.
    #[must_use]
    pub fn with_schedule(schedule: NoiseSchedule, target: PredictionTarget) -> Self {
        Self { schedule, target }
    }

    #[must_use]
    pub fn schedule(&self) -> &NoiseSchedule {
        &self.schedule
    }

    #[must_use]
    pub fn target(&self) -> PredictionTarget {
        self.target
    }

    /// Draw `batch` timesteps uniformly from `[0, T)`.
    pub fn sample_timesteps<R: Rng + ?Sized>(
        &self,
        batch: usize,
        rng: &mut R,
        device: &Device,
    ) -> Result<Tensor> {
        let n = self.schedule.num_timesteps() as u32;
        let t: Vec<u32> = (0..batch).map(|_| rng.gen_range(0..n)).collect();
        Ok(Tensor::from_vec(t, batch, device)?)
    }

    /// Standard Gaussian noise shaped like `like`.
    pub fn sample_noise<R: Rng + ?Sized>(&self, like: &Tensor, rng: &mut R) -> Result<Tensor> {
        let values: Vec<f32> = (0..like.elem_count())
            .map(|_| rng.sample::<f32, _>(StandardNormal))
            .collect();
        let noise = Tensor::from_vec(values, like.shape(), like.device())?;
        Ok(noise.to_dtype(like.dtype())?)
    }

    /// Forward-noise `x0` to timestep `t`.
    pub fn q_sample(&self, x0: &Tensor, t: &Tensor, noise: &Tensor) -> Result<Tensor> {
        let a = self.gather(self.schedule.sqrt_alphas_cumprod(), t, x0)?;
        let s = self.gather(self.schedule.sqrt_one_minus_alphas_cumprod(), t, x0)?;
        Ok(x0.broadcast_mul(&a)?.add(&noise.broadcast_mul(&s)?)?)
    }

    /// Per-sample training loss, shape `[B]`.
    ///
    /// `noise` is drawn from `rng` when not supplied.
    pub fn training_losses<M, R>(
        &self,
        model: &M,
        x0: &Tensor,
        t: &Tensor,
        cond: Option<&Tensor>,
        noise: Option<&Tensor>,
        rng: &mut R,
    ) -> Result<Tensor>
    where
        M: DenoisingModel + ?Sized,
        R: Rng + ?Sized,
    {
        let (batch, _frames, channels, _h, _w) = x0.dims5()?;
        if t.dims() != [batch] {
            return Err(LatteError::MalformedBatch(format!(
                "expected {batch} timesteps, got shape {:?}",
                t.dims()
            )));
        }

        let noise = match noise {
            Some(n) => {
                if n.dims() != x0.dims() {
                    return Err(LatteError::MalformedBatch(format!(
                        "noise shape {:?} does not match latents {:?}",
                        n.dims(),
                        x0.dims()
                    )));
                }
                n.clone()
            }
            None => self.sample_noise(x0, rng)?,
        };

        let x_t = self.q_sample(x0, t, &noise)?;
        let mut pred = model.forward(&x_t, t, cond)?;

        // learned-sigma models emit 2C channels; only the mean enters the loss
        if pred.rank() == 5 && pred.dim(2)? == 2 * channels {
            pred = pred.narrow(2, 0, channels)?;
        }

        let target = match self.target {
            PredictionTarget::Epsilon => noise,
            PredictionTarget::Sample => x0.clone(),
            PredictionTarget::Velocity => {
                let a = self.gather(self.schedule.sqrt_alphas_cumprod(), t, x0)?;
                let s = self.gather(self.schedule.sqrt_one_minus_alphas_cumprod(), t, x0)?;
                noise.broadcast_mul(&a)?.sub(&x0.broadcast_mul(&s)?)?
            }
        };

        if pred.dims() != target.dims() {
            return Err(LatteError::MalformedBatch(format!(
                "model output {:?} does not match target {:?}",
                pred.dims(),
                target.dims()
            )));
        }

        let loss = pred.sub(&target)?.sqr()?.flatten_from(1)?.mean(D::Minus1)?;
        Ok(loss)
    }

    /// Per-sample coefficients shaped `[B,1,1,1,1]` in the dtype of `like`.
    fn gather(&self, table: &[f64], t: &Tensor, like: &Tensor) -> Result<Tensor> {
        let idx = t.to_dtype(DType::U32)?.to_vec1::<u32>()?;
        let mut values = Vec::with_capacity(idx.len());
        for i in idx {
            let v = table.get(i as usize).ok_or_else(|| {
                LatteError::MalformedBatch(format!(
                    "timestep {i} outside [0, {})",
                    table.len()
                ))
            })?;
            values.push(*v as f32);
        }
        let n = values.len();
        let coeff = Tensor::from_vec(values, (n, 1, 1, 1, 1), like.device())?;
        Ok(coeff.to_dtype(like.dtype())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    struct Identity;

    impl DenoisingModel for Identity {
        fn forward(&self, x: &Tensor, _t: &Tensor, _cond: Option<&Tensor>) -> Result<Tensor> {
            Ok(x.clone())
        }
    }

    struct Zero;

    impl DenoisingModel for Zero {
        fn forward(&self, x: &Tensor, _t: &Tensor, _cond: Option<&Tensor>) -> Result<Tensor> {
            Ok(x.zeros_like()?)
        }
    }

    struct Doubled;

    impl DenoisingModel for Doubled {
        fn forward(&self, x: &Tensor, _t: &Tensor, _cond: Option<&Tensor>) -> Result<Tensor> {
            Ok(Tensor::cat(&[x, &x.zeros_like()?], 2)?)
        }
    }

    fn settings(schedule: BetaSchedule, steps: usize) -> DiffusionSettings {
        DiffusionSettings {
            num_timesteps: steps,
            beta_schedule: schedule,
            ..Default::default()
        }
    }

    #[test]
    fn test_linear_schedule_endpoints() {
        let schedule = NoiseSchedule::new(&settings(BetaSchedule::Linear, 1000)).unwrap();
        assert_eq!(schedule.num_timesteps(), 1000);
        assert!((schedule.betas()[0] - 1e-4).abs() < 1e-12);
        assert!((schedule.betas()[999] - 0.02).abs() < 1e-12);

        let ac = schedule.alphas_cumprod();
        assert!(ac.windows(2).all(|w| w[1] < w[0]));
        for i in 0..1000 {
            let a = schedule.sqrt_alphas_cumprod()[i];
            let s = schedule.sqrt_one_minus_alphas_cumprod()[i];
            assert!((a * a + s * s - 1.0).abs() < 1e-12);
        }
    }

    #[test]
    fn test_all_schedules_are_valid() {
        for kind in [BetaSchedule::Linear, BetaSchedule::ScaledLinear, BetaSchedule::Cosine] {
            let schedule = NoiseSchedule::new(&settings(kind, 10)).unwrap();
            assert!(schedule.betas().iter().all(|b| *b > 0.0 && *b <= 1.0));
        }
        let cosine = NoiseSchedule::new(&settings(BetaSchedule::Cosine, 1000)).unwrap();
        assert!(cosine.betas().iter().all(|b| *b <= 0.999));
    }

    #[test]
    fn test_invalid_betas_rejected() {
        assert!(NoiseSchedule::from_betas(vec![0.1, 0.0]).is_err());
        assert!(NoiseSchedule::from_betas(vec![1.5]).is_err());
        assert!(NoiseSchedule::from_betas(vec![]).is_err());

        let mut bad = settings(BetaSchedule::Linear, 10);
        bad.beta_start = -0.1;
        assert!(NoiseSchedule::new(&bad).is_err());
    }

    #[test]
    fn test_sample_timesteps_in_range() {
        let diffusion = GaussianDiffusion::new(&settings(BetaSchedule::Linear, 10)).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let t = diffusion
            .sample_timesteps(256, &mut rng, &Device::Cpu)
            .unwrap()
            .to_vec1::<u32>()
            .unwrap();
        assert_eq!(t.len(), 256);
        assert!(t.iter().all(|v| *v < 10));
        assert!(t.iter().any(|v| *v != t[0]));
    }

    #[test]
    fn test_epsilon_loss_matches_formula() {
        let diffusion = GaussianDiffusion::new(&settings(BetaSchedule::Linear, 10)).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let x0 = Tensor::ones((2, 1, 1, 1, 2), DType::F32, &Device::Cpu).unwrap();
        let noise = Tensor::zeros((2, 1, 1, 1, 2), DType::F32, &Device::Cpu).unwrap();
        let t = Tensor::new(&[0u32, 9], &Device::Cpu).unwrap();

        let loss = diffusion
            .training_losses(&Identity, &x0, &t, None, Some(&noise), &mut rng)
            .unwrap()
            .to_vec1::<f32>()
            .unwrap();

        // prediction is x_t = sqrt(a)·1, target is 0
        for (i, step) in [0usize, 9].iter().enumerate() {
            let expected = diffusion.schedule().alphas_cumprod()[*step] as f32;
            assert!((loss[i] - expected).abs() < 1e-5);
        }
    }

    #[test]
    fn test_sample_target() {
        let settings = DiffusionSettings {
            num_timesteps: 10,
            prediction_target: PredictionTarget::Sample,
            ..Default::default()
        };
        let diffusion = GaussianDiffusion::new(&settings).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(2);
        let x0 = Tensor::ones((1, 2, 1, 2, 2), DType::F32, &Device::Cpu).unwrap();
        let noise = x0.zeros_like().unwrap();
        let t = Tensor::new(&[4u32], &Device::Cpu).unwrap();

        let loss = diffusion
            .training_losses(&Identity, &x0, &t, None, Some(&noise), &mut rng)
            .unwrap()
            .to_vec1::<f32>()
            .unwrap();
        let a = diffusion.schedule().sqrt_alphas_cumprod()[4] as f32;
        assert!((loss[0] - (a - 1.0).powi(2)).abs() < 1e-5);
    }

    #[test]
    fn test_velocity_target() {
        let settings = DiffusionSettings {
            num_timesteps: 10,
            prediction_target: PredictionTarget::Velocity,
            ..Default::default()
        };
        let diffusion = GaussianDiffusion::new(&settings).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(4);
        let x0 = Tensor::ones((2, 1, 2, 2, 2), DType::F32, &Device::Cpu).unwrap();
        let noise = x0.affine(0.5, 0.0).unwrap();
        let t = Tensor::new(&[2u32, 7], &Device::Cpu).unwrap();

        // a zero prediction leaves the squared target: (sqrt(a)·0.5 - sqrt(1-a)·1)^2
        let loss = diffusion
            .training_losses(&Zero, &x0, &t, None, Some(&noise), &mut rng)
            .unwrap()
            .to_vec1::<f32>()
            .unwrap();
        for (i, step) in [2usize, 7].iter().enumerate() {
            let a = diffusion.schedule().sqrt_alphas_cumprod()[*step];
            let s = diffusion.schedule().sqrt_one_minus_alphas_cumprod()[*step];
            let expected = (a * 0.5 - s).powi(2) as f32;
            assert!(
                (loss[i] - expected).abs() < 1e-5,
                "t={step}: {} vs {expected}",
                loss[i]
            );
        }
    }

    #[test]
    fn test_learned_sigma_uses_first_half() {
        let diffusion = GaussianDiffusion::new(&settings(BetaSchedule::Linear, 10)).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let x0 = Tensor::ones((2, 2, 3, 2, 2), DType::F32, &Device::Cpu).unwrap();
        let noise = x0.zeros_like().unwrap();
        let t = Tensor::new(&[3u32, 3], &Device::Cpu).unwrap();

        let plain = diffusion
            .training_losses(&Identity, &x0, &t, None, Some(&noise), &mut rng)
            .unwrap();
        let doubled = diffusion
            .training_losses(&Doubled, &x0, &t, None, Some(&noise), &mut rng)
            .unwrap();
        assert_eq!(
            plain.to_vec1::<f32>().unwrap(),
            doubled.to_vec1::<f32>().unwrap()
        );
    }

    #[test]
    fn test_drawn_noise_is_seeded() {
        let diffusion = GaussianDiffusion::new(&settings(BetaSchedule::Linear, 10)).unwrap();
        let x0 = Tensor::zeros((1, 1, 1, 4, 4), DType::F32, &Device::Cpu).unwrap();
        let a = diffusion
            .sample_noise(&x0, &mut ChaCha8Rng::seed_from_u64(7))
            .unwrap();
        let b = diffusion
            .sample_noise(&x0, &mut ChaCha8Rng::seed_from_u64(7))
            .unwrap();
        assert_eq!(
            a.flatten_all().unwrap().to_vec1::<f32>().unwrap(),
            b.flatten_all().unwrap().to_vec1::<f32>().unwrap()
        );
    }

    #[test]
    fn test_timestep_count_mismatch() {
        let diffusion = GaussianDiffusion::new(&settings(BetaSchedule::Linear, 10)).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let x0 = Tensor::zeros((2, 1, 1, 2, 2), DType::F32, &Device::Cpu).unwrap();
        let t = Tensor::new(&[1u32], &Device::Cpu).unwrap();
        let err = diffusion
            .training_losses(&Identity, &x0, &t, None, None, &mut rng)
            .unwrap_err();
        assert!(matches!(err, LatteError::MalformedBatch(_)));
    }
}
