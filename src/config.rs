//! Configuration parsing and validation.
//!
//! A run is described by one YAML file with three sections (`model`,
//! `diffusion`, `training`) plus an output directory. Everything the
//! training engine consumes is listed here; missing or zero values that the
//! engine cannot run without are rejected by [`LatteConfig::validate`].

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::diffusion::{BetaSchedule, PredictionTarget};
use crate::error::{LatteError, Result};

/// Main configuration for a training run.
///
/// # Example
///
/// ```rust
/// use latte_rs::LatteConfig;
///
/// # fn main() -> latte_rs::Result<()> {
/// let mut config = LatteConfig::from_preset("tiny")?;
/// config.training.max_train_steps = 20;
/// config.validate()?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LatteConfig {
    /// Model and input layout.
    #[serde(default)]
    pub model: ModelSettings,

    /// Noise schedule and loss target.
    #[serde(default)]
    pub diffusion: DiffusionSettings,

    /// Training hyperparameters.
    pub training: TrainingConfig,

    /// Output directory (checkpoints, metrics).
    #[serde(default = "default_output_dir")]
    pub output_dir: String,
}

fn default_output_dir() -> String {
    "./results".into()
}

/// Model and data-layout settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSettings {
    /// Class-conditional generation. Batches must carry labels when set.
    #[serde(default)]
    pub conditional: bool,

    /// Number of classes for conditional runs.
    #[serde(default)]
    pub num_classes: usize,

    /// Channels of the raw frames.
    #[serde(default = "default_frame_channels")]
    pub frame_channels: usize,

    /// Frames per clip.
    #[serde(default = "default_num_frames")]
    pub num_frames: usize,

    /// Frame height and width in pixels.
    #[serde(default = "default_image_size")]
    pub image_size: usize,

    /// Spatial downsampling of the frame compressor.
    #[serde(default = "default_compression")]
    pub compression: usize,
}

fn default_frame_channels() -> usize {
    3
}
fn default_num_frames() -> usize {
    16
}
fn default_image_size() -> usize {
    256
}
fn default_compression() -> usize {
    8
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            conditional: false,
            num_classes: 0,
            frame_channels: default_frame_channels(),
            num_frames: default_num_frames(),
            image_size: default_image_size(),
            compression: default_compression(),
        }
    }
}

impl ModelSettings {
    /// Side length of the latent grid.
    #[must_use]
    pub fn latent_size(&self) -> usize {
        self.image_size / self.compression.max(1)
    }
}

/// Diffusion process settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiffusionSettings {
    /// Number of discrete timesteps `T`.
    #[serde(default = "default_num_timesteps")]
    pub num_timesteps: usize,

    /// Beta schedule shape.
    #[serde(default)]
    pub beta_schedule: BetaSchedule,

    /// First beta of the linear schedules.
    #[serde(default = "default_beta_start")]
    pub beta_start: f64,

    /// Last beta of the linear schedules.
    #[serde(default = "default_beta_end")]
    pub beta_end: f64,

    /// What the model is trained to predict.
    #[serde(default)]
    pub prediction_target: PredictionTarget,
}

fn default_num_timesteps() -> usize {
    1000
}
fn default_beta_start() -> f64 {
    1e-4
}
fn default_beta_end() -> f64 {
    0.02
}

impl Default for DiffusionSettings {
    fn default() -> Self {
        Self {
            num_timesteps: default_num_timesteps(),
            beta_schedule: BetaSchedule::default(),
            beta_start: default_beta_start(),
            beta_end: default_beta_end(),
            prediction_target: PredictionTarget::default(),
        }
    }
}

/// Training hyperparameters.
///
/// # Example
///
/// ```rust
/// use latte_rs::TrainingConfig;
///
/// let training = TrainingConfig {
///     max_train_steps: 1000,
///     start_clip_step: 100,
///     clip_max_norm: 0.1,
///     ..Default::default()
/// };
///
/// assert_eq!(training.log_every_n_steps, 100);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    /// Total optimizer steps; training stops when `global_step` reaches it.
    pub max_train_steps: u64,

    /// Samples per batch on this worker.
    #[serde(default = "default_batch_size")]
    pub local_batch_size: usize,

    /// Micro-batches accumulated per optimizer step.
    #[serde(default = "default_grad_accum")]
    pub gradient_accumulation_steps: usize,

    /// Target learning rate.
    #[serde(default = "default_lr")]
    pub learning_rate: f64,

    /// Learning rate schedule.
    #[serde(default)]
    pub lr_scheduler: LrScheduler,

    /// Linear warmup length in optimizer steps.
    #[serde(default)]
    pub lr_warmup_steps: u64,

    /// Decoupled weight decay coefficient.
    #[serde(default)]
    pub weight_decay: f64,

    /// Global step from which gradient clipping is enforced.
    #[serde(default)]
    pub start_clip_step: u64,

    /// Maximum global gradient norm once clipping is enforced.
    #[serde(default = "default_clip_max_norm")]
    pub clip_max_norm: f64,

    /// Abort when the gradient norm is NaN or infinite.
    #[serde(default)]
    pub error_if_nonfinite: bool,

    /// EMA decay applied to the shadow parameters after every step.
    #[serde(default = "default_ema_decay")]
    pub ema_decay: f64,

    /// Emit a human-readable log line every N steps.
    #[serde(default = "default_log_every")]
    pub log_every_n_steps: u64,

    /// Save a checkpoint every N steps.
    #[serde(default = "default_ckpt_every")]
    pub checkpoint_every_n_steps: u64,

    /// Full checkpoint to resume from.
    #[serde(default)]
    pub resume_from_checkpoint: Option<String>,

    /// Weights-only (legacy) checkpoint used to initialise the model.
    #[serde(default)]
    pub pretrained: Option<String>,

    /// Global seed; each worker derives its own stream from it.
    #[serde(default = "default_seed")]
    pub seed: u64,
}

fn default_batch_size() -> usize {
    5
}
fn default_grad_accum() -> usize {
    1
}
fn default_lr() -> f64 {
    1e-4
}
fn default_clip_max_norm() -> f64 {
    0.1
}
fn default_ema_decay() -> f64 {
    0.9999
}
fn default_log_every() -> u64 {
    100
}
fn default_ckpt_every() -> u64 {
    10_000
}
fn default_seed() -> u64 {
    3407
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            max_train_steps: 1_000_000,
            local_batch_size: default_batch_size(),
            gradient_accumulation_steps: default_grad_accum(),
            learning_rate: default_lr(),
            lr_scheduler: LrScheduler::default(),
            lr_warmup_steps: 0,
            weight_decay: 0.0,
            start_clip_step: 20_000,
            clip_max_norm: default_clip_max_norm(),
            error_if_nonfinite: false,
            ema_decay: default_ema_decay(),
            log_every_n_steps: default_log_every(),
            checkpoint_every_n_steps: default_ckpt_every(),
            resume_from_checkpoint: None,
            pretrained: None,
            seed: default_seed(),
        }
    }
}

/// Learning rate schedule.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LrScheduler {
    /// Constant learning rate from the first step.
    Constant,
    /// Linear warmup, then constant.
    #[default]
    ConstantWithWarmup,
    /// Linear warmup, then linear decay to zero.
    Linear,
    /// Linear warmup, then cosine decay to zero.
    Cosine,
}

impl LatteConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a YAML file.
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Create a configuration from a preset.
    ///
    /// Available presets:
    /// - `"tiny"` - a few steps on 8x8 clips, for smoke tests
    /// - `"ffs"` - unconditional 16-frame 256px training
    /// - `"ucf101"` - class-conditional 16-frame 256px training
    pub fn from_preset(preset: &str) -> Result<Self> {
        match preset {
            "tiny" => Ok(Self::tiny_preset()),
            "ffs" => Ok(Self::ffs_preset()),
            "ucf101" => Ok(Self::ucf101_preset()),
            _ => Err(LatteError::Config(format!("Unknown preset: {preset}"))),
        }
    }

    /// Small unconditional run that finishes in seconds on CPU.
    #[must_use]
    pub fn tiny_preset() -> Self {
        Self {
            model: ModelSettings {
                num_frames: 4,
                image_size: 8,
                ..Default::default()
            },
            diffusion: DiffusionSettings {
                num_timesteps: 10,
                ..Default::default()
            },
            training: TrainingConfig {
                max_train_steps: 20,
                local_batch_size: 2,
                learning_rate: 1e-3,
                lr_warmup_steps: 2,
                start_clip_step: 10,
                clip_max_norm: 1.0,
                ema_decay: 0.99,
                log_every_n_steps: 5,
                checkpoint_every_n_steps: 10,
                seed: 0,
                ..Default::default()
            },
            output_dir: "./results/tiny".into(),
        }
    }

    /// Unconditional face-forensics style run.
    #[must_use]
    pub fn ffs_preset() -> Self {
        Self {
            model: ModelSettings::default(),
            diffusion: DiffusionSettings::default(),
            training: TrainingConfig::default(),
            output_dir: "./results/ffs".into(),
        }
    }

    /// Class-conditional run over 101 action classes.
    #[must_use]
    pub fn ucf101_preset() -> Self {
        Self {
            model: ModelSettings {
                conditional: true,
                num_classes: 101,
                ..Default::default()
            },
            diffusion: DiffusionSettings::default(),
            training: TrainingConfig::default(),
            output_dir: "./results/ucf101".into(),
        }
    }

    /// Validate the configuration.
    ///
    /// ```rust
    /// use latte_rs::LatteConfig;
    ///
    /// let mut config = LatteConfig::tiny_preset();
    /// config.training.max_train_steps = 0;
    /// assert!(config.validate().is_err());
    /// ```
    pub fn validate(&self) -> Result<()> {
        let t = &self.training;
        if t.max_train_steps == 0 {
            return Err(LatteError::Config("training.max_train_steps must be > 0".into()));
        }
        if t.local_batch_size == 0 {
            return Err(LatteError::Config("training.local_batch_size must be > 0".into()));
        }
        if t.gradient_accumulation_steps == 0 {
            return Err(LatteError::Config(
                "training.gradient_accumulation_steps must be > 0".into(),
            ));
        }
        if !(t.learning_rate.is_finite() && t.learning_rate > 0.0) {
            return Err(LatteError::Config("training.learning_rate must be > 0".into()));
        }
        if !(t.weight_decay.is_finite() && t.weight_decay >= 0.0) {
            return Err(LatteError::Config("training.weight_decay must be >= 0".into()));
        }
        if !(t.clip_max_norm.is_finite() && t.clip_max_norm > 0.0) {
            return Err(LatteError::Config("training.clip_max_norm must be > 0".into()));
        }
        if !(0.0..=1.0).contains(&t.ema_decay) {
            return Err(LatteError::Config(format!(
                "training.ema_decay must be in [0, 1], got {}",
                t.ema_decay
            )));
        }
        if t.log_every_n_steps == 0 {
            return Err(LatteError::Config("training.log_every_n_steps must be > 0".into()));
        }
        if t.checkpoint_every_n_steps == 0 {
            return Err(LatteError::Config(
                "training.checkpoint_every_n_steps must be > 0".into(),
            ));
        }
        if t.lr_warmup_steps > t.max_train_steps {
            return Err(LatteError::Config(
                "training.lr_warmup_steps cannot exceed training.max_train_steps".into(),
            ));
        }

        let d = &self.diffusion;
        if d.num_timesteps == 0 {
            return Err(LatteError::Config("diffusion.num_timesteps must be > 0".into()));
        }

        let m = &self.model;
        if m.conditional && m.num_classes == 0 {
            return Err(LatteError::Config(
                "model.num_classes is required for conditional runs".into(),
            ));
        }
        if m.frame_channels == 0 || m.num_frames == 0 || m.image_size == 0 {
            return Err(LatteError::Config(
                "model.frame_channels, model.num_frames and model.image_size must be > 0".into(),
            ));
        }
        if m.compression == 0 || m.image_size % m.compression != 0 {
            return Err(LatteError::Config(format!(
                "model.image_size ({}) must be divisible by model.compression ({})",
                m.image_size, m.compression
            )));
        }

        if self.output_dir.is_empty() {
            return Err(LatteError::Config("output_dir is required".into()));
        }

        Ok(())
    }
}
