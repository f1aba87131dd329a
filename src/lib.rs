//! # latte-rs
//!
//! Training-iteration engine for latent video diffusion models.
//!
//! Each step compresses a batch of video clips into latents, runs the
//! denoising-diffusion objective on them, updates the model with AdamW and
//! folds the new weights into an exponential moving average used for
//! inference.
//!
//! ## Features
//!
//! - **Explicit step state machine** - every failure names the stage it came from
//! - **Gradient-norm governor** - norm always observed, clipping from a configured step
//! - **EMA shadow weights** - bootstrapped as an exact copy, never aliased with live weights
//! - **Resumable** - full safetensors checkpoints with optimizer and schedule state,
//!   plus partial loading of weights-only exports
//! - **YAML configuration** with presets
//!
//! ## Quick Start (CLI)
//!
//! ```bash
//! # Write a config from a preset
//! latte init config.yaml --preset tiny
//!
//! # Validate and train
//! latte validate config.yaml
//! latte train config.yaml
//!
//! # Look inside a checkpoint
//! latte inspect ./results/tiny/checkpoints/checkpoint-final.safetensors
//! ```
//!
//! ## Quick Start (Library)
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use latte_rs::{
//!     ExecutionContext, LatteConfig, MemoryMetrics, SyntheticVideoSource, TrainerBuilder,
//! };
//!
//! # fn main() -> latte_rs::Result<()> {
//! let config = LatteConfig::from_file("config.yaml")?;
//! let ctx = ExecutionContext::cpu(config.training.seed);
//! let mut source = SyntheticVideoSource::new(
//!     &config.model,
//!     config.training.local_batch_size,
//!     16,
//!     config.training.seed,
//!     ctx.device.clone(),
//! );
//!
//! let metrics = Arc::new(MemoryMetrics::new());
//! let mut trainer = TrainerBuilder::new(config, ctx)
//!     .metrics(metrics.clone())
//!     .build_tiny()?;
//! let outcome = trainer.train(&mut source)?;
//! println!("stopped at step {}", outcome.global_step());
//! # Ok(())
//! # }
//! ```
//!
//! Custom networks implement [`DenoisingModel`] and are created inside the
//! trainer's parameter set with [`TrainerBuilder::build`].

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions, clippy::cast_precision_loss)]

pub mod checkpoint;
pub mod config;
pub mod context;
pub mod coordinator;
pub mod dataset;
pub mod diffusion;
pub mod ema;
pub mod error;
pub mod grad_norm;
pub mod metrics;
pub mod model;
pub mod optimizer;
pub mod params;
pub mod scheduler;
pub mod trainer;

pub use checkpoint::{
    CheckpointKind, CheckpointManager, CheckpointStorage, FsStorage, LoadedCheckpoint,
    MemoryStorage, RestoredState, TrainingSnapshot,
};
pub use config::{DiffusionSettings, LatteConfig, ModelSettings, TrainingConfig};
pub use context::{ExecutionContext, GradientSync, LocalGradientSync, StopFlag};
pub use dataset::{Batch, BatchInput, BatchSource, SyntheticVideoSource};
pub use diffusion::{BetaSchedule, GaussianDiffusion, NoiseSchedule, PredictionTarget};
pub use ema::EmaShadow;
pub use error::{LatteError, Result};
pub use grad_norm::{GradNormGovernor, GradNormReport};
pub use metrics::{JsonlMetrics, MemoryMetrics, MetricsSink, StepMetrics, TracingMetrics};
pub use model::{DenoisingModel, FrameCompressor, PooledFrameCompressor, TinyDenoiser};
pub use params::{LoadReport, ParameterSet};
pub use trainer::{StepStage, TrainOutcome, Trainer, TrainerBuilder, TrainingState};
