//! Training loop.
//!
//! [`Trainer::train_step`] runs one optimizer step as an explicit sequence of
//! stages:
//!
//! ```text
//! Idle -> Encoding -> LossComputation -> Backward -> Clipping
//!      -> OptimizerStep -> EmaUpdate -> Logged -> Idle
//! ```
//!
//! and [`Trainer::train`] repeats it until `global_step == max_train_steps`,
//! handling resume, checkpoint cadence and cancellation between steps.
//! Nothing is retried: any failure is returned wrapped in
//! [`LatteError::Step`] with the stage it came from.

use std::sync::Arc;

use candle_core::{backprop::GradStore, DType, Tensor};
use candle_nn::VarBuilder;
use indicatif::{ProgressBar, ProgressStyle};
use serde::{Deserialize, Serialize};

use crate::checkpoint::{
    checkpoint_key, CheckpointKind, CheckpointManager, CheckpointStorage, FsStorage,
    LoadedCheckpoint, RestoredState, TrainingSnapshot, FINAL_CHECKPOINT,
};
use crate::config::LatteConfig;
use crate::context::{ExecutionContext, GradientSync, LocalGradientSync, StopFlag};
use crate::coordinator::OptimizerCoordinator;
use crate::dataset::{Batch, BatchInput, BatchSource, EpochIter};
use crate::diffusion::GaussianDiffusion;
use crate::ema::EmaShadow;
use crate::error::{LatteError, Result};
use crate::grad_norm::GradNormGovernor;
use crate::metrics::{MetricsSink, StepMetrics, TracingMetrics};
use crate::model::{DenoisingModel, FrameCompressor, PooledFrameCompressor, TinyDenoiser, LATENT_SCALE};
use crate::optimizer::AdamW;
use crate::params::ParameterSet;

/// Position in the per-step state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepStage {
    Idle,
    Encoding,
    LossComputation,
    Backward,
    Clipping,
    OptimizerStep,
    EmaUpdate,
    Logged,
    /// `max_train_steps` reached; no more batches are pulled.
    Terminal,
}

impl std::fmt::Display for StepStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            StepStage::Idle => "idle",
            StepStage::Encoding => "encoding",
            StepStage::LossComputation => "loss computation",
            StepStage::Backward => "backward",
            StepStage::Clipping => "clipping",
            StepStage::OptimizerStep => "optimizer step",
            StepStage::EmaUpdate => "ema update",
            StepStage::Logged => "logging",
            StepStage::Terminal => "terminal",
        };
        f.write_str(name)
    }
}

/// Step counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrainingState {
    /// Completed optimizer steps.
    pub global_step: u64,
    /// Current pass over the batch source.
    pub current_epoch: u64,
    /// Micro-batches consumed from the current pass.
    pub epoch_batches: u64,
}

/// How [`Trainer::train`] ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainOutcome {
    /// Reached `max_train_steps`.
    Completed { global_step: u64 },
    /// Stopped early through the stop flag.
    Cancelled { global_step: u64 },
}

impl TrainOutcome {
    #[must_use]
    pub fn global_step(&self) -> u64 {
        match self {
            TrainOutcome::Completed { global_step } | TrainOutcome::Cancelled { global_step } => {
                *global_step
            }
        }
    }
}

/// Assembles a [`Trainer`] from configuration and collaborators.
///
/// # Example
///
/// ```no_run
/// use latte_rs::{ExecutionContext, LatteConfig, SyntheticVideoSource, TrainerBuilder};
///
/// # fn main() -> latte_rs::Result<()> {
/// let config = LatteConfig::from_preset("tiny")?;
/// let ctx = ExecutionContext::cpu(config.training.seed);
/// let mut source = SyntheticVideoSource::new(
///     &config.model,
///     config.training.local_batch_size,
///     8,
///     config.training.seed,
///     ctx.device.clone(),
/// );
///
/// let mut trainer = TrainerBuilder::new(config, ctx).build_tiny()?;
/// trainer.train(&mut source)?;
/// # Ok(())
/// # }
/// ```
pub struct TrainerBuilder {
    config: LatteConfig,
    ctx: ExecutionContext,
    compressor: Option<Box<dyn FrameCompressor>>,
    sink: Option<Arc<dyn MetricsSink>>,
    sync: Option<Box<dyn GradientSync>>,
    storage: Option<Arc<dyn CheckpointStorage>>,
    stop: StopFlag,
    show_progress: bool,
}

impl TrainerBuilder {
    #[must_use]
    pub fn new(config: LatteConfig, ctx: ExecutionContext) -> Self {
        Self {
            config,
            ctx,
            compressor: None,
            sink: None,
            sync: None,
            storage: None,
            stop: StopFlag::new(),
            show_progress: false,
        }
    }

    /// Frame compressor. Defaults to average pooling by `model.compression`.
    #[must_use]
    pub fn compressor(mut self, compressor: Box<dyn FrameCompressor>) -> Self {
        self.compressor = Some(compressor);
        self
    }

    /// Metrics sink. Defaults to [`TracingMetrics`].
    #[must_use]
    pub fn metrics(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Gradient sync. Defaults to [`LocalGradientSync`].
    #[must_use]
    pub fn gradient_sync(mut self, sync: Box<dyn GradientSync>) -> Self {
        self.sync = Some(sync);
        self
    }

    /// Checkpoint storage. Defaults to `<output_dir>/checkpoints` on disk.
    #[must_use]
    pub fn storage(mut self, storage: Arc<dyn CheckpointStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    #[must_use]
    pub fn stop_flag(mut self, stop: StopFlag) -> Self {
        self.stop = stop;
        self
    }

    /// Draw a progress bar during [`Trainer::train`].
    #[must_use]
    pub fn show_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    /// Build with a model created inside the trainer's parameter set.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid, `make_model` fails,
    /// the model registers no parameters or the default checkpoint directory
    /// cannot be created.
    pub fn build<M, F>(self, make_model: F) -> Result<Trainer<M>>
    where
        M: DenoisingModel,
        F: FnOnce(VarBuilder<'static>) -> Result<M>,
    {
        self.config.validate()?;

        let live = ParameterSet::new();
        let model = make_model(live.var_builder(DType::F32, &self.ctx.device))?;
        if live.is_empty()? {
            return Err(LatteError::Config("model has no trainable parameters".into()));
        }
        tracing::info!(
            "Model parameters: {} tensors, {} elements",
            live.len()?,
            live.element_count()?
        );

        let ema = EmaShadow::new(&live)?;
        let diffusion = GaussianDiffusion::new(&self.config.diffusion)?;
        let t = &self.config.training;
        let governor = GradNormGovernor::new(t.start_clip_step, t.clip_max_norm)
            .with_error_if_nonfinite(t.error_if_nonfinite);
        let coordinator = OptimizerCoordinator::from_config(t);

        let storage = match self.storage {
            Some(storage) => storage,
            None => Arc::new(FsStorage::new(
                std::path::Path::new(&self.config.output_dir).join("checkpoints"),
            )?),
        };
        let checkpoints = CheckpointManager::new(storage, t.checkpoint_every_n_steps);

        let compressor = self
            .compressor
            .unwrap_or_else(|| Box::new(PooledFrameCompressor::new(self.config.model.compression)));

        Ok(Trainer {
            model,
            live,
            ema,
            diffusion,
            governor,
            coordinator,
            checkpoints,
            compressor,
            sink: self.sink.unwrap_or_else(|| Arc::new(TracingMetrics)),
            sync: self.sync.unwrap_or_else(|| Box::new(LocalGradientSync)),
            stop: self.stop,
            show_progress: self.show_progress,
            state: TrainingState::default(),
            stage: StepStage::Idle,
            training_metrics: Vec::new(),
            config: self.config,
            ctx: self.ctx,
        })
    }

    /// Build with the reference [`TinyDenoiser`].
    ///
    /// # Errors
    ///
    /// See [`build`](Self::build).
    pub fn build_tiny(self) -> Result<Trainer<TinyDenoiser>> {
        let settings = self.config.model.clone();
        let steps = self.config.diffusion.num_timesteps;
        self.build(move |vb| TinyDenoiser::new(&settings, steps, vb))
    }
}

/// Training orchestrator.
///
/// Owns the live parameters (through the model's `VarMap`), the shadow
/// parameters (through [`EmaShadow`]) and the optimizer state.
pub struct Trainer<M> {
    config: LatteConfig,
    ctx: ExecutionContext,
    model: M,
    live: ParameterSet,
    ema: EmaShadow,
    diffusion: GaussianDiffusion,
    governor: GradNormGovernor,
    coordinator: OptimizerCoordinator,
    checkpoints: CheckpointManager,
    compressor: Box<dyn FrameCompressor>,
    sink: Arc<dyn MetricsSink>,
    sync: Box<dyn GradientSync>,
    stop: StopFlag,
    show_progress: bool,
    state: TrainingState,
    stage: StepStage,
    /// Metrics of every step run by this trainer
    pub training_metrics: Vec<StepMetrics>,
}

fn in_stage(stage: StepStage, step: u64) -> impl Fn(LatteError) -> LatteError {
    move |e| e.at_stage(stage, step)
}

impl<M: DenoisingModel> Trainer<M> {
    #[must_use]
    pub fn config(&self) -> &LatteConfig {
        &self.config
    }

    #[must_use]
    pub fn context(&self) -> &ExecutionContext {
        &self.ctx
    }

    #[must_use]
    pub fn model(&self) -> &M {
        &self.model
    }

    /// Live (trained) parameters.
    #[must_use]
    pub fn live(&self) -> &ParameterSet {
        &self.live
    }

    #[must_use]
    pub fn ema(&self) -> &EmaShadow {
        &self.ema
    }

    #[must_use]
    pub fn coordinator(&self) -> &OptimizerCoordinator {
        &self.coordinator
    }

    #[must_use]
    pub fn state(&self) -> TrainingState {
        self.state
    }

    #[must_use]
    pub fn stage(&self) -> StepStage {
        self.stage
    }

    #[must_use]
    pub fn stop_flag(&self) -> StopFlag {
        self.stop.clone()
    }

    /// Run one optimizer step over `micro_batches`.
    ///
    /// Each micro-batch backpropagates `loss / k`; gradients are summed and a
    /// single update follows. The reported loss is the mean over micro-batches.
    ///
    /// # Errors
    ///
    /// Returns [`LatteError::Config`] once training is terminal. Every other
    /// failure is a [`LatteError::Step`] naming the stage it happened in;
    /// failures before the optimizer stage leave the weights untouched.
    pub fn train_step(&mut self, micro_batches: &[Batch]) -> Result<StepMetrics> {
        let step = self.state.global_step;
        if self.stage == StepStage::Terminal {
            return Err(LatteError::Config(format!(
                "training already finished at step {step}"
            )));
        }
        if micro_batches.is_empty() {
            self.stage = StepStage::Encoding;
            return Err(LatteError::MalformedBatch("no micro-batches given".into())
                .at_stage(StepStage::Encoding, step));
        }

        let mut rng = self.ctx.step_rng(step);
        let k = micro_batches.len();
        let mut loss_sum = 0f64;
        let mut grads: Option<GradStore> = None;

        for batch in micro_batches {
            self.stage = StepStage::Encoding;
            let (x0, cond) = self
                .prepare(batch)
                .map_err(in_stage(StepStage::Encoding, step))?;

            self.stage = StepStage::LossComputation;
            let loss = (|| -> Result<(Tensor, f64)> {
                let b = x0.dim(0)?;
                let t = self.diffusion.sample_timesteps(b, &mut rng, &self.ctx.device)?;
                let losses = self.diffusion.training_losses(
                    &self.model,
                    &x0,
                    &t,
                    cond.as_ref(),
                    None,
                    &mut rng,
                )?;
                let loss = losses.mean_all()?;
                let value = loss.to_dtype(DType::F64)?.to_scalar::<f64>()?;
                if !value.is_finite() {
                    return Err(LatteError::NonFiniteLoss { step, value });
                }
                Ok((loss, value))
            })()
            .map_err(in_stage(StepStage::LossComputation, step))?;
            loss_sum += loss.1;

            self.stage = StepStage::Backward;
            let micro = (|| -> Result<GradStore> {
                let scaled = if k > 1 {
                    loss.0.affine(1.0 / k as f64, 0.0)?
                } else {
                    loss.0
                };
                Ok(scaled.backward()?)
            })()
            .map_err(in_stage(StepStage::Backward, step))?;

            grads = Some(match grads {
                None => micro,
                Some(total) => self
                    .accumulate(total, &micro)
                    .map_err(in_stage(StepStage::Backward, step))?,
            });
        }

        let mut grads = grads.ok_or_else(|| {
            LatteError::MalformedBatch("no gradients produced".into())
                .at_stage(StepStage::Backward, step)
        })?;
        self.sync
            .sync(&self.live, &mut grads)
            .map_err(in_stage(StepStage::Backward, step))?;

        self.stage = StepStage::Clipping;
        let report = self
            .governor
            .govern(&self.live, &mut grads, step)
            .map_err(in_stage(StepStage::Clipping, step))?;

        self.stage = StepStage::OptimizerStep;
        let lr = self
            .coordinator
            .step(&self.live, &grads)
            .map_err(in_stage(StepStage::OptimizerStep, step))?;
        self.state.global_step += 1;
        let done = self.state.global_step;

        self.stage = StepStage::EmaUpdate;
        self.ema
            .update(&self.live, self.config.training.ema_decay)
            .map_err(in_stage(StepStage::EmaUpdate, done))?;

        self.stage = StepStage::Logged;
        let metrics = StepMetrics {
            step: done,
            loss: loss_sum / k as f64,
            grad_norm: report.norm,
            lr,
            clipped: report.clipped,
        };
        self.log_step(&metrics)
            .map_err(in_stage(StepStage::Logged, done))?;
        self.training_metrics.push(metrics);

        self.stage = if done >= self.config.training.max_train_steps {
            StepStage::Terminal
        } else {
            StepStage::Idle
        };
        Ok(metrics)
    }

    /// Train until `max_train_steps` or until the stop flag is raised.
    ///
    /// Resumes from `training.resume_from_checkpoint` or initialises from
    /// `training.pretrained` first, when configured.
    ///
    /// # Errors
    ///
    /// Returns the first failure from loading, a step or a checkpoint write.
    /// Batch source failures are reported as [`StepStage::Encoding`].
    pub fn train(&mut self, source: &mut dyn BatchSource) -> Result<TrainOutcome> {
        let t = self.config.training.clone();

        if let Some(path) = &t.resume_from_checkpoint {
            tracing::info!("Resuming from {path}");
            let loaded = LoadedCheckpoint::from_file(path, &self.ctx.device)?;
            self.restore(loaded)?;
        } else if let Some(path) = &t.pretrained {
            tracing::info!("Initialising weights from {path}");
            let loaded = LoadedCheckpoint::from_file(path, &self.ctx.device)?;
            self.load_pretrained(&loaded)?;
        }

        tracing::info!("Starting training");
        tracing::info!("  Max train steps: {}", t.max_train_steps);
        tracing::info!(
            "  Local batch size: {} x {} accumulation steps",
            t.local_batch_size,
            t.gradient_accumulation_steps
        );
        tracing::info!("  World size: {}", self.ctx.world_size);
        tracing::info!("  Starting at step {}", self.state.global_step);

        let pb = if self.show_progress && self.ctx.is_main_process() {
            let pb = ProgressBar::new(t.max_train_steps);
            pb.set_style(
                ProgressStyle::default_bar()
                    .template("{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos:>7}/{len:7} {msg}")?
                    .progress_chars("#>-"),
            );
            pb.set_position(self.state.global_step);
            pb
        } else {
            ProgressBar::hidden()
        };

        let accumulation = t.gradient_accumulation_steps.max(1);
        let mut epoch_iter: Option<EpochIter> = None;
        let mut epoch_yielded = false;

        while self.state.global_step < t.max_train_steps {
            if self.stop.is_stop_requested() {
                let step = self.state.global_step;
                tracing::info!("Stop requested; saving checkpoint at step {step}");
                self.save_checkpoint(&checkpoint_key(step))?;
                pb.abandon_with_message("Cancelled");
                return Ok(TrainOutcome::Cancelled { global_step: step });
            }

            let step = self.state.global_step;
            let from_source = in_stage(StepStage::Encoding, step);
            let mut micro = Vec::with_capacity(accumulation);
            while micro.len() < accumulation {
                if epoch_iter.is_none() {
                    let mut it = source
                        .epoch(self.state.current_epoch)
                        .map_err(&from_source)?;
                    // skip what a resumed run already consumed
                    for _ in 0..self.state.epoch_batches {
                        if it.next().transpose().map_err(&from_source)?.is_none() {
                            break;
                        }
                    }
                    epoch_yielded = self.state.epoch_batches > 0;
                    epoch_iter = Some(it);
                }

                match epoch_iter.as_mut().and_then(|it| it.next()) {
                    Some(batch) => {
                        micro.push(batch.map_err(&from_source)?);
                        self.state.epoch_batches += 1;
                        epoch_yielded = true;
                    }
                    None => {
                        if !epoch_yielded {
                            return Err(from_source(LatteError::MalformedBatch(format!(
                                "batch source yielded no batches for epoch {}",
                                self.state.current_epoch
                            ))));
                        }
                        epoch_iter = None;
                        self.state.current_epoch += 1;
                        self.state.epoch_batches = 0;
                        tracing::debug!("Starting epoch {}", self.state.current_epoch);
                    }
                }
            }

            let metrics = self.train_step(&micro)?;
            pb.set_message(format!("{:.4}", metrics.loss));
            pb.set_position(metrics.step);

            if self.ctx.is_main_process() && self.checkpoints.should_save(metrics.step) {
                let snapshot = self.snapshot()?;
                self.checkpoints
                    .save_in_background(checkpoint_key(metrics.step), snapshot)?;
            }
        }

        self.stage = StepStage::Terminal;
        if self.ctx.is_main_process() {
            self.save_checkpoint(FINAL_CHECKPOINT)?;
        }
        self.sink.flush()?;
        pb.finish_with_message("Training complete");

        Ok(TrainOutcome::Completed {
            global_step: self.state.global_step,
        })
    }

    /// Deep copy of the current training state.
    ///
    /// # Errors
    ///
    /// Returns an error if a tensor copy fails.
    pub fn snapshot(&self) -> Result<TrainingSnapshot> {
        TrainingSnapshot::capture(
            &self.live,
            &self.ema,
            &self.coordinator,
            self.state.global_step,
            self.state.current_epoch,
            self.state.epoch_batches,
        )
    }

    /// Write a checkpoint now and wait for it.
    ///
    /// # Errors
    ///
    /// Returns an error if capturing, encoding or writing fails, or if an
    /// earlier background write had failed.
    pub fn save_checkpoint(&mut self, key: &str) -> Result<()> {
        let snapshot = self.snapshot()?;
        self.checkpoints.save(key, &snapshot)?;
        self.checkpoints.wait()
    }

    /// Wait for any background checkpoint write.
    ///
    /// # Errors
    ///
    /// Returns the background write's error, if it failed.
    pub fn wait_for_checkpoints(&mut self) -> Result<()> {
        self.checkpoints.wait()
    }

    /// Apply a loaded checkpoint.
    ///
    /// A full record restores live, shadow, optimizer, schedule and step
    /// counters. A legacy record loads its weights into the live set,
    /// re-syncs the shadow and leaves everything else alone.
    ///
    /// # Errors
    ///
    /// Returns [`LatteError::ShapeMismatch`] if any matched live, shadow or
    /// optimizer-moment tensor disagrees with the model. All shapes are
    /// checked before the first write, so on error the trainer is unchanged.
    pub fn restore(&mut self, loaded: LoadedCheckpoint) -> Result<RestoredState> {
        let restored = match loaded {
            LoadedCheckpoint::Full(full) => {
                self.live.check_loadable(&full.live)?;
                self.ema.check_restore(&full.shadow)?;
                AdamW::check_state(&full.optimizer, &self.live)?;

                let live_report = self.live.load_partial(&full.live)?;
                live_report.log("model");
                let shadow_report = self.ema.restore(&full.shadow)?;
                shadow_report.log("ema");
                self.coordinator
                    .load_state(full.optimizer, full.state.scheduler, &self.live)?;
                self.state = TrainingState {
                    global_step: full.state.global_step,
                    current_epoch: full.state.epoch,
                    epoch_batches: full.state.epoch_batches,
                };
                RestoredState {
                    kind: CheckpointKind::Full,
                    global_step: self.state.global_step,
                    epoch: self.state.current_epoch,
                    live_report,
                    shadow_report: Some(shadow_report),
                }
            }
            legacy @ LoadedCheckpoint::Legacy { .. } => self.load_pretrained(&legacy)?,
        };

        self.stage = if self.state.global_step >= self.config.training.max_train_steps {
            StepStage::Terminal
        } else {
            StepStage::Idle
        };
        tracing::info!(
            "Restored {} checkpoint at step {}",
            restored.kind,
            restored.global_step
        );
        Ok(restored)
    }

    /// Initialise live weights from a checkpoint's shadow set and re-sync
    /// the shadow. Counters and optimizer state are untouched.
    ///
    /// # Errors
    ///
    /// Returns [`LatteError::ShapeMismatch`] before anything is written if a
    /// matched tensor has the wrong shape.
    pub fn load_pretrained(&mut self, loaded: &LoadedCheckpoint) -> Result<RestoredState> {
        let live_report = self.live.load_partial(loaded.shadow_weights())?;
        live_report.log("model");
        self.ema.resync(&self.live)?;
        Ok(RestoredState {
            kind: CheckpointKind::Legacy,
            global_step: self.state.global_step,
            epoch: self.state.current_epoch,
            live_report,
            shadow_report: None,
        })
    }

    /// Validate a batch and turn it into scaled latents plus the condition.
    fn prepare(&self, batch: &Batch) -> Result<(Tensor, Option<Tensor>)> {
        let input = batch.input.tensor();
        let dims = input.dims();
        if dims.len() != 5 {
            return Err(LatteError::MalformedBatch(format!(
                "expected [B,F,C,H,W], got shape {dims:?}"
            )));
        }
        let (b, f, c, h, w) = input.dims5()?;
        if b == 0 || f == 0 {
            return Err(LatteError::MalformedBatch(format!(
                "batch and frame counts must be >= 1, got B={b} F={f}"
            )));
        }

        let input = input.to_device(&self.ctx.device)?.to_dtype(DType::F32)?;
        let x0 = match &batch.input {
            BatchInput::Frames(_) => {
                let flat = input.reshape((b * f, c, h, w))?;
                let latents = self.compressor.encode(&flat)?.detach();
                let latents = latents.affine(LATENT_SCALE, 0.0)?;
                let (n, lc, lh, lw) = latents.dims4()?;
                if n != b * f {
                    return Err(LatteError::MalformedBatch(format!(
                        "compressor returned {n} latents for {} frames",
                        b * f
                    )));
                }
                latents.reshape((b, f, lc, lh, lw))?
            }
            BatchInput::Latents(_) => input.detach(),
        };

        let cond = if self.config.model.conditional {
            let labels = batch.labels.as_ref().ok_or_else(|| {
                LatteError::MalformedBatch("conditional run requires class labels".into())
            })?;
            if labels.len() != b {
                return Err(LatteError::MalformedBatch(format!(
                    "{} labels for {b} samples",
                    labels.len()
                )));
            }
            let classes = self.config.model.num_classes as u32;
            if let Some(bad) = labels.iter().find(|l| **l >= classes) {
                return Err(LatteError::MalformedBatch(format!(
                    "label {bad} outside [0, {classes})"
                )));
            }
            Some(Tensor::new(labels.as_slice(), &self.ctx.device)?)
        } else {
            None
        };

        Ok((x0, cond))
    }

    /// Add `micro`'s gradients into `total`.
    fn accumulate(&self, mut total: GradStore, micro: &GradStore) -> Result<GradStore> {
        for (_, var) in self.live.named_vars()? {
            let Some(g) = micro.get(var.as_tensor()) else {
                continue;
            };
            let sum = match total.get(var.as_tensor()) {
                Some(prev) => prev.add(g)?,
                None => g.clone(),
            };
            total.insert(var.as_tensor(), sum);
        }
        Ok(total)
    }

    fn log_step(&self, metrics: &StepMetrics) -> Result<()> {
        self.sink.record(metrics.step, "train_loss", metrics.loss)?;
        self.sink
            .record(metrics.step, "gradient_norm", metrics.grad_norm)?;
        self.sink.record(metrics.step, "learning_rate", metrics.lr)?;

        if self.ctx.is_main_process()
            && metrics.step % self.config.training.log_every_n_steps == 0
        {
            tracing::info!(
                "(step={:07}/epoch={:04}) Train Loss: {:.4}, Gradient Norm: {:.4}, LR: {:.2e}",
                metrics.step,
                self.state.current_epoch,
                metrics.loss,
                metrics.grad_norm,
                metrics.lr
            );
        }
        Ok(())
    }
}
