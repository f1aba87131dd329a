//! CLI entry point for latte-rs.

use std::sync::Arc;

use candle_core::Device;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use latte_rs::{
    ExecutionContext, JsonlMetrics, LatteConfig, LoadedCheckpoint, Result, StopFlag,
    SyntheticVideoSource, TrainOutcome, TrainerBuilder,
};

#[derive(Parser)]
#[command(name = "latte")]
#[command(about = "Training engine for latent video diffusion models")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a configuration file
    Validate {
        /// Path to configuration file
        config: String,
    },
    /// Generate a sample configuration file
    Init {
        /// Output path for config file
        #[arg(default_value = "config.yaml")]
        output: String,
        /// Preset (tiny, ffs, ucf101)
        #[arg(long, default_value = "tiny")]
        preset: String,
    },
    /// Train the reference model on synthetic clips
    Train {
        /// Path to configuration file
        config: String,
        /// Resume from a full checkpoint
        #[arg(long)]
        resume: Option<String>,
        /// Initialise weights from a weights-only checkpoint
        #[arg(long)]
        pretrained: Option<String>,
        /// Synthetic batches per epoch
        #[arg(long, default_value_t = 16)]
        batches_per_epoch: usize,
    },
    /// Print what a checkpoint contains
    Inspect {
        /// Path to checkpoint file
        checkpoint: String,
    },
}

fn select_device() -> Device {
    let force_cpu = std::env::var("LATTE_FORCE_CPU")
        .ok()
        .is_some_and(|v| v == "1" || v.eq_ignore_ascii_case("true"));
    if force_cpu || !cfg!(feature = "cuda") {
        return Device::Cpu;
    }
    match Device::cuda_if_available(0) {
        Ok(device) => device,
        Err(err) => {
            tracing::warn!("CUDA init failed ({err}); falling back to CPU");
            Device::Cpu
        }
    }
}

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Validate { config } => {
            tracing::info!("Validating configuration: {}", config);
            let config = LatteConfig::from_file(&config)?;
            config.validate()?;
            println!("✓ Configuration is valid");
            println!(
                "  Model: {} frames, {}px, {} channels, conditional: {}",
                config.model.num_frames,
                config.model.image_size,
                config.model.frame_channels,
                config.model.conditional
            );
            println!(
                "  Diffusion: {} timesteps, {:?} schedule, {:?} target",
                config.diffusion.num_timesteps,
                config.diffusion.beta_schedule,
                config.diffusion.prediction_target
            );
            println!("  Max train steps: {}", config.training.max_train_steps);
        }
        Commands::Init { output, preset } => {
            tracing::info!("Generating config for preset: {}", preset);
            let config = LatteConfig::from_preset(&preset)?;
            config.to_file(&output)?;
            println!("✓ Configuration written to: {output}");
        }
        Commands::Train {
            config,
            resume,
            pretrained,
            batches_per_epoch,
        } => {
            tracing::info!("Starting training with config: {}", config);
            let mut config = LatteConfig::from_file(&config)?;
            if resume.is_some() {
                config.training.resume_from_checkpoint = resume;
            }
            if pretrained.is_some() {
                config.training.pretrained = pretrained;
            }
            config.validate()?;

            let ctx = ExecutionContext::single(select_device(), config.training.seed);
            let mut source = SyntheticVideoSource::new(
                &config.model,
                config.training.local_batch_size,
                batches_per_epoch.max(1),
                config.training.seed,
                ctx.device.clone(),
            );

            let stop = StopFlag::new();
            let handler_flag = stop.clone();
            if let Err(err) = ctrlc::set_handler(move || {
                tracing::warn!("Interrupt received; stopping after the current step");
                handler_flag.request_stop();
            }) {
                tracing::warn!("Could not install interrupt handler: {err}");
            }

            let metrics_path = std::path::Path::new(&config.output_dir).join("metrics.jsonl");
            let metrics = Arc::new(JsonlMetrics::create(&metrics_path)?);

            let mut trainer = TrainerBuilder::new(config, ctx)
                .metrics(metrics)
                .stop_flag(stop)
                .show_progress(true)
                .build_tiny()?;

            match trainer.train(&mut source)? {
                TrainOutcome::Completed { global_step } => {
                    println!("✓ Training complete at step {global_step}");
                }
                TrainOutcome::Cancelled { global_step } => {
                    println!("Training cancelled at step {global_step}; checkpoint saved");
                }
            }
        }
        Commands::Inspect { checkpoint } => {
            let loaded = LoadedCheckpoint::from_file(&checkpoint, &Device::Cpu)?;
            println!("Checkpoint: {checkpoint}");
            println!("  Form: {}", loaded.kind());
            match &loaded {
                LoadedCheckpoint::Full(full) => {
                    println!("  Global step: {}", full.state.global_step);
                    println!("  Epoch: {}", full.state.epoch);
                    println!("  Optimizer steps: {}", full.optimizer.t);
                    println!("  Live tensors: {}", full.live.len());
                    println!("  Shadow tensors: {}", full.shadow.len());
                    println!("  Optimizer moments: {}", full.optimizer.exp_avg.len());
                    if let Some(saved_at) = &full.saved_at {
                        println!("  Saved at: {saved_at}");
                    }
                }
                LoadedCheckpoint::Legacy { shadow } => {
                    println!("  Weight tensors: {}", shadow.len());
                }
            }
        }
    }

    Ok(())
}
