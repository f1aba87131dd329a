//! Integration tests for the latte CLI.

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

/// Write `content` to `config.yaml` under `dir`.
fn create_test_config(dir: &Path, content: &str) -> std::path::PathBuf {
    let config_path = dir.join("config.yaml");
    fs::write(&config_path, content).expect("Failed to write test config");
    config_path
}

/// The latte binary with `args`, pinned to CPU.
fn run_cli(args: &[&str]) -> Command {
    let mut cmd = Command::cargo_bin("latte").expect("Failed to find latte binary");
    cmd.env("LATTE_FORCE_CPU", "1");
    cmd.args(args);
    cmd
}

/// A three-step run on 8x8 clips writing into `output_dir`.
fn tiny_config_yaml(output_dir: &Path) -> String {
    format!(
        r#"
model:
  frame_channels: 3
  num_frames: 4
  image_size: 8
  compression: 4

diffusion:
  num_timesteps: 10
  beta_schedule: linear

training:
  max_train_steps: 3
  local_batch_size: 2
  learning_rate: 0.001
  lr_warmup_steps: 0
  ema_decay: 0.9
  log_every_n_steps: 1
  checkpoint_every_n_steps: 2
  seed: 3

output_dir: "{}"
"#,
        output_dir.display()
    )
}

fn invalid_config_yaml() -> &'static str {
    r#"
training:
  max_train_steps: 0
"#
}

#[test]
fn test_validate_command_valid_config() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let config_path = create_test_config(temp_dir.path(), &tiny_config_yaml(temp_dir.path()));

    run_cli(&["validate", config_path.to_str().unwrap()])
        .assert()
        .success()
        .stdout(predicate::str::contains("Configuration is valid"))
        .stdout(predicate::str::contains("10 timesteps"));
}

#[test]
fn test_validate_command_invalid_config() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let config_path = create_test_config(temp_dir.path(), invalid_config_yaml());

    run_cli(&["validate", config_path.to_str().unwrap()])
        .assert()
        .failure()
        .stderr(predicate::str::contains("max_train_steps"));
}

#[test]
fn test_validate_command_missing_file() {
    run_cli(&["validate", "/nonexistent/config.yaml"])
        .assert()
        .failure();
}

#[test]
fn test_init_command_writes_preset() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let output = temp_dir.path().join("ucf.yaml");

    run_cli(&["init", output.to_str().unwrap(), "--preset", "ucf101"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Configuration written"));

    let written = fs::read_to_string(&output).unwrap();
    assert!(written.contains("conditional: true"));
    assert!(written.contains("num_classes: 101"));

    run_cli(&["validate", output.to_str().unwrap()])
        .assert()
        .success();
}

#[test]
fn test_init_command_unknown_preset() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let output = temp_dir.path().join("x.yaml");

    run_cli(&["init", output.to_str().unwrap(), "--preset", "imagenet"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Unknown preset"));
    assert!(!output.exists());
}

#[test]
fn test_train_then_inspect() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let config_path = create_test_config(temp_dir.path(), &tiny_config_yaml(temp_dir.path()));

    run_cli(&[
        "train",
        config_path.to_str().unwrap(),
        "--batches-per-epoch",
        "2",
    ])
    .assert()
    .success()
    .stdout(predicate::str::contains("Training complete at step 3"));

    let checkpoints = temp_dir.path().join("checkpoints");
    assert!(checkpoints.join("checkpoint-0000002.safetensors").is_file());
    let final_ckpt = checkpoints.join("checkpoint-final.safetensors");
    assert!(final_ckpt.is_file());

    let metrics = fs::read_to_string(temp_dir.path().join("metrics.jsonl")).unwrap();
    assert_eq!(
        metrics.lines().filter(|l| l.contains("\"train_loss\"")).count(),
        3
    );

    run_cli(&["inspect", final_ckpt.to_str().unwrap()])
        .assert()
        .success()
        .stdout(predicate::str::contains("Form: full"))
        .stdout(predicate::str::contains("Global step: 3"))
        .stdout(predicate::str::contains("Optimizer steps: 3"));
}

#[test]
fn test_train_resumes_from_checkpoint() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let config_path = create_test_config(temp_dir.path(), &tiny_config_yaml(temp_dir.path()));
    run_cli(&["train", config_path.to_str().unwrap()])
        .assert()
        .success();

    // already at max_train_steps, so the resumed run only rewrites the final record
    let resume = temp_dir.path().join("checkpoints/checkpoint-final.safetensors");
    run_cli(&[
        "train",
        config_path.to_str().unwrap(),
        "--resume",
        resume.to_str().unwrap(),
    ])
    .assert()
    .success()
    .stdout(predicate::str::contains("Training complete at step 3"));
}

#[test]
fn test_inspect_missing_checkpoint() {
    run_cli(&["inspect", "/nonexistent/checkpoint.safetensors"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed to read"));
}
