//! Error types for latte-rs.
//!
//! Every failure in the training engine is fatal to the run; nothing here is
//! retried. Errors raised inside a training step are wrapped in
//! [`LatteError::Step`] so the message names the stage that failed.
//!
//! # Example
//!
//! ```rust
//! use latte_rs::{LatteConfig, LatteError};
//!
//! # fn main() {
//! match LatteConfig::from_preset("does-not-exist") {
//!     Ok(_) => println!("Loaded config"),
//!     Err(LatteError::Config(msg)) => eprintln!("Configuration error: {}", msg),
//!     Err(e) => eprintln!("Other error: {}", e),
//! }
//! # }
//! ```

use thiserror::Error;

use crate::trainer::StepStage;

/// Result type alias for latte-rs operations.
pub type Result<T> = std::result::Result<T, LatteError>;

/// Errors that can occur in latte-rs.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum LatteError {
    /// Configuration error (missing or invalid value).
    #[error("configuration error: {0}")]
    Config(String),

    /// Invalid configuration file.
    #[error("invalid config file: {0}")]
    ConfigParse(#[from] serde_yaml::Error),

    /// Batch does not have the expected layout.
    #[error("malformed batch: {0}")]
    MalformedBatch(String),

    /// Live and shadow parameter sets disagree on keys or shapes.
    #[error("parameter set mismatch: {0}")]
    ParameterMismatch(String),

    /// A matched checkpoint key has the wrong shape.
    #[error("shape mismatch for `{key}`: model has {expected:?}, checkpoint has {got:?}")]
    ShapeMismatch {
        /// Parameter name.
        key: String,
        /// Shape in the destination parameter set.
        expected: Vec<usize>,
        /// Shape found in the checkpoint.
        got: Vec<usize>,
    },

    /// Loss is NaN or infinite.
    #[error("non-finite loss {value} at step {step}")]
    NonFiniteLoss {
        /// Global step at which the loss was computed.
        step: u64,
        /// Offending loss value.
        value: f64,
    },

    /// Gradient norm is NaN or infinite and the run is configured to abort on it.
    #[error("non-finite gradient norm {value} at step {step}")]
    NonFiniteGradient {
        /// Global step at which the norm was computed.
        step: u64,
        /// Offending norm.
        value: f64,
    },

    /// A parameter store lock was poisoned by a panicking thread.
    #[error("parameter store lock poisoned")]
    Poisoned,

    /// Checkpoint error.
    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    /// Safetensors encoding or decoding error.
    #[error("safetensors error: {0}")]
    Safetensors(#[from] safetensors::SafeTensorError),

    /// JSON error (checkpoint state, metrics).
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Candle error.
    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Progress bar template error.
    #[error("template error: {0}")]
    Template(String),

    /// A training step failed inside a specific stage.
    #[error("step {step} failed during {stage}: {source}")]
    Step {
        /// Stage of the step state machine that raised the error.
        stage: StepStage,
        /// Global step at the time of failure.
        step: u64,
        /// Underlying error.
        #[source]
        source: Box<LatteError>,
    },
}

impl LatteError {
    /// Wrap this error with the stage and step it was raised in.
    ///
    /// Already-wrapped errors are returned unchanged so the innermost stage wins.
    #[must_use]
    pub fn at_stage(self, stage: StepStage, step: u64) -> Self {
        match self {
            err @ LatteError::Step { .. } => err,
            other => LatteError::Step {
                stage,
                step,
                source: Box::new(other),
            },
        }
    }

    /// The stage this error was raised in, if it came from a training step.
    #[must_use]
    pub fn stage(&self) -> Option<StepStage> {
        match self {
            LatteError::Step { stage, .. } => Some(*stage),
            _ => None,
        }
    }
}

impl From<indicatif::style::TemplateError> for LatteError {
    fn from(err: indicatif::style::TemplateError) -> Self {
        LatteError::Template(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_config_error_creation() {
        let error = LatteError::Config("max_train_steps must be > 0".to_string());
        assert_eq!(
            error.to_string(),
            "configuration error: max_train_steps must be > 0"
        );
    }

    #[test]
    fn test_shape_mismatch_display() {
        let error = LatteError::ShapeMismatch {
            key: "blocks.0.weight".into(),
            expected: vec![4, 4],
            got: vec![4, 8],
        };
        let msg = error.to_string();
        assert!(msg.contains("blocks.0.weight"));
        assert!(msg.contains("[4, 4]"));
        assert!(msg.contains("[4, 8]"));
    }

    #[test]
    fn test_at_stage_wraps_once() {
        let error = LatteError::MalformedBatch("rank 4".into())
            .at_stage(StepStage::Encoding, 7)
            .at_stage(StepStage::LossComputation, 7);

        assert_eq!(error.stage(), Some(StepStage::Encoding));
        let msg = error.to_string();
        assert!(msg.contains("step 7 failed during encoding"));
        assert!(msg.contains("malformed batch: rank 4"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_error = io::Error::new(io::ErrorKind::NotFound, "file not found");
        let error: LatteError = io_error.into();
        assert!(error.to_string().contains("IO error"));
        assert!(error.to_string().contains("file not found"));
    }

    #[test]
    fn test_config_parse_error_conversion() {
        let yaml_error = serde_yaml::from_str::<serde_yaml::Value>("invalid: yaml: :::").unwrap_err();
        let error: LatteError = yaml_error.into();
        assert!(error.to_string().contains("invalid config file"));
    }

    #[test]
    fn test_candle_error_conversion() {
        use candle_core::{DType, Device, Tensor};

        let a = Tensor::zeros((2, 3), DType::F32, &Device::Cpu).unwrap();
        let b = Tensor::zeros((3, 4), DType::F32, &Device::Cpu).unwrap();
        let candle_error = a.broadcast_add(&b).unwrap_err();
        let error: LatteError = candle_error.into();
        assert!(error.to_string().contains("candle error"));
    }

    #[test]
    fn test_step_error_source_chain() {
        use std::error::Error;

        let error = LatteError::NonFiniteLoss {
            step: 3,
            value: f64::NAN,
        }
        .at_stage(StepStage::LossComputation, 3);
        assert!(error.source().is_some());
    }
}
