//! Crate-level error type

use std::path::PathBuf;

use crate::config::ConfigError;
use crate::encode_ffmpeg::EncodeError;
use crate::loader::LoaderError;

#[derive(Debug, thiserror::Error)]
pub enum SdVideoError {
    #[error("Invalid input image {}: {reason}", display_path(.path))]
    InvalidImage {
        path: Option<PathBuf>,
        reason: String,
    },

    #[error("Sampling failed at step {step}: {reason}")]
    SamplingFailed { step: usize, reason: String },

    #[error("Sampling cancelled before step {step}")]
    Cancelled { step: usize },

    #[error("Shape mismatch in {context}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        context: &'static str,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Model loading failed: {0}")]
    Loader(#[from] LoaderError),

    #[error("Video encoding failed: {0}")]
    Encode(#[from] EncodeError),

    #[error("Failed to write {}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write image {}", .path.display())]
    ImageWrite {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),
}

pub type Result<T> = std::result::Result<T, SdVideoError>;

fn display_path(path: &Option<PathBuf>) -> String {
    match path {
        Some(p) => format!("'{}'", p.display()),
        None => "(in memory)".to_string(),
    }
}

impl SdVideoError {
    pub fn invalid_image(path: Option<PathBuf>, reason: impl Into<String>) -> Self {
        Self::InvalidImage {
            path,
            reason: reason.into(),
        }
    }
}
