//! Error types for the decode loop and its collaborators.

use crate::device::Device;
use thiserror::Error;

/// Result type for decode operations
pub type DecodeResult<T> = Result<T, DecodeError>;

/// Errors that abort a generation call
#[derive(Error, Debug)]
pub enum DecodeError {
    /// A tensor (scores, cache, mask or inputs) has an unexpected rank or size.
    #[error("shape error: {0}")]
    Shape(String),

    /// The truncated probability distribution cannot be sampled from.
    #[error("sampling error: {0}")]
    Sampling(String),

    #[error("device mismatch: expected {expected}, found {found}")]
    Device { expected: Device, found: Device },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("context overflow: {required} positions needed but cache holds at most {max}")]
    ContextOverflow { required: usize, max: usize },

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Model(#[from] anyhow::Error),
}

impl DecodeError {
    pub(crate) fn shape(msg: impl Into<String>) -> Self {
        DecodeError::Shape(msg.into())
    }

    pub(crate) fn sampling(msg: impl Into<String>) -> Self {
        DecodeError::Sampling(msg.into())
    }

    pub(crate) fn config(msg: impl Into<String>) -> Self {
        DecodeError::InvalidConfig(msg.into())
    }
}

impl From<ndarray::ShapeError> for DecodeError {
    fn from(err: ndarray::ShapeError) -> Self {
        DecodeError::Shape(err.to_string())
    }
}
