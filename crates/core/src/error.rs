//! Error taxonomy shared by the whole upscaling pipeline.
//!
//! Every fallible step returns [`UpscaleError`] and propagates it with `?`.
//! None of the variants are retried; each one ends the current call.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, UpscaleError>;

/// Coarse classification of an [`UpscaleError`], convenient for matching at
/// a boundary that only cares about the category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UpscaleErrorKind {
    UnsupportedRuntimeVersion,
    ExecutionProviderInit,
    SessionInit,
    Inference,
    ImageProcessing,
    Unknown,
}

#[derive(Debug, Error)]
pub enum UpscaleError {
    #[error("ONNX Runtime API version {found} is not supported (requires {required} or newer)")]
    UnsupportedRuntimeVersion { required: u32, found: u32 },

    #[error("failed to initialize execution provider: {0}")]
    ExecutionProviderInit(String),

    #[error("failed to initialize inference session: {0}")]
    SessionInit(String),

    #[error("inference failed: {0}")]
    Inference(String),

    #[error("image processing failed: {0}")]
    ImageProcessing(String),

    #[error("{0}")]
    Unknown(String),
}

impl UpscaleError {
    pub fn kind(&self) -> UpscaleErrorKind {
        match self {
            Self::UnsupportedRuntimeVersion { .. } => UpscaleErrorKind::UnsupportedRuntimeVersion,
            Self::ExecutionProviderInit(_) => UpscaleErrorKind::ExecutionProviderInit,
            Self::SessionInit(_) => UpscaleErrorKind::SessionInit,
            Self::Inference(_) => UpscaleErrorKind::Inference,
            Self::ImageProcessing(_) => UpscaleErrorKind::ImageProcessing,
            Self::Unknown(_) => UpscaleErrorKind::Unknown,
        }
    }

    pub fn provider(message: impl std::fmt::Display) -> Self {
        Self::ExecutionProviderInit(message.to_string())
    }

    pub fn session(message: impl std::fmt::Display) -> Self {
        Self::SessionInit(message.to_string())
    }

    pub fn inference(message: impl std::fmt::Display) -> Self {
        Self::Inference(message.to_string())
    }

    pub fn image(message: impl std::fmt::Display) -> Self {
        Self::ImageProcessing(message.to_string())
    }
}

impl From<image::ImageError> for UpscaleError {
    fn from(error: image::ImageError) -> Self {
        Self::ImageProcessing(error.to_string())
    }
}

impl From<std::io::Error> for UpscaleError {
    fn from(error: std::io::Error) -> Self {
        Self::Unknown(error.to_string())
    }
}
