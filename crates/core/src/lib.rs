//! Core crate for inkscale: bitmap handling and tiled ONNX upscaling.

pub mod bitmap;
pub mod config;
pub mod error;
pub mod logging;
pub mod runtime;
pub mod tensor;
pub mod upscale;

pub use bitmap::Bitmap;
pub use error::{Result, UpscaleError, UpscaleErrorKind};
pub use upscale::{ExecutionProvider, OrtRuntime, Upscaler};
