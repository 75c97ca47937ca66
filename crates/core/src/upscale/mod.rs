//! Tiled neural-network upscaling.
//!
//! [`Upscaler`] is the entry point. It owns the session built through a
//! [`RuntimeApi`] implementation (normally [`OrtRuntime`]) and routes each
//! image either straight through the model or through the tiling engine.

pub mod backend;
pub mod convert;
pub mod ort_backend;
pub mod runner;
pub mod tiling;
pub mod upscaler;

#[cfg(test)]
pub(crate) mod mock;

pub use backend::{
    close_session, create_session, ExecutionProvider, InferenceSession, RuntimeApi, SessionConfig,
};
pub use ort_backend::OrtRuntime;
pub use tiling::{tiled_inference, TileGrid};
pub use upscaler::{SessionInfo, Upscaler, DEFAULT_TILE_THRESHOLD};
