//! Inference session lifecycle on top of a pluggable runtime.
//!
//! [`RuntimeApi`] is the seam between the upscaler and ONNX Runtime. Every
//! handle it hands out is an owned value whose `Drop` releases the underlying
//! resource, so a session build that fails half-way releases whatever it had
//! acquired simply by returning.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Result, UpscaleError};
use crate::tensor::{ElementType, OutputTensor, TensorBuffer};

/// Backend a session's graph is placed on.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionProvider {
    #[default]
    Cpu,
    Cuda,
    Rocm,
    #[serde(rename = "directml")]
    DirectMl,
    #[serde(rename = "tensorrt")]
    TensorRt,
    #[serde(rename = "webgpu")]
    WebGpu,
}

impl ExecutionProvider {
    /// Parse from string (case-insensitive). Returns `Cpu` for unknown values.
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "cuda" => Self::Cuda,
            "rocm" => Self::Rocm,
            "directml" | "dml" => Self::DirectMl,
            "tensorrt" | "trt" => Self::TensorRt,
            "webgpu" => Self::WebGpu,
            _ => Self::Cpu,
        }
    }
}

impl std::fmt::Display for ExecutionProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Cpu => "cpu",
            Self::Cuda => "cuda",
            Self::Rocm => "rocm",
            Self::DirectMl => "directml",
            Self::TensorRt => "tensorrt",
            Self::WebGpu => "webgpu",
        };
        f.write_str(name)
    }
}

/// Everything a session is derived from. Two equal configs yield
/// interchangeable sessions.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionConfig {
    pub execution_provider: ExecutionProvider,
    pub device_id: i32,
    pub model_path: Option<PathBuf>,
}

/// Operations the upscaler needs from an inference runtime.
///
/// Builder-style calls take the options by value and hand them back, so an
/// error drops (and releases) them on the spot.
pub trait RuntimeApi {
    type Options;
    type Session;
    type MemoryInfo;
    type RunOptions;
    type Value;

    fn create_session_options(&self) -> Result<Self::Options>;

    fn set_basic_optimization(&self, options: Self::Options) -> Result<Self::Options>;

    fn append_execution_provider(
        &self,
        options: Self::Options,
        provider: ExecutionProvider,
        device_id: i32,
    ) -> Result<Self::Options>;

    fn load_model(&self, options: Self::Options, model_path: &Path) -> Result<Self::Session>;

    fn create_cpu_memory_info(&self) -> Result<Self::MemoryInfo>;

    fn create_run_options(&self) -> Result<Self::RunOptions>;

    /// Element type of input 0. Errors for anything but f32/f16.
    fn input_element_type(&self, session: &Self::Session) -> Result<ElementType>;

    fn output_count(&self, session: &Self::Session) -> usize;

    fn input_name(&self, session: &Self::Session) -> Result<String>;

    fn output_names(&self, session: &Self::Session) -> Result<Vec<String>>;

    fn create_tensor(
        &self,
        memory_info: &Self::MemoryInfo,
        input: TensorBuffer,
    ) -> Result<Self::Value>;

    /// One forward pass. Outputs are copied out before the runtime's own
    /// output values are released.
    fn run(
        &self,
        session: &mut Self::Session,
        run_options: &Self::RunOptions,
        input_name: &str,
        input: Self::Value,
        output_names: &[String],
    ) -> Result<Vec<OutputTensor>>;
}

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// A fully built session plus the metadata derived from it.
///
/// Fields drop in declaration order: run options and memory info go before
/// the session they were created for.
pub struct InferenceSession<R: RuntimeApi> {
    id: u64,
    config: SessionConfig,
    input_type: ElementType,
    output_count: usize,
    pub(crate) run_options: R::RunOptions,
    pub(crate) memory_info: R::MemoryInfo,
    pub(crate) session: R::Session,
}

impl<R: RuntimeApi> InferenceSession<R> {
    /// Process-unique id; a rebuilt session never reuses one.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn input_type(&self) -> ElementType {
        self.input_type
    }

    pub fn output_count(&self) -> usize {
        self.output_count
    }
}

impl<R: RuntimeApi> std::fmt::Debug for InferenceSession<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InferenceSession")
            .field("id", &self.id)
            .field("config", &self.config)
            .field("input_type", &self.input_type)
            .field("output_count", &self.output_count)
            .finish_non_exhaustive()
    }
}

/// Build a session for `config`, or release everything acquired so far and
/// return the error.
pub fn create_session<R: RuntimeApi>(
    runtime: &R,
    config: &SessionConfig,
) -> Result<InferenceSession<R>> {
    let model_path = config
        .model_path
        .as_deref()
        .ok_or_else(|| UpscaleError::session("model path is not initialized"))?;

    let started = Instant::now();
    debug!(
        provider = %config.execution_provider,
        device_id = config.device_id,
        model = %model_path.display(),
        "Building inference session"
    );

    let options = runtime.create_session_options()?;
    let options = runtime.set_basic_optimization(options)?;
    let options =
        runtime.append_execution_provider(options, config.execution_provider, config.device_id)?;
    let session = runtime.load_model(options, model_path)?;
    let memory_info = runtime.create_cpu_memory_info()?;
    let run_options = runtime.create_run_options()?;
    let input_type = runtime.input_element_type(&session)?;
    let output_count = runtime.output_count(&session);

    let id = NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed);
    info!(
        session_id = id,
        provider = %config.execution_provider,
        device_id = config.device_id,
        input_type = %input_type,
        output_count,
        elapsed_secs = started.elapsed().as_secs_f64(),
        "Inference session ready"
    );

    Ok(InferenceSession {
        id,
        config: config.clone(),
        input_type,
        output_count,
        run_options,
        memory_info,
        session,
    })
}

/// Release the session in `slot`, if any. Safe to call repeatedly.
pub fn close_session<R: RuntimeApi>(slot: &mut Option<InferenceSession<R>>) {
    if let Some(session) = slot.take() {
        debug!(session_id = session.id, "Closing inference session");
        drop(session);
    }
}
