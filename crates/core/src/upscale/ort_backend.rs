//! [`RuntimeApi`] backed by ONNX Runtime through `ort`.

use std::path::{Path, PathBuf};
use std::sync::mpsc::{channel, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use half::f16;
use ndarray::{ArrayD, IxDyn};
use ort::execution_providers::cuda::ConvAlgorithmSearch;
use ort::execution_providers::{
    ArenaExtendStrategy, CPUExecutionProvider, CUDAExecutionProvider, DirectMLExecutionProvider,
    ExecutionProvider as _, ExecutionProviderDispatch, ROCmExecutionProvider,
    TensorRTExecutionProvider, WebGPUExecutionProvider,
};
use ort::memory::{AllocationDevice, AllocatorType, MemoryInfo, MemoryType};
use ort::session::builder::{GraphOptimizationLevel, SessionBuilder};
use ort::session::{RunOptions, Session};
use ort::tensor::TensorElementType;
use ort::value::{DynValue, Tensor, ValueType};
use tracing::{debug, error, info, warn};

use crate::error::{Result, UpscaleError};
use crate::runtime::{check_ort_api_version, resolved_ort_dylib};
use crate::tensor::{ElementType, OutputTensor, TensorBuffer, TensorData};
use crate::upscale::backend::{ExecutionProvider, RuntimeApi};

/// Session options plus the provider they were configured for, so model
/// loading can report TensorRT engine builds.
pub struct OrtOptions {
    builder: SessionBuilder,
    provider: ExecutionProvider,
}

pub struct OrtRuntime {
    trt_cache_dir: PathBuf,
}

impl OrtRuntime {
    /// Check the configured ONNX Runtime library and prepare a runtime that
    /// writes TensorRT engines to `trt_cache_dir`.
    pub fn new(trt_cache_dir: impl Into<PathBuf>) -> Result<Self> {
        if let Some(dylib) = resolved_ort_dylib() {
            check_ort_api_version(&dylib)?;
        }
        Ok(Self {
            trt_cache_dir: trt_cache_dir.into(),
        })
    }

    pub fn trt_cache_dir(&self) -> &Path {
        &self.trt_cache_dir
    }

    fn provider_chain(
        &self,
        provider: ExecutionProvider,
        device_id: i32,
    ) -> Vec<ExecutionProviderDispatch> {
        match provider {
            ExecutionProvider::Cpu => vec![CPUExecutionProvider::default().build()],
            ExecutionProvider::Cuda => vec![cuda(device_id).build().error_on_failure()],
            ExecutionProvider::TensorRt => {
                if let Err(e) = std::fs::create_dir_all(&self.trt_cache_dir) {
                    warn!(
                        dir = %self.trt_cache_dir.display(),
                        error = %e,
                        "Failed to create TRT cache directory"
                    );
                }
                // TRT may be missing at runtime (no libnvinfer); CUDA then
                // takes the whole graph.
                vec![
                    TensorRTExecutionProvider::default()
                        .with_engine_cache(true)
                        .with_engine_cache_path(self.trt_cache_dir.to_string_lossy().to_string())
                        .with_fp16(true)
                        .with_device_id(device_id)
                        .build(),
                    cuda(device_id).build().error_on_failure(),
                ]
            }
            ExecutionProvider::Rocm => vec![ROCmExecutionProvider::default()
                .with_device_id(device_id)
                .build()
                .error_on_failure()],
            ExecutionProvider::DirectMl => vec![DirectMLExecutionProvider::default()
                .with_device_id(device_id)
                .build()
                .error_on_failure()],
            ExecutionProvider::WebGpu => {
                vec![WebGPUExecutionProvider::default().build().error_on_failure()]
            }
        }
    }
}

fn cuda(device_id: i32) -> CUDAExecutionProvider {
    CUDAExecutionProvider::default()
        .with_device_id(device_id)
        .with_conv_algorithm_search(ConvAlgorithmSearch::Heuristic)
        .with_memory_limit(usize::MAX)
        .with_arena_extend_strategy(ArenaExtendStrategy::NextPowerOfTwo)
}

#[derive(Clone, Copy, Debug, Default)]
struct CacheStats {
    file_count: u64,
    total_bytes: u64,
}

fn cache_stats(root: &Path) -> CacheStats {
    let mut stats = CacheStats::default();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else if let Ok(meta) = entry.metadata() {
                stats.file_count += 1;
                stats.total_bytes += meta.len();
            }
        }
    }
    stats
}

/// Load a model under TensorRT, logging progress while engines are built.
fn commit_with_trt_progress(
    builder: SessionBuilder,
    model_path: &Path,
    cache_dir: &Path,
) -> Result<Session> {
    let before = cache_stats(cache_dir);
    let started = Instant::now();
    info!(
        cache_dir = %cache_dir.display(),
        cache_files = before.file_count,
        cache_bytes = before.total_bytes,
        "Initializing TensorRT session (first run may take several minutes)"
    );

    let (stop_tx, stop_rx) = channel::<()>();
    let cache_dir_for_log = cache_dir.display().to_string();
    let progress = thread::spawn(move || {
        let tick = Duration::from_secs(15);
        let mut elapsed = 15_u64;
        loop {
            match stop_rx.recv_timeout(tick) {
                Ok(_) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {
                    info!(
                        elapsed_secs = elapsed,
                        cache_dir = %cache_dir_for_log,
                        "TensorRT session initialization still in progress"
                    );
                    elapsed += 15;
                }
            }
        }
    });

    let result = builder.commit_from_file(model_path);
    let _ = stop_tx.send(());
    let _ = progress.join();

    let elapsed = started.elapsed().as_secs_f64();
    let after = cache_stats(cache_dir);
    match result {
        Ok(session) => {
            let updated =
                after.file_count > before.file_count || after.total_bytes > before.total_bytes;
            info!(
                elapsed_secs = elapsed,
                cache_dir = %cache_dir.display(),
                cache_files = after.file_count,
                cache_bytes = after.total_bytes,
                cache_updated = updated,
                "TensorRT session ready"
            );
            Ok(session)
        }
        Err(e) => {
            error!(
                elapsed_secs = elapsed,
                cache_dir = %cache_dir.display(),
                error = %e,
                "TensorRT session initialization failed"
            );
            Err(UpscaleError::session(format!(
                "failed to load {}: {e}",
                model_path.display()
            )))
        }
    }
}

fn extract_output(name: &str, value: &DynValue) -> Result<OutputTensor> {
    if let Ok(view) = value.try_extract_array::<f32>() {
        return Ok(OutputTensor {
            shape: view.shape().iter().map(|&d| d as i64).collect(),
            data: TensorData::F32(view.iter().copied().collect()),
        });
    }
    let view = value
        .try_extract_array::<f16>()
        .map_err(|e| UpscaleError::inference(format!("output {name}: {e}")))?;
    Ok(OutputTensor {
        shape: view.shape().iter().map(|&d| d as i64).collect(),
        data: TensorData::F16(view.iter().copied().collect()),
    })
}

impl RuntimeApi for OrtRuntime {
    type Options = OrtOptions;
    type Session = Session;
    type MemoryInfo = MemoryInfo;
    type RunOptions = RunOptions;
    type Value = DynValue;

    fn create_session_options(&self) -> Result<OrtOptions> {
        let builder = Session::builder().map_err(UpscaleError::session)?;
        Ok(OrtOptions {
            builder,
            provider: ExecutionProvider::Cpu,
        })
    }

    fn set_basic_optimization(&self, options: OrtOptions) -> Result<OrtOptions> {
        let builder = options
            .builder
            .with_optimization_level(GraphOptimizationLevel::Level1)
            .map_err(UpscaleError::session)?;
        Ok(OrtOptions { builder, ..options })
    }

    fn append_execution_provider(
        &self,
        options: OrtOptions,
        provider: ExecutionProvider,
        device_id: i32,
    ) -> Result<OrtOptions> {
        let mut builder = options.builder;
        if provider == ExecutionProvider::DirectMl {
            // DirectML does not support parallel execution or memory patterns.
            builder = builder
                .with_parallel_execution(false)
                .and_then(|b| b.with_memory_pattern(false))
                .map_err(UpscaleError::provider)?;
        }
        debug!(%provider, device_id, "Attaching execution provider");
        let builder = builder
            .with_execution_providers(self.provider_chain(provider, device_id))
            .map_err(|e| UpscaleError::provider(format!("{provider}: {e}")))?;
        Ok(OrtOptions { builder, provider })
    }

    fn load_model(&self, options: OrtOptions, model_path: &Path) -> Result<Session> {
        if options.provider == ExecutionProvider::TensorRt {
            return commit_with_trt_progress(options.builder, model_path, &self.trt_cache_dir);
        }
        options.builder.commit_from_file(model_path).map_err(|e| {
            UpscaleError::session(format!("failed to load {}: {e}", model_path.display()))
        })
    }

    fn create_cpu_memory_info(&self) -> Result<MemoryInfo> {
        MemoryInfo::new(
            AllocationDevice::CPU,
            0,
            AllocatorType::Arena,
            MemoryType::Default,
        )
        .map_err(UpscaleError::session)
    }

    fn create_run_options(&self) -> Result<RunOptions> {
        RunOptions::new().map_err(UpscaleError::session)
    }

    fn input_element_type(&self, session: &Session) -> Result<ElementType> {
        let input = session
            .inputs()
            .first()
            .ok_or_else(|| UpscaleError::session("model declares no inputs"))?;
        match input.dtype() {
            ValueType::Tensor {
                ty: TensorElementType::Float32,
                ..
            } => Ok(ElementType::Float32),
            ValueType::Tensor {
                ty: TensorElementType::Float16,
                ..
            } => Ok(ElementType::Float16),
            other => Err(UpscaleError::session(format!(
                "unsupported model input type {other:?}"
            ))),
        }
    }

    fn output_count(&self, session: &Session) -> usize {
        session.outputs().len()
    }

    fn input_name(&self, session: &Session) -> Result<String> {
        session
            .inputs()
            .first()
            .map(|input| input.name().to_string())
            .ok_or_else(|| UpscaleError::inference("model declares no inputs"))
    }

    fn output_names(&self, session: &Session) -> Result<Vec<String>> {
        let names: Vec<String> = session
            .outputs()
            .iter()
            .map(|output| output.name().to_string())
            .collect();
        if names.is_empty() {
            return Err(UpscaleError::inference("model declares no outputs"));
        }
        Ok(names)
    }

    // Owned arrays are handed to ORT without a copy and live in CPU memory,
    // the same placement the session's memory info describes.
    fn create_tensor(&self, _memory_info: &MemoryInfo, input: TensorBuffer) -> Result<DynValue> {
        let shape = IxDyn(&input.shape());
        let value = match input.data {
            TensorData::F32(data) => {
                let array = ArrayD::from_shape_vec(shape, data)
                    .map_err(UpscaleError::inference)?;
                Tensor::from_array(array)
                    .map_err(UpscaleError::inference)?
                    .into_dyn()
            }
            TensorData::F16(data) => {
                let array = ArrayD::from_shape_vec(shape, data)
                    .map_err(UpscaleError::inference)?;
                Tensor::from_array(array)
                    .map_err(UpscaleError::inference)?
                    .into_dyn()
            }
        };
        Ok(value)
    }

    fn run(
        &self,
        session: &mut Session,
        run_options: &RunOptions,
        input_name: &str,
        input: DynValue,
        output_names: &[String],
    ) -> Result<Vec<OutputTensor>> {
        let outputs = session
            .run_with_options(ort::inputs![input_name => &input], run_options)
            .map_err(UpscaleError::inference)?;
        output_names
            .iter()
            .map(|name| extract_output(name, &outputs[name.as_str()]))
            .collect()
    }
}
