//! Counting in-memory runtime for tests.
//!
//! Every handle bumps a shared live counter on creation and decrements it on
//! drop, so leaks show up as a non-zero count. The "model" is a
//! nearest-neighbour upscaler by an integer factor.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::{Result, UpscaleError};
use crate::tensor::{ElementType, OutputTensor, TensorBuffer, TensorData};
use crate::upscale::backend::{ExecutionProvider, RuntimeApi};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FailPoint {
    Options,
    Optimization,
    Provider,
    LoadModel,
    MemoryInfo,
    RunOptions,
    InputType,
    InputName,
    OutputNames,
    Tensor,
    Run,
}

pub(crate) struct Handle {
    live: Arc<AtomicUsize>,
}

impl Handle {
    fn new(live: &Arc<AtomicUsize>) -> Self {
        live.fetch_add(1, Ordering::SeqCst);
        Self { live: live.clone() }
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

pub(crate) struct MockSession {
    _handle: Handle,
    pub(crate) model_path: PathBuf,
}

pub(crate) struct MockValue {
    _handle: Handle,
    tensor: TensorBuffer,
}

struct Busy<'a>(&'a AtomicUsize);

impl<'a> Busy<'a> {
    fn enter(counter: &'a AtomicUsize, max: &AtomicUsize) -> Self {
        let now = counter.fetch_add(1, Ordering::SeqCst) + 1;
        max.fetch_max(now, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for Busy<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub(crate) struct MockRuntime {
    live: Arc<AtomicUsize>,
    scale: usize,
    element_type: ElementType,
    fail_at: Mutex<Option<FailPoint>>,
    providers: Mutex<Vec<(ExecutionProvider, i32)>>,
    run_inputs: Mutex<Vec<(usize, usize)>>,
    sessions_built: AtomicUsize,
    build_delay: Duration,
    run_delay: Duration,
    busy: AtomicUsize,
    max_busy: AtomicUsize,
}

impl MockRuntime {
    pub(crate) fn new(scale: usize, element_type: ElementType) -> Self {
        Self {
            live: Arc::new(AtomicUsize::new(0)),
            scale,
            element_type,
            fail_at: Mutex::new(None),
            providers: Mutex::new(Vec::new()),
            run_inputs: Mutex::new(Vec::new()),
            sessions_built: AtomicUsize::new(0),
            build_delay: Duration::ZERO,
            run_delay: Duration::ZERO,
            busy: AtomicUsize::new(0),
            max_busy: AtomicUsize::new(0),
        }
    }

    pub(crate) fn with_delays(mut self, build: Duration, run: Duration) -> Self {
        self.build_delay = build;
        self.run_delay = run;
        self
    }

    pub(crate) fn fail_at(&self, point: Option<FailPoint>) {
        *self.fail_at.lock().unwrap() = point;
    }

    pub(crate) fn live_handles(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub(crate) fn sessions_built(&self) -> usize {
        self.sessions_built.load(Ordering::SeqCst)
    }

    pub(crate) fn attached_providers(&self) -> Vec<(ExecutionProvider, i32)> {
        self.providers.lock().unwrap().clone()
    }

    /// `(height, width)` of every tensor passed to `run`, in call order.
    pub(crate) fn run_inputs(&self) -> Vec<(usize, usize)> {
        self.run_inputs.lock().unwrap().clone()
    }

    /// Highest number of builds/runs observed in flight at once.
    pub(crate) fn max_concurrency(&self) -> usize {
        self.max_busy.load(Ordering::SeqCst)
    }

    fn check(&self, point: FailPoint) -> Result<()> {
        if *self.fail_at.lock().unwrap() != Some(point) {
            return Ok(());
        }
        let message = format!("injected failure at {point:?}");
        Err(match point {
            FailPoint::Provider => UpscaleError::provider(message),
            FailPoint::InputName
            | FailPoint::OutputNames
            | FailPoint::Tensor
            | FailPoint::Run => UpscaleError::inference(message),
            _ => UpscaleError::session(message),
        })
    }
}

fn nearest<T: Copy>(plane: &[T], height: usize, width: usize, scale: usize) -> Vec<T> {
    let out_w = width * scale;
    let mut out = Vec::with_capacity(plane.len() * scale * scale);
    for y in 0..height * scale {
        let row = &plane[(y / scale) * width..(y / scale + 1) * width];
        out.extend((0..out_w).map(|x| row[x / scale]));
    }
    out
}

fn upscale_planes<T: Copy>(data: &[T], height: usize, width: usize, scale: usize) -> Vec<T> {
    data.chunks(height * width)
        .flat_map(|plane| nearest(plane, height, width, scale))
        .collect()
}

impl RuntimeApi for MockRuntime {
    type Options = Handle;
    type Session = MockSession;
    type MemoryInfo = Handle;
    type RunOptions = Handle;
    type Value = MockValue;

    fn create_session_options(&self) -> Result<Handle> {
        self.check(FailPoint::Options)?;
        Ok(Handle::new(&self.live))
    }

    fn set_basic_optimization(&self, options: Handle) -> Result<Handle> {
        self.check(FailPoint::Optimization)?;
        Ok(options)
    }

    fn append_execution_provider(
        &self,
        options: Handle,
        provider: ExecutionProvider,
        device_id: i32,
    ) -> Result<Handle> {
        self.check(FailPoint::Provider)?;
        self.providers.lock().unwrap().push((provider, device_id));
        Ok(options)
    }

    fn load_model(&self, options: Handle, model_path: &Path) -> Result<MockSession> {
        let _busy = Busy::enter(&self.busy, &self.max_busy);
        std::thread::sleep(self.build_delay);
        self.check(FailPoint::LoadModel)?;
        drop(options);
        self.sessions_built.fetch_add(1, Ordering::SeqCst);
        Ok(MockSession {
            _handle: Handle::new(&self.live),
            model_path: model_path.to_path_buf(),
        })
    }

    fn create_cpu_memory_info(&self) -> Result<Handle> {
        self.check(FailPoint::MemoryInfo)?;
        Ok(Handle::new(&self.live))
    }

    fn create_run_options(&self) -> Result<Handle> {
        self.check(FailPoint::RunOptions)?;
        Ok(Handle::new(&self.live))
    }

    fn input_element_type(&self, _session: &MockSession) -> Result<ElementType> {
        self.check(FailPoint::InputType)?;
        Ok(self.element_type)
    }

    fn output_count(&self, _session: &MockSession) -> usize {
        1
    }

    fn input_name(&self, _session: &MockSession) -> Result<String> {
        self.check(FailPoint::InputName)?;
        Ok("input".to_string())
    }

    fn output_names(&self, _session: &MockSession) -> Result<Vec<String>> {
        self.check(FailPoint::OutputNames)?;
        Ok(vec!["output".to_string()])
    }

    fn create_tensor(&self, _memory_info: &Handle, input: TensorBuffer) -> Result<MockValue> {
        self.check(FailPoint::Tensor)?;
        Ok(MockValue {
            _handle: Handle::new(&self.live),
            tensor: input,
        })
    }

    fn run(
        &self,
        _session: &mut MockSession,
        _run_options: &Handle,
        _input_name: &str,
        input: MockValue,
        _output_names: &[String],
    ) -> Result<Vec<OutputTensor>> {
        let _busy = Busy::enter(&self.busy, &self.max_busy);
        std::thread::sleep(self.run_delay);
        self.check(FailPoint::Run)?;

        let TensorBuffer {
            height,
            width,
            ref data,
        } = input.tensor;
        self.run_inputs.lock().unwrap().push((height, width));
        let s = self.scale;
        let data = match data {
            TensorData::F32(planes) => TensorData::F32(upscale_planes(planes, height, width, s)),
            TensorData::F16(planes) => TensorData::F16(upscale_planes(planes, height, width, s)),
        };
        Ok(vec![OutputTensor {
            shape: vec![1, 3, (height * s) as i64, (width * s) as i64],
            data,
        }])
    }
}
