//! Thread-safe upscaler facade.
//!
//! One mutex guards the configuration and the live session. Every mutator and
//! every `upscale` call holds it for its full duration, so a session is never
//! rebuilt underneath an in-flight inference and never run from two threads
//! at once.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tracing::debug;

use crate::bitmap::{Bitmap, Gravity, Interpretation, Rect};
use crate::error::{Result, UpscaleError};
use crate::tensor::ElementType;
use crate::upscale::backend::{
    close_session, create_session, ExecutionProvider, InferenceSession, RuntimeApi, SessionConfig,
};
use crate::upscale::runner::infer_bitmap;
use crate::upscale::tiling::{copy_page_metadata, tiled_inference};

/// Images with more pixels than this are tiled (when tiling is enabled).
pub const DEFAULT_TILE_THRESHOLD: u64 = 512 * 512;

/// Snapshot of the live session, for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionInfo {
    pub session_id: u64,
    pub execution_provider: ExecutionProvider,
    pub device_id: i32,
    pub model_path: Option<PathBuf>,
    pub input_type: String,
    pub output_count: usize,
}

struct UpscalerState<R: RuntimeApi> {
    config: SessionConfig,
    tile_size: u32,
    tile_threshold: u64,
    crop_padding: bool,
    session: Option<InferenceSession<R>>,
}

impl<R: RuntimeApi> UpscalerState<R> {
    fn ensure_session(&mut self, runtime: &R) -> Result<&mut InferenceSession<R>> {
        if self.session.is_none() {
            self.session = Some(create_session(runtime, &self.config)?);
        }
        self.session
            .as_mut()
            .ok_or_else(|| UpscaleError::session("session unavailable"))
    }

    fn invalidate(&mut self, reason: &str) {
        if self.session.is_some() {
            debug!(reason, "Invalidating inference session");
        }
        close_session(&mut self.session);
    }
}

pub struct Upscaler<R: RuntimeApi> {
    runtime: R,
    state: Mutex<UpscalerState<R>>,
}

impl<R: RuntimeApi> Upscaler<R> {
    pub fn new(runtime: R) -> Self {
        Self {
            runtime,
            state: Mutex::new(UpscalerState {
                config: SessionConfig::default(),
                tile_size: 0,
                tile_threshold: DEFAULT_TILE_THRESHOLD,
                crop_padding: false,
                session: None,
            }),
        }
    }

    pub fn runtime(&self) -> &R {
        &self.runtime
    }

    // The state is only ever replaced field-by-field, so a panic while the
    // lock was held cannot leave it inconsistent.
    fn lock(&self) -> MutexGuard<'_, UpscalerState<R>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_execution_provider(&self, provider: ExecutionProvider, device_id: i32) {
        let mut state = self.lock();
        if state.config.execution_provider == provider && state.config.device_id == device_id {
            return;
        }
        state.config.execution_provider = provider;
        state.config.device_id = device_id;
        state.invalidate("execution provider changed");
    }

    pub fn set_model_path(&self, path: impl AsRef<Path>) {
        let path = path.as_ref();
        let mut state = self.lock();
        if state.config.model_path.as_deref() == Some(path) {
            return;
        }
        state.config.model_path = Some(path.to_path_buf());
        state.invalidate("model changed");
    }

    /// `0` disables tiling.
    pub fn set_tile_size(&self, tile_size: u32) {
        let mut state = self.lock();
        if state.tile_size == tile_size {
            return;
        }
        state.tile_size = tile_size;
        state.invalidate("tile size changed");
    }

    pub fn set_tile_threshold(&self, pixels: u64) {
        self.lock().tile_threshold = pixels;
    }

    /// Crop odd-dimension padding back out of the result.
    pub fn set_crop_padding(&self, crop: bool) {
        self.lock().crop_padding = crop;
    }

    pub fn close_current_session(&self) {
        self.lock().invalidate("closed by caller");
    }

    pub fn session_config(&self) -> SessionConfig {
        self.lock().config.clone()
    }

    pub fn tile_size(&self) -> u32 {
        self.lock().tile_size
    }

    pub fn tile_threshold(&self) -> u64 {
        self.lock().tile_threshold
    }

    pub fn crop_padding(&self) -> bool {
        self.lock().crop_padding
    }

    /// Id of the live session, if one is built.
    pub fn session_id(&self) -> Option<u64> {
        self.lock().session.as_ref().map(InferenceSession::id)
    }

    /// Build the session now if needed and describe it.
    pub fn session_info(&self) -> Result<SessionInfo> {
        let mut state = self.lock();
        let session = state.ensure_session(&self.runtime)?;
        Ok(describe(session))
    }

    /// Input element type of the live session, building it if needed.
    pub fn input_type(&self) -> Result<ElementType> {
        let mut state = self.lock();
        Ok(state.ensure_session(&self.runtime)?.input_type())
    }

    pub fn upscale(&self, image: &Bitmap) -> Result<Bitmap> {
        let mut guard = self.lock();
        let state = &mut *guard;
        let tile_size = state.tile_size;
        let tile_threshold = state.tile_threshold;
        let crop_padding = state.crop_padding;
        let session = state.ensure_session(&self.runtime)?;

        let (original_w, original_h) = (image.width(), image.height());
        let prepared = prepare_input(image)?;

        let tiled = tile_size != 0 && image.pixel_count() > tile_threshold;
        debug!(
            session_id = session.id(),
            width = original_w,
            height = original_h,
            padded_width = prepared.width(),
            padded_height = prepared.height(),
            tiled,
            "Upscaling image"
        );

        let mut result = if tiled {
            tiled_inference(&prepared, tile_size, |tile| {
                infer_bitmap(&self.runtime, session, tile)
            })?
        } else {
            let mut out = infer_bitmap(&self.runtime, session, &prepared)?;
            copy_page_metadata(&prepared, &mut out);
            out
        };

        let padded = prepared.width() != original_w || prepared.height() != original_h;
        if crop_padding && padded {
            let width = scaled(original_w, result.width(), prepared.width());
            let height = scaled(original_h, result.height(), prepared.height());
            result = result.crop(Rect::new(0, 0, width, height))?;
            copy_page_metadata(&prepared, &mut result);
        }

        Ok(result)
    }
}

impl<R: RuntimeApi> Drop for Upscaler<R> {
    fn drop(&mut self) {
        let state = self
            .state
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        close_session(&mut state.session);
    }
}

fn describe<R: RuntimeApi>(session: &InferenceSession<R>) -> SessionInfo {
    SessionInfo {
        session_id: session.id(),
        execution_provider: session.config().execution_provider,
        device_id: session.config().device_id,
        model_path: session.config().model_path.clone(),
        input_type: session.input_type().to_string(),
        output_count: session.output_count(),
    }
}

/// `original * output / padded`, for mapping a pre-pad extent onto the output.
fn scaled(original: u32, output: u32, padded: u32) -> u32 {
    (original as u64 * output as u64 / padded.max(1) as u64) as u32
}

/// Bring an arbitrary bitmap into model-ready shape: sRGB, exactly 3 bands,
/// even width and height.
fn prepare_input(image: &Bitmap) -> Result<Bitmap> {
    let mut prepared = if image.interpretation() != Interpretation::Srgb {
        image.to_srgb()?
    } else {
        image.clone()
    };
    if prepared.bands() == 4 {
        prepared = prepared.flatten_alpha()?;
    }
    if prepared.bands() != 3 {
        return Err(UpscaleError::image(format!(
            "unsupported band count {} after colour conversion",
            prepared.bands()
        )));
    }

    let width = prepared.width() + prepared.width() % 2;
    let height = prepared.height() + prepared.height() % 2;
    if width != prepared.width() || height != prepared.height() {
        prepared = prepared.pad(width, height, Gravity::West)?;
    }
    Ok(prepared)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use super::*;
    use crate::bitmap::PageMetadata;
    use crate::error::UpscaleErrorKind;
    use crate::upscale::mock::{FailPoint, MockRuntime};

    fn upscaler(scale: usize) -> Upscaler<MockRuntime> {
        let upscaler = Upscaler::new(MockRuntime::new(scale, ElementType::Float32));
        upscaler.set_model_path("models/x2.onnx");
        upscaler
    }

    fn rgb(width: u32, height: u32) -> Bitmap {
        let pixels = (0..width * height * 3).map(|i| (i % 253) as u8).collect();
        Bitmap::from_raw(pixels, width, height, 3).unwrap()
    }

    #[test]
    fn same_model_path_keeps_session() {
        let upscaler = upscaler(2);
        upscaler.upscale(&rgb(8, 8)).unwrap();
        let before = upscaler.session_id().unwrap();

        upscaler.set_model_path("models/x2.onnx");
        assert_eq!(upscaler.session_id(), Some(before));

        upscaler.set_model_path("models/x4.onnx");
        assert_eq!(upscaler.session_id(), None);
        upscaler.upscale(&rgb(8, 8)).unwrap();
        assert_ne!(upscaler.session_id(), Some(before));
        assert_eq!(upscaler.runtime().sessions_built(), 2);
    }

    #[test]
    fn provider_and_tile_changes_invalidate_only_when_different() {
        let upscaler = upscaler(2);
        upscaler.upscale(&rgb(4, 4)).unwrap();
        let id = upscaler.session_id();

        upscaler.set_execution_provider(ExecutionProvider::Cpu, 0);
        upscaler.set_tile_size(0);
        assert_eq!(upscaler.session_id(), id);

        upscaler.set_execution_provider(ExecutionProvider::Cuda, 0);
        assert_eq!(upscaler.session_id(), None);

        upscaler.upscale(&rgb(4, 4)).unwrap();
        upscaler.set_execution_provider(ExecutionProvider::Cuda, 1);
        assert_eq!(upscaler.session_id(), None);

        upscaler.upscale(&rgb(4, 4)).unwrap();
        upscaler.set_tile_size(128);
        assert_eq!(upscaler.session_id(), None);

        assert_eq!(
            upscaler.runtime().attached_providers(),
            vec![
                (ExecutionProvider::Cpu, 0),
                (ExecutionProvider::Cuda, 0),
                (ExecutionProvider::Cuda, 1),
            ]
        );
    }

    #[test]
    fn small_image_runs_whole() {
        let upscaler = upscaler(2);
        upscaler.set_tile_size(256);
        let out = upscaler.upscale(&rgb(400, 400)).unwrap();
        assert_eq!((out.width(), out.height()), (800, 800));
        assert_eq!(upscaler.runtime().run_inputs(), vec![(400, 400)]);
    }

    #[test]
    fn large_image_is_tiled() {
        let upscaler = upscaler(2);
        upscaler.set_tile_size(256);
        let image = rgb(600, 600);
        let out = upscaler.upscale(&image).unwrap();
        assert_eq!((out.width(), out.height()), (1200, 1200));

        let runs = upscaler.runtime().run_inputs();
        assert_eq!(runs.len(), 9);
        assert_eq!(runs[0], (256, 256));
        assert_eq!(runs[2], (256, 88));
        assert_eq!(runs[8], (88, 88));

        upscaler.set_tile_size(0);
        let whole = upscaler.upscale(&image).unwrap();
        assert_eq!(out, whole);
    }

    #[test]
    fn tiling_disabled_ignores_threshold() {
        let upscaler = upscaler(1);
        upscaler.set_tile_threshold(16);
        upscaler.upscale(&rgb(64, 64)).unwrap();
        assert_eq!(upscaler.runtime().run_inputs(), vec![(64, 64)]);
    }

    #[test]
    fn odd_dimensions_are_padded_and_kept() {
        let upscaler = upscaler(2);
        let out = upscaler.upscale(&rgb(401, 400)).unwrap();
        assert_eq!(upscaler.runtime().run_inputs(), vec![(400, 402)]);
        assert_eq!((out.width(), out.height()), (804, 800));
    }

    #[test]
    fn crop_padding_restores_scaled_original_size() {
        let upscaler = upscaler(2);
        upscaler.set_crop_padding(true);
        let out = upscaler.upscale(&rgb(401, 399)).unwrap();
        assert_eq!(upscaler.runtime().run_inputs(), vec![(400, 402)]);
        assert_eq!((out.width(), out.height()), (802, 798));
    }

    #[test]
    fn grey_and_alpha_inputs_become_rgb() {
        let upscaler = upscaler(1);
        let grey = Bitmap::from_raw(vec![50; 4], 2, 2, 1).unwrap();
        let out = upscaler.upscale(&grey).unwrap();
        assert_eq!(out.bands(), 3);
        assert_eq!(out.pixels(), &[50; 12]);

        let rgba = Bitmap::from_raw([100, 100, 100, 0].repeat(4), 2, 2, 4).unwrap();
        let out = upscaler.upscale(&rgba).unwrap();
        assert_eq!(out.pixels(), &[0; 12]);
    }

    #[test]
    fn direct_path_keeps_animation_metadata() {
        let upscaler = upscaler(2);
        let mut strip = rgb(10, 20);
        strip.set_pages(Some(PageMetadata {
            page_count: 2,
            page_height: 10,
            delays_ms: vec![80, 80],
        }));
        let out = upscaler.upscale(&strip).unwrap();
        assert_eq!(out.pages().unwrap().page_height, 20);
    }

    #[test]
    fn missing_model_leaves_no_session() {
        let upscaler = Upscaler::new(MockRuntime::new(2, ElementType::Float32));
        let err = upscaler.upscale(&rgb(4, 4)).unwrap_err();
        assert_eq!(err.kind(), UpscaleErrorKind::SessionInit);
        assert!(err.to_string().contains("model path is not initialized"));
        assert_eq!(upscaler.session_id(), None);
    }

    #[test]
    fn failed_build_stays_sessionless_and_recovers() {
        let upscaler = upscaler(2);
        upscaler.runtime().fail_at(Some(FailPoint::LoadModel));
        assert!(upscaler.upscale(&rgb(4, 4)).is_err());
        assert_eq!(upscaler.session_id(), None);
        assert_eq!(upscaler.runtime().live_handles(), 0);

        upscaler.runtime().fail_at(None);
        upscaler.upscale(&rgb(4, 4)).unwrap();
        assert!(upscaler.session_id().is_some());
    }

    #[test]
    fn inference_error_keeps_session() {
        let upscaler = upscaler(2);
        upscaler.upscale(&rgb(4, 4)).unwrap();
        let id = upscaler.session_id();

        upscaler.runtime().fail_at(Some(FailPoint::Run));
        let err = upscaler.upscale(&rgb(4, 4)).unwrap_err();
        assert_eq!(err.kind(), UpscaleErrorKind::Inference);
        assert_eq!(upscaler.session_id(), id);

        upscaler.runtime().fail_at(None);
        upscaler.upscale(&rgb(4, 4)).unwrap();
        assert_eq!(upscaler.session_id(), id);
    }

    #[test]
    fn close_releases_all_handles() {
        let upscaler = upscaler(2);
        upscaler.upscale(&rgb(4, 4)).unwrap();
        assert!(upscaler.runtime().live_handles() > 0);
        upscaler.close_current_session();
        upscaler.close_current_session();
        assert_eq!(upscaler.runtime().live_handles(), 0);
    }

    #[test]
    fn concurrent_calls_never_overlap_a_rebuild() {
        let runtime = MockRuntime::new(2, ElementType::Float32)
            .with_delays(Duration::from_millis(20), Duration::from_millis(2));
        let upscaler = Arc::new(Upscaler::new(runtime));
        upscaler.set_model_path("a.onnx");
        upscaler.set_tile_size(8);
        upscaler.set_tile_threshold(64);

        let workers: Vec<_> = (0..4)
            .map(|n| {
                let upscaler = Arc::clone(&upscaler);
                thread::spawn(move || {
                    for i in 0..5 {
                        if n == 0 {
                            let model = if i % 2 == 0 { "b.onnx" } else { "a.onnx" };
                            upscaler.set_model_path(model);
                        }
                        let out = upscaler.upscale(&rgb(16, 12)).unwrap();
                        assert_eq!((out.width(), out.height()), (32, 24));
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        assert_eq!(upscaler.runtime().max_concurrency(), 1);
        upscaler.close_current_session();
        assert_eq!(upscaler.runtime().live_handles(), 0);
    }

    #[test]
    fn session_info_builds_and_describes() {
        let upscaler = upscaler(2);
        upscaler.set_execution_provider(ExecutionProvider::TensorRt, 0);
        let info = upscaler.session_info().unwrap();
        assert_eq!(info.execution_provider, ExecutionProvider::TensorRt);
        assert_eq!(info.input_type, "float32");
        assert_eq!(info.output_count, 1);
        assert_eq!(upscaler.session_id(), Some(info.session_id));
    }

    #[test]
    fn scaled_maps_pre_pad_extent() {
        assert_eq!(scaled(401, 804, 402), 802);
        assert_eq!(scaled(400, 800, 400), 800);
    }
}
