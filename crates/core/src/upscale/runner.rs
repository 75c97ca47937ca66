//! Single forward pass through an [`InferenceSession`].

use tracing::trace;

use crate::bitmap::Bitmap;
use crate::error::{Result, UpscaleError};
use crate::tensor::{OutputTensor, TensorBuffer};
use crate::upscale::backend::{InferenceSession, RuntimeApi};
use crate::upscale::convert::{hwc_to_planar, planar_to_hwc};

/// Run `input` through `session` exactly once.
///
/// The runtime tensor, name lookups and the runtime's own output values are
/// all scoped to this call; whichever step fails, they are released before
/// the error is returned.
pub fn run_inference<R: RuntimeApi>(
    runtime: &R,
    session: &mut InferenceSession<R>,
    input: TensorBuffer,
) -> Result<Vec<OutputTensor>> {
    if input.element_type() != session.input_type() {
        return Err(UpscaleError::inference(format!(
            "input tensor is {} but the model expects {}",
            input.element_type(),
            session.input_type()
        )));
    }

    let input_name = runtime.input_name(&session.session)?;
    let output_names = runtime.output_names(&session.session)?;
    trace!(%input_name, ?output_names, shape = ?input.shape(), "Running inference");

    let value = runtime.create_tensor(&session.memory_info, input)?;
    runtime.run(
        &mut session.session,
        &session.run_options,
        &input_name,
        value,
        &output_names,
    )
}

/// Upscale one 3-band bitmap through the session and return the model's
/// first output as a bitmap tagged like `input`.
pub fn infer_bitmap<R: RuntimeApi>(
    runtime: &R,
    session: &mut InferenceSession<R>,
    input: &Bitmap,
) -> Result<Bitmap> {
    if input.bands() != 3 {
        return Err(UpscaleError::image(format!(
            "model input must have 3 bands, got {}",
            input.bands()
        )));
    }
    let tensor = hwc_to_planar(
        input.pixels(),
        input.height() as usize,
        input.width() as usize,
        session.input_type(),
    )?;
    let outputs = run_inference(runtime, session, tensor)?;
    let output = outputs
        .first()
        .ok_or_else(|| UpscaleError::inference("model produced no outputs"))?;
    tensor_to_bitmap(output, input)
}

/// Convert an NCHW output tensor into an interleaved bitmap formatted like `like`.
pub fn tensor_to_bitmap(output: &OutputTensor, like: &Bitmap) -> Result<Bitmap> {
    let (height, width) = output.image_dims()?;
    if output.shape[1] != TensorBuffer::CHANNELS as i64 {
        return Err(UpscaleError::inference(format!(
            "model output has {} channels, expected 3",
            output.shape[1]
        )));
    }
    let pixels = planar_to_hwc(&output.data, height, width)?;
    Bitmap::from_raw(pixels, width as u32, height as u32, 3)?.with_format_of(like)
}
