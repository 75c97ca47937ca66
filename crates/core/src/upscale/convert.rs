//! Interleaved u8 RGB <-> planar NCHW float conversion.
//!
//! Both directions are element-wise and fan out over rayon. Values are
//! normalized to `[0, 1]` regardless of precision.

use half::f16;
use half::slice::HalfFloatSliceExt;
use rayon::prelude::*;

use crate::error::{Result, UpscaleError};
use crate::tensor::{ElementType, TensorBuffer, TensorData};

const CHANNELS: usize = TensorBuffer::CHANNELS;

/// f16 planes are filled through an f32 scratch buffer of this many samples.
const CHUNK: usize = 4096;

/// Convert an `h x w` RGB buffer into a `[1, 3, h, w]` tensor of `element_type`.
pub fn hwc_to_planar(
    pixels: &[u8],
    height: usize,
    width: usize,
    element_type: ElementType,
) -> Result<TensorBuffer> {
    let hw = checked_plane_len(height, width)?;
    if pixels.len() != hw * CHANNELS {
        return Err(UpscaleError::image(format!(
            "pixel buffer length mismatch: expected {} ({height}x{width}x3), got {}",
            hw * CHANNELS,
            pixels.len()
        )));
    }

    let data = match element_type {
        ElementType::Float32 => {
            let mut planes = vec![0.0f32; hw * CHANNELS];
            planes
                .par_chunks_mut(hw)
                .enumerate()
                .for_each(|(channel, plane)| {
                    plane.par_iter_mut().enumerate().for_each(|(i, value)| {
                        *value = pixels[i * CHANNELS + channel] as f32 / 255.0;
                    });
                });
            TensorData::F32(planes)
        }
        ElementType::Float16 => {
            let mut planes = vec![f16::ZERO; hw * CHANNELS];
            planes
                .par_chunks_mut(hw)
                .enumerate()
                .for_each(|(channel, plane)| {
                    plane
                        .par_chunks_mut(CHUNK)
                        .enumerate()
                        .for_each(|(chunk_index, chunk)| {
                            let mut scratch = [0.0f32; CHUNK];
                            let base = chunk_index * CHUNK;
                            for (j, value) in scratch[..chunk.len()].iter_mut().enumerate() {
                                *value = pixels[(base + j) * CHANNELS + channel] as f32 / 255.0;
                            }
                            chunk.convert_from_f32_slice(&scratch[..chunk.len()]);
                        });
                });
            TensorData::F16(planes)
        }
    };

    TensorBuffer::new(height, width, data)
}

/// Convert planar `[1, 3, h, w]` data back into interleaved RGB bytes.
///
/// Each sample is clamped to `[0, 1]` before scaling; model outputs routinely
/// overshoot.
pub fn planar_to_hwc(data: &TensorData, height: usize, width: usize) -> Result<Vec<u8>> {
    let hw = checked_plane_len(height, width)?;
    if data.len() != hw * CHANNELS {
        return Err(UpscaleError::inference(format!(
            "output tensor length mismatch: expected {} (3x{height}x{width}), got {}",
            hw * CHANNELS,
            data.len()
        )));
    }

    let mut rgb = vec![0u8; hw * CHANNELS];
    match data {
        TensorData::F32(planes) => {
            rgb.par_chunks_mut(CHANNELS)
                .enumerate()
                .for_each(|(i, px)| {
                    for (channel, byte) in px.iter_mut().enumerate() {
                        *byte = quantize(planes[channel * hw + i]);
                    }
                });
        }
        TensorData::F16(planes) => {
            rgb.par_chunks_mut(CHANNELS)
                .enumerate()
                .for_each(|(i, px)| {
                    for (channel, byte) in px.iter_mut().enumerate() {
                        *byte = quantize(planes[channel * hw + i].to_f32());
                    }
                });
        }
    }
    Ok(rgb)
}

#[inline]
fn quantize(value: f32) -> u8 {
    (value.clamp(0.0, 1.0) * 255.0).round() as u8
}

fn checked_plane_len(height: usize, width: usize) -> Result<usize> {
    if height == 0 || width == 0 {
        return Err(UpscaleError::image(format!(
            "invalid tensor dimensions {width}x{height}"
        )));
    }
    height
        .checked_mul(width)
        .ok_or_else(|| UpscaleError::image(format!("tensor dimensions {width}x{height} overflow")))
}
