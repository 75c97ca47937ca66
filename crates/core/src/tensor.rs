use half::f16;

use crate::error::{Result, UpscaleError};

/// Numeric element type of a model's input tensor.
///
/// Only FP32 and FP16 models are supported; anything else is rejected when
/// the session is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElementType {
    Float32,
    Float16,
}

impl std::fmt::Display for ElementType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Float32 => write!(f, "float32"),
            Self::Float16 => write!(f, "float16"),
        }
    }
}

/// Owned planar tensor data in one of the supported precisions.
#[derive(Debug, Clone, PartialEq)]
pub enum TensorData {
    F32(Vec<f32>),
    F16(Vec<f16>),
}

impl TensorData {
    pub fn element_type(&self) -> ElementType {
        match self {
            Self::F32(_) => ElementType::Float32,
            Self::F16(_) => ElementType::Float16,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::F32(data) => data.len(),
            Self::F16(data) => data.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// NCHW `[1, 3, H, W]` input tensor, exclusively owned by the call that built it.
#[derive(Debug, Clone, PartialEq)]
pub struct TensorBuffer {
    pub height: usize,
    pub width: usize,
    pub data: TensorData,
}

impl TensorBuffer {
    pub const CHANNELS: usize = 3;

    pub fn new(height: usize, width: usize, data: TensorData) -> Result<Self> {
        let expected = Self::CHANNELS * height * width;
        if data.len() != expected {
            return Err(UpscaleError::inference(format!(
                "tensor data length mismatch: expected {expected} (3x{height}x{width}), got {}",
                data.len()
            )));
        }
        Ok(Self {
            height,
            width,
            data,
        })
    }

    pub fn shape(&self) -> [usize; 4] {
        [1, Self::CHANNELS, self.height, self.width]
    }

    pub fn element_type(&self) -> ElementType {
        self.data.element_type()
    }
}

/// One model output copied out of the runtime: raw dims plus owned data.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputTensor {
    pub shape: Vec<i64>,
    pub data: TensorData,
}

impl OutputTensor {
    /// Height and width of an NCHW image tensor (the last two dimensions).
    pub fn image_dims(&self) -> Result<(usize, usize)> {
        if self.shape.len() != 4 {
            return Err(UpscaleError::inference(format!(
                "unexpected number of output dimensions: {}",
                self.shape.len()
            )));
        }
        let height = self.shape[2];
        let width = self.shape[3];
        if height <= 0 || width <= 0 {
            return Err(UpscaleError::inference(format!(
                "invalid output dimensions {width}x{height}"
            )));
        }
        Ok((height as usize, width as usize))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tensor_buffer_rejects_wrong_length() {
        let err = TensorBuffer::new(2, 2, TensorData::F32(vec![0.0; 11])).unwrap_err();
        assert!(err.to_string().contains("expected 12"));
    }

    #[test]
    fn tensor_buffer_shape_is_nchw() {
        let buf = TensorBuffer::new(4, 5, TensorData::F16(vec![f16::ZERO; 60])).unwrap();
        assert_eq!(buf.shape(), [1, 3, 4, 5]);
        assert_eq!(buf.element_type(), ElementType::Float16);
    }

    #[test]
    fn output_image_dims_requires_four_dims() {
        let out = OutputTensor {
            shape: vec![1, 3, 8],
            data: TensorData::F32(vec![0.0; 24]),
        };
        assert!(out.image_dims().is_err());

        let out = OutputTensor {
            shape: vec![1, 3, 8, 6],
            data: TensorData::F32(vec![0.0; 144]),
        };
        assert_eq!(out.image_dims().unwrap(), (8, 6));
    }
}
