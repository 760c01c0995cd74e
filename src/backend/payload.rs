use image::{DynamicImage, GrayImage, ImageFormat, RgbImage};
use serde::{Deserialize, Serialize};
use std::io::Cursor;

use axum::body::Bytes;

/// Layout of the raw tensor bytes produced by preprocessing (HWC, u8).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorShape {
    pub height: u32,
    pub width: u32,
    pub channels: u32,
}

impl Default for TensorShape {
    fn default() -> Self {
        Self {
            height: 224,
            width: 224,
            channels: 3,
        }
    }
}

impl TensorShape {
    pub fn byte_len(&self) -> usize {
        self.height as usize * self.width as usize * self.channels as usize
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PayloadError {
    #[error("payload has {actual} bytes, shape {height}x{width}x{channels} needs {expected}")]
    ShapeMismatch {
        height: u32,
        width: u32,
        channels: u32,
        expected: usize,
        actual: usize,
    },

    #[error("unsupported channel count {0}")]
    UnsupportedChannels(u32),

    #[error("png encoding failed: {0}")]
    Encode(String),
}

/// Wrap a raw tensor into a PNG container.
pub fn encode_png(raw: &[u8], shape: TensorShape) -> Result<Bytes, PayloadError> {
    if raw.len() != shape.byte_len() {
        return Err(PayloadError::ShapeMismatch {
            height: shape.height,
            width: shape.width,
            channels: shape.channels,
            expected: shape.byte_len(),
            actual: raw.len(),
        });
    }

    let image = match shape.channels {
        3 => RgbImage::from_raw(shape.width, shape.height, raw.to_vec()).map(DynamicImage::ImageRgb8),
        1 => GrayImage::from_raw(shape.width, shape.height, raw.to_vec()).map(DynamicImage::ImageLuma8),
        other => return Err(PayloadError::UnsupportedChannels(other)),
    }
    .ok_or_else(|| PayloadError::Encode("buffer does not fit image dimensions".to_string()))?;

    let mut buffer = Cursor::new(Vec::new());
    image
        .write_to(&mut buffer, ImageFormat::Png)
        .map_err(|e| PayloadError::Encode(e.to_string()))?;

    Ok(Bytes::from(buffer.into_inner()))
}
