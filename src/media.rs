//! Host-side images fed into a pipeline and returned by image sinks.

use crate::error::{Error, Result};
use std::path::Path;

/// Supported pixel formats for media.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// RGB with 8 bits per channel (24 bits per pixel)
    Rgb,
    /// RGBA with 8 bits per channel (32 bits per pixel)
    Rgba,
    /// Single 8-bit luma channel
    Grey,
}

impl PixelFormat {
    pub fn bytes_per_pixel(&self) -> usize {
        match self {
            PixelFormat::Rgb => 3,
            PixelFormat::Rgba => 4,
            PixelFormat::Grey => 1,
        }
    }
}

/// An image held in host memory.
#[derive(Debug, Clone)]
pub struct Media {
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
    pub format: PixelFormat,
    /// Tightly packed pixel data
    pub data: Vec<u8>,
}

impl Media {
    pub fn from_data(width: u32, height: u32, format: PixelFormat, data: Vec<u8>) -> Self {
        Self {
            width,
            height,
            format,
            data,
        }
    }

    /// Decode an image file with the `image` crate.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let decoded = image::open(path)
            .map_err(|e| Error::Type(format!("cannot decode {}: {}", path.display(), e)))?
            .into_rgba8();
        let (width, height) = decoded.dimensions();
        Ok(Self::from_data(width, height, PixelFormat::Rgba, decoded.into_raw()))
    }

    /// Check that this is a well-formed image: non-empty, with a byte
    /// length matching its format.
    pub fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(Error::Type(format!("media has an empty {}x{} size", self.width, self.height)));
        }
        let expected = self.width as usize * self.height as usize * self.format.bytes_per_pixel();
        if self.data.len() != expected {
            return Err(Error::Type(format!(
                "{}x{} {:?} media needs {} bytes, got {}",
                self.width,
                self.height,
                self.format,
                expected,
                self.data.len()
            )));
        }
        Ok(())
    }

    /// Scale this image down if either dimension exceeds `max_dimension`.
    /// Preserves aspect ratio. Always converts to RGBA.
    pub fn scale_to_fit(&self, max_dimension: u32) -> Result<Media> {
        let rgba = self.to_rgba();
        let max_dim = self.width.max(self.height);
        if max_dim <= max_dimension {
            return Ok(rgba);
        }

        let scale = max_dimension as f32 / max_dim as f32;
        let new_width = ((self.width as f32 * scale) as u32).max(1);
        let new_height = ((self.height as f32 * scale) as u32).max(1);

        let img = image::RgbaImage::from_raw(rgba.width, rgba.height, rgba.data)
            .ok_or_else(|| Error::Type("media buffer does not match its size".to_string()))?;
        let resized = image::imageops::resize(&img, new_width, new_height, image::imageops::FilterType::Triangle);
        tracing::debug!("Scaled media from {}x{} to {}x{}", self.width, self.height, new_width, new_height);

        Ok(Media {
            width: new_width,
            height: new_height,
            format: PixelFormat::Rgba,
            data: resized.into_raw(),
        })
    }

    /// Converts this image to RGBA.
    pub fn to_rgba(&self) -> Media {
        if self.format == PixelFormat::Rgba {
            return self.clone();
        }

        let pixel_count = self.width as usize * self.height as usize;
        let mut rgba_data = Vec::with_capacity(pixel_count * 4);
        match self.format {
            PixelFormat::Rgb => {
                for rgb in self.data.chunks_exact(3) {
                    rgba_data.extend_from_slice(&[rgb[0], rgb[1], rgb[2], 255]);
                }
            }
            PixelFormat::Grey => {
                for &luma in &self.data {
                    rgba_data.extend_from_slice(&[luma, luma, luma, 255]);
                }
            }
            PixelFormat::Rgba => rgba_data.extend_from_slice(&self.data),
        }

        Media {
            width: self.width,
            height: self.height,
            format: PixelFormat::Rgba,
            data: rgba_data,
        }
    }
}
