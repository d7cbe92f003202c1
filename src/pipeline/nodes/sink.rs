//! Sinks: download textures into [`PipelineOutput`](crate::pipeline::PipelineOutput).

use super::input;
use crate::error::{Error, Result};
use crate::gpu::{TextureFormat, TextureReader};
use crate::media::{Media, PixelFormat};
use crate::pipeline::message::Message;
use crate::pipeline::node::NodeContext;
use serde::{Deserialize, Serialize};
use tracing::trace;

/// A detected corner.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Keypoint {
    pub x: u32,
    pub y: u32,
    /// Corner score in `(0, 1]`.
    pub score: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SinkOptions {
    /// Return the pixels of an earlier run instead of waiting for this
    /// run's transfer.
    pub turbo: bool,
    /// Host buffers used by the reader in turbo mode.
    pub buffers: usize,
}

impl Default for SinkOptions {
    fn default() -> Self {
        Self {
            turbo: false,
            buffers: 2,
        }
    }
}

fn reader<'r>(slot: &'r mut Option<TextureReader>, options: &SinkOptions) -> Result<&'r mut TextureReader> {
    if slot.is_none() {
        *slot = Some(TextureReader::new(options.buffers)?);
    }
    slot.as_mut()
        .ok_or_else(|| Error::IllegalOperation("texture reader unavailable".to_string()))
}

/// Decode a corner texture: every texel with a non-zero score is a keypoint.
/// Strongest first, ties in raster order, at most `capacity` of them.
pub(crate) fn decode_keypoints(pixels: &[u8], width: u32, capacity: usize) -> Vec<Keypoint> {
    let mut keypoints: Vec<Keypoint> = pixels
        .chunks_exact(4)
        .enumerate()
        .filter(|(_, texel)| texel[1] > 0)
        .map(|(i, texel)| Keypoint {
            x: i as u32 % width,
            y: i as u32 / width,
            score: texel[1] as f32 / 255.0,
        })
        .collect();
    keypoints.sort_by(|a, b| b.score.total_cmp(&a.score));
    keypoints.truncate(capacity);
    keypoints
}

pub struct KeypointSink {
    options: SinkOptions,
    reader: Option<TextureReader>,
}

impl KeypointSink {
    pub fn new(options: SinkOptions) -> Self {
        Self { options, reader: None }
    }

    pub(crate) async fn run(&mut self, name: &str, ctx: &mut NodeContext<'_>, inputs: &[Option<Message>]) -> Result<Vec<Message>> {
        let (texture, capacity) = match input(name, inputs, 0)? {
            Message::Keypoints { texture, capacity } => (texture, capacity),
            other => return Err(Error::Type(format!("'{name}' expects keypoints, got {}", other.kind()))),
        };
        if texture.format != TextureFormat::Rgba8 {
            return Err(Error::Type(format!("keypoints must be encoded in an Rgba8 texture, got {texture}")));
        }

        let reader = reader(&mut self.reader, &self.options)?;
        let (region, pixels) = reader
            .read_region_async(ctx.gpu, &texture, self.options.turbo, None)
            .await?;
        // Turbo pixels may come from a run with a different texture size.
        let keypoints = decode_keypoints(pixels, region.width, capacity);
        trace!("'{}' received {} keypoints", name, keypoints.len());
        ctx.exports.keypoints.insert(name.to_string(), keypoints);
        Ok(vec![])
    }
}

pub struct ImageSink {
    options: SinkOptions,
    reader: Option<TextureReader>,
}

impl ImageSink {
    pub fn new(options: SinkOptions) -> Self {
        Self { options, reader: None }
    }

    pub(crate) async fn run(&mut self, name: &str, ctx: &mut NodeContext<'_>, inputs: &[Option<Message>]) -> Result<Vec<Message>> {
        let texture = match input(name, inputs, 0)? {
            Message::Image { texture, .. } => texture,
            other => return Err(Error::Type(format!("'{name}' expects an image, got {}", other.kind()))),
        };
        let format = match texture.format {
            TextureFormat::Rgba8 => PixelFormat::Rgba,
            TextureFormat::R8 => PixelFormat::Grey,
        };

        let reader = reader(&mut self.reader, &self.options)?;
        let (region, pixels) = reader
            .read_region_async(ctx.gpu, &texture, self.options.turbo, None)
            .await?;
        let media = Media::from_data(region.width, region.height, format, pixels.to_vec());
        ctx.exports.images.insert(name.to_string(), media);
        Ok(vec![])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn texel(score: u8) -> [u8; 4] {
        [128, score, 0, 255]
    }

    #[test]
    fn keypoints_are_sorted_by_score_and_capped() {
        let pixels: Vec<u8> = [texel(0), texel(10), texel(200), texel(10), texel(0), texel(90)]
            .concat();
        let keypoints = decode_keypoints(&pixels, 3, 3);
        let positions: Vec<(u32, u32)> = keypoints.iter().map(|k| (k.x, k.y)).collect();
        assert_eq!(positions, [(2, 0), (2, 1), (1, 0)]);
        assert!((keypoints[0].score - 200.0 / 255.0).abs() < 1e-6);
    }

    #[test]
    fn empty_corner_texture_has_no_keypoints() {
        assert!(decode_keypoints(&[0; 64], 4, 10).is_empty());
    }
}
