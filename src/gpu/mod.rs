//! GPU layer: the context abstraction, textures, programs and readback.

mod kernels;
pub mod program_group;
pub mod programs;
pub mod shader;
mod software;
pub mod texture_pool;
pub mod texture_reader;
mod wgpu_context;

pub use program_group::{Arg, Args, ProgramGroup, ProgramOptions};
pub use shader::{import_shader, ShaderDeclaration};
pub use software::SoftwareContext;
pub use texture_pool::{SlotState, TexturePool};
pub use texture_reader::TextureReader;
pub use wgpu_context::WgpuContext;

use crate::error::{BoxedCause, Result};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

/// Texel layout of a texture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureFormat {
    /// Four 8-bit normalized channels.
    Rgba8,
    /// One 8-bit normalized channel.
    R8,
}

impl TextureFormat {
    pub fn bytes_per_pixel(&self) -> usize {
        match self {
            TextureFormat::Rgba8 => 4,
            TextureFormat::R8 => 1,
        }
    }
}

/// Handle of a texture (and its render target) inside a [`GpuContext`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct TextureId(pub u32);

/// Handle of a compiled program inside a [`GpuContext`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct ProgramId(pub u32);

/// A GPU texture as seen by the host: a handle plus its shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Texture {
    pub id: TextureId,
    pub width: u32,
    pub height: u32,
    pub format: TextureFormat,
}

impl Texture {
    /// Size of the whole texture in bytes.
    pub fn byte_len(&self) -> usize {
        self.width as usize * self.height as usize * self.format.bytes_per_pixel()
    }

    pub fn full_region(&self) -> Region {
        Region {
            x: 0,
            y: 0,
            width: self.width,
            height: self.height,
        }
    }
}

impl fmt::Display for Texture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "texture#{} ({}x{} {:?})", self.id.0, self.width, self.height, self.format)
    }
}

/// A rectangle of texels, origin at the top-left corner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Region {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }

    /// Clamp this region so that it lies inside `texture`.
    ///
    /// The extent is clamped first, then the origin is pulled back so the
    /// extent still fits.
    pub fn clamp_to(&self, texture: &Texture) -> Region {
        let width = self.width.min(texture.width);
        let height = self.height.min(texture.height);
        Region {
            x: self.x.min(texture.width - width),
            y: self.y.min(texture.height - height),
            width,
            height,
        }
    }

    pub fn byte_len(&self, format: TextureFormat) -> usize {
        self.width as usize * self.height as usize * format.bytes_per_pixel()
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn fits(&self, texture: &Texture) -> bool {
        self.x as u64 + self.width as u64 <= texture.width as u64
            && self.y as u64 + self.height as u64 <= texture.height as u64
    }
}

/// A kernel argument after binding: a declared name and its value.
#[derive(Debug, Clone, Copy)]
pub struct BoundArg<'a> {
    pub name: &'a str,
    pub value: Arg,
}

/// A pending GPU→host copy. Resolves to the tightly packed pixels of the
/// requested region. Dropping it releases the transient transfer object.
pub struct PixelTransfer {
    inner: Pin<Box<dyn Future<Output = std::result::Result<Vec<u8>, BoxedCause>>>>,
}

impl PixelTransfer {
    pub fn new<F>(future: F) -> Self
    where
        F: Future<Output = std::result::Result<Vec<u8>, BoxedCause>> + 'static,
    {
        Self {
            inner: Box::pin(future),
        }
    }

    /// A transfer that is already complete.
    pub fn ready(pixels: Vec<u8>) -> Self {
        Self::new(std::future::ready(Ok(pixels)))
    }
}

impl Future for PixelTransfer {
    type Output = std::result::Result<Vec<u8>, BoxedCause>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.inner.as_mut().poll(cx)
    }
}

impl fmt::Debug for PixelTransfer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PixelTransfer")
    }
}

/// The GPU execution context the pipeline runs against.
///
/// Implementations: [`WgpuContext`] for real devices and
/// [`SoftwareContext`], a CPU reference used by tests and as a fallback.
pub trait GpuContext {
    /// Create a texture with an attached render target.
    fn create_texture(&mut self, width: u32, height: u32, format: TextureFormat) -> Result<Texture>;

    fn destroy_texture(&mut self, texture: &Texture);

    /// Replace the contents of `texture` with tightly packed pixels.
    fn upload(&mut self, texture: &Texture, pixels: &[u8]) -> Result<()>;

    /// Compile and link a kernel.
    fn compile(&mut self, shader: &ShaderDeclaration) -> Result<ProgramId>;

    /// Run `program` once over every texel of `output`.
    fn dispatch(&mut self, program: ProgramId, args: &[BoundArg<'_>], output: &Texture) -> Result<()>;

    /// Blocking readback of `region` into `dst`.
    fn read_pixels(&mut self, texture: &Texture, region: Region, dst: &mut [u8]) -> Result<()>;

    /// Start a readback of `region`. The texture contents are captured when
    /// this is called; the returned future resolves once the copy lands.
    fn read_pixels_async(&mut self, texture: &Texture, region: Region) -> Result<PixelTransfer>;

    fn is_context_lost(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn texture(width: u32, height: u32) -> Texture {
        Texture {
            id: TextureId(0),
            width,
            height,
            format: TextureFormat::Rgba8,
        }
    }

    #[test]
    fn clamp_pulls_origin_back_inside() {
        let tex = texture(50, 40);
        let region = Region::new(100, 0, 50, 40).clamp_to(&tex);
        assert_eq!(region, Region::new(0, 0, 50, 40));
    }

    #[test]
    fn clamp_shrinks_oversized_extent() {
        let tex = texture(50, 40);
        let region = Region::new(10, 5, 500, 20).clamp_to(&tex);
        assert_eq!(region, Region::new(0, 5, 50, 20));
        assert!(region.fits(&tex));
    }

    #[test]
    fn clamp_keeps_valid_region() {
        let tex = texture(50, 40);
        let region = Region::new(10, 10, 8, 8);
        assert_eq!(region.clamp_to(&tex), region);
        assert_eq!(region.byte_len(TextureFormat::Rgba8), 8 * 8 * 4);
        assert_eq!(region.byte_len(TextureFormat::R8), 8 * 8);
    }
}
