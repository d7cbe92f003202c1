//! CPU reference backend.
//!
//! Runs every registered kernel on the host with the same texel encoding as
//! the WGSL versions. Besides serving as a fallback when no adapter is
//! available, it can simulate the failure modes of a real device: transfer
//! latency, failed transfers, context loss and missing kernels.

use super::kernels::{self, KernelArgs, Plane, Target};
use super::{Arg, BoundArg, GpuContext, PixelTransfer, ProgramId, Region, ShaderDeclaration, Texture, TextureFormat, TextureId};
use crate::error::{BoxedCause, Error, Result};
use std::cell::Cell;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};
use tracing::{debug, info, warn};

struct SoftTexture {
    width: u32,
    height: u32,
    format: TextureFormat,
    data: Vec<u8>,
}

impl SoftTexture {
    fn plane(&self) -> Plane<'_> {
        Plane {
            width: self.width,
            height: self.height,
            format: self.format,
            data: &self.data,
        }
    }

    fn copy_region(&self, region: Region, dst: &mut [u8]) -> Result<()> {
        let bpp = self.format.bytes_per_pixel();
        let row_len = region.width as usize * bpp;
        if dst.len() < row_len * region.height as usize {
            return Err(Error::IllegalArgument(format!(
                "destination of {} bytes is too small for a {}x{} region",
                dst.len(),
                region.width,
                region.height
            )));
        }
        for row in 0..region.height as usize {
            let src = ((region.y as usize + row) * self.width as usize + region.x as usize) * bpp;
            dst[row * row_len..(row + 1) * row_len].copy_from_slice(&self.data[src..src + row_len]);
        }
        Ok(())
    }
}

/// Counts transfers that have been issued and not yet dropped.
struct LiveTransfer(Rc<Cell<usize>>);

impl LiveTransfer {
    fn new(counter: &Rc<Cell<usize>>) -> Self {
        counter.set(counter.get() + 1);
        Self(Rc::clone(counter))
    }
}

impl Drop for LiveTransfer {
    fn drop(&mut self) {
        self.0.set(self.0.get() - 1);
    }
}

/// A transfer whose pixels were captured at issue time and which completes
/// after a fixed number of polls.
struct SoftTransfer {
    outcome: Option<std::result::Result<Vec<u8>, BoxedCause>>,
    remaining_polls: usize,
    _live: LiveTransfer,
}

impl Future for SoftTransfer {
    type Output = std::result::Result<Vec<u8>, BoxedCause>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.remaining_polls > 0 {
            self.remaining_polls -= 1;
            cx.waker().wake_by_ref();
            return Poll::Pending;
        }
        match self.outcome.take() {
            Some(outcome) => Poll::Ready(outcome),
            None => Poll::Ready(Err("transfer polled after completion".into())),
        }
    }
}

/// CPU implementation of [`GpuContext`].
#[derive(Default)]
pub struct SoftwareContext {
    textures: HashMap<TextureId, SoftTexture>,
    next_texture: u32,
    programs: Vec<&'static str>,
    disabled: HashSet<String>,
    context_lost: bool,
    transfer_latency: usize,
    fail_next_transfer: bool,
    live_transfers: Rc<Cell<usize>>,
    dispatch_log: Vec<String>,
}

impl SoftwareContext {
    pub fn new() -> Self {
        info!("Using the software GPU context");
        Self::default()
    }

    /// Simulate a lost context: dispatches and uploads are dropped and
    /// readers return stale data.
    pub fn lose_context(&mut self) {
        warn!("Software context lost");
        self.context_lost = true;
    }

    pub fn restore_context(&mut self) {
        self.context_lost = false;
    }

    /// Make a kernel unavailable, as if the device lacked a capability it needs.
    pub fn disable_kernel(&mut self, name: &str) {
        self.disabled.insert(name.to_string());
    }

    pub fn enable_kernel(&mut self, name: &str) {
        self.disabled.remove(name);
    }

    /// Number of polls an async transfer stays pending.
    pub fn set_transfer_latency(&mut self, polls: usize) {
        self.transfer_latency = polls;
    }

    /// The next async transfer resolves with an error.
    pub fn fail_next_transfer(&mut self) {
        self.fail_next_transfer = true;
    }

    /// Transfers issued and not yet dropped.
    pub fn live_transfers(&self) -> usize {
        self.live_transfers.get()
    }

    /// Kernel names dispatched so far, in order.
    pub fn dispatch_log(&self) -> &[String] {
        &self.dispatch_log
    }

    pub fn texture_count(&self) -> usize {
        self.textures.len()
    }

    fn texture(&self, texture: &Texture) -> Result<&SoftTexture> {
        self.textures
            .get(&texture.id)
            .ok_or_else(|| Error::NotFound(format!("{texture} does not exist")))
    }
}

impl GpuContext for SoftwareContext {
    fn create_texture(&mut self, width: u32, height: u32, format: TextureFormat) -> Result<Texture> {
        if width == 0 || height == 0 {
            return Err(Error::IllegalArgument(format!("cannot create a {width}x{height} texture")));
        }
        let id = TextureId(self.next_texture);
        self.next_texture += 1;
        self.textures.insert(
            id,
            SoftTexture {
                width,
                height,
                format,
                data: vec![0; width as usize * height as usize * format.bytes_per_pixel()],
            },
        );
        Ok(Texture {
            id,
            width,
            height,
            format,
        })
    }

    fn destroy_texture(&mut self, texture: &Texture) {
        self.textures.remove(&texture.id);
    }

    fn upload(&mut self, texture: &Texture, pixels: &[u8]) -> Result<()> {
        if self.context_lost {
            return Ok(());
        }
        let target = self
            .textures
            .get_mut(&texture.id)
            .ok_or_else(|| Error::NotFound(format!("{texture} does not exist")))?;
        if pixels.len() != target.data.len() {
            return Err(Error::IllegalArgument(format!(
                "upload of {} bytes into {} ({} bytes)",
                pixels.len(),
                texture,
                target.data.len()
            )));
        }
        target.data.copy_from_slice(pixels);
        Ok(())
    }

    fn compile(&mut self, shader: &ShaderDeclaration) -> Result<ProgramId> {
        let name = shader.name();
        if kernels::lookup(name).is_none() || self.disabled.contains(name) {
            return Err(Error::Capability(format!("kernel '{name}' is not supported by this context")));
        }
        self.programs.push(name);
        Ok(ProgramId(self.programs.len() as u32 - 1))
    }

    fn dispatch(&mut self, program: ProgramId, args: &[BoundArg<'_>], output: &Texture) -> Result<()> {
        let name = *self
            .programs
            .get(program.0 as usize)
            .ok_or_else(|| Error::NotFound(format!("program {:?}", program)))?;
        if self.disabled.contains(name) {
            return Err(Error::Capability(format!("kernel '{name}' is not supported by this context")));
        }
        let kernel = kernels::lookup(name).ok_or_else(|| Error::Capability(format!("unknown kernel '{name}'")))?;
        if self.context_lost {
            debug!("Context lost; skipping '{}'", name);
            return Ok(());
        }

        let mut target = Target::new(output.width, output.height, output.format);
        {
            let mut kernel_args = KernelArgs {
                textures: Vec::new(),
                scalars: Vec::new(),
            };
            for arg in args {
                match arg.value {
                    Arg::Texture(texture) => kernel_args.textures.push((arg.name, self.texture(&texture)?.plane())),
                    Arg::Scalar(value) => kernel_args.scalars.push((arg.name, value)),
                }
            }
            kernel(&kernel_args, &mut target)?;
        }

        let slot = self
            .textures
            .get_mut(&output.id)
            .ok_or_else(|| Error::NotFound(format!("{output} does not exist")))?;
        slot.data = target.data;
        self.dispatch_log.push(name.to_string());
        Ok(())
    }

    fn read_pixels(&mut self, texture: &Texture, region: Region, dst: &mut [u8]) -> Result<()> {
        if self.context_lost {
            return Ok(());
        }
        if !region.fits(texture) {
            return Err(Error::IllegalArgument(format!("region {:?} exceeds {}", region, texture)));
        }
        self.texture(texture)?.copy_region(region, dst)
    }

    fn read_pixels_async(&mut self, texture: &Texture, region: Region) -> Result<PixelTransfer> {
        if !region.fits(texture) {
            return Err(Error::IllegalArgument(format!("region {:?} exceeds {}", region, texture)));
        }
        let outcome = if std::mem::take(&mut self.fail_next_transfer) {
            Err(Box::new(std::io::Error::other("simulated transfer failure")) as BoxedCause)
        } else {
            let mut pixels = vec![0; region.byte_len(texture.format)];
            self.texture(texture)?.copy_region(region, &mut pixels)?;
            Ok(pixels)
        };
        Ok(PixelTransfer::new(SoftTransfer {
            outcome: Some(outcome),
            remaining_polls: self.transfer_latency,
            _live: LiveTransfer::new(&self.live_transfers),
        }))
    }

    fn is_context_lost(&self) -> bool {
        self.context_lost
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn region_readback_is_tightly_packed() {
        let mut gpu = SoftwareContext::new();
        let texture = gpu.create_texture(4, 3, TextureFormat::R8).unwrap();
        gpu.upload(&texture, &(0..12).collect::<Vec<u8>>()).unwrap();

        let mut dst = [0u8; 4];
        gpu.read_pixels(&texture, Region::new(1, 1, 2, 2), &mut dst).unwrap();
        assert_eq!(dst, [5, 6, 9, 10]);
    }

    #[test]
    fn upload_size_must_match() {
        let mut gpu = SoftwareContext::new();
        let texture = gpu.create_texture(2, 2, TextureFormat::Rgba8).unwrap();
        assert!(matches!(gpu.upload(&texture, &[0; 4]), Err(Error::IllegalArgument(_))));
    }

    #[test]
    fn async_transfer_captures_pixels_at_issue_time() {
        let mut gpu = SoftwareContext::new();
        gpu.set_transfer_latency(2);
        let texture = gpu.create_texture(2, 1, TextureFormat::R8).unwrap();
        gpu.upload(&texture, &[1, 2]).unwrap();
        let transfer = gpu.read_pixels_async(&texture, texture.full_region()).unwrap();
        gpu.upload(&texture, &[3, 4]).unwrap();

        assert_eq!(gpu.live_transfers(), 1);
        assert_eq!(pollster::block_on(transfer).unwrap(), [1, 2]);
        assert_eq!(gpu.live_transfers(), 0);
    }

    #[test]
    fn disabled_kernels_fail_to_compile() {
        let mut gpu = SoftwareContext::new();
        let shader = crate::gpu::import_shader("keypoints/fast9", "");
        gpu.disable_kernel("keypoints/fast9");
        assert!(matches!(gpu.compile(&shader), Err(Error::Capability(_))));
        gpu.enable_kernel("keypoints/fast9");
        assert!(gpu.compile(&shader).is_ok());

        let unknown = crate::gpu::import_shader("keypoints/brisk", "");
        assert!(matches!(gpu.compile(&unknown), Err(Error::Capability(_))));
    }
}
