//! wgpu implementation of [`GpuContext`].
//!
//! Every kernel is a fragment shader drawn over a fullscreen quad into the
//! output texture. Readback goes through a staging buffer whose rows are
//! padded to `COPY_BYTES_PER_ROW_ALIGNMENT`.

use super::{Arg, BoundArg, GpuContext, PixelTransfer, ProgramId, Region, ShaderDeclaration, Texture, TextureFormat, TextureId};
use crate::error::{BoxedCause, Error, Result};
use naga::valid::{Capabilities, ValidationFlags, Validator};
use std::borrow::Cow;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll, Waker};
use tracing::{debug, info, warn};
use wgpu::util::DeviceExt;

/// Fullscreen quad vertex shader shared by every kernel.
const VERTEX_SHADER: &str = r#"
struct VertexInput {
    @location(0) position: vec2<f32>,
    @location(1) tex_coords: vec2<f32>,
}

struct VertexOutput {
    @builtin(position) clip_position: vec4<f32>,
    @location(0) tex_coords: vec2<f32>,
}

@vertex
fn vs_main(in: VertexInput) -> VertexOutput {
    var out: VertexOutput;
    out.clip_position = vec4<f32>(in.position, 0.0, 1.0);
    out.tex_coords = in.tex_coords;
    return out;
}
"#;

/// Number of scalar arguments a kernel can take.
const MAX_SCALARS: usize = 16;

#[repr(C)]
#[derive(Copy, Clone, Debug, bytemuck::Pod, bytemuck::Zeroable)]
struct QuadVertex {
    position: [f32; 2],
    tex_coords: [f32; 2],
}

impl QuadVertex {
    const VERTICES: &'static [QuadVertex] = &[
        QuadVertex { position: [-1.0, -1.0], tex_coords: [0.0, 1.0] },
        QuadVertex { position: [1.0, -1.0], tex_coords: [1.0, 1.0] },
        QuadVertex { position: [1.0, 1.0], tex_coords: [1.0, 0.0] },
        QuadVertex { position: [-1.0, 1.0], tex_coords: [0.0, 0.0] },
    ];

    const INDICES: &'static [u16] = &[0, 1, 2, 2, 3, 0];

    fn layout() -> wgpu::VertexBufferLayout<'static> {
        wgpu::VertexBufferLayout {
            array_stride: std::mem::size_of::<QuadVertex>() as wgpu::BufferAddress,
            step_mode: wgpu::VertexStepMode::Vertex,
            attributes: &[
                wgpu::VertexAttribute {
                    offset: 0,
                    shader_location: 0,
                    format: wgpu::VertexFormat::Float32x2,
                },
                wgpu::VertexAttribute {
                    offset: std::mem::size_of::<[f32; 2]>() as wgpu::BufferAddress,
                    shader_location: 1,
                    format: wgpu::VertexFormat::Float32x2,
                },
            ],
        }
    }
}

/// Scalar arguments, packed four per `vec4` in declared order.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, bytemuck::Pod, bytemuck::Zeroable)]
struct KernelParams {
    values: [[f32; 4]; MAX_SCALARS / 4],
}

struct CompiledProgram {
    name: &'static str,
    module: wgpu::ShaderModule,
    bind_group_layout: wgpu::BindGroupLayout,
    pipeline_layout: wgpu::PipelineLayout,
    texture_bindings: usize,
}

fn wgpu_format(format: TextureFormat) -> wgpu::TextureFormat {
    match format {
        TextureFormat::Rgba8 => wgpu::TextureFormat::Rgba8Unorm,
        TextureFormat::R8 => wgpu::TextureFormat::R8Unorm,
    }
}

/// Round `value` up to the next multiple of `alignment`.
fn align_to(value: u32, alignment: u32) -> u32 {
    value.div_ceil(alignment) * alignment
}

/// Strip the per-row padding of a staging buffer.
fn copy_tight_rows(padded: &[u8], padded_row: usize, tight_row: usize, rows: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(tight_row * rows);
    for row in padded.chunks(padded_row).take(rows) {
        out.extend_from_slice(&row[..tight_row]);
    }
    out
}

/// GPU context backed by a headless wgpu device.
pub struct WgpuContext {
    device: wgpu::Device,
    queue: wgpu::Queue,
    vertex_module: wgpu::ShaderModule,
    vertex_buffer: wgpu::Buffer,
    index_buffer: wgpu::Buffer,
    textures: HashMap<TextureId, wgpu::Texture>,
    next_texture: u32,
    programs: Vec<CompiledProgram>,
    pipelines: HashMap<(ProgramId, TextureFormat), wgpu::RenderPipeline>,
    lost: Arc<AtomicBool>,
}

impl WgpuContext {
    /// Open the default adapter for offscreen use.
    pub fn new() -> Result<Self> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: None,
            force_fallback_adapter: false,
        }))
        .map_err(|e| Error::Capability(format!("Failed to find GPU adapter: {e}")))?;

        let (device, queue) = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
            label: Some("Retina Device"),
            required_features: wgpu::Features::empty(),
            required_limits: wgpu::Limits::downlevel_defaults(),
            memory_hints: wgpu::MemoryHints::Performance,
            ..Default::default()
        }))
        .map_err(|e| Error::Capability(format!("Failed to open GPU device: {e}")))?;

        info!("Using GPU adapter {}", adapter.get_info().name);

        let lost = Arc::new(AtomicBool::new(false));
        let lost_flag = Arc::clone(&lost);
        device.set_device_lost_callback(move |reason, message| {
            warn!("GPU device lost ({:?}): {}", reason, message);
            lost_flag.store(true, Ordering::SeqCst);
        });

        let vertex_module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Vertex Shader"),
            source: wgpu::ShaderSource::Wgsl(Cow::Borrowed(VERTEX_SHADER)),
        });

        let vertex_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Vertex Buffer"),
            contents: bytemuck::cast_slice(QuadVertex::VERTICES),
            usage: wgpu::BufferUsages::VERTEX,
        });

        let index_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Index Buffer"),
            contents: bytemuck::cast_slice(QuadVertex::INDICES),
            usage: wgpu::BufferUsages::INDEX,
        });

        Ok(Self {
            device,
            queue,
            vertex_module,
            vertex_buffer,
            index_buffer,
            textures: HashMap::new(),
            next_texture: 0,
            programs: Vec::new(),
            pipelines: HashMap::new(),
            lost,
        })
    }

    fn texture(&self, texture: &Texture) -> Result<&wgpu::Texture> {
        self.textures
            .get(&texture.id)
            .ok_or_else(|| Error::NotFound(format!("{texture} does not exist")))
    }

    fn ensure_pipeline(&mut self, program: ProgramId, format: TextureFormat) -> Result<()> {
        let compiled = self
            .programs
            .get(program.0 as usize)
            .ok_or_else(|| Error::NotFound(format!("program {:?}", program)))?;
        self.pipelines.entry((program, format)).or_insert_with(|| {
            debug!("Creating render pipeline for '{}' ({:?})", compiled.name, format);
            self.device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
                label: Some(compiled.name),
                layout: Some(&compiled.pipeline_layout),
                vertex: wgpu::VertexState {
                    module: &self.vertex_module,
                    entry_point: Some("vs_main"),
                    buffers: &[QuadVertex::layout()],
                    compilation_options: Default::default(),
                },
                fragment: Some(wgpu::FragmentState {
                    module: &compiled.module,
                    entry_point: Some("fs_main"),
                    targets: &[Some(wgpu::ColorTargetState {
                        format: wgpu_format(format),
                        blend: None,
                        write_mask: wgpu::ColorWrites::ALL,
                    })],
                    compilation_options: Default::default(),
                }),
                primitive: wgpu::PrimitiveState {
                    topology: wgpu::PrimitiveTopology::TriangleList,
                    strip_index_format: None,
                    front_face: wgpu::FrontFace::Ccw,
                    cull_mode: None,
                    polygon_mode: wgpu::PolygonMode::Fill,
                    unclipped_depth: false,
                    conservative: false,
                },
                depth_stencil: None,
                multisample: wgpu::MultisampleState::default(),
                multiview_mask: None,
                cache: None,
            })
        });
        Ok(())
    }

    /// Encode a copy of `region` into a fresh staging buffer and request
    /// its mapping.
    fn start_readback(&self, texture: &Texture, region: Region) -> Result<MappedReadback> {
        let source = self.texture(texture)?;
        let tight_row = region.width * texture.format.bytes_per_pixel() as u32;
        let padded_row = align_to(tight_row, wgpu::COPY_BYTES_PER_ROW_ALIGNMENT);

        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Readback Buffer"),
            size: padded_row as wgpu::BufferAddress * region.height as wgpu::BufferAddress,
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("Readback Encoder") });
        encoder.copy_texture_to_buffer(
            wgpu::TexelCopyTextureInfo {
                texture: source,
                mip_level: 0,
                origin: wgpu::Origin3d { x: region.x, y: region.y, z: 0 },
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::TexelCopyBufferInfo {
                buffer: &buffer,
                layout: wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(padded_row),
                    rows_per_image: Some(region.height),
                },
            },
            wgpu::Extent3d { width: region.width, height: region.height, depth_or_array_layers: 1 },
        );
        self.queue.submit(std::iter::once(encoder.finish()));

        let state = Arc::new(Mutex::new(MapState::default()));
        let callback_state = Arc::clone(&state);
        buffer.slice(..).map_async(wgpu::MapMode::Read, move |result| {
            let mut state = callback_state.lock().unwrap_or_else(PoisonError::into_inner);
            state.result = Some(result);
            if let Some(waker) = state.waker.take() {
                waker.wake();
            }
        });

        Ok(MappedReadback {
            device: self.device.clone(),
            buffer,
            state,
            padded_row: padded_row as usize,
            tight_row: tight_row as usize,
            rows: region.height as usize,
        })
    }
}

#[derive(Default)]
struct MapState {
    result: Option<std::result::Result<(), wgpu::BufferAsyncError>>,
    waker: Option<Waker>,
}

/// Resolves once the staging buffer is mapped. The device is polled without
/// blocking on every poll of the future.
struct MappedReadback {
    device: wgpu::Device,
    buffer: wgpu::Buffer,
    state: Arc<Mutex<MapState>>,
    padded_row: usize,
    tight_row: usize,
    rows: usize,
}

impl Future for MappedReadback {
    type Output = std::result::Result<Vec<u8>, BoxedCause>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if let Err(e) = self.device.poll(wgpu::PollType::Poll) {
            return Poll::Ready(Err(Box::new(e)));
        }

        let result = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            match state.result.take() {
                Some(result) => result,
                None => {
                    state.waker = Some(cx.waker().clone());
                    // Nothing else drives the device, so ask to be polled again.
                    cx.waker().wake_by_ref();
                    return Poll::Pending;
                }
            }
        };
        if let Err(e) = result {
            return Poll::Ready(Err(Box::new(e)));
        }

        let slice = self.buffer.slice(..);
        let pixels = {
            let mapped = slice.get_mapped_range();
            copy_tight_rows(&mapped, self.padded_row, self.tight_row, self.rows)
        };
        self.buffer.unmap();
        Poll::Ready(Ok(pixels))
    }
}

impl Drop for MappedReadback {
    fn drop(&mut self) {
        self.buffer.destroy();
    }
}

impl GpuContext for WgpuContext {
    fn create_texture(&mut self, width: u32, height: u32, format: TextureFormat) -> Result<Texture> {
        if width == 0 || height == 0 {
            return Err(Error::IllegalArgument(format!("cannot create a {width}x{height} texture")));
        }
        let id = TextureId(self.next_texture);
        self.next_texture += 1;
        let texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some(&format!("Texture {}", id.0)),
            size: wgpu::Extent3d { width, height, depth_or_array_layers: 1 },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu_format(format),
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT
                | wgpu::TextureUsages::TEXTURE_BINDING
                | wgpu::TextureUsages::COPY_SRC
                | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });
        self.textures.insert(id, texture);
        debug!("Created texture {} ({}x{} {:?})", id.0, width, height, format);
        Ok(Texture { id, width, height, format })
    }

    fn destroy_texture(&mut self, texture: &Texture) {
        if let Some(texture) = self.textures.remove(&texture.id) {
            texture.destroy();
        }
    }

    fn upload(&mut self, texture: &Texture, pixels: &[u8]) -> Result<()> {
        if pixels.len() != texture.byte_len() {
            return Err(Error::IllegalArgument(format!(
                "upload of {} bytes into {} ({} bytes)",
                pixels.len(),
                texture,
                texture.byte_len()
            )));
        }
        if self.is_context_lost() {
            return Ok(());
        }
        let target = self.texture(texture)?;
        self.queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture: target,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            pixels,
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(texture.width * texture.format.bytes_per_pixel() as u32),
                rows_per_image: Some(texture.height),
            },
            wgpu::Extent3d { width: texture.width, height: texture.height, depth_or_array_layers: 1 },
        );
        Ok(())
    }

    fn compile(&mut self, shader: &ShaderDeclaration) -> Result<ProgramId> {
        let name = shader.name();
        let module = naga::front::wgsl::parse_str(shader.wgsl())
            .map_err(|e| Error::Capability(format!("kernel '{name}' does not parse: {}", e.emit_to_string(shader.wgsl()))))?;
        Validator::new(ValidationFlags::all(), Capabilities::default())
            .validate(&module)
            .map_err(|e| Error::Capability(format!("kernel '{name}' is not supported: {e:?}")))?;

        // Binding 0 holds the scalars; textures follow in declared order.
        let texture_bindings = module
            .global_variables
            .iter()
            .filter(|(_, var)| matches!(var.binding, Some(naga::ResourceBinding { group: 0, binding }) if binding > 0))
            .count();

        let mut entries = vec![wgpu::BindGroupLayoutEntry {
            binding: 0,
            visibility: wgpu::ShaderStages::FRAGMENT,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Uniform,
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        }];
        for binding in 1..=texture_bindings as u32 {
            entries.push(wgpu::BindGroupLayoutEntry {
                binding,
                visibility: wgpu::ShaderStages::FRAGMENT,
                ty: wgpu::BindingType::Texture {
                    sample_type: wgpu::TextureSampleType::Float { filterable: false },
                    view_dimension: wgpu::TextureViewDimension::D2,
                    multisampled: false,
                },
                count: None,
            });
        }

        let bind_group_layout = self.device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some(name),
            entries: &entries,
        });
        let pipeline_layout = self.device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some(name),
            bind_group_layouts: &[&bind_group_layout],
            immediate_size: 0,
        });
        let module = self.device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(name),
            source: wgpu::ShaderSource::Wgsl(Cow::Borrowed(shader.wgsl())),
        });

        info!("Compiled kernel '{}' ({} textures)", name, texture_bindings);
        self.programs.push(CompiledProgram {
            name,
            module,
            bind_group_layout,
            pipeline_layout,
            texture_bindings,
        });
        Ok(ProgramId(self.programs.len() as u32 - 1))
    }

    fn dispatch(&mut self, program: ProgramId, args: &[BoundArg<'_>], output: &Texture) -> Result<()> {
        if self.is_context_lost() {
            return Ok(());
        }

        let mut params = KernelParams::default();
        let mut scalars = 0;
        let mut views = Vec::new();
        for arg in args {
            match arg.value {
                Arg::Scalar(value) => {
                    if scalars == MAX_SCALARS {
                        return Err(Error::IllegalArgument(format!("more than {MAX_SCALARS} scalar arguments")));
                    }
                    params.values[scalars / 4][scalars % 4] = value;
                    scalars += 1;
                }
                Arg::Texture(texture) => {
                    views.push(self.texture(&texture)?.create_view(&wgpu::TextureViewDescriptor::default()));
                }
            }
        }

        let compiled = self
            .programs
            .get(program.0 as usize)
            .ok_or_else(|| Error::NotFound(format!("program {:?}", program)))?;
        if views.len() != compiled.texture_bindings {
            return Err(Error::IllegalArgument(format!(
                "kernel '{}' binds {} textures, got {}",
                compiled.name,
                compiled.texture_bindings,
                views.len()
            )));
        }

        let uniform_buffer = self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Kernel Params"),
            contents: bytemuck::cast_slice(&[params]),
            usage: wgpu::BufferUsages::UNIFORM,
        });
        let mut entries = vec![wgpu::BindGroupEntry { binding: 0, resource: uniform_buffer.as_entire_binding() }];
        for (i, view) in views.iter().enumerate() {
            entries.push(wgpu::BindGroupEntry {
                binding: i as u32 + 1,
                resource: wgpu::BindingResource::TextureView(view),
            });
        }
        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(compiled.name),
            layout: &compiled.bind_group_layout,
            entries: &entries,
        });

        let output_view = self.texture(output)?.create_view(&wgpu::TextureViewDescriptor::default());
        self.ensure_pipeline(program, output.format)?;
        let pipeline = self
            .pipelines
            .get(&(program, output.format))
            .ok_or_else(|| Error::NotFound(format!("pipeline for {:?}", program)))?;

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("Kernel Encoder") });
        {
            let mut render_pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("Kernel Pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &output_view,
                    resolve_target: None,
                    ops: wgpu::Operations { load: wgpu::LoadOp::Clear(wgpu::Color::BLACK), store: wgpu::StoreOp::Store },
                    depth_slice: None,
                })],
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: None,
                multiview_mask: None,
            });

            render_pass.set_pipeline(pipeline);
            render_pass.set_bind_group(0, &bind_group, &[]);
            render_pass.set_vertex_buffer(0, self.vertex_buffer.slice(..));
            render_pass.set_index_buffer(self.index_buffer.slice(..), wgpu::IndexFormat::Uint16);
            render_pass.draw_indexed(0..6, 0, 0..1);
        }
        self.queue.submit(std::iter::once(encoder.finish()));
        Ok(())
    }

    fn read_pixels(&mut self, texture: &Texture, region: Region, dst: &mut [u8]) -> Result<()> {
        if self.is_context_lost() {
            return Ok(());
        }
        let size = region.byte_len(texture.format);
        if dst.len() < size {
            return Err(Error::IllegalArgument(format!("destination of {} bytes is too small for {} bytes", dst.len(), size)));
        }
        let readback = self.start_readback(texture, region)?;
        self.device
            .poll(wgpu::PollType::Wait { submission_index: None, timeout: None })
            .map_err(|e| Error::operation("Can't read pixels", Box::new(e)))?;
        let pixels = pollster::block_on(readback).map_err(|e| Error::operation("Can't read pixels", e))?;
        dst[..size].copy_from_slice(&pixels);
        Ok(())
    }

    fn read_pixels_async(&mut self, texture: &Texture, region: Region) -> Result<PixelTransfer> {
        if !region.fits(texture) {
            return Err(Error::IllegalArgument(format!("region {:?} exceeds {}", region, texture)));
        }
        Ok(PixelTransfer::new(self.start_readback(texture, region)?))
    }

    fn is_context_lost(&self) -> bool {
        self.lost.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rows_align_to_copy_alignment() {
        assert_eq!(align_to(100, 256), 256);
        assert_eq!(align_to(256, 256), 256);
        assert_eq!(align_to(257, 256), 512);
    }

    #[test]
    fn padding_is_stripped_from_rows() {
        let padded = [1, 2, 0, 0, 3, 4, 0, 0];
        assert_eq!(copy_tight_rows(&padded, 4, 2, 2), [1, 2, 3, 4]);
    }

    #[test]
    fn params_are_sixteen_floats() {
        assert_eq!(std::mem::size_of::<KernelParams>(), 64);
    }
}
