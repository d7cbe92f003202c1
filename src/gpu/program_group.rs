//! Program groups: named kernels plus multi-pass compositions of them.
//!
//! A composition threads the output of stage `k` into the first declared
//! argument of stage `k + 1`. Intermediate outputs come from the shared
//! [`TexturePool`] and go back to it as soon as the next stage has consumed
//! them, unless the producing program was declared with
//! [`ProgramOptions::does_not_recycle_textures`], in which case its output is
//! pinned until that same program runs again.

use super::shader::ShaderDeclaration;
use super::texture_pool::TexturePool;
use super::{BoundArg, GpuContext, ProgramId, Texture, TextureFormat};
use crate::error::{Error, Result};
use std::collections::HashMap;
use tracing::{debug, trace};

/// A value bound to a kernel argument.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Arg {
    Texture(Texture),
    Scalar(f32),
}

impl From<Texture> for Arg {
    fn from(texture: Texture) -> Self {
        Arg::Texture(texture)
    }
}

impl From<f32> for Arg {
    fn from(value: f32) -> Self {
        Arg::Scalar(value)
    }
}

impl From<u32> for Arg {
    fn from(value: u32) -> Self {
        Arg::Scalar(value as f32)
    }
}

impl From<bool> for Arg {
    fn from(value: bool) -> Self {
        Arg::Scalar(if value { 1.0 } else { 0.0 })
    }
}

/// Caller-supplied arguments, bound to kernels by name.
#[derive(Debug, Clone, Default)]
pub struct Args {
    values: Vec<(String, Arg)>,
}

impl Args {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, value: impl Into<Arg>) -> Self {
        let value = value.into();
        match self.values.iter_mut().find(|(n, _)| n == name) {
            Some(slot) => slot.1 = value,
            None => self.values.push((name.to_string(), value)),
        }
        self
    }

    pub fn get(&self, name: &str) -> Option<Arg> {
        self.values.iter().find(|(n, _)| n == name).map(|(_, v)| *v)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.values.iter().map(|(n, _)| n.as_str())
    }
}

/// Per-program options given at declaration time.
#[derive(Debug, Clone, Copy)]
pub struct ProgramOptions {
    recycle_textures: bool,
    output_format: TextureFormat,
}

impl Default for ProgramOptions {
    fn default() -> Self {
        Self {
            recycle_textures: true,
            output_format: TextureFormat::Rgba8,
        }
    }
}

impl ProgramOptions {
    /// Keep this program's output valid after later stages run.
    pub fn does_not_recycle_textures(mut self) -> Self {
        self.recycle_textures = false;
        self
    }

    pub fn output_format(mut self, format: TextureFormat) -> Self {
        self.output_format = format;
        self
    }
}

struct DeclaredProgram {
    shader: ShaderDeclaration,
    options: ProgramOptions,
    compiled: Option<ProgramId>,
    pinned_output: Option<Texture>,
}

enum Entry {
    Program(DeclaredProgram),
    Composed(Vec<String>),
}

/// A named registry of kernels and compositions.
pub struct ProgramGroup {
    name: String,
    entries: HashMap<String, Entry>,
}

impl ProgramGroup {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: HashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Register a single-pass kernel under `name`.
    pub fn declare(&mut self, name: &str, shader: ShaderDeclaration, options: ProgramOptions) -> Result<&mut Self> {
        self.ensure_free(name)?;
        self.entries.insert(
            name.to_string(),
            Entry::Program(DeclaredProgram {
                shader,
                options,
                compiled: None,
                pinned_output: None,
            }),
        );
        Ok(self)
    }

    /// Register `name` as the ordered chain `stages`. Stages are resolved
    /// when the composition is invoked, so they may be declared afterwards.
    pub fn compose(&mut self, name: &str, stages: &[&str]) -> Result<&mut Self> {
        self.ensure_free(name)?;
        if stages.is_empty() {
            return Err(Error::IllegalArgument(format!("composition '{name}' has no stages")));
        }
        self.entries.insert(
            name.to_string(),
            Entry::Composed(stages.iter().map(|s| s.to_string()).collect()),
        );
        Ok(self)
    }

    fn ensure_free(&self, name: &str) -> Result<()> {
        if self.entries.contains_key(name) {
            return Err(Error::Conflict(format!(
                "program '{name}' is already registered in group '{}'",
                self.name
            )));
        }
        Ok(())
    }

    fn stages_of(&self, name: &str) -> Result<Vec<String>> {
        match self.entries.get(name) {
            None => Err(Error::NotFound(format!("program '{name}' in group '{}'", self.name))),
            Some(Entry::Program(_)) => Ok(vec![name.to_string()]),
            Some(Entry::Composed(stages)) => {
                for stage in stages {
                    if !matches!(self.entries.get(stage), Some(Entry::Program(_))) {
                        return Err(Error::NotFound(format!(
                            "stage '{stage}' of composition '{name}' is not a declared program"
                        )));
                    }
                }
                Ok(stages.clone())
            }
        }
    }

    fn program(&self, name: &str) -> Result<&DeclaredProgram> {
        match self.entries.get(name) {
            Some(Entry::Program(program)) => Ok(program),
            _ => Err(Error::NotFound(format!("program '{name}' in group '{}'", self.name))),
        }
    }

    fn program_mut(&mut self, name: &str) -> Result<&mut DeclaredProgram> {
        match self.entries.get_mut(name) {
            Some(Entry::Program(program)) => Ok(program),
            _ => Err(Error::NotFound(format!("program '{name}'"))),
        }
    }

    /// Check every stage's argument contract before any work is dispatched.
    fn check_arguments(&self, stages: &[String], args: &Args) -> Result<()> {
        for (k, stage) in stages.iter().enumerate() {
            let shader = &self.program(stage)?.shader;
            for (i, spec) in shader.arguments().iter().enumerate() {
                let implicit = k > 0 && i == 0;
                if !implicit && spec.default.is_none() && args.get(spec.name).is_none() {
                    return Err(Error::MissingArgument {
                        program: stage.clone(),
                        argument: spec.name.to_string(),
                    });
                }
            }
        }
        for name in args.names() {
            let mut known = false;
            for stage in stages {
                known |= self.program(stage)?.shader.declares(name);
            }
            if !known {
                return Err(Error::IllegalArgument(format!(
                    "unexpected argument '{name}' for program '{}'",
                    stages.join(" -> ")
                )));
            }
        }
        Ok(())
    }

    /// Invoke `name`, returning the output texture of its last stage.
    ///
    /// The returned texture is pooled; the caller releases it (or lets
    /// [`TexturePool::reclaim`] do so at the end of the run).
    pub fn run(&mut self, gpu: &mut dyn GpuContext, pool: &mut TexturePool, name: &str, args: &Args) -> Result<Texture> {
        let stages = self.stages_of(name)?;
        self.check_arguments(&stages, args)?;

        let first = self.program(&stages[0])?;
        let size_source = first
            .shader
            .arguments()
            .iter()
            .find_map(|spec| match args.get(spec.name).or(spec.default) {
                Some(Arg::Texture(texture)) => Some(texture),
                _ => None,
            })
            .ok_or_else(|| Error::IllegalArgument(format!("program '{name}' needs an input texture to size its output")))?;
        let (width, height) = (size_source.width, size_source.height);

        let mut previous: Option<Texture> = None;
        for (k, stage) in stages.iter().enumerate() {
            match self.run_stage(gpu, pool, stage, args, previous, width, height) {
                Ok(output) => {
                    if let Some(consumed) = previous.take() {
                        pool.release(&consumed);
                    }
                    previous = Some(output);
                }
                Err(err) => {
                    if let Some(consumed) = previous.take() {
                        pool.release(&consumed);
                    }
                    debug!("Program '{}' failed at stage {} ('{}'): {}", name, k, stage, err);
                    return Err(err);
                }
            }
        }
        previous.ok_or_else(|| Error::IllegalOperation(format!("program '{name}' produced no output")))
    }

    #[allow(clippy::too_many_arguments)]
    fn run_stage(
        &mut self,
        gpu: &mut dyn GpuContext,
        pool: &mut TexturePool,
        stage: &str,
        args: &Args,
        previous: Option<Texture>,
        width: u32,
        height: u32,
    ) -> Result<Texture> {
        let program = self.program_mut(stage)?;

        let mut bound = Vec::with_capacity(program.shader.arguments().len());
        for (i, spec) in program.shader.arguments().iter().enumerate() {
            let value = match previous {
                Some(texture) if i == 0 => Arg::Texture(texture),
                _ => args.get(spec.name).or(spec.default).ok_or_else(|| Error::MissingArgument {
                    program: stage.to_string(),
                    argument: spec.name.to_string(),
                })?,
            };
            bound.push(BoundArg { name: spec.name, value });
        }

        let id = match program.compiled {
            Some(id) => id,
            None => {
                let id = gpu.compile(&program.shader)?;
                debug!("Compiled kernel '{}' as {:?}", program.shader.name(), id);
                program.compiled = Some(id);
                id
            }
        };

        let format = program.options.output_format;
        let output = if program.options.recycle_textures {
            pool.acquire(gpu, width, height, format)?
        } else {
            if let Some(stale) = program.pinned_output.take() {
                pool.unpin(&stale);
                pool.release(&stale);
            }
            let output = pool.acquire(gpu, width, height, format)?;
            pool.pin(&output);
            program.pinned_output = Some(output);
            output
        };

        trace!("Dispatch '{}' -> {}", stage, output);
        if let Err(err) = gpu.dispatch(id, &bound, &output) {
            if program.pinned_output == Some(output) {
                program.pinned_output = None;
                pool.unpin(&output);
            }
            pool.release(&output);
            return Err(err);
        }
        Ok(output)
    }

    /// Forget compiled programs and pinned outputs. Used when the group is
    /// moved to a fresh GPU context.
    pub fn reset(&mut self, pool: &mut TexturePool) {
        for entry in self.entries.values_mut() {
            if let Entry::Program(program) = entry {
                program.compiled = None;
                if let Some(texture) = program.pinned_output.take() {
                    pool.unpin(&texture);
                    pool.release(&texture);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::{import_shader, SlotState, SoftwareContext, TextureFormat};

    const PASS: &str = "@fragment fn fs_main() -> @location(0) vec4<f32> { return vec4<f32>(0.0); }";

    fn group() -> ProgramGroup {
        let mut group = ProgramGroup::new("test");
        group
            .compose("fast9", &["_fast9", "_fastScore16"])
            .unwrap()
            .declare(
                "_fast9",
                import_shader("keypoints/fast9", PASS).with_arguments(&["image", "threshold"]),
                ProgramOptions::default(),
            )
            .unwrap()
            .declare(
                "_fastScore16",
                import_shader("keypoints/fast-score16", PASS).with_arguments(&["image", "threshold"]),
                ProgramOptions::default(),
            )
            .unwrap()
            .declare(
                "nonmax",
                import_shader("keypoints/nonmax-suppression", PASS).with_arguments(&["image"]),
                ProgramOptions::default(),
            )
            .unwrap()
            .declare(
                "sobel",
                import_shader("keypoints/multiscale-sobel", PASS)
                    .with_arguments(&["pyramid", "lod"])
                    .with_default("lod", 0.0f32)
                    .unwrap(),
                ProgramOptions::default().does_not_recycle_textures(),
            )
            .unwrap();
        group
    }

    fn corner_image(gpu: &mut SoftwareContext) -> Texture {
        let (w, h) = (16u32, 16u32);
        let mut pixels = vec![0u8; (w * h) as usize];
        for y in 8..h {
            for x in 8..w {
                pixels[(y * w + x) as usize] = 255;
            }
        }
        let texture = gpu.create_texture(w, h, TextureFormat::R8).unwrap();
        gpu.upload(&texture, &pixels).unwrap();
        texture
    }

    #[test]
    fn redeclaring_a_name_conflicts_and_keeps_the_original() {
        let mut gpu = SoftwareContext::new();
        let mut pool = TexturePool::new();
        let mut group = group();

        let err = group
            .declare("nonmax", import_shader("keypoints/fast9", PASS), ProgramOptions::default())
            .err()
            .unwrap();
        assert!(matches!(err, Error::Conflict(_)));
        assert!(matches!(group.compose("fast9", &["nonmax"]).err(), Some(Error::Conflict(_))));

        let image = corner_image(&mut gpu);
        let out = group.run(&mut gpu, &mut pool, "nonmax", &Args::new().with("image", image)).unwrap();
        assert_eq!((out.width, out.height), (16, 16));
        assert_eq!(gpu.dispatch_log(), ["keypoints/nonmax-suppression"]);
    }

    #[test]
    fn unknown_program_is_not_found() {
        let mut gpu = SoftwareContext::new();
        let mut pool = TexturePool::new();
        let mut group = group();
        let err = group.run(&mut gpu, &mut pool, "harris", &Args::new()).unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));

        group.compose("broken", &["_fast9", "missing"]).unwrap();
        let image = corner_image(&mut gpu);
        let args = Args::new().with("image", image).with("threshold", 0.1f32);
        assert!(matches!(group.run(&mut gpu, &mut pool, "broken", &args), Err(Error::NotFound(_))));
        assert!(gpu.dispatch_log().is_empty());
    }

    #[test]
    fn missing_and_unexpected_arguments_fail_before_dispatch() {
        let mut gpu = SoftwareContext::new();
        let mut pool = TexturePool::new();
        let mut group = group();
        let image = corner_image(&mut gpu);

        let err = group.run(&mut gpu, &mut pool, "fast9", &Args::new().with("image", image)).unwrap_err();
        match err {
            Error::MissingArgument { program, argument } => {
                assert_eq!(program, "_fast9");
                assert_eq!(argument, "threshold");
            }
            other => panic!("unexpected error {other:?}"),
        }

        let args = Args::new().with("image", image).with("threshold", 0.1f32).with("radius", 2.0f32);
        assert!(matches!(group.run(&mut gpu, &mut pool, "fast9", &args), Err(Error::IllegalArgument(_))));
        assert!(gpu.dispatch_log().is_empty());
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    fn defaults_fill_omitted_arguments() {
        let mut gpu = SoftwareContext::new();
        let mut pool = TexturePool::new();
        let mut group = group();
        let image = corner_image(&mut gpu);
        let out = group.run(&mut gpu, &mut pool, "sobel", &Args::new().with("pyramid", image)).unwrap();
        assert_eq!(out.format, TextureFormat::Rgba8);
    }

    #[test]
    fn composition_matches_running_its_stages_in_order() {
        let mut gpu = SoftwareContext::new();
        let mut pool = TexturePool::new();
        let mut group = group();
        let image = corner_image(&mut gpu);
        let args = Args::new().with("image", image).with("threshold", 0.1f32);

        let composed = group.run(&mut gpu, &mut pool, "fast9", &args).unwrap();
        let mut composed_pixels = vec![0u8; composed.byte_len()];
        gpu.read_pixels(&composed, composed.full_region(), &mut composed_pixels).unwrap();
        assert_eq!(gpu.dispatch_log(), ["keypoints/fast9", "keypoints/fast-score16"]);

        let candidates = group.run(&mut gpu, &mut pool, "_fast9", &args).unwrap();
        let scored = group
            .run(&mut gpu, &mut pool, "_fastScore16", &Args::new().with("image", candidates).with("threshold", 0.1f32))
            .unwrap();
        let mut manual_pixels = vec![0u8; scored.byte_len()];
        gpu.read_pixels(&scored, scored.full_region(), &mut manual_pixels).unwrap();

        assert_eq!(composed_pixels, manual_pixels);
        assert!(composed_pixels.chunks(4).any(|texel| texel[1] > 0));
    }

    #[test]
    fn composed_intermediates_return_to_the_pool() {
        let mut gpu = SoftwareContext::new();
        let mut pool = TexturePool::new();
        let mut group = group();
        let image = corner_image(&mut gpu);
        let args = Args::new().with("image", image).with("threshold", 0.1f32);

        let out = group.run(&mut gpu, &mut pool, "fast9", &args).unwrap();
        assert_eq!(pool.in_use(), 1);
        assert_eq!(pool.state(&out), Some(SlotState::PooledInUse));
    }

    #[test]
    fn non_recycled_output_survives_reclaim_until_rerun() {
        let mut gpu = SoftwareContext::new();
        let mut pool = TexturePool::new();
        let mut group = group();
        let image = corner_image(&mut gpu);

        let first = group.run(&mut gpu, &mut pool, "sobel", &Args::new().with("pyramid", image)).unwrap();
        pool.reclaim();
        assert!(pool.is_pinned(&first));
        assert_eq!(pool.state(&first), Some(SlotState::PooledInUse));

        // A recycled program must not be handed the pinned texture.
        let other = group.run(&mut gpu, &mut pool, "nonmax", &Args::new().with("image", image)).unwrap();
        assert_ne!(other.id, first.id);

        let second = group.run(&mut gpu, &mut pool, "sobel", &Args::new().with("pyramid", image)).unwrap();
        assert!(pool.is_pinned(&second));
        assert_eq!(pool.pinned(), 1);
    }

    #[test]
    fn capability_errors_are_not_cached() {
        let mut gpu = SoftwareContext::new();
        let mut pool = TexturePool::new();
        let mut group = group();
        let image = corner_image(&mut gpu);

        gpu.disable_kernel("keypoints/nonmax-suppression");
        let args = Args::new().with("image", image);
        assert!(matches!(group.run(&mut gpu, &mut pool, "nonmax", &args), Err(Error::Capability(_))));
        assert_eq!(pool.in_use(), 0);

        gpu.enable_kernel("keypoints/nonmax-suppression");
        assert!(group.run(&mut gpu, &mut pool, "nonmax", &args).is_ok());
    }
}
