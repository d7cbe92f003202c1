//! The program groups registered by the crate.

pub mod keypoints;
pub mod utils;

use super::ProgramGroup;
use crate::error::Result;

/// Every program group, one per concern.
pub struct GpuPrograms {
    pub utils: ProgramGroup,
    pub keypoints: ProgramGroup,
}

impl GpuPrograms {
    pub fn new() -> Result<Self> {
        Ok(Self {
            utils: utils::group()?,
            keypoints: keypoints::group()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use naga::valid::{Capabilities, ValidationFlags, Validator};

    fn validate(name: &str, wgsl: &str) {
        let module = naga::front::wgsl::parse_str(wgsl).unwrap_or_else(|e| panic!("{name}: {}", e.emit_to_string(wgsl)));
        Validator::new(ValidationFlags::all(), Capabilities::all())
            .validate(&module)
            .unwrap_or_else(|e| panic!("{name}: {e:?}"));
        assert!(
            module.entry_points.iter().any(|ep| ep.name == "fs_main"),
            "{name} has no fs_main entry point"
        );
        for (_, var) in module.global_variables.iter() {
            if let Some(binding) = &var.binding {
                assert_eq!(binding.group, 0, "{name} binds outside group 0");
            }
        }
    }

    #[test]
    fn every_kernel_is_valid_wgsl() {
        for (name, wgsl) in keypoints::SOURCES.iter().chain(utils::SOURCES.iter()) {
            validate(name, wgsl);
        }
    }

    #[test]
    fn registered_programs_resolve() {
        let programs = GpuPrograms::new().unwrap();
        for name in [
            "fast9",
            "fast7",
            "fast5",
            "multiscaleHarris",
            "harrisCutoff",
            "nonmaxSuppression",
            "multiscaleSobel",
            "orientationViaCentroid",
        ] {
            assert!(programs.keypoints.contains(name), "missing {name}");
        }
        assert!(programs.utils.contains("rgb2grey"));
    }

    #[test]
    fn orientation_runs_with_its_default_patch_radius() {
        use crate::gpu::{Args, GpuContext, SoftwareContext, TextureFormat, TexturePool};

        let mut gpu = SoftwareContext::new();
        let mut pool = TexturePool::new();
        let mut programs = GpuPrograms::new().unwrap();

        // Corner at (7, 7); everything below it is bright.
        let corners = gpu.create_texture(15, 15, TextureFormat::Rgba8).unwrap();
        let mut pixels = vec![0u8; 15 * 15 * 4];
        for (i, texel) in pixels.chunks_mut(4).enumerate() {
            texel[0] = if i / 15 > 7 { 255 } else { 0 };
            texel[3] = 255;
        }
        pixels[(7 * 15 + 7) * 4 + 1] = 60;
        gpu.upload(&corners, &pixels).unwrap();

        let oriented = programs
            .keypoints
            .run(&mut gpu, &mut pool, "orientationViaCentroid", &Args::new().with("corners", corners))
            .unwrap();
        let mut out = vec![0u8; oriented.byte_len()];
        gpu.read_pixels(&oriented, oriented.full_region(), &mut out).unwrap();
        assert_eq!(out[(7 * 15 + 7) * 4 + 3], 191);
    }
}
