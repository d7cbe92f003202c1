//! Utility programs.

use crate::error::Result;
use crate::gpu::{import_shader, ProgramGroup, ProgramOptions, TextureFormat};

const RGB2GREY: &str = include_str!("../shaders/utils/rgb2grey.wgsl");

#[cfg(test)]
pub(crate) const SOURCES: &[(&str, &str)] = &[("utils/rgb2grey", RGB2GREY)];

pub fn group() -> Result<ProgramGroup> {
    let mut group = ProgramGroup::new("utils");
    group.declare(
        "rgb2grey",
        import_shader("utils/rgb2grey", RGB2GREY).with_arguments(&["image"]),
        ProgramOptions::default().output_format(TextureFormat::R8),
    )?;
    Ok(group)
}
