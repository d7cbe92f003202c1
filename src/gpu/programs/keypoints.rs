//! Keypoint detection programs.
//!
//! Corner textures are `Rgba8` with r = pixel intensity, g = corner score
//! (0 means no corner), b = detection level and a = 1, or the encoded
//! orientation once `orientationViaCentroid` has run.

use crate::error::Result;
use crate::gpu::{import_shader, ProgramGroup, ProgramOptions};

const FAST9: &str = include_str!("../shaders/keypoints/fast9.wgsl");
const FAST7: &str = include_str!("../shaders/keypoints/fast7.wgsl");
const FAST5: &str = include_str!("../shaders/keypoints/fast5.wgsl");
const FAST_SCORE16: &str = include_str!("../shaders/keypoints/fast-score16.wgsl");
const FAST_SCORE12: &str = include_str!("../shaders/keypoints/fast-score12.wgsl");
const FAST_SCORE8: &str = include_str!("../shaders/keypoints/fast-score8.wgsl");
const NONMAX_SUPPRESSION: &str = include_str!("../shaders/keypoints/nonmax-suppression.wgsl");
const MULTISCALE_SOBEL: &str = include_str!("../shaders/keypoints/multiscale-sobel.wgsl");
const MULTISCALE_HARRIS: &str = include_str!("../shaders/keypoints/multiscale-harris.wgsl");
const HARRIS_ROW_MAX: &str = include_str!("../shaders/keypoints/harris-row-max.wgsl");
const HARRIS_CUTOFF: &str = include_str!("../shaders/keypoints/harris-cutoff.wgsl");
const ORIENTATION_VIA_CENTROID: &str = include_str!("../shaders/keypoints/orientation-via-centroid.wgsl");

#[cfg(test)]
pub(crate) const SOURCES: &[(&str, &str)] = &[
    ("keypoints/fast9", FAST9),
    ("keypoints/fast7", FAST7),
    ("keypoints/fast5", FAST5),
    ("keypoints/fast-score16", FAST_SCORE16),
    ("keypoints/fast-score12", FAST_SCORE12),
    ("keypoints/fast-score8", FAST_SCORE8),
    ("keypoints/nonmax-suppression", NONMAX_SUPPRESSION),
    ("keypoints/multiscale-sobel", MULTISCALE_SOBEL),
    ("keypoints/multiscale-harris", MULTISCALE_HARRIS),
    ("keypoints/harris-row-max", HARRIS_ROW_MAX),
    ("keypoints/harris-cutoff", HARRIS_CUTOFF),
    ("keypoints/orientation-via-centroid", ORIENTATION_VIA_CENTROID),
];

pub fn group() -> Result<ProgramGroup> {
    let mut group = ProgramGroup::new("keypoints");
    let fast = ["image", "threshold"];
    group
        // FAST
        .compose("fast9", &["_fast9", "_fastScore16"])?
        .compose("fast7", &["_fast7", "_fastScore12"])?
        .compose("fast5", &["_fast5", "_fastScore8"])?
        .declare("_fast9", import_shader("keypoints/fast9", FAST9).with_arguments(&fast), ProgramOptions::default())?
        .declare("_fast7", import_shader("keypoints/fast7", FAST7).with_arguments(&fast), ProgramOptions::default())?
        .declare("_fast5", import_shader("keypoints/fast5", FAST5).with_arguments(&fast), ProgramOptions::default())?
        .declare(
            "_fastScore16",
            import_shader("keypoints/fast-score16", FAST_SCORE16).with_arguments(&fast),
            ProgramOptions::default(),
        )?
        .declare(
            "_fastScore12",
            import_shader("keypoints/fast-score12", FAST_SCORE12).with_arguments(&fast),
            ProgramOptions::default(),
        )?
        .declare(
            "_fastScore8",
            import_shader("keypoints/fast-score8", FAST_SCORE8).with_arguments(&fast),
            ProgramOptions::default(),
        )?
        // Harris
        .declare(
            "multiscaleHarris",
            import_shader("keypoints/multiscale-harris", MULTISCALE_HARRIS)
                .with_arguments(&["image", "derivatives", "windowRadius"])
                .with_default("windowRadius", 2u32)?,
            ProgramOptions::default(),
        )?
        .compose("harrisCutoff", &["_harrisRowMax", "_harrisCutoff"])?
        .declare(
            "_harrisRowMax",
            import_shader("keypoints/harris-row-max", HARRIS_ROW_MAX).with_arguments(&["corners"]),
            ProgramOptions::default(),
        )?
        .declare(
            "_harrisCutoff",
            import_shader("keypoints/harris-cutoff", HARRIS_CUTOFF).with_arguments(&["rowMax", "corners", "quality"]),
            ProgramOptions::default(),
        )?
        // shared
        .declare(
            "nonmaxSuppression",
            import_shader("keypoints/nonmax-suppression", NONMAX_SUPPRESSION).with_arguments(&["image"]),
            ProgramOptions::default(),
        )?
        .declare(
            "multiscaleSobel",
            import_shader("keypoints/multiscale-sobel", MULTISCALE_SOBEL).with_arguments(&["pyramid"]),
            ProgramOptions::default().does_not_recycle_textures(),
        )?
        .declare(
            "orientationViaCentroid",
            import_shader("keypoints/orientation-via-centroid", ORIENTATION_VIA_CENTROID)
                .with_arguments(&["corners", "patchRadius"])
                .with_default("patchRadius", 7u32)?,
            ProgramOptions::default(),
        )?;
    Ok(group)
}
