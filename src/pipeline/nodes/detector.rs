//! Keypoint detection node: FAST or Harris corners followed by
//! non-maximum suppression.

use super::input;
use crate::error::{Error, Result};
use crate::gpu::{Args, Texture};
use crate::pipeline::message::{ImageFormat, Message};
use crate::pipeline::node::NodeContext;
use serde::{Deserialize, Serialize};
use tracing::trace;

/// Corner detector run by a [`KeypointDetector`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Detector {
    #[default]
    Fast9,
    Fast7,
    Fast5,
    Harris,
}

impl Detector {
    fn program(&self) -> &'static str {
        match self {
            Detector::Fast9 => "fast9",
            Detector::Fast7 => "fast7",
            Detector::Fast5 => "fast5",
            Detector::Harris => "multiscaleHarris",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorSettings {
    /// FAST intensity threshold on a 0-255 scale.
    pub threshold: u8,
    /// Harris corners weaker than `quality` times the strongest are dropped.
    pub quality: f32,
    /// Half-size of the Harris structure tensor window.
    pub window_radius: u32,
    /// Maximum number of keypoints reported downstream.
    pub capacity: usize,
}

impl Default for DetectorSettings {
    fn default() -> Self {
        Self {
            threshold: 10,
            quality: 0.1,
            window_radius: 2,
            capacity: 2048,
        }
    }
}

pub struct KeypointDetector {
    detector: Detector,
    settings: DetectorSettings,
}

impl KeypointDetector {
    pub fn new(detector: Detector, settings: DetectorSettings) -> Self {
        Self { detector, settings }
    }

    pub(crate) fn run(&mut self, name: &str, ctx: &mut NodeContext<'_>, inputs: &[Option<Message>]) -> Result<Vec<Message>> {
        // Upstream textures belong to the graph; only a converted copy is ours to release.
        let (grey, converted) = match input(name, inputs, 0)? {
            Message::Image {
                texture,
                format: ImageFormat::Greyscale,
            } => (texture, false),
            Message::Image { texture, .. } => {
                let args = Args::new().with("image", texture);
                (ctx.programs.utils.run(ctx.gpu, ctx.pool, "rgb2grey", &args)?, true)
            }
            other => return Err(Error::Type(format!("'{name}' expects an image, got {}", other.kind()))),
        };

        let corners = match self.detector {
            Detector::Harris => self.harris(ctx, &grey),
            fast => {
                let threshold = self.settings.threshold as f32 / 255.0;
                let args = Args::new().with("image", grey).with("threshold", threshold);
                ctx.programs.keypoints.run(ctx.gpu, ctx.pool, fast.program(), &args)
            }
        };
        if converted {
            ctx.pool.release(&grey);
        }
        let corners = corners?;

        let keypoints = ctx
            .programs
            .keypoints
            .run(ctx.gpu, ctx.pool, "nonmaxSuppression", &Args::new().with("image", corners));
        ctx.pool.release(&corners);
        let keypoints = keypoints?;
        trace!("'{}' detected corners into {}", name, keypoints);

        Ok(vec![Message::Keypoints {
            texture: keypoints,
            capacity: self.settings.capacity,
        }])
    }

    fn harris(&self, ctx: &mut NodeContext<'_>, grey: &Texture) -> Result<Texture> {
        let keypoints = &mut ctx.programs.keypoints;
        let derivatives = keypoints.run(ctx.gpu, ctx.pool, "multiscaleSobel", &Args::new().with("pyramid", *grey))?;
        let args = Args::new()
            .with("image", *grey)
            .with("derivatives", derivatives)
            .with("windowRadius", self.settings.window_radius);
        let response = keypoints.run(ctx.gpu, ctx.pool, self.detector.program(), &args)?;
        let args = Args::new().with("corners", response).with("quality", self.settings.quality);
        let corners = keypoints.run(ctx.gpu, ctx.pool, "harrisCutoff", &args);
        ctx.pool.release(&response);
        corners
    }
}
