//! Retina CLI: detect keypoints in an image.

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use retina::config::{Backend, PipelineConfig, KEYPOINT_SINK};
use retina::media::Media;
use retina::pipeline::Detector;
use std::path::PathBuf;
use std::time::Instant;
use tracing::info;

/// GPU backend to run on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum BackendArg {
    /// CPU reference kernels
    Software,
    /// Headless wgpu device
    Wgpu,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum DetectorArg {
    Fast9,
    Fast7,
    Fast5,
    Harris,
}

/// Detect keypoints in an image.
#[derive(Parser, Debug)]
#[command(name = "retina")]
#[command(about = "Run a GPU keypoint pipeline over an image")]
struct Args {
    /// Image file to process
    #[arg(short, long)]
    image: PathBuf,

    /// YAML pipeline configuration
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the configured backend
    #[arg(long, value_enum)]
    backend: Option<BackendArg>,

    /// Override the configured detector
    #[arg(long, value_enum)]
    detector: Option<DetectorArg>,

    /// Override the FAST threshold (0-255)
    #[arg(short, long)]
    threshold: Option<u8>,

    /// Use buffered downloads (results lag one frame behind)
    #[arg(long)]
    turbo: bool,

    /// Number of times to run the pipeline
    #[arg(long, default_value = "1")]
    frames: u32,

    /// Downscale the image so neither side exceeds this
    #[arg(long)]
    max_dimension: Option<u32>,

    /// Number of keypoints to print
    #[arg(long, default_value = "20")]
    show: usize,
}

fn apply_overrides(config: &mut PipelineConfig, args: &Args) {
    if let Some(backend) = args.backend {
        config.backend = match backend {
            BackendArg::Software => Backend::Software,
            BackendArg::Wgpu => Backend::Wgpu,
        };
    }
    if let Some(detector) = args.detector {
        config.detector.kind = match detector {
            DetectorArg::Fast9 => Detector::Fast9,
            DetectorArg::Fast7 => Detector::Fast7,
            DetectorArg::Fast5 => Detector::Fast5,
            DetectorArg::Harris => Detector::Harris,
        };
    }
    if let Some(threshold) = args.threshold {
        config.detector.settings.threshold = threshold;
    }
    if args.turbo {
        config.reader.buffered_downloads = true;
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => PipelineConfig::load(path).with_context(|| format!("Failed to load config {:?}", path))?,
        None => PipelineConfig::default(),
    };
    apply_overrides(&mut config, &args);

    let mut media = Media::load(&args.image).with_context(|| format!("Failed to load image {:?}", args.image))?;
    if let Some(max_dimension) = args.max_dimension {
        media = media.scale_to_fit(max_dimension)?;
    }
    info!("Loaded {}x{} image from {:?}", media.width, media.height, args.image);

    let mut gpu = config.open_context().context("Failed to open GPU context")?;
    let (mut pipeline, source) = config.build().context("Failed to build pipeline")?;
    pipeline.set_media(source, media)?;

    for frame in 0..args.frames {
        let start = Instant::now();
        let output = pollster::block_on(pipeline.run(gpu.as_mut()))
            .with_context(|| format!("Frame {frame} failed"))?;
        let keypoints = output.keypoints(KEYPOINT_SINK).unwrap_or_default();
        info!(
            "Frame {}: {} keypoints in {:.2} ms",
            frame,
            keypoints.len(),
            start.elapsed().as_secs_f64() * 1000.0
        );

        if frame + 1 == args.frames {
            for keypoint in keypoints.iter().take(args.show) {
                println!("{:5} {:5} {:.3}", keypoint.x, keypoint.y, keypoint.score);
            }
        }
    }

    pipeline.teardown(gpu.as_mut());
    Ok(())
}
