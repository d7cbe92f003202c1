//! YAML configuration for the standard detection pipeline.

use crate::error::{Error, Result};
use crate::gpu::{GpuContext, SoftwareContext, WgpuContext};
use crate::pipeline::{Detector, DetectorSettings, Node, NodeId, Pipeline, SinkOptions};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::info;

/// Name of the keypoint sink added by [`PipelineConfig::build`].
pub const KEYPOINT_SINK: &str = "keypoints";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// CPU reference kernels.
    #[default]
    Software,
    /// Headless wgpu device.
    Wgpu,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    pub kind: Detector,
    #[serde(flatten)]
    pub settings: DetectorSettings,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            kind: Detector::Fast9,
            settings: DetectorSettings::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaderConfig {
    /// Host buffers per reader.
    pub buffers: usize,
    /// Trade one frame of latency for not waiting on transfers.
    pub buffered_downloads: bool,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        let sink = SinkOptions::default();
        Self {
            buffers: sink.buffers,
            buffered_downloads: sink.turbo,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub backend: Backend,
    pub detector: DetectorConfig,
    pub reader: ReaderConfig,
}

impl PipelineConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;
        let config = Self::from_yaml_str(&content)?;
        info!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(content)?;
        if config.reader.buffers == 0 {
            return Err(Error::IllegalArgument("reader.buffers must be at least 1".to_string()));
        }
        Ok(config)
    }

    /// Open the configured GPU backend.
    pub fn open_context(&self) -> Result<Box<dyn GpuContext>> {
        Ok(match self.backend {
            Backend::Software => Box::new(SoftwareContext::new()),
            Backend::Wgpu => Box::new(WgpuContext::new()?),
        })
    }

    /// Build `source -> detector -> keypoint sink`. Returns the pipeline and
    /// the source node to hand media to.
    pub fn build(&self) -> Result<(Pipeline, NodeId)> {
        let mut pipeline = Pipeline::new()?;
        let source = pipeline.add(Node::image_source("source"))?;
        let detector = pipeline.add(Node::keypoint_detector_with(
            "detector",
            self.detector.kind,
            self.detector.settings.clone(),
        ))?;
        let sink = pipeline.add(Node::keypoint_sink_with(
            KEYPOINT_SINK,
            SinkOptions {
                turbo: self.reader.buffered_downloads,
                buffers: self.reader.buffers,
            },
        ))?;
        pipeline.connect(source, "out", detector, "in")?;
        pipeline.connect(detector, "out", sink, "in")?;
        pipeline.validate()?;
        Ok((pipeline, source))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_uses_defaults() {
        let config = PipelineConfig::from_yaml_str("{}").unwrap();
        assert_eq!(config, PipelineConfig::default());
        assert_eq!(config.backend, Backend::Software);
        assert_eq!(config.detector.settings.threshold, 10);
        assert_eq!(config.reader.buffers, 2);
        assert!(!config.reader.buffered_downloads);
    }

    #[test]
    fn detector_settings_sit_next_to_the_kind() {
        let config = PipelineConfig::from_yaml_str(
            "detector:\n  kind: harris\n  quality: 0.25\n  capacity: 16\nreader:\n  buffered_downloads: true\n",
        )
        .unwrap();
        assert_eq!(config.detector.kind, Detector::Harris);
        assert_eq!(config.detector.settings.quality, 0.25);
        assert_eq!(config.detector.settings.capacity, 16);
        assert_eq!(config.detector.settings.window_radius, 2);
        assert!(config.reader.buffered_downloads);
    }

    #[test]
    fn bad_documents_are_rejected() {
        assert!(matches!(
            PipelineConfig::from_yaml_str("backend: vulkan"),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            PipelineConfig::from_yaml_str("reader:\n  buffers: 0"),
            Err(Error::IllegalArgument(_))
        ));
    }

    #[test]
    fn build_produces_a_validated_pipeline() {
        let (pipeline, source) = PipelineConfig::default().build().unwrap();
        assert_eq!(pipeline.len(), 3);
        assert_eq!(pipeline.node_id("source"), Some(source));
        assert!(pipeline.node_id(KEYPOINT_SINK).is_some());
    }

    #[test]
    fn missing_file_is_an_io_error() {
        assert!(matches!(
            PipelineConfig::load("/nonexistent/retina.yaml"),
            Err(Error::Io(_))
        ));
    }
}
