//! Pipeline nodes: named port sets around a node implementation.

use super::graph::PipelineOutput;
use super::message::{KindSet, Message, MessageKind};
use super::nodes::{Detector, DetectorSettings, Greyscale, ImageSink, ImageSource, KeypointDetector, KeypointSink, SinkOptions};
use super::port::{InputPort, OutputPort, PortDirection};
use crate::error::Result;
use crate::gpu::programs::GpuPrograms;
use crate::gpu::{GpuContext, TexturePool};

/// Everything a node may touch while it runs.
pub struct NodeContext<'a> {
    pub gpu: &'a mut dyn GpuContext,
    pub pool: &'a mut TexturePool,
    pub programs: &'a mut GpuPrograms,
    pub exports: &'a mut PipelineOutput,
}

pub(crate) enum NodeKind {
    ImageSource(ImageSource),
    Greyscale(Greyscale),
    KeypointDetector(KeypointDetector),
    KeypointSink(KeypointSink),
    ImageSink(ImageSink),
}

/// A node of the pipeline graph.
pub struct Node {
    name: String,
    inputs: Vec<InputPort>,
    outputs: Vec<OutputPort>,
    pub(crate) kind: NodeKind,
}

impl Node {
    fn new(name: &str, inputs: Vec<InputPort>, outputs: Vec<OutputPort>, kind: NodeKind) -> Self {
        Self {
            name: name.to_string(),
            inputs,
            outputs,
            kind,
        }
    }

    /// Uploads media handed to it with [`Pipeline::set_media`](super::Pipeline::set_media).
    pub fn image_source(name: &str) -> Self {
        Self::new(
            name,
            vec![],
            vec![OutputPort::new().expects(MessageKind::Image)],
            NodeKind::ImageSource(ImageSource::default()),
        )
    }

    /// Converts an image to a single luma channel.
    pub fn greyscale(name: &str) -> Self {
        Self::new(
            name,
            vec![InputPort::new().expects(MessageKind::Image)],
            vec![OutputPort::new().expects(MessageKind::Image)],
            NodeKind::Greyscale(Greyscale),
        )
    }

    pub fn keypoint_detector(name: &str, detector: Detector) -> Self {
        Self::keypoint_detector_with(name, detector, DetectorSettings::default())
    }

    pub fn keypoint_detector_with(name: &str, detector: Detector, settings: DetectorSettings) -> Self {
        Self::new(
            name,
            vec![InputPort::new().expects(MessageKind::Image)],
            vec![OutputPort::new().expects(MessageKind::Keypoints)],
            NodeKind::KeypointDetector(KeypointDetector::new(detector, settings)),
        )
    }

    /// Downloads keypoints into [`PipelineOutput::keypoints`].
    pub fn keypoint_sink(name: &str) -> Self {
        Self::keypoint_sink_with(name, SinkOptions::default())
    }

    pub fn keypoint_sink_with(name: &str, options: SinkOptions) -> Self {
        Self::new(
            name,
            vec![InputPort::new().expects(MessageKind::Keypoints)],
            vec![],
            NodeKind::KeypointSink(KeypointSink::new(options)),
        )
    }

    /// Downloads images into [`PipelineOutput::images`].
    pub fn image_sink(name: &str) -> Self {
        Self::image_sink_with(name, SinkOptions::default())
    }

    pub fn image_sink_with(name: &str, options: SinkOptions) -> Self {
        Self::new(
            name,
            vec![InputPort::new().expects(MessageKind::Image)],
            vec![],
            NodeKind::ImageSink(ImageSink::new(options)),
        )
    }

    /// Append an extra input port the implementation does not read.
    #[cfg(test)]
    pub(crate) fn with_input(mut self, port: InputPort) -> Self {
        self.inputs.push(port);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn inputs(&self) -> &[InputPort] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[OutputPort] {
        &self.outputs
    }

    pub fn port_index(&self, direction: PortDirection, name: &str) -> Option<usize> {
        match direction {
            PortDirection::Input => self.inputs.iter().position(|port| port.name == name),
            PortDirection::Output => self.outputs.iter().position(|port| port.name == name),
        }
    }

    /// Kinds this node may write on output `index`.
    pub fn produces(&self, index: usize) -> KindSet {
        self.outputs.get(index).map(|port| port.produces).unwrap_or(KindSet::EMPTY)
    }

    /// Drop handles to textures the pool has destroyed.
    pub(crate) fn forget_textures(&mut self) {
        if let NodeKind::ImageSource(source) = &mut self.kind {
            source.forget_texture();
        }
    }

    /// Run once. `inputs` holds one entry per input port; the result holds
    /// one message per output port.
    pub(crate) async fn run(&mut self, ctx: &mut NodeContext<'_>, inputs: &[Option<Message>]) -> Result<Vec<Message>> {
        let name = self.name.as_str();
        match &mut self.kind {
            NodeKind::ImageSource(node) => node.run(name, ctx),
            NodeKind::Greyscale(node) => node.run(name, ctx, inputs),
            NodeKind::KeypointDetector(node) => node.run(name, ctx, inputs),
            NodeKind::KeypointSink(node) => node.run(name, ctx, inputs).await,
            NodeKind::ImageSink(node) => node.run(name, ctx, inputs).await,
        }
    }
}
