//! The pipeline graph: node storage, links, validation and execution.

use super::message::Message;
use super::node::{Node, NodeContext, NodeKind};
use super::nodes::Keypoint;
use super::port::PortDirection;
use crate::error::{Error, Result};
use crate::gpu::programs::GpuPrograms;
use crate::gpu::{GpuContext, TexturePool};
use crate::media::Media;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use tracing::{debug, info};

/// Index into `Pipeline::nodes`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub u32);

impl NodeId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.0)
    }
}

/// Output port `output` of `from` feeds input port `input` of `to`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Link {
    from: NodeId,
    output: usize,
    to: NodeId,
    input: usize,
}

/// What the sinks downloaded during one run, keyed by sink name.
#[derive(Debug, Default)]
pub struct PipelineOutput {
    pub keypoints: HashMap<String, Vec<Keypoint>>,
    pub images: HashMap<String, Media>,
}

impl PipelineOutput {
    pub fn keypoints(&self, sink: &str) -> Option<&[Keypoint]> {
        self.keypoints.get(sink).map(Vec::as_slice)
    }

    pub fn image(&self, sink: &str) -> Option<&Media> {
        self.images.get(sink)
    }
}

/// A directed acyclic graph of nodes sharing one texture pool.
///
/// The graph is validated and scheduled once; any later `add` or `connect`
/// invalidates the schedule and the next [`Pipeline::run`] validates again.
pub struct Pipeline {
    nodes: Vec<Node>,
    links: Vec<Link>,
    order: Option<Vec<NodeId>>,
    pool: TexturePool,
    programs: GpuPrograms,
}

impl Pipeline {
    pub fn new() -> Result<Self> {
        Ok(Self {
            nodes: Vec::new(),
            links: Vec::new(),
            order: None,
            pool: TexturePool::new(),
            programs: GpuPrograms::new()?,
        })
    }

    /// Add a node. Node names are unique within a pipeline.
    pub fn add(&mut self, node: Node) -> Result<NodeId> {
        if self.node_id(node.name()).is_some() {
            return Err(Error::Conflict(format!("a node named '{}' already exists", node.name())));
        }
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(node);
        self.order = None;
        Ok(id)
    }

    pub fn node_id(&self, name: &str) -> Option<NodeId> {
        self.nodes
            .iter()
            .position(|node| node.name() == name)
            .map(|index| NodeId(index as u32))
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.index())
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn lookup(&self, id: NodeId) -> Result<&Node> {
        self.nodes.get(id.index()).ok_or_else(|| Error::NotFound(format!("node {id}")))
    }

    /// Link output port `output` of `from` to input port `input` of `to`.
    /// Kind compatibility and fan-in are checked by [`Pipeline::validate`].
    pub fn connect(&mut self, from: NodeId, output: &str, to: NodeId, input: &str) -> Result<()> {
        let source = self.lookup(from)?;
        let output_index = source
            .port_index(PortDirection::Output, output)
            .ok_or_else(|| Error::graph(source.name(), Some(output), "no such output port"))?;
        let target = self.lookup(to)?;
        let input_index = target
            .port_index(PortDirection::Input, input)
            .ok_or_else(|| Error::graph(target.name(), Some(input), "no such input port"))?;

        debug!("Linking {}.{} -> {}.{}", source.name(), output, target.name(), input);
        self.links.push(Link {
            from,
            output: output_index,
            to,
            input: input_index,
        });
        self.order = None;
        Ok(())
    }

    /// Hand media to a source node. It is uploaded on the next run.
    pub fn set_media(&mut self, id: NodeId, media: Media) -> Result<()> {
        let node = self
            .nodes
            .get_mut(id.index())
            .ok_or_else(|| Error::NotFound(format!("node {id}")))?;
        match &mut node.kind {
            NodeKind::ImageSource(source) => source.set_media(media),
            _ => Err(Error::Type(format!("'{}' is not a media source", node.name()))),
        }
    }

    /// Check ports and links, then compute the execution order.
    pub fn validate(&mut self) -> Result<()> {
        for (index, node) in self.nodes.iter().enumerate() {
            for (port_index, port) in node.inputs().iter().enumerate() {
                let mut feeding = self
                    .links
                    .iter()
                    .filter(|link| link.to.index() == index && link.input == port_index);
                let first = feeding.next();
                if feeding.next().is_some() {
                    return Err(Error::graph(node.name(), Some(port.name), "connected more than once"));
                }
                match first {
                    None if port.required => {
                        return Err(Error::graph(node.name(), Some(port.name), "required input is not connected"));
                    }
                    None => {}
                    Some(link) => {
                        let upstream = &self.nodes[link.from.index()];
                        if !upstream.produces(link.output).intersects(port.accepts) {
                            let output = upstream.outputs()[link.output].name;
                            return Err(Error::graph(
                                node.name(),
                                Some(port.name),
                                format!("cannot accept what {}.{} produces", upstream.name(), output),
                            ));
                        }
                    }
                }
            }
        }

        let order = self.topological_order()?;
        info!("Pipeline validated: {} nodes, {} links", self.nodes.len(), self.links.len());
        self.order = Some(order);
        Ok(())
    }

    /// Kahn's algorithm; ties are broken by insertion order.
    fn topological_order(&self) -> Result<Vec<NodeId>> {
        let n = self.nodes.len();
        let mut in_degree = vec![0usize; n];
        let mut downstream = vec![Vec::new(); n];
        for link in &self.links {
            in_degree[link.to.index()] += 1;
            downstream[link.from.index()].push(link.to.index());
        }

        let mut ready: VecDeque<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();
        let mut order = Vec::with_capacity(n);
        while let Some(index) = ready.pop_front() {
            order.push(NodeId(index as u32));
            for &next in &downstream[index] {
                in_degree[next] -= 1;
                if in_degree[next] == 0 {
                    ready.push_back(next);
                }
            }
        }

        if order.len() < n {
            // Every unscheduled node has an unscheduled predecessor, so walking
            // upstream from one of them ends on a node of the cycle.
            let mut stuck = (0..n).find(|&i| in_degree[i] > 0).unwrap_or(0);
            let mut visited = vec![false; n];
            while !visited[stuck] {
                visited[stuck] = true;
                match self
                    .links
                    .iter()
                    .find(|link| link.to.index() == stuck && in_degree[link.from.index()] > 0)
                {
                    Some(link) => stuck = link.from.index(),
                    None => break,
                }
            }
            return Err(Error::graph(self.nodes[stuck].name(), None, "node is part of a cycle"));
        }
        Ok(order)
    }

    /// Run every node once in topological order and collect what the sinks
    /// downloaded. Pooled textures are reclaimed whether or not the run
    /// succeeds, so a failed run can be retried.
    pub async fn run(&mut self, gpu: &mut dyn GpuContext) -> Result<PipelineOutput> {
        if self.order.is_none() {
            self.validate()?;
        }
        let order = self.order.clone().unwrap_or_default();

        let mut exports = PipelineOutput::default();
        let result = self.execute(gpu, &order, &mut exports).await;
        self.pool.reclaim();
        result.map(|()| exports)
    }

    async fn execute(&mut self, gpu: &mut dyn GpuContext, order: &[NodeId], exports: &mut PipelineOutput) -> Result<()> {
        let mut produced: Vec<Vec<Message>> = vec![Vec::new(); self.nodes.len()];
        for &id in order {
            let inputs = self.gather_inputs(id, &produced);
            let node = &mut self.nodes[id.index()];
            let mut ctx = NodeContext {
                gpu: &mut *gpu,
                pool: &mut self.pool,
                programs: &mut self.programs,
                exports: &mut *exports,
            };
            debug!("Running '{}'", node.name());
            let messages = node
                .run(&mut ctx, &inputs)
                .await
                .inspect_err(|e| debug!("'{}' failed: {}", node.name(), e))?;
            self.check_outputs(id, &messages)?;
            produced[id.index()] = messages;
        }
        Ok(())
    }

    fn gather_inputs(&self, id: NodeId, produced: &[Vec<Message>]) -> Vec<Option<Message>> {
        let node = &self.nodes[id.index()];
        (0..node.inputs().len())
            .map(|port| {
                self.links
                    .iter()
                    .find(|link| link.to == id && link.input == port)
                    .and_then(|link| produced[link.from.index()].get(link.output).copied())
            })
            .collect()
    }

    /// One message per output port, of a kind the port declares and every
    /// linked input accepts.
    fn check_outputs(&self, id: NodeId, messages: &[Message]) -> Result<()> {
        let node = &self.nodes[id.index()];
        if messages.len() != node.outputs().len() {
            return Err(Error::IllegalOperation(format!(
                "'{}' produced {} messages for {} output ports",
                node.name(),
                messages.len(),
                node.outputs().len()
            )));
        }
        for (port, message) in messages.iter().enumerate() {
            let kind = message.kind();
            if !node.produces(port).contains(kind) {
                return Err(Error::IllegalOperation(format!(
                    "'{}' wrote {} to {}",
                    node.name(),
                    kind,
                    node.outputs()[port].name
                )));
            }
            for link in self.links.iter().filter(|link| link.from == id && link.output == port) {
                let target = &self.nodes[link.to.index()];
                if !target.inputs()[link.input].accepts.contains(kind) {
                    return Err(Error::IllegalOperation(format!(
                        "'{}' cannot accept {} from '{}'",
                        target.name(),
                        kind,
                        node.name()
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn pool(&self) -> &TexturePool {
        &self.pool
    }

    /// Release every texture and forget compiled programs. The pipeline can
    /// be run again afterwards, on this or another context.
    pub fn teardown(&mut self, gpu: &mut dyn GpuContext) {
        self.programs.utils.reset(&mut self.pool);
        self.programs.keypoints.reset(&mut self.pool);
        for node in &mut self.nodes {
            node.forget_textures();
        }
        self.pool.teardown(gpu);
        info!("Pipeline torn down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::{SoftwareContext, TextureFormat};
    use crate::media::PixelFormat;
    use crate::pipeline::message::ImageFormat;
    use crate::pipeline::nodes::Detector;
    use crate::pipeline::port::InputPort;

    fn fast_pipeline() -> (Pipeline, NodeId, NodeId, NodeId) {
        let mut pipeline = Pipeline::new().unwrap();
        let source = pipeline.add(Node::image_source("source")).unwrap();
        let fast = pipeline.add(Node::keypoint_detector("fast", Detector::Fast9)).unwrap();
        let sink = pipeline.add(Node::keypoint_sink("keypoints")).unwrap();
        (pipeline, source, fast, sink)
    }

    #[test]
    fn duplicate_node_names_conflict() {
        let mut pipeline = Pipeline::new().unwrap();
        pipeline.add(Node::greyscale("grey")).unwrap();
        assert!(matches!(pipeline.add(Node::greyscale("grey")), Err(Error::Conflict(_))));
    }

    #[test]
    fn unknown_ports_name_the_node() {
        let (mut pipeline, source, fast, _) = fast_pipeline();
        let err = pipeline.connect(source, "out", fast, "image").unwrap_err();
        assert!(matches!(
            err,
            Error::GraphConfiguration { ref node, port: Some(ref port), .. } if node == "fast" && port == "image"
        ));
        assert!(matches!(
            pipeline.connect(NodeId(9), "out", fast, "in"),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn unconnected_required_input_fails_validation() {
        let (mut pipeline, source, fast, _) = fast_pipeline();
        pipeline.connect(source, "out", fast, "in").unwrap();
        let err = pipeline.validate().unwrap_err();
        assert!(matches!(err, Error::GraphConfiguration { ref node, .. } if node == "keypoints"));
    }

    #[test]
    fn incompatible_kinds_fail_validation() {
        let (mut pipeline, source, fast, sink) = fast_pipeline();
        pipeline.connect(source, "out", fast, "in").unwrap();
        // An image into a keypoint sink
        pipeline.connect(source, "out", sink, "in").unwrap();
        let err = pipeline.validate().unwrap_err();
        assert!(matches!(err, Error::GraphConfiguration { ref node, .. } if node == "keypoints"));
    }

    #[test]
    fn fan_in_fails_validation() {
        let mut pipeline = Pipeline::new().unwrap();
        let a = pipeline.add(Node::image_source("a")).unwrap();
        let b = pipeline.add(Node::image_source("b")).unwrap();
        let grey = pipeline.add(Node::greyscale("grey")).unwrap();
        pipeline.connect(a, "out", grey, "in").unwrap();
        pipeline.connect(b, "out", grey, "in").unwrap();
        let err = pipeline.validate().unwrap_err();
        assert!(matches!(err, Error::GraphConfiguration { ref node, .. } if node == "grey"));
    }

    #[test]
    fn cycles_fail_validation() {
        let mut pipeline = Pipeline::new().unwrap();
        let a = pipeline.add(Node::greyscale("a")).unwrap();
        let b = pipeline.add(Node::greyscale("b")).unwrap();
        pipeline.connect(a, "out", b, "in").unwrap();
        pipeline.connect(b, "out", a, "in").unwrap();
        let err = pipeline.validate().unwrap_err();
        assert!(matches!(err, Error::GraphConfiguration { port: None, .. }));
    }

    #[test]
    fn cycle_errors_name_a_node_on_the_cycle() {
        let mut pipeline = Pipeline::new().unwrap();
        let sink = pipeline.add(Node::image_sink("sink")).unwrap();
        let a = pipeline.add(Node::greyscale("a")).unwrap();
        let b = pipeline.add(Node::greyscale("b")).unwrap();
        pipeline.connect(a, "out", b, "in").unwrap();
        pipeline.connect(b, "out", a, "in").unwrap();
        pipeline.connect(b, "out", sink, "in").unwrap();
        let err = pipeline.validate().unwrap_err();
        assert!(
            matches!(err, Error::GraphConfiguration { ref node, port: None, .. } if node == "a" || node == "b"),
            "{err}"
        );
    }

    #[test]
    fn unconnected_optional_input_is_delivered_as_none() {
        let mut pipeline = Pipeline::new().unwrap();
        let source = pipeline.add(Node::image_source("source")).unwrap();
        let grey = pipeline
            .add(Node::greyscale("grey").with_input(InputPort::named("mask").optional()))
            .unwrap();
        let sink = pipeline.add(Node::image_sink("preview")).unwrap();
        pipeline.connect(source, "out", grey, "in").unwrap();
        pipeline.connect(grey, "out", sink, "in").unwrap();
        pipeline.validate().unwrap();

        let mut gpu = SoftwareContext::new();
        let texture = gpu.create_texture(2, 2, TextureFormat::R8).unwrap();
        let image = Message::Image {
            texture,
            format: ImageFormat::Greyscale,
        };
        let inputs = pipeline.gather_inputs(grey, &[vec![image], vec![], vec![]]);
        assert_eq!(inputs, [Some(image), None]);

        pipeline
            .set_media(source, Media::from_data(2, 2, PixelFormat::Grey, vec![1, 2, 3, 4]))
            .unwrap();
        let output = pollster::block_on(pipeline.run(&mut gpu)).unwrap();
        assert_eq!(output.image("preview").map(|image| image.data.as_slice()), Some(&[1, 2, 3, 4][..]));
    }

    #[test]
    fn order_follows_links() {
        let (mut pipeline, source, fast, sink) = fast_pipeline();
        // Connected back to front; order must still be source first.
        pipeline.connect(fast, "out", sink, "in").unwrap();
        pipeline.connect(source, "out", fast, "in").unwrap();
        pipeline.validate().unwrap();
        assert_eq!(pipeline.order.as_deref(), Some(&[source, fast, sink][..]));
    }

    #[test]
    fn set_media_checks_node_and_media() {
        let (mut pipeline, source, fast, _) = fast_pipeline();
        let media = Media::from_data(2, 2, PixelFormat::Grey, vec![0; 4]);
        assert!(matches!(pipeline.set_media(fast, media.clone()), Err(Error::Type(_))));
        let broken = Media::from_data(2, 2, PixelFormat::Rgba, vec![0; 3]);
        assert!(matches!(pipeline.set_media(source, broken), Err(Error::Type(_))));
        assert!(pipeline.set_media(source, media).is_ok());
    }

    #[test]
    fn running_without_media_is_illegal_and_reclaims() {
        let (mut pipeline, source, fast, sink) = fast_pipeline();
        pipeline.connect(source, "out", fast, "in").unwrap();
        pipeline.connect(fast, "out", sink, "in").unwrap();
        let mut gpu = SoftwareContext::new();
        let result = pollster::block_on(pipeline.run(&mut gpu));
        assert!(matches!(result, Err(Error::IllegalOperation(_))));
        assert_eq!(pipeline.pool().in_use(), 0);
    }

    #[test]
    fn teardown_releases_every_texture() {
        let (mut pipeline, source, fast, sink) = fast_pipeline();
        pipeline.connect(source, "out", fast, "in").unwrap();
        pipeline.connect(fast, "out", sink, "in").unwrap();
        pipeline
            .set_media(source, Media::from_data(8, 8, PixelFormat::Grey, vec![0; 64]))
            .unwrap();
        let mut gpu = SoftwareContext::new();
        pollster::block_on(pipeline.run(&mut gpu)).unwrap();
        assert!(gpu.texture_count() > 0);

        pipeline.teardown(&mut gpu);
        assert_eq!(gpu.texture_count(), 0);
        assert!(pipeline.pool().is_empty());

        // Sources re-acquire their textures on the next run.
        let output = pollster::block_on(pipeline.run(&mut gpu)).unwrap();
        assert_eq!(output.keypoints("keypoints"), Some(&[][..]));
    }
}
