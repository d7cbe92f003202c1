//! Pipeline graph of nodes connected through typed ports.

mod graph;
pub mod message;
mod node;
pub mod nodes;
pub mod port;

pub use graph::{NodeId, Pipeline, PipelineOutput};
pub use message::{ImageFormat, KindSet, Message, MessageKind};
pub use node::{Node, NodeContext};
pub use nodes::{Detector, DetectorSettings, Keypoint, SinkOptions};
pub use port::{InputPort, OutputPort, PortDirection};
