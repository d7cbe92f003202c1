//! Node implementations.

mod detector;
mod greyscale;
mod sink;
mod source;

pub use detector::{Detector, DetectorSettings, KeypointDetector};
pub use greyscale::Greyscale;
pub use sink::{ImageSink, Keypoint, KeypointSink, SinkOptions};
pub use source::ImageSource;

use super::message::Message;
use crate::error::{Error, Result};

/// The message on input port `index`, which validation guarantees is linked.
fn input(node: &str, inputs: &[Option<Message>], index: usize) -> Result<Message> {
    inputs
        .get(index)
        .copied()
        .flatten()
        .ok_or_else(|| Error::graph(node, Some("in"), "no message received"))
}
