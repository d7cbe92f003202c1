//! Retina: GPU keypoint pipelines.
//!
//! A pipeline is a graph of nodes exchanging textures through typed ports.
//! Nodes run kernels registered in program groups and download their
//! results through multi-buffered texture readers.

pub mod config;
pub mod error;
pub mod gpu;
pub mod media;
pub mod pipeline;

pub use error::{Error, Result};
