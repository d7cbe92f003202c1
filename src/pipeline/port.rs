//! Port declarations.
//!
//! Each node declares its ports up front. The graph uses them to validate
//! links before anything runs.

use super::message::KindSet;

/// Whether a port is an input or output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortDirection {
    Input,
    Output,
}

#[derive(Debug, Clone)]
pub struct InputPort {
    pub name: &'static str,
    pub accepts: KindSet,
    pub required: bool,
}

impl InputPort {
    /// A required input named `in`.
    pub fn new() -> Self {
        Self::named("in")
    }

    pub fn named(name: &'static str) -> Self {
        Self {
            name,
            accepts: KindSet::ALL,
            required: true,
        }
    }

    pub fn expects(mut self, kinds: impl Into<KindSet>) -> Self {
        self.accepts = kinds.into();
        self
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }
}

impl Default for InputPort {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub struct OutputPort {
    pub name: &'static str,
    pub produces: KindSet,
}

impl OutputPort {
    /// An output named `out`.
    pub fn new() -> Self {
        Self::named("out")
    }

    pub fn named(name: &'static str) -> Self {
        Self {
            name,
            produces: KindSet::ALL,
        }
    }

    pub fn expects(mut self, kinds: impl Into<KindSet>) -> Self {
        self.produces = kinds.into();
        self
    }
}

impl Default for OutputPort {
    fn default() -> Self {
        Self::new()
    }
}
