//! Error types shared by the GPU layer and the pipeline graph.

use thiserror::Error;

/// Boxed low-level failure carried by [`Error::Operation`].
pub type BoxedCause = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors raised while building or running a pipeline.
#[derive(Error, Debug)]
pub enum Error {
    /// Structural problem in the graph (ports, links, cycles).
    #[error("Graph configuration error at {node}{}: {message}", .port.as_ref().map(|p| format!(".{p}")).unwrap_or_default())]
    GraphConfiguration {
        node: String,
        port: Option<String>,
        message: String,
    },

    /// The GPU context cannot run what was asked of it.
    #[error("Capability error: {0}")]
    Capability(String),

    /// A program name is already registered.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// A program, node or port could not be found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// A kernel argument was neither supplied nor defaulted.
    #[error("Missing argument '{argument}' for program '{program}'")]
    MissingArgument { program: String, argument: String },

    #[error("Illegal argument: {0}")]
    IllegalArgument(String),

    #[error("Illegal operation: {0}")]
    IllegalOperation(String),

    /// A low-level transfer failed.
    #[error("{message}: {source}")]
    Operation {
        message: String,
        #[source]
        source: BoxedCause,
    },

    /// A value of the wrong kind was handed to a node.
    #[error("Type error: {0}")]
    Type(String),

    #[error("Configuration error: {0}")]
    Config(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn graph(node: impl Into<String>, port: Option<&str>, message: impl Into<String>) -> Self {
        Error::GraphConfiguration {
            node: node.into(),
            port: port.map(str::to_string),
            message: message.into(),
        }
    }

    pub fn operation(message: impl Into<String>, source: BoxedCause) -> Self {
        Error::Operation {
            message: message.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn graph_error_names_node_and_port() {
        let err = Error::graph("fast", Some("in"), "not connected");
        assert_eq!(err.to_string(), "Graph configuration error at fast.in: not connected");

        let err = Error::graph("fast", None, "cycle");
        assert_eq!(err.to_string(), "Graph configuration error at fast: cycle");
    }

    #[test]
    fn operation_error_keeps_its_cause() {
        let cause: BoxedCause = Box::new(std::io::Error::other("dma failed"));
        let err = Error::operation("Can't read pixels", cause);
        assert!(std::error::Error::source(&err).is_some());
        assert_eq!(err.to_string(), "Can't read pixels: dma failed");
    }
}
