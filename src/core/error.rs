//! Typed faults raised while building and synthesizing stacks.

use std::path::PathBuf;
use thiserror::Error;

/// Raised when a token cannot be materialized.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TokenError {
    /// A deferred image (or its parameter name) was materialized before any
    /// consumer allocated its placeholder parameter.
    #[error("{0} was materialized before bind: no placeholder parameter has been allocated")]
    Unbound(String),

    #[error("{image} has no binding in stack '{stack}'")]
    NotBoundInStack { image: String, stack: String },

    #[error("token nesting exceeds {0} levels")]
    TooDeep(usize),

    #[error("expected a literal string, got {0}")]
    NotLiteral(String),
}

/// Raised while constructing or synthesizing the stack graph.
#[derive(Debug, Error)]
pub enum SynthError {
    #[error(transparent)]
    Token(#[from] TokenError),

    #[error("duplicate logical id '{id}' in stack '{stack}'")]
    DuplicateLogicalId { stack: String, id: String },

    #[error("{image} is already bound to '{consumer}' in stack '{stack}'")]
    AlreadyBound {
        image: String,
        consumer: String,
        stack: String,
    },

    #[error("unknown stack '{0}'")]
    UnknownStack(String),

    #[error("stack graph: {0}")]
    Dependency(String),

    #[error("unknown pipeline image '{stack}/{image}'")]
    UnknownImage { stack: String, image: String },

    #[error("parameter override '{name}' does not match a parameter of stack '{stack}'")]
    UnknownParameter { stack: String, name: String },

    #[error("invalid CIDR '{cidr}': {reason}")]
    Cidr { cidr: String, reason: String },

    #[error("asset {}: {message}", .path.display())]
    Asset { path: PathBuf, message: String },

    #[error("cannot write {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("serialize error: {0}")]
    Serialize(#[from] serde_json::Error),
}
