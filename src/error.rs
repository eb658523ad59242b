//! Error types for backends and the texture graph.
//!
//! Faults fall into three groups:
//!
//! - A detached modifier is not an error at all. It reports
//!   [`can_update`](crate::TextureProvider::can_update) as `false` and its
//!   `texture()` returns `Ok(None)`.
//! - An upstream that cannot produce makes its consumers return `Ok(None)` and stay dirty.
//! - Backend faults surface as [`GraphError::Backend`]. The node that hit the fault
//!   stays dirty and nothing is published.

use thiserror::Error;

use crate::graph::NodeId;

/// Errors raised by a [`ComputeBackend`](crate::ComputeBackend).
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BackendError {
    /// No kernel with this name exists in the backend's catalogue.
    #[error("unknown kernel '{0}'")]
    UnknownKernel(String),

    /// The kernel exists but could not be compiled.
    #[error("failed to compile kernel '{name}': {reason}")]
    KernelCompile { name: String, reason: String },

    /// A texture or buffer could not be allocated.
    #[error("allocation failed: {0}")]
    Allocation(String),

    /// The device rejected or failed a kernel dispatch.
    #[error("dispatch of kernel '{kernel}' failed: {reason}")]
    Dispatch { kernel: String, reason: String },

    /// Zero-sized or otherwise unusable dimensions.
    #[error("invalid dimensions: {0}")]
    InvalidDimensions(String),

    /// A handle that the backend does not know (already released, or foreign).
    #[error("unknown {0}")]
    UnknownResource(String),

    /// Texel data does not match the texture it is written to.
    #[error("expected {expected} texel components, got {actual}")]
    TexelCount { expected: usize, actual: usize },

    /// Adapter or device level failure.
    #[error("device error: {0}")]
    Device(String),
}

/// Result type for backend operations.
pub type BackendResult<T> = Result<T, BackendError>;

/// Errors raised while assembling or evaluating a [`TextureGraph`](crate::TextureGraph).
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GraphError {
    /// The id does not name a live node.
    #[error("unknown node {0:?}")]
    UnknownNode(NodeId),

    /// The edge would close a cycle, or evaluation re-entered a node.
    #[error("cycle detected at node {0:?}")]
    Cycle(NodeId),

    /// The stage is a generator and takes no upstream.
    #[error("stage '{0}' does not accept an upstream provider")]
    NoInput(&'static str),

    /// The stage has no control with this name.
    #[error("stage '{stage}' has no control named '{name}'")]
    UnknownControl { stage: &'static str, name: String },

    /// The control exists but the value has the wrong type.
    #[error("control '{name}' expects a {expected} value")]
    ControlType { name: String, expected: &'static str },

    /// The upstream image could not be turned into the intermediate needed for a
    /// derived-image computation.
    #[error("failed to derive image for stage '{stage}': {reason}")]
    Derive { stage: &'static str, reason: String },

    /// A backend fault while computing a node.
    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// Result type for graph operations.
pub type GraphResult<T> = Result<T, GraphError>;
