//! Device backend seam.
//!
//! The graph core never touches tensor contents. Every primitive node is evaluated by a
//! [`Backend`] chosen for the compute device through the [`registry`]; the backend owns
//! the forward and backward math of the op catalog.

pub mod registry;

use std::fmt;

use crate::device::DeviceDescriptor;
use crate::graph::{Attributes, PrimitiveOp, RngState};
use crate::tensor::{Shape, Tensor};

pub use registry::{backend_for, has_backend, register_backend, registered_kinds};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    Unimplemented { op: &'static str, reason: String },
    Execution { message: String },
}

impl BackendError {
    pub fn unimplemented(op: &'static str, reason: impl Into<String>) -> Self {
        BackendError::Unimplemented {
            op,
            reason: reason.into(),
        }
    }

    pub fn execution(message: impl Into<String>) -> Self {
        BackendError::Execution {
            message: message.into(),
        }
    }
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendError::Unimplemented { op, reason } => {
                write!(f, "{op} is not implemented: {reason}")
            }
            BackendError::Execution { message } => {
                write!(f, "backend execution failure: {message}")
            }
        }
    }
}

impl std::error::Error for BackendError {}

/// Convenience alias for results returned by backend routines.
pub type BackendResult<T> = Result<T, BackendError>;

/// Everything a kernel needs to know about the node it evaluates.
#[derive(Debug, Clone, Copy)]
pub struct KernelContext<'a> {
    pub op: PrimitiveOp,
    pub node_uid: &'a str,
    pub attributes: &'a Attributes,
    pub output_shapes: &'a [Shape],
    /// Random stream position for stateful ops; backward receives the position used by
    /// the matching forward evaluation.
    pub rng: Option<RngState>,
    pub device: DeviceDescriptor,
}

pub trait Backend: Send + Sync {
    /// Returns a human-readable backend identifier (e.g. `"cpu"`).
    fn backend_name(&self) -> &str;

    /// Evaluates one node, returning one tensor per output, bound to `ctx.device`.
    fn forward(&self, ctx: &KernelContext<'_>, inputs: &[&Tensor]) -> BackendResult<Vec<Tensor>>;

    /// Computes the gradient contribution for each input given the gradients flowing
    /// into the node's outputs. `None` output gradients carry no flow; `None` results
    /// mean the input receives nothing from this node.
    fn backward(
        &self,
        ctx: &KernelContext<'_>,
        inputs: &[&Tensor],
        outputs: &[&Tensor],
        output_gradients: &[Option<&Tensor>],
    ) -> BackendResult<Vec<Option<Tensor>>>;
}
