//! Composite function graphs.
//!
//! Primitive operations are recorded as nodes in a shared [`GraphArena`]. A
//! [`CompositeFunction`] wraps the graph reachable from one root node and evaluates it:
//! forward through a cached execution plan on a device backend, backward from the roots a
//! forward pass retained. Placeholders can be substituted after construction, growing
//! the graph every composite over the arena sees. Composites serialize to a versioned
//! dictionary with bincode and JSON encodings.

pub mod backend;
pub mod composite;
pub mod device;
mod env;
pub mod error;
pub mod graph;
pub(crate) mod hashing;
pub mod serialization;
pub mod tensor;

pub use composite::{BackpropState, CompositeFunction, PlanKey, PlanStats, PlanSummary};
pub use device::{DeviceDescriptor, DeviceKind};
pub use error::{Error, ErrorKind, Result};
pub use graph::{
    Attributes, GraphArena, NodeId, Parameter, PrimitiveFunction, PrimitiveOp, Variable,
    VariableKind,
};
pub use tensor::{Shape, Tensor};
