//! Graph model: variables, primitive nodes, the arena that owns them, and traversal.

mod arena;
mod node;
pub mod op;
pub mod traversal;
mod variable;

pub use arena::GraphArena;
pub(crate) use arena::{ArenaInner, NodeSpec, OutputSpec};
pub use node::{BlockBody, NodeId, PrimitiveFunction, RngState};
pub use op::{AttributeValue, Attributes, PrimitiveOp};
pub use traversal::{collect, determine_inputs, fingerprint, traverse, traverse_with};
pub use variable::{
    next_auto_generated_uid, Parameter, Variable, VariableId, VariableKind,
};
