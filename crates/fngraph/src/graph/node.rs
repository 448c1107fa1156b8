use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::hashing::{fnv1a_init, fnv1a_u64};

use super::op::{Attributes, PrimitiveOp, ATTR_SEED};
use super::variable::Variable;

/// Arena index of a primitive node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub(crate) u32);

impl NodeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

/// Random stream position of a stateful node: the mask of evaluation `offset` is
/// derived from `seed` and `offset` alone, so restoring both reproduces it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RngState {
    pub seed: u64,
    pub offset: u64,
}

impl RngState {
    pub(crate) fn initial(attributes: &Attributes) -> Self {
        RngState {
            seed: attributes.get_i64(ATTR_SEED).unwrap_or(0) as u64,
            offset: 0,
        }
    }

    /// Seed for the generator of evaluation `offset`. Seed and offset are hashed
    /// together, so nodes with neighbouring seeds never share a mask.
    pub fn stream_seed(&self) -> u64 {
        fnv1a_u64(fnv1a_u64(fnv1a_init(), self.seed), self.offset)
    }
}

/// Encapsulated sub-graph behind a block node.
#[derive(Debug, Clone)]
pub struct BlockBody {
    /// Root of the body graph; lives in the same arena as the block node.
    pub root: NodeId,
    pub op_name: String,
    /// Body placeholders, bound positionally to the block's leading inputs.
    pub placeholders: Vec<Variable>,
    /// Body outputs, mapped positionally to the block's outputs.
    pub outputs: Vec<Variable>,
}

/// Single primitive operation in the graph.
#[derive(Debug, Clone)]
pub struct PrimitiveFunction {
    pub(crate) id: NodeId,
    pub(crate) op: PrimitiveOp,
    pub(crate) inputs: Vec<Variable>,
    pub(crate) outputs: Vec<Variable>,
    pub(crate) name: String,
    pub(crate) uid: String,
    pub(crate) attributes: Attributes,
    pub(crate) block: Option<Arc<BlockBody>>,
    pub(crate) rng_state: Option<RngState>,
}

impl PrimitiveFunction {
    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn op(&self) -> PrimitiveOp {
        self.op
    }

    pub fn inputs(&self) -> &[Variable] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[Variable] {
        &self.outputs
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn uid(&self) -> &str {
        &self.uid
    }

    pub fn attributes(&self) -> &Attributes {
        &self.attributes
    }

    pub fn block(&self) -> Option<&Arc<BlockBody>> {
        self.block.as_ref()
    }

    pub fn is_block(&self) -> bool {
        self.block.is_some()
    }

    pub fn rng_state(&self) -> Option<RngState> {
        self.rng_state
    }
}
