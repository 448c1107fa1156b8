//! Serde data model of a serialized composite.
//!
//! Variables are referenced by uid throughout. Leaf variables are listed once in
//! [`GraphDictionary::variables`]; output variables are described by the node that owns
//! them. Nodes appear in dependency order, but decoders sort them again and do not rely
//! on it.

use serde::{Deserialize, Serialize};

use crate::graph::{Attributes, PrimitiveOp, RngState, VariableKind};
use crate::tensor::{Shape, Tensor};

/// Dictionary version written by this build.
pub const CURRENT_VERSION: u32 = 2;

/// Every dictionary version this build can decode.
/// 1: initial layout. 2: adds RNG state of stateful nodes.
pub const SUPPORTED_VERSIONS: &[u32] = &[1, 2];

pub(crate) const COMPOSITE_KIND: &str = "CompositeFunction";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphDictionary {
    pub version: u32,
    pub kind: String,
    pub name: String,
    pub uid: String,
    /// Uid of the root node.
    pub root: String,
    pub variables: Vec<VariableRecord>,
    pub nodes: Vec<NodeRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableRecord {
    pub uid: String,
    pub kind: VariableKind,
    pub shape: Shape,
    pub name: String,
    /// Parameter and constant contents.
    pub value: Option<TensorRecord>,
    /// Parameter timestamp at the time of serialization.
    pub timestamp: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorRecord {
    pub shape: Shape,
    pub data: Vec<f32>,
}

impl From<&Tensor> for TensorRecord {
    fn from(tensor: &Tensor) -> Self {
        TensorRecord {
            shape: tensor.shape().clone(),
            data: tensor.data().to_vec(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputRecord {
    pub uid: String,
    pub name: String,
    pub shape: Shape,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub uid: String,
    pub name: String,
    pub op: PrimitiveOp,
    pub attributes: Attributes,
    /// Input variable uids, in positional order.
    pub inputs: Vec<String>,
    pub outputs: Vec<OutputRecord>,
    pub rng_state: Option<RngState>,
    pub block: Option<BlockCompositeRecord>,
}

/// Body of a block node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockCompositeRecord {
    pub op_name: String,
    /// Uid of the body root node.
    pub root: String,
    /// Body placeholder uids, bound positionally to the block's leading inputs.
    pub placeholders: Vec<String>,
    /// Body output uids, mapped positionally to the block's outputs.
    pub outputs: Vec<String>,
    pub nodes: Vec<NodeRecord>,
    /// Variables local to the body: its placeholders.
    pub variables: Vec<VariableRecord>,
}
