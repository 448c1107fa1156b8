//! Version 1 layout. Identical to the current one except that nodes carry no RNG state;
//! decoding upgrades it, and stateful nodes restart from the seed in their attributes.

use serde::{Deserialize, Serialize};

use crate::graph::{Attributes, PrimitiveOp};

use super::dictionary::{
    BlockCompositeRecord, GraphDictionary, NodeRecord, OutputRecord, VariableRecord,
    CURRENT_VERSION,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct GraphDictionaryV1 {
    pub version: u32,
    pub kind: String,
    pub name: String,
    pub uid: String,
    pub root: String,
    pub variables: Vec<VariableRecord>,
    pub nodes: Vec<NodeRecordV1>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct NodeRecordV1 {
    pub uid: String,
    pub name: String,
    pub op: PrimitiveOp,
    pub attributes: Attributes,
    pub inputs: Vec<String>,
    pub outputs: Vec<OutputRecord>,
    pub block: Option<BlockCompositeRecordV1>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct BlockCompositeRecordV1 {
    pub op_name: String,
    pub root: String,
    pub placeholders: Vec<String>,
    pub outputs: Vec<String>,
    pub nodes: Vec<NodeRecordV1>,
    pub variables: Vec<VariableRecord>,
}

impl From<GraphDictionaryV1> for GraphDictionary {
    fn from(legacy: GraphDictionaryV1) -> Self {
        GraphDictionary {
            version: CURRENT_VERSION,
            kind: legacy.kind,
            name: legacy.name,
            uid: legacy.uid,
            root: legacy.root,
            variables: legacy.variables,
            nodes: legacy.nodes.into_iter().map(NodeRecord::from).collect(),
        }
    }
}

impl From<NodeRecordV1> for NodeRecord {
    fn from(legacy: NodeRecordV1) -> Self {
        NodeRecord {
            uid: legacy.uid,
            name: legacy.name,
            op: legacy.op,
            attributes: legacy.attributes,
            inputs: legacy.inputs,
            outputs: legacy.outputs,
            rng_state: None,
            block: legacy.block.map(BlockCompositeRecord::from),
        }
    }
}

impl From<BlockCompositeRecordV1> for BlockCompositeRecord {
    fn from(legacy: BlockCompositeRecordV1) -> Self {
        BlockCompositeRecord {
            op_name: legacy.op_name,
            root: legacy.root,
            placeholders: legacy.placeholders,
            outputs: legacy.outputs,
            nodes: legacy.nodes.into_iter().map(NodeRecord::from).collect(),
            variables: legacy.variables,
        }
    }
}

#[cfg(test)]
pub(crate) fn downgrade(dictionary: GraphDictionary) -> GraphDictionaryV1 {
    fn node(record: NodeRecord) -> NodeRecordV1 {
        NodeRecordV1 {
            uid: record.uid,
            name: record.name,
            op: record.op,
            attributes: record.attributes,
            inputs: record.inputs,
            outputs: record.outputs,
            block: record.block.map(|block| BlockCompositeRecordV1 {
                op_name: block.op_name,
                root: block.root,
                placeholders: block.placeholders,
                outputs: block.outputs,
                nodes: block.nodes.into_iter().map(node).collect(),
                variables: block.variables,
            }),
        }
    }
    GraphDictionaryV1 {
        version: 1,
        kind: dictionary.kind,
        name: dictionary.name,
        uid: dictionary.uid,
        root: dictionary.root,
        variables: dictionary.variables,
        nodes: dictionary.nodes.into_iter().map(node).collect(),
    }
}
