use std::collections::HashSet;

use tracing::debug;

use crate::composite::CompositeFunction;
use crate::error::{Error, Result};
use crate::graph::traversal::post_order_in;
use crate::graph::{
    ArenaInner, BlockBody, NodeId, PrimitiveFunction, Variable, VariableId, VariableKind,
};

use super::dictionary::{
    BlockCompositeRecord, GraphDictionary, NodeRecord, OutputRecord, TensorRecord,
    VariableRecord, COMPOSITE_KIND, CURRENT_VERSION,
};

struct Encoder<'a> {
    inner: &'a ArenaInner,
    variables: Vec<VariableRecord>,
    recorded: HashSet<VariableId>,
    /// Placeholders of the block bodies being encoded; recorded with their block.
    bound: HashSet<VariableId>,
}

impl<'a> Encoder<'a> {
    fn encode_graph(&mut self, root: NodeId) -> Result<Vec<NodeRecord>> {
        post_order_in(self.inner, &[root])?
            .into_iter()
            .map(|id| {
                let inner = self.inner;
                self.encode_node(inner.get(id)?)
            })
            .collect()
    }

    fn encode_node(&mut self, node: &PrimitiveFunction) -> Result<NodeRecord> {
        for input in &node.inputs {
            if input.is_leaf() && !self.bound.contains(&input.id()) {
                self.record_leaf(input)?;
            }
        }
        let block = match &node.block {
            Some(body) => Some(self.serialize_block_composite(body)?),
            None => None,
        };
        Ok(NodeRecord {
            uid: node.uid.clone(),
            name: node.name.clone(),
            op: node.op,
            attributes: node.attributes.clone(),
            inputs: node.inputs.iter().map(|input| input.uid().to_string()).collect(),
            outputs: node
                .outputs
                .iter()
                .map(|output| OutputRecord {
                    uid: output.uid().to_string(),
                    name: output.name().to_string(),
                    shape: output.shape().clone(),
                })
                .collect(),
            rng_state: node.rng_state,
            block,
        })
    }

    fn serialize_block_composite(&mut self, body: &BlockBody) -> Result<BlockCompositeRecord> {
        let newly_bound: Vec<VariableId> = body
            .placeholders
            .iter()
            .map(Variable::id)
            .filter(|id| self.bound.insert(*id))
            .collect();
        let nodes = self.encode_graph(body.root);
        for id in &newly_bound {
            self.bound.remove(id);
        }
        Ok(BlockCompositeRecord {
            op_name: body.op_name.clone(),
            root: self.inner.get(body.root)?.uid.clone(),
            placeholders: body
                .placeholders
                .iter()
                .map(|placeholder| placeholder.uid().to_string())
                .collect(),
            outputs: body
                .outputs
                .iter()
                .map(|output| output.uid().to_string())
                .collect(),
            nodes: nodes?,
            variables: body
                .placeholders
                .iter()
                .map(leaf_record)
                .collect::<Result<Vec<_>>>()?,
        })
    }

    fn record_leaf(&mut self, variable: &Variable) -> Result<()> {
        if self.recorded.insert(variable.id()) {
            self.variables.push(leaf_record(variable)?);
        }
        Ok(())
    }
}

fn leaf_record(variable: &Variable) -> Result<VariableRecord> {
    let (value, timestamp) = match variable.kind() {
        VariableKind::Parameter => {
            let parameter = variable
                .as_parameter()
                .ok_or_else(|| Error::graph(format!("{variable} carries no parameter storage")))?;
            let value = parameter.with_value(|value| TensorRecord::from(value));
            (Some(value), Some(parameter.timestamp()))
        }
        VariableKind::Constant => {
            let value = variable
                .constant_value()
                .ok_or_else(|| Error::graph(format!("constant {variable} carries no value")))?;
            (Some(TensorRecord::from(value)), None)
        }
        VariableKind::Input | VariableKind::Placeholder => (None, None),
        VariableKind::Output => {
            return Err(Error::graph(format!(
                "{variable} is an output and cannot be recorded as a leaf"
            )))
        }
    };
    Ok(VariableRecord {
        uid: variable.uid().to_string(),
        kind: variable.kind(),
        shape: variable.shape().clone(),
        name: variable.name().to_string(),
        value,
        timestamp,
    })
}

impl CompositeFunction {
    /// Captures topology, variable identities, parameter values with their timestamps,
    /// and the RNG state of stateful nodes.
    pub fn serialize(&self) -> Result<GraphDictionary> {
        let inner = self.arena().lock();
        let mut encoder = Encoder {
            inner: &inner,
            variables: Vec::new(),
            recorded: HashSet::new(),
            bound: HashSet::new(),
        };
        let nodes = encoder.encode_graph(self.root())?;
        let variables = encoder.variables;
        debug!(
            function = %self.uid(),
            nodes = nodes.len(),
            variables = variables.len(),
            "serialized composite function"
        );
        Ok(GraphDictionary {
            version: CURRENT_VERSION,
            kind: COMPOSITE_KIND.to_string(),
            name: self.name().to_string(),
            uid: self.uid().to_string(),
            root: inner.get(self.root())?.uid.clone(),
            variables,
            nodes,
        })
    }
}
