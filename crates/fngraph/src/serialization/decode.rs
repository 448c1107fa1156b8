use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use tracing::debug;

use crate::composite::CompositeFunction;
use crate::device::DeviceDescriptor;
use crate::error::{ensure, Error, Result};
use crate::graph::{
    ArenaInner, GraphArena, NodeId, NodeSpec, OutputSpec, Parameter, PrimitiveOp, Variable,
    VariableKind,
};
use crate::tensor::Tensor;

use super::dictionary::{
    BlockCompositeRecord, GraphDictionary, NodeRecord, VariableRecord, COMPOSITE_KIND,
    SUPPORTED_VERSIONS,
};

/// Rebuilds records into an arena. Variables share one uid namespace across the whole
/// dictionary, block bodies included.
struct Decoder<'a> {
    inner: &'a mut ArenaInner,
    device: DeviceDescriptor,
    variables: HashMap<String, Variable>,
    nodes: HashMap<String, NodeId>,
}

impl<'a> Decoder<'a> {
    fn variable(&self, uid: &str) -> Result<Variable> {
        self.variables
            .get(uid)
            .cloned()
            .ok_or_else(|| Error::graph(format!("variable {uid} is referenced but never defined")))
    }

    fn restore_variable(&mut self, record: &VariableRecord) -> Result<()> {
        ensure!(
            !self.variables.contains_key(&record.uid),
            format,
            "variable uid {} is defined twice",
            record.uid
        );
        let name = record.name.clone();
        let uid = Some(record.uid.clone());
        let variable = match record.kind {
            VariableKind::Input | VariableKind::Placeholder => {
                Variable::restore_leaf(record.kind, record.shape.clone(), name, uid)
            }
            VariableKind::Parameter => {
                let value = self.restore_value(record)?;
                let timestamp = record.timestamp.unwrap_or(1);
                Parameter::restore(value, name, uid, timestamp)
                    .variable()
                    .clone()
            }
            VariableKind::Constant => {
                Variable::restore_constant(self.restore_value(record)?, name, uid)
            }
            VariableKind::Output => {
                return Err(Error::format(format!(
                    "output {} is listed as a leaf variable",
                    record.uid
                )))
            }
        };
        self.variables.insert(record.uid.clone(), variable);
        Ok(())
    }

    fn restore_value(&self, record: &VariableRecord) -> Result<Tensor> {
        let value = record.value.as_ref().ok_or_else(|| {
            Error::format(format!("{:?} {} has no value", record.kind, record.uid))
        })?;
        ensure!(
            value.shape == record.shape,
            format,
            "value of {} has shape {}, variable declares {}",
            record.uid,
            value.shape,
            record.shape
        );
        Tensor::from_vec_on(value.shape.clone(), value.data.clone(), self.device)
            .map_err(|err| Error::format(format!("value of {}: {err}", record.uid)))
    }

    /// Restores `records` in dependency order: Kahn's algorithm with ties broken by
    /// record position.
    fn restore_nodes(&mut self, records: &[NodeRecord]) -> Result<()> {
        let mut producers: HashMap<&str, usize> = HashMap::new();
        for (index, record) in records.iter().enumerate() {
            for output in &record.outputs {
                ensure!(
                    producers.insert(output.uid.as_str(), index).is_none(),
                    format,
                    "variable {} is produced by more than one node",
                    output.uid
                );
            }
        }

        let mut indegree = vec![0usize; records.len()];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); records.len()];
        for (index, record) in records.iter().enumerate() {
            for input in &record.inputs {
                match producers.get(input.as_str()) {
                    Some(&producer) => {
                        dependents[producer].push(index);
                        indegree[index] += 1;
                    }
                    None => ensure!(
                        self.variables.contains_key(input),
                        graph,
                        "node {} consumes {}, which no node or variable record provides",
                        record.uid,
                        input
                    ),
                }
            }
        }

        let mut ready: BTreeSet<usize> = (0..records.len())
            .filter(|index| indegree[*index] == 0)
            .collect();
        let mut restored = 0;
        while let Some(index) = ready.pop_first() {
            self.restore_node(&records[index])?;
            restored += 1;
            for &dependent in &dependents[index] {
                indegree[dependent] -= 1;
                if indegree[dependent] == 0 {
                    ready.insert(dependent);
                }
            }
        }
        ensure!(
            restored == records.len(),
            graph,
            "node records form a cycle; {} of {} could be ordered",
            restored,
            records.len()
        );
        Ok(())
    }

    fn restore_node(&mut self, record: &NodeRecord) -> Result<()> {
        ensure!(
            !self.nodes.contains_key(&record.uid),
            format,
            "node uid {} is defined twice",
            record.uid
        );
        ensure!(
            (record.op == PrimitiveOp::Block) == record.block.is_some(),
            format,
            "node {} ({}) disagrees with its block body",
            record.uid,
            record.op
        );
        let inputs = record
            .inputs
            .iter()
            .map(|uid| self.variable(uid))
            .collect::<Result<Vec<_>>>()?;
        let spec = NodeSpec {
            op: record.op,
            inputs,
            attributes: record.attributes.clone(),
            name: record.name.clone(),
            uid: Some(record.uid.clone()),
            outputs: record
                .outputs
                .iter()
                .map(|output| OutputSpec {
                    uid: output.uid.clone(),
                    name: output.name.clone(),
                })
                .collect(),
            block: None,
            rng_state: record.rng_state,
        };
        let id = match &record.block {
            Some(block) => self.deserialize_block_composite(block, spec)?,
            None => self.inner.insert(spec)?,
        };

        let outputs = self.inner.get(id)?.outputs.clone();
        ensure!(
            outputs.len() == record.outputs.len(),
            format,
            "node {} decodes to {} outputs, {} recorded",
            record.uid,
            outputs.len(),
            record.outputs.len()
        );
        for (output, expected) in outputs.into_iter().zip(&record.outputs) {
            ensure!(
                output.shape() == &expected.shape,
                format,
                "output {} of node {} decodes to shape {}, recorded {}",
                expected.uid,
                record.uid,
                output.shape(),
                expected.shape
            );
            self.variables.insert(expected.uid.clone(), output);
        }
        self.nodes.insert(record.uid.clone(), id);
        Ok(())
    }

    /// Rebuilds a block body and wraps it. The leading inputs of `spec` are bound to the
    /// body placeholders; the remaining inputs must match the body's other leaves.
    fn deserialize_block_composite(
        &mut self,
        block: &BlockCompositeRecord,
        spec: NodeSpec,
    ) -> Result<NodeId> {
        for record in &block.variables {
            ensure!(
                record.kind == VariableKind::Placeholder,
                format,
                "block {} lists {:?} {} as a body variable",
                block.op_name,
                record.kind,
                record.uid
            );
            self.restore_variable(record)?;
        }
        self.restore_nodes(&block.nodes)?;

        let body_root = self.nodes.get(&block.root).copied().ok_or_else(|| {
            Error::graph(format!("block body root {} was not decoded", block.root))
        })?;
        let placeholders = block
            .placeholders
            .iter()
            .map(|uid| self.variable(uid))
            .collect::<Result<Vec<_>>>()?;
        ensure!(
            spec.inputs.len() >= placeholders.len(),
            format,
            "block {} binds {} placeholders but has {} inputs",
            block.op_name,
            placeholders.len(),
            spec.inputs.len()
        );
        let recorded_inputs = spec.inputs.clone();
        let placeholder_replacements: Vec<(Variable, Variable)> = placeholders
            .into_iter()
            .zip(recorded_inputs.iter().cloned())
            .collect();

        let id = self.inner.insert_block(
            body_root,
            &placeholder_replacements,
            block.op_name.clone(),
            spec,
        )?;
        let node = self.inner.get(id)?;
        ensure!(
            node.inputs == recorded_inputs,
            format,
            "inputs of block {} do not match the leaves of its body",
            node.uid
        );
        let body_outputs: Vec<&str> = node
            .block
            .iter()
            .flat_map(|body| body.outputs.iter().map(Variable::uid))
            .collect();
        ensure!(
            body_outputs == block.outputs,
            format,
            "block {} body outputs {:?} do not match recorded {:?}",
            node.uid,
            body_outputs,
            block.outputs
        );
        Ok(id)
    }
}

impl CompositeFunction {
    /// Rebuilds a composite in a fresh arena, placing parameter and constant values on
    /// `device`. Variables and nodes keep their recorded uids.
    pub fn deserialize(
        dictionary: &GraphDictionary,
        device: DeviceDescriptor,
    ) -> Result<Arc<CompositeFunction>> {
        if !SUPPORTED_VERSIONS.contains(&dictionary.version) {
            return Err(Error::VersionMismatch {
                found: dictionary.version,
                supported: SUPPORTED_VERSIONS,
            });
        }
        ensure!(
            dictionary.kind == COMPOSITE_KIND,
            format,
            "expected a {} dictionary, found {}",
            COMPOSITE_KIND,
            dictionary.kind
        );

        let arena = GraphArena::new();
        let root = {
            let mut inner = arena.lock();
            let mut decoder = Decoder {
                inner: &mut *inner,
                device,
                variables: HashMap::new(),
                nodes: HashMap::new(),
            };
            for record in &dictionary.variables {
                decoder.restore_variable(record)?;
            }
            decoder.restore_nodes(&dictionary.nodes)?;
            debug!(
                function = %dictionary.uid,
                version = dictionary.version,
                nodes = decoder.nodes.len(),
                variables = decoder.variables.len(),
                "decoded graph dictionary"
            );
            decoder.nodes.get(&dictionary.root).copied().ok_or_else(|| {
                Error::graph(format!("root node {} was not decoded", dictionary.root))
            })?
        };
        CompositeFunction::create(&arena, root, dictionary.name.clone(), dictionary.uid.clone())
    }

    /// Structural copy with its own parameters, initialized from the current values.
    pub fn clone_with_parameters(&self, device: DeviceDescriptor) -> Result<Arc<CompositeFunction>> {
        CompositeFunction::deserialize(&self.serialize()?, device)
    }
}
