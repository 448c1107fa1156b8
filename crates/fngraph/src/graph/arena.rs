//! Shared arena that owns every primitive node of a graph.
//!
//! Nodes are addressed by [`NodeId`] and never move or disappear once created, so
//! composites, plans and serialized dictionaries can refer to them by id. Edges are
//! [`Variable`] handles: a node's inputs are variables, and each output variable records
//! the id of the node that produced it.
//!
//! Placeholder replacement is the one structural edit the arena supports. It rewrites
//! the inputs of every node that consumes a replaced placeholder, so it is a global edit:
//! every composite sharing the arena observes it. The edit is validated in full before
//! anything is written, which keeps the graph acyclic and unchanged on failure.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::debug;

use crate::error::{ensure, Error, Result};

use super::node::{BlockBody, NodeId, PrimitiveFunction, RngState};
use super::op::{Attributes, PrimitiveOp, ATTR_FACTOR, ATTR_PARTS, ATTR_RATE, ATTR_SEED};
use super::traversal;
use super::variable::{next_auto_generated_uid, Variable, VariableId};

static ARENA_ID_COUNTER: AtomicUsize = AtomicUsize::new(0);

/// Identity and name to give an output variable instead of generated ones.
#[derive(Debug, Clone)]
pub(crate) struct OutputSpec {
    pub uid: String,
    pub name: String,
}

pub(crate) struct NodeSpec {
    pub op: PrimitiveOp,
    pub inputs: Vec<Variable>,
    pub attributes: Attributes,
    pub name: String,
    pub uid: Option<String>,
    pub outputs: Vec<OutputSpec>,
    pub block: Option<BlockBody>,
    pub rng_state: Option<RngState>,
}

impl NodeSpec {
    fn new(op: PrimitiveOp, inputs: Vec<Variable>, attributes: Attributes, name: String) -> Self {
        NodeSpec {
            op,
            inputs,
            attributes,
            name,
            uid: None,
            outputs: Vec::new(),
            block: None,
            rng_state: None,
        }
    }
}

pub(crate) struct ArenaInner {
    pub(crate) nodes: Vec<PrimitiveFunction>,
    pub(crate) version: u64,
    block_placeholders: HashSet<VariableId>,
}

impl ArenaInner {
    fn new() -> Self {
        ArenaInner {
            nodes: Vec::new(),
            version: 0,
            block_placeholders: HashSet::new(),
        }
    }

    pub(crate) fn get(&self, id: NodeId) -> Result<&PrimitiveFunction> {
        self.nodes
            .get(id.index())
            .ok_or_else(|| Error::graph(format!("node {id} is not registered in this arena")))
    }

    pub(crate) fn insert(&mut self, spec: NodeSpec) -> Result<NodeId> {
        let NodeSpec {
            op,
            inputs,
            attributes,
            name,
            uid,
            outputs: output_specs,
            block,
            rng_state,
        } = spec;

        for input in &inputs {
            if let Some(owner) = input.owner() {
                self.get(owner)?;
            }
        }

        let shapes = match &block {
            Some(body) => body
                .outputs
                .iter()
                .map(|output| output.shape().clone())
                .collect::<Vec<_>>(),
            None => {
                ensure!(
                    op != PrimitiveOp::Block,
                    argument,
                    "block nodes must be created through as_block"
                );
                let input_shapes = inputs
                    .iter()
                    .map(|input| input.shape().clone())
                    .collect::<Vec<_>>();
                op.infer_output_shapes(&input_shapes, &attributes)?
            }
        };
        ensure!(
            output_specs.is_empty() || output_specs.len() == shapes.len(),
            graph,
            "{} produces {} outputs but {} output identities were supplied",
            op,
            shapes.len(),
            output_specs.len()
        );

        let index = u32::try_from(self.nodes.len())
            .map_err(|_| Error::graph("arena node capacity exhausted"))?;
        let id = NodeId(index);
        let single = shapes.len() == 1;
        let outputs = shapes
            .into_iter()
            .enumerate()
            .map(|(index, shape)| match output_specs.get(index) {
                Some(spec) => {
                    Variable::output(id, index, shape, spec.name.clone(), Some(spec.uid.clone()))
                }
                None => {
                    let output_name = if single { name.clone() } else { String::new() };
                    Variable::output(id, index, shape, output_name, None)
                }
            })
            .collect();
        let rng_state = if op.is_stateful() {
            Some(rng_state.unwrap_or_else(|| RngState::initial(&attributes)))
        } else {
            None
        };

        self.nodes.push(PrimitiveFunction {
            id,
            op,
            inputs,
            outputs,
            name,
            uid: uid.unwrap_or_else(|| next_auto_generated_uid(op.name())),
            attributes,
            block: block.map(Arc::new),
            rng_state,
        });
        self.version += 1;
        Ok(id)
    }

    pub(crate) fn insert_block(
        &mut self,
        body_root: NodeId,
        arguments: &[(Variable, Variable)],
        op_name: String,
        mut spec: NodeSpec,
    ) -> Result<NodeId> {
        let body_outputs = self.get(body_root)?.outputs.clone();
        let leaves = traversal::determine_inputs_in(self, body_root)?;

        let mut placeholders: Vec<Variable> = Vec::with_capacity(arguments.len());
        let mut inputs = Vec::with_capacity(leaves.len());
        for (placeholder, argument) in arguments {
            ensure!(
                placeholder.is_placeholder(),
                argument,
                "block argument key {} is not a placeholder",
                placeholder
            );
            ensure!(
                leaves.contains(placeholder),
                argument,
                "placeholder {} is not an input of block body {}",
                placeholder,
                body_root
            );
            ensure!(
                !placeholders.contains(placeholder),
                argument,
                "placeholder {} is mapped twice",
                placeholder
            );
            ensure!(
                !self.block_placeholders.contains(&placeholder.id()),
                argument,
                "placeholder {} is already bound by another block",
                placeholder
            );
            ensure!(
                placeholder.shape() == argument.shape(),
                argument,
                "block argument {} has shape {}, placeholder {} expects {}",
                argument,
                argument.shape(),
                placeholder,
                placeholder.shape()
            );
            placeholders.push(placeholder.clone());
            inputs.push(argument.clone());
        }
        for leaf in leaves {
            if leaf.is_placeholder() {
                ensure!(
                    placeholders.contains(&leaf),
                    argument,
                    "block body placeholder {} has no argument",
                    leaf
                );
            } else {
                inputs.push(leaf);
            }
        }

        for placeholder in &placeholders {
            self.block_placeholders.insert(placeholder.id());
        }
        spec.inputs = inputs;
        spec.block = Some(BlockBody {
            root: body_root,
            op_name,
            placeholders,
            outputs: body_outputs,
        });
        self.insert(spec)
    }

    fn replace_placeholders(
        &mut self,
        replacements: &HashMap<Variable, Variable>,
    ) -> Result<HashSet<Variable>> {
        for (placeholder, replacement) in replacements {
            ensure!(
                placeholder.is_placeholder(),
                argument,
                "{} is not a placeholder and cannot be replaced",
                placeholder
            );
            ensure!(
                !self.block_placeholders.contains(&placeholder.id()),
                argument,
                "placeholder {} is bound by a block body",
                placeholder
            );
            ensure!(
                placeholder.shape() == replacement.shape(),
                argument,
                "replacement {} has shape {}, placeholder {} expects {}",
                replacement,
                replacement.shape(),
                placeholder,
                placeholder.shape()
            );
            if let Some(owner) = replacement.owner() {
                self.get(owner)?;
            }
        }

        // Chains P1 -> P2 -> X resolve to X; a chain ending in a placeholder outside the
        // mapping would leave the graph with an alias of an unresolved slot.
        let mut resolved: HashMap<VariableId, Variable> = HashMap::with_capacity(replacements.len());
        for (placeholder, replacement) in replacements {
            let mut target = replacement;
            let mut hops = 0;
            while target.is_placeholder() {
                match replacements.get(target) {
                    Some(next) => {
                        target = next;
                        hops += 1;
                        ensure!(
                            hops <= replacements.len(),
                            graph,
                            "placeholder replacements form a cycle through {}",
                            placeholder
                        );
                    }
                    None => {
                        return Err(Error::argument(format!(
                            "replacement for {placeholder} aliases unresolved placeholder {target}"
                        )))
                    }
                }
            }
            resolved.insert(placeholder.id(), target.clone());
        }

        let mut replaced = HashSet::new();
        let mut edits = Vec::new();
        for node in &self.nodes {
            for (slot, input) in node.inputs.iter().enumerate() {
                if let Some(target) = resolved.get(&input.id()) {
                    edits.push((node.id.index(), slot, target.clone()));
                    replaced.insert(input.clone());
                }
            }
        }
        self.check_acyclic(&edits)?;

        let applied = edits.len();
        for (node, slot, target) in edits {
            self.nodes[node].inputs[slot] = target;
        }
        if applied > 0 {
            self.version += 1;
        }
        debug!(
            placeholders = replaced.len(),
            edges = applied,
            "replaced placeholders"
        );
        Ok(replaced)
    }

    /// Kahn's algorithm over the whole arena with `edits` applied tentatively.
    fn check_acyclic(&self, edits: &[(usize, usize, Variable)]) -> Result<()> {
        let overrides: HashMap<(usize, usize), &Variable> = edits
            .iter()
            .map(|(node, slot, target)| ((*node, *slot), target))
            .collect();
        let count = self.nodes.len();
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); count];
        let mut indegree = vec![0usize; count];
        for node in &self.nodes {
            let index = node.id.index();
            for (slot, input) in node.inputs.iter().enumerate() {
                let effective = overrides.get(&(index, slot)).copied().unwrap_or(input);
                if let Some(owner) = effective.owner() {
                    dependents[owner.index()].push(index);
                    indegree[index] += 1;
                }
            }
        }
        let mut ready: Vec<usize> = (0..count).filter(|index| indegree[*index] == 0).collect();
        let mut settled = 0;
        while let Some(index) = ready.pop() {
            settled += 1;
            for &dependent in &dependents[index] {
                indegree[dependent] -= 1;
                if indegree[dependent] == 0 {
                    ready.push(dependent);
                }
            }
        }
        ensure!(
            settled == count,
            graph,
            "placeholder replacement would introduce a cycle"
        );
        Ok(())
    }

    pub(crate) fn set_rng_state(&mut self, id: NodeId, state: RngState) -> Result<()> {
        let node = self
            .nodes
            .get_mut(id.index())
            .ok_or_else(|| Error::graph(format!("node {id} is not registered in this arena")))?;
        ensure!(
            node.op.is_stateful(),
            argument,
            "node {} ({}) carries no random state",
            node.uid,
            node.op
        );
        node.rng_state = Some(state);
        Ok(())
    }
}

/// Central storage for the primitive nodes of one or more composites.
pub struct GraphArena {
    inner: Mutex<ArenaInner>,
    id: usize,
}

impl GraphArena {
    pub fn new() -> Arc<Self> {
        let id = ARENA_ID_COUNTER.fetch_add(1, AtomicOrdering::Relaxed);
        Arc::new(GraphArena {
            inner: Mutex::new(ArenaInner::new()),
            id,
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Increments on every node insertion and every applied placeholder edit.
    pub fn version(&self) -> u64 {
        self.lock().version
    }

    pub fn len(&self) -> usize {
        self.lock().nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, ArenaInner> {
        self.inner.lock().expect("graph arena poisoned")
    }

    /// Snapshot of a node.
    pub fn node(&self, id: NodeId) -> Result<PrimitiveFunction> {
        self.lock().get(id).cloned()
    }

    pub fn outputs(&self, id: NodeId) -> Result<Vec<Variable>> {
        Ok(self.lock().get(id)?.outputs.clone())
    }

    /// Records a primitive node and returns its id.
    pub fn create(
        &self,
        op: PrimitiveOp,
        inputs: &[Variable],
        attributes: Attributes,
        name: impl Into<String>,
    ) -> Result<NodeId> {
        let spec = NodeSpec::new(op, inputs.to_vec(), attributes, name.into());
        self.lock().insert(spec)
    }

    /// Records a single-output node and returns that output.
    pub fn apply(
        &self,
        op: PrimitiveOp,
        inputs: &[Variable],
        attributes: Attributes,
        name: impl Into<String>,
    ) -> Result<Variable> {
        let mut inner = self.lock();
        let id = inner.insert(NodeSpec::new(op, inputs.to_vec(), attributes, name.into()))?;
        let node = inner.get(id)?;
        ensure!(
            node.outputs.len() == 1,
            argument,
            "{} produces {} outputs; use create() for multi-output ops",
            op,
            node.outputs.len()
        );
        Ok(node.outputs[0].clone())
    }

    /// Encapsulates the graph rooted at `body_root` as a single block node.
    ///
    /// Every placeholder the body consumes must appear in `arguments`, paired with the
    /// outer variable it binds to. The block's inputs are those arguments, in order,
    /// followed by the body's remaining leaves (parameters, constants, inputs).
    pub fn as_block(
        &self,
        body_root: NodeId,
        arguments: &[(Variable, Variable)],
        op_name: impl Into<String>,
        name: impl Into<String>,
    ) -> Result<NodeId> {
        let spec = NodeSpec::new(PrimitiveOp::Block, Vec::new(), Attributes::new(), name.into());
        self.lock()
            .insert_block(body_root, arguments, op_name.into(), spec)
    }

    /// Substitutes placeholders across every node in the arena; returns the placeholders
    /// that were actually consumed somewhere. Nothing is written when validation fails.
    pub fn replace_placeholders(
        &self,
        replacements: &HashMap<Variable, Variable>,
    ) -> Result<HashSet<Variable>> {
        self.lock().replace_placeholders(replacements)
    }

    pub fn plus(&self, lhs: &Variable, rhs: &Variable) -> Result<Variable> {
        self.binary(PrimitiveOp::Plus, lhs, rhs)
    }

    pub fn minus(&self, lhs: &Variable, rhs: &Variable) -> Result<Variable> {
        self.binary(PrimitiveOp::Minus, lhs, rhs)
    }

    pub fn element_times(&self, lhs: &Variable, rhs: &Variable) -> Result<Variable> {
        self.binary(PrimitiveOp::ElementTimes, lhs, rhs)
    }

    pub fn times(&self, lhs: &Variable, rhs: &Variable) -> Result<Variable> {
        self.binary(PrimitiveOp::Times, lhs, rhs)
    }

    pub fn negate(&self, x: &Variable) -> Result<Variable> {
        self.unary(PrimitiveOp::Negate, x)
    }

    pub fn sigmoid(&self, x: &Variable) -> Result<Variable> {
        self.unary(PrimitiveOp::Sigmoid, x)
    }

    pub fn tanh(&self, x: &Variable) -> Result<Variable> {
        self.unary(PrimitiveOp::Tanh, x)
    }

    pub fn relu(&self, x: &Variable) -> Result<Variable> {
        self.unary(PrimitiveOp::ReLU, x)
    }

    pub fn exp(&self, x: &Variable) -> Result<Variable> {
        self.unary(PrimitiveOp::Exp, x)
    }

    pub fn log(&self, x: &Variable) -> Result<Variable> {
        self.unary(PrimitiveOp::Log, x)
    }

    pub fn reduce_sum(&self, x: &Variable) -> Result<Variable> {
        self.unary(PrimitiveOp::ReduceSum, x)
    }

    pub fn scale(&self, x: &Variable, factor: f64) -> Result<Variable> {
        let attributes = Attributes::new().with(ATTR_FACTOR, factor);
        self.apply(PrimitiveOp::Scale, &[x.clone()], attributes, "")
    }

    pub fn dropout(&self, x: &Variable, rate: f64, seed: u64) -> Result<Variable> {
        let attributes = Attributes::new()
            .with(ATTR_RATE, rate)
            .with(ATTR_SEED, seed as i64);
        self.apply(PrimitiveOp::Dropout, &[x.clone()], attributes, "")
    }

    pub fn split(&self, x: &Variable, parts: usize) -> Result<Vec<Variable>> {
        let attributes = Attributes::new().with(ATTR_PARTS, parts as i64);
        let id = self.create(PrimitiveOp::Split, &[x.clone()], attributes, "")?;
        self.outputs(id)
    }

    fn unary(&self, op: PrimitiveOp, x: &Variable) -> Result<Variable> {
        self.apply(op, &[x.clone()], Attributes::new(), "")
    }

    fn binary(&self, op: PrimitiveOp, lhs: &Variable, rhs: &Variable) -> Result<Variable> {
        self.apply(op, &[lhs.clone(), rhs.clone()], Attributes::new(), "")
    }
}

impl fmt::Debug for GraphArena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.lock();
        f.debug_struct("GraphArena")
            .field("id", &self.id)
            .field("nodes", &inner.nodes.len())
            .field("version", &inner.version)
            .finish()
    }
}
