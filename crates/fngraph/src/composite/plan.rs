//! Execution plans: a composite lowered to a flat, topologically ordered entry list.
//!
//! A plan is built for one [`PlanKey`]: the compute device plus the sets of outputs and
//! backprop roots it must be able to produce. Plans are reused for any request the key
//! covers and rebuilt otherwise. Block nodes are inlined: their bodies are lowered in a
//! child scope where body placeholders resolve to the block's input slots.
//!
//! Storage is laid out separately from the structure (see [`super::memory`]) so a plan
//! built without allocation can be allocated later without being rebuilt.

use std::collections::hash_map::Entry;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use smallvec::SmallVec;
use tracing::{debug, trace};

use crate::backend::{Backend, KernelContext};
use crate::device::DeviceDescriptor;
use crate::env;
use crate::error::{ensure, Error, Result};
use crate::graph::traversal::post_order_in;
use crate::graph::{
    ArenaInner, Attributes, NodeId, PrimitiveOp, RngState, Variable, VariableId, VariableKind,
};
use crate::tensor::{Shape, Tensor};

use super::memory::{plan_storage, StorageLayout};

static NEXT_TIMESTAMP: AtomicU64 = AtomicU64::new(1);

/// Process-wide evaluation clock; every entry evaluation takes a fresh tick.
pub(crate) fn next_timestamp() -> u64 {
    NEXT_TIMESTAMP.fetch_add(1, Ordering::Relaxed)
}

pub(crate) type SlotId = usize;
pub(crate) type EntryId = usize;

/// Identity of an execution plan: device plus requested output and root sets.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PlanKey {
    device: DeviceDescriptor,
    outputs: BTreeSet<VariableId>,
    roots: BTreeSet<VariableId>,
}

impl PlanKey {
    pub fn new<'a>(
        device: DeviceDescriptor,
        outputs: impl IntoIterator<Item = &'a Variable>,
        roots: impl IntoIterator<Item = &'a Variable>,
    ) -> Self {
        PlanKey {
            device,
            outputs: outputs.into_iter().map(Variable::id).collect(),
            roots: roots.into_iter().map(Variable::id).collect(),
        }
    }

    pub fn device(&self) -> DeviceDescriptor {
        self.device
    }

    pub fn outputs(&self) -> &BTreeSet<VariableId> {
        &self.outputs
    }

    pub fn roots(&self) -> &BTreeSet<VariableId> {
        &self.roots
    }

    /// True when a plan built for `self` can serve `requested` unchanged: same device,
    /// and the requested outputs and roots are subsets of the ones already planned.
    pub fn covers(&self, requested: &PlanKey) -> bool {
        self.device == requested.device
            && requested.outputs.is_subset(&self.outputs)
            && requested.roots.is_subset(&self.roots)
    }
}

impl fmt::Display for PlanKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} outputs={} roots={}",
            self.device,
            self.outputs.len(),
            self.roots.len()
        )
    }
}

/// Observability counters of a composite's plan cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlanStats {
    pub builds: u64,
    pub reuses: u64,
    pub allocations: u64,
    pub parameter_refreshes: u64,
}

/// Shape of the plan currently cached by a composite.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanSummary {
    pub key: PlanKey,
    pub generation: u64,
    pub rebuilt: bool,
    pub entries: usize,
    pub slots: usize,
    /// Distinct storage buffers, `None` until the plan is allocated.
    pub buffers: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SlotSource {
    Input,
    Parameter,
    Constant,
    Computed(EntryId),
}

#[derive(Debug, Clone)]
pub(crate) struct Slot {
    pub variable: Variable,
    pub shape: Shape,
    pub source: SlotSource,
}

#[derive(Debug, Clone)]
pub(crate) struct PlanEntry {
    pub node: NodeId,
    pub uid: String,
    pub op: PrimitiveOp,
    pub attributes: Attributes,
    pub inputs: SmallVec<[SlotId; 4]>,
    pub outputs: SmallVec<[SlotId; 2]>,
    pub output_shapes: Vec<Shape>,
    /// RNG position the next evaluation will use.
    pub rng: Option<RngState>,
    /// RNG position used by the last evaluation, replayed by backward.
    pub last_rng: Option<RngState>,
    pub timestamp: u64,
}

#[derive(Default)]
struct Scope {
    bound: HashMap<VariableId, SlotId>,
}

struct PlanBuilder<'a> {
    inner: &'a ArenaInner,
    slots: Vec<Slot>,
    entries: Vec<PlanEntry>,
    leaf_slots: HashMap<VariableId, SlotId>,
}

impl<'a> PlanBuilder<'a> {
    fn lower_graph(&mut self, roots: &[NodeId], scope: &mut Scope) -> Result<()> {
        for id in post_order_in(self.inner, roots)? {
            self.lower_node(id, scope)?;
        }
        Ok(())
    }

    fn lower_node(&mut self, id: NodeId, scope: &mut Scope) -> Result<()> {
        let inner = self.inner;
        let node = inner.get(id)?;
        let inputs = node
            .inputs
            .iter()
            .map(|input| self.resolve(input, scope))
            .collect::<Result<SmallVec<[SlotId; 4]>>>()?;

        if let Some(body) = &node.block {
            let mut child = Scope::default();
            for (placeholder, slot) in body.placeholders.iter().zip(inputs.iter()) {
                child.bound.insert(placeholder.id(), *slot);
            }
            self.lower_graph(&[body.root], &mut child)?;
            for (outer, inner_output) in node.outputs.iter().zip(body.outputs.iter()) {
                let slot = child.bound.get(&inner_output.id()).copied().ok_or_else(|| {
                    Error::graph(format!(
                        "block {} body output {} was not lowered",
                        node.uid, inner_output
                    ))
                })?;
                scope.bound.insert(outer.id(), slot);
            }
            return Ok(());
        }

        let entry_id = self.entries.len();
        let mut outputs = SmallVec::new();
        for output in &node.outputs {
            let slot = self.slots.len();
            self.slots.push(Slot {
                variable: output.clone(),
                shape: output.shape().clone(),
                source: SlotSource::Computed(entry_id),
            });
            scope.bound.insert(output.id(), slot);
            outputs.push(slot);
        }
        self.entries.push(PlanEntry {
            node: id,
            uid: node.uid.clone(),
            op: node.op,
            attributes: node.attributes.clone(),
            inputs,
            outputs,
            output_shapes: node.outputs.iter().map(|o| o.shape().clone()).collect(),
            rng: node.rng_state,
            last_rng: node.rng_state,
            timestamp: 0,
        });
        Ok(())
    }

    fn resolve(&mut self, variable: &Variable, scope: &Scope) -> Result<SlotId> {
        if let Some(slot) = scope.bound.get(&variable.id()) {
            return Ok(*slot);
        }
        let source = match variable.kind() {
            VariableKind::Input => SlotSource::Input,
            VariableKind::Parameter => SlotSource::Parameter,
            VariableKind::Constant => SlotSource::Constant,
            VariableKind::Placeholder => {
                return Err(Error::graph(format!(
                    "placeholder {variable} is unresolved; replace it before evaluation"
                )))
            }
            VariableKind::Output => {
                return Err(Error::graph(format!(
                    "output {variable} is consumed before its producer was lowered"
                )))
            }
        };
        let slots = &mut self.slots;
        let slot = *self.leaf_slots.entry(variable.id()).or_insert_with(|| {
            slots.push(Slot {
                variable: variable.clone(),
                shape: variable.shape().clone(),
                source,
            });
            slots.len() - 1
        });
        Ok(slot)
    }
}

pub(crate) struct ExecutionPlan {
    pub key: PlanKey,
    pub generation: u64,
    backend: Arc<dyn Backend>,
    pub slots: Vec<Slot>,
    /// Entries in evaluation order.
    pub entries: Vec<PlanEntry>,
    variable_slots: HashMap<VariableId, SlotId>,
    is_root: HashMap<VariableId, bool>,
    layout: Option<StorageLayout>,
    values: Vec<Option<Tensor>>,
    /// Per slot, the timestamp of the last store that changed its value.
    versions: Vec<u64>,
}

impl ExecutionPlan {
    /// Lowers the graph under `root`; every variable in `requested` must be computed by it.
    pub(crate) fn build(
        inner: &ArenaInner,
        root: NodeId,
        requested: &[Variable],
        key: PlanKey,
        backend: Arc<dyn Backend>,
        generation: u64,
    ) -> Result<Self> {
        let mut builder = PlanBuilder {
            inner,
            slots: Vec::new(),
            entries: Vec::new(),
            leaf_slots: HashMap::new(),
        };
        let mut scope = Scope::default();
        builder.lower_graph(&[root], &mut scope)?;

        for variable in requested {
            ensure!(
                variable.is_output() && scope.bound.contains_key(&variable.id()),
                graph,
                "{} is not computed by the graph under node {}",
                variable,
                root
            );
        }

        let PlanBuilder {
            slots,
            entries,
            leaf_slots,
            ..
        } = builder;
        let mut variable_slots = scope.bound;
        variable_slots.extend(leaf_slots);
        let is_root = variable_slots
            .keys()
            .map(|id| (*id, key.roots.contains(id)))
            .collect();

        debug!(
            key = %key,
            generation,
            entries = entries.len(),
            slots = slots.len(),
            backend = backend.backend_name(),
            "built execution plan"
        );
        let versions = vec![0; slots.len()];
        let plan = ExecutionPlan {
            key,
            generation,
            backend,
            versions,
            slots,
            entries,
            variable_slots,
            is_root,
            layout: None,
            values: Vec::new(),
        };
        if env::validate_plans() {
            plan.verify()?;
        }
        Ok(plan)
    }

    /// Checks that every entry only consumes leaves or slots produced earlier.
    pub(crate) fn verify(&self) -> Result<()> {
        for (index, entry) in self.entries.iter().enumerate() {
            for &slot in &entry.inputs {
                if let SlotSource::Computed(producer) = self.slots[slot].source {
                    ensure!(
                        producer < index,
                        graph,
                        "entry {} ({}) consumes slot {} before its producer {} runs",
                        index,
                        entry.uid,
                        slot,
                        producer
                    );
                }
            }
            for &slot in &entry.outputs {
                ensure!(
                    self.slots[slot].source == SlotSource::Computed(index),
                    graph,
                    "slot {} is not owned by entry {} ({})",
                    slot,
                    index,
                    entry.uid
                );
            }
        }
        Ok(())
    }

    pub(crate) fn lookup(&self, variable: &Variable) -> Option<SlotId> {
        self.variable_slots.get(&variable.id()).copied()
    }

    pub(crate) fn slot_of(&self, variable: &Variable) -> Result<SlotId> {
        self.lookup(variable)
            .ok_or_else(|| Error::graph(format!("{variable} has no slot in the execution plan")))
    }

    pub(crate) fn is_root(&self, variable: &Variable) -> bool {
        self.is_root.get(&variable.id()).copied().unwrap_or(false)
    }

    pub(crate) fn is_allocated(&self) -> bool {
        self.layout.is_some()
    }

    /// Timestamp of the last evaluation of the entry producing `variable`.
    pub(crate) fn timestamp_of(&self, variable: &Variable) -> Result<u64> {
        let slot = self.slot_of(variable)?;
        match self.slots[slot].source {
            SlotSource::Computed(entry) => Ok(self.entries[entry].timestamp),
            _ => Err(Error::graph(format!("{variable} is not computed by the plan"))),
        }
    }

    pub(crate) fn summary(&self, rebuilt: bool) -> PlanSummary {
        PlanSummary {
            key: self.key.clone(),
            generation: self.generation,
            rebuilt,
            entries: self.entries.len(),
            slots: self.slots.len(),
            buffers: self.layout.as_ref().map(|layout| layout.buffer_count),
        }
    }

    /// Entries needed to produce `targets`, in evaluation order.
    pub(crate) fn cone(&self, targets: impl IntoIterator<Item = SlotId>) -> Vec<EntryId> {
        let mut needed = vec![false; self.entries.len()];
        let mut stack: Vec<SlotId> = targets.into_iter().collect();
        while let Some(slot) = stack.pop() {
            if let SlotSource::Computed(entry) = self.slots[slot].source {
                if !needed[entry] {
                    needed[entry] = true;
                    stack.extend(self.entries[entry].inputs.iter().copied());
                }
            }
        }
        (0..self.entries.len()).filter(|index| needed[*index]).collect()
    }

    /// Lays out storage for the current key and materializes constants.
    pub(crate) fn allocate(&mut self) -> Result<()> {
        let mut pinned = BTreeSet::new();
        let mut root_slots = Vec::new();
        for (id, slot) in &self.variable_slots {
            if self.key.outputs.contains(id) {
                pinned.insert(*slot);
            }
            if self.key.roots.contains(id) {
                pinned.insert(*slot);
                root_slots.push(*slot);
            }
        }
        for entry in self.cone(root_slots) {
            let entry = &self.entries[entry];
            pinned.extend(entry.inputs.iter().copied());
            pinned.extend(entry.outputs.iter().copied());
        }

        let sharing = env::memory_sharing_enabled();
        let layout = plan_storage(&self.slots, &self.entries, pinned, sharing);
        let mut values = vec![None; layout.buffer_count];
        for (slot_id, slot) in self.slots.iter().enumerate() {
            if slot.source == SlotSource::Constant {
                let value = slot.variable.constant_value().ok_or_else(|| {
                    Error::graph(format!("constant {} carries no value", slot.variable))
                })?;
                values[layout.slot_buffers[slot_id]] = Some(value.to_device(self.key.device));
            }
        }
        debug!(
            buffers = layout.buffer_count,
            slots = self.slots.len(),
            pinned = layout.pinned.len(),
            sharing,
            "allocated plan storage"
        );
        self.values = values;
        self.layout = Some(layout);
        Ok(())
    }

    fn layout(&self) -> Result<&StorageLayout> {
        self.layout
            .as_ref()
            .ok_or_else(|| Error::graph("execution plan storage has not been allocated"))
    }

    pub(crate) fn value(&self, slot: SlotId) -> Result<Option<&Tensor>> {
        let layout = self.layout()?;
        Ok(self.values[layout.slot_buffers[slot]].as_ref())
    }

    /// Writes `value` into the slot. The slot version only moves when the content differs.
    pub(crate) fn store(&mut self, slot: SlotId, value: Tensor) -> Result<()> {
        let buffer = self.layout()?.slot_buffers[slot];
        if self.values[buffer].as_ref() != Some(&value) {
            self.versions[slot] = next_timestamp();
        }
        self.values[buffer] = Some(value);
        Ok(())
    }

    /// Versions of every slot read or written by the entries producing `roots`.
    pub(crate) fn cone_versions(&self, roots: &[SlotId]) -> Vec<(SlotId, u64)> {
        let mut slots = BTreeSet::new();
        for entry in self.cone(roots.iter().copied()) {
            let entry = &self.entries[entry];
            slots.extend(entry.inputs.iter().copied());
            slots.extend(entry.outputs.iter().copied());
        }
        slots
            .into_iter()
            .map(|slot| (slot, self.versions[slot]))
            .collect()
    }

    pub(crate) fn version(&self, slot: SlotId) -> u64 {
        self.versions[slot]
    }

    /// Slots of every parameter leaf in the plan.
    pub(crate) fn parameter_slots(&self) -> Vec<(SlotId, Variable)> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.source == SlotSource::Parameter)
            .map(|(id, slot)| (id, slot.variable.clone()))
            .collect()
    }

    fn values_of(&self, slots: &[SlotId], entry: &PlanEntry) -> Result<Vec<&Tensor>> {
        let layout = self.layout()?;
        slots
            .iter()
            .map(|slot| {
                self.values[layout.slot_buffers[*slot]].as_ref().ok_or_else(|| {
                    Error::graph(format!(
                        "{} needed by node {} has no value",
                        self.slots[*slot].variable, entry.uid
                    ))
                })
            })
            .collect()
    }

    fn context<'e>(&self, entry: &'e PlanEntry, rng: Option<RngState>) -> KernelContext<'e> {
        KernelContext {
            op: entry.op,
            node_uid: &entry.uid,
            attributes: &entry.attributes,
            output_shapes: &entry.output_shapes,
            rng,
            device: self.key.device,
        }
    }

    /// Runs one entry through the backend and stamps it.
    pub(crate) fn evaluate(&mut self, entry_id: EntryId) -> Result<()> {
        let results = {
            let entry = &self.entries[entry_id];
            let inputs = self.values_of(&entry.inputs, entry)?;
            let ctx = self.context(entry, entry.rng);
            let results = self.backend.forward(&ctx, &inputs)?;
            ensure!(
                results.len() == entry.outputs.len(),
                graph,
                "backend {} returned {} outputs for node {} ({}), expected {}",
                self.backend.backend_name(),
                results.len(),
                entry.uid,
                entry.op,
                entry.outputs.len()
            );
            for (result, shape) in results.iter().zip(entry.output_shapes.iter()) {
                ensure!(
                    result.shape() == shape,
                    graph,
                    "backend produced shape {} for node {} ({}), expected {}",
                    result.shape(),
                    entry.uid,
                    entry.op,
                    shape
                );
            }
            results
        };

        let stateful = self.entries[entry_id].rng.is_some();
        let outputs = self.entries[entry_id].outputs.clone();
        let layout = self.layout()?;
        let buffers: SmallVec<[usize; 2]> =
            outputs.iter().map(|slot| layout.slot_buffers[*slot]).collect();
        let timestamp = next_timestamp();
        for ((slot, buffer), value) in outputs.into_iter().zip(buffers).zip(results) {
            // A stateful entry drew a new mask even when its values match.
            if stateful || self.values[buffer].as_ref() != Some(&value) {
                self.versions[slot] = timestamp;
            }
            self.values[buffer] = Some(value);
        }

        let entry = &mut self.entries[entry_id];
        entry.timestamp = timestamp;
        entry.last_rng = entry.rng;
        if let Some(rng) = entry.rng.as_mut() {
            rng.offset += 1;
        }
        trace!(node = %entry.uid, op = %entry.op, timestamp = entry.timestamp, "evaluated entry");
        Ok(())
    }

    /// Reverse pass over the entries that produce `roots`, seeded with `seeds`.
    /// Returns the accumulated gradient of every slot that received flow.
    pub(crate) fn backpropagate(
        &self,
        roots: &[SlotId],
        seeds: Vec<(SlotId, Tensor)>,
    ) -> Result<HashMap<SlotId, Tensor>> {
        let mut gradients: HashMap<SlotId, Tensor> = HashMap::new();
        for (slot, seed) in seeds {
            accumulate(&mut gradients, slot, seed)?;
        }

        for entry_id in self.cone(roots.iter().copied()).into_iter().rev() {
            let entry = &self.entries[entry_id];
            let contributions = {
                let output_gradients: Vec<Option<&Tensor>> = entry
                    .outputs
                    .iter()
                    .map(|slot| gradients.get(slot))
                    .collect();
                if output_gradients.iter().all(Option::is_none) {
                    continue;
                }
                let inputs = self.values_of(&entry.inputs, entry)?;
                let outputs = self.values_of(&entry.outputs, entry)?;
                let ctx = self.context(entry, entry.last_rng);
                self.backend
                    .backward(&ctx, &inputs, &outputs, &output_gradients)?
            };
            ensure!(
                contributions.len() == entry.inputs.len(),
                graph,
                "backend {} returned {} input gradients for node {} ({}), expected {}",
                self.backend.backend_name(),
                contributions.len(),
                entry.uid,
                entry.op,
                entry.inputs.len()
            );
            for (&slot, contribution) in entry.inputs.iter().zip(contributions) {
                let Some(contribution) = contribution else {
                    continue;
                };
                if self.slots[slot].source == SlotSource::Constant {
                    continue;
                }
                ensure!(
                    contribution.shape() == &self.slots[slot].shape,
                    graph,
                    "gradient for {} from node {} has shape {}, expected {}",
                    self.slots[slot].variable,
                    entry.uid,
                    contribution.shape(),
                    self.slots[slot].shape
                );
                accumulate(&mut gradients, slot, contribution)?;
            }
        }
        Ok(gradients)
    }
}

fn accumulate(gradients: &mut HashMap<SlotId, Tensor>, slot: SlotId, value: Tensor) -> Result<()> {
    match gradients.entry(slot) {
        Entry::Occupied(mut existing) => existing.get_mut().accumulate(&value),
        Entry::Vacant(vacant) => {
            vacant.insert(value);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::GraphArena;

    #[test]
    fn covers_requires_same_device_and_subsets() {
        let a = Variable::input([1], "a");
        let b = Variable::input([1], "b");
        let cpu = DeviceDescriptor::cpu();
        let cached = PlanKey::new(cpu, [&a, &b], [&a]);

        assert!(cached.covers(&PlanKey::new(cpu, [&a], [&a])));
        assert!(cached.covers(&PlanKey::new(cpu, [&b], [])));
        assert!(cached.covers(&cached.clone()));
        assert!(!cached.covers(&PlanKey::new(cpu, [&a], [&b])));
        assert!(!cached.covers(&PlanKey::new(DeviceDescriptor::gpu(0), [&a], [&a])));
    }

    struct NullBackend;

    impl Backend for NullBackend {
        fn backend_name(&self) -> &str {
            "null"
        }

        fn forward(
            &self,
            ctx: &KernelContext<'_>,
            _inputs: &[&Tensor],
        ) -> crate::backend::BackendResult<Vec<Tensor>> {
            Ok(ctx
                .output_shapes
                .iter()
                .map(|shape| Tensor::zeros(shape.clone(), ctx.device))
                .collect())
        }

        fn backward(
            &self,
            _ctx: &KernelContext<'_>,
            inputs: &[&Tensor],
            _outputs: &[&Tensor],
            _output_gradients: &[Option<&Tensor>],
        ) -> crate::backend::BackendResult<Vec<Option<Tensor>>> {
            Ok(vec![None; inputs.len()])
        }
    }

    fn build(
        arena: &GraphArena,
        root: NodeId,
        requested: &[Variable],
    ) -> Result<ExecutionPlan> {
        let key = PlanKey::new(DeviceDescriptor::cpu(), requested, []);
        let inner = arena.lock();
        ExecutionPlan::build(&inner, root, requested, key, Arc::new(NullBackend), 1)
    }

    #[test]
    fn entries_are_topologically_ordered() {
        let arena = GraphArena::new();
        let x = Variable::input([2], "x");
        let a = arena.negate(&x).unwrap();
        let b = arena.exp(&a).unwrap();
        let out = arena.plus(&a, &b).unwrap();
        let plan = build(&arena, out.owner().unwrap(), &[out.clone()]).unwrap();
        plan.verify().unwrap();
        let ops: Vec<PrimitiveOp> = plan.entries.iter().map(|entry| entry.op).collect();
        assert_eq!(
            ops,
            vec![PrimitiveOp::Negate, PrimitiveOp::Exp, PrimitiveOp::Plus]
        );
        assert_eq!(plan.cone([plan.slot_of(&a).unwrap()]), vec![0]);
    }

    #[test]
    fn unresolved_placeholder_fails() {
        let arena = GraphArena::new();
        let p = Variable::placeholder([2], "p");
        let out = arena.negate(&p).unwrap();
        let err = build(&arena, out.owner().unwrap(), &[out.clone()])
            .err()
            .unwrap();
        assert_eq!(err.kind(), crate::ErrorKind::GraphInconsistency);
    }

    #[test]
    fn unreachable_request_fails() {
        let arena = GraphArena::new();
        let x = Variable::input([2], "x");
        let out = arena.negate(&x).unwrap();
        let other = arena.exp(&x).unwrap();
        let err = build(&arena, out.owner().unwrap(), &[other]).err().unwrap();
        assert_eq!(err.kind(), crate::ErrorKind::GraphInconsistency);
    }

    #[test]
    fn blocks_are_inlined() {
        let arena = GraphArena::new();
        let p = Variable::placeholder([2], "p");
        let body = arena.sigmoid(&arena.negate(&p).unwrap()).unwrap();
        let x = Variable::input([2], "x");
        let block = arena
            .as_block(body.owner().unwrap(), &[(p, x.clone())], "NegSig", "ns")
            .unwrap();
        let block_out = arena.outputs(block).unwrap()[0].clone();
        let out = arena.exp(&block_out).unwrap();
        let plan = build(&arena, out.owner().unwrap(), &[out, block_out.clone()]).unwrap();
        let ops: Vec<PrimitiveOp> = plan.entries.iter().map(|entry| entry.op).collect();
        assert_eq!(
            ops,
            vec![PrimitiveOp::Negate, PrimitiveOp::Sigmoid, PrimitiveOp::Exp]
        );
        assert_eq!(plan.slot_of(&block_out).unwrap(), plan.entries[1].outputs[0]);
        assert!(plan.slot_of(&body).is_err());
        assert_eq!(plan.entries[0].inputs[0], plan.slot_of(&x).unwrap());
    }

    #[test]
    fn allocation_pins_requested_outputs() {
        let arena = GraphArena::new();
        let x = Variable::input([4], "x");
        let a = arena.negate(&x).unwrap();
        let b = arena.negate(&a).unwrap();
        let c = arena.negate(&b).unwrap();
        let mut plan = build(&arena, c.owner().unwrap(), &[c.clone()]).unwrap();
        assert!(!plan.is_allocated());
        plan.allocate().unwrap();
        let layout = plan.layout().unwrap();
        assert!(layout.pinned.contains(&plan.slot_of(&c).unwrap()));
        for entry in 0..plan.entries.len() {
            plan.evaluate(entry).unwrap();
        }
        assert!(plan.value(plan.slot_of(&c).unwrap()).unwrap().is_some());
        assert!(plan.entries.iter().all(|entry| entry.timestamp > 0));
    }
}
