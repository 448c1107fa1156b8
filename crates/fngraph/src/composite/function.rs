//! Composite functions: a root node, the closure of nodes it reaches, and the cached
//! execution plan that evaluates them.
//!
//! A composite does not own its nodes; they live in a shared [`GraphArena`]. What it owns
//! is the view of that graph seen from its root (the closure and the leaf inputs) and
//! the mutable execution state: the plan, the per-output argument dependencies, and the
//! parameter timestamps last copied into the plan.
//!
//! ## Plan reuse
//!
//! Every forward pass asks for a plan keyed by device, requested outputs and retained
//! backprop roots. A cached plan whose key covers the request is reused as is; otherwise
//! a new plan is built for exactly the requested sets. Placeholder replacement drops the
//! plan, and any [`BackpropState`] recorded against it becomes stale. Replacements made
//! through another composite over the same arena are picked up on the next call that
//! looks at the graph.
//!
//! ## Locking
//!
//! Execution state, graph view and arena are always locked in that order. Forward and
//! backward hold the execution lock for their whole duration, so a single composite runs
//! one pass at a time; distinct composites run concurrently.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::{debug, instrument, trace, warn};

use crate::backend::registry;
use crate::device::DeviceDescriptor;
use crate::error::{ensure, Error, Result};
use crate::graph::traversal::{collect_in, determine_inputs_in, expand_blocks_in, traverse_in};
use crate::graph::{next_auto_generated_uid, GraphArena, NodeId, Parameter, RngState, Variable};
use crate::tensor::Tensor;

use super::plan::{ExecutionPlan, PlanKey, PlanStats, PlanSummary, SlotId};
use super::state::BackpropState;

struct GraphView {
    closure: HashSet<NodeId>,
    inputs: Vec<Variable>,
    /// Arena version the closure and inputs were derived at.
    arena_version: u64,
}

#[derive(Default)]
struct ExecutionState {
    plan: Option<ExecutionPlan>,
    generation: u64,
    /// Leaf dependencies per variable; filtered to input kind for argument queries.
    dependencies: HashMap<Variable, Vec<Variable>>,
    /// Parameter timestamps as of their last copy into the plan.
    parameter_timestamps: HashMap<Variable, u64>,
    stats: PlanStats,
}

impl ExecutionState {
    fn invalidate(&mut self) {
        self.plan = None;
        self.dependencies.clear();
        self.parameter_timestamps.clear();
    }
}

pub struct CompositeFunction {
    arena: Arc<GraphArena>,
    root: NodeId,
    outputs: Vec<Variable>,
    name: String,
    uid: String,
    graph: RwLock<GraphView>,
    execution: Mutex<ExecutionState>,
}

impl CompositeFunction {
    /// Wraps the graph reachable from `root`. An empty `uid` is replaced by a generated one.
    pub fn create(
        arena: &Arc<GraphArena>,
        root: NodeId,
        name: impl Into<String>,
        uid: impl Into<String>,
    ) -> Result<Arc<Self>> {
        let (outputs, view) = {
            let inner = arena.lock();
            let node = inner.get(root).map_err(|_| {
                Error::graph(format!(
                    "cannot create a composite function: root node {root} is not registered in arena {}",
                    arena.id()
                ))
            })?;
            let outputs = node.outputs.clone();
            let view = GraphView {
                closure: collect_in(&inner, root)?,
                inputs: determine_inputs_in(&inner, root)?,
                arena_version: inner.version,
            };
            (outputs, view)
        };
        let uid = uid.into();
        let uid = if uid.is_empty() {
            next_auto_generated_uid("CompositeFunction")
        } else {
            uid
        };
        debug!(
            function = %uid,
            nodes = view.closure.len(),
            inputs = view.inputs.len(),
            "created composite function"
        );
        Ok(Arc::new(CompositeFunction {
            arena: Arc::clone(arena),
            root,
            outputs,
            name: name.into(),
            uid,
            graph: RwLock::new(view),
            execution: Mutex::new(ExecutionState::default()),
        }))
    }

    pub fn arena(&self) -> &Arc<GraphArena> {
        &self.arena
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn uid(&self) -> &str {
        &self.uid
    }

    /// Outputs of the root node.
    pub fn outputs(&self) -> &[Variable] {
        &self.outputs
    }

    /// First output of the root node.
    pub fn output(&self) -> &Variable {
        &self.outputs[0]
    }

    /// Re-derives the closure and inputs if the arena changed since they were last
    /// computed, surfacing any failure.
    ///
    /// The graph accessors below refresh the same way but cannot fail: when the refresh
    /// errors they log a warning and answer from the last consistent view.
    pub fn refresh(&self) -> Result<()> {
        let mut execution = self.lock_execution();
        self.sync_with_arena(&mut execution)
    }

    /// Leaf variables of the graph, in first-discovery order. May be stale, see
    /// [`CompositeFunction::refresh`].
    pub fn inputs(&self) -> Vec<Variable> {
        self.view().inputs.clone()
    }

    pub fn arguments(&self) -> Vec<Variable> {
        self.filter_inputs(Variable::is_input)
    }

    pub fn placeholders(&self) -> Vec<Variable> {
        self.filter_inputs(Variable::is_placeholder)
    }

    pub fn constants(&self) -> Vec<Variable> {
        self.filter_inputs(Variable::is_constant)
    }

    pub fn parameters(&self) -> Vec<Parameter> {
        self.view()
            .inputs
            .iter()
            .filter_map(Variable::as_parameter)
            .collect()
    }

    /// Nodes in the closure. May be stale, see [`CompositeFunction::refresh`].
    pub fn primitive_function_count(&self) -> usize {
        self.view().closure.len()
    }

    /// Node ids of the closure, ascending.
    pub fn primitive_functions(&self) -> Vec<NodeId> {
        let mut nodes: Vec<NodeId> = self.view().closure.iter().copied().collect();
        nodes.sort();
        nodes
    }

    pub fn contains(&self, node: NodeId) -> bool {
        self.view().closure.contains(&node)
    }

    pub fn plan_stats(&self) -> PlanStats {
        self.lock_execution().stats
    }

    /// Summary of the cached plan, if any.
    pub fn plan_summary(&self) -> Option<PlanSummary> {
        self.lock_execution()
            .plan
            .as_ref()
            .map(|plan| plan.summary(false))
    }

    /// Input-kind leaves that `output` depends on, in first-discovery order. Memoized
    /// until the next placeholder replacement.
    pub fn argument_dependencies(&self, output: &Variable) -> Result<Vec<Variable>> {
        let mut execution = self.lock_execution();
        self.sync_with_arena(&mut execution)?;
        Ok(self
            .leaf_dependencies(&mut execution, output)?
            .into_iter()
            .filter(Variable::is_input)
            .collect())
    }

    /// Substitutes placeholders of this function's graph.
    ///
    /// The edit is applied to the shared arena, so every composite over the same nodes
    /// observes it. The closure grows by whatever the replacements reach. Fails without
    /// writing anything when any replacement is invalid.
    pub fn replace_placeholders(&self, replacements: &HashMap<Variable, Variable>) -> Result<()> {
        let mut execution = self.lock_execution();
        self.sync_with_arena(&mut execution)?;
        let mut view = self.write_graph();
        for placeholder in replacements.keys() {
            let chained = replacements.values().any(|value| value == placeholder);
            ensure!(
                view.inputs.contains(placeholder) || chained,
                argument,
                "{} is not a placeholder input of {}",
                placeholder,
                self.uid
            );
        }
        let replaced = self.arena.replace_placeholders(replacements)?;
        self.on_placeholders_replaced(&mut view, replacements, &replaced)?;
        execution.invalidate();
        debug!(
            function = %self.uid,
            replaced = replaced.len(),
            nodes = view.closure.len(),
            "placeholders replaced"
        );
        Ok(())
    }

    fn on_placeholders_replaced(
        &self,
        view: &mut GraphView,
        replacements: &HashMap<Variable, Variable>,
        replaced: &HashSet<Variable>,
    ) -> Result<()> {
        let inner = self.arena.lock();
        for placeholder in replaced {
            let Some(mut target) = replacements.get(placeholder) else {
                continue;
            };
            while target.is_placeholder() {
                match replacements.get(target) {
                    Some(next) => target = next,
                    None => break,
                }
            }
            if let Some(owner) = target.owner() {
                traverse_in(&inner, owner, &mut view.closure, |_| {})?;
            }
        }
        view.inputs = determine_inputs_in(&inner, self.root)?;
        view.arena_version = inner.version;
        Ok(())
    }

    /// Re-derives the closure and inputs when the arena changed since they were last
    /// computed, dropping the plan if the reachable graph differs.
    fn sync_with_arena(&self, execution: &mut ExecutionState) -> Result<()> {
        let mut view = self.write_graph();
        let inner = self.arena.lock();
        if inner.version == view.arena_version {
            return Ok(());
        }
        let closure = collect_in(&inner, self.root)?;
        let inputs = determine_inputs_in(&inner, self.root)?;
        view.arena_version = inner.version;
        if closure != view.closure || inputs != view.inputs {
            view.closure = closure;
            view.inputs = inputs;
            execution.invalidate();
            debug!(
                function = %self.uid,
                nodes = view.closure.len(),
                "graph was edited through the shared arena"
            );
        }
        Ok(())
    }

    /// Builds (or reuses) the execution plan for the requested outputs and roots on
    /// `device`, allocating storage when `allocate` is set.
    pub fn prepare_plan(
        &self,
        device: DeviceDescriptor,
        outputs: &HashSet<Variable>,
        roots: &HashSet<Variable>,
        allocate: bool,
    ) -> Result<PlanSummary> {
        let mut execution = self.lock_execution();
        self.sync_with_arena(&mut execution)?;
        self.ensure_plan(&mut execution, device, outputs, roots, allocate)
    }

    fn ensure_plan(
        &self,
        execution: &mut ExecutionState,
        device: DeviceDescriptor,
        outputs: &HashSet<Variable>,
        roots: &HashSet<Variable>,
        allocate: bool,
    ) -> Result<PlanSummary> {
        let requested_key = PlanKey::new(device, outputs, roots);
        let reusable = execution
            .plan
            .as_ref()
            .is_some_and(|plan| plan.key.covers(&requested_key));

        if reusable {
            execution.stats.reuses += 1;
            trace!(function = %self.uid, key = %requested_key, "reusing execution plan");
        } else {
            let backend = registry::backend_for(&device).ok_or_else(|| {
                Error::device(format!("no backend registered for device {device}"))
            })?;
            let mut requested: Vec<Variable> = outputs.iter().chain(roots.iter()).cloned().collect();
            requested.sort_by_key(Variable::id);
            requested.dedup();
            {
                let view = self.read_graph();
                for variable in &requested {
                    let reachable = variable
                        .owner()
                        .is_some_and(|owner| view.closure.contains(&owner));
                    ensure!(
                        reachable,
                        graph,
                        "{} is not reachable from the root of {}",
                        variable,
                        self.uid
                    );
                }
            }
            let generation = execution.generation + 1;
            let plan = {
                let inner = self.arena.lock();
                ExecutionPlan::build(
                    &inner,
                    self.root,
                    &requested,
                    requested_key,
                    backend,
                    generation,
                )?
            };
            execution.generation = generation;
            execution.plan = Some(plan);
            execution.parameter_timestamps.clear();
            execution.stats.builds += 1;
        }

        let plan = execution
            .plan
            .as_mut()
            .ok_or_else(|| Error::graph("execution plan missing after preparation"))?;
        if allocate && !plan.is_allocated() {
            plan.allocate()?;
            execution.stats.allocations += 1;
        }
        Ok(plan.summary(!reusable))
    }

    fn leaf_dependencies(
        &self,
        execution: &mut ExecutionState,
        variable: &Variable,
    ) -> Result<Vec<Variable>> {
        if let Some(dependencies) = execution.dependencies.get(variable) {
            return Ok(dependencies.clone());
        }
        let dependencies = match variable.owner() {
            None => vec![variable.clone()],
            Some(owner) => {
                ensure!(
                    self.read_graph().closure.contains(&owner),
                    graph,
                    "{} is not reachable from the root of {}",
                    variable,
                    self.uid
                );
                determine_inputs_in(&self.arena.lock(), owner)?
            }
        };
        execution
            .dependencies
            .insert(variable.clone(), dependencies.clone());
        Ok(dependencies)
    }

    fn validate_arguments(
        &self,
        arguments: &HashMap<Variable, Tensor>,
        device: DeviceDescriptor,
    ) -> Result<()> {
        let view = self.read_graph();
        for (variable, value) in arguments {
            ensure!(
                variable.is_input() && view.inputs.contains(variable),
                argument,
                "{} is not an input argument of {}",
                variable,
                self.uid
            );
            ensure!(
                value.shape() == variable.shape(),
                argument,
                "value for {} has shape {}, expected {}",
                variable,
                value.shape(),
                variable.shape()
            );
            ensure!(
                value.device() == device,
                device,
                "value for {} lives on {}, but {} is evaluated on {}",
                variable,
                value.device(),
                self.uid,
                device
            );
        }
        Ok(())
    }

    /// Evaluates the requested outputs.
    ///
    /// `outputs` keys name the variables to produce; `Some` buffers are overwritten in
    /// place, `None` entries receive fresh tensors. Variables in `retain` become backprop
    /// roots of the returned state.
    #[instrument(skip_all, fields(function = %self.uid, device = %device))]
    pub fn forward(
        self: &Arc<Self>,
        arguments: &HashMap<Variable, Tensor>,
        outputs: &mut HashMap<Variable, Option<Tensor>>,
        device: DeviceDescriptor,
        retain: &HashSet<Variable>,
    ) -> Result<BackpropState> {
        let mut execution = self.lock_execution();
        self.sync_with_arena(&mut execution)?;
        let requested_outputs: HashSet<Variable> = outputs.keys().cloned().collect();
        self.ensure_plan(&mut execution, device, &requested_outputs, retain, true)?;

        let mut requested: Vec<Variable> =
            requested_outputs.iter().chain(retain.iter()).cloned().collect();
        requested.sort_by_key(Variable::id);
        requested.dedup();
        let mut retained: Vec<&Variable> = retain.iter().collect();
        retained.sort_by_key(|root| root.id());

        let mut required = Vec::new();
        let mut seen = HashSet::new();
        for variable in &requested {
            for dependency in self.leaf_dependencies(&mut execution, variable)? {
                if dependency.is_input() && seen.insert(dependency.id()) {
                    required.push(dependency);
                }
            }
        }
        let mut root_parameters = Vec::new();
        let mut seen = HashSet::new();
        for root in retained {
            for dependency in self.leaf_dependencies(&mut execution, root)? {
                if dependency.is_parameter() && seen.insert(dependency.id()) {
                    root_parameters.push(dependency);
                }
            }
        }

        self.validate_arguments(arguments, device)?;
        for variable in &required {
            ensure!(
                arguments.contains_key(variable),
                argument,
                "missing value for argument {} of {}",
                variable,
                self.uid
            );
        }

        let ExecutionState {
            plan,
            parameter_timestamps,
            stats,
            ..
        } = &mut *execution;
        let plan = plan
            .as_mut()
            .ok_or_else(|| Error::graph("execution plan missing after preparation"))?;

        for (variable, value) in arguments {
            if let Some(slot) = plan.lookup(variable) {
                plan.store(slot, value.clone())?;
            }
        }

        for (slot, variable) in plan.parameter_slots() {
            let parameter = variable
                .as_parameter()
                .ok_or_else(|| Error::graph(format!("{variable} carries no parameter storage")))?;
            let timestamp = parameter.timestamp();
            if parameter_timestamps.get(&variable) == Some(&timestamp) && plan.value(slot)?.is_some()
            {
                continue;
            }
            plan.store(slot, parameter.with_value(|value| value.to_device(device)))?;
            trace!(parameter = %variable, timestamp, "refreshed parameter slot");
            parameter_timestamps.insert(variable, timestamp);
            stats.parameter_refreshes += 1;
        }

        let targets = requested
            .iter()
            .map(|variable| plan.slot_of(variable))
            .collect::<Result<Vec<SlotId>>>()?;
        let order = plan.cone(targets);
        for &entry in &order {
            plan.evaluate(entry)?;
        }

        for (variable, destination) in outputs.iter_mut() {
            let slot = plan.slot_of(variable)?;
            let value = plan
                .value(slot)?
                .ok_or_else(|| Error::graph(format!("output {variable} was not produced")))?;
            match destination {
                Some(buffer) => {
                    ensure!(
                        buffer.device() == device,
                        device,
                        "output buffer for {} lives on {}, expected {}",
                        variable,
                        buffer.device(),
                        device
                    );
                    buffer.copy_from(value)?;
                }
                None => *destination = Some(value.clone()),
            }
        }

        let mut root_timestamps = HashMap::with_capacity(retain.len());
        let mut root_slots = Vec::with_capacity(retain.len());
        for root in retain {
            root_timestamps.insert(root.clone(), plan.timestamp_of(root)?);
            root_slots.push(plan.slot_of(root)?);
        }
        let slot_versions = plan.cone_versions(&root_slots);
        let parameter_snapshot = root_parameters
            .into_iter()
            .map(|parameter| {
                let timestamp = parameter_timestamps.get(&parameter).copied().unwrap_or(0);
                (parameter, timestamp)
            })
            .collect();

        self.update_internal_state(plan)?;
        debug!(evaluated = order.len(), retained = retain.len(), "forward pass complete");
        Ok(BackpropState {
            function: Arc::clone(self),
            device,
            generation: plan.generation,
            root_timestamps,
            parameter_timestamps: parameter_snapshot,
            slot_versions,
        })
    }

    /// Propagates `root_gradients` back from the roots retained by `state`.
    ///
    /// `input_gradients` keys name the inputs and parameters to differentiate with
    /// respect to; `Some` buffers are overwritten in place, `None` entries receive fresh
    /// tensors. Leaves that receive no flow get zeros.
    #[instrument(skip_all, fields(function = %self.uid))]
    pub fn backward(
        &self,
        state: &BackpropState,
        root_gradients: &HashMap<Variable, Tensor>,
        input_gradients: &mut HashMap<Variable, Option<Tensor>>,
    ) -> Result<()> {
        ensure!(
            std::ptr::eq(Arc::as_ptr(&state.function), self),
            stale,
            "backprop state was produced by {}, not {}",
            state.function.uid(),
            self.uid
        );
        let mut execution = self.lock_execution();
        self.sync_with_arena(&mut execution)?;

        let mut roots: Vec<Variable> = state.root_timestamps.keys().cloned().collect();
        roots.sort_by_key(Variable::id);
        let mut reachable = HashSet::new();
        for root in &roots {
            reachable.extend(self.leaf_dependencies(&mut execution, root)?);
        }

        let plan = execution.plan.as_ref().ok_or_else(|| {
            Error::stale(format!(
                "{} has no execution plan; its graph changed after the forward pass",
                self.uid
            ))
        })?;
        ensure!(
            plan.generation == state.generation,
            stale,
            "the execution plan of {} was rebuilt after the forward pass",
            self.uid
        );
        ensure!(
            plan.key.device() == state.device,
            stale,
            "the execution plan of {} targets {}, the state was recorded on {}",
            self.uid,
            plan.key.device(),
            state.device
        );
        for root in &roots {
            let recorded = state.root_timestamps.get(root).copied().unwrap_or(0);
            ensure!(
                plan.timestamp_of(root)? == recorded,
                stale,
                "root {} was re-evaluated after the forward pass that produced this state",
                root
            );
        }
        for &(slot, recorded) in &state.slot_versions {
            ensure!(
                plan.version(slot) == recorded,
                stale,
                "{} changed after the forward pass that produced this state",
                plan.slots[slot].variable
            );
        }
        for (variable, recorded) in &state.parameter_timestamps {
            let parameter = variable
                .as_parameter()
                .ok_or_else(|| Error::graph(format!("{variable} carries no parameter storage")))?;
            ensure!(
                parameter.timestamp() == *recorded,
                stale,
                "parameter {} was modified after the forward pass",
                variable
            );
        }

        for (root, gradient) in root_gradients {
            ensure!(
                state.root_timestamps.contains_key(root) && plan.is_root(root),
                argument,
                "{} is not a retained backprop root of this state",
                root
            );
            ensure!(
                gradient.shape() == root.shape(),
                argument,
                "gradient for root {} has shape {}, expected {}",
                root,
                gradient.shape(),
                root.shape()
            );
            ensure!(
                gradient.device() == state.device,
                device,
                "gradient for root {} lives on {}, expected {}",
                root,
                gradient.device(),
                state.device
            );
        }
        for (variable, destination) in input_gradients.iter() {
            ensure!(
                (variable.is_input() || variable.is_parameter()) && reachable.contains(variable),
                argument,
                "cannot compute a gradient for {}: not an input or parameter the retained roots depend on",
                variable
            );
            if let Some(buffer) = destination {
                ensure!(
                    buffer.device() == state.device,
                    device,
                    "gradient buffer for {} lives on {}, expected {}",
                    variable,
                    buffer.device(),
                    state.device
                );
            }
        }

        let root_slots = roots
            .iter()
            .map(|root| plan.slot_of(root))
            .collect::<Result<Vec<SlotId>>>()?;
        let seeds = root_gradients
            .iter()
            .map(|(root, gradient)| Ok((plan.slot_of(root)?, gradient.clone())))
            .collect::<Result<Vec<_>>>()?;
        let gradients = plan.backpropagate(&root_slots, seeds)?;

        for (variable, destination) in input_gradients.iter_mut() {
            let slot = plan.slot_of(variable)?;
            let gradient = gradients
                .get(&slot)
                .cloned()
                .unwrap_or_else(|| Tensor::zeros(variable.shape().clone(), state.device));
            match destination {
                Some(buffer) => buffer.copy_from(&gradient)?,
                None => *destination = Some(gradient),
            }
        }
        debug!(
            roots = roots.len(),
            gradients = input_gradients.len(),
            "backward pass complete"
        );
        Ok(())
    }

    /// Writes the RNG positions of stateful entries back into their graph nodes, so
    /// serialization and rebuilt plans continue the random stream where it stopped.
    fn update_internal_state(&self, plan: &ExecutionPlan) -> Result<()> {
        let stateful: Vec<(NodeId, RngState)> = plan
            .entries
            .iter()
            .filter_map(|entry| entry.rng.map(|rng| (entry.node, rng)))
            .collect();
        if stateful.is_empty() {
            return Ok(());
        }
        let mut inner = self.arena.lock();
        for (node, state) in stateful {
            inner.set_rng_state(node, state)?;
        }
        Ok(())
    }

    /// Copies parameter values and stateful-node RNG positions from `source`, matched by
    /// uid. Every parameter and stateful node of this function needs a counterpart.
    pub fn copy_state(&self, source: &CompositeFunction) -> Result<()> {
        let source_parameters: HashMap<String, Parameter> = source
            .parameters()
            .into_iter()
            .map(|parameter| (parameter.uid().to_string(), parameter))
            .collect();
        let mut values = Vec::new();
        for parameter in self.parameters() {
            let from = source_parameters.get(parameter.uid()).ok_or_else(|| {
                Error::argument(format!(
                    "parameter {} of {} has no counterpart in {}",
                    parameter.variable(),
                    self.uid,
                    source.uid
                ))
            })?;
            ensure!(
                from.shape() == parameter.shape(),
                argument,
                "parameter {} has shape {} in {}, {} in {}",
                parameter.variable(),
                from.shape(),
                source.uid,
                parameter.shape(),
                self.uid
            );
            values.push((parameter, from.value()));
        }

        let source_states: HashMap<String, RngState> = source
            .stateful_nodes()?
            .into_iter()
            .map(|(_, uid, state)| (uid, state))
            .collect();
        let mut states = Vec::new();
        for (node, uid, _) in self.stateful_nodes()? {
            let state = source_states.get(&uid).copied().ok_or_else(|| {
                Error::argument(format!(
                    "stateful node {} of {} has no counterpart in {}",
                    uid, self.uid, source.uid
                ))
            })?;
            states.push((node, state));
        }

        let mut execution = self.lock_execution();
        for (parameter, value) in values {
            parameter.set_value(value)?;
        }
        {
            let mut inner = self.arena.lock();
            for (node, state) in states {
                inner.set_rng_state(node, state)?;
            }
        }
        execution.invalidate();
        debug!(function = %self.uid, source = %source.uid, "copied state");
        Ok(())
    }

    /// Stateful nodes of the closure, including those inside block bodies.
    fn stateful_nodes(&self) -> Result<Vec<(NodeId, String, RngState)>> {
        {
            let mut execution = self.lock_execution();
            self.sync_with_arena(&mut execution)?;
        }
        let view = self.read_graph();
        let inner = self.arena.lock();
        let mut nodes = Vec::new();
        for id in expand_blocks_in(&inner, view.closure.iter().copied())? {
            let node = inner.get(id)?;
            if let Some(state) = node.rng_state {
                nodes.push((id, node.uid.clone(), state));
            }
        }
        Ok(nodes)
    }

    fn filter_inputs(&self, keep: fn(&Variable) -> bool) -> Vec<Variable> {
        self.view()
            .inputs
            .iter()
            .filter(|variable| keep(variable))
            .cloned()
            .collect()
    }

    fn lock_execution(&self) -> MutexGuard<'_, ExecutionState> {
        self.execution
            .lock()
            .expect("composite execution state poisoned")
    }

    /// Graph view synchronized with the arena, or the last consistent one when the
    /// refresh fails. Must not be called while the execution lock is held.
    fn view(&self) -> RwLockReadGuard<'_, GraphView> {
        {
            let mut execution = self.lock_execution();
            if let Err(err) = self.sync_with_arena(&mut execution) {
                warn!(function = %self.uid, error = %err, "could not refresh graph view");
            }
        }
        self.read_graph()
    }

    fn read_graph(&self) -> RwLockReadGuard<'_, GraphView> {
        self.graph.read().expect("composite graph view poisoned")
    }

    fn write_graph(&self) -> RwLockWriteGuard<'_, GraphView> {
        self.graph.write().expect("composite graph view poisoned")
    }
}

impl fmt::Debug for CompositeFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompositeFunction")
            .field("uid", &self.uid)
            .field("name", &self.name)
            .field("root", &self.root)
            .field("arena", &self.arena.id())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn create_rejects_unknown_root() {
        let arena = GraphArena::new();
        let err = CompositeFunction::create(&arena, NodeId(42), "f", "").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::GraphInconsistency);
    }

    #[test]
    fn create_generates_uid() {
        let arena = GraphArena::new();
        let x = Variable::input([2], "x");
        let y = arena.negate(&x).unwrap();
        let f = CompositeFunction::create(&arena, y.owner().unwrap(), "f", "").unwrap();
        assert!(f.uid().starts_with("CompositeFunction"));
        assert_eq!(f.output(), &y);
        assert_eq!(f.arguments(), vec![x]);
    }

    #[test]
    fn closure_grows_with_replacement_owner() {
        let arena = GraphArena::new();
        let p = Variable::placeholder([2], "p");
        let out = arena.negate(&p).unwrap();
        let f = CompositeFunction::create(&arena, out.owner().unwrap(), "f", "").unwrap();
        assert_eq!(f.primitive_function_count(), 1);

        let x = Variable::input([2], "x");
        let feeder = arena.exp(&arena.tanh(&x).unwrap()).unwrap();
        f.replace_placeholders(&HashMap::from([(p, feeder)])).unwrap();
        assert_eq!(f.primitive_function_count(), 3);
        assert_eq!(f.inputs(), vec![x]);
        assert!(f.placeholders().is_empty());
    }

    #[test]
    fn closure_unchanged_by_leaf_replacement() {
        let arena = GraphArena::new();
        let p = Variable::placeholder([2], "p");
        let out = arena.negate(&p).unwrap();
        let f = CompositeFunction::create(&arena, out.owner().unwrap(), "f", "").unwrap();
        let x = Variable::input([2], "x");
        f.replace_placeholders(&HashMap::from([(p, x.clone())])).unwrap();
        assert_eq!(f.primitive_function_count(), 1);
        assert_eq!(f.arguments(), vec![x]);
    }

    #[test]
    fn replacement_keys_must_belong_to_function() {
        let arena = GraphArena::new();
        let p = Variable::placeholder([2], "p");
        let out = arena.negate(&p).unwrap();
        let f = CompositeFunction::create(&arena, out.owner().unwrap(), "f", "").unwrap();
        let stranger = Variable::placeholder([2], "q");
        let err = f
            .replace_placeholders(&HashMap::from([(stranger, Variable::input([2], "x"))]))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ArgumentMismatch);
    }

    #[test]
    fn argument_dependencies_are_minimal() {
        let arena = GraphArena::new();
        let x = Variable::input([2], "x");
        let y = Variable::input([2], "y");
        let a = arena.negate(&x).unwrap();
        let b = arena.exp(&y).unwrap();
        let out = arena.plus(&a, &b).unwrap();
        let f = CompositeFunction::create(&arena, out.owner().unwrap(), "f", "").unwrap();
        assert_eq!(f.argument_dependencies(&a).unwrap(), vec![x.clone()]);
        assert_eq!(f.argument_dependencies(&out).unwrap(), vec![x, y]);

        let outside = arena.sigmoid(&a).unwrap();
        let err = f.argument_dependencies(&outside).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::GraphInconsistency);
    }
}
