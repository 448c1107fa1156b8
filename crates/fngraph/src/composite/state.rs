use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::device::DeviceDescriptor;
use crate::graph::Variable;

use super::function::CompositeFunction;
use super::plan::SlotId;

/// Handle returned by a forward pass that retained backprop roots.
///
/// It records the evaluation timestamps of the retained roots, the versions of every
/// slot in their cone, and the timestamps of the parameters they depend on. Backward
/// refuses the state once any of them moved: a later forward re-evaluated a root or
/// stored different values under it, or a parameter was mutated.
pub struct BackpropState {
    pub(crate) function: Arc<CompositeFunction>,
    pub(crate) device: DeviceDescriptor,
    pub(crate) generation: u64,
    pub(crate) root_timestamps: HashMap<Variable, u64>,
    pub(crate) parameter_timestamps: HashMap<Variable, u64>,
    pub(crate) slot_versions: Vec<(SlotId, u64)>,
}

impl BackpropState {
    pub fn function(&self) -> &Arc<CompositeFunction> {
        &self.function
    }

    pub fn device(&self) -> DeviceDescriptor {
        self.device
    }

    pub fn roots(&self) -> impl Iterator<Item = &Variable> {
        self.root_timestamps.keys()
    }

    pub fn root_timestamp(&self, root: &Variable) -> Option<u64> {
        self.root_timestamps.get(root).copied()
    }

    /// Parameter timestamps the retained roots were computed against.
    pub fn parameter_timestamps(&self) -> &HashMap<Variable, u64> {
        &self.parameter_timestamps
    }
}

impl fmt::Debug for BackpropState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackpropState")
            .field("function", &self.function.uid())
            .field("device", &self.device)
            .field("generation", &self.generation)
            .field("roots", &self.root_timestamps)
            .field("parameters", &self.parameter_timestamps.len())
            .field("slots", &self.slot_versions.len())
            .finish()
    }
}
