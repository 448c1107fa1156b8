//! Graph edges: leaf variables and node outputs.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use crate::error::{ensure, Result};
use crate::tensor::{Shape, Tensor};

use super::node::NodeId;

static NEXT_VARIABLE_ID: AtomicU64 = AtomicU64::new(0);
static NEXT_AUTO_UID: AtomicU64 = AtomicU64::new(0);

/// Returns a fresh uid of the form `<prefix><counter>`, unique within the process.
pub fn next_auto_generated_uid(prefix: &str) -> String {
    format!("{prefix}{}", NEXT_AUTO_UID.fetch_add(1, Ordering::Relaxed))
}

/// Process-unique identity of a variable; equality of [`Variable`] is equality of ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VariableId(u64);

impl VariableId {
    fn next() -> Self {
        VariableId(NEXT_VARIABLE_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VariableKind {
    Input,
    Parameter,
    Constant,
    Placeholder,
    Output,
}

impl VariableKind {
    fn uid_prefix(self) -> &'static str {
        match self {
            VariableKind::Input => "Input",
            VariableKind::Parameter => "Parameter",
            VariableKind::Constant => "Constant",
            VariableKind::Placeholder => "Placeholder",
            VariableKind::Output => "Output",
        }
    }
}

/// Value and mutation counter shared by every clone of a parameter.
#[derive(Debug)]
pub(crate) struct ParameterStorage {
    value: RwLock<Tensor>,
    timestamp: AtomicU64,
}

#[derive(Debug)]
enum Storage {
    None,
    Parameter(Arc<ParameterStorage>),
    Constant(Arc<Tensor>),
}

#[derive(Debug, Clone, Copy)]
struct Owner {
    node: NodeId,
    index: usize,
}

#[derive(Debug)]
struct VariableInner {
    id: VariableId,
    kind: VariableKind,
    shape: Shape,
    name: String,
    uid: String,
    owner: Option<Owner>,
    storage: Storage,
}

/// Cheap handle to an immutable graph edge.
#[derive(Clone)]
pub struct Variable {
    inner: Arc<VariableInner>,
}

impl Variable {
    /// Caller-supplied data slot.
    pub fn input(shape: impl Into<Shape>, name: impl Into<String>) -> Self {
        Variable::leaf(VariableKind::Input, shape.into(), name.into(), None, Storage::None)
    }

    /// Unbound slot to be substituted later through placeholder replacement.
    pub fn placeholder(shape: impl Into<Shape>, name: impl Into<String>) -> Self {
        Variable::leaf(
            VariableKind::Placeholder,
            shape.into(),
            name.into(),
            None,
            Storage::None,
        )
    }

    pub fn constant(value: Tensor, name: impl Into<String>) -> Self {
        Variable::restore_constant(value, name.into(), None)
    }

    pub(crate) fn restore_leaf(
        kind: VariableKind,
        shape: Shape,
        name: String,
        uid: Option<String>,
    ) -> Self {
        Variable::leaf(kind, shape, name, uid, Storage::None)
    }

    pub(crate) fn restore_constant(value: Tensor, name: String, uid: Option<String>) -> Self {
        let shape = value.shape().clone();
        Variable::leaf(
            VariableKind::Constant,
            shape,
            name,
            uid,
            Storage::Constant(Arc::new(value)),
        )
    }

    pub(crate) fn output(
        node: NodeId,
        index: usize,
        shape: Shape,
        name: String,
        uid: Option<String>,
    ) -> Self {
        let id = VariableId::next();
        let uid = uid.unwrap_or_else(|| next_auto_generated_uid(VariableKind::Output.uid_prefix()));
        Variable {
            inner: Arc::new(VariableInner {
                id,
                kind: VariableKind::Output,
                shape,
                name,
                uid,
                owner: Some(Owner { node, index }),
                storage: Storage::None,
            }),
        }
    }

    fn leaf(
        kind: VariableKind,
        shape: Shape,
        name: String,
        uid: Option<String>,
        storage: Storage,
    ) -> Self {
        let id = VariableId::next();
        let uid = uid.unwrap_or_else(|| next_auto_generated_uid(kind.uid_prefix()));
        Variable {
            inner: Arc::new(VariableInner {
                id,
                kind,
                shape,
                name,
                uid,
                owner: None,
                storage,
            }),
        }
    }

    pub fn id(&self) -> VariableId {
        self.inner.id
    }

    pub fn kind(&self) -> VariableKind {
        self.inner.kind
    }

    pub fn shape(&self) -> &Shape {
        &self.inner.shape
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn uid(&self) -> &str {
        &self.inner.uid
    }

    /// Producing node, present iff this is an output variable.
    pub fn owner(&self) -> Option<NodeId> {
        self.inner.owner.map(|owner| owner.node)
    }

    pub fn output_index(&self) -> Option<usize> {
        self.inner.owner.map(|owner| owner.index)
    }

    pub fn is_output(&self) -> bool {
        self.inner.kind == VariableKind::Output
    }

    pub fn is_leaf(&self) -> bool {
        !self.is_output()
    }

    pub fn is_input(&self) -> bool {
        self.inner.kind == VariableKind::Input
    }

    pub fn is_parameter(&self) -> bool {
        self.inner.kind == VariableKind::Parameter
    }

    pub fn is_constant(&self) -> bool {
        self.inner.kind == VariableKind::Constant
    }

    pub fn is_placeholder(&self) -> bool {
        self.inner.kind == VariableKind::Placeholder
    }

    pub fn as_parameter(&self) -> Option<Parameter> {
        match self.inner.storage {
            Storage::Parameter(_) => Some(Parameter {
                variable: self.clone(),
            }),
            _ => None,
        }
    }

    pub fn constant_value(&self) -> Option<&Tensor> {
        match &self.inner.storage {
            Storage::Constant(value) => Some(value),
            _ => None,
        }
    }

    fn parameter_storage(&self) -> Option<&ParameterStorage> {
        match &self.inner.storage {
            Storage::Parameter(storage) => Some(storage),
            _ => None,
        }
    }
}

impl PartialEq for Variable {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for Variable {}

impl Hash for Variable {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.id.hash(state);
    }
}

impl fmt::Debug for Variable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Variable({}", self.inner.uid)?;
        if !self.inner.name.is_empty() {
            write!(f, " '{}'", self.inner.name)?;
        }
        write!(f, " {})", self.inner.shape)
    }
}

impl fmt::Display for Variable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.inner.name.is_empty() {
            f.write_str(&self.inner.uid)
        } else {
            write!(f, "{} ('{}')", self.inner.uid, self.inner.name)
        }
    }
}

/// Trainable leaf whose value can be mutated in place.
///
/// Every mutation bumps a monotonic timestamp; the execution plan compares it against the
/// last value it copied to decide whether the device-side slot must be refreshed, and a
/// [`BackpropState`](crate::composite::BackpropState) compares it to detect that
/// gradients would be computed against values that no longer exist.
#[derive(Clone)]
pub struct Parameter {
    variable: Variable,
}

impl Parameter {
    pub fn new(value: Tensor, name: impl Into<String>) -> Self {
        Parameter::restore(value, name.into(), None, 1)
    }

    pub(crate) fn restore(value: Tensor, name: String, uid: Option<String>, timestamp: u64) -> Self {
        let shape = value.shape().clone();
        let storage = Arc::new(ParameterStorage {
            value: RwLock::new(value),
            timestamp: AtomicU64::new(timestamp),
        });
        Parameter {
            variable: Variable::leaf(
                VariableKind::Parameter,
                shape,
                name,
                uid,
                Storage::Parameter(storage),
            ),
        }
    }

    pub fn variable(&self) -> &Variable {
        &self.variable
    }

    pub fn uid(&self) -> &str {
        self.variable.uid()
    }

    pub fn shape(&self) -> &Shape {
        self.variable.shape()
    }

    /// Snapshot of the current value.
    pub fn value(&self) -> Tensor {
        self.with_value(Tensor::clone)
    }

    pub fn with_value<R>(&self, f: impl FnOnce(&Tensor) -> R) -> R {
        let guard = self
            .storage()
            .value
            .read()
            .expect("parameter storage poisoned");
        f(&guard)
    }

    pub fn timestamp(&self) -> u64 {
        self.storage().timestamp.load(Ordering::Acquire)
    }

    /// Replaces the value; the shape must stay the same.
    pub fn set_value(&self, value: Tensor) -> Result<()> {
        ensure!(
            value.shape() == self.shape(),
            argument,
            "parameter {} has shape {}, cannot assign value of shape {}",
            self.variable,
            self.shape(),
            value.shape()
        );
        let storage = self.storage();
        {
            let mut guard = storage.value.write().expect("parameter storage poisoned");
            let device = guard.device();
            *guard = value.to_device(device);
        }
        storage.timestamp.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// Mutates the elements in place.
    pub fn update(&self, f: impl FnOnce(&mut [f32])) {
        let storage = self.storage();
        {
            let mut guard = storage.value.write().expect("parameter storage poisoned");
            f(guard.data_mut());
        }
        storage.timestamp.fetch_add(1, Ordering::AcqRel);
    }

    fn storage(&self) -> &ParameterStorage {
        match self.variable.parameter_storage() {
            Some(storage) => storage,
            None => unreachable!("parameter variable without parameter storage"),
        }
    }
}

impl From<Parameter> for Variable {
    fn from(parameter: Parameter) -> Self {
        parameter.variable
    }
}

impl fmt::Debug for Parameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Parameter")
            .field("variable", &self.variable)
            .field("timestamp", &self.timestamp())
            .finish()
    }
}
