//! Runtime backend registry keyed by device kind.
//!
//! Backend crates register a constructor for the device kinds they can serve; execution
//! plans look the backend up when they are built for a device.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use once_cell::sync::Lazy;

use crate::device::{DeviceDescriptor, DeviceKind};

use super::Backend;

/// Factory function that creates a new backend instance.
pub type BackendConstructor = Box<dyn Fn() -> Arc<dyn Backend> + Send + Sync>;

static GLOBAL_REGISTRY: Lazy<RwLock<HashMap<DeviceKind, BackendConstructor>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

/// Registers (or replaces) the backend constructor for a device kind.
///
/// # Example
/// ```ignore
/// use fngraph::backend::register_backend;
/// use fngraph::DeviceKind;
///
/// register_backend(DeviceKind::Cpu, || Arc::new(MyBackend::new()));
/// ```
pub fn register_backend<F>(kind: DeviceKind, constructor: F)
where
    F: Fn() -> Arc<dyn Backend> + Send + Sync + 'static,
{
    GLOBAL_REGISTRY
        .write()
        .expect("backend registry poisoned")
        .insert(kind, Box::new(constructor));
}

/// Creates a backend instance for `device`, or `None` if its kind has no registration.
pub fn backend_for(device: &DeviceDescriptor) -> Option<Arc<dyn Backend>> {
    let registry = GLOBAL_REGISTRY.read().expect("backend registry poisoned");
    let constructor = registry.get(&device.kind())?;
    Some(constructor())
}

pub fn has_backend(kind: DeviceKind) -> bool {
    GLOBAL_REGISTRY
        .read()
        .expect("backend registry poisoned")
        .contains_key(&kind)
}

pub fn registered_kinds() -> Vec<DeviceKind> {
    let mut kinds: Vec<DeviceKind> = GLOBAL_REGISTRY
        .read()
        .expect("backend registry poisoned")
        .keys()
        .copied()
        .collect();
    kinds.sort();
    kinds
}
