//! Reference CPU backend for fngraph.
//!
//! Implements forward and backward kernels for the whole primitive op catalog on host
//! memory. Tests of the core engine run against it.

pub mod cpu;

use std::sync::Arc;

use fngraph::backend::register_backend;
use fngraph::DeviceKind;

pub use cpu::CpuBackend;

/// Register the CPU backend with the global backend registry.
///
/// Called automatically on Linux through a static initializer; call it manually on other
/// targets or to make registration explicit. Safe to call repeatedly.
pub fn register_cpu_backend() {
    register_backend(DeviceKind::Cpu, || Arc::new(CpuBackend::new()));
}

/// Serves `kind` with the CPU kernels as well. Tests use it to stand in for devices that
/// have no real backend.
pub fn register_cpu_backend_for(kind: DeviceKind) {
    register_backend(kind, || Arc::new(CpuBackend::new()));
}

// Auto-register on library load
#[cfg(target_os = "linux")]
#[used]
#[link_section = ".init_array"]
static REGISTER_CPU_BACKEND: extern "C" fn() = {
    extern "C" fn register() {
        register_cpu_backend();
    }
    register
};
