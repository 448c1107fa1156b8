//! Compute device descriptors.

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DeviceKind {
    Cpu,
    Gpu,
}

impl DeviceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            DeviceKind::Cpu => "cpu",
            DeviceKind::Gpu => "gpu",
        }
    }
}

/// Equality-comparable token naming a compute device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    kind: DeviceKind,
    ordinal: u32,
}

impl DeviceDescriptor {
    pub fn new(kind: DeviceKind, ordinal: u32) -> Self {
        DeviceDescriptor { kind, ordinal }
    }

    pub fn cpu() -> Self {
        DeviceDescriptor::new(DeviceKind::Cpu, 0)
    }

    pub fn gpu(ordinal: u32) -> Self {
        DeviceDescriptor::new(DeviceKind::Gpu, ordinal)
    }

    pub fn kind(&self) -> DeviceKind {
        self.kind
    }

    pub fn ordinal(&self) -> u32 {
        self.ordinal
    }
}

impl Default for DeviceDescriptor {
    fn default() -> Self {
        DeviceDescriptor::cpu()
    }
}

impl fmt::Display for DeviceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind.as_str(), self.ordinal)
    }
}
