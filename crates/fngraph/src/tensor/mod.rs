//! Tensor abstractions the graph core moves around.
//!
//! The engine treats tensors as opaque f32 buffers: it binds caller values into plan
//! slots, hands them to the device backend, and copies results back out. Numerical work
//! happens in backend crates.

mod host_tensor;
pub mod shape;

pub use host_tensor::Tensor;
pub use shape::Shape;
