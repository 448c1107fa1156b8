#![allow(dead_code)]

use std::collections::HashMap;

use fngraph::{DeviceDescriptor, Tensor, Variable};
use tracing_subscriber::EnvFilter;

/// Installs a test log subscriber (honouring `RUST_LOG`) and registers the CPU kernels.
pub fn setup() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    fngraph_backend_ref_cpu::register_cpu_backend();
}

pub fn cpu() -> DeviceDescriptor {
    DeviceDescriptor::cpu()
}

pub fn tensor(shape: &[usize], data: &[f32]) -> Tensor {
    Tensor::from_vec(shape, data.to_vec()).expect("tensor data matches shape")
}

pub fn arguments(pairs: &[(&Variable, Tensor)]) -> HashMap<Variable, Tensor> {
    pairs
        .iter()
        .map(|(variable, value)| ((*variable).clone(), value.clone()))
        .collect()
}

/// Output or gradient request map with fresh-tensor slots.
pub fn request(variables: &[&Variable]) -> HashMap<Variable, Option<Tensor>> {
    variables
        .iter()
        .map(|variable| ((*variable).clone(), None))
        .collect()
}

pub fn value<'a>(results: &'a HashMap<Variable, Option<Tensor>>, variable: &Variable) -> &'a [f32] {
    results
        .get(variable)
        .and_then(Option::as_ref)
        .expect("requested value was produced")
        .data()
}

pub fn assert_close(actual: &[f32], expected: &[f32]) {
    assert_eq!(actual.len(), expected.len(), "{actual:?} vs {expected:?}");
    for (a, e) in actual.iter().zip(expected) {
        assert!((a - e).abs() < 1e-5, "{actual:?} vs {expected:?}");
    }
}
