mod common;

use std::collections::HashSet;
use std::sync::Arc;

use common::{arguments, assert_close, cpu, request, setup, tensor, value};
use fngraph::{CompositeFunction, ErrorKind, GraphArena, Parameter, Variable};

// out = dropout(x * w, 0.5)
fn model() -> (Arc<CompositeFunction>, Parameter) {
    let arena = GraphArena::new();
    let x = Variable::input([16], "x");
    let w = Parameter::new(tensor(&[16], &[1.0; 16]), "w");
    let scaled = arena.element_times(&x, w.variable()).unwrap();
    let out = arena.dropout(&scaled, 0.5, 3).unwrap();
    let f = CompositeFunction::create(&arena, out.owner().unwrap(), "model", "").unwrap();
    (f, w)
}

fn run(f: &Arc<CompositeFunction>) -> anyhow::Result<Vec<f32>> {
    let x = f.arguments()[0].clone();
    let out = f.output().clone();
    let args = arguments(&[(&x, tensor(&[16], &[1.0; 16]))]);
    let mut outputs = request(&[&out]);
    f.forward(&args, &mut outputs, cpu(), &HashSet::new())?;
    Ok(value(&outputs, &out).to_vec())
}

#[test]
fn parameter_values_are_copied_by_uid() -> anyhow::Result<()> {
    setup();
    let (f, w) = model();
    let copy = f.clone_with_parameters(cpu())?;
    run(&copy)?;
    let refreshes = copy.plan_stats().parameter_refreshes;

    w.set_value(tensor(&[16], &[3.0; 16]))?;
    copy.copy_state(&f)?;
    let copied = copy.parameters()[0].clone();
    assert_eq!(copied.uid(), w.uid());
    assert_ne!(copied.variable(), w.variable());
    assert_close(copied.value().data(), &[3.0; 16]);

    let values = run(&copy)?;
    assert!(values.iter().all(|v| *v == 0.0 || *v == 6.0));
    assert!(copy.plan_stats().parameter_refreshes > refreshes);
    Ok(())
}

#[test]
fn random_streams_are_copied() -> anyhow::Result<()> {
    setup();
    let (f, _) = model();
    let copy = f.clone_with_parameters(cpu())?;
    run(&f)?;
    run(&f)?;

    let fresh = run(&copy)?;
    copy.copy_state(&f)?;
    let resumed = run(&copy)?;
    let expected = run(&f)?;
    assert_eq!(resumed, expected);
    assert_ne!(fresh, expected);
    Ok(())
}

#[test]
fn unrelated_composites_are_rejected() -> anyhow::Result<()> {
    setup();
    let (f, w) = model();
    let (g, _) = model();
    let before = w.timestamp();
    let err = f.copy_state(&g).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ArgumentMismatch);
    assert_eq!(w.timestamp(), before);
    Ok(())
}
