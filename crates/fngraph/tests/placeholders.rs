mod common;

use std::collections::{HashMap, HashSet};

use common::{arguments, assert_close, cpu, request, setup, tensor, value};
use fngraph::{CompositeFunction, ErrorKind, GraphArena, Parameter, Variable};

#[test]
fn replacing_with_an_output_grows_the_closure() -> anyhow::Result<()> {
    setup();
    let arena = GraphArena::new();
    let p = Variable::placeholder([2], "p");
    let out = arena.negate(&p)?;
    let f = CompositeFunction::create(&arena, out.owner().unwrap(), "head", "")?;
    assert_eq!(f.primitive_function_count(), 1);
    assert_eq!(f.placeholders(), vec![p.clone()]);

    let x = Variable::input([2], "x");
    let w = Parameter::new(tensor(&[2], &[2.0, 3.0]), "w");
    let feature = arena.exp(&arena.element_times(&x, w.variable())?)?;
    f.replace_placeholders(&HashMap::from([(p.clone(), feature.clone())]))?;

    assert_eq!(f.primitive_function_count(), 3);
    assert!(f.contains(feature.owner().unwrap()));
    assert!(f.placeholders().is_empty());
    assert_eq!(f.arguments(), vec![x.clone()]);
    assert_eq!(f.parameters()[0].variable(), w.variable());
    assert_eq!(f.argument_dependencies(&out)?, vec![x.clone()]);

    let args = arguments(&[(&x, tensor(&[2], &[0.0, 0.0]))]);
    let mut outputs = request(&[&out]);
    let state = f.forward(&args, &mut outputs, cpu(), &HashSet::from([out.clone()]))?;
    assert_close(value(&outputs, &out), &[-1.0, -1.0]);

    let seeds = HashMap::from([(out.clone(), fngraph::Tensor::ones([2], cpu()))]);
    let mut gradients = request(&[w.variable()]);
    f.backward(&state, &seeds, &mut gradients)?;
    // d/dw -exp(x * w) at x = 0
    assert_close(value(&gradients, w.variable()), &[0.0, 0.0]);
    Ok(())
}

#[test]
fn replacing_with_a_leaf_keeps_the_closure() -> anyhow::Result<()> {
    setup();
    let arena = GraphArena::new();
    let p = Variable::placeholder([2], "p");
    let out = arena.tanh(&p)?;
    let f = CompositeFunction::create(&arena, out.owner().unwrap(), "tanh", "")?;

    let x = Variable::input([2], "x");
    f.replace_placeholders(&HashMap::from([(p, x.clone())]))?;
    assert_eq!(f.primitive_function_count(), 1);
    assert_eq!(f.inputs(), vec![x.clone()]);

    let args = arguments(&[(&x, tensor(&[2], &[0.0, 0.0]))]);
    let mut outputs = request(&[&out]);
    f.forward(&args, &mut outputs, cpu(), &HashSet::new())?;
    assert_close(value(&outputs, &out), &[0.0, 0.0]);
    Ok(())
}

#[test]
fn cyclic_replacement_leaves_graph_untouched() -> anyhow::Result<()> {
    setup();
    let arena = GraphArena::new();
    let p = Variable::placeholder([2], "p");
    let hidden = arena.negate(&p)?;
    let out = arena.exp(&hidden)?;
    let f = CompositeFunction::create(&arena, out.owner().unwrap(), "loop", "")?;
    let version = arena.version();

    let err = f
        .replace_placeholders(&HashMap::from([(p.clone(), out.clone())]))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::GraphInconsistency);
    assert_eq!(arena.version(), version);
    assert_eq!(arena.node(hidden.owner().unwrap())?.inputs(), &[p.clone()]);
    assert_eq!(f.placeholders(), vec![p]);
    assert_eq!(f.primitive_function_count(), 2);
    Ok(())
}

#[test]
fn invalid_replacements_are_rejected() -> anyhow::Result<()> {
    setup();
    let arena = GraphArena::new();
    let p = Variable::placeholder([2], "p");
    let out = arena.negate(&p)?;
    let f = CompositeFunction::create(&arena, out.owner().unwrap(), "neg", "")?;

    let wide = Variable::input([3], "wide");
    let err = f
        .replace_placeholders(&HashMap::from([(p.clone(), wide)]))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ArgumentMismatch);

    let dangling = Variable::placeholder([2], "dangling");
    let err = f
        .replace_placeholders(&HashMap::from([(p.clone(), dangling)]))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ArgumentMismatch);
    assert_eq!(f.placeholders(), vec![p]);
    Ok(())
}

#[test]
fn chained_placeholders_resolve_to_the_final_target() -> anyhow::Result<()> {
    setup();
    let arena = GraphArena::new();
    let p1 = Variable::placeholder([2], "p1");
    let p2 = Variable::placeholder([2], "p2");
    let out = arena.negate(&p1)?;
    let f = CompositeFunction::create(&arena, out.owner().unwrap(), "neg", "")?;

    let x = Variable::input([2], "x");
    let doubled = arena.scale(&x, 2.0)?;
    f.replace_placeholders(&HashMap::from([
        (p1.clone(), p2.clone()),
        (p2, doubled.clone()),
    ]))?;
    assert_eq!(f.primitive_function_count(), 2);
    assert_eq!(arena.node(out.owner().unwrap())?.inputs(), &[doubled]);

    let args = arguments(&[(&x, tensor(&[2], &[1.0, -2.0]))]);
    let mut outputs = request(&[&out]);
    f.forward(&args, &mut outputs, cpu(), &HashSet::new())?;
    assert_close(value(&outputs, &out), &[-2.0, 4.0]);
    Ok(())
}

#[test]
fn edits_are_visible_to_composites_sharing_the_nodes() -> anyhow::Result<()> {
    setup();
    let arena = GraphArena::new();
    let p = Variable::placeholder([2], "p");
    let shared = arena.negate(&p)?;
    let head = CompositeFunction::create(&arena, shared.owner().unwrap(), "head", "")?;
    let out = arena.exp(&shared)?;
    let tail = CompositeFunction::create(&arena, out.owner().unwrap(), "tail", "")?;

    let x = Variable::input([2], "x");
    let mut outputs = request(&[&out]);
    let err = tail
        .forward(&HashMap::new(), &mut outputs, cpu(), &HashSet::new())
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::GraphInconsistency);

    head.replace_placeholders(&HashMap::from([(p, x.clone())]))?;
    tail.refresh()?;
    assert_eq!(tail.arguments(), vec![x.clone()]);
    assert!(tail.placeholders().is_empty());

    let args = arguments(&[(&x, tensor(&[2], &[0.0, 0.0]))]);
    let mut outputs = request(&[&out]);
    tail.forward(&args, &mut outputs, cpu(), &HashSet::new())?;
    assert_close(value(&outputs, &out), &[1.0, 1.0]);
    Ok(())
}
