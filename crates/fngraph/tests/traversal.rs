mod common;

use std::collections::HashSet;

use common::{setup, tensor};
use fngraph::graph::{collect, determine_inputs, traverse, traverse_with};
use fngraph::{GraphArena, NodeId, Parameter, PrimitiveOp, Variable};

#[test]
fn diamonds_are_visited_once() -> anyhow::Result<()> {
    setup();
    let arena = GraphArena::new();
    let x = Variable::input([2], "x");
    let top = arena.negate(&x)?;
    let left = arena.exp(&top)?;
    let right = arena.tanh(&top)?;
    let out = arena.plus(&left, &right)?;

    let mut ops = Vec::new();
    traverse(&arena, out.owner().unwrap(), |node| ops.push(node.op()))?;
    assert_eq!(
        ops,
        vec![
            PrimitiveOp::Plus,
            PrimitiveOp::Exp,
            PrimitiveOp::Negate,
            PrimitiveOp::Tanh,
        ]
    );
    assert_eq!(collect(&arena, out.owner().unwrap())?.len(), 4);
    Ok(())
}

#[test]
fn shared_visited_sets_skip_known_nodes() -> anyhow::Result<()> {
    setup();
    let arena = GraphArena::new();
    let x = Variable::input([2], "x");
    let shared = arena.negate(&x)?;
    let first = arena.exp(&shared)?;
    let second = arena.relu(&shared)?;

    let mut visited: HashSet<NodeId> = HashSet::new();
    let mut count = 0;
    traverse_with(&arena, first.owner().unwrap(), &mut visited, |_| count += 1)?;
    assert_eq!(count, 2);
    let mut count = 0;
    traverse_with(&arena, second.owner().unwrap(), &mut visited, |_| count += 1)?;
    assert_eq!(count, 1);
    assert_eq!(visited.len(), 3);
    Ok(())
}

#[test]
fn leaves_come_in_first_discovery_order() -> anyhow::Result<()> {
    setup();
    let arena = GraphArena::new();
    let x = Variable::input([2], "x");
    let y = Variable::input([2], "y");
    let w = Parameter::new(tensor(&[2], &[1.0, 1.0]), "w");
    let a = arena.element_times(&x, w.variable())?;
    let b = arena.plus(&y, &x)?;
    let out = arena.minus(&a, &b)?;

    let leaves = determine_inputs(&arena, out.owner().unwrap())?;
    assert_eq!(leaves, vec![x, w.variable().clone(), y]);
    Ok(())
}

#[test]
fn unknown_roots_are_rejected() {
    setup();
    let arena = GraphArena::new();
    let other = GraphArena::new();
    let x = Variable::input([2], "x");
    let foreign = other.negate(&x).unwrap();
    let err = collect(&arena, foreign.owner().unwrap()).unwrap_err();
    assert_eq!(err.kind(), fngraph::ErrorKind::GraphInconsistency);
}
