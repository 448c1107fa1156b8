mod common;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use common::{arguments, cpu, request, setup, tensor, value};
use fngraph::serialization::{from_bytes, from_json, to_bytes, to_json};
use fngraph::{CompositeFunction, GraphArena, Parameter, Tensor, Variable};

// out = dropout(relu(x @ w + b)) with the affine part wrapped in a block.
fn network() -> anyhow::Result<Arc<CompositeFunction>> {
    let arena = GraphArena::new();
    let w = Parameter::new(tensor(&[2, 3], &[0.5, -1.0, 2.0, 1.5, 0.25, -0.75]), "w");
    let b = Parameter::new(tensor(&[1, 3], &[0.1, 0.2, 0.3]), "b");
    let p = Variable::placeholder([1, 2], "p");
    let affine = arena.plus(&arena.times(&p, w.variable())?, b.variable())?;
    let x = Variable::input([1, 2], "x");
    let block = arena.as_block(affine.owner().unwrap(), &[(p, x)], "Affine", "affine")?;
    let hidden = arena.relu(&arena.outputs(block)?[0])?;
    let out = arena.dropout(&hidden, 0.5, 42)?;
    Ok(CompositeFunction::create(&arena, out.owner().unwrap(), "net", "")?)
}

fn run(f: &Arc<CompositeFunction>) -> anyhow::Result<Vec<f32>> {
    let x = f.arguments()[0].clone();
    let args = arguments(&[(&x, tensor(&[1, 2], &[1.0, 2.0]))]);
    let out = f.output().clone();
    let mut outputs = request(&[&out]);
    f.forward(&args, &mut outputs, cpu(), &HashSet::new())?;
    Ok(value(&outputs, &out).to_vec())
}

#[test]
fn restored_functions_evaluate_identically() -> anyhow::Result<()> {
    setup();
    let f = network()?;
    // Advance the dropout stream so the restored copy has to pick it up mid-way.
    run(&f)?;
    run(&f)?;

    let restored = CompositeFunction::deserialize(&f.serialize()?, cpu())?;
    assert_eq!(restored.arguments()[0].uid(), f.arguments()[0].uid());
    for _ in 0..3 {
        assert_eq!(run(&restored)?, run(&f)?);
    }
    Ok(())
}

#[test]
fn restored_functions_train_independently() -> anyhow::Result<()> {
    setup();
    let f = network()?;
    let copy = f.clone_with_parameters(cpu())?;
    let x = copy.arguments()[0].clone();
    let out = copy.output().clone();

    let args = arguments(&[(&x, tensor(&[1, 2], &[1.0, 2.0]))]);
    let mut outputs = request(&[&out]);
    let state = copy.forward(&args, &mut outputs, cpu(), &HashSet::from([out.clone()]))?;
    let seeds = HashMap::from([(out.clone(), Tensor::ones([1, 3], cpu()))]);
    let w = copy
        .parameters()
        .into_iter()
        .find(|parameter| parameter.variable().name() == "w")
        .unwrap();
    let mut gradients = request(&[w.variable()]);
    copy.backward(&state, &seeds, &mut gradients)?;
    let step = value(&gradients, w.variable()).to_vec();
    w.update(|data| {
        for (weight, grad) in data.iter_mut().zip(&step) {
            *weight -= 0.1 * grad;
        }
    });

    let original = f
        .parameters()
        .into_iter()
        .find(|parameter| parameter.variable().name() == "w")
        .unwrap();
    assert_eq!(original.value().data(), &[0.5, -1.0, 2.0, 1.5, 0.25, -0.75]);
    assert_eq!(original.uid(), w.uid());
    Ok(())
}

#[test]
fn encodings_survive_files() -> anyhow::Result<()> {
    setup();
    let f = network()?;
    run(&f)?;
    let path = std::env::temp_dir().join(format!("fngraph-{}-roundtrip.bin", std::process::id()));
    f.save(&path)?;
    let loaded = CompositeFunction::load(&path, cpu());
    std::fs::remove_file(&path)?;
    let loaded = loaded?;
    assert_eq!(loaded.serialize()?, f.serialize()?);

    let dictionary = f.serialize()?;
    assert_eq!(from_bytes(&to_bytes(&dictionary)?)?, dictionary);
    assert_eq!(from_json(&to_json(&dictionary)?)?, dictionary);
    assert_eq!(run(&loaded)?, run(&f)?);
    Ok(())
}

#[test]
fn missing_files_surface_io_errors() {
    setup();
    let path = std::env::temp_dir().join("fngraph-does-not-exist.bin");
    let err = CompositeFunction::load(&path, cpu()).unwrap_err();
    assert_eq!(err.kind(), fngraph::ErrorKind::Io);
}
