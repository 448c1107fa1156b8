//! Depth-first walks over the nodes reachable from a root.
//!
//! Walks follow only inputs that are outputs of another node; leaves end a path. Block
//! nodes are visited as single nodes, their bodies are not entered. The walk is
//! iterative so arbitrarily deep chains do not exhaust the stack.

use std::collections::{BTreeSet, HashMap, HashSet};

use crate::error::Result;
use crate::hashing::{fnv1a_bytes, fnv1a_init, fnv1a_u64};

use super::arena::{ArenaInner, GraphArena};
use super::node::{NodeId, PrimitiveFunction};
use super::variable::Variable;

/// Visits every node reachable from `root` exactly once, in pre-order.
///
/// The arena stays locked for the duration of the walk; `visit` must not call back
/// into the same arena.
pub fn traverse<F>(arena: &GraphArena, root: NodeId, visit: F) -> Result<()>
where
    F: FnMut(&PrimitiveFunction),
{
    let mut visited = HashSet::new();
    traverse_with(arena, root, &mut visited, visit)
}

/// Like [`traverse`] but shares `visited` with the caller, so nodes already in the set are
/// skipped. `root` itself is always visited.
pub fn traverse_with<F>(
    arena: &GraphArena,
    root: NodeId,
    visited: &mut HashSet<NodeId>,
    visit: F,
) -> Result<()>
where
    F: FnMut(&PrimitiveFunction),
{
    let inner = arena.lock();
    traverse_in(&inner, root, visited, visit)
}

pub(crate) fn traverse_in<F>(
    inner: &ArenaInner,
    root: NodeId,
    visited: &mut HashSet<NodeId>,
    mut visit: F,
) -> Result<()>
where
    F: FnMut(&PrimitiveFunction),
{
    let start = inner.get(root)?;
    visited.insert(root);
    visit(start);

    let mut stack: Vec<(NodeId, usize)> = vec![(root, 0)];
    while let Some(&(current, cursor)) = stack.last() {
        let node = inner.get(current)?;
        let Some(input) = node.inputs.get(cursor) else {
            stack.pop();
            continue;
        };
        if let Some(frame) = stack.last_mut() {
            frame.1 += 1;
        }
        if let Some(owner) = input.owner() {
            if visited.insert(owner) {
                visit(inner.get(owner)?);
                stack.push((owner, 0));
            }
        }
    }
    Ok(())
}

/// Every node reachable from `root`, including `root`.
pub fn collect(arena: &GraphArena, root: NodeId) -> Result<HashSet<NodeId>> {
    let inner = arena.lock();
    collect_in(&inner, root)
}

pub(crate) fn collect_in(inner: &ArenaInner, root: NodeId) -> Result<HashSet<NodeId>> {
    let mut visited = HashSet::new();
    traverse_in(inner, root, &mut visited, |_| {})?;
    Ok(visited)
}

/// Leaf variables consumed by the graph under `root`, deduplicated, in first-discovery
/// order.
pub fn determine_inputs(arena: &GraphArena, root: NodeId) -> Result<Vec<Variable>> {
    let inner = arena.lock();
    determine_inputs_in(&inner, root)
}

pub(crate) fn determine_inputs_in(inner: &ArenaInner, root: NodeId) -> Result<Vec<Variable>> {
    let mut seen = HashSet::new();
    let mut leaves = Vec::new();
    let mut visited = HashSet::new();
    traverse_in(inner, root, &mut visited, |node| {
        for input in &node.inputs {
            if input.is_leaf() && seen.insert(input.id()) {
                leaves.push(input.clone());
            }
        }
    })?;
    Ok(leaves)
}

/// Nodes reachable from `roots` in dependency order: every node appears after the
/// producers of its inputs. Ties follow input order.
pub(crate) fn post_order_in(inner: &ArenaInner, roots: &[NodeId]) -> Result<Vec<NodeId>> {
    let mut order = Vec::new();
    let mut visited = HashSet::new();
    for &root in roots {
        if !visited.insert(root) {
            continue;
        }
        inner.get(root)?;
        let mut stack: Vec<(NodeId, usize)> = vec![(root, 0)];
        while let Some(&(current, cursor)) = stack.last() {
            let node = inner.get(current)?;
            let Some(input) = node.inputs.get(cursor) else {
                order.push(current);
                stack.pop();
                continue;
            };
            if let Some(frame) = stack.last_mut() {
                frame.1 += 1;
            }
            if let Some(owner) = input.owner() {
                if visited.insert(owner) {
                    inner.get(owner)?;
                    stack.push((owner, 0));
                }
            }
        }
    }
    Ok(order)
}

/// `nodes` plus every node inside the bodies of blocks among them, recursively.
pub(crate) fn expand_blocks_in(
    inner: &ArenaInner,
    nodes: impl IntoIterator<Item = NodeId>,
) -> Result<BTreeSet<NodeId>> {
    let mut expanded = BTreeSet::new();
    let mut pending: Vec<NodeId> = nodes.into_iter().collect();
    while let Some(id) = pending.pop() {
        if !expanded.insert(id) {
            continue;
        }
        if let Some(body) = &inner.get(id)?.block {
            pending.extend(collect_in(inner, body.root)?);
        }
    }
    Ok(expanded)
}

/// Structural fingerprint of the graph under `root`: op kinds, attributes, arities and
/// wiring in traversal order. Identities and uids do not contribute, so a graph and its
/// deserialized copy share a fingerprint.
pub fn fingerprint(arena: &GraphArena, root: NodeId) -> Result<u64> {
    let inner = arena.lock();
    fingerprint_in(&inner, root)
}

fn fingerprint_in(inner: &ArenaInner, root: NodeId) -> Result<u64> {
    let order = post_order_in(inner, &[root])?;
    let position: HashMap<NodeId, u64> = order
        .iter()
        .enumerate()
        .map(|(index, id)| (*id, index as u64))
        .collect();
    let mut hash = fnv1a_init();
    for id in &order {
        let node = inner.get(*id)?;
        hash = fnv1a_bytes(hash, node.op.name().as_bytes());
        for (key, value) in node.attributes.iter() {
            hash = fnv1a_bytes(hash, key.as_bytes());
            hash = fnv1a_bytes(hash, format!("{value:?}").as_bytes());
        }
        hash = fnv1a_u64(hash, node.inputs.len() as u64);
        for input in &node.inputs {
            hash = match (input.owner(), input.output_index()) {
                (Some(owner), Some(index)) => {
                    let producer = position.get(&owner).copied().unwrap_or(u64::MAX);
                    fnv1a_u64(fnv1a_u64(hash, producer), index as u64)
                }
                _ => fnv1a_bytes(hash, format!("{:?}", input.kind()).as_bytes()),
            };
            for dim in input.shape().dims() {
                hash = fnv1a_u64(hash, *dim as u64);
            }
        }
        if let Some(body) = &node.block {
            hash = fnv1a_bytes(hash, body.op_name.as_bytes());
            hash = fnv1a_u64(hash, fingerprint_in(inner, body.root)?);
        }
    }
    Ok(hash)
}
