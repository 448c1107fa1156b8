//! Buffer assignment for execution plans.
//!
//! Every plan slot is mapped to a storage buffer. Leaves and pinned slots (requested
//! outputs plus everything backward needs) get a dedicated buffer; other intermediates
//! are assigned greedily in evaluation order, reusing a released buffer of the same
//! element count once the previous occupant's last consumer has run.

use std::collections::{BTreeSet, HashMap};

use super::plan::{PlanEntry, Slot, SlotId, SlotSource};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct StorageLayout {
    /// Buffer index for every slot.
    pub slot_buffers: Vec<usize>,
    pub buffer_count: usize,
    pub pinned: BTreeSet<SlotId>,
}

pub(crate) fn plan_storage(
    slots: &[Slot],
    entries: &[PlanEntry],
    pinned: BTreeSet<SlotId>,
    share: bool,
) -> StorageLayout {
    let mut last_use: Vec<Option<usize>> = vec![None; slots.len()];
    for (index, entry) in entries.iter().enumerate() {
        for &slot in &entry.inputs {
            last_use[slot] = Some(index);
        }
    }

    let mut slot_buffers = vec![usize::MAX; slots.len()];
    let mut buffer_count = 0;
    for (slot_id, slot) in slots.iter().enumerate() {
        if !matches!(slot.source, SlotSource::Computed(_)) {
            slot_buffers[slot_id] = buffer_count;
            buffer_count += 1;
        }
    }

    let mut free: HashMap<usize, Vec<usize>> = HashMap::new();
    let mut released = vec![false; slots.len()];
    for (index, entry) in entries.iter().enumerate() {
        for &slot in &entry.outputs {
            let reused = if share && !pinned.contains(&slot) {
                free.get_mut(&slots[slot].shape.num_elements())
                    .and_then(Vec::pop)
            } else {
                None
            };
            slot_buffers[slot] = reused.unwrap_or_else(|| {
                buffer_count += 1;
                buffer_count - 1
            });
        }
        if !share {
            continue;
        }
        for &slot in entry.inputs.iter().chain(entry.outputs.iter()) {
            if released[slot]
                || pinned.contains(&slot)
                || !matches!(slots[slot].source, SlotSource::Computed(_))
            {
                continue;
            }
            let dead = last_use[slot].map_or(true, |last| last <= index);
            if dead {
                released[slot] = true;
                free.entry(slots[slot].shape.num_elements())
                    .or_default()
                    .push(slot_buffers[slot]);
            }
        }
    }

    StorageLayout {
        slot_buffers,
        buffer_count,
        pinned,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Attributes, NodeId, PrimitiveOp, Variable};
    use crate::tensor::Shape;

    fn slot(shape: &[usize], source: SlotSource) -> Slot {
        Slot {
            variable: Variable::input(shape, "s"),
            shape: Shape::from(shape),
            source,
        }
    }

    fn entry(inputs: &[SlotId], outputs: &[SlotId]) -> PlanEntry {
        PlanEntry {
            node: NodeId(0),
            uid: "n".to_string(),
            op: PrimitiveOp::Negate,
            attributes: Attributes::new(),
            inputs: inputs.iter().copied().collect(),
            outputs: outputs.iter().copied().collect(),
            output_shapes: vec![Shape::new([4])],
            rng: None,
            last_rng: None,
            timestamp: 0,
        }
    }

    // x -> a -> b -> c -> d, all four elements wide.
    fn chain() -> (Vec<Slot>, Vec<PlanEntry>) {
        let slots = vec![
            slot(&[4], SlotSource::Input),
            slot(&[4], SlotSource::Computed(0)),
            slot(&[4], SlotSource::Computed(1)),
            slot(&[4], SlotSource::Computed(2)),
            slot(&[4], SlotSource::Computed(3)),
        ];
        let entries = vec![
            entry(&[0], &[1]),
            entry(&[1], &[2]),
            entry(&[2], &[3]),
            entry(&[3], &[4]),
        ];
        (slots, entries)
    }

    #[test]
    fn chain_reuses_released_buffers() {
        let (slots, entries) = chain();
        let layout = plan_storage(&slots, &entries, BTreeSet::from([4]), true);
        // a and c share, b gets its own while a is still live, d is pinned.
        assert_eq!(layout.slot_buffers[1], layout.slot_buffers[3]);
        assert_ne!(layout.slot_buffers[1], layout.slot_buffers[2]);
        assert_ne!(layout.slot_buffers[4], layout.slot_buffers[2]);
        assert_eq!(layout.buffer_count, 4);
    }

    #[test]
    fn sharing_disabled_gives_every_slot_a_buffer() {
        let (slots, entries) = chain();
        let layout = plan_storage(&slots, &entries, BTreeSet::new(), false);
        let distinct: BTreeSet<usize> = layout.slot_buffers.iter().copied().collect();
        assert_eq!(distinct.len(), slots.len());
    }

    #[test]
    fn pinned_slots_are_never_shared() {
        let (slots, entries) = chain();
        let layout = plan_storage(&slots, &entries, BTreeSet::from([1, 2, 3, 4]), true);
        let distinct: BTreeSet<usize> = layout.slot_buffers.iter().copied().collect();
        assert_eq!(distinct.len(), slots.len());
    }

    #[test]
    fn sizes_must_match_to_share() {
        let slots = vec![
            slot(&[4], SlotSource::Input),
            slot(&[4], SlotSource::Computed(0)),
            slot(&[1], SlotSource::Computed(1)),
            slot(&[1], SlotSource::Computed(2)),
        ];
        let entries = vec![entry(&[0], &[1]), entry(&[1], &[2]), entry(&[2], &[3])];
        let layout = plan_storage(&slots, &entries, BTreeSet::from([3]), true);
        assert_ne!(layout.slot_buffers[2], layout.slot_buffers[1]);
        assert_ne!(layout.slot_buffers[3], layout.slot_buffers[1]);
    }
}
