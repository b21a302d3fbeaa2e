//! TACC `ibrun` offset arithmetic (spec §4.3 IBRUN; Open Question, preserved
//! verbatim): `OFFSET = min over slot of (first_core // len(core_map)) +
//! node_index * cores_per_node`, where `node_index` walks the full LRMS node
//! order (not just the nodes present in the slot), incrementing by
//! `cores_per_node` for every node regardless of whether it is in the slot.

use pilot_types::ContinuousSlot;

/// `full_node_order` must be the complete LRMS node list in discovery order.
/// Returns `None` if the slot contains no populated core maps (shouldn't
/// happen for a real allocation).
pub fn ibrun_offset(full_node_order: &[String], slot: &ContinuousSlot, cores_per_node: usize) -> Option<usize> {
    let mut offsets = Vec::new();
    let mut index = 0usize;
    for node_name in full_node_order {
        for slot_node in &slot.nodes {
            if &slot_node.uid == node_name || &slot_node.name == node_name {
                for core_map in &slot_node.core_map {
                    if !core_map.is_empty() {
                        offsets.push(core_map[0] / core_map.len() + index);
                    }
                }
            }
        }
        index += cores_per_node;
    }
    offsets.into_iter().min()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pilot_types::{Lfs, SlotNode};

    fn slot_node(name: &str, core_map: Vec<Vec<usize>>) -> SlotNode {
        SlotNode { name: name.into(), uid: name.into(), core_map, gpu_map: vec![], lfs: Lfs::default() }
    }

    #[test]
    fn offset_accounts_for_node_position() {
        let full_order = vec!["n0".to_string(), "n1".to_string(), "n2".to_string()];
        let slot = ContinuousSlot {
            nodes: vec![slot_node("n1", vec![vec![0, 1, 2, 3]])],
            cores_per_node: 16,
            gpus_per_node: 0,
            lm_info: None,
        };
        // index for n1 is 1*16=16, first_core/len = 0/4 = 0 -> offset 16
        assert_eq!(ibrun_offset(&full_order, &slot, 16), Some(16));
    }

    #[test]
    fn offset_takes_minimum_across_slot() {
        let full_order = vec!["n0".to_string(), "n1".to_string()];
        let slot = ContinuousSlot {
            nodes: vec![slot_node("n0", vec![vec![8, 9]]), slot_node("n1", vec![vec![0, 1]])],
            cores_per_node: 16,
            gpus_per_node: 0,
            lm_info: None,
        };
        // n0: 8/2 + 0 = 4 ; n1: 0/2 + 16 = 16 -> min is 4
        assert_eq!(ibrun_offset(&full_order, &slot, 16), Some(4));
    }
}
