//! Continuous scheduler variant (spec §4.2): a flat per-node core array,
//! allocated single-node-first, falling back to a virtual cross-node vector.

use std::collections::VecDeque;

use pilot_types::{CoreState, ContinuousSlot, Node, SlotNode};

/// Serialized-size cap on the bounded release-history buffer (spec §4.2:
/// "append a compact snapshot to a bounded history (cap: 4 MiB serialized,
/// overwrite-last when full)").
const HISTORY_CAP_BYTES: usize = 4 * 1024 * 1024;

/// One historical release event, kept for diagnostics/slot-history replay.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SlotHistoryEntry {
    pub released_at: u64,
    pub total_cores: usize,
}

#[derive(Debug)]
pub struct ContinuousScheduler {
    nodes: Vec<Node>,
    history: VecDeque<SlotHistoryEntry>,
    history_bytes: usize,
}

impl ContinuousScheduler {
    pub fn new(nodes: Vec<Node>) -> Self {
        Self { nodes, history: VecDeque::new(), history_bytes: 0 }
    }

    pub fn cores_per_node(&self) -> usize {
        self.nodes.first().map(|n| n.cores_per_node).unwrap_or(0)
    }

    pub fn history(&self) -> impl Iterator<Item = &SlotHistoryEntry> {
        self.history.iter()
    }

    /// Allocate `cores_requested` cores, split across `processes` equally
    /// sized process groups (spec §4.2 Policy 1/2). Returns `None` (spec's
    /// `NONE`, not an error — *SchedulerExhausted* is the caller's concern)
    /// when no contiguous run of that length exists anywhere.
    pub fn allocate(&mut self, cores_requested: usize, processes: usize) -> Option<ContinuousSlot> {
        if cores_requested == 0 || processes == 0 {
            return None;
        }
        let cpn = self.cores_per_node();
        if cpn > 0 && cores_requested <= cpn {
            if let Some(slot) = self.allocate_single_node(cores_requested, processes) {
                return Some(slot);
            }
        }
        self.allocate_cross_node(cores_requested, processes)
    }

    /// Policy 1: first node with a contiguous FREE run of the requested
    /// length (node order, then intra-node left-to-right).
    fn allocate_single_node(&mut self, cores_requested: usize, processes: usize) -> Option<ContinuousSlot> {
        for node in &mut self.nodes {
            if let Some(start) = first_free_run(&node.cores, cores_requested) {
                for core in &mut node.cores[start..start + cores_requested] {
                    *core = CoreState::Busy;
                }
                let indices: Vec<usize> = (start..start + cores_requested).collect();
                let slot_node = SlotNode {
                    name: node.name.clone(),
                    uid: node.uid.clone(),
                    core_map: split_into_processes(&indices, processes),
                    gpu_map: vec![],
                    lfs: node.lfs.clone(),
                };
                return Some(ContinuousSlot {
                    nodes: vec![slot_node],
                    cores_per_node: node.cores_per_node,
                    gpus_per_node: node.gpus_per_node,
                    lm_info: None,
                });
            }
        }
        None
    }

    /// Policy 2: concatenate all cores into a single virtual vector (node
    /// order, then core index), find the first contiguous FREE run, and
    /// materialize as partial-first/full-middle/partial-last nodes.
    fn allocate_cross_node(&mut self, cores_requested: usize, processes: usize) -> Option<ContinuousSlot> {
        let mut offsets = Vec::with_capacity(self.nodes.len());
        let mut total = 0usize;
        for node in &self.nodes {
            offsets.push(total);
            total += node.cores.len();
        }
        if total < cores_requested {
            return None;
        }

        let virtual_free: Vec<bool> = self
            .nodes
            .iter()
            .flat_map(|n| n.cores.iter().map(|c| *c == CoreState::Free))
            .collect();
        let start = first_free_run_bool(&virtual_free, cores_requested)?;
        let end = start + cores_requested;

        let mut flat_indices: Vec<usize> = (start..end).collect();
        let cpn_default = self.cores_per_node();
        let mut slot_nodes = Vec::new();

        for (node_idx, node) in self.nodes.iter_mut().enumerate() {
            let node_start = offsets[node_idx];
            let node_end = node_start + node.cores.len();
            let taken: Vec<usize> = flat_indices
                .iter()
                .copied()
                .filter(|&g| g >= node_start && g < node_end)
                .map(|g| g - node_start)
                .collect();
            if taken.is_empty() {
                continue;
            }
            for &local in &taken {
                node.cores[local] = CoreState::Busy;
            }
            slot_nodes.push(SlotNode {
                name: node.name.clone(),
                uid: node.uid.clone(),
                core_map: vec![taken],
                gpu_map: vec![],
                lfs: node.lfs.clone(),
            });
        }
        flat_indices.clear();

        // Re-split process groups evenly across the full (possibly
        // multi-node) core set, rather than per node, since a process may
        // straddle node boundaries only at the granularity the caller asked
        // for a slot of `cores_requested` total cores.
        let all_cores: Vec<usize> = slot_nodes.iter().flat_map(|n| n.core_map[0].iter().copied()).collect();
        let groups = split_into_processes(&all_cores, processes);
        let mut group_iter = groups.into_iter();
        let mut remaining_nodes = Vec::with_capacity(slot_nodes.len());
        let mut cursor = 0usize;
        for slot_node in slot_nodes {
            let node_core_count = slot_node.core_map[0].len();
            let mut node_groups = Vec::new();
            while cursor < node_core_count {
                if let Some(g) = group_iter.next() {
                    cursor += g.len();
                    node_groups.push(g);
                } else {
                    break;
                }
            }
            remaining_nodes.push(SlotNode { core_map: node_groups, ..slot_node });
        }

        Some(ContinuousSlot {
            nodes: remaining_nodes,
            cores_per_node: cpn_default,
            gpus_per_node: 0,
            lm_info: None,
        })
    }

    /// Release a previously allocated slot and append a bounded history
    /// snapshot.
    pub fn release(&mut self, slot: &ContinuousSlot, now_ms: u64) {
        for slot_node in &slot.nodes {
            if let Some(node) = self.nodes.iter_mut().find(|n| n.uid == slot_node.uid) {
                for group in &slot_node.core_map {
                    for &idx in group {
                        if idx < node.cores.len() {
                            node.cores[idx] = CoreState::Free;
                        }
                    }
                }
            }
        }
        let entry = SlotHistoryEntry { released_at: now_ms, total_cores: slot.total_cores() };
        let entry_bytes = serde_json::to_vec(&entry).map(|v| v.len()).unwrap_or(64);
        while self.history_bytes + entry_bytes > HISTORY_CAP_BYTES {
            let Some(oldest) = self.history.pop_front() else { break };
            self.history_bytes = self.history_bytes.saturating_sub(
                serde_json::to_vec(&oldest).map(|v| v.len()).unwrap_or(64),
            );
        }
        self.history_bytes += entry_bytes;
        self.history.push_back(entry);
    }
}

fn first_free_run(cores: &[CoreState], len: usize) -> Option<usize> {
    if len == 0 || cores.len() < len {
        return None;
    }
    let mut run = 0usize;
    for (i, c) in cores.iter().enumerate() {
        if *c == CoreState::Free {
            run += 1;
            if run == len {
                return Some(i + 1 - len);
            }
        } else {
            run = 0;
        }
    }
    None
}

fn first_free_run_bool(free: &[bool], len: usize) -> Option<usize> {
    if len == 0 || free.len() < len {
        return None;
    }
    let mut run = 0usize;
    for (i, &f) in free.iter().enumerate() {
        if f {
            run += 1;
            if run == len {
                return Some(i + 1 - len);
            }
        } else {
            run = 0;
        }
    }
    None
}

/// Splits `cores` as evenly as possible into `processes` contiguous groups.
fn split_into_processes(cores: &[usize], processes: usize) -> Vec<Vec<usize>> {
    let processes = processes.max(1);
    let base = cores.len() / processes;
    let extra = cores.len() % processes;
    let mut out = Vec::with_capacity(processes);
    let mut cursor = 0usize;
    for p in 0..processes {
        let take = base + if p < extra { 1 } else { 0 };
        out.push(cores[cursor..cursor + take].to_vec());
        cursor += take;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn nodes(count: usize, cpn: usize) -> Vec<Node> {
        (0..count).map(|i| Node::new(format!("n{i}"), format!("n{i}"), cpn)).collect()
    }

    #[test]
    fn single_node_allocation_packs_first_fit() {
        let mut sched = ContinuousScheduler::new(nodes(2, 4));
        let slot = sched.allocate(2, 1).unwrap();
        assert_eq!(slot.nodes.len(), 1);
        assert_eq!(slot.nodes[0].name, "n0");
        assert_eq!(slot.total_cores(), 2);
    }

    #[test]
    fn cross_node_allocation_spans_nodes_when_needed() {
        let mut sched = ContinuousScheduler::new(nodes(2, 4));
        // exhaust n0 first so a larger request must span both nodes
        sched.allocate(4, 1).unwrap();
        let slot = sched.allocate(6, 1).unwrap();
        assert_eq!(slot.nodes.len(), 2);
        assert_eq!(slot.total_cores(), 6);
    }

    #[test]
    fn exhausted_allocation_returns_none() {
        let mut sched = ContinuousScheduler::new(nodes(1, 2));
        assert!(sched.allocate(3, 1).is_none());
    }

    #[test]
    fn release_frees_cores_for_reuse() {
        let mut sched = ContinuousScheduler::new(nodes(1, 4));
        let slot = sched.allocate(4, 1).unwrap();
        assert!(sched.allocate(1, 1).is_none());
        sched.release(&slot, 100);
        assert!(sched.allocate(4, 1).is_some());
        assert_eq!(sched.history().count(), 1);
    }

    #[test]
    fn process_groups_split_evenly() {
        let groups = split_into_processes(&[0, 1, 2, 3, 4], 2);
        assert_eq!(groups, vec![vec![0, 1, 2], vec![3, 4]]);
    }

    #[test]
    fn allocation_is_deterministic_in_node_order() {
        let mut a = ContinuousScheduler::new(nodes(3, 4));
        let mut b = ContinuousScheduler::new(nodes(3, 4));
        let sa = a.allocate(4, 1).unwrap();
        let sb = b.allocate(4, 1).unwrap();
        assert_eq!(sa.nodes[0].name, sb.nodes[0].name);
    }

    proptest::proptest! {
        /// Testable property (spec §8): a full allocate/release cycle never
        /// changes total free capacity, regardless of request shape.
        #[test]
        fn release_always_restores_total_free_capacity(
            node_count in 1usize..5,
            cpn in 1usize..9,
            cores_requested in 1usize..9,
            processes in 1usize..5,
        ) {
            let mut sched = ContinuousScheduler::new(nodes(node_count, cpn));
            let total = node_count * cpn;
            let free_before: usize = sched.nodes.iter().map(|n| n.cores.iter().filter(|c| **c == CoreState::Free).count()).sum();
            if let Some(slot) = sched.allocate(cores_requested, processes) {
                sched.release(&slot, 0);
                let free_after: usize = sched.nodes.iter().map(|n| n.cores.iter().filter(|c| **c == CoreState::Free).count()).sum();
                prop_assert_eq!(free_after, free_before);
                prop_assert_eq!(free_after, total);
            }
        }
    }
}
