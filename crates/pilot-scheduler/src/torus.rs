//! Torus scheduler variant (spec §4.2): a BG/Q-style 5-D sub-block allocator.

use std::collections::BTreeMap;

use pilot_types::{CoreState, TorusNode, TorusShape, TorusSlot, SUPPORTED_TORUS_SUB_BLOCK_SIZES};

#[derive(Debug)]
pub struct TorusScheduler {
    nodes: Vec<TorusNode>,
    cores_per_node: usize,
    sub_block_shapes: BTreeMap<u32, TorusShape>,
}

impl TorusScheduler {
    pub fn new(
        nodes: Vec<TorusNode>,
        cores_per_node: usize,
        sub_block_shapes: BTreeMap<u32, TorusShape>,
    ) -> Self {
        Self { nodes, cores_per_node, sub_block_shapes }
    }

    /// `allocate`: round up to a multiple of `cores_per_node`, reject sizes
    /// outside the supported sub-block set, scan in steps of `num_nodes` for
    /// the first all-FREE window (spec §4.2 Torus variant). Returns `None`
    /// both when the size is unsupported and when no window is free — the
    /// caller treats both as *SchedulerExhausted* and re-queues (spec §7).
    pub fn allocate(&mut self, cores_requested: usize) -> Option<TorusSlot> {
        if self.cores_per_node == 0 || self.nodes.is_empty() {
            return None;
        }
        let rounded = round_up(cores_requested, self.cores_per_node);
        let num_nodes = (rounded / self.cores_per_node).max(1);
        if !SUPPORTED_TORUS_SUB_BLOCK_SIZES.contains(&(num_nodes as u32)) {
            return None;
        }
        let shape = *self.sub_block_shapes.get(&(num_nodes as u32))?;

        let mut offset = 0usize;
        while offset + num_nodes <= self.nodes.len() {
            let window = &self.nodes[offset..offset + num_nodes];
            if window.iter().all(|n| n.status == CoreState::Free) {
                let corner = window[0].coord;
                for n in &mut self.nodes[offset..offset + num_nodes] {
                    n.status = CoreState::Busy;
                }
                return Some(TorusSlot { corner, shape });
            }
            offset += num_nodes;
        }
        None
    }

    /// `release(corner, shape)`: compute offset from corner, free
    /// `shape.node_count()` consecutive entries.
    pub fn release(&mut self, slot: &TorusSlot) {
        let Some(start) = self.nodes.iter().position(|n| n.coord == slot.corner) else {
            return;
        };
        let count = slot.shape.node_count() as usize;
        for n in self.nodes.iter_mut().skip(start).take(count) {
            n.status = CoreState::Free;
        }
    }
}

fn round_up(value: usize, multiple: usize) -> usize {
    if multiple == 0 {
        return value;
    }
    value.div_ceil(multiple) * multiple
}

#[cfg(test)]
mod tests {
    use super::*;
    use pilot_types::TorusCoord;

    fn flat_nodes(count: usize) -> Vec<TorusNode> {
        (0..count)
            .map(|i| TorusNode {
                index: i,
                coord: TorusCoord { a: i as i32, b: 0, c: 0, d: 0, e: 0 },
                name: format!("n{i}"),
                status: CoreState::Free,
            })
            .collect()
    }

    fn shapes() -> BTreeMap<u32, TorusShape> {
        let mut m = BTreeMap::new();
        m.insert(1, TorusShape { a: 1, b: 1, c: 1, d: 1, e: 1 });
        m.insert(2, TorusShape { a: 2, b: 1, c: 1, d: 1, e: 1 });
        m.insert(4, TorusShape { a: 4, b: 1, c: 1, d: 1, e: 1 });
        m
    }

    #[test]
    fn allocates_first_free_window() {
        let mut sched = TorusScheduler::new(flat_nodes(8), 16, shapes());
        let slot = sched.allocate(32).unwrap();
        assert_eq!(slot.shape.node_count(), 2);
        assert_eq!(slot.corner.a, 0);
    }

    #[test]
    fn offset_is_multiple_of_subblock_size() {
        let mut sched = TorusScheduler::new(flat_nodes(8), 16, shapes());
        let first = sched.allocate(32).unwrap();
        let second = sched.allocate(32).unwrap();
        assert_eq!(first.corner.a % 2, 0);
        assert_eq!(second.corner.a % 2, 0);
        assert_ne!(first.corner.a, second.corner.a);
    }

    #[test]
    fn unsupported_size_is_rejected() {
        let mut sched = TorusScheduler::new(flat_nodes(8), 16, shapes());
        // 3 nodes worth of cores is not in the supported sub-block set
        assert!(sched.allocate(3 * 16).is_none());
    }

    #[test]
    fn exhausted_block_returns_none() {
        let mut sched = TorusScheduler::new(flat_nodes(4), 16, shapes());
        sched.allocate(64).unwrap();
        assert!(sched.allocate(16).is_none());
    }

    #[test]
    fn release_frees_window_for_reuse() {
        let mut sched = TorusScheduler::new(flat_nodes(4), 16, shapes());
        let slot = sched.allocate(64).unwrap();
        assert!(sched.allocate(16).is_none());
        sched.release(&slot);
        assert!(sched.allocate(64).is_some());
    }
}
