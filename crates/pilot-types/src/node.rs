//! Node and torus-node resource descriptions (spec §3 "Node", "Torus node").

use serde::{Deserialize, Serialize};

/// Occupation of a single core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CoreState {
    Free,
    Busy,
}

/// Local filesystem scratch space advertised by a node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lfs {
    pub path: Option<String>,
    pub size: u64,
}

/// A single allocated node as discovered by the LRMS adapter.
///
/// Node list order is significant: the continuous scheduler uses it as the
/// deterministic tie-breaker for multi-node allocations (spec §4.2).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    pub uid: String,
    pub cores: Vec<CoreState>,
    pub cores_per_node: usize,
    pub gpus_per_node: usize,
    pub lfs: Lfs,
}

impl Node {
    pub fn new(name: impl Into<String>, uid: impl Into<String>, cores_per_node: usize) -> Self {
        Self {
            name: name.into(),
            uid: uid.into(),
            cores: vec![CoreState::Free; cores_per_node],
            cores_per_node,
            gpus_per_node: 0,
            lfs: Lfs::default(),
        }
    }

    pub fn free_cores(&self) -> usize {
        self.cores.iter().filter(|c| **c == CoreState::Free).count()
    }
}

/// Coordinates of a node in a 5-D torus (BG/Q A/B/C/D/E dimensions).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TorusCoord {
    pub a: i32,
    pub b: i32,
    pub c: i32,
    pub d: i32,
    pub e: i32,
}

/// A single node within an allocated torus block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TorusNode {
    pub index: usize,
    pub coord: TorusCoord,
    pub name: String,
    pub status: CoreState,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_node_starts_fully_free() {
        let n = Node::new("node-0001", "uid-0001", 16);
        assert_eq!(n.free_cores(), 16);
        assert!(n.cores.iter().all(|c| *c == CoreState::Free));
    }

    #[test]
    fn free_cores_counts_only_free() {
        let mut n = Node::new("node-0001", "uid-0001", 4);
        n.cores[0] = CoreState::Busy;
        n.cores[2] = CoreState::Busy;
        assert_eq!(n.free_cores(), 2);
    }
}
