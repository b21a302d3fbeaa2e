//! Opaque slot handles (spec §3 "Slot (opaque)").
//!
//! A slot is minted by exactly one scheduler variant and interpreted by
//! exactly one launch-method family. Callers outside the scheduler that
//! minted it must treat the contents as opaque.

use serde::{Deserialize, Serialize};

use crate::node::{Lfs, TorusCoord};

/// Per-node core/gpu reservation within a continuous slot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlotNode {
    pub name: String,
    pub uid: String,
    /// One entry per process placed on this node; each inner vec is the set
    /// of core indices (within the node) reserved for that process.
    pub core_map: Vec<Vec<usize>>,
    pub gpu_map: Vec<usize>,
    pub lfs: Lfs,
}

/// Slot shape produced by the continuous scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContinuousSlot {
    pub nodes: Vec<SlotNode>,
    pub cores_per_node: usize,
    pub gpus_per_node: usize,
    pub lm_info: Option<String>,
}

impl ContinuousSlot {
    /// Total number of cores held by this slot across all nodes.
    pub fn total_cores(&self) -> usize {
        self.nodes
            .iter()
            .map(|n| n.core_map.iter().map(|m| m.len()).sum::<usize>())
            .sum()
    }

    /// Hostnames repeated once per process placed on them, in slot order.
    /// This is the host list most MPI-style launchers expect (`-host h1,h1,h2`).
    pub fn host_list(&self) -> Vec<String> {
        self.nodes
            .iter()
            .flat_map(|n| std::iter::repeat(n.name.clone()).take(n.core_map.len()))
            .collect()
    }
}

/// Sub-block shape requested/returned by the torus scheduler, one size per
/// torus dimension (BG/Q: A, B, C, D, E).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TorusShape {
    pub a: u32,
    pub b: u32,
    pub c: u32,
    pub d: u32,
    pub e: u32,
}

impl TorusShape {
    pub fn node_count(&self) -> u64 {
        self.a as u64 * self.b as u64 * self.c as u64 * self.d as u64 * self.e as u64
    }
}

/// A torus slot names the corner coordinate and the sub-block shape; the
/// allocating scheduler is the sole owner of the coordinate-to-node mapping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TorusSlot {
    pub corner: TorusCoord,
    pub shape: TorusShape,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Slot {
    Continuous(ContinuousSlot),
    Torus(TorusSlot),
}

impl Slot {
    pub fn as_continuous(&self) -> Option<&ContinuousSlot> {
        match self {
            Slot::Continuous(s) => Some(s),
            Slot::Torus(_) => None,
        }
    }

    pub fn as_torus(&self) -> Option<&TorusSlot> {
        match self {
            Slot::Torus(s) => Some(s),
            Slot::Continuous(_) => None,
        }
    }
}
