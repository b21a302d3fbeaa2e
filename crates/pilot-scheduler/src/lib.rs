//! Scheduler (spec §4.2): maintains the per-core free/busy map and hands out
//! opaque slot handles. Two variants, continuous and torus, behind a tagged
//! enum (spec §9: "tagged variants with a common operation set").

pub mod continuous;
pub mod torus;

use pilot_types::{Slot, TorusShape};

pub use continuous::{ContinuousScheduler, SlotHistoryEntry};
pub use torus::TorusScheduler;

#[derive(Debug)]
pub enum Scheduler {
    Continuous(ContinuousScheduler),
    Torus(TorusScheduler),
}

impl Scheduler {
    /// Allocates a slot sized to a CU's process/thread request. `processes`
    /// is ignored by the torus variant, which only ever allocates whole
    /// nodes (spec §4.3 RUNJOB: "demands `cores % cores_per_node == 0`").
    pub fn allocate(&mut self, cores_requested: usize, processes: usize) -> Option<Slot> {
        match self {
            Scheduler::Continuous(s) => s.allocate(cores_requested, processes).map(Slot::Continuous),
            Scheduler::Torus(s) => s.allocate(cores_requested).map(Slot::Torus),
        }
    }

    pub fn release(&mut self, slot: &Slot, now_ms: u64) {
        match (self, slot) {
            (Scheduler::Continuous(s), Slot::Continuous(cs)) => s.release(cs, now_ms),
            (Scheduler::Torus(s), Slot::Torus(ts)) => s.release(ts),
            _ => {
                tracing::error!(target: "scheduler", "release called with mismatched slot/scheduler variant");
            }
        }
    }
}

/// Looks up the torus shape for a given sub-block node count, as the torus
/// scheduler does internally; exposed so launch methods (RUNJOB) can report
/// the shape string without reaching back into scheduler internals.
pub fn shape_for_node_count(
    shapes: &std::collections::BTreeMap<u32, TorusShape>,
    node_count: u32,
) -> Option<TorusShape> {
    shapes.get(&node_count).copied()
}
