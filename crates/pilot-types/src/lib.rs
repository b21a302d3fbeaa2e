//! Shared data model for the pilot agent's execution engine.
//!
//! Every other crate in the workspace depends on this one for the resource
//! model (`node`), the opaque slot handles minted by the scheduler (`slot`),
//! the compute-unit and pilot data model (`cu`, `pilot`), and the error kinds
//! surfaced across worker boundaries (`error`).

pub mod cu;
pub mod error;
pub mod node;
pub mod pilot;
pub mod slot;

pub use cu::{
    CuDescription, CuRecord, CuState, Directive, DirectiveAction, DirectiveState, ProcessType,
    ThreadType,
};
pub use error::AgentError;
pub use node::{CoreState, Lfs, Node, TorusCoord, TorusNode};
pub use pilot::PilotState;
pub use slot::{ContinuousSlot, Slot, SlotNode, TorusShape, TorusSlot};

/// Sub-block sizes the torus scheduler is allowed to hand out (BG/Q style).
pub const SUPPORTED_TORUS_SUB_BLOCK_SIZES: &[u32] =
    &[1, 2, 4, 8, 16, 32, 64, 128, 256, 512];
