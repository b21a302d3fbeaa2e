//! Agent execution pipeline (spec §4): the queues and workers that turn a
//! `PENDING_EXECUTION` compute unit into a terminal state, plus the
//! supervisor that wires LRMS discovery, the scheduler, and launch methods
//! together at startup.

pub mod env_derive;
pub mod exec;
pub mod queues;
pub mod stage;
pub mod supervisor;
pub mod updater;

pub use exec::ExecWorker;
pub use queues::{Command, Pipeline, UpdateRequest, QUEUE_POLL_SLEEPTIME_MS};
pub use stage::{FileTransfer, StageKind, UnavailableFileTransfer};
pub use supervisor::{startup, PilotState, StartupContext, WalltimeClock};
pub use updater::Updater;
