//! Queue and command-channel plumbing (spec §5): workers communicate
//! exclusively through unbounded FIFO queues and a command channel, never by
//! reaching into another worker's internal state.

use crossbeam_channel::{unbounded, Receiver, Sender};

use pilot_store::{Collection, Query, Update};
use pilot_types::CuRecord;

/// Verbs recognized on the command channel (spec §4.8 "Control loop").
#[derive(Debug, Clone)]
pub enum Command {
    CancelPilot,
    CancelUnit(String),
    Keepalive,
}

/// `{cu, query, update}` consumed by the updater (spec §4.7).
#[derive(Debug, Clone)]
pub struct UpdateRequest {
    pub cu_uid: String,
    pub collection: Collection,
    pub query: Query,
    pub update: Update,
}

impl UpdateRequest {
    pub fn cu_state(record: &CuRecord) -> Self {
        let mut update = Update::new().set("state", format!("{:?}", record.state));
        if let Some(code) = record.exit_code {
            update = update.set("exit_code", code as i64);
        }
        if !record.stdout_tail.is_empty() {
            update = update.set("stdout_tail", record.stdout_tail.clone());
        }
        if !record.stderr_tail.is_empty() {
            update = update.set("stderr_tail", record.stderr_tail.clone());
        }
        Self {
            cu_uid: record.uid().to_string(),
            collection: Collection::Units,
            query: Query::new().eq("uid", record.uid()),
            update,
        }
    }
}

/// One `(sender, receiver)` pair per queue named in spec §4 (stage-in,
/// execution, stage-out, update) plus the command channel.
pub struct Pipeline {
    pub stagein_tx: Sender<CuRecord>,
    pub stagein_rx: Receiver<CuRecord>,
    pub execution_tx: Sender<CuRecord>,
    pub execution_rx: Receiver<CuRecord>,
    pub stageout_tx: Sender<CuRecord>,
    pub stageout_rx: Receiver<CuRecord>,
    pub update_tx: Sender<UpdateRequest>,
    pub update_rx: Receiver<UpdateRequest>,
    pub command_tx: Sender<Command>,
    pub command_rx: Receiver<Command>,
}

impl Default for Pipeline {
    fn default() -> Self {
        let (stagein_tx, stagein_rx) = unbounded();
        let (execution_tx, execution_rx) = unbounded();
        let (stageout_tx, stageout_rx) = unbounded();
        let (update_tx, update_rx) = unbounded();
        let (command_tx, command_rx) = unbounded();
        Self {
            stagein_tx,
            stagein_rx,
            execution_tx,
            execution_rx,
            stageout_tx,
            stageout_rx,
            update_tx,
            update_rx,
            command_tx,
            command_rx,
        }
    }
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Sleep used by a worker's cooperative loop when it found no work (spec
/// §4.5 step 5, default 1.0s).
pub const QUEUE_POLL_SLEEPTIME_MS: u64 = 1000;
