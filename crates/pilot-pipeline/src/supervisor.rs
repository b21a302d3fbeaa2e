//! Agent supervisor (spec §4.8) and sub-agent supervision (spec §4.9):
//! startup sequencing, the control loop that pulls new CUs off the store,
//! walltime enforcement, and sub-agent liveness tracking.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use pilot_config::AgentConfig;
use pilot_launch::{LaunchMethod, LaunchMethodKind};
use pilot_rm::{EnvSource, Lrms};
use pilot_scheduler::{ContinuousScheduler, Scheduler, TorusScheduler};
use pilot_store::{Collection, CoordinationStore, Query, Update};
use pilot_types::{AgentError, CuDescription, CuRecord, CuState};

use crate::queues::{Command, Pipeline};

/// Pilot-level lifecycle states (spec §3 "Pilot state machine"), shared with
/// the rest of the store-facing surface rather than duplicated per crate.
pub use pilot_types::PilotState;

/// Everything the control loop needs to mint a fresh sub-agent or launch
/// method: the discovered resource set plus the three configured launch
/// methods (spec §4.8 "Startup sequencing").
#[derive(Debug)]
pub struct StartupContext {
    pub scheduler: Scheduler,
    pub task_launcher: LaunchMethod,
    pub mpi_launcher: LaunchMethod,
    pub agent_launcher: LaunchMethod,
    pub full_node_order: Vec<String>,
    pub cores_per_node: usize,
}

/// Runs LRMS discovery, builds the matching scheduler variant, and
/// resolves every configured launch method (spec §4.8 steps 1-4: "parse
/// config, instantiate LRMS adapter, build scheduler, instantiate launch
/// methods").
pub fn startup(config: &AgentConfig, env: &dyn EnvSource) -> Result<StartupContext, AgentError> {
    let lrms = Lrms::from_name(&config.lrms)
        .ok_or_else(|| AgentError::MisconfiguredEnvironment(format!("unknown lrms {:?}", config.lrms)))?;

    let discovery = pilot_rm::discover(lrms, config.cores, env)?;
    let full_node_order: Vec<String> = discovery.nodes.iter().map(|n| n.name.clone()).collect();
    let cores_per_node = discovery.cores_per_node;

    let scheduler = match config.scheduler.to_ascii_uppercase().as_str() {
        "CONTINUOUS" => Scheduler::Continuous(ContinuousScheduler::new(discovery.nodes)),
        "TORUS" => {
            let torus = discovery
                .torus
                .ok_or_else(|| AgentError::MisconfiguredEnvironment("TORUS scheduler requires a BG/Q allocation".into()))?;
            Scheduler::Torus(TorusScheduler::new(torus.nodes, cores_per_node, torus.sub_block_shapes))
        }
        other => return Err(AgentError::MisconfiguredEnvironment(format!("unknown scheduler {other:?}"))),
    };

    let bgq_block = None;
    let kind_for = |name: &str| -> Result<LaunchMethodKind, AgentError> {
        LaunchMethodKind::from_name(name)
            .ok_or_else(|| AgentError::MisconfiguredEnvironment(format!("unknown launch method {name:?}")))
    };

    let task_launcher =
        LaunchMethod::configure(kind_for(&config.task_launch_method)?, full_node_order.clone(), cores_per_node, bgq_block.clone())?;
    let mpi_launcher =
        LaunchMethod::configure(kind_for(&config.mpi_launch_method)?, full_node_order.clone(), cores_per_node, bgq_block.clone())?;
    let agent_launcher =
        LaunchMethod::configure(kind_for(&config.agent_launch_method)?, full_node_order.clone(), cores_per_node, bgq_block)?;

    Ok(StartupContext { scheduler, task_launcher, mpi_launcher, agent_launcher, full_node_order, cores_per_node })
}

/// Sub-agent process liveness tracking (spec §4.9): any dead child fails
/// the whole pilot.
pub struct SubAgentHandle {
    pub name: String,
    pub alive: Arc<AtomicBool>,
}

pub fn any_subagent_died(handles: &[SubAgentHandle]) -> Option<&str> {
    handles.iter().find(|h| !h.alive.load(Ordering::SeqCst)).map(|h| h.name.as_str())
}

/// Pulls a batch of `PENDING_EXECUTION` CUs off the store (spec §4.8
/// "Control loop" step: "poll the store for PENDING_EXECUTION units"),
/// mints sandbox dirs, and routes each to stage-in or straight to
/// execution depending on whether it has input directives.
pub fn intake_pending_units(
    store: &dyn CoordinationStore,
    pilot_id: &str,
    now_ms: u64,
) -> Result<Vec<CuRecord>, AgentError> {
    let docs = store.find(
        Collection::Units,
        &Query::new().eq("pilot_id", pilot_id).eq("state", "PendingExecution"),
    )?;

    let mut records = Vec::new();
    for doc in docs {
        let description: CuDescription = serde_json::from_value(serde_json::Value::Object(
            doc.into_iter().collect(),
        ))
        .map_err(|e| AgentError::StoreUnreachable(format!("malformed CU document: {e}")))?;
        let mut record = CuRecord::new(description, now_ms);
        record.transition(CuState::Allocating, now_ms).ok();
        records.push(record);
    }
    Ok(records)
}

pub fn route_after_allocating(record: CuRecord, pipeline: &Pipeline, now_ms: u64) {
    let mut record = record;
    if record.description.input_staging.is_empty() {
        let _ = record.transition(CuState::Executing, now_ms);
        let _ = pipeline.execution_tx.send(record);
    } else {
        let _ = record.transition(CuState::StagingInput, now_ms);
        let _ = pipeline.stagein_tx.send(record);
    }
}

/// Control-loop commands recognized against the store (spec §4.8
/// "cancel_pilot", "cancel_unit(uid)", "keepalive").
pub fn poll_commands(store: &dyn CoordinationStore, pilot_id: &str) -> Result<Vec<Command>, AgentError> {
    let docs = store.find(Collection::Pilots, &Query::new().eq("uid", pilot_id))?;
    let mut commands = Vec::new();
    for doc in docs {
        if let Some(serde_json::Value::Array(pending)) = doc.get("pending_commands") {
            for cmd in pending {
                match cmd.as_str() {
                    Some("cancel_pilot") => commands.push(Command::CancelPilot),
                    Some("keepalive") => commands.push(Command::Keepalive),
                    Some(other) if other.starts_with("cancel_unit:") => {
                        commands.push(Command::CancelUnit(other.trim_start_matches("cancel_unit:").to_string()))
                    }
                    _ => {}
                }
            }
        }
    }
    Ok(commands)
}

/// Walltime check (spec §4.8): `runtime` is in minutes; expiry moves the
/// pilot to `Done`, never `Failed` (spec §7 `WalltimeExpired`).
pub struct WalltimeClock {
    start: Instant,
    limit: Duration,
}

impl WalltimeClock {
    pub fn new(runtime_minutes: u64) -> Self {
        Self { start: Instant::now(), limit: Duration::from_secs(runtime_minutes * 60) }
    }

    pub fn expired(&self) -> bool {
        self.start.elapsed() >= self.limit
    }
}

/// Stamps the pilot document LAUNCHING as the very first startup step
/// (spec §4.8). An idempotent write rather than a validated transition: the
/// submitting side is expected to have already created the document in this
/// state, but the agent re-asserts it before resource discovery begins.
pub fn mark_launching(store: &dyn CoordinationStore, pilot_id: &str) -> Result<(), AgentError> {
    let state_name = format!("{:?}", PilotState::Launching);
    store.update(Collection::Pilots, &Query::new().eq("uid", pilot_id), &Update::new().set("state", state_name))?;
    Ok(())
}

/// Writes a pilot state transition to the store. Logs (but does not reject)
/// a transition the shared state machine wouldn't normally allow, since a
/// subagent death or fatal store error can force a jump straight to a
/// terminal state from anywhere (spec §3 "Pilot state machine").
pub fn set_pilot_state(store: &dyn CoordinationStore, pilot_id: &str, from: PilotState, to: PilotState) -> Result<(), AgentError> {
    if !from.can_transition_to(to) {
        tracing::warn!(target: "supervisor", pilot_id, ?from, ?to, "forced_pilot_transition");
    }
    let state_name = format!("{to:?}");
    store.update(Collection::Pilots, &Query::new().eq("uid", pilot_id), &Update::new().set("state", state_name.clone()))?;
    tracing::info!(target: "supervisor", pilot_id, state = %state_name, "pilot_state_written");
    Ok(())
}

/// Marks the pilot document terminal in the store (spec §4.8 "on shutdown,
/// write final pilot state").
pub fn finalize_pilot(store: &dyn CoordinationStore, pilot_id: &str, from: PilotState, state: PilotState) -> Result<(), AgentError> {
    set_pilot_state(store, pilot_id, from, state)?;
    tracing::info!(target: "supervisor", pilot_id, state = ?state, "pilot_finalized");
    Ok(())
}

/// Agent-side environment snapshot handed to every spawned CU, derived
/// once at startup (spec §4.8 step: "derive the CU base environment").
pub fn base_environment() -> BTreeMap<String, String> {
    crate::env_derive::derive_cu_environment(&crate::env_derive::snapshot_process_environment())
}
