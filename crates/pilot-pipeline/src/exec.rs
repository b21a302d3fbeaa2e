//! Exec worker (spec §4.5): owns the running-task set, drains the command
//! channel, pops CUs from the execution queue, spawns them, polls running
//! children, and finalizes terminal transitions.

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;

use crossbeam_channel::{Receiver, Sender};

use pilot_launch::LaunchMethod;
use pilot_scheduler::Scheduler;
use pilot_spawner::{tail, ProcessHandle};
use pilot_types::{AgentError, CuRecord, CuState};

use crate::queues::{Command, UpdateRequest};

struct RunningTask {
    record: CuRecord,
    handle: ProcessHandle,
}

pub struct ExecWorker {
    scheduler: Scheduler,
    task_launcher: LaunchMethod,
    mpi_launcher: LaunchMethod,
    sandbox_root: PathBuf,
    base_environment: BTreeMap<String, String>,
    running: Vec<RunningTask>,
    cancel_set: HashSet<String>,
    cancel_all: bool,
}

impl ExecWorker {
    pub fn new(
        scheduler: Scheduler,
        task_launcher: LaunchMethod,
        mpi_launcher: LaunchMethod,
        sandbox_root: PathBuf,
        base_environment: BTreeMap<String, String>,
    ) -> Self {
        Self {
            scheduler,
            task_launcher,
            mpi_launcher,
            sandbox_root,
            base_environment,
            running: Vec::new(),
            cancel_set: HashSet::new(),
            cancel_all: false,
        }
    }

    pub fn running_count(&self) -> usize {
        self.running.len()
    }

    /// Marks every currently and subsequently running task as cancel-requested
    /// (spec §4.8 `cancel_pilot`, and shutdown/walltime expiry): the next
    /// `poll_running` call kills them all rather than waiting for natural exit.
    pub fn cancel_all(&mut self) {
        self.cancel_all = true;
    }

    /// Step 1: drain the command channel, recording `cancel(cu_uid)`
    /// requests, or `cancel_all` on `CancelPilot`.
    pub fn drain_commands(&mut self, command_rx: &Receiver<Command>) {
        while let Ok(cmd) = command_rx.try_recv() {
            match cmd {
                Command::CancelUnit(uid) => {
                    self.cancel_set.insert(uid);
                }
                Command::CancelPilot => self.cancel_all(),
                Command::Keepalive => {}
            }
        }
    }

    /// Step 2: try to pop one CU from the execution queue and start it.
    /// Returns `true` if work was done (spec §4.5 step 5: "If neither step
    /// did work, sleep").
    pub fn try_pop_and_start(
        &mut self,
        execution_rx: &Receiver<CuRecord>,
        execution_tx: &Sender<CuRecord>,
        update_tx: &Sender<UpdateRequest>,
        now_ms: u64,
    ) -> bool {
        let Ok(mut record) = execution_rx.try_recv() else {
            return false;
        };

        let cores = record.description.requested_cores();
        let processes = record.description.cpu_processes.max(1);

        let Some(slot) = self.scheduler.allocate(cores, processes) else {
            // SchedulerExhausted is not an error (spec §7): re-queue at the tail.
            let _ = execution_tx.send(record);
            return false;
        };

        let uid = record.uid().to_string();
        let workdir = self.sandbox_root.join(format!("unit-{uid}"));
        let launcher = if pilot_launch::is_mpi(&record.description) { &self.mpi_launcher } else { &self.task_launcher };
        let script_hop = workdir.join("launch.sh").display().to_string();

        let construction = launcher.construct(&record.description, &slot, &script_hop);
        let environment = crate::env_derive::derive_cu_environment(&self.base_environment);

        let spawn_result = construction.and_then(|(outer_cmd, inner_cmd)| {
            pilot_spawner::spawn(
                &workdir,
                &outer_cmd,
                inner_cmd.as_deref(),
                &record.description.pre_exec,
                &record.description.post_exec,
                &environment,
            )
        });

        match spawn_result {
            Ok(handle) => {
                record.slot = Some(slot);
                record.started_at = Some(now_ms);
                record.workdir = Some(workdir);
                record.stdout_file = Some(handle.stdout_path.clone());
                record.stderr_file = Some(handle.stderr_path.clone());
                let _ = record.transition(CuState::Executing, now_ms);
                let _ = update_tx.send(UpdateRequest::cu_state(&record));
                self.running.push(RunningTask { record, handle });
            }
            Err(e) => {
                self.scheduler.release(&slot, now_ms);
                record.stderr_tail = e.to_string();
                let _ = record.transition(CuState::Failed, now_ms);
                let _ = update_tx.send(UpdateRequest::cu_state(&record));
                tracing::warn!(target: "exec", uid = %uid, error = %e, "spawn_failed");
            }
        }
        true
    }

    /// Step 3/4: walk the running set, poll each child, finalize terminal
    /// ones. Returns `true` if any progress was made.
    pub fn poll_running(&mut self, stageout_tx: &Sender<CuRecord>, update_tx: &Sender<UpdateRequest>, now_ms: u64) -> bool {
        let mut progressed = false;
        let mut finished_indices = Vec::new();

        for (i, task) in self.running.iter_mut().enumerate() {
            let uid = task.record.uid().to_string();
            let cancel_requested = self.cancel_all || self.cancel_set.contains(&uid);

            match task.handle.poll() {
                Ok(None) => {
                    if cancel_requested {
                        task.handle.kill();
                        task.record.exit_code = None;
                        finished_indices.push((i, CuState::Canceled));
                        progressed = true;
                    }
                }
                Ok(Some(code)) => {
                    task.record.exit_code = Some(code);
                    if code != 0 {
                        finished_indices.push((i, CuState::Failed));
                    } else if !task.record.description.output_staging.is_empty() {
                        finished_indices.push((i, CuState::StagingOutput));
                    } else {
                        finished_indices.push((i, CuState::Done));
                    }
                    progressed = true;
                }
                Err(_) => {
                    finished_indices.push((i, CuState::Failed));
                    progressed = true;
                }
            }
        }

        for (i, state) in finished_indices.into_iter().rev() {
            let RunningTask { mut record, handle } = self.running.remove(i);
            if let Some(slot) = record.slot.take() {
                self.scheduler.release(&slot, now_ms);
            }
            if let Some(path) = &record.stdout_file {
                record.stdout_tail = tail::read_tail(path, tail::MAX_IO_LOGLENGTH);
            }
            if let Some(path) = &record.stderr_file {
                record.stderr_tail = tail::read_tail(path, tail::MAX_IO_LOGLENGTH);
            }
            record.finished_at = Some(now_ms);
            self.cancel_set.remove(record.uid());
            let _ = record.transition(state, now_ms);

            if state == CuState::StagingOutput {
                let _ = update_tx.send(UpdateRequest::cu_state(&record));
                let _ = stageout_tx.send(record);
            } else {
                let _ = update_tx.send(UpdateRequest::cu_state(&record));
            }
            drop(handle);
        }

        progressed
    }
}

/// Surfaces worker-internal failures that must fail the whole pilot (spec
/// §4.5 "Failure modes": "worker-internal exceptions cause the worker to
/// signal the supervisor to fail the pilot").
pub fn is_pilot_fatal_exec_error(err: &AgentError) -> bool {
    err.is_pilot_fatal()
}
