//! Compute-unit description, directives, and the CU state machine (spec §3).

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::AgentError;
use crate::slot::Slot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessType {
    Posix,
    Mpi,
}

impl Default for ProcessType {
    fn default() -> Self {
        ProcessType::Posix
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ThreadType {
    Posix,
    OpenMp,
}

impl Default for ThreadType {
    fn default() -> Self {
        ThreadType::Posix
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DirectiveAction {
    Link,
    Copy,
    Move,
    Transfer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DirectiveState {
    Pending,
    Executing,
    Done,
    Failed,
}

/// A single staging instruction (spec §3 "Directive").
///
/// `source`/`target` are URLs: `file://`, `staging://` (relative to the
/// pilot's staging area), or an absolute path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Directive {
    pub source: String,
    pub target: String,
    pub action: DirectiveAction,
    pub state: DirectiveState,
}

impl Directive {
    pub fn new(source: impl Into<String>, target: impl Into<String>, action: DirectiveAction) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            action,
            state: DirectiveState::Pending,
        }
    }
}

/// The user-submitted CU description (spec §3 "CU description (input)").
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CuDescription {
    pub uid: String,
    pub executable: String,
    #[serde(default)]
    pub arguments: Vec<String>,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    #[serde(default = "one")]
    pub cpu_processes: usize,
    #[serde(default = "one")]
    pub cpu_threads: usize,
    #[serde(default)]
    pub cpu_process_type: ProcessType,
    #[serde(default)]
    pub cpu_thread_type: ThreadType,
    #[serde(default)]
    pub gpu_processes: usize,
    #[serde(default)]
    pub pre_exec: Vec<String>,
    #[serde(default)]
    pub post_exec: Vec<String>,
    #[serde(default)]
    pub stdout: Option<String>,
    #[serde(default)]
    pub stderr: Option<String>,
    #[serde(default)]
    pub input_staging: Vec<Directive>,
    #[serde(default)]
    pub output_staging: Vec<Directive>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

fn one() -> usize {
    1
}

impl CuDescription {
    /// Total core count this CU requests, accounting for threads-per-process
    /// when the thread type actually multiplexes cores (OpenMP).
    pub fn requested_cores(&self) -> usize {
        let threads = match self.cpu_thread_type {
            ThreadType::OpenMp => self.cpu_threads.max(1),
            ThreadType::Posix => 1,
        };
        self.cpu_processes.max(1) * threads
    }
}

/// The CU lifecycle (spec §3 "CU state machine").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CuState {
    New,
    PendingExecution,
    Allocating,
    StagingInput,
    Executing,
    StagingOutput,
    Done,
    Failed,
    Canceled,
}

impl CuState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, CuState::Done | CuState::Failed | CuState::Canceled)
    }

    /// States reachable in a single step from `self`. Cancellation is
    /// cooperative and may be observed from any non-terminal state (spec §5
    /// "Cancellation").
    pub fn valid_successors(&self) -> &'static [CuState] {
        use CuState::*;
        match self {
            New => &[PendingExecution],
            PendingExecution => &[Allocating, Canceled],
            Allocating => &[StagingInput, Executing, Failed, Canceled],
            StagingInput => &[Executing, Failed, Canceled],
            Executing => &[StagingOutput, Done, Failed, Canceled],
            StagingOutput => &[Done, Failed, Canceled],
            Done | Failed | Canceled => &[],
        }
    }

    pub fn can_transition_to(&self, next: CuState) -> bool {
        self.valid_successors().contains(&next)
    }
}

/// Runtime CU record tracked by the pipeline (spec §3 "CU record (runtime)").
#[derive(Debug, Clone)]
pub struct CuRecord {
    pub description: CuDescription,
    pub state: CuState,
    /// `(state, monotonic millis since agent start)`, appended on every
    /// transition; a prefix of a valid walk of the state machine (Testable
    /// Property 7).
    pub state_history: Vec<(CuState, u64)>,
    pub slot: Option<Slot>,
    pub started_at: Option<u64>,
    pub finished_at: Option<u64>,
    pub exit_code: Option<i32>,
    pub stdout_tail: String,
    pub stderr_tail: String,
    pub workdir: Option<PathBuf>,
    pub stdout_file: Option<PathBuf>,
    pub stderr_file: Option<PathBuf>,
}

impl CuRecord {
    pub fn new(description: CuDescription, now_ms: u64) -> Self {
        Self {
            description,
            state: CuState::New,
            state_history: vec![(CuState::New, now_ms)],
            slot: None,
            started_at: None,
            finished_at: None,
            exit_code: None,
            stdout_tail: String::new(),
            stderr_tail: String::new(),
            workdir: None,
            stdout_file: None,
            stderr_file: None,
        }
    }

    /// Transition to `next`, recording a timestamped history entry.
    /// Terminal states are sticky: once in a terminal state, any further
    /// transition request is rejected.
    pub fn transition(&mut self, next: CuState, now_ms: u64) -> Result<(), AgentError> {
        if self.state.is_terminal() {
            return Err(AgentError::InvalidTransition { from: self.state, to: next });
        }
        if !self.state.can_transition_to(next) {
            return Err(AgentError::InvalidTransition { from: self.state, to: next });
        }
        self.state = next;
        self.state_history.push((next, now_ms));
        Ok(())
    }

    pub fn uid(&self) -> &str {
        &self.description.uid
    }
}
