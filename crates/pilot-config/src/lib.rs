//! Agent configuration loading (spec §6: "Agent configuration file (JSON,
//! read from `./agent_0.cfg`)"). Shaped after the teacher's config crate
//! (`ConfigFile`/`load_from`/`discover`) with TOML swapped for JSON, since
//! the spec mandates a JSON document rather than leaving the format open.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::info;

use pilot_types::AgentError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubAgentTarget {
    Local,
    Node,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubAgentConfig {
    pub target: SubAgentTarget,
}

/// The agent_0.cfg schema (spec §6).
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    pub pilot_id: String,
    pub session_id: String,
    /// Pilot walltime in minutes (spec §4.8 "Walltime check").
    pub runtime: u64,
    pub cores: usize,
    pub lrms: String,
    pub scheduler: String,
    pub spawner: String,
    pub task_launch_method: String,
    pub mpi_launch_method: String,
    pub agent_launch_method: String,
    #[serde(default)]
    pub agents: BTreeMap<String, SubAgentConfig>,
    #[serde(default = "default_db_poll_sleeptime")]
    pub db_poll_sleeptime: f64,
    pub pilot_sandbox: PathBuf,
}

fn default_db_poll_sleeptime() -> f64 {
    1.0
}

/// Default config path: `./agent_0.cfg` (spec §6), unless overridden by the
/// `--config` CLI flag.
pub fn discover() -> PathBuf {
    PathBuf::from("agent_0.cfg")
}

/// Unlike the teacher's `core-config::load_from`, a missing or malformed
/// agent configuration is fatal (spec §7 `MisconfiguredEnvironment`):
/// there is no sensible default for `pilot_id`/`session_id`/`lrms`.
pub fn load_from(path: Option<&Path>) -> Result<AgentConfig, AgentError> {
    let path = path.map(Path::to_path_buf).unwrap_or_else(discover);
    let content = fs::read_to_string(&path)
        .map_err(|e| AgentError::MisconfiguredEnvironment(format!("cannot read {}: {e}", path.display())))?;
    let config: AgentConfig = serde_json::from_str(&content)
        .map_err(|e| AgentError::MisconfiguredEnvironment(format!("cannot parse {}: {e}", path.display())))?;
    info!(
        target: "config",
        pilot_id = %config.pilot_id,
        session_id = %config.session_id,
        lrms = %config.lrms,
        cores = config.cores,
        "agent_config_loaded"
    );
    Ok(config)
}
