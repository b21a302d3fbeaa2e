//! Derives the environment a spawned CU inherits from the agent's own
//! process environment (SPEC_FULL §10 "CU environment derivation", grounded
//! on `ExecutionEnvironment._populate_cu_environment`): undoes virtualenv
//! activation so child tasks do not inherit the agent's interpreter
//! environment.

use std::collections::BTreeMap;

/// Mimics what virtualenv's `deactivate` would do to the agent's own
/// environment before handing it to a spawned CU.
pub fn derive_cu_environment(agent_env: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    let mut env = agent_env.clone();

    if let Some(old_path) = env.remove("_OLD_VIRTUAL_PATH") {
        env.insert("PATH".to_string(), old_path);
    }
    if let Some(old_home) = env.remove("_OLD_VIRTUAL_PYTHONHOME") {
        env.insert("PYTHON_HOME".to_string(), old_home);
    }
    if let Some(old_ps1) = env.remove("_OLD_VIRTUAL_PS1") {
        env.insert("PS1".to_string(), old_ps1);
    }
    env.remove("VIRTUAL_ENV");

    env
}

/// Snapshots the agent's real process environment into a map, for callers
/// that want `derive_cu_environment` without touching `std::env` directly in
/// their own logic (keeps the derivation pure and testable).
pub fn snapshot_process_environment() -> BTreeMap<String, String> {
    std::env::vars().collect()
}
