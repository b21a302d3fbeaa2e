//! Spawner (spec §4.4): materializes a launch script, executes it as a
//! child process, captures stdout/stderr, exposes a poll handle. Only the
//! `POPEN` variant is implemented; `PTY` is named in the spec but is not
//! required (spec §4.4: "only POPEN is required").

pub mod script;
pub mod tail;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};

use pilot_types::AgentError;

pub struct ProcessHandle {
    child: Child,
    pub stdout_path: PathBuf,
    pub stderr_path: PathBuf,
}

impl ProcessHandle {
    /// `poll() -> exit_code | NONE` (spec §4.4 step 6).
    pub fn poll(&mut self) -> Result<Option<i32>, AgentError> {
        match self.child.try_wait() {
            Ok(Some(status)) => Ok(Some(status.code().unwrap_or(-1))),
            Ok(None) => Ok(None),
            Err(e) => Err(AgentError::SpawnFailure(format!("poll failed: {e}"))),
        }
    }

    /// Best-effort process-group kill (spec §5: "a running child receives a
    /// process-group kill").
    pub fn kill(&mut self) {
        let pid = self.child.id();
        #[cfg(unix)]
        {
            let _ = Command::new("kill").arg("-TERM").arg(format!("-{pid}")).status();
        }
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// `spawn(task, launcher, env) -> proc_handle` (spec §4.4).
///
/// `inner_cmd`, when present, is the real task command; it is written into
/// the generated launch script, and `outer_cmd` (e.g. an `ssh host ...`
/// invocation referencing that script's path) is the command actually
/// spawned. When absent, `outer_cmd` itself is written into the script and
/// run directly (spec §4.3 "script-hop launchers").
pub fn spawn(
    workdir: &Path,
    outer_cmd: &str,
    inner_cmd: Option<&str>,
    pre_exec: &[String],
    post_exec: &[String],
    environment: &BTreeMap<String, String>,
) -> Result<ProcessHandle, AgentError> {
    let script_body = inner_cmd.unwrap_or(outer_cmd);
    let script_path = script::write_executable(workdir, pre_exec, environment, script_body, post_exec)?;

    let stdout_path = workdir.join("STDOUT");
    let stderr_path = workdir.join("STDERR");
    let stdout_file = std::fs::File::create(&stdout_path)
        .map_err(|e| AgentError::SpawnFailure(format!("cannot open stdout file: {e}")))?;
    let stderr_file = std::fs::File::create(&stderr_path)
        .map_err(|e| AgentError::SpawnFailure(format!("cannot open stderr file: {e}")))?;

    let mut cmd = Command::new("/bin/sh");
    if inner_cmd.is_some() {
        cmd.arg("-c").arg(outer_cmd);
    } else {
        cmd.arg(&script_path);
    }
    cmd.current_dir(workdir)
        .envs(environment)
        .stdin(Stdio::null())
        .stdout(Stdio::from(stdout_file))
        .stderr(Stdio::from(stderr_file));
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    let child = cmd.spawn().map_err(|e| AgentError::SpawnFailure(format!("fork/exec failed: {e}")))?;

    tracing::info!(target: "spawner", pid = child.id(), script = %script_path.display(), "spawned");
    Ok(ProcessHandle { child, stdout_path, stderr_path })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spawns_and_polls_to_completion() {
        let dir = tempfile::tempdir().unwrap();
        let workdir = dir.path().join("unit-0001");
        let mut handle = spawn(&workdir, "echo hello", None, &[], &[], &BTreeMap::new()).unwrap();
        let mut exit = None;
        for _ in 0..200 {
            if let Some(code) = handle.poll().unwrap() {
                exit = Some(code);
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        assert_eq!(exit, Some(0));
        let stdout = std::fs::read_to_string(&handle.stdout_path).unwrap();
        assert_eq!(stdout.trim(), "hello");
    }

    #[test]
    fn nonzero_exit_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let workdir = dir.path().join("unit-0002");
        let mut handle = spawn(&workdir, "exit 7", None, &[], &[], &BTreeMap::new()).unwrap();
        let mut exit = None;
        for _ in 0..200 {
            if let Some(code) = handle.poll().unwrap() {
                exit = Some(code);
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        assert_eq!(exit, Some(7));
    }

    #[test]
    fn kill_terminates_long_running_child() {
        let dir = tempfile::tempdir().unwrap();
        let workdir = dir.path().join("unit-0003");
        let mut handle = spawn(&workdir, "sleep 30", None, &[], &[], &BTreeMap::new()).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(50));
        handle.kill();
        std::thread::sleep(std::time::Duration::from_millis(50));
        assert!(handle.poll().unwrap().is_some());
    }

    #[test]
    fn inner_cmd_is_embedded_in_script_and_outer_cmd_runs_it() {
        let dir = tempfile::tempdir().unwrap();
        let workdir = dir.path().join("unit-0004");
        std::fs::create_dir_all(&workdir).unwrap();
        let script_path = workdir.join("launch.sh");
        let outer_cmd = format!("/bin/sh {}", script_path.display());
        let mut handle = spawn(&workdir, &outer_cmd, Some("echo from-inner"), &[], &[], &BTreeMap::new()).unwrap();
        let mut exit = None;
        for _ in 0..200 {
            if let Some(code) = handle.poll().unwrap() {
                exit = Some(code);
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        assert_eq!(exit, Some(0));
        let stdout = std::fs::read_to_string(&handle.stdout_path).unwrap();
        assert_eq!(stdout.trim(), "from-inner");
        let script_contents = std::fs::read_to_string(&script_path).unwrap();
        assert!(script_contents.contains("echo from-inner"));
    }
}
