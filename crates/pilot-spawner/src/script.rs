//! Launch script generation (spec §4.4 step 2): shebang, `cd workdir`,
//! pre-exec lines, environment exports, the outer command from the launch
//! method, post-exec lines.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use pilot_types::AgentError;

pub fn render(
    workdir: &Path,
    pre_exec: &[String],
    environment: &BTreeMap<String, String>,
    outer_cmd: &str,
    post_exec: &[String],
) -> String {
    let mut script = String::new();
    let _ = writeln!(script, "#!/bin/sh");
    let _ = writeln!(script, "cd {}", shell_quote(&workdir.display().to_string()));
    for line in pre_exec {
        let _ = writeln!(script, "{line}");
    }
    for (key, value) in environment {
        let _ = writeln!(script, "export {key}={}", shell_quote(value));
    }
    let _ = writeln!(script, "{outer_cmd}");
    for line in post_exec {
        let _ = writeln!(script, "{line}");
    }
    script
}

fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}

/// Writes the rendered script to `<workdir>/launch.sh` and marks it
/// executable (spec §4.4 step 3).
pub fn write_executable(
    workdir: &Path,
    pre_exec: &[String],
    environment: &BTreeMap<String, String>,
    outer_cmd: &str,
    post_exec: &[String],
) -> Result<PathBuf, AgentError> {
    std::fs::create_dir_all(workdir)
        .map_err(|e| AgentError::SpawnFailure(format!("cannot create workdir {}: {e}", workdir.display())))?;
    let path = workdir.join("launch.sh");
    let contents = render(workdir, pre_exec, environment, outer_cmd, post_exec);
    let mut file = std::fs::File::create(&path)
        .map_err(|e| AgentError::SpawnFailure(format!("cannot write launch script: {e}")))?;
    file.write_all(contents.as_bytes())
        .map_err(|e| AgentError::SpawnFailure(format!("cannot write launch script: {e}")))?;
    make_executable(&path)?;
    Ok(path)
}

#[cfg(unix)]
fn make_executable(path: &Path) -> Result<(), AgentError> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = std::fs::metadata(path)
        .map_err(|e| AgentError::SpawnFailure(format!("cannot stat launch script: {e}")))?
        .permissions();
    perms.set_mode(perms.mode() | 0o755);
    std::fs::set_permissions(path, perms)
        .map_err(|e| AgentError::SpawnFailure(format!("cannot chmod launch script: {e}")))
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> Result<(), AgentError> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_shebang_cd_and_outer_command() {
        let mut env = BTreeMap::new();
        env.insert("FOO".to_string(), "bar baz".to_string());
        let script = render(Path::new("/tmp/wd"), &["module load x".into()], &env, "echo hi", &["echo done".into()]);
        assert!(script.starts_with("#!/bin/sh\n"));
        assert!(script.contains("cd '/tmp/wd'"));
        assert!(script.contains("module load x"));
        assert!(script.contains("export FOO='bar baz'"));
        assert!(script.contains("echo hi"));
        assert!(script.contains("echo done"));
    }

    #[test]
    fn write_executable_creates_workdir_idempotently() {
        let dir = tempfile::tempdir().unwrap();
        let workdir = dir.path().join("unit-0001");
        let path1 = write_executable(&workdir, &[], &BTreeMap::new(), "true", &[]).unwrap();
        let path2 = write_executable(&workdir, &[], &BTreeMap::new(), "true", &[]).unwrap();
        assert_eq!(path1, path2);
        assert!(path1.exists());
    }
}
