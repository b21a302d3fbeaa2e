//! Stage-in / stage-out workers (spec §4.6): identical shape, parameterized
//! by which directive list and which queue they feed.

use std::path::{Path, PathBuf};

use pilot_types::{AgentError, Directive, DirectiveAction, DirectiveState};

/// TRANSFER directives are out-of-band remote copies delegated to the
/// file-transfer collaborator, which is named only as an interface (spec §2
/// Non-goals: "no implementation of remote file movement").
pub trait FileTransfer: Send + Sync {
    fn transfer(&self, source: &Path, target: &Path) -> Result<(), AgentError>;
}

/// Stand-in used until a real file-transfer collaborator is wired in; any
/// TRANSFER directive fails clearly rather than silently no-op'ing.
pub struct UnavailableFileTransfer;

impl FileTransfer for UnavailableFileTransfer {
    fn transfer(&self, source: &Path, target: &Path) -> Result<(), AgentError> {
        Err(AgentError::StagingFailure(format!(
            "TRANSFER {} -> {} requires an external file-transfer collaborator",
            source.display(),
            target.display()
        )))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageKind {
    In,
    Out,
}

/// `staging://X` resolves relative to the pilot staging area; `file://X`
/// and bare paths resolve as absolute paths (spec §4.6 step 2).
pub fn resolve_path(url: &str, staging_area: &Path) -> PathBuf {
    if let Some(rest) = url.strip_prefix("staging://") {
        staging_area.join(rest)
    } else if let Some(rest) = url.strip_prefix("file://") {
        PathBuf::from(rest)
    } else {
        PathBuf::from(url)
    }
}

fn link(source: &Path, target: &Path) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        std::os::unix::fs::symlink(source, target)
    }
    #[cfg(not(unix))]
    {
        std::fs::copy(source, target).map(|_| ())
    }
}

/// Executes one directive in place, updating its `state`. Returns `Err` on
/// failure (policy: stop-on-first-failure, spec §4.6 step 2).
pub fn execute_directive(
    directive: &mut Directive,
    staging_area: &Path,
    transfer: &dyn FileTransfer,
) -> Result<(), AgentError> {
    if directive.state == DirectiveState::Done {
        return Ok(());
    }
    directive.state = DirectiveState::Executing;

    let source = resolve_path(&directive.source, staging_area);
    let target = resolve_path(&directive.target, staging_area);
    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| AgentError::StagingFailure(format!("cannot create {}: {e}", parent.display())))?;
    }

    let result = match directive.action {
        DirectiveAction::Link => {
            link(&source, &target).map_err(|e| AgentError::StagingFailure(format!("link failed: {e}")))
        }
        DirectiveAction::Copy => std::fs::copy(&source, &target)
            .map(|_| ())
            .map_err(|e| AgentError::StagingFailure(format!("copy failed: {e}"))),
        DirectiveAction::Move => {
            std::fs::rename(&source, &target).map_err(|e| AgentError::StagingFailure(format!("move failed: {e}")))
        }
        DirectiveAction::Transfer => transfer.transfer(&source, &target),
    };

    match result {
        Ok(()) => {
            directive.state = DirectiveState::Done;
            tracing::info!(target: "staging", source = %directive.source, target = %directive.target, "directive_done");
            Ok(())
        }
        Err(e) => {
            directive.state = DirectiveState::Failed;
            tracing::warn!(target: "staging", source = %directive.source, error = %e, "directive_failed");
            Err(e)
        }
    }
}

/// Runs every not-yet-done directive of the given kind for a CU description,
/// stopping at the first failure.
pub fn process_directives(
    directives: &mut [Directive],
    staging_area: &Path,
    transfer: &dyn FileTransfer,
) -> Result<(), AgentError> {
    for directive in directives.iter_mut() {
        execute_directive(directive, staging_area, transfer)?;
    }
    Ok(())
}
