//! Discovery of the external job: which interpreter runs it and which script
//! it runs. Both are resolved from ordered candidate lists; the first usable
//! candidate wins.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use thiserror::Error;

/// Upper bound on a single interpreter probe.
const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum LocateError {
    #[error("no usable interpreter found (tried: {})", .0.join(", "))]
    InterpreterNotFound(Vec<String>),
    #[error("analysis script not found (tried: {})", display_paths(.0))]
    ScriptNotFound(Vec<PathBuf>),
}

fn display_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Find the first interpreter candidate that exists, is executable, and
/// (when `probe` is non-empty) exits successfully when run with `probe`.
pub async fn find_interpreter(
    candidates: &[String],
    probe: &[String],
) -> Result<PathBuf, LocateError> {
    for candidate in candidates {
        let Some(path) = resolve_executable(candidate) else {
            tracing::debug!(candidate = %candidate, "interpreter candidate not found");
            continue;
        };
        if probe.is_empty() || probe_runs(&path, probe).await {
            tracing::debug!(path = %path.display(), "resolved interpreter");
            return Ok(path);
        }
    }
    Err(LocateError::InterpreterNotFound(candidates.to_vec()))
}

/// Find the first script candidate that is an existing file. Relative
/// candidates are resolved against `base`.
pub fn find_script(base: &Path, candidates: &[PathBuf]) -> Result<PathBuf, LocateError> {
    let mut tried = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        let path = if candidate.is_absolute() {
            candidate.clone()
        } else {
            base.join(candidate)
        };
        if path.is_file() {
            let path = path.canonicalize().unwrap_or(path);
            tracing::debug!(path = %path.display(), "resolved analysis script");
            return Ok(path);
        }
        tried.push(path);
    }
    Err(LocateError::ScriptNotFound(tried))
}

/// Resolve a command name the way a shell would: names containing a path
/// separator are taken as paths, bare names are looked up on `PATH`.
pub fn resolve_executable(name: &str) -> Option<PathBuf> {
    let path = Path::new(name);
    if path.components().count() > 1 || path.is_absolute() {
        return is_executable(path).then(|| path.to_path_buf());
    }
    let search = std::env::var_os("PATH")?;
    std::env::split_paths(&search).find_map(|dir| {
        executable_names(name)
            .into_iter()
            .map(|file| dir.join(file))
            .find(|candidate| is_executable(candidate))
    })
}

#[cfg(windows)]
fn executable_names(name: &str) -> Vec<String> {
    vec![name.to_string(), format!("{name}.exe")]
}

#[cfg(not(windows))]
fn executable_names(name: &str) -> Vec<String> {
    vec![name.to_string()]
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

async fn probe_runs(path: &Path, args: &[String]) -> bool {
    let status = tokio::process::Command::new(path)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .status();
    match tokio::time::timeout(PROBE_TIMEOUT, status).await {
        Ok(Ok(status)) if status.success() => true,
        Ok(Ok(status)) => {
            tracing::debug!(path = %path.display(), %status, "interpreter probe failed");
            false
        }
        Ok(Err(e)) => {
            tracing::debug!(path = %path.display(), error = %e, "interpreter probe could not run");
            false
        }
        Err(_) => {
            tracing::warn!(path = %path.display(), "interpreter probe timed out");
            false
        }
    }
}
