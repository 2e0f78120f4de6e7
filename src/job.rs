//! Running the external analysis job for a session.
//!
//! One job per session. The runner locates the interpreter and script,
//! starts the process with the request parameters, and pumps its stdout and
//! stderr into the session line by line. The session reaches exactly one
//! terminal state whatever happens to the process.

use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio_util::task::TaskTracker;

use crate::config::{JobConfig, ParamEncoding};
use crate::locate::{self, LocateError};
use crate::protocol::{AnalysisRequest, SessionEvent};
use crate::session::Session;

/// How long to keep reading buffered output after the process was killed.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum JobError {
    #[error(transparent)]
    Locate(#[from] LocateError),

    #[error("failed to encode analysis parameters: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("failed to start analysis process: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("analysis process {0} was not captured")]
    Pipe(&'static str),

    #[error("failed to read analysis {stream}: {source}")]
    Read {
        stream: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("output reader failed: {0}")]
    Pump(#[from] tokio::task::JoinError),

    #[error("failed to wait for analysis process: {0}")]
    Wait(#[source] std::io::Error),

    #[error("analysis process exited with {0}")]
    Exit(ExitStatus),

    #[error("analysis cancelled")]
    Cancelled,

    #[error("analysis timed out after {}s", .0.as_secs())]
    TimedOut(Duration),
}

/// Starts jobs in the background and keeps track of them so shutdown can
/// wait for every runner to record its session's final state.
#[derive(Clone)]
pub struct JobRunner {
    config: Arc<JobConfig>,
    tracker: TaskTracker,
}

impl JobRunner {
    pub fn new(config: JobConfig) -> Self {
        Self {
            config: Arc::new(config),
            tracker: TaskTracker::new(),
        }
    }

    /// Run the job for `session` in the background. Returns immediately.
    pub fn launch(&self, session: Session) {
        tracing::debug!(session = %session.id, "launching analysis");
        self.tracker.spawn(run(session, self.config.clone()));
    }

    /// Number of runners that have not finished yet.
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    /// Wait up to `grace` for in-flight runners. Returns `false` on timeout.
    ///
    /// Callers cancel the sessions first; this only waits.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        self.tracker.close();
        let finished = tokio::time::timeout(grace, self.tracker.wait())
            .await
            .is_ok();
        if !finished {
            tracing::warn!(
                remaining = self.tracker.len(),
                "analysis runners still active after shutdown grace period"
            );
        }
        finished
    }
}

/// Fails the session if the runner unwinds without reaching a terminal
/// state, and stamps the end time either way.
struct FinishGuard(Session);

impl Drop for FinishGuard {
    fn drop(&mut self) {
        if !self.0.is_finished() {
            let _ = self.0.fail("analysis runner exited unexpectedly");
        }
        self.0.mark_ended();
    }
}

/// Run the job for `session` to completion.
///
/// Publishes a status event once the process is running, one output event
/// per line, then exactly one `completed` or `error` event.
pub async fn run(session: Session, config: Arc<JobConfig>) {
    let _guard = FinishGuard(session.clone());

    match execute(&session, &config).await {
        Ok(result) => {
            tracing::info!(session = %session.id, bytes = result.len(), "analysis completed");
            if let Err(e) = session.complete(result) {
                tracing::debug!(error = %e, "session finished before completion");
            }
        }
        Err(e) => {
            tracing::warn!(session = %session.id, error = %e, "analysis failed");
            if let Err(e) = session.fail(e.to_string()) {
                tracing::debug!(error = %e, "session finished before failure");
            }
        }
    }
}

async fn execute(session: &Session, config: &JobConfig) -> Result<String, JobError> {
    let interpreter =
        locate::find_interpreter(&config.interpreters, &config.interpreter_probe).await?;
    let script = locate::find_script(&config.base_dir(), &config.scripts)?;

    if session.cancelled.is_cancelled() {
        return Err(JobError::Cancelled);
    }

    let mut command = Command::new(&interpreter);
    command.arg(&script);
    if let Some(dir) = script.parent() {
        command.current_dir(dir);
    }
    command
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let stdin_payload = match config.params {
        ParamEncoding::Args => {
            command.args(param_args(&session.request)).stdin(Stdio::null());
            None
        }
        ParamEncoding::StdinJson => {
            command.stdin(Stdio::piped());
            let mut payload = serde_json::to_vec(session.request.as_ref())?;
            payload.push(b'\n');
            Some(payload)
        }
    };

    tracing::info!(
        session = %session.id,
        interpreter = %interpreter.display(),
        script = %script.display(),
        "starting analysis process"
    );
    let mut child = command.spawn().map_err(JobError::Spawn)?;
    tracing::debug!(session = %session.id, pid = ?child.id(), "analysis process running");
    let stdout = child.stdout.take().ok_or(JobError::Pipe("stdout"))?;
    let stderr = child.stderr.take().ok_or(JobError::Pipe("stderr"))?;

    if let Some(payload) = stdin_payload {
        let mut stdin = child.stdin.take().ok_or(JobError::Pipe("stdin"))?;
        let id = session.id.clone();
        tokio::spawn(async move {
            if let Err(e) = stdin.write_all(&payload).await {
                tracing::debug!(session = %id, error = %e, "job closed stdin early");
            }
        });
    }

    let _ = session.publish(SessionEvent::status(format!(
        "analysis started for {} ({})",
        session.request.company_name, session.request.stock_code
    )));

    let stdout_task = tokio::spawn({
        let session = session.clone();
        async move {
            let mut lines = Vec::new();
            pump(stdout, "stdout", |line| {
                publish_line(&session, line.clone());
                lines.push(line);
            })
            .await?;
            Ok::<_, JobError>(lines)
        }
    });
    let stderr_task = tokio::spawn({
        let session = session.clone();
        let prefix = config.diagnostic_prefix.clone();
        async move {
            pump(stderr, "stderr", |line| {
                publish_line(&session, format!("{prefix}{line}"))
            })
            .await
        }
    });

    let pumps = async { (stdout_task.await, stderr_task.await) };
    tokio::pin!(pumps);

    // Output EOF alone does not end the job; the process may close its pipes
    // and keep running, so the exit wait is raced too.
    let mut pumps_done = false;
    let finished = async {
        let outputs = (&mut pumps).await;
        pumps_done = true;
        (outputs, child.wait().await)
    };

    let interrupted = tokio::select! {
        finished = finished => Ok(finished),
        _ = session.cancelled.cancelled() => Err(JobError::Cancelled),
        _ = deadline(config.timeout()) => Err(JobError::TimedOut(config.timeout().unwrap_or_default())),
    };

    let ((lines, diagnostics), status) = match interrupted {
        Ok(finished) => finished,
        Err(reason) => {
            tracing::info!(session = %session.id, reason = %reason, "stopping analysis process");
            if let Err(e) = child.start_kill() {
                tracing::debug!(error = %e, "analysis process already gone");
            }
            if let Err(e) = child.wait().await {
                tracing::debug!(error = %e, "failed to reap analysis process");
            }
            if !pumps_done && tokio::time::timeout(DRAIN_GRACE, &mut pumps).await.is_err() {
                tracing::warn!(session = %session.id, "output readers did not finish after kill");
            }
            return Err(reason);
        }
    };

    let lines = lines??;
    diagnostics??;

    let status = status.map_err(JobError::Wait)?;
    if !status.success() {
        return Err(JobError::Exit(status));
    }
    Ok(lines.iter().map(|line| format!("{line}\n")).collect())
}

/// Parameters as argv entries. Each value is passed verbatim as part of a
/// single argument; nothing is interpreted by a shell.
fn param_args(request: &AnalysisRequest) -> [String; 3] {
    [
        format!("--company={}", request.company_name),
        format!("--code={}", request.stock_code),
        format!("--market={}", request.market),
    ]
}

async fn deadline(limit: Option<Duration>) {
    match limit {
        Some(limit) => tokio::time::sleep(limit).await,
        None => std::future::pending().await,
    }
}

fn publish_line(session: &Session, line: String) {
    if let Err(e) = session.publish(SessionEvent::output(line)) {
        tracing::debug!(error = %e, "dropping output after session finished");
    }
}

/// Read `reader` to EOF, handing each line (without its terminator) to
/// `on_line`. A final line without a newline is still delivered. Invalid
/// UTF-8 is replaced rather than treated as an error.
async fn pump<R, F>(reader: R, stream: &'static str, mut on_line: F) -> Result<(), JobError>
where
    R: AsyncRead + Unpin,
    F: FnMut(String),
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        let n = reader
            .read_until(b'\n', &mut buf)
            .await
            .map_err(|source| JobError::Read { stream, source })?;
        if n == 0 {
            return Ok(());
        }
        on_line(decode_line(&buf));
    }
}

fn decode_line(raw: &[u8]) -> String {
    let line = raw.strip_suffix(b"\n").unwrap_or(raw);
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    String::from_utf8_lossy(line).into_owned()
}
