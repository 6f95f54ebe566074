/*!
Auxiliary one-shot backend invocations (authentication flows).

Each job runs `<binary> --config <config> <flag>` with piped stdio. Success is
inferred from timing: a job still running once the crash window has passed is
assumed to be waiting on a browser login; a job that exits inside the window
succeeds only with status 0 or a browser marker in its stdout.
*/
use std::io::{BufReader, Read, Write};
use std::path::Path;
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::errors::SupervisorError;
use crate::logbuf::LogStore;

use super::read_line_lossy;

pub(crate) const JOB_SETTLE: Duration = Duration::from_secs(1);
pub(crate) const JOB_WINDOW: Duration = Duration::from_millis(500);
const READER_GRACE: Duration = Duration::from_millis(250);

const BROWSER_MARKERS: &[&str] = &["Opening browser", "Attempting to open URL"];
pub const BROWSER_OPENED_MESSAGE: &str = "Browser opened for authentication.\n\nPlease complete the login in your browser.\n\nThe app will automatically detect when you're authenticated.";
const UNEXPECTED_FAILURE: &str = "Authentication process failed unexpectedly";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    ClaudeLogin,
    CodexLogin,
    GeminiLogin,
    QwenLogin,
}

impl JobKind {
    pub const ALL: [JobKind; 4] = [
        JobKind::ClaudeLogin,
        JobKind::CodexLogin,
        JobKind::GeminiLogin,
        JobKind::QwenLogin,
    ];

    /// Backend command-line flag selecting this job.
    pub fn flag(self) -> &'static str {
        match self {
            JobKind::ClaudeLogin => "-claude-login",
            JobKind::CodexLogin => "-codex-login",
            JobKind::GeminiLogin => "-login",
            JobKind::QwenLogin => "-qwen-login",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            JobKind::ClaudeLogin => "claude-login",
            JobKind::CodexLogin => "codex-login",
            JobKind::GeminiLogin => "gemini-login",
            JobKind::QwenLogin => "qwen-login",
        }
    }

    pub fn requires_parameter(self) -> bool {
        matches!(self, JobKind::QwenLogin)
    }

    /// Delay before the canned stdin answer and the line itself, if any.
    pub(crate) fn stdin_reply(self, parameter: Option<&str>) -> Option<(Duration, String)> {
        match self {
            // Accept the default project
            JobKind::GeminiLogin => Some((Duration::from_secs(3), "\n".to_string())),
            JobKind::QwenLogin => parameter.map(|p| (Duration::from_secs(10), format!("{p}\n"))),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobOutcome {
    pub success: bool,
    pub message: String,
}

impl JobOutcome {
    fn browser_opened() -> Self {
        JobOutcome {
            success: true,
            message: BROWSER_OPENED_MESSAGE.to_string(),
        }
    }
}

/// Decide the outcome of a job that exited inside the crash window.
pub(crate) fn judge_exited(exit_ok: bool, stdout: &str, stderr: &str) -> JobOutcome {
    if exit_ok || BROWSER_MARKERS.iter().any(|m| stdout.contains(m)) {
        return JobOutcome::browser_opened();
    }
    let message = if !stderr.is_empty() {
        stderr.to_string()
    } else if !stdout.is_empty() {
        stdout.to_string()
    } else {
        UNEXPECTED_FAILURE.to_string()
    };
    JobOutcome {
        success: false,
        message,
    }
}

fn capture<R: Read + Send + 'static>(
    reader: R,
    sink: Arc<Mutex<String>>,
    done: mpsc::Sender<()>,
) {
    std::thread::spawn(move || {
        let mut br = BufReader::new(reader);
        let mut buf = Vec::new();
        while read_line_lossy(&mut br, &mut buf) {
            let line = String::from_utf8_lossy(&buf);
            let mut s = sink.lock().unwrap_or_else(PoisonError::into_inner);
            s.push_str(line.trim_end_matches(['\n', '\r']));
            s.push('\n');
        }
        let _ = done.send(());
    });
}

fn reply_later(mut stdin: ChildStdin, delay: Duration, line: String, label: &'static str) {
    std::thread::spawn(move || {
        std::thread::sleep(delay);
        match stdin.write_all(line.as_bytes()).and_then(|_| stdin.flush()) {
            Ok(()) => info!(job = label, "sent canned answer to job stdin"),
            Err(e) => warn!(job = label, "could not write job stdin: {e}"),
        }
    });
}

/// Poll `child` until it exits or `deadline` passes.
fn wait_until(child: &mut Child, deadline: Instant) -> std::io::Result<Option<std::process::ExitStatus>> {
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if Instant::now() >= deadline {
            return Ok(None);
        }
        std::thread::sleep(Duration::from_millis(25));
    }
}

pub(crate) fn run_job(
    binary: &Path,
    config: &Path,
    kind: JobKind,
    parameter: Option<&str>,
    logs: &LogStore,
) -> Result<JobOutcome, SupervisorError> {
    if !binary.exists() {
        return Err(SupervisorError::BinaryNotFound(binary.to_path_buf()));
    }
    let parameter = parameter.map(str::trim).filter(|p| !p.is_empty());
    if kind.requires_parameter() && parameter.is_none() {
        return Err(SupervisorError::MissingParameter { job: kind.label() });
    }

    let mut child = Command::new(binary)
        .arg("--config")
        .arg(config)
        .arg(kind.flag())
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(SupervisorError::Spawn)?;

    let pid = child.id();
    info!(job = kind.label(), pid, "authentication job started");
    logs.push(&format!(
        "Authentication process started (PID: {pid}) - browser should open shortly"
    ));

    // Jobs without a canned answer keep stdin open for as long as they run.
    let mut idle_stdin = None;
    match (child.stdin.take(), kind.stdin_reply(parameter)) {
        (Some(stdin), Some((delay, line))) => reply_later(stdin, delay, line, kind.label()),
        (stdin, _) => idle_stdin = stdin,
    }

    let out_buf = Arc::new(Mutex::new(String::new()));
    let err_buf = Arc::new(Mutex::new(String::new()));
    let (done_tx, done_rx) = mpsc::channel();
    if let Some(so) = child.stdout.take() {
        capture(so, out_buf.clone(), done_tx.clone());
    }
    if let Some(se) = child.stderr.take() {
        capture(se, err_buf.clone(), done_tx.clone());
    }
    drop(done_tx);

    std::thread::sleep(JOB_SETTLE);

    match wait_until(&mut child, Instant::now() + JOB_WINDOW)? {
        Some(status) => {
            // Let the readers drain what the process wrote before exiting.
            let deadline = Instant::now() + READER_GRACE;
            for _ in 0..2 {
                let left = deadline.saturating_duration_since(Instant::now());
                if done_rx.recv_timeout(left).is_err() {
                    break;
                }
            }
            let stdout = out_buf.lock().unwrap_or_else(PoisonError::into_inner).clone();
            let stderr = err_buf.lock().unwrap_or_else(PoisonError::into_inner).clone();
            let outcome = judge_exited(status.success(), &stdout, &stderr);
            if !outcome.success {
                warn!(job = kind.label(), code = ?status.code(), "authentication job failed");
            }
            Ok(outcome)
        }
        None => {
            // Still running: an interactive browser flow is assumed. Reap it in the background.
            std::thread::spawn(move || {
                let _ = child.wait();
                drop(idle_stdin);
            });
            Ok(JobOutcome::browser_opened())
        }
    }
}
