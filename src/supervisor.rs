/*!
Single-instance supervisor for the backend process.

- `start()` is idempotent: a running (or starting) backend is left alone.
- Backend stdout/stderr lines land in the shared `LogStore` until the run's
  `CancelToken` fires.
- A waiter thread owns the `Child`, reaps it, and publishes the exit through
  `ExitWatch`; `stop()` signals the pid and waits on that watch.
- `health_check()` never takes the state lock.
- There is no automatic restart; callers decide.
*/
use std::io::{BufRead, BufReader, ErrorKind, Read};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

#[cfg(unix)]
use nix::sys::signal::{kill, Signal};
#[cfg(unix)]
use nix::unistd::Pid;
use tracing::{debug, info, warn};

use crate::config::HEALTH_TIMEOUT;
use crate::errors::SupervisorError;
use crate::logbuf::LogStore;

mod jobs;
mod lifecycle;
mod orphan;

pub use jobs::{JobKind, JobOutcome, BROWSER_OPENED_MESSAGE};
pub use lifecycle::{BackendState, CancelToken, ExitOutcome, ExitWatch, RunHandle};

pub const START_SETTLE: Duration = Duration::from_secs(1);
pub const STOP_GRACE: Duration = Duration::from_secs(2);

const STDERR_PREFIX: &str = "[stderr] ";

/// How `stop()` ended a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopKind {
    NotRunning,
    Graceful,
    Forced,
}

#[derive(Debug)]
pub struct Supervisor {
    binary: PathBuf,
    config: PathBuf,
    backend_addr: String,
    logs: Arc<LogStore>,
    state: Arc<Mutex<BackendState>>,
    generation: AtomicU64,
    orphan_cleanup: bool,
}

impl Supervisor {
    pub fn new(
        binary: impl Into<PathBuf>,
        config: impl Into<PathBuf>,
        backend_host: &str,
        backend_port: u16,
        log_capacity: usize,
    ) -> Self {
        Self {
            binary: binary.into(),
            config: config.into(),
            backend_addr: format!("{backend_host}:{backend_port}"),
            logs: Arc::new(LogStore::new(log_capacity)),
            state: Arc::new(Mutex::new(BackendState::Idle)),
            generation: AtomicU64::new(0),
            orphan_cleanup: true,
        }
    }

    /// Disable the pre-start orphan sweep (useful when several supervisors share a binary name).
    pub fn without_orphan_cleanup(mut self) -> Self {
        self.orphan_cleanup = false;
        self
    }

    fn lock_state(&self) -> MutexGuard<'_, BackendState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn binary_path(&self) -> &Path {
        &self.binary
    }

    pub fn config_path(&self) -> &Path {
        &self.config
    }

    pub fn logs(&self) -> Arc<LogStore> {
        self.logs.clone()
    }

    /// Snapshot of the captured log lines, oldest first.
    pub fn get_logs(&self) -> Vec<String> {
        self.logs.lines()
    }

    pub fn is_running(&self) -> bool {
        self.lock_state().is_running()
    }

    pub fn pid(&self) -> Option<u32> {
        self.lock_state().pid()
    }

    pub fn state(&self) -> BackendState {
        self.lock_state().clone()
    }

    /// Bounded TCP probe of the backend port. Advisory only.
    pub fn health_check(&self) -> bool {
        probe(&self.backend_addr, HEALTH_TIMEOUT)
    }

    pub fn start(&self) -> Result<(), SupervisorError> {
        {
            let mut st = self.lock_state();
            match *st {
                BackendState::Running(_) | BackendState::Starting => return Ok(()),
                BackendState::Stopping(_) => return Err(SupervisorError::Stopping),
                BackendState::Idle | BackendState::Stopped { .. } => {}
            }
            *st = BackendState::Starting;
        }

        match self.spawn_backend() {
            Ok(handle) => self.settle(handle),
            Err(e) => {
                let mut st = self.lock_state();
                if matches!(*st, BackendState::Starting) {
                    *st = BackendState::Idle;
                }
                Err(e)
            }
        }
    }

    fn spawn_backend(&self) -> Result<RunHandle, SupervisorError> {
        if self.orphan_cleanup {
            if let Some(name) = self.binary.file_name().and_then(|s| s.to_str()) {
                orphan::kill_orphans(name, &self.logs);
            }
        }

        if !self.binary.exists() {
            return Err(SupervisorError::BinaryNotFound(self.binary.clone()));
        }
        if !self.config.exists() {
            return Err(SupervisorError::ConfigNotFound(self.config.clone()));
        }

        let mut child = Command::new(&self.binary)
            .arg("--config")
            .arg(&self.config)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(SupervisorError::Spawn)?;

        let handle = RunHandle {
            generation: self.generation.fetch_add(1, Ordering::SeqCst) + 1,
            pid: child.id(),
            exit: ExitWatch::new(),
            cancel: CancelToken::new(),
        };

        {
            let mut st = self.lock_state();
            *st = BackendState::Running(handle.clone());
        }
        info!(pid = handle.pid, binary = %self.binary.display(), "backend started");
        self.logs
            .push(&format!("Server started (PID: {})", handle.pid));

        if let Some(out) = child.stdout.take() {
            pump_lines(out, "", self.logs.clone(), handle.cancel.clone());
        }
        if let Some(err) = child.stderr.take() {
            pump_lines(err, STDERR_PREFIX, self.logs.clone(), handle.cancel.clone());
        }
        self.spawn_waiter(child, handle.clone());
        Ok(handle)
    }

    fn spawn_waiter(&self, mut child: Child, handle: RunHandle) {
        let state = self.state.clone();
        let logs = self.logs.clone();
        std::thread::spawn(move || {
            let outcome = match child.wait() {
                Ok(status) => ExitOutcome::from(status),
                Err(e) => {
                    warn!(pid = handle.pid, "waiting for backend failed: {e}");
                    ExitOutcome {
                        code: None,
                        success: false,
                    }
                }
            };
            {
                let mut st = state.lock().unwrap_or_else(PoisonError::into_inner);
                if st.generation() == Some(handle.generation) {
                    *st = BackendState::Stopped { code: outcome.code };
                }
            }
            handle.cancel.cancel();
            handle.exit.publish(outcome);
            let code = outcome
                .code
                .map(|c| c.to_string())
                .unwrap_or_else(|| "signal".to_string());
            info!(pid = handle.pid, code = %code, "backend exited");
            logs.push(&format!("Server stopped with code: {code}"));
        });
    }

    /// Hold the caller briefly so an immediate crash is reported as a failed start.
    fn settle(&self, handle: RunHandle) -> Result<(), SupervisorError> {
        match handle.exit.wait_timeout(START_SETTLE) {
            Some(outcome) => Err(SupervisorError::ExitedEarly { code: outcome.code }),
            None => Ok(()),
        }
    }

    /// Graceful SIGTERM, forced SIGKILL after `STOP_GRACE`. Always leaves the
    /// supervisor not running.
    pub fn stop(&self) -> Result<StopKind, SupervisorError> {
        let handle = {
            let mut st = self.lock_state();
            match &*st {
                BackendState::Running(h) => {
                    let h = h.clone();
                    *st = BackendState::Stopping(h.clone());
                    h
                }
                _ => return Ok(StopKind::NotRunning),
            }
        };

        self.logs
            .push(&format!("Stopping server (PID: {})...", handle.pid));
        send_signal(handle.pid, StopSignal::Terminate);

        let kind = match handle.exit.wait_timeout(STOP_GRACE) {
            Some(_) => {
                self.logs.push("Server stopped gracefully");
                StopKind::Graceful
            }
            None => {
                self.logs
                    .push("Server didn't stop gracefully, force killing...");
                warn!(pid = handle.pid, "backend ignored SIGTERM; sending SIGKILL");
                send_signal(handle.pid, StopSignal::Kill);
                handle.exit.wait();
                StopKind::Forced
            }
        };

        {
            let mut st = self.lock_state();
            if st.generation() == Some(handle.generation) {
                let code = handle.exit.outcome().and_then(|o| o.code);
                *st = BackendState::Stopped { code };
            }
        }
        handle.cancel.cancel();
        Ok(kind)
    }

    /// Run one auxiliary authentication job against the same binary/config.
    pub fn run_job(
        &self,
        kind: JobKind,
        parameter: Option<&str>,
    ) -> Result<JobOutcome, SupervisorError> {
        jobs::run_job(&self.binary, &self.config, kind, parameter, &self.logs)
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        if self.is_running() {
            let _ = self.stop();
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum StopSignal {
    Terminate,
    Kill,
}

fn send_signal(pid: u32, sig: StopSignal) {
    #[cfg(unix)]
    {
        let signal = match sig {
            StopSignal::Terminate => Signal::SIGTERM,
            StopSignal::Kill => Signal::SIGKILL,
        };
        // The waiter has not reaped the child yet, so the pid still refers to it.
        if let Err(e) = kill(Pid::from_raw(pid as i32), signal) {
            debug!(pid, ?signal, "signal delivery failed: {e}");
        }
    }
    #[cfg(not(unix))]
    {
        let _ = (pid, sig);
        warn!("signal delivery is not supported on this platform");
    }
}

/// TCP connect probe bounded by `timeout` per resolved address.
pub fn probe(addr: &str, timeout: Duration) -> bool {
    let addrs: Vec<SocketAddr> = match addr.to_socket_addrs() {
        Ok(it) => it.collect(),
        Err(_) => return false,
    };
    addrs
        .iter()
        .any(|sa| TcpStream::connect_timeout(sa, timeout).is_ok())
}

/// Forward each non-empty line from `reader` into `logs` until `cancel` fires.
///
/// Lines are decoded lossily and the pipe is drained to EOF even after
/// cancellation, so the backend never writes into a closed pipe.
fn pump_lines<R: Read + Send + 'static>(
    reader: R,
    prefix: &'static str,
    logs: Arc<LogStore>,
    cancel: CancelToken,
) {
    std::thread::spawn(move || {
        let mut br = BufReader::new(reader);
        let mut buf = Vec::new();
        while read_line_lossy(&mut br, &mut buf) {
            if cancel.is_cancelled() {
                continue;
            }
            let line = String::from_utf8_lossy(&buf);
            let line = line.trim_end_matches(['\n', '\r']);
            if !line.is_empty() {
                logs.push(&format!("{prefix}{line}"));
            }
        }
    });
}

/// Read one `\n`-terminated chunk into `buf`; false at EOF or on a hard error.
pub(crate) fn read_line_lossy<R: BufRead>(reader: &mut R, buf: &mut Vec<u8>) -> bool {
    buf.clear();
    loop {
        match reader.read_until(b'\n', buf) {
            Ok(0) => return false,
            Ok(_) => return true,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(_) => return false,
        }
    }
}
