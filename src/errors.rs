//! Error mapping guide:
//! - Supervisor failures are typed (`SupervisorError`) so callers can tell a
//!   missing binary/config apart from a spawn or early-exit failure.
//! - Proxy failures stay plain `io::Error`; HTTP-level failures are answered on
//!   the wire (400/502) and never surface as Rust errors.
//! - Map io::ErrorKind::NotFound to exit code 127; all others to 1.
use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("binary not found at {}", .0.display())]
    BinaryNotFound(PathBuf),

    #[error("config not found at {}", .0.display())]
    ConfigNotFound(PathBuf),

    #[error("failed to start backend: {0}")]
    Spawn(#[source] io::Error),

    #[error("backend exited during startup (code: {})", code_text(.code))]
    ExitedEarly { code: Option<i32> },

    #[error("backend is currently stopping; retry once stop completes")]
    Stopping,

    #[error("{job} requires a parameter")]
    MissingParameter { job: &'static str },

    #[error(transparent)]
    Io(#[from] io::Error),
}

fn code_text(code: &Option<i32>) -> String {
    code.map(|c| c.to_string())
        .unwrap_or_else(|| "signal".to_string())
}

/// Map an io::Error to a process exit code:
/// - 127 for NotFound (command not found)
/// - 1 for all other errors
pub fn exit_code_for_io_error(e: &io::Error) -> u8 {
    if e.kind() == io::ErrorKind::NotFound {
        127
    } else {
        1
    }
}

/// Convert SupervisorError to exit code (parity with io::Error mapping).
pub fn exit_code_for_supervisor_error(e: &SupervisorError) -> u8 {
    match e {
        SupervisorError::BinaryNotFound(_) | SupervisorError::ConfigNotFound(_) => 127,
        SupervisorError::Spawn(ioe) | SupervisorError::Io(ioe) => exit_code_for_io_error(ioe),
        _ => 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        let nf = io::Error::new(io::ErrorKind::NotFound, "x");
        assert_eq!(exit_code_for_io_error(&nf), 127);
        assert_eq!(
            exit_code_for_supervisor_error(&SupervisorError::BinaryNotFound("/x".into())),
            127
        );
        assert_eq!(
            exit_code_for_supervisor_error(&SupervisorError::ExitedEarly { code: Some(3) }),
            1
        );
    }

    #[test]
    fn test_display_texts() {
        let e = SupervisorError::ConfigNotFound("/etc/cfg.yaml".into());
        assert_eq!(e.to_string(), "config not found at /etc/cfg.yaml");
        let e = SupervisorError::ExitedEarly { code: None };
        assert_eq!(e.to_string(), "backend exited during startup (code: signal)");
        let e = SupervisorError::MissingParameter { job: "qwen-login" };
        assert_eq!(e.to_string(), "qwen-login requires a parameter");
    }
}
