//! Best-effort removal of backend processes left over from a previous run.
//!
//! Lists candidates with `pgrep -f <name>` and SIGKILLs each one except
//! ourselves. Another instance starting at the same moment can still race us.
use std::process::{Command, Stdio};
use std::time::Duration;

#[cfg(unix)]
use nix::sys::signal::{kill, Signal};
#[cfg(unix)]
use nix::unistd::Pid;
use tracing::{debug, warn};

use crate::logbuf::LogStore;

pub(crate) const ORPHAN_SETTLE: Duration = Duration::from_millis(500);

/// Parse `pgrep` output into pids, skipping blanks and junk.
pub(crate) fn parse_pids(output: &str) -> Vec<i32> {
    output
        .lines()
        .filter_map(|l| l.trim().parse::<i32>().ok())
        .filter(|&p| p > 0)
        .collect()
}

/// Return pids whose command line matches `pattern`; empty when none or when
/// `pgrep` is unavailable.
pub(crate) fn find_matching(pattern: &str) -> Vec<i32> {
    if which::which("pgrep").is_err() {
        debug!("pgrep not available; skipping orphan scan");
        return Vec::new();
    }
    // Exit status 1 means nothing matched.
    let out = match Command::new("pgrep")
        .arg("-f")
        .arg(pattern)
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .output()
    {
        Ok(o) if o.status.success() => o,
        Ok(_) => return Vec::new(),
        Err(e) => {
            debug!("pgrep failed: {e}");
            return Vec::new();
        }
    };
    let me = std::process::id() as i32;
    parse_pids(&String::from_utf8_lossy(&out.stdout))
        .into_iter()
        .filter(|&p| p != me)
        .collect()
}

/// Kill leftover backend processes matching `pattern`. Returns how many were signalled.
pub(crate) fn kill_orphans(pattern: &str, logs: &LogStore) -> usize {
    let pids = find_matching(pattern);
    if pids.is_empty() {
        return 0;
    }
    let listed = pids
        .iter()
        .map(|p| p.to_string())
        .collect::<Vec<_>>()
        .join(" ");
    logs.push(&format!("Found orphaned server process(es): {listed}"));

    let mut killed = 0usize;
    for pid in &pids {
        #[cfg(unix)]
        {
            match kill(Pid::from_raw(*pid), Signal::SIGKILL) {
                Ok(()) => killed += 1,
                Err(e) => warn!(pid, "failed to kill orphaned backend: {e}"),
            }
        }
        #[cfg(not(unix))]
        {
            let _ = pid;
        }
    }

    std::thread::sleep(ORPHAN_SETTLE);
    logs.push("Cleaned up orphaned processes");
    killed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_pids_tolerates_noise() {
        assert_eq!(parse_pids("123\n 456 \n\nabc\n-1\n0\n"), vec![123, 456]);
        assert!(parse_pids("").is_empty());
    }

    #[test]
    fn test_find_matching_unknown_pattern_is_empty() {
        let pats = find_matching("vibeproxy-no-such-process-pattern-7f3e9");
        // pgrep -f may match its own invocation on some platforms; never ours.
        assert!(!pats.contains(&(std::process::id() as i32)));
    }
}
