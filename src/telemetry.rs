//! Process-wide tracing subscriber.
//!
//! `RUST_LOG` wins when set; otherwise `info`, or `debug` with `--verbose`.
//! Output goes to stderr so stdout stays clean for command results.
use once_cell::sync::OnceCell;
use tracing_subscriber::EnvFilter;

static INIT: OnceCell<()> = OnceCell::new();

fn default_directive(verbose: bool) -> &'static str {
    if verbose {
        "debug"
    } else {
        "info"
    }
}

fn build_filter(verbose: bool) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive(verbose)))
}

/// Install the fmt subscriber once. Later calls, or a subscriber installed
/// elsewhere first, leave the existing one in place.
pub fn init(verbose: bool) {
    if INIT.get().is_some() {
        return;
    }
    let ansi = crate::color_enabled_stderr();
    let installed = tracing_subscriber::fmt()
        .with_env_filter(build_filter(verbose))
        .with_writer(std::io::stderr)
        .with_ansi(ansi)
        .with_target(false)
        .try_init();
    if installed.is_err() {
        eprintln!("vibeproxy: tracing init skipped (global subscriber already set)");
    }
    let _ = INIT.set(());
}
