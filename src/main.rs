use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::thread;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{info, warn};

use vibeproxy::config::{self, Settings};
use vibeproxy::{
    acquire_lock, color_enabled_stderr, exit_code_for_io_error, exit_code_for_supervisor_error,
    log_error_stderr, set_color_mode, ColorMode, JobKind, LogStore, Supervisor, SupervisorError,
    ThinkingProxy,
};

#[derive(Parser, Debug)]
#[command(
    name = "vibeproxy",
    version,
    about = "Thinking-budget rewriting proxy in front of a supervised CLIProxyAPI backend."
)]
struct Cli {
    /// Debug-level logging (RUST_LOG still takes precedence)
    #[arg(long, global = true)]
    verbose: bool,

    /// Colorize diagnostics
    #[arg(long, value_enum, global = true, value_name = "WHEN")]
    color: Option<ColorMode>,

    /// Backend binary (default: next to vibeproxy, then PATH)
    #[arg(long, global = true, value_name = "PATH")]
    binary: Option<PathBuf>,

    /// Backend config file (default: config.yaml next to vibeproxy)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Cmd>,
}

#[derive(Subcommand, Debug, Clone)]
enum Cmd {
    /// Start the proxy and the backend, then wait for SIGINT/SIGTERM (default)
    Run,
    /// Run one backend authentication flow
    Login {
        #[arg(value_enum)]
        provider: Provider,
        /// Account email (required for qwen)
        #[arg(long)]
        email: Option<String>,
    },
    /// Print build info, resolved paths and port status
    Doctor,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum Provider {
    Claude,
    Codex,
    Gemini,
    Qwen,
}

impl From<Provider> for JobKind {
    fn from(p: Provider) -> Self {
        match p {
            Provider::Claude => JobKind::ClaudeLogin,
            Provider::Codex => JobKind::CodexLogin,
            Provider::Gemini => JobKind::GeminiLogin,
            Provider::Qwen => JobKind::QwenLogin,
        }
    }
}

fn main() -> ExitCode {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    if let Some(mode) = cli.color {
        set_color_mode(mode);
    }
    vibeproxy::telemetry::init(cli.verbose);

    let result = match cli.command.clone().unwrap_or(Cmd::Run) {
        Cmd::Run => run(&cli),
        Cmd::Login { provider, email } => login(&cli, provider, email.as_deref()),
        Cmd::Doctor => {
            doctor(&cli);
            Ok(ExitCode::SUCCESS)
        }
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            log_error_stderr(color_enabled_stderr(), &format!("vibeproxy: {e:#}"));
            ExitCode::from(exit_code_for(&e))
        }
    }
}

fn exit_code_for(e: &anyhow::Error) -> u8 {
    if let Some(se) = e.downcast_ref::<SupervisorError>() {
        return exit_code_for_supervisor_error(se);
    }
    if let Some(ioe) = e.downcast_ref::<std::io::Error>() {
        return exit_code_for_io_error(ioe);
    }
    1
}

fn resolve_settings(cli: &Cli) -> Result<Settings> {
    Settings::resolve(cli.binary.clone(), cli.config.clone())
}

#[cfg(unix)]
fn shutdown_signals() -> Result<nix::sys::signal::SigSet> {
    use nix::sys::signal::{SigSet, Signal};
    let mut set = SigSet::empty();
    set.add(Signal::SIGINT);
    set.add(Signal::SIGTERM);
    // Every thread spawned afterwards inherits the blocked mask, so only
    // the main thread's sigwait ever sees these signals.
    set.thread_block().context("cannot block shutdown signals")?;
    Ok(set)
}

/// Echo backend output lines into the tracing log as they arrive.
fn follow_backend_logs(logs: Arc<LogStore>) {
    let rx = logs.subscribe();
    thread::spawn(move || {
        for line in rx {
            info!(target: "backend", "{line}");
        }
    });
}

fn run(cli: &Cli) -> Result<ExitCode> {
    let _lock = acquire_lock()?;
    let settings = resolve_settings(cli)?;
    config::warn_on_port_mismatch(&settings.config_path, settings.backend_port);

    #[cfg(unix)]
    let signals = shutdown_signals()?;

    // Bind first so clients are accepted, not refused, while the backend boots.
    let proxy = ThinkingProxy::new(settings.listen_host.clone());
    proxy
        .start(settings.proxy_port, &settings.backend_host, settings.backend_port)
        .with_context(|| format!("cannot start proxy on port {}", settings.proxy_port))?;

    let supervisor = Supervisor::new(
        settings.binary_path.clone(),
        settings.config_path.clone(),
        &settings.backend_host,
        settings.backend_port,
        settings.log_capacity,
    );
    follow_backend_logs(supervisor.logs());

    if let Err(e) = supervisor.start() {
        proxy.stop();
        return Err(e.into());
    }

    let mut ready = false;
    for _ in 0..config::READY_POLL_ATTEMPTS {
        if supervisor.health_check() {
            ready = true;
            break;
        }
        thread::sleep(config::READY_POLL_INTERVAL);
    }
    if !ready {
        proxy.stop();
        let _ = supervisor.stop();
        bail!(
            "backend did not accept connections on {}:{} in time",
            settings.backend_host,
            settings.backend_port
        );
    }
    info!(
        proxy_port = settings.proxy_port,
        backend_port = settings.backend_port,
        pid = supervisor.pid(),
        "vibeproxy ready"
    );

    #[cfg(unix)]
    {
        let sig = signals.wait().context("waiting for shutdown signal failed")?;
        info!(signal = ?sig, "shutting down");
    }
    #[cfg(not(unix))]
    {
        warn!("no signal handling on this platform; running until killed");
        loop {
            thread::park();
        }
    }

    proxy.stop();
    match supervisor.stop() {
        Ok(kind) => info!(?kind, "backend stopped"),
        Err(e) => warn!("stopping backend failed: {e}"),
    }
    Ok(ExitCode::SUCCESS)
}

fn login(cli: &Cli, provider: Provider, email: Option<&str>) -> Result<ExitCode> {
    let settings = resolve_settings(cli)?;
    let supervisor = Supervisor::new(
        settings.binary_path,
        settings.config_path,
        &settings.backend_host,
        settings.backend_port,
        settings.log_capacity,
    );
    let outcome = supervisor.run_job(provider.into(), email)?;
    if outcome.success {
        println!("{}", outcome.message);
        Ok(ExitCode::SUCCESS)
    } else {
        log_error_stderr(color_enabled_stderr(), outcome.message.trim_end());
        Ok(ExitCode::from(1))
    }
}

fn port_status(host: &str, port: u16) -> &'static str {
    if vibeproxy::supervisor::probe(&format!("{host}:{port}"), config::HEALTH_TIMEOUT) {
        "in use"
    } else {
        "free"
    }
}

fn doctor(cli: &Cli) {
    eprintln!("vibeproxy doctor");
    eprintln!("  version: v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("  built: {}", env!("VIBEPROXY_BUILD_DATE"));
    eprintln!(
        "  target: {} ({})",
        env!("VIBEPROXY_BUILD_TARGET"),
        env!("VIBEPROXY_BUILD_PROFILE")
    );
    eprintln!("  rustc: {}", env!("VIBEPROXY_BUILD_RUSTC"));
    eprintln!("  host: {} / {}", std::env::consts::OS, std::env::consts::ARCH);

    match resolve_settings(cli) {
        Ok(s) => {
            eprintln!("  backend binary: {}", s.binary_path.display());
            eprintln!("  backend config: {}", s.config_path.display());
            match config::configured_backend_port(&s.config_path) {
                Ok(Some(p)) if p != s.backend_port => {
                    eprintln!("  config port: {p} (proxy dials {})", s.backend_port)
                }
                Ok(Some(p)) => eprintln!("  config port: {p}"),
                Ok(None) => eprintln!("  config port: (not set)"),
                Err(e) => eprintln!("  config port: unreadable ({e:#})"),
            }
            eprintln!(
                "  proxy port {}: {}",
                s.proxy_port,
                port_status(&s.listen_host, s.proxy_port)
            );
            eprintln!(
                "  backend port {}: {}",
                s.backend_port,
                port_status(&s.backend_host, s.backend_port)
            );
        }
        Err(e) => eprintln!("  settings: {e:#}"),
    }
    eprintln!("doctor: completed diagnostics.");
}
