/*!
Runtime settings and backend path discovery.

Ports and the backend address are compile-time constants. Only the filesystem
locations (backend binary, backend config) and the proxy listen host are
resolved at runtime, in this order: explicit value (CLI flag), environment
(`VIBEPROXY_BINARY`, `VIBEPROXY_CONFIG`, `VIBEPROXY_LISTEN_HOST`), then
discovery next to the running executable.
*/
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use tracing::{info, warn};

/// Client-facing port (thinking transformation applied here).
pub const PROXY_PORT: u16 = 8317;
/// Port the backend listens on; dial target for the proxy and the health probe.
pub const BACKEND_PORT: u16 = 8318;
pub const BACKEND_HOST: &str = "127.0.0.1";
pub const DEFAULT_LISTEN_HOST: &str = "127.0.0.1";
pub const BACKEND_BINARY_NAME: &str = "cli-proxy-api";

pub const LOG_CAPACITY: usize = 1000;
pub const HEALTH_TIMEOUT: Duration = Duration::from_millis(500);
pub const READY_POLL_ATTEMPTS: u32 = 30;
pub const READY_POLL_INTERVAL: Duration = Duration::from_millis(500);

const CONFIG_FILE: &str = "config.yaml";
const CONFIG_TEMPLATE_FILE: &str = "config.default.yaml";

const MINIMAL_CONFIG: &str = "# CLIProxyAPI configuration (generated by vibeproxy)
# Backend port; the proxy always dials 8318, do not change
port: 8318

# Directory where authentication tokens are stored
auth-dir: ~/.cli-proxy-api

remote-management:
  allow-remote: false
  secret-key: \"\"
  disable-control-panel: false

api-keys:
  - dummy-not-used

debug: false
logging-to-file: false
usage-statistics-enabled: false
proxy-url: ''
request-retry: 3

quota-exceeded:
  switch-project: true
  switch-preview-model: true

ws-auth: false
";

/// Resolved process-wide settings.
#[derive(Debug, Clone)]
pub struct Settings {
    pub binary_path: PathBuf,
    pub config_path: PathBuf,
    pub listen_host: String,
    pub proxy_port: u16,
    pub backend_host: String,
    pub backend_port: u16,
    pub log_capacity: usize,
}

impl Settings {
    /// Resolve settings from optional CLI overrides, then environment, then discovery.
    pub fn resolve(binary: Option<PathBuf>, config: Option<PathBuf>) -> Result<Settings> {
        let binary_path = match binary.or_else(|| env_path("VIBEPROXY_BINARY")) {
            Some(p) => p,
            None => discover_binary()?,
        };
        let config_path = match config.or_else(|| env_path("VIBEPROXY_CONFIG")) {
            Some(p) => p,
            None => {
                let dir = exe_dir()?;
                ensure_config_in(&dir)?
            }
        };
        let listen_host = env::var("VIBEPROXY_LISTEN_HOST")
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| DEFAULT_LISTEN_HOST.to_string());

        Ok(Settings {
            binary_path,
            config_path,
            listen_host,
            proxy_port: PROXY_PORT,
            backend_host: BACKEND_HOST.to_string(),
            backend_port: BACKEND_PORT,
            log_capacity: LOG_CAPACITY,
        })
    }
}

fn env_path(key: &str) -> Option<PathBuf> {
    env::var_os(key)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

fn exe_dir() -> Result<PathBuf> {
    let exe = env::current_exe().context("cannot determine current executable")?;
    exe.parent()
        .map(Path::to_path_buf)
        .ok_or_else(|| anyhow!("executable has no parent directory: {}", exe.display()))
}

/// Locate the backend binary next to our executable, falling back to PATH.
pub fn discover_binary() -> Result<PathBuf> {
    if let Ok(dir) = exe_dir() {
        let candidate = dir.join(BACKEND_BINARY_NAME);
        if candidate.is_file() {
            return Ok(candidate);
        }
    }
    which::which(BACKEND_BINARY_NAME)
        .map_err(|_| anyhow!("{BACKEND_BINARY_NAME} binary not found next to vibeproxy or in PATH"))
}

/// Return `<dir>/config.yaml`, creating it from `config.default.yaml` or a
/// minimal built-in document when missing.
pub fn ensure_config_in(dir: &Path) -> Result<PathBuf> {
    let config_path = dir.join(CONFIG_FILE);
    if config_path.is_file() {
        return Ok(config_path);
    }

    let template = dir.join(CONFIG_TEMPLATE_FILE);
    if template.is_file() {
        info!(template = %template.display(), "creating config.yaml from default template");
        fs::copy(&template, &config_path).with_context(|| {
            format!(
                "failed to create {} from template {}",
                config_path.display(),
                template.display()
            )
        })?;
        return Ok(config_path);
    }

    info!(path = %config_path.display(), "no template found, writing minimal config.yaml");
    fs::write(&config_path, MINIMAL_CONFIG)
        .with_context(|| format!("failed to write minimal config {}", config_path.display()))?;
    Ok(config_path)
}

#[derive(Debug, Default, Deserialize)]
struct BackendConfigPeek {
    port: Option<u16>,
}

/// Read the backend's configured port, if the document declares one.
pub fn configured_backend_port(config_path: &Path) -> Result<Option<u16>> {
    let content = fs::read_to_string(config_path)
        .with_context(|| format!("cannot read {}", config_path.display()))?;
    if content.trim().is_empty() {
        return Ok(None);
    }
    let peek: BackendConfigPeek = serde_yaml::from_str(&content)
        .with_context(|| format!("cannot parse {}", config_path.display()))?;
    Ok(peek.port)
}

/// Warn when the backend config points the backend at a port the proxy does not dial.
pub fn warn_on_port_mismatch(config_path: &Path, expected: u16) {
    match configured_backend_port(config_path) {
        Ok(Some(port)) if port != expected => warn!(
            configured = port,
            expected,
            "backend config port differs from the port the proxy forwards to"
        ),
        Ok(_) => {}
        Err(e) => warn!("could not inspect backend config: {e:#}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ensure_config_writes_minimal_document() {
        let dir = tempfile::tempdir().unwrap();
        let path = ensure_config_in(dir.path()).unwrap();
        assert_eq!(path, dir.path().join("config.yaml"));
        assert_eq!(configured_backend_port(&path).unwrap(), Some(BACKEND_PORT));
    }

    #[test]
    fn test_ensure_config_prefers_template() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("config.default.yaml"), "port: 9000\n").unwrap();
        let path = ensure_config_in(dir.path()).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "port: 9000\n");
        assert_eq!(configured_backend_port(&path).unwrap(), Some(9000));
    }

    #[test]
    fn test_ensure_config_keeps_existing() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("config.yaml"), "debug: true\n").unwrap();
        fs::write(dir.path().join("config.default.yaml"), "port: 9000\n").unwrap();
        let path = ensure_config_in(dir.path()).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "debug: true\n");
        assert_eq!(configured_backend_port(&path).unwrap(), None);
    }

    #[test]
    fn test_configured_port_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("config.yaml");
        fs::write(&p, "port: [not, a, number]\n").unwrap();
        assert!(configured_backend_port(&p).is_err());
    }
}
