use std::process::Command;
use std::time::{SystemTime, UNIX_EPOCH};

/// Trimmed stdout of a successful command, if any.
fn command_stdout(program: &str, args: &[&str]) -> Option<String> {
    let out = Command::new(program).args(args).output().ok()?;
    out.status
        .success()
        .then(|| String::from_utf8_lossy(&out.stdout).trim().to_string())
        .filter(|s| !s.is_empty())
}

fn build_date() -> String {
    command_stdout("date", &["-u", "+%Y-%m-%dT%H:%M:%SZ"]).unwrap_or_else(|| {
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        format!("unix:{secs}")
    })
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");

    let env_or_unknown = |key: &str| std::env::var(key).unwrap_or_else(|_| "unknown".into());
    let rustc = std::env::var("RUSTC").unwrap_or_else(|_| "rustc".into());

    // Surfaced by `vibeproxy doctor`.
    let stamps = [
        ("VIBEPROXY_BUILD_DATE", build_date()),
        ("VIBEPROXY_BUILD_TARGET", env_or_unknown("TARGET")),
        ("VIBEPROXY_BUILD_PROFILE", env_or_unknown("PROFILE")),
        (
            "VIBEPROXY_BUILD_RUSTC",
            command_stdout(&rustc, &["--version"]).unwrap_or_else(|| "unknown".into()),
        ),
    ];
    for (key, value) in stamps {
        println!("cargo:rustc-env={key}={value}");
    }
}
