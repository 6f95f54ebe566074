//! Color mode selection for terminal output.
//!
//! Precedence: `NO_COLOR` always wins, then the `--color` flag
//! (`set_color_mode`), then `VIBEPROXY_COLOR`, then TTY detection.

use clap::ValueEnum;
use once_cell::sync::OnceCell;

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Debug, ValueEnum)]
pub enum ColorMode {
    Auto,
    Always,
    Never,
}

static COLOR_MODE: OnceCell<ColorMode> = OnceCell::new();

pub fn set_color_mode(mode: ColorMode) {
    let _ = COLOR_MODE.set(mode);
}

fn parse_color_mode(s: &str) -> Option<ColorMode> {
    match s.trim().to_ascii_lowercase().as_str() {
        "auto" => Some(ColorMode::Auto),
        "always" | "on" | "true" | "yes" => Some(ColorMode::Always),
        "never" | "off" | "false" | "no" => Some(ColorMode::Never),
        _ => None,
    }
}

fn resolve(no_color: bool, flag: Option<ColorMode>, env: Option<ColorMode>, is_tty: bool) -> bool {
    if no_color {
        return false;
    }
    match flag.or(env).unwrap_or(ColorMode::Auto) {
        ColorMode::Always => true,
        ColorMode::Never => false,
        ColorMode::Auto => is_tty,
    }
}

fn color_enabled_for(is_tty: bool) -> bool {
    // https://no-color.org/
    let no_color = std::env::var_os("NO_COLOR").is_some();
    let env_mode = std::env::var("VIBEPROXY_COLOR")
        .ok()
        .and_then(|v| parse_color_mode(&v));
    resolve(no_color, COLOR_MODE.get().copied(), env_mode, is_tty)
}

pub fn color_enabled_stderr() -> bool {
    color_enabled_for(atty::is(atty::Stream::Stderr))
}

/// Wrap `s` in an ANSI sequence when enabled.
pub fn paint(enabled: bool, code: &str, s: &str) -> String {
    if enabled {
        format!("{code}{s}\x1b[0m")
    } else {
        s.to_string()
    }
}

pub fn log_error_stderr(use_color: bool, msg: &str) {
    eprintln!("{}", paint(use_color, "\x1b[31;1m", msg));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_color_mode_aliases() {
        assert_eq!(parse_color_mode(" ON "), Some(ColorMode::Always));
        assert_eq!(parse_color_mode("no"), Some(ColorMode::Never));
        assert_eq!(parse_color_mode("auto"), Some(ColorMode::Auto));
        assert_eq!(parse_color_mode("rainbow"), None);
    }

    #[test]
    fn test_resolve_precedence() {
        assert!(!resolve(true, Some(ColorMode::Always), None, true));
        assert!(!resolve(false, Some(ColorMode::Never), Some(ColorMode::Always), true));
        assert!(resolve(false, None, Some(ColorMode::Always), false));
        assert!(resolve(false, None, None, true));
        assert!(!resolve(false, Some(ColorMode::Auto), None, false));
    }

    #[test]
    fn test_paint() {
        assert_eq!(paint(false, "\x1b[33m", "x"), "x");
        assert_eq!(paint(true, "\x1b[33m", "x"), "\x1b[33mx\x1b[0m");
    }
}
