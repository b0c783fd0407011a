//! Application directory structure for vmbundle.
//!
//! Follows macOS conventions:
//!
//! - Config:  `~/.config/vmbundle/`  (human-editable, XDG-style)
//! - Logs:    `~/Library/Logs/vmbundle/`
//! - Bundle:  `~/VirtualMachine.bundle/`  (default, overridable in settings)
//!
//! On non-macOS, falls back to XDG paths.

use std::path::{Path, PathBuf};
use tracing::info;

const APP_NAME: &str = "vmbundle";
const SETTINGS_FILE: &str = "settings.toml";
/// Bundle directory name under the home directory when none is configured.
pub const DEFAULT_BUNDLE: &str = "VirtualMachine.bundle";

/// All resolved application paths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppPaths {
    /// Home directory the other paths were derived from.
    pub home: PathBuf,
    /// Human-editable config: `~/.config/vmbundle/`
    pub config: PathBuf,
    /// Application logs
    pub logs: PathBuf,
}

impl AppPaths {
    /// Resolve from the process environment. `None` when `HOME` is unset.
    pub fn resolve() -> Option<Self> {
        Self::resolve_with(|key| std::env::var(key).ok())
    }

    /// Resolve using `env` for variable lookups.
    pub fn resolve_with(env: impl Fn(&str) -> Option<String>) -> Option<Self> {
        let home = env("HOME").map(PathBuf::from)?;
        let config = resolve_config_dir(&home, &env);
        let logs = resolve_log_dir(&home, &env);
        Some(Self { home, config, logs })
    }

    pub fn settings_file(&self) -> PathBuf {
        self.config.join(SETTINGS_FILE)
    }

    /// Create the config and log directories if missing.
    pub fn ensure(&self) -> std::io::Result<()> {
        for dir in [&self.config, &self.logs] {
            std::fs::create_dir_all(dir)?;
            info!("ensured directory: {}", dir.display());
        }
        Ok(())
    }
}

/// Expand a leading `~/` (or a bare `~`) against `home`.
pub fn expand_home(path: &Path, home: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => home.join(rest),
        Err(_) => path.to_path_buf(),
    }
}

// ---------------------------------------------------------------------------
// Platform-specific path resolution
// ---------------------------------------------------------------------------

fn resolve_config_dir(home: &Path, env: &impl Fn(&str) -> Option<String>) -> PathBuf {
    if let Some(xdg) = env("XDG_CONFIG_HOME") {
        PathBuf::from(xdg).join(APP_NAME)
    } else {
        home.join(".config").join(APP_NAME)
    }
}

#[cfg(target_os = "macos")]
fn resolve_log_dir(home: &Path, _env: &impl Fn(&str) -> Option<String>) -> PathBuf {
    home.join("Library").join("Logs").join(APP_NAME)
}

#[cfg(not(target_os = "macos"))]
fn resolve_log_dir(home: &Path, env: &impl Fn(&str) -> Option<String>) -> PathBuf {
    if let Some(xdg) = env("XDG_DATA_HOME") {
        PathBuf::from(xdg).join(APP_NAME).join("logs")
    } else {
        home.join(".local").join("share").join(APP_NAME).join("logs")
    }
}
