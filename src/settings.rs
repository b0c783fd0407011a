//! User settings.
//!
//! Resolved in layers, later layers winning:
//!
//! 1. built-in defaults
//! 2. `~/.config/vmbundle/settings.toml` (missing file is fine)
//! 3. `VMBUNDLE_BUNDLE_PATH`, `VMBUNDLE_MEMORY_GIB`, `VMBUNDLE_IMAGE_URL`
//! 4. command-line flags, applied by the binaries
//!
//! ```toml
//! bundle_path = "~/VirtualMachine.bundle"
//! memory_gib = 6.5
//! image_url = "https://example.com/UniversalMac_Restore.ipsw"
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::paths::{AppPaths, DEFAULT_BUNDLE, expand_home};
use crate::vm::bundle::BundleLayout;
use crate::vm::config::DEFAULT_MEMORY_GIB;

pub const ENV_BUNDLE_PATH: &str = "VMBUNDLE_BUNDLE_PATH";
pub const ENV_MEMORY_GIB: &str = "VMBUNDLE_MEMORY_GIB";
pub const ENV_IMAGE_URL: &str = "VMBUNDLE_IMAGE_URL";

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("cannot read settings file '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid settings file '{path}': {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid value '{value}' for {var}: {reason}")]
    InvalidValue {
        var: &'static str,
        value: String,
        reason: &'static str,
    },

    #[error("HOME is not set; cannot locate settings or the default bundle")]
    NoHome,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct Settings {
    /// Bundle root. A leading `~/` is expanded on load.
    pub bundle_path: PathBuf,
    /// Desired guest memory. Clamped to host bounds at launch.
    pub memory_gib: f64,
    /// Download this image instead of asking the engine for the latest one.
    pub image_url: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bundle_path: Path::new("~").join(DEFAULT_BUNDLE),
            memory_gib: DEFAULT_MEMORY_GIB,
            image_url: None,
        }
    }
}

impl Settings {
    pub fn from_toml(s: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(s)
    }

    /// Read `path`, or return the defaults when it does not exist.
    pub fn load(path: &Path) -> Result<Self, SettingsError> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no settings file, using defaults");
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(SettingsError::Read {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };
        Self::from_toml(&text).map_err(|source| SettingsError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Apply environment overrides looked up through `env`.
    pub fn with_env(
        mut self,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, SettingsError> {
        if let Some(path) = env(ENV_BUNDLE_PATH).filter(|v| !v.is_empty()) {
            self.bundle_path = PathBuf::from(path);
        }
        if let Some(value) = env(ENV_MEMORY_GIB) {
            self.memory_gib = parse_memory_gib(ENV_MEMORY_GIB, &value)?;
        }
        if let Some(url) = env(ENV_IMAGE_URL) {
            self.image_url = Some(url).filter(|u| !u.is_empty());
        }
        Ok(self)
    }

    /// Expand a leading `~` in the bundle path.
    pub fn expanded(mut self, home: &Path) -> Self {
        self.bundle_path = expand_home(&self.bundle_path, home);
        self
    }

    /// Defaults, then the settings file, then the process environment.
    pub fn load_default() -> Result<Self, SettingsError> {
        let paths = AppPaths::resolve().ok_or(SettingsError::NoHome)?;
        let settings = Self::load(&paths.settings_file())?
            .with_env(|key| std::env::var(key).ok())?
            .expanded(&paths.home);
        debug!(
            bundle = %settings.bundle_path.display(),
            memory_gib = settings.memory_gib,
            image_url = ?settings.image_url,
            "settings resolved"
        );
        Ok(settings)
    }

    pub fn layout(&self) -> BundleLayout {
        BundleLayout::new(&self.bundle_path)
    }
}

/// Command-line flags shared by both binaries; the last settings layer.
#[derive(clap::Args, Debug, Clone, Default)]
pub struct SettingsArgs {
    /// Bundle directory [default: ~/VirtualMachine.bundle]
    #[arg(long, value_name = "PATH")]
    pub bundle: Option<PathBuf>,

    /// Guest memory in GiB, clamped to what the host allows [default: 6]
    #[arg(long, value_name = "GIB", value_parser = parse_memory_flag)]
    pub memory_gib: Option<f64>,

    /// Restore image URL to download instead of the latest supported one
    #[arg(long, value_name = "URL")]
    pub image_url: Option<String>,
}

impl SettingsArgs {
    /// Full resolution: defaults, file, environment, then these flags.
    pub fn resolve(&self) -> Result<Settings, SettingsError> {
        let paths = AppPaths::resolve().ok_or(SettingsError::NoHome)?;
        Ok(self.apply(Settings::load_default()?, &paths.home))
    }

    pub fn apply(&self, mut settings: Settings, home: &Path) -> Settings {
        if let Some(bundle) = &self.bundle {
            settings.bundle_path = expand_home(bundle, home);
        }
        if let Some(gib) = self.memory_gib {
            settings.memory_gib = gib;
        }
        if let Some(url) = &self.image_url {
            settings.image_url = Some(url.clone());
        }
        settings
    }
}

fn parse_memory_flag(value: &str) -> Result<f64, SettingsError> {
    parse_memory_gib("--memory-gib", value)
}

/// Parse a memory size in GiB as given on the command line or environment.
pub fn parse_memory_gib(var: &'static str, value: &str) -> Result<f64, SettingsError> {
    let invalid = |reason| SettingsError::InvalidValue {
        var,
        value: value.to_string(),
        reason,
    };
    let gib: f64 = value.trim().parse().map_err(|_| invalid("not a number"))?;
    if !gib.is_finite() || gib <= 0.0 {
        return Err(invalid("must be a positive number of GiB"));
    }
    Ok(gib)
}
