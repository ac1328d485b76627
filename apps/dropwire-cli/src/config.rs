//! CLI configuration.
//!
//! Configuration is read from TOML, by default
//! `~/.config/dropwire/config.toml`. A missing default file is not an
//! error; every field has a default.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use dropwire_transfer::TransferConfig;
use serde::{Deserialize, Serialize};

/// Top-level configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Chunking, backpressure and retry knobs.
    pub transfer: TransferConfig,
    pub receive: ReceiveConfig,
}

/// Defaults for `dropwire receive`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReceiveConfig {
    pub listen: SocketAddr,
    pub out_dir: PathBuf,
    /// Seconds to wait for the sender to connect (0 = forever).
    pub accept_timeout_secs: u64,
}

impl Default for ReceiveConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 9470)),
            out_dir: PathBuf::from("."),
            accept_timeout_secs: 0,
        }
    }
}

impl ReceiveConfig {
    pub fn accept_timeout(&self) -> Option<Duration> {
        (self.accept_timeout_secs > 0).then(|| Duration::from_secs(self.accept_timeout_secs))
    }
}

impl Config {
    /// Loads `path`, or the default location if `path` is `None`.
    ///
    /// An explicit path must exist; the default one is optional.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let (path, required) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => (config_path(), false),
        };

        if !path.exists() {
            if required {
                anyhow::bail!("config file not found: {}", path.display());
            }
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config: Config =
            toml::from_str(&content).with_context(|| format!("parsing {}", path.display()))?;
        config.transfer.validate()?;

        tracing::debug!(path = %path.display(), "configuration loaded");
        Ok(config)
    }
}

/// Returns the platform-specific configuration file path.
fn config_path() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        let appdata =
            std::env::var("APPDATA").unwrap_or_else(|_| "C:\\Users\\Default\\AppData".into());
        PathBuf::from(appdata).join("dropwire").join("config.toml")
    }

    #[cfg(not(target_os = "windows"))]
    {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
        PathBuf::from(home)
            .join(".config")
            .join("dropwire")
            .join("config.toml")
    }
}
