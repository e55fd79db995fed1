use std::io;
use std::os::unix::fs::PermissionsExt as _;
use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::discovery::UpstreamSource;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub identities: IdentitiesConfig,
}

impl Config {
    /// Read `path`.  A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                warn!("no config file at {}, using defaults", path.display());
                return Ok(Self::default());
            }
            Err(e) => return Err(e).with_context(|| format!("read {}", path.display())),
        };
        if let Ok(meta) = std::fs::metadata(path)
            && writable_by_others(meta.permissions().mode())
        {
            warn!(
                "{} is writable by other users; it chooses which keys are served",
                path.display()
            );
        }
        toml::from_str(&text).with_context(|| format!("parse {}", path.display()))
    }
}

fn writable_by_others(mode: u32) -> bool {
    mode & 0o022 != 0
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Where to bind the proxy socket.
    ///
    /// Defaults to `$XDG_RUNTIME_DIR/keymux/agent.sock`, or a per-process
    /// directory under the system temp dir when `XDG_RUNTIME_DIR` is unset.
    #[serde(default)]
    pub socket: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// Explicit upstream agent socket.  Skips discovery when set.
    #[serde(default)]
    pub socket: Option<PathBuf>,
    #[serde(default = "default_discover")]
    pub discover: bool,
    /// Discovery strategies, tried in order.
    ///
    /// ```toml
    /// sources = ["env", "launchctl", "1password"]
    /// ```
    #[serde(default = "default_sources")]
    pub sources: Vec<UpstreamSource>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            socket: None,
            discover: default_discover(),
            sources: default_sources(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentitiesConfig {
    /// Scan `~/.ssh` for unencrypted private keys.
    #[serde(default = "default_discover")]
    pub discover: bool,
    /// Additional private key files to load.
    #[serde(default)]
    pub paths: Vec<PathBuf>,
}

impl Default for IdentitiesConfig {
    fn default() -> Self {
        Self {
            discover: default_discover(),
            paths: Vec::new(),
        }
    }
}

fn default_discover() -> bool {
    true
}

fn default_sources() -> Vec<UpstreamSource> {
    vec![
        UpstreamSource::Env,
        UpstreamSource::Launchctl,
        UpstreamSource::OnePassword,
    ]
}

fn default_timeout_secs() -> u64 {
    keymux_agent::upstream::DEFAULT_TIMEOUT.as_secs()
}
