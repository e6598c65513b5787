//! Client configuration.
//!
//! Settings come from an optional TOML file and are then overridden by
//! environment variables:
//!
//! - `FENCING_SOCKET`: path of the fencer's Unix socket
//! - `FENCING_CLIENT_NAME`: name announced during registration
//! - `FENCING_TIMEOUT`: default operation timeout in seconds
//! - `FENCING_MAX_RETRIES`: default number of attempts per agent action
//! - `FENCING_KILL_GRACE`: seconds between SIGTERM and SIGKILL
//! - `FENCING_RETRY_DELAY_MS`: pause before re-running a failed agent
//! - `FENCING_CALLBACK_GRACE`: extra seconds granted to the fencer before a
//!   local callback timer gives up

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{FenceError, Result};

const ENV_SOCKET: &str = "FENCING_SOCKET";
const ENV_CLIENT_NAME: &str = "FENCING_CLIENT_NAME";
const ENV_TIMEOUT: &str = "FENCING_TIMEOUT";
const ENV_MAX_RETRIES: &str = "FENCING_MAX_RETRIES";
const ENV_KILL_GRACE: &str = "FENCING_KILL_GRACE";
const ENV_RETRY_DELAY_MS: &str = "FENCING_RETRY_DELAY_MS";
const ENV_CALLBACK_GRACE: &str = "FENCING_CALLBACK_GRACE";

/// Top-level configuration for the fencing client and agent runner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FencingConfig {
    /// Unix socket the fencer listens on.
    pub socket_path: PathBuf,

    /// Client name announced during registration.
    pub client_name: String,

    /// Timeout used when a command does not specify one.
    pub default_timeout_secs: u64,

    /// Maximum attempts per agent action unless the device overrides it.
    pub max_retries: u32,

    /// Seconds between SIGTERM and SIGKILL for a runaway agent.
    pub kill_grace_secs: u64,

    /// Pause before re-running a failed agent.
    pub retry_delay_ms: u64,

    /// Extra time granted to the fencer before a callback timer fires.
    pub callback_grace_secs: u64,
}

impl Default for FencingConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from("/run/fencing/fencer.sock"),
            client_name: "fence-client".to_string(),
            default_timeout_secs: 120,
            max_retries: 2,
            kill_grace_secs: 5,
            retry_delay_ms: 1000,
            callback_grace_secs: 60,
        }
    }
}

impl FencingConfig {
    /// Load configuration from an optional file, then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env();
        Ok(config)
    }

    /// Read configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            FenceError::InvalidArgument(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_toml(&content)
    }

    /// Parse configuration from TOML text.
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| FenceError::InvalidArgument(format!("invalid configuration: {e}")))
    }

    /// Defaults with environment overrides applied.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    fn apply_env(&mut self) {
        if let Ok(socket) = std::env::var(ENV_SOCKET) {
            self.socket_path = PathBuf::from(socket);
        }
        if let Ok(name) = std::env::var(ENV_CLIENT_NAME) {
            if !name.is_empty() {
                self.client_name = name;
            }
        }
        override_from_env(ENV_TIMEOUT, &mut self.default_timeout_secs);
        override_from_env(ENV_MAX_RETRIES, &mut self.max_retries);
        override_from_env(ENV_KILL_GRACE, &mut self.kill_grace_secs);
        override_from_env(ENV_RETRY_DELAY_MS, &mut self.retry_delay_ms);
        override_from_env(ENV_CALLBACK_GRACE, &mut self.callback_grace_secs);
        debug!(socket = %self.socket_path.display(), "Fencing configuration loaded");
    }

    /// Default timeout as a `Duration`.
    #[must_use]
    pub const fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }

    /// Extra time granted to the fencer before local callback timers fire.
    #[must_use]
    pub const fn callback_grace(&self) -> Duration {
        Duration::from_secs(self.callback_grace_secs)
    }

    /// Settings consumed by the agent runner.
    #[must_use]
    pub const fn agent_settings(&self) -> AgentSettings {
        AgentSettings {
            max_retries: self.max_retries,
            kill_grace: Duration::from_secs(self.kill_grace_secs),
            retry_delay: Duration::from_millis(self.retry_delay_ms),
        }
    }
}

fn override_from_env<T: FromStr>(key: &str, target: &mut T) {
    let Ok(raw) = std::env::var(key) else {
        return;
    };
    match raw.trim().parse() {
        Ok(value) => *target = value,
        Err(_) => warn!(variable = key, value = %raw, "Ignoring invalid value"),
    }
}

/// Knobs for running fence agents locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AgentSettings {
    /// Attempts per action unless the device overrides it.
    pub max_retries: u32,
    /// Delay between SIGTERM and SIGKILL.
    pub kill_grace: Duration,
    /// Pause before a retry attempt.
    pub retry_delay: Duration,
}

impl Default for AgentSettings {
    fn default() -> Self {
        FencingConfig::default().agent_settings()
    }
}
