use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use crate::{hlog_debug, Error, Result};

fn default_template() -> String {
    "base".to_string()
}

fn default_timeout_secs() -> u64 {
    3600
}

fn default_max_instances() -> usize {
    10
}

/// Swarm configuration, loaded once per command invocation.
///
/// Values come from `~/.hive/hive.toml`, overridden by environment
/// variables (`HIVE_API_KEY`, `HIVE_API_BASE`, `HIVE_AGENT_KEY`).
/// Never persisted alongside instance state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// API key for the sandbox provisioning service.
    pub api_key: Option<String>,
    /// Base URL of the sandbox provisioning service.
    pub api_base: Option<String>,
    /// Sandbox template used for provisioning.
    #[serde(default = "default_template")]
    pub template: String,
    /// Sandbox session timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Upper bound on instances a single spawn may create.
    #[serde(default = "default_max_instances")]
    pub max_instances: usize,
    /// Command used to launch the coding agent inside a sandbox.
    pub agent_command: Option<String>,
    /// API key handed to the coding agent via its environment.
    pub agent_api_key: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_key: None,
            api_base: None,
            template: default_template(),
            timeout_secs: default_timeout_secs(),
            max_instances: default_max_instances(),
            agent_command: None,
            agent_api_key: None,
        }
    }
}

impl Config {
    pub fn hive_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".hive"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::hive_dir()?.join("hive.toml"))
    }

    pub fn state_path() -> Result<PathBuf> {
        Ok(Self::hive_dir()?.join("state.json"))
    }

    /// Well-known directory holding named task lists (`<name>.json`).
    pub fn tasks_dir() -> Result<PathBuf> {
        Ok(Self::hive_dir()?.join("tasks"))
    }

    /// Per-instance export directories live under here.
    pub fn exports_dir() -> Result<PathBuf> {
        Ok(Self::hive_dir()?.join("exports"))
    }

    /// Per-instance log files live under here.
    pub fn logs_dir() -> Result<PathBuf> {
        Ok(Self::hive_dir()?.join("logs"))
    }

    pub fn effective_agent_command(&self) -> &str {
        self.agent_command.as_deref().unwrap_or("claude")
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// API key, required for any command that talks to the sandbox service.
    pub fn require_api_key(&self) -> Result<&str> {
        self.api_key
            .as_deref()
            .ok_or_else(|| Error::Config("missing api_key (set HIVE_API_KEY or hive.toml)".into()))
    }

    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        hlog_debug!("Config::load path={}", path.display());
        let mut config = if path.exists() {
            toml::from_str(&fs::read_to_string(&path)?)?
        } else {
            hlog_debug!("Config file not found, using defaults");
            Self::default()
        };
        if let Ok(key) = std::env::var("HIVE_API_KEY") {
            config.api_key = Some(key);
        }
        if let Ok(base) = std::env::var("HIVE_API_BASE") {
            config.api_base = Some(base);
        }
        if let Ok(key) = std::env::var("HIVE_AGENT_KEY") {
            config.agent_api_key = Some(key);
        }
        hlog_debug!(
            "Config loaded: template={} timeout={}s max_instances={}",
            config.template,
            config.timeout_secs,
            config.max_instances
        );
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let hive_dir = Self::hive_dir()?;
        if !hive_dir.exists() {
            fs::create_dir_all(&hive_dir)?;
        }
        let path = Self::config_path()?;
        fs::write(&path, toml::to_string_pretty(self)?)?;
        hlog_debug!("Config saved to {}", path.display());
        Ok(())
    }

    pub fn ensure_dirs() -> Result<()> {
        for dir in [
            Self::hive_dir()?,
            Self::tasks_dir()?,
            Self::exports_dir()?,
            Self::logs_dir()?,
        ] {
            if !dir.exists() {
                hlog_debug!("Creating directory: {}", dir.display());
                fs::create_dir_all(&dir)?;
            }
        }
        Ok(())
    }
}
