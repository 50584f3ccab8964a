use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Server configuration, loaded from a TOML file with full defaults so an
/// empty (or absent) file yields a runnable development setup.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub api_host: String,
    pub api_port: u16,
    pub db_path: PathBuf,
    /// Scheduler pass period, seconds.
    pub scheduler_tick_seconds: u64,
    /// Idle keepalive on device command streams, seconds.
    pub command_keepalive_seconds: u64,
    /// Idle keepalive on dashboard event streams, seconds.
    pub event_keepalive_seconds: u64,
    /// Per-agent classification timeout, seconds.
    pub agent_timeout_seconds: u64,
    /// Minimum gap between notifications for one device, seconds.
    pub notification_cooldown_seconds: i64,
    /// Webhook for abnormal-capture alerts; alerts go to the log when unset.
    pub notify_webhook_url: Option<String>,
    pub agents: AgentsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentsConfig {
    #[serde(default)]
    pub primary: AgentConfig,
    #[serde(default = "default_secondary_agent")]
    pub secondary: AgentConfig,
}

fn default_secondary_agent() -> AgentConfig {
    AgentsConfig::default().secondary
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub provider: String,
    pub base_url: String,
    pub api_key: String,
    pub model: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_host: "127.0.0.1".to_string(),
            api_port: 8470,
            db_path: PathBuf::from("watchpost.db"),
            scheduler_tick_seconds: 1,
            command_keepalive_seconds: 30,
            event_keepalive_seconds: 15,
            agent_timeout_seconds: 20,
            notification_cooldown_seconds: 300,
            notify_webhook_url: None,
            agents: AgentsConfig::default(),
        }
    }
}

impl Default for AgentsConfig {
    fn default() -> Self {
        Self {
            primary: AgentConfig {
                provider: "openai".to_string(),
                base_url: "https://api.openai.com/v1/chat/completions".to_string(),
                api_key: String::new(),
                model: "gpt-4o-mini".to_string(),
            },
            secondary: AgentConfig {
                provider: "gemini".to_string(),
                base_url:
                    "https://generativelanguage.googleapis.com/v1beta/models/{model}:generateContent"
                        .to_string(),
                api_key: String::new(),
                model: "gemini-2.0-flash".to_string(),
            },
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        AgentsConfig::default().primary
    }
}

impl Config {
    /// Loads from `path`, falling back to `WATCHPOST_CONFIG`, then to
    /// `watchpost.toml` in the working directory, then to pure defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let candidate = path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os("WATCHPOST_CONFIG").map(PathBuf::from))
            .or_else(|| {
                let local = PathBuf::from("watchpost.toml");
                local.exists().then_some(local)
            });

        let Some(candidate) = candidate else {
            return Ok(Self::default());
        };
        let raw = std::fs::read_to_string(&candidate)
            .with_context(|| format!("reading config file {}", candidate.display()))?;
        toml::from_str(&raw)
            .with_context(|| format!("parsing config file {}", candidate.display()))
    }
}
