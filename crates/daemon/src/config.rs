use serde::Deserialize;
use std::fs;
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

use crate::error::ConfigError;

/// Top-level configuration for natpunch.
#[derive(Debug, Deserialize, Default, Clone)]
pub struct Config {
    #[serde(default)]
    pub log_level: Option<String>,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub resolver: ResolverConfig,
    #[serde(default)]
    pub timing: TimingConfig,
}

/// Registry (rendezvous server) settings.
#[derive(Debug, Deserialize, Clone)]
pub struct RegistryConfig {
    #[serde(default = "default_registry_port")]
    pub port: u16,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            port: default_registry_port(),
        }
    }
}

/// Punching agent settings.
#[derive(Debug, Deserialize, Default, Clone)]
pub struct AgentConfig {
    /// Base URL of the registry, e.g. `http://1.2.3.4:21200`
    #[serde(default)]
    pub server: String,
    /// UDP port to bind and advertise. 0 lets the OS pick one.
    #[serde(default)]
    pub local_port: u16,
    /// Identifier this agent registers under
    #[serde(default)]
    pub local_id: String,
    /// Serve agent metrics over HTTP on this port
    pub metrics_port: Option<u16>,
}

/// How the agent learns its public IP.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ResolverKind {
    #[default]
    Http,
    Stun,
    Static,
}

/// Address resolver settings.
#[derive(Debug, Deserialize, Clone)]
pub struct ResolverConfig {
    #[serde(default)]
    pub kind: ResolverKind,
    /// Echo service answering with JSON `{"ip": "..."}`
    #[serde(default = "default_echo_url")]
    pub echo_url: String,
    /// Empty means the built-in list
    #[serde(default)]
    pub stun_servers: Vec<String>,
    /// Required when `kind = "static"`
    pub public_ip: Option<IpAddr>,
    #[serde(default = "default_resolve_timeout")]
    pub timeout_ms: u64,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            kind: ResolverKind::default(),
            echo_url: default_echo_url(),
            stun_servers: Vec::new(),
            public_ip: None,
            timeout_ms: default_resolve_timeout(),
        }
    }
}

impl ResolverConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Timing configuration for punching and registry calls.
#[derive(Debug, Deserialize, Clone)]
pub struct TimingConfig {
    /// Interval between keepalive datagrams while punching
    /// Default: 1000
    #[serde(default = "default_keepalive_interval")]
    pub keepalive_interval_ms: u64,

    /// Timeout for each registry HTTP request
    /// Default: 10
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            keepalive_interval_ms: default_keepalive_interval(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl TimingConfig {
    /// Get keepalive interval as Duration
    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms)
    }

    /// Get registry request timeout as Duration
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Flat client format: `{"server": ..., "localPort": ..., "localID": ...}`.
#[derive(Debug, Deserialize)]
struct LegacyClientConfig {
    server: String,
    #[serde(rename = "localPort")]
    local_port: u16,
    #[serde(rename = "localID")]
    local_id: String,
}

impl From<LegacyClientConfig> for Config {
    fn from(legacy: LegacyClientConfig) -> Self {
        Config {
            agent: AgentConfig {
                server: legacy.server,
                local_port: legacy.local_port,
                local_id: legacy.local_id,
                metrics_port: None,
            },
            ..Config::default()
        }
    }
}

fn default_registry_port() -> u16 {
    21200
}
fn default_echo_url() -> String {
    "https://api.ipify.org?format=json".to_string()
}
fn default_resolve_timeout() -> u64 {
    3000
}
fn default_keepalive_interval() -> u64 {
    1000
}
fn default_request_timeout() -> u64 {
    10
}

impl Config {
    /// Load configuration from a TOML file, or from the flat JSON client
    /// format when the path ends in `.json`.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let display = path.display().to_string();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: display.clone(),
            source,
        })?;

        let is_json = path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("json"))
            .unwrap_or(false);

        if is_json {
            Self::from_json(&content).map_err(|message| ConfigError::Parse {
                path: display,
                message,
            })
        } else {
            toml::from_str(&content).map_err(|e| ConfigError::Parse {
                path: display,
                message: e.to_string(),
            })
        }
    }

    fn from_json(content: &str) -> Result<Self, String> {
        serde_json::from_str::<LegacyClientConfig>(content)
            .map(Config::from)
            .map_err(|e| e.to_string())
    }

    /// Load the first config file found on the default search path, or the
    /// defaults when none exists. A file that exists but does not parse is
    /// an error.
    pub fn load_or_default() -> Result<Self, ConfigError> {
        Self::load_first(&[
            "/etc/natpunch/config.toml",
            "~/.natpunch/config.toml",
            "./config.toml",
            "./config.json",
        ])
    }

    fn load_first(paths: &[&str]) -> Result<Self, ConfigError> {
        for path in paths {
            let expanded = shellexpand::tilde(path).to_string();
            if Path::new(&expanded).exists() {
                return Self::load(&expanded);
            }
        }
        Ok(Self::default())
    }

    /// Check the settings the agent cannot start without.
    pub fn validate_agent(&self) -> Result<(), ConfigError> {
        if self.agent.server.trim().is_empty() {
            return Err(ConfigError::Invalid("agent.server is required".into()));
        }
        if self.agent.local_id.trim().is_empty() {
            return Err(ConfigError::Invalid("agent.local_id is required".into()));
        }
        if self.resolver.kind == ResolverKind::Static && self.resolver.public_ip.is_none() {
            return Err(ConfigError::Invalid(
                "resolver.public_ip is required when resolver.kind = \"static\"".into(),
            ));
        }
        if self.timing.keepalive_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "timing.keepalive_interval_ms must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}
