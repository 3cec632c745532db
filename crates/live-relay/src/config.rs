use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;
use ws_relay::{AccessGate, Credential, DEFAULT_MIN_KEY_LEN, DEFAULT_UPSTREAM_URL};

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize)]
pub struct NetworkConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl NetworkConfig {
    pub fn listen_addr(&self) -> anyhow::Result<SocketAddr> {
        let ip: IpAddr = self
            .host
            .parse()
            .with_context(|| format!("invalid listen host '{}'", self.host))?;
        Ok(SocketAddr::new(ip, self.port))
    }
}

#[derive(Debug, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default = "default_upstream_url")]
    pub url: String,
    /// Unset means wait for the remote handshake indefinitely.
    #[serde(default)]
    pub handshake_timeout_secs: Option<u64>,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            url: default_upstream_url(),
            handshake_timeout_secs: None,
        }
    }
}

impl UpstreamConfig {
    pub fn handshake_timeout(&self) -> Option<Duration> {
        self.handshake_timeout_secs.map(Duration::from_secs)
    }
}

/// How upgrade requests are authorized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum AuthMode {
    /// Each client passes its own key as `?key=...`.
    #[default]
    PerClient,
    /// A single key from the environment is used for every client.
    Shared,
}

#[derive(Debug, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub mode: AuthMode,
    #[serde(default = "default_min_key_length")]
    pub min_key_length: usize,
    /// Environment variable holding the key in shared mode.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            mode: AuthMode::default(),
            min_key_length: default_min_key_length(),
            api_key_env: default_api_key_env(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

// ---------------------------------------------------------------------------
// Default-value functions used by serde
// ---------------------------------------------------------------------------

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_upstream_url() -> String {
    DEFAULT_UPSTREAM_URL.to_string()
}

fn default_min_key_length() -> usize {
    DEFAULT_MIN_KEY_LEN
}

fn default_api_key_env() -> String {
    "GEMINI_API_KEY".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Load configuration from a YAML file.
///
/// If the file does not exist a default configuration is returned, so the
/// relay can start from environment variables and CLI flags alone.
pub fn load(path: &Path) -> anyhow::Result<Config> {
    if !path.exists() {
        return Ok(Config::default());
    }

    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;

    parse(&contents).with_context(|| format!("failed to parse config file {}", path.display()))
}

pub fn parse(contents: &str) -> anyhow::Result<Config> {
    if contents.trim().is_empty() {
        return Ok(Config::default());
    }
    Ok(serde_yml::from_str(contents)?)
}

/// Build the access gate for the configured mode.
///
/// In shared mode the key is read once through `lookup` (the process
/// environment in production). A missing or empty key is an error, and the
/// relay must not start.
pub fn build_gate<F>(auth: &AuthConfig, lookup: F) -> anyhow::Result<AccessGate>
where
    F: Fn(&str) -> Option<String>,
{
    match auth.mode {
        AuthMode::PerClient => Ok(AccessGate::PerClient {
            min_len: auth.min_key_length,
        }),
        AuthMode::Shared => {
            let credential = lookup(&auth.api_key_env)
                .and_then(Credential::new)
                .with_context(|| {
                    format!(
                        "{} environment variable is not set; set it before starting the relay",
                        auth.api_key_env
                    )
                })?;
            Ok(AccessGate::Shared(credential))
        }
    }
}
