use clap::Parser;
use std::path::PathBuf;

use crate::config::{AuthMode, Config};

#[derive(Parser, Debug)]
#[command(name = "live-relay", version, about = "WebSocket proxy for the Gemini Live API")]
pub struct Cli {
    /// Path to the configuration file
    #[arg(short, long, default_value = "live-relay.yaml")]
    pub config: PathBuf,

    /// Port to listen on (overrides config file setting)
    #[arg(long, env = "PORT")]
    pub port: Option<u16>,

    /// Interface address to bind (overrides config file setting)
    #[arg(long, env = "HOST")]
    pub host: Option<String>,

    /// How clients are authorized (overrides config file setting)
    #[arg(long, env = "RELAY_AUTH_MODE", value_enum)]
    pub auth_mode: Option<AuthMode>,

    /// Upstream WebSocket endpoint (overrides config file setting)
    #[arg(long, env = "RELAY_UPSTREAM_URL")]
    pub upstream_url: Option<String>,
}

impl Cli {
    /// Merge command-line and environment overrides into `cfg`.
    pub fn apply_overrides(&self, cfg: &mut Config) {
        if let Some(port) = self.port {
            cfg.network.port = port;
        }
        if let Some(ref host) = self.host {
            cfg.network.host = host.clone();
        }
        if let Some(mode) = self.auth_mode {
            cfg.auth.mode = mode;
        }
        if let Some(ref url) = self.upstream_url {
            cfg.upstream.url = url.clone();
        }
    }
}
