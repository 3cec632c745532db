mod cli;
mod config;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{debug, info, warn};

use ws_relay::{AccessGate, Relay, RelayConfig, WsConnector};

use crate::cli::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Parse CLI args (flags and their environment fallbacks).
    let cli = Cli::parse();

    // 2. Load config, then merge CLI overrides.
    let mut cfg = config::load(&cli.config)?;
    cli.apply_overrides(&mut cfg);

    // 3. Init tracing-subscriber with JSON format.
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cfg.logging.level));

    tracing_subscriber::fmt()
        .json()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_thread_ids(true)
        .init();

    if !cli.config.exists() {
        warn!(
            path = %cli.config.display(),
            "configuration file not found; running on defaults and overrides"
        );
    }

    // 4. TLS for the upstream connection.
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        debug!("TLS crypto provider already installed");
    }

    // 5. Resolve authorization. A shared-mode relay without a key must not start.
    let gate = config::build_gate(&cfg.auth, |name| std::env::var(name).ok())
        .context("failed to configure client authorization")?;

    let connector = WsConnector::new(&cfg.upstream.url)
        .context("invalid upstream url")?
        .with_handshake_timeout(cfg.upstream.handshake_timeout());

    let listen_addr = cfg
        .network
        .listen_addr()
        .context("invalid listen address")?;

    match &gate {
        AccessGate::PerClient { min_len } => info!(
            auth_mode = "per-client",
            min_key_length = *min_len,
            "clients supply their own API key"
        ),
        AccessGate::Shared(credential) => info!(
            auth_mode = "shared",
            key_env = %cfg.auth.api_key_env,
            key_prefix = %credential.redacted(),
            "using server-side API key"
        ),
    }

    info!(
        config_file = %cli.config.display(),
        listen = %listen_addr,
        upstream = %connector.endpoint(),
        handshake_timeout_secs = ?cfg.upstream.handshake_timeout_secs,
        "live-relay starting"
    );

    // 6. Serve until ctrl-c or SIGTERM.
    let relay = Relay::new(RelayConfig {
        listen_addr,
        gate,
        connector,
    });
    relay
        .run(shutdown_signal())
        .await
        .context("relay server failed")?;

    info!("live-relay shut down");
    Ok(())
}

/// Resolve once the process is asked to stop.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {
                        info!("received SIGINT (ctrl-c)");
                    }
                    _ = sigterm.recv() => {
                        info!("received SIGTERM");
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "failed to register SIGTERM handler; waiting for ctrl-c only");
                ctrl_c.await.ok();
                info!("received SIGINT (ctrl-c)");
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("received SIGINT (ctrl-c)");
    }
}
