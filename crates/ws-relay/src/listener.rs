use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::rejection::ExtensionRejection;
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use http::header::{
    ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS, ACCESS_CONTROL_ALLOW_ORIGIN,
};
use http::{HeaderValue, StatusCode, Uri};
use tokio::net::TcpListener;
use tower_http::set_header::SetResponseHeaderLayer;

use crate::frame::FrameLink;
use crate::gate::AccessGate;
use crate::session::RelaySession;
use crate::upstream::WsConnector;

/// Body of the plain `GET /` liveness response.
pub const HEALTH_MESSAGE: &str = "Gemini Live Proxy is running.";

/// An accepted client connection as seen by the relay.
pub type DownstreamLink = FrameLink<WebSocket, Message>;

/// Configuration for the relay front door.
pub struct RelayConfig {
    /// Address to bind the listening socket to.
    pub listen_addr: SocketAddr,
    /// Authorization policy applied to every upgrade request.
    pub gate: AccessGate,
    /// Opens the upstream connection for each session.
    pub connector: WsConnector,
}

/// The relay server.
///
/// Answers liveness checks, authorizes WebSocket upgrades through the
/// [`AccessGate`], and runs one [`RelaySession`] per accepted client in its
/// own task.
pub struct Relay {
    config: Arc<RelayConfig>,
}

impl Relay {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    /// Bind `listen_addr` and serve until `shutdown` resolves.
    pub async fn run<F>(&self, shutdown: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.config.listen_addr).await?;
        self.serve(listener, shutdown).await
    }

    /// Serve on an already bound listener until `shutdown` resolves.
    pub async fn serve<F>(&self, listener: TcpListener, shutdown: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = listener.local_addr()?;
        tracing::info!(
            %addr,
            upstream = %self.config.connector.endpoint(),
            "live relay listening"
        );

        let app = router(Arc::clone(&self.config));
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown)
        .await?;

        tracing::info!("live relay stopped accepting connections");
        Ok(())
    }
}

/// Build the HTTP router: `GET /` for liveness, WebSocket upgrades on any
/// path, and permissive cross-origin headers on every response.
pub fn router(config: Arc<RelayConfig>) -> Router {
    Router::new()
        .route("/", get(root))
        .fallback(fallback)
        .with_state(config)
        .layer(SetResponseHeaderLayer::overriding(
            ACCESS_CONTROL_ALLOW_ORIGIN,
            HeaderValue::from_static("*"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            ACCESS_CONTROL_ALLOW_METHODS,
            HeaderValue::from_static("GET, POST, OPTIONS"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            ACCESS_CONTROL_ALLOW_HEADERS,
            HeaderValue::from_static("Content-Type"),
        ))
}

async fn root(
    State(config): State<Arc<RelayConfig>>,
    remote: Result<ConnectInfo<SocketAddr>, ExtensionRejection>,
    target: Uri,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    match upgrade {
        Ok(ws) => accept(config, ws, &target, remote_addr(remote)),
        Err(_) => HEALTH_MESSAGE.into_response(),
    }
}

async fn fallback(
    State(config): State<Arc<RelayConfig>>,
    remote: Result<ConnectInfo<SocketAddr>, ExtensionRejection>,
    target: Uri,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    match upgrade {
        Ok(ws) => accept(config, ws, &target, remote_addr(remote)),
        Err(_) => StatusCode::NOT_FOUND.into_response(),
    }
}

fn remote_addr(remote: Result<ConnectInfo<SocketAddr>, ExtensionRejection>) -> Option<SocketAddr> {
    remote.ok().map(|ConnectInfo(addr)| addr)
}

/// Run the access gate, then either refuse the upgrade with 401 or hand the
/// socket and credential to a new session.
fn accept(
    config: Arc<RelayConfig>,
    ws: WebSocketUpgrade,
    target: &Uri,
    remote_addr: Option<SocketAddr>,
) -> Response {
    let credential = match config.gate.admit(target) {
        Ok(credential) => credential,
        Err(rejection) => {
            tracing::debug!(?remote_addr, %rejection, "refusing upgrade");
            return rejection.into_response();
        }
    };

    ws.on_upgrade(move |socket| async move {
        let downstream: DownstreamLink = FrameLink::new(socket);
        let session = RelaySession::new(downstream, credential);
        tracing::info!(session_id = %session.id(), ?remote_addr, "client connected");
        session.run(&config.connector).await;
    })
}
