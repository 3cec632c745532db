use std::future::Future;
use std::time::Duration;

use futures_util::{Sink, Stream};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use url::Url;

use crate::credential::{Credential, KEY_PARAM};
use crate::frame::{Frame, FrameLink};

/// Gemini Live bidirectional streaming endpoint.
pub const DEFAULT_UPSTREAM_URL: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1alpha.GenerativeService.BidiGenerateContent";

/// An open upstream connection as seen by the relay.
pub type UpstreamLink = FrameLink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("invalid upstream endpoint: {0}")]
    InvalidEndpoint(#[from] url::ParseError),

    #[error("upstream handshake failed: {0}")]
    Handshake(#[source] tungstenite::Error),

    #[error("upstream handshake did not complete within {0:?}")]
    HandshakeTimeout(Duration),
}

/// Opens the upstream half of a session.
///
/// A resolved `Ok` means the remote handshake completed and the connection
/// is open. The returned value reads and writes [`Frame`]s; closing it as a
/// sink closes the connection. There is exactly one attempt per call.
pub trait Connect: Send + Sync {
    type Upstream: Stream<Item = Result<Frame, Self::Error>>
        + Sink<Frame, Error = Self::Error>
        + Send
        + Unpin;
    type Error: std::fmt::Display + Send;

    fn connect(
        &self,
        credential: &Credential,
    ) -> impl Future<Output = Result<Self::Upstream, UpstreamError>> + Send;
}

/// Connects to the remote streaming API over WebSocket, passing the
/// credential as the `key` query parameter.
#[derive(Debug, Clone)]
pub struct WsConnector {
    endpoint: Url,
    handshake_timeout: Option<Duration>,
}

impl WsConnector {
    pub fn new(endpoint: &str) -> Result<Self, UpstreamError> {
        let endpoint = Url::parse(endpoint)?;
        Ok(Self {
            endpoint,
            handshake_timeout: None,
        })
    }

    /// Abort the handshake if the remote side has not answered in time.
    pub fn with_handshake_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Endpoint without the credential, safe to log.
    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    /// Full connection URL for one session. Contains the raw key.
    fn url_for(&self, credential: &Credential) -> Url {
        let mut url = self.endpoint.clone();
        url.query_pairs_mut()
            .append_pair(KEY_PARAM, credential.expose());
        url
    }
}

impl Connect for WsConnector {
    type Upstream = UpstreamLink;
    type Error = tungstenite::Error;

    async fn connect(&self, credential: &Credential) -> Result<UpstreamLink, UpstreamError> {
        let url = self.url_for(credential);
        let handshake = tokio_tungstenite::connect_async(url.as_str());

        let result = match self.handshake_timeout {
            Some(limit) => tokio::time::timeout(limit, handshake)
                .await
                .map_err(|_| UpstreamError::HandshakeTimeout(limit))?,
            None => handshake.await,
        };

        let (ws, response) = result.map_err(UpstreamError::Handshake)?;
        tracing::debug!(
            endpoint = %self.endpoint,
            status = %response.status(),
            "upstream handshake complete"
        );
        Ok(FrameLink::new(ws))
    }
}
