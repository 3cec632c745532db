use std::fmt;

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tracing::Instrument;

use crate::credential::Credential;
use crate::frame::Frame;
use crate::upstream::{Connect, UpstreamError};

/// Message carried by the error notice sent to the client when the
/// upstream connection fails.
pub const UPSTREAM_FAILURE_MESSAGE: &str = "Upstream API connection failed or was interrupted";

/// Lifecycle of one connection handle. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closing,
    Closed,
}

impl ConnectionState {
    /// Move to `next` if it is later in the lifecycle. Returns whether the
    /// state changed.
    pub fn advance(&mut self, next: ConnectionState) -> bool {
        if next > *self {
            *self = next;
            true
        } else {
            false
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Waiting for the upstream handshake.
    Establishing,
    /// Both handles open, frames flow both ways.
    Relaying,
    Terminated,
}

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Termination {
    /// The client went away (close, read error or failed write).
    DownstreamClosed,
    /// The remote side closed the connection normally.
    UpstreamClosed,
    /// The upstream handshake or connection failed. Holds the error text
    /// for logging; the client only sees [`UPSTREAM_FAILURE_MESSAGE`].
    UpstreamFailed(String),
}

/// Summary returned once a session has torn down both handles.
#[derive(Debug, Clone)]
pub struct SessionReport {
    pub session_id: uuid::Uuid,
    pub termination: Termination,
    /// Frames delivered client -> remote.
    pub frames_upstream: u64,
    /// Frames delivered remote -> client.
    pub frames_downstream: u64,
    /// Client frames discarded because the upstream was not yet open.
    pub frames_dropped: u64,
}

/// Pairs one accepted client connection with one upstream connection.
///
/// The downstream handle is fixed at construction. The upstream handle is
/// created by [`run`](Self::run) through a [`Connect`] implementation and
/// lives only inside that call, so a session never holds more than one.
pub struct RelaySession<D> {
    id: uuid::Uuid,
    downstream: D,
    credential: Credential,
    state: SessionState,
    downstream_state: ConnectionState,
    upstream_state: ConnectionState,
    frames_upstream: u64,
    frames_downstream: u64,
    frames_dropped: u64,
}

/// Work picked by the `Establishing` select. Errors are reduced to text as
/// soon as they are read.
enum EstablishStep<U> {
    Connected(Result<U, UpstreamError>),
    FromDownstream(Option<Result<Frame, String>>),
}

/// Work picked by the `Relaying` select.
enum RelayStep {
    FromDownstream(Option<Result<Frame, String>>),
    FromUpstream(Option<Result<Frame, String>>),
}

impl<D, DE> RelaySession<D>
where
    D: Stream<Item = Result<Frame, DE>> + Sink<Frame> + Unpin,
    DE: fmt::Display,
{
    /// Create a session for an already accepted downstream connection.
    pub fn new(downstream: D, credential: Credential) -> Self {
        Self {
            id: uuid::Uuid::new_v4(),
            downstream,
            credential,
            state: SessionState::Establishing,
            downstream_state: ConnectionState::Open,
            upstream_state: ConnectionState::Connecting,
            frames_upstream: 0,
            frames_downstream: 0,
            frames_dropped: 0,
        }
    }

    pub fn id(&self) -> uuid::Uuid {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Open the upstream connection and relay frames until either side
    /// closes or fails. Both handles are closed when this returns.
    pub async fn run<C: Connect>(self, connector: &C) -> SessionReport {
        let span = tracing::info_span!("session", session_id = %self.id);
        self.drive(connector).instrument(span).await
    }

    async fn drive<C: Connect>(mut self, connector: &C) -> SessionReport {
        tracing::info!(credential = %self.credential, "session established, connecting upstream");

        let termination = match self.establish(connector).await {
            Ok(upstream) => self.relay::<C>(upstream).await,
            Err(termination) => termination,
        };
        self.state = SessionState::Terminated;

        let report = SessionReport {
            session_id: self.id,
            termination,
            frames_upstream: self.frames_upstream,
            frames_downstream: self.frames_downstream,
            frames_dropped: self.frames_dropped,
        };
        tracing::info!(
            termination = ?report.termination,
            frames_upstream = report.frames_upstream,
            frames_downstream = report.frames_downstream,
            frames_dropped = report.frames_dropped,
            "session terminated"
        );
        report
    }

    /// `Establishing`: wait for the upstream handshake while discarding
    /// anything the client sends in the meantime.
    async fn establish<C: Connect>(&mut self, connector: &C) -> Result<C::Upstream, Termination> {
        let credential = self.credential.clone();
        let connect = connector.connect(&credential);
        tokio::pin!(connect);

        loop {
            let step = tokio::select! {
                // Drain client frames that are already queued before
                // accepting the open, so they are never forwarded.
                biased;
                inbound = self.downstream.next() => {
                    EstablishStep::FromDownstream(inbound.map(|r| r.map_err(|e| e.to_string())))
                }
                result = &mut connect => EstablishStep::Connected(result),
            };

            match step {
                EstablishStep::FromDownstream(Some(Ok(frame))) => {
                    self.frames_dropped += 1;
                    tracing::debug!(
                        bytes = frame.len(),
                        binary = frame.is_binary(),
                        "dropping client frame received before upstream open"
                    );
                }
                EstablishStep::FromDownstream(Some(Err(err))) => {
                    tracing::debug!(%err, "client read error while connecting upstream");
                    return Err(self.abandon_connect().await);
                }
                EstablishStep::FromDownstream(None) => {
                    tracing::info!("client disconnected while connecting upstream");
                    return Err(self.abandon_connect().await);
                }
                EstablishStep::Connected(Ok(upstream)) => {
                    self.upstream_state.advance(ConnectionState::Open);
                    self.state = SessionState::Relaying;
                    tracing::info!("upstream connection open");
                    return Ok(upstream);
                }
                EstablishStep::Connected(Err(err)) => {
                    tracing::error!(%err, "upstream connection failed");
                    self.upstream_state.advance(ConnectionState::Closed);
                    return Err(self.fail(err.to_string()).await);
                }
            }
        }
    }

    /// `Relaying`: forward frames verbatim in both directions.
    async fn relay<C: Connect>(&mut self, mut upstream: C::Upstream) -> Termination {
        loop {
            let step = tokio::select! {
                inbound = self.downstream.next() => {
                    RelayStep::FromDownstream(inbound.map(|r| r.map_err(|e| e.to_string())))
                }
                outbound = upstream.next() => {
                    RelayStep::FromUpstream(outbound.map(|r| r.map_err(|e| e.to_string())))
                }
            };

            match step {
                RelayStep::FromDownstream(Some(Ok(frame))) => {
                    if let Err(err) = upstream.send(frame).await {
                        let err = err.to_string();
                        tracing::error!(%err, "upstream write failed");
                        self.upstream_state.advance(ConnectionState::Closed);
                        return self.fail(err).await;
                    }
                    self.frames_upstream += 1;
                }
                RelayStep::FromDownstream(Some(Err(err))) => {
                    tracing::debug!(%err, "client read error");
                    return self.on_downstream_closed::<C>(&mut upstream).await;
                }
                RelayStep::FromDownstream(None) => {
                    tracing::info!("client disconnected");
                    return self.on_downstream_closed::<C>(&mut upstream).await;
                }
                RelayStep::FromUpstream(Some(Ok(frame))) => {
                    if self.downstream.send(frame).await.is_err() {
                        tracing::debug!("client write failed, treating client as gone");
                        return self.on_downstream_closed::<C>(&mut upstream).await;
                    }
                    self.frames_downstream += 1;
                }
                RelayStep::FromUpstream(Some(Err(err))) => {
                    tracing::error!(%err, "upstream connection error");
                    self.upstream_state.advance(ConnectionState::Closed);
                    return self.fail(err).await;
                }
                RelayStep::FromUpstream(None) => {
                    tracing::info!("upstream closed the connection");
                    self.close_upstream::<C>(&mut upstream).await;
                    self.close_downstream().await;
                    return Termination::UpstreamClosed;
                }
            }
        }
    }

    /// The client is gone before the upstream opened. Dropping the pending
    /// connect future cancels the attempt.
    async fn abandon_connect(&mut self) -> Termination {
        self.upstream_state.advance(ConnectionState::Closed);
        self.close_downstream().await;
        Termination::DownstreamClosed
    }

    /// Close both handles once the client is gone. Closing the client as
    /// well flushes the reply to its close frame.
    async fn on_downstream_closed<C: Connect>(&mut self, upstream: &mut C::Upstream) -> Termination {
        self.close_upstream::<C>(upstream).await;
        self.close_downstream().await;
        Termination::DownstreamClosed
    }

    async fn close_upstream<C: Connect>(&mut self, upstream: &mut C::Upstream) {
        if self.upstream_state.advance(ConnectionState::Closing) {
            if let Err(err) = upstream.close().await {
                tracing::debug!(%err, "upstream close failed");
            }
            self.upstream_state.advance(ConnectionState::Closed);
        }
    }

    /// Send the single error notice to the client, then close it.
    async fn fail(&mut self, detail: String) -> Termination {
        if self.downstream_state == ConnectionState::Open {
            let notice = serde_json::json!({ "error": UPSTREAM_FAILURE_MESSAGE }).to_string();
            if self.downstream.send(Frame::Text(notice)).await.is_err() {
                tracing::debug!("could not deliver error notice to client");
            }
        }
        self.close_downstream().await;
        Termination::UpstreamFailed(detail)
    }

    async fn close_downstream(&mut self) {
        if self.downstream_state.advance(ConnectionState::Closing) {
            if self.downstream.close().await.is_err() {
                tracing::debug!("client close failed");
            }
            self.downstream_state.advance(ConnectionState::Closed);
        }
    }
}
