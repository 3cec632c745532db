//! Authenticating WebSocket relay for live streaming APIs.
//!
//! This crate implements a transparent relay that sits between browser
//! clients and a remote streaming endpoint (the Gemini Live API by
//! default). Each accepted client gets its own upstream connection and
//! frames are passed through verbatim in both directions.
//!
//! # Architecture
//!
//! ```text
//! Client  <--WS-->  ws-relay  <--WSS-->  Remote API
//!                     |
//!               [Access Gate]
//! ```
//!
//! The front door answers `GET /` liveness checks and authorizes each
//! upgrade request from its `key` query parameter before the WebSocket is
//! established. A [`RelaySession`] then opens the upstream connection and
//! forwards frames until either side goes away. Client frames that arrive
//! before the upstream is open are dropped, and an upstream failure is
//! reported to the client as a single `{"error": ...}` text frame.

pub mod credential;
pub mod frame;
pub mod gate;
pub mod listener;
pub mod session;
pub mod upstream;

// Re-export the primary public types at the crate root for convenience.
pub use credential::{extract_credential, Credential};
pub use frame::{Frame, FrameLink};
pub use gate::{AccessGate, Rejection, DEFAULT_MIN_KEY_LEN, UNAUTHORIZED_REASON};
pub use listener::{router, Relay, RelayConfig, HEALTH_MESSAGE};
pub use session::{
    ConnectionState, RelaySession, SessionReport, SessionState, Termination,
    UPSTREAM_FAILURE_MESSAGE,
};
pub use upstream::{Connect, UpstreamError, WsConnector, DEFAULT_UPSTREAM_URL};
