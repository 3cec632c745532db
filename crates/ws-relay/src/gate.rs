use axum::response::{IntoResponse, Response};
use http::{StatusCode, Uri};
use thiserror::Error;

use crate::credential::{self, Credential};

/// Body of the 401 response sent when an upgrade is refused.
pub const UNAUTHORIZED_REASON: &str = "Unauthorized: API Key missing or invalid.";

/// Default minimum key length for per-client authorization.
pub const DEFAULT_MIN_KEY_LEN: usize = 10;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum Rejection {
    #[error("no API key supplied")]
    Missing,
    #[error("API key too short ({len} < {min} characters)")]
    TooShort { len: usize, min: usize },
}

impl IntoResponse for Rejection {
    fn into_response(self) -> Response {
        (StatusCode::UNAUTHORIZED, UNAUTHORIZED_REASON).into_response()
    }
}

/// Connection-time authorization policy.
///
/// This is a structural sanity check only. The remote API performs the
/// real authorization when the upstream connection is opened.
#[derive(Debug, Clone)]
pub enum AccessGate {
    /// Every client supplies its own key in the `key` query parameter.
    PerClient { min_len: usize },
    /// One key, loaded at startup, is used for every session. The request
    /// target is not consulted.
    Shared(Credential),
}

impl Default for AccessGate {
    fn default() -> Self {
        Self::PerClient {
            min_len: DEFAULT_MIN_KEY_LEN,
        }
    }
}

impl AccessGate {
    /// Decide whether an upgrade request may proceed.
    ///
    /// On success the credential to use for the upstream connection is
    /// returned; the caller moves it into the session.
    pub fn admit(&self, target: &Uri) -> Result<Credential, Rejection> {
        match self {
            Self::Shared(credential) => Ok(credential.clone()),
            Self::PerClient { min_len } => {
                let result = check_per_client(target, *min_len);
                if let Err(ref rejection) = result {
                    let key_prefix = credential::raw_key_param(target)
                        .map(|raw| credential::redact(&raw))
                        .unwrap_or_else(|| "<none>".to_string());
                    tracing::warn!(%rejection, %key_prefix, "upgrade rejected");
                }
                result
            }
        }
    }
}

fn check_per_client(target: &Uri, min_len: usize) -> Result<Credential, Rejection> {
    let credential = credential::extract_credential(target).ok_or(Rejection::Missing)?;
    let len = credential.len();
    if len < min_len {
        return Err(Rejection::TooShort { len, min: min_len });
    }
    Ok(credential)
}
