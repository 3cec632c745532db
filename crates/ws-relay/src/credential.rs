use std::fmt;

use http::Uri;

/// Name of the query parameter carrying the caller's API key.
pub const KEY_PARAM: &str = "key";

/// Number of leading characters shown when a credential is logged.
const VISIBLE_PREFIX: usize = 4;

/// An opaque API key used to authorize the upstream connection.
///
/// The raw value is only reachable through [`Credential::expose`]. Both
/// `Debug` and `Display` print a truncated prefix so a credential can be
/// passed to `tracing` fields without leaking it.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    /// Wrap a raw key. Returns `None` for an empty string.
    pub fn new(raw: impl Into<String>) -> Option<Self> {
        let raw = raw.into();
        if raw.is_empty() {
            None
        } else {
            Some(Self(raw))
        }
    }

    /// The raw key, for embedding in the outbound request only.
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Length in characters.
    pub fn len(&self) -> usize {
        self.0.chars().count()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Truncated, log-safe rendering of the key.
    pub fn redacted(&self) -> String {
        redact(&self.0)
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Credential").field(&self.redacted()).finish()
    }
}

impl fmt::Display for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.redacted())
    }
}

/// Render at most the first few characters of a secret followed by an
/// ellipsis. Values no longer than the prefix are fully masked.
pub fn redact(secret: &str) -> String {
    if secret.chars().count() <= VISIBLE_PREFIX {
        return "****".to_string();
    }
    let prefix: String = secret.chars().take(VISIBLE_PREFIX).collect();
    format!("{prefix}...")
}

/// Pull the caller-supplied key out of an upgrade request target.
///
/// Only the first `key` parameter is considered. A missing query, a missing
/// parameter and an empty value all yield `None`; this never fails.
pub fn extract_credential(target: &Uri) -> Option<Credential> {
    let query = target.query()?;
    let (_, value) = url::form_urlencoded::parse(query.as_bytes())
        .find(|(name, _)| name == KEY_PARAM)?;
    Credential::new(value.into_owned())
}

/// Raw value of the first `key` parameter, if any, for rejection logging.
pub(crate) fn raw_key_param(target: &Uri) -> Option<String> {
    let query = target.query()?;
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(name, _)| name == KEY_PARAM)
        .map(|(_, value)| value.into_owned())
}
