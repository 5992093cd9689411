//! Client identity for polling consumers.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{DomainError, DomainResult};

/// Identifier used when a request does not name a client.
///
/// Reserved: it can never be supplied explicitly, so it is distinct from
/// every real client.
pub const DEBUG_CLIENT_ID: &str = "-1";

/// Maximum length of a client identifier.
pub const MAX_CLIENT_ID_LEN: usize = 64;

/// Opaque identifier of a polling client.
///
/// Each distinct identifier owns its own cursor into the closed-connection
/// stream. Unknown identifiers are registered on their first poll.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(String);

impl ClientId {
    /// Validates a caller-supplied identifier.
    ///
    /// Accepts 1..=64 characters from `[A-Za-z0-9._:-]`. The debug
    /// identifier is rejected.
    pub fn parse(raw: &str) -> DomainResult<Self> {
        if raw.is_empty() {
            return Err(DomainError::InvalidClientId {
                value: raw.to_string(),
                reason: "must not be empty".to_string(),
            });
        }

        if raw.len() > MAX_CLIENT_ID_LEN {
            return Err(DomainError::InvalidClientId {
                value: raw.chars().take(MAX_CLIENT_ID_LEN).collect(),
                reason: format!("longer than {MAX_CLIENT_ID_LEN} characters"),
            });
        }

        if let Some(bad) = raw
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | ':' | '-')))
        {
            return Err(DomainError::InvalidClientId {
                value: raw.to_string(),
                reason: format!("contains invalid character {bad:?}"),
            });
        }

        if raw == DEBUG_CLIENT_ID {
            return Err(DomainError::ReservedClientId(raw.to_string()));
        }

        Ok(Self(raw.to_string()))
    }

    /// Resolves an optional identifier, falling back to the debug client.
    ///
    /// An empty or whitespace-only identifier counts as absent.
    pub fn parse_or_debug(raw: Option<&str>) -> DomainResult<Self> {
        match Self::given(raw) {
            Some(raw) => Self::parse(raw),
            None => Ok(Self::debug()),
        }
    }

    /// Filters out identifiers that are missing or blank.
    pub fn given(raw: Option<&str>) -> Option<&str> {
        raw.filter(|raw| !raw.trim().is_empty())
    }

    /// The debug pseudo-client used for ad-hoc introspection.
    pub fn debug() -> Self {
        Self(DEBUG_CLIENT_ID.to_string())
    }

    /// Returns true for the debug pseudo-client.
    #[must_use]
    pub fn is_debug(&self) -> bool {
        self.0 == DEBUG_CLIENT_ID
    }

    /// Returns the underlying string reference.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for ClientId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
