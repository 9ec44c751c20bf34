//! Error types shared across the purge proxy.
//!
//! Tag validation has its own [`FilterError`] so its message stays exactly
//! what operators see in logs and responses; everything else funnels into
//! [`PurgeError`].

use std::fmt;

/// A tag selector that is not of the form `KEY:VALUE`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterError {
    raw: String,
}

impl FilterError {
    pub fn new(raw: impl Into<String>) -> Self {
        Self { raw: raw.into() }
    }

    /// The offending tag string, as supplied.
    pub fn raw(&self) -> &str {
        &self.raw
    }
}

impl fmt::Display for FilterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "expected TAG:VALUE got {}", self.raw)
    }
}

impl std::error::Error for FilterError {}

/// Unified error type for the purge proxy
#[derive(Debug)]
pub enum PurgeError {
    /// Invalid tag selector
    Filter(FilterError),

    /// Inventory lookup failures
    Discovery(String),

    /// Per-target forwarding failures, including request construction
    Forward(String),

    /// Network and I/O errors
    Network(std::io::Error),

    /// Pingora framework errors
    Pingora(Box<pingora_error::Error>),
}

impl fmt::Display for PurgeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PurgeError::Filter(err) => write!(f, "{err}"),
            PurgeError::Discovery(msg) => write!(f, "Discovery failed: {msg}"),
            PurgeError::Forward(msg) => write!(f, "Forward failed: {msg}"),
            PurgeError::Network(err) => write!(f, "Network error: {err}"),
            PurgeError::Pingora(err) => write!(f, "Pingora error: {err}"),
        }
    }
}

impl std::error::Error for PurgeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PurgeError::Filter(err) => Some(err),
            PurgeError::Network(err) => Some(err),
            PurgeError::Pingora(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

impl From<FilterError> for PurgeError {
    fn from(err: FilterError) -> Self {
        PurgeError::Filter(err)
    }
}

impl From<std::io::Error> for PurgeError {
    fn from(err: std::io::Error) -> Self {
        PurgeError::Network(err)
    }
}

impl From<Box<pingora_error::Error>> for PurgeError {
    fn from(err: Box<pingora_error::Error>) -> Self {
        PurgeError::Pingora(err)
    }
}

impl From<etcd_client::Error> for PurgeError {
    fn from(err: etcd_client::Error) -> Self {
        PurgeError::Discovery(format!("etcd: {err}"))
    }
}

/// Result type alias for purge proxy operations
pub type PurgeResult<T> = std::result::Result<T, PurgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_error_message_is_verbatim() {
        let err = PurgeError::from(FilterError::new("machinetypevarnish"));
        assert_eq!(err.to_string(), "expected TAG:VALUE got machinetypevarnish");
    }
}
