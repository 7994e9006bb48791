// shared/src/lib.rs

use std::time::Duration;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("not found")]
    NotFound,
    #[error("cache not found: {0}")]
    CacheNotFound(String),
    #[error("configuration: {0}")]
    Configuration(String),
    #[error("serialization: {0}")]
    Serialization(String),
    #[error("storage: {0}")]
    Storage(String),
    #[error("operation failed{}: {message}", status.map(|s| format!(" with status {s}")).unwrap_or_default())]
    Operation { status: Option<u16>, message: String },
    #[error("internal: {0}")]
    Internal(String),
}

impl Error {
    /// Shorthand for an operation failure carrying a status code
    pub fn status(status: u16, message: impl Into<String>) -> Self {
        Error::Operation {
            status: Some(status),
            message: message.into(),
        }
    }

    /// Shorthand for an operation failure without a status code (transport-level)
    pub fn transport(message: impl Into<String>) -> Self {
        Error::Operation {
            status: None,
            message: message.into(),
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Error::Configuration(message.into())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Time-to-live in milliseconds. Zero means the entry never expires.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct TtlMs(pub u64);

impl TtlMs {
    pub const NEVER: TtlMs = TtlMs(0);

    pub fn from_duration(duration: Duration) -> Self {
        TtlMs(duration.as_millis() as u64)
    }

    pub fn is_never(&self) -> bool {
        self.0 == 0
    }

    /// `None` when the entry never expires
    pub fn as_duration(&self) -> Option<Duration> {
        if self.is_never() {
            None
        } else {
            Some(Duration::from_millis(self.0))
        }
    }
}

impl From<Duration> for TtlMs {
    fn from(duration: Duration) -> Self {
        TtlMs::from_duration(duration)
    }
}

pub mod config;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ttl_zero_never_expires() {
        assert!(TtlMs::NEVER.is_never());
        assert_eq!(TtlMs::NEVER.as_duration(), None);
        assert_eq!(TtlMs(250).as_duration(), Some(Duration::from_millis(250)));
    }

    #[test]
    fn test_operation_error_display() {
        assert_eq!(
            Error::status(503, "unavailable").to_string(),
            "operation failed with status 503: unavailable"
        );
        assert_eq!(
            Error::transport("connection reset").to_string(),
            "operation failed: connection reset"
        );
    }

    #[test]
    fn test_serde_json_error_converts_to_serialization() {
        let err: Error = serde_json::from_str::<u32>("not a number").unwrap_err().into();
        assert!(matches!(err, Error::Serialization(_)));
    }
}
