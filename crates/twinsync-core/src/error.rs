//! Error type shared by every twinsync component.
//!
//! All variants are recoverable at the message or cycle boundary: a failed
//! message is dropped, a failed estimation cycle is skipped, and the cache and
//! lifecycle state keep their last values.

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, TwinError>;

#[derive(Debug, Error)]
pub enum TwinError {
    /// Malformed or type-mismatched inbound payload. The message is dropped.
    #[error("parse error: {0}")]
    Parse(String),

    /// ODTE requested on an empty sample window. Transient.
    #[error("insufficient data: {0}")]
    InsufficientData(String),

    /// Configuration fault such as a zero expected message rate.
    #[error("invalid parameters: {0}")]
    InvalidParameters(String),

    /// Configuration file could not be read or decoded.
    #[error("config error: {0}")]
    Config(String),

    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("metrics registry error: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl TwinError {
    /// True for conditions that are expected to clear on their own.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::InsufficientData(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_messages() {
        let e = TwinError::Parse("missing timestamp".into());
        assert_eq!(e.to_string(), "parse error: missing timestamp");
        let e = TwinError::InvalidParameters("expected rate is zero".into());
        assert_eq!(e.to_string(), "invalid parameters: expected rate is zero");
    }

    #[test]
    fn only_insufficient_data_is_transient() {
        assert!(TwinError::InsufficientData("empty".into()).is_transient());
        assert!(!TwinError::Parse("x".into()).is_transient());
        assert!(!TwinError::InvalidParameters("x".into()).is_transient());
    }
}
