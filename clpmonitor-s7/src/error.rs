//! Error types for controller access.

use thiserror::Error;

/// Result type alias using [`PlcError`].
pub type Result<T> = std::result::Result<T, PlcError>;

/// Errors raised by the protocol client and the tag model.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlcError {
    /// Transport or handshake failure, including timeouts.
    #[error("Connection failed: {0}")]
    Connection(String),

    /// Malformed or rejected controller response.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Bit index out of range, value too long for its capacity, unsupported kind.
    #[error("Invalid address: {0}")]
    Address(String),

    /// Malformed hex or numeric text.
    #[error("Invalid format: {0}")]
    Format(String),

    /// Required field missing.
    #[error("Validation failed: {0}")]
    Validation(String),
}

/// Stable classification of a [`PlcError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Connection,
    Protocol,
    Address,
    Format,
    Validation,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Connection => "connection",
            ErrorKind::Protocol => "protocol",
            ErrorKind::Address => "address",
            ErrorKind::Format => "format",
            ErrorKind::Validation => "validation",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl PlcError {
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    pub fn address(msg: impl Into<String>) -> Self {
        Self::Address(msg.into())
    }

    pub fn format(msg: impl Into<String>) -> Self {
        Self::Format(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            PlcError::Connection(_) => ErrorKind::Connection,
            PlcError::Protocol(_) => ErrorKind::Protocol,
            PlcError::Address(_) => ErrorKind::Address,
            PlcError::Format(_) => ErrorKind::Format,
            PlcError::Validation(_) => ErrorKind::Validation,
        }
    }

    /// Whether the failure happened on the wire rather than in the request itself.
    pub fn is_device_failure(&self) -> bool {
        matches!(self, PlcError::Connection(_) | PlcError::Protocol(_))
    }
}

impl From<std::io::Error> for PlcError {
    fn from(err: std::io::Error) -> Self {
        Self::Connection(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_classification() {
        assert_eq!(PlcError::connection("x").kind(), ErrorKind::Connection);
        assert_eq!(PlcError::validation("x").kind().as_str(), "validation");
        assert!(PlcError::protocol("x").is_device_failure());
        assert!(!PlcError::format("x").is_device_failure());
    }

    #[test]
    fn test_io_error_is_connection() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        assert_eq!(PlcError::from(io).kind(), ErrorKind::Connection);
    }
}
