//! Error types for the tether runtime.
//!
//! A single error enum covers the whole runtime: transport and protocol
//! faults raised by a connection, call-local failures (cancellation, unknown
//! function, invalid arguments) and failures reported back by the peer.

use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Main error type for tether operations.
#[derive(Debug, Error)]
pub enum RpcError {
    // Connection-level faults
    #[error("Transport error: {message}")]
    Transport {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("Protocol error: {0}")]
    Protocol(String),

    // Call-local faults
    #[error("Unknown function: {0}")]
    UnknownFunction(String),

    #[error("Call cancelled")]
    Cancelled,

    #[error("Call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Invalid argument for {field}: {message}")]
    InvalidArgument { field: String, message: String },

    #[error("Remote error [{code}]: {message}")]
    Remote { code: FaultCode, message: String },

    #[error("Handler error: {0}")]
    Handler(String),

    // Payload boundary
    #[error("Payload type mismatch: expected {expected}, got {actual}")]
    PayloadType { expected: String, actual: String },

    #[error("Codec error: {message}")]
    Codec {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    #[error("Endpoint has been disposed")]
    Disposed,
}

/// Result type alias for tether operations.
pub type Result<T> = std::result::Result<T, RpcError>;

impl From<std::io::Error> for RpcError {
    fn from(err: std::io::Error) -> Self {
        RpcError::Transport {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for RpcError {
    fn from(err: serde_json::Error) -> Self {
        RpcError::Codec {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl RpcError {
    /// Build an `InvalidArgument` error.
    pub fn invalid_argument(field: impl Into<String>, message: impl Into<String>) -> Self {
        RpcError::InvalidArgument {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Convert to the fault code carried by a failed response frame.
    ///
    /// Remote errors keep the code they arrived with so that a handler forwarding
    /// a downstream failure does not rewrite it.
    pub fn fault_code(&self) -> FaultCode {
        match self {
            RpcError::UnknownFunction(_) => FaultCode::UnknownFunction,
            RpcError::Cancelled | RpcError::Timeout(_) => FaultCode::Cancelled,
            RpcError::InvalidArgument { .. } => FaultCode::InvalidArgument,
            RpcError::Handler(_) => FaultCode::Handler,
            RpcError::PayloadType { .. } | RpcError::Codec { .. } => FaultCode::Codec,
            RpcError::Remote { code, .. } => *code,

            // Everything else is an internal failure of the serving side
            _ => FaultCode::Internal,
        }
    }

    /// Whether this error came from local cancellation or a deadline.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, RpcError::Cancelled | RpcError::Timeout(_))
    }

    /// Whether a reconnecting wrapper should try again after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RpcError::Transport { .. } | RpcError::Timeout(_))
    }
}

/// Failure classification carried on the wire by a failed response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultCode {
    UnknownFunction,
    Cancelled,
    InvalidArgument,
    Handler,
    Codec,
    Internal,
}

impl FaultCode {
    pub fn as_u16(&self) -> u16 {
        match self {
            FaultCode::UnknownFunction => 1,
            FaultCode::Cancelled => 2,
            FaultCode::InvalidArgument => 3,
            FaultCode::Handler => 4,
            FaultCode::Codec => 5,
            FaultCode::Internal => 6,
        }
    }

    /// Decode a wire code. Codes from newer peers collapse to `Internal`.
    pub fn from_u16(code: u16) -> Self {
        match code {
            1 => FaultCode::UnknownFunction,
            2 => FaultCode::Cancelled,
            3 => FaultCode::InvalidArgument,
            4 => FaultCode::Handler,
            5 => FaultCode::Codec,
            _ => FaultCode::Internal,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FaultCode::UnknownFunction => "unknown_function",
            FaultCode::Cancelled => "cancelled",
            FaultCode::InvalidArgument => "invalid_argument",
            FaultCode::Handler => "handler",
            FaultCode::Codec => "codec",
            FaultCode::Internal => "internal",
        }
    }
}

impl fmt::Display for FaultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = RpcError::UnknownFunction("Sqrt".into());
        assert_eq!(err.to_string(), "Unknown function: Sqrt");

        let err = RpcError::Remote {
            code: FaultCode::Handler,
            message: "boom".into(),
        };
        assert_eq!(err.to_string(), "Remote error [handler]: boom");
    }

    #[test]
    fn test_fault_codes() {
        assert_eq!(
            RpcError::UnknownFunction("x".into()).fault_code(),
            FaultCode::UnknownFunction
        );
        assert_eq!(RpcError::Cancelled.fault_code(), FaultCode::Cancelled);
        assert_eq!(RpcError::Disposed.fault_code(), FaultCode::Internal);
        assert_eq!(
            RpcError::Remote {
                code: FaultCode::InvalidArgument,
                message: String::new(),
            }
            .fault_code(),
            FaultCode::InvalidArgument
        );
    }

    #[test]
    fn test_fault_code_wire_values() {
        for code in [
            FaultCode::UnknownFunction,
            FaultCode::Cancelled,
            FaultCode::InvalidArgument,
            FaultCode::Handler,
            FaultCode::Codec,
            FaultCode::Internal,
        ] {
            assert_eq!(FaultCode::from_u16(code.as_u16()), code);
        }
        assert_eq!(FaultCode::from_u16(999), FaultCode::Internal);
    }

    #[test]
    fn test_classification() {
        assert!(RpcError::Timeout(Duration::from_secs(1)).is_cancellation());
        assert!(RpcError::Cancelled.is_cancellation());
        assert!(!RpcError::Disposed.is_cancellation());

        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe");
        assert!(RpcError::from(io).is_retryable());
        assert!(!RpcError::UnknownFunction("x".into()).is_retryable());
    }
}
