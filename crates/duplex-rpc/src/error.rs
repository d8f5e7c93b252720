//! Error types for duplex-rpc.
//!
//! `RpcError` is what callers of the client, the channel and the value model
//! see. `DispatchError` is the server-side failure that gets stringified into
//! a failure reply and travels back to the caller as `RpcError::Remote`.

use std::any::Any;
use std::time::Duration;
use thiserror::Error;

/// Main error type for duplex-rpc.
#[derive(Debug, Error)]
pub enum RpcError {
    /// Failure reported by the remote side. Displays exactly the text the
    /// server produced, with no prefix.
    #[error("{0}")]
    Remote(String),

    #[error("RPC channel closed")]
    ChannelClosed,

    #[error("RPC call {method} ({uid}) timed out after {timeout:?}")]
    Timeout {
        method: String,
        uid: String,
        timeout: Duration,
    },

    #[error("Malformed envelope: {message}")]
    MalformedEnvelope { message: String },

    #[error("Procedure already registered: {name}")]
    DuplicateProcedure { name: String },

    #[error("Data clone error: {message}")]
    DataClone { message: String },

    #[error("Range error: {message}")]
    Range { message: String },

    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },
}

/// Result type alias for duplex-rpc operations.
pub type Result<T> = std::result::Result<T, RpcError>;

impl From<serde_json::Error> for RpcError {
    fn from(err: serde_json::Error) -> Self {
        RpcError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl RpcError {
    pub(crate) fn malformed(message: impl Into<String>) -> Self {
        RpcError::MalformedEnvelope {
            message: message.into(),
        }
    }

    /// The remote failure text, if this error came from the server.
    pub fn remote_message(&self) -> Option<&str> {
        match self {
            RpcError::Remote(message) => Some(message),
            _ => None,
        }
    }

    /// Check if the channel underneath is gone for good.
    pub fn is_channel_closed(&self) -> bool {
        matches!(self, RpcError::ChannelClosed)
    }
}

/// Failure produced while dispatching one request on the server.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("Unknown RPC method \"{0}\"")]
    UnknownMethod(String),

    /// The procedure returned an error, or panicked.
    #[error("{0}")]
    Failed(String),
}

impl DispatchError {
    /// Stringify a procedure failure, keeping the whole context chain.
    pub fn from_procedure(err: &anyhow::Error) -> Self {
        DispatchError::Failed(format!("{:#}", err))
    }
}

/// Text of a caught panic payload.
pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        *message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.as_str()
    } else {
        "unknown panic"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_error_display_is_verbatim() {
        let err = RpcError::Remote("Unknown RPC method \"mul\"".into());
        assert_eq!(err.to_string(), "Unknown RPC method \"mul\"");
        assert_eq!(err.remote_message(), Some("Unknown RPC method \"mul\""));
    }

    #[test]
    fn test_unknown_method_display() {
        let err = DispatchError::UnknownMethod("mul".into());
        assert_eq!(err.to_string(), "Unknown RPC method \"mul\"");
    }

    #[test]
    fn test_procedure_failure_keeps_context_chain() {
        let err = anyhow::anyhow!("boom").context("while adding");
        let dispatch = DispatchError::from_procedure(&err);
        assert_eq!(dispatch.to_string(), "while adding: boom");
    }

    #[test]
    fn test_panic_message_from_payload() {
        let caught = std::panic::catch_unwind(|| panic!("kaboom {}", 7)).unwrap_err();
        assert_eq!(panic_message(&*caught), "kaboom 7");
        let caught = std::panic::catch_unwind(|| panic!("static")).unwrap_err();
        assert_eq!(panic_message(&*caught), "static");
    }

    #[test]
    fn test_channel_closed_predicate() {
        assert!(RpcError::ChannelClosed.is_channel_closed());
        assert!(!RpcError::Remote("x".into()).is_channel_closed());
    }
}
