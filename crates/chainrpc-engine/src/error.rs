//! Error types for engine operations

use chainrpc_protocol::RpcError;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

/// One-shot completion for a pending call
pub type Completion<T> = Box<dyn FnOnce(Result<T>) + Send + 'static>;

/// Errors surfaced by the engine
///
/// `Encoding`, `IdentifiersExhausted` and `Closed` are returned synchronously
/// from `call_method`/`subscribe`. Everything else arrives through the
/// operation's callback.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EngineError {
    #[error("Failed to encode request: {0}")]
    Encoding(String),

    #[error("All request identifiers are in use")]
    IdentifiersExhausted,

    #[error("Engine is closed")]
    Closed,

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Failed to decode payload: {0}")]
    Decode(String),

    #[error("Remote error: {0}")]
    Remote(RpcError),

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Subscription terminated by its handler")]
    Unsubscribed,
}

impl EngineError {
    pub(crate) fn decode(err: impl std::fmt::Display) -> Self {
        EngineError::Decode(err.to_string())
    }
}

impl From<RpcError> for EngineError {
    fn from(err: RpcError) -> Self {
        EngineError::Remote(err)
    }
}

/// Failure reported by a subscription handler while processing a push
///
/// Non-terminal by default: the engine reports it back through
/// `handle_error(error, false)` and keeps the subscription alive. A terminal
/// failure tears the subscription down first and reports
/// `handle_error(error, true)`.
#[derive(Debug, Clone, PartialEq)]
pub struct HandlerError {
    pub error: EngineError,
    pub terminate: bool,
}

impl HandlerError {
    pub fn recoverable(error: EngineError) -> Self {
        Self {
            error,
            terminate: false,
        }
    }

    pub fn terminal(error: EngineError) -> Self {
        Self {
            error,
            terminate: true,
        }
    }
}

impl From<EngineError> for HandlerError {
    fn from(error: EngineError) -> Self {
        Self::recoverable(error)
    }
}
