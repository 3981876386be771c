//! Error handling
//!
//! Typed errors for synchronization, transport and document operations.
//! Connection-level failures never reach callers as `SyncError`: they are
//! absorbed by the connection machine's backoff.

use thiserror::Error;

use crate::document::DocumentError;

/// Errors raised by the transport collaborator
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The connection is not open
    #[error("Not connected to the analysis service")]
    NotConnected,

    /// No response arrived within the request window
    #[error("Request timed out after {0} ms")]
    Timeout(u64),

    /// The request was abandoned because its connection went away
    #[error("Request cancelled")]
    Cancelled,

    /// The connection was closed by the peer
    #[error("Connection closed: {0}")]
    Closed(String),

    /// The service rejected the request itself
    #[error("Request error: {0}")]
    Request(String),

    /// The service failed while handling the request
    #[error("Server error: {0}")]
    Server(String),

    /// WebSocket level failure
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// A frame could not be encoded or decoded
    #[error("Codec error: {0}")]
    Codec(String),
}

/// Errors surfaced by the sync service
#[derive(Error, Debug)]
pub enum SyncError {
    /// Caller-initiated abort; never reported to the user
    #[error("Operation cancelled")]
    Cancelled,

    /// Bounded wait exceeded
    #[error("Operation timed out after {0} ms")]
    Timeout(u64),

    /// The server no longer knows the state id the request assumed
    #[error("Server state id is stale")]
    Conflict,

    /// Unexpected or unparseable response
    #[error("Protocol error in '{service}' response: {details}")]
    Protocol { service: &'static str, details: String },

    /// The connection is not open
    #[error("Not connected to the analysis service")]
    NotConnected,

    /// Any other transport failure
    #[error(transparent)]
    Transport(TransportError),

    /// The local document rejected a change
    #[error(transparent)]
    Document(#[from] DocumentError),
}

impl SyncError {
    /// Create a protocol error for a service response
    pub fn protocol(service: &'static str, details: impl Into<String>) -> Self {
        SyncError::Protocol {
            service,
            details: details.into(),
        }
    }

    /// Cancellation and timeout are expected conditions that callers
    /// usually swallow
    pub fn is_cancelled_or_timeout(&self) -> bool {
        matches!(self, SyncError::Cancelled | SyncError::Timeout(_))
    }

    /// Check if a later retry may succeed without user action
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            SyncError::Cancelled
                | SyncError::Timeout(_)
                | SyncError::Conflict
                | SyncError::NotConnected
                | SyncError::Transport(_)
        )
    }
}

impl From<TransportError> for SyncError {
    fn from(error: TransportError) -> Self {
        match error {
            TransportError::Timeout(ms) => SyncError::Timeout(ms),
            TransportError::Cancelled => SyncError::Cancelled,
            TransportError::NotConnected => SyncError::NotConnected,
            other => SyncError::Transport(other),
        }
    }
}

/// Result type for sync operations
pub type SyncResult<T> = Result<T, SyncError>;
