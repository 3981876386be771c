//! Transport to the analysis service
//!
//! A single persistent, message-oriented connection carrying correlated
//! request/response pairs. Connection-level failures are reported through
//! [`TransportEvents`] rather than as results of individual requests.
//!
//! ## Usage
//!
//! ```ignore
//! let transport = WebSocketTransport::new(Duration::from_secs(15));
//! transport.open(&url, events).await?;
//! let response = transport.send(ServiceRequest::full_text_update(&resource, text)).await?;
//! ```

mod message;
#[cfg(test)]
pub(crate) mod testing;
mod websocket;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use url::Url;

use crate::error::TransportError;

pub use message::{
    conflict_of, parse_response, ConflictKind, ContentAssistEntry, ContentAssistResult, Delta,
    DocumentStateResult, FormattingResult, HoverResult, OccurrencesResult, PushMessage,
    ReplaceRegion, RequestKind, Response, ServiceRequest, TextRegion,
};
pub use websocket::WebSocketTransport;

/// Signals a transport raises outside any request
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// The connection failed or was closed by the peer
    Failed(String),
    /// The server pushed a message
    Push(PushMessage),
}

/// Sink for the signals of one open attempt
#[derive(Debug, Clone)]
pub struct TransportEvents {
    attempt: u64,
    tx: mpsc::UnboundedSender<(u64, TransportEvent)>,
}

impl TransportEvents {
    pub fn new(attempt: u64, tx: mpsc::UnboundedSender<(u64, TransportEvent)>) -> Self {
        Self { attempt, tx }
    }

    pub fn attempt(&self) -> u64 {
        self.attempt
    }

    pub fn failed(&self, message: impl Into<String>) {
        let _ = self
            .tx
            .send((self.attempt, TransportEvent::Failed(message.into())));
    }

    pub fn push(&self, message: PushMessage) {
        let _ = self.tx.send((self.attempt, TransportEvent::Push(message)));
    }
}

/// The connection primitive the sync core relies on
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open the connection, replacing any previous one
    async fn open(&self, endpoint: &Url, events: TransportEvents) -> Result<(), TransportError>;

    /// Close the connection; pending requests fail with `Cancelled`
    async fn close(&self);

    /// Send a request and wait for its correlated response
    async fn send(&self, request: ServiceRequest) -> Result<Value, TransportError>;

    /// Liveness probe
    async fn ping(&self) -> Result<(), TransportError>;

    fn is_open(&self) -> bool;

    /// Fail every in-flight request with `Cancelled`
    fn cancel_pending(&self);
}
