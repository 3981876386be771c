//! docsync core library
//!
//! This crate keeps a locally edited text document synchronized with a
//! remote, stateful analysis service over a long-lived connection that may
//! drop, be suspended with its tab or lose the network.
//!
//! # Architecture
//!
//! - **Connection**: a pure resilience state machine decides whether the
//!   transport should be open; a tokio driver executes its effects
//! - **Sync**: a state tracker serializes exchanges and merges edits into
//!   deltas; the sync service chooses between full and delta updates
//!
//! Edits are never lost or sent twice: pending edits are cleared only when
//! the server acknowledges them.
//!
//! # Quick Start
//!
//! ```text
//! let config = Config::load()?;
//! let document = Arc::new(SharedDocument::new(text));
//! let session = DocumentSession::new(&config, document);
//! session.connect("ws://localhost:1313/xtext-service");
//! session.wait_until_ready(Duration::from_secs(10)).await?;
//!
//! let hover = session.service().hover(42).await?;
//! ```
//!
//! # Modules
//!
//! - `session`: One synchronized document (main entry point)
//! - `connection`: Connection resilience machine and driver
//! - `sync`: Update state tracking and the sync service
//! - `transport`: Transport trait, wire messages, WebSocket transport
//! - `document`: Text changes and the document seam
//! - `config`: Application configuration
//! - `error`: Error taxonomy

pub mod config;
pub mod connection;
pub mod document;
pub mod error;
pub mod session;
pub mod sync;
pub mod transport;

pub use config::Config;
pub use connection::{ConnectionHandle, ConnectionPhase, ConnectionStatus};
pub use document::{
    diff_texts, DocumentError, DocumentSnapshot, DocumentSource, SelectionRange, SharedDocument,
    TextChange,
};
pub use error::{SyncError, SyncResult, TransportError};
pub use session::{DocumentSession, SessionEvent};
pub use sync::{Cancellable, ContentAssistParams, SyncService};
pub use transport::{Transport, WebSocketTransport};
