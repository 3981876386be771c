//! Document synchronization
//!
//! Keeps the server's copy of a document in step with local edits over a
//! [`Transport`](crate::transport::Transport).
//!
//! ## Protocol
//!
//! 1. Without a known state id, send the full text and record the id
//!    the server acknowledges
//! 2. Afterwards send accumulated edits as one delta tagged with that id
//! 3. On an `invalidStateId` conflict, go back to step 1
//!
//! ## Usage
//!
//! ```ignore
//! let service = Arc::new(SyncService::new(document, transport, &config.sync, "problem"));
//! service.on_edit(&TextChange::insert(0, "class A."))?;
//! service.synchronize().await?;
//! ```

mod idle;
mod service;
mod tracker;

pub use service::{Cancellable, ContentAssistParams, SyncService, UpdateHook};
pub use tracker::{Acquired, ExclusiveGuard, PendingEdit, UpdateStateTracker};
