//! Document session
//!
//! One document, one transport, one connection driver and the sync service
//! on top. Connection notifications are forwarded to the service so a
//! reconnect always starts from a full update.
//!
//! ## Usage
//!
//! ```ignore
//! let document = Arc::new(SharedDocument::new(text));
//! let session = DocumentSession::new(&config, document.clone());
//! session.connect("ws://localhost:1313/xtext-service");
//! session.wait_until_ready(Duration::from_secs(10)).await?;
//! session.edit(&TextChange::insert(0, "% header\n"))?;
//! session.service().synchronize().await?;
//! ```

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::config::Config;
use crate::connection::{spawn_connection, ConnectionHandle, ConnectionNotification};
use crate::document::{DocumentError, DocumentSource, TextChange};
use crate::error::{SyncError, SyncResult};
use crate::sync::SyncService;
use crate::transport::{PushMessage, Transport, WebSocketTransport};

/// Events for the editing surface
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Connected, and the reconnect update finished
    Connected,
    Disconnected,
    Push(PushMessage),
}

/// A document kept in sync with the analysis service
pub struct DocumentSession {
    document: Arc<dyn DocumentSource>,
    service: Arc<SyncService>,
    connection: ConnectionHandle,
    /// Number of reconnects whose full update finished
    ready_rx: watch::Receiver<u64>,
    event_rx: Mutex<Option<mpsc::UnboundedReceiver<SessionEvent>>>,
    forwarder: JoinHandle<()>,
}

impl DocumentSession {
    /// Create a session talking WebSocket
    pub fn new(config: &Config, document: Arc<dyn DocumentSource>) -> Self {
        let transport = Arc::new(WebSocketTransport::new(config.sync.request_timeout()));
        Self::with_transport(config, document, transport)
    }

    /// Create a session over any transport
    pub fn with_transport(
        config: &Config,
        document: Arc<dyn DocumentSource>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let service = Arc::new(SyncService::new(
            Arc::clone(&document),
            Arc::clone(&transport),
            &config.sync,
            &config.resource_extension,
        ));
        let connection = spawn_connection(config.connection.clone(), transport);

        let (ready_tx, ready_rx) = watch::channel(0);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let forwarder = match connection.take_notifications() {
            Some(notifications) => tokio::spawn(forward_notifications(
                notifications,
                Arc::clone(&service),
                event_tx,
                Arc::new(ready_tx),
            )),
            None => tokio::spawn(async {}),
        };

        Self {
            document,
            service,
            connection,
            ready_rx,
            event_rx: Mutex::new(Some(event_rx)),
            forwarder,
        }
    }

    /// Configure the endpoint and start connecting
    pub fn connect(&self, endpoint: &str) {
        self.connection.configure(endpoint);
        self.connection.connect();
    }

    pub fn disconnect(&self) {
        self.connection.disconnect();
    }

    pub fn connection(&self) -> &ConnectionHandle {
        &self.connection
    }

    pub fn service(&self) -> &Arc<SyncService> {
        &self.service
    }

    pub fn document(&self) -> &Arc<dyn DocumentSource> {
        &self.document
    }

    /// Apply a local edit
    pub fn edit(&self, change: &TextChange) -> Result<bool, DocumentError> {
        self.service.on_edit(change)
    }

    /// Whether the connection is open and the reconnect update finished
    pub fn is_ready(&self) -> bool {
        let status = self.connection.status();
        status.is_open && *self.ready_rx.borrow() == status.connections
    }

    /// Wait until the connection is open and the server has the full text
    pub async fn wait_until_ready(&self, timeout: Duration) -> SyncResult<()> {
        let mut ready = self.ready_rx.clone();
        let mut status = self.connection.subscribe_status();
        let wait = async {
            loop {
                let handled = *ready.borrow_and_update();
                let done = {
                    let status = status.borrow_and_update();
                    status.is_open && handled == status.connections
                };
                if done {
                    return true;
                }
                tokio::select! {
                    changed = ready.changed() => if changed.is_err() { return false },
                    changed = status.changed() => if changed.is_err() { return false },
                }
            }
        };
        match tokio::time::timeout(timeout, wait).await {
            Ok(true) => Ok(()),
            Ok(false) => Err(SyncError::NotConnected),
            Err(_) => Err(SyncError::Timeout(timeout.as_millis() as u64)),
        }
    }

    /// Take the event stream; only the first caller gets it
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<SessionEvent>> {
        self.event_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }

    /// Close the connection and stop background work
    pub async fn shutdown(self) {
        let Self {
            service,
            connection,
            forwarder,
            ..
        } = self;
        connection.shutdown().await;
        let _ = forwarder.await;
        service.on_disconnect();
    }
}

async fn forward_notifications(
    mut notifications: mpsc::UnboundedReceiver<ConnectionNotification>,
    service: Arc<SyncService>,
    event_tx: mpsc::UnboundedSender<SessionEvent>,
    ready_tx: Arc<watch::Sender<u64>>,
) {
    let mut reconnects = 0;
    while let Some(notification) = notifications.recv().await {
        match notification {
            ConnectionNotification::Reconnected => {
                reconnects += 1;
                let handled = reconnects;
                let update = service.on_reconnect();
                let ready_tx = Arc::clone(&ready_tx);
                let event_tx = event_tx.clone();
                tokio::spawn(async move {
                    if update.await.is_ok() {
                        ready_tx.send_modify(|ready| *ready = (*ready).max(handled));
                        let _ = event_tx.send(SessionEvent::Connected);
                    }
                });
            }
            ConnectionNotification::Disconnected => {
                service.on_disconnect();
                let _ = event_tx.send(SessionEvent::Disconnected);
            }
            ConnectionNotification::Push(push) => {
                let _ = event_tx.send(SessionEvent::Push(push));
            }
        }
    }
    debug!("Connection notifications closed");
}
