//! WebSocket transport implementation
//!
//! Frames are JSON text messages:
//! - request `{"id", "request"}`, answered by `{"id", "response"}` or
//!   `{"id", "error", "message"}`
//! - keepalive `{"ping"}`, answered by `{"pong"}`
//! - server push `{"resource", "pushService", "push"}`

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, trace, warn};
use url::Url;

use super::message::{PushMessage, ServiceRequest};
use super::{Transport, TransportEvents};
use crate::error::TransportError;

type Reply = oneshot::Sender<Result<Value, TransportError>>;

#[derive(Serialize)]
struct RequestFrame<'a> {
    id: &'a str,
    request: &'a ServiceRequest,
}

#[derive(Serialize)]
struct PingFrame<'a> {
    ping: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
enum ErrorKind {
    Request,
    Server,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ServerFrame {
    Error {
        id: String,
        error: ErrorKind,
        #[serde(default)]
        message: Option<String>,
    },
    Response {
        id: String,
        response: Value,
    },
    Pong {
        pong: String,
    },
    Push(PushMessage),
}

/// Requests and pings waiting for their answer
#[derive(Default)]
struct Pending {
    requests: HashMap<String, Reply>,
    pings: HashMap<String, Reply>,
}

impl Pending {
    fn fail_all(&mut self, error: TransportError) {
        for (_, reply) in self.requests.drain().chain(self.pings.drain()) {
            let _ = reply.send(Err(error.clone()));
        }
    }
}

/// State owned by one connection
///
/// A reader task that outlives its connection only ever touches its own
/// link, never the one that replaced it.
#[derive(Default)]
struct Link {
    open: AtomicBool,
    pending: Mutex<Pending>,
}

impl Link {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn pending(&self) -> std::sync::MutexGuard<'_, Pending> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Mark the link closed and fail everything still waiting on it
    fn close(&self, error: TransportError) {
        self.open.store(false, Ordering::SeqCst);
        self.pending().fail_all(error);
    }
}

struct Connection {
    link: Arc<Link>,
    outgoing: mpsc::UnboundedSender<Message>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

/// Transport over a single WebSocket connection
pub struct WebSocketTransport {
    request_timeout: Duration,
    next_id: AtomicU64,
    connection: Mutex<Option<Connection>>,
}

impl WebSocketTransport {
    pub fn new(request_timeout: Duration) -> Self {
        Self {
            request_timeout,
            next_id: AtomicU64::new(1),
            connection: Mutex::new(None),
        }
    }

    fn connection(&self) -> std::sync::MutexGuard<'_, Option<Connection>> {
        self.connection.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn next_id(&self) -> String {
        self.next_id.fetch_add(1, Ordering::Relaxed).to_string()
    }

    /// The current connection, if it is open
    fn current(&self) -> Result<(Arc<Link>, mpsc::UnboundedSender<Message>), TransportError> {
        match self.connection().as_ref() {
            Some(connection) if connection.link.is_open() => {
                Ok((Arc::clone(&connection.link), connection.outgoing.clone()))
            }
            _ => Err(TransportError::NotConnected),
        }
    }

    fn take_connection(&self) -> Option<Connection> {
        self.connection().take()
    }

    /// Send a frame and wait for the reply registered under `id`
    async fn round_trip(
        &self,
        id: String,
        frame: String,
        register: fn(&mut Pending) -> &mut HashMap<String, Reply>,
    ) -> Result<Value, TransportError> {
        let (link, outgoing) = self.current()?;
        let (reply_tx, reply_rx) = oneshot::channel();
        register(&mut link.pending()).insert(id.clone(), reply_tx);

        if outgoing.send(Message::Text(frame)).is_err() {
            register(&mut link.pending()).remove(&id);
            return Err(TransportError::NotConnected);
        }

        match tokio::time::timeout(self.request_timeout, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(TransportError::Cancelled),
            Err(_) => {
                register(&mut link.pending()).remove(&id);
                Err(TransportError::Timeout(self.request_timeout.as_millis() as u64))
            }
        }
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn open(&self, endpoint: &Url, events: TransportEvents) -> Result<(), TransportError> {
        if let Some(previous) = self.take_connection() {
            shutdown(previous);
        }
        debug!("Connecting to {}", endpoint);
        let (ws_stream, _response) = connect_async(endpoint.as_str())
            .await
            .map_err(|e| TransportError::WebSocket(e.to_string()))?;
        let (mut write, mut read) = ws_stream.split();

        let (outgoing, mut outgoing_rx) = mpsc::unbounded_channel::<Message>();
        let writer_events = events.clone();
        let writer = tokio::spawn(async move {
            while let Some(message) = outgoing_rx.recv().await {
                let closing = matches!(message, Message::Close(_));
                if let Err(e) = write.send(message).await {
                    writer_events.failed(format!("WebSocket write failed: {}", e));
                    break;
                }
                if closing {
                    break;
                }
            }
        });

        let link = Arc::new(Link {
            open: AtomicBool::new(true),
            pending: Mutex::default(),
        });
        let reader_link = Arc::clone(&link);
        let reader = tokio::spawn(async move {
            let reason = loop {
                match read.next().await {
                    Some(Ok(Message::Text(text))) => dispatch_frame(&text, &reader_link, &events),
                    Some(Ok(Message::Close(frame))) => {
                        break frame
                            .map(|f| format!("closed by server: {} {}", f.code, f.reason))
                            .unwrap_or_else(|| "closed by server".to_string());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break format!("WebSocket error: {}", e),
                    None => break "connection ended".to_string(),
                }
            };
            reader_link.close(TransportError::Closed(reason.clone()));
            events.failed(reason);
        });

        let replaced = self.connection().replace(Connection {
            link,
            outgoing,
            reader,
            writer,
        });
        // A concurrent open may have won the race
        if let Some(replaced) = replaced {
            shutdown(replaced);
        }
        debug!("Connected to {}", endpoint);
        Ok(())
    }

    async fn close(&self) {
        if let Some(connection) = self.take_connection() {
            debug!("Closing WebSocket connection");
            shutdown(connection);
        }
    }

    async fn send(&self, request: ServiceRequest) -> Result<Value, TransportError> {
        let id = self.next_id();
        let frame = serde_json::to_string(&RequestFrame {
            id: &id,
            request: &request,
        })
        .map_err(|e| TransportError::Codec(e.to_string()))?;
        trace!("Sending {} request {}", request.service_type(), id);
        self.round_trip(id, frame, |pending| &mut pending.requests)
            .await
    }

    async fn ping(&self) -> Result<(), TransportError> {
        let id = self.next_id();
        let frame = serde_json::to_string(&PingFrame { ping: &id })
            .map_err(|e| TransportError::Codec(e.to_string()))?;
        self.round_trip(id, frame, |pending| &mut pending.pings)
            .await
            .map(|_| ())
    }

    fn is_open(&self) -> bool {
        self.connection()
            .as_ref()
            .is_some_and(|connection| connection.link.is_open())
    }

    fn cancel_pending(&self) {
        if let Some(connection) = self.connection().as_ref() {
            connection.link.pending().fail_all(TransportError::Cancelled);
        }
    }
}

impl Drop for WebSocketTransport {
    fn drop(&mut self) {
        if let Some(connection) = self.take_connection() {
            shutdown(connection);
        }
    }
}

/// Close the link, failing its waiters with `Cancelled`, and stop its tasks
fn shutdown(connection: Connection) {
    connection.link.close(TransportError::Cancelled);
    let _ = connection.outgoing.send(Message::Close(None));
    connection.reader.abort();
    // The writer exits after flushing the close frame
    drop(connection.writer);
}

/// Route one incoming frame to its waiter
fn dispatch_frame(text: &str, link: &Link, events: &TransportEvents) {
    let frame = match serde_json::from_str::<ServerFrame>(text) {
        Ok(frame) => frame,
        Err(e) => {
            warn!("Failed to decode server frame: {}", e);
            return;
        }
    };

    let mut pending = link.pending();
    match frame {
        ServerFrame::Response { id, response } => match pending.requests.remove(&id) {
            Some(reply) => {
                let _ = reply.send(Ok(response));
            }
            None => debug!("Dropping response to unknown request {}", id),
        },
        ServerFrame::Error { id, error, message } => {
            let message = message.unwrap_or_default();
            let error = match error {
                ErrorKind::Request => TransportError::Request(message),
                ErrorKind::Server => TransportError::Server(message),
            };
            match pending.requests.remove(&id) {
                Some(reply) => {
                    let _ = reply.send(Err(error));
                }
                None => debug!("Dropping error for unknown request {}: {}", id, error),
            }
        }
        ServerFrame::Pong { pong } => {
            if let Some(reply) = pending.pings.remove(&pong) {
                let _ = reply.send(Ok(Value::Null));
            }
        }
        ServerFrame::Push(message) => {
            drop(pending);
            events.push(message);
        }
    }
}
