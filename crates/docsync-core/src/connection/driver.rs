//! Tokio driver for the connection machine
//!
//! Owns a [`ConnectionMachine`] inside a spawned task, feeds it events one
//! at a time and executes the effects it returns: opening and closing the
//! transport, keepalive probes and timers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};
use url::Url;

use super::machine::{
    ConnectionMachine, ConnectionPhase, Effect, Event, Reachability, TabVisibility, TimerKind,
};
use crate::config::ConnectionConfig;
use crate::transport::{PushMessage, Transport, TransportEvent, TransportEvents};

/// Snapshot of the three axes, published after every event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionStatus {
    pub phase: ConnectionPhase,
    pub tab: TabVisibility,
    pub network: Reachability,
    pub is_open: bool,
    pub recent_errors: Vec<String>,
    /// Number of clean opens so far
    pub connections: u64,
}

impl ConnectionStatus {
    fn of(machine: &ConnectionMachine, connections: u64) -> Self {
        Self {
            phase: machine.phase(),
            tab: machine.tab(),
            network: machine.network(),
            is_open: machine.is_open(),
            recent_errors: machine.recent_errors(),
            connections,
        }
    }
}

/// Notifications for observers of the connection
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionNotification {
    /// The transport opened cleanly
    Reconnected,
    /// The connection was given up until further notice
    Disconnected,
    /// The server pushed a message over the current connection
    Push(PushMessage),
}

/// Handle to control a running connection driver
pub struct ConnectionHandle {
    input_tx: mpsc::UnboundedSender<Event>,
    status_rx: watch::Receiver<ConnectionStatus>,
    notification_rx: Mutex<Option<mpsc::UnboundedReceiver<ConnectionNotification>>>,
    task: JoinHandle<()>,
}

impl ConnectionHandle {
    /// Feed an event to the machine
    pub fn send(&self, event: Event) {
        if self.input_tx.send(event).is_err() {
            debug!("Connection driver already stopped");
        }
    }

    pub fn configure(&self, endpoint: &str) {
        self.send(Event::Configure(endpoint.to_string()));
    }

    pub fn connect(&self) {
        self.send(Event::Connect);
    }

    pub fn disconnect(&self) {
        self.send(Event::Disconnect);
    }

    pub fn tab_visible(&self) {
        self.send(Event::TabVisible);
    }

    pub fn tab_hidden(&self) {
        self.send(Event::TabHidden);
    }

    pub fn page_hidden(&self) {
        self.send(Event::PageHide);
    }

    pub fn page_shown(&self) {
        self.send(Event::PageShow);
    }

    pub fn page_frozen(&self) {
        self.send(Event::PageFreeze);
    }

    pub fn page_resumed(&self) {
        self.send(Event::PageResume);
    }

    pub fn network_online(&self) {
        self.send(Event::Online);
    }

    pub fn network_offline(&self) {
        self.send(Event::Offline);
    }

    pub fn transport_error(&self, message: impl Into<String>) {
        self.send(Event::Error(message.into()));
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status_rx.borrow().clone()
    }

    pub fn is_open(&self) -> bool {
        self.status_rx.borrow().is_open
    }

    pub fn recent_errors(&self) -> Vec<String> {
        self.status_rx.borrow().recent_errors.clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status_rx.clone()
    }

    /// Take the notification stream; only the first caller gets it
    pub fn take_notifications(&self) -> Option<mpsc::UnboundedReceiver<ConnectionNotification>> {
        self.notification_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }

    /// Stop the driver, closing the transport
    pub async fn shutdown(self) {
        let Self { input_tx, task, .. } = self;
        drop(input_tx);
        let _ = task.await;
    }
}

/// Spawn a connection driver for `transport`
///
/// The machine starts disconnected; call `configure` and `connect` on the
/// returned handle. The driver stops when the handle is dropped or shut down.
pub fn spawn_connection(
    settings: ConnectionConfig,
    transport: Arc<dyn Transport>,
) -> ConnectionHandle {
    let machine = ConnectionMachine::new(settings);
    let (input_tx, input_rx) = mpsc::unbounded_channel();
    let (status_tx, status_rx) = watch::channel(ConnectionStatus::of(&machine, 0));
    let (notification_tx, notification_rx) = mpsc::unbounded_channel();
    let (signal_tx, signal_rx) = mpsc::unbounded_channel();
    let (transport_tx, transport_rx) = mpsc::unbounded_channel();

    let driver = Driver {
        machine,
        transport,
        status_tx,
        notification_tx,
        signal_tx,
        transport_tx,
        live_attempt: None,
        connections: 0,
        open_task: None,
        ping_task: None,
        timers: HashMap::new(),
    };
    let task = tokio::spawn(driver.run(input_rx, signal_rx, transport_rx));

    ConnectionHandle {
        input_tx,
        status_rx,
        notification_rx: Mutex::new(Some(notification_rx)),
        task,
    }
}

/// Internal signal, tagged with the open attempt it belongs to
type Signal = (Option<u64>, Event);

struct Driver {
    machine: ConnectionMachine,
    transport: Arc<dyn Transport>,
    status_tx: watch::Sender<ConnectionStatus>,
    notification_tx: mpsc::UnboundedSender<ConnectionNotification>,
    signal_tx: mpsc::UnboundedSender<Signal>,
    transport_tx: mpsc::UnboundedSender<(u64, TransportEvent)>,
    live_attempt: Option<u64>,
    connections: u64,
    open_task: Option<JoinHandle<()>>,
    ping_task: Option<JoinHandle<()>>,
    timers: HashMap<TimerKind, JoinHandle<()>>,
}

impl Driver {
    async fn run(
        mut self,
        mut input_rx: mpsc::UnboundedReceiver<Event>,
        mut signal_rx: mpsc::UnboundedReceiver<Signal>,
        mut transport_rx: mpsc::UnboundedReceiver<(u64, TransportEvent)>,
    ) {
        loop {
            tokio::select! {
                input = input_rx.recv() => match input {
                    Some(event) => self.process(event).await,
                    None => break,
                },
                Some((attempt, event)) = signal_rx.recv() => {
                    if attempt.is_none() || attempt == self.live_attempt {
                        self.process(event).await;
                    } else {
                        trace!("Dropping signal from attempt {:?}: {:?}", attempt, event);
                    }
                }
                Some((attempt, event)) = transport_rx.recv() => {
                    if Some(attempt) != self.live_attempt {
                        trace!("Dropping transport event from attempt {}", attempt);
                        continue;
                    }
                    match event {
                        TransportEvent::Failed(message) => self.process(Event::Error(message)).await,
                        TransportEvent::Push(push) => {
                            let _ = self.notification_tx.send(ConnectionNotification::Push(push));
                        }
                    }
                }
            }
        }

        debug!("Connection driver shutting down");
        let effects = self.machine.cancel_all_timers();
        self.execute(effects).await;
        self.abort_tasks();
        self.transport.cancel_pending();
        self.transport.close().await;
    }

    async fn process(&mut self, event: Event) {
        trace!("Connection event: {:?}", event);
        let effects = self.machine.handle(event);
        self.execute(effects).await;
        self.status_tx
            .send_replace(ConnectionStatus::of(&self.machine, self.connections));
    }

    async fn execute(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::OpenTransport { endpoint, attempt } => self.open(endpoint, attempt),
                Effect::CloseTransport => {
                    self.live_attempt = None;
                    self.abort_tasks();
                    self.transport.close().await;
                }
                Effect::CancelPendingRequests => self.transport.cancel_pending(),
                Effect::SendPing => self.ping(),
                Effect::StartTimer {
                    kind,
                    generation,
                    delay,
                } => self.start_timer(kind, generation, delay),
                Effect::CancelTimer(kind) => {
                    if let Some(timer) = self.timers.remove(&kind) {
                        timer.abort();
                    }
                }
                Effect::NotifyReconnected => {
                    self.connections += 1;
                    info!("Connected to {}", self.endpoint_name());
                    let _ = self.notification_tx.send(ConnectionNotification::Reconnected);
                }
                Effect::NotifyDisconnected => {
                    info!("Disconnected from {}", self.endpoint_name());
                    let _ = self.notification_tx.send(ConnectionNotification::Disconnected);
                }
            }
        }
    }

    fn open(&mut self, endpoint: Url, attempt: u64) {
        debug!("Opening {} (attempt {})", endpoint, attempt);
        if let Some(task) = self.open_task.take() {
            task.abort();
        }
        self.live_attempt = Some(attempt);

        let transport = Arc::clone(&self.transport);
        let events = TransportEvents::new(attempt, self.transport_tx.clone());
        let signal_tx = self.signal_tx.clone();
        self.open_task = Some(tokio::spawn(async move {
            let event = match transport.open(&endpoint, events).await {
                Ok(()) => Event::Opened,
                Err(e) => Event::Error(format!("Failed to open {}: {}", endpoint, e)),
            };
            let _ = signal_tx.send((Some(attempt), event));
        }));
    }

    fn ping(&mut self) {
        if let Some(task) = self.ping_task.take() {
            task.abort();
        }
        let transport = Arc::clone(&self.transport);
        let signal_tx = self.signal_tx.clone();
        let attempt = self.live_attempt;
        self.ping_task = Some(tokio::spawn(async move {
            let event = match transport.ping().await {
                Ok(()) => Event::PingSucceeded,
                Err(e) => Event::Error(format!("Ping failed: {}", e)),
            };
            let _ = signal_tx.send((attempt, event));
        }));
    }

    fn start_timer(&mut self, kind: TimerKind, generation: u64, delay: Duration) {
        let signal_tx = self.signal_tx.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = signal_tx.send((None, Event::TimerFired { kind, generation }));
        });
        if let Some(previous) = self.timers.insert(kind, timer) {
            previous.abort();
        }
    }

    fn abort_tasks(&mut self) {
        if let Some(task) = self.open_task.take() {
            task.abort();
        }
        if let Some(task) = self.ping_task.take() {
            task.abort();
        }
    }

    fn endpoint_name(&self) -> String {
        self.machine
            .endpoint()
            .map(|url| url.to_string())
            .unwrap_or_else(|| "<unconfigured>".to_string())
    }
}
