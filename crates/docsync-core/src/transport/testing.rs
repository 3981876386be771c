//! Scripted in-memory transport for tests

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{watch, Notify};
use url::Url;

use super::{ServiceRequest, Transport, TransportEvents};
use crate::error::TransportError;

/// Records requests and replays queued responses in order
pub struct ScriptedTransport {
    open: AtomicBool,
    requests: Mutex<Vec<ServiceRequest>>,
    responses: Mutex<VecDeque<Result<Value, TransportError>>>,
    open_results: Mutex<VecDeque<Result<(), TransportError>>>,
    ping_results: Mutex<VecDeque<Result<(), TransportError>>>,
    pings: AtomicUsize,
    opened: Mutex<Vec<Url>>,
    events: Mutex<Option<TransportEvents>>,
    paused: watch::Sender<bool>,
    sent: Notify,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        let (paused, _) = watch::channel(false);
        Self {
            open: AtomicBool::new(false),
            requests: Mutex::new(Vec::new()),
            responses: Mutex::new(VecDeque::new()),
            open_results: Mutex::new(VecDeque::new()),
            ping_results: Mutex::new(VecDeque::new()),
            pings: AtomicUsize::new(0),
            opened: Mutex::new(Vec::new()),
            events: Mutex::new(None),
            paused,
            sent: Notify::new(),
        }
    }

    /// A transport that already has an open connection
    pub fn connected() -> Self {
        let transport = Self::new();
        transport.open.store(true, Ordering::SeqCst);
        transport
    }

    pub fn respond(&self, response: Value) {
        self.responses.lock().unwrap().push_back(Ok(response));
    }

    pub fn fail_next(&self, error: TransportError) {
        self.responses.lock().unwrap().push_back(Err(error));
    }

    pub fn fail_next_open(&self, error: TransportError) {
        self.open_results.lock().unwrap().push_back(Err(error));
    }

    pub fn fail_next_ping(&self, error: TransportError) {
        self.ping_results.lock().unwrap().push_back(Err(error));
    }

    pub fn requests(&self) -> Vec<ServiceRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn request_values(&self) -> Vec<Value> {
        self.requests()
            .iter()
            .map(|r| serde_json::to_value(r).unwrap())
            .collect()
    }

    pub fn opened(&self) -> Vec<Url> {
        self.opened.lock().unwrap().clone()
    }

    /// Number of keepalive probes sent
    pub fn pings(&self) -> usize {
        self.pings.load(Ordering::SeqCst)
    }

    /// Signal sink handed to the most recent `open`
    pub fn events(&self) -> Option<TransportEvents> {
        self.events.lock().unwrap().clone()
    }

    pub fn set_open(&self, open: bool) {
        self.open.store(open, Ordering::SeqCst);
    }

    /// Report a connection failure for the current open attempt
    pub fn fail_connection(&self, message: &str) {
        self.open.store(false, Ordering::SeqCst);
        if let Some(events) = self.events.lock().unwrap().as_ref() {
            events.failed(message);
        }
    }

    /// Hold responses until `resume` is called
    pub fn pause(&self) {
        self.paused.send_replace(true);
    }

    pub fn resume(&self) {
        self.paused.send_replace(false);
    }

    /// Wait until at least `count` requests were sent
    pub async fn wait_for_requests(&self, count: usize) {
        loop {
            let notified = self.sent.notified();
            if self.requests.lock().unwrap().len() >= count {
                return;
            }
            notified.await;
        }
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn open(&self, endpoint: &Url, events: TransportEvents) -> Result<(), TransportError> {
        self.opened.lock().unwrap().push(endpoint.clone());
        *self.events.lock().unwrap() = Some(events);
        let result = self.open_results.lock().unwrap().pop_front().unwrap_or(Ok(()));
        self.open.store(result.is_ok(), Ordering::SeqCst);
        result
    }

    async fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }

    async fn send(&self, request: ServiceRequest) -> Result<Value, TransportError> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }
        self.requests.lock().unwrap().push(request);
        self.sent.notify_waiters();

        let mut paused = self.paused.subscribe();
        let _ = paused.wait_for(|paused| !paused).await;

        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(TransportError::Server("no scripted response".into())))
    }

    async fn ping(&self) -> Result<(), TransportError> {
        self.pings.fetch_add(1, Ordering::SeqCst);
        self.ping_results.lock().unwrap().pop_front().unwrap_or(Ok(()))
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn cancel_pending(&self) {}
}
