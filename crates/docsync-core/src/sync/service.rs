//! Sync service
//!
//! Drives the exchanges that keep the server's copy of the document in
//! step with the local one and exposes the editor services on top of it.
//!
//! Per document the service moves between "full update pending" (no known
//! state id), "synchronized" and "dirty" (local edits not yet sent). A
//! stale-state conflict always sends the service back to a full update.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use super::idle::IdleUpdater;
use super::tracker::{Acquired, ExclusiveGuard, UpdateStateTracker};
use crate::config::SyncConfig;
use crate::document::{DocumentError, DocumentSource, TextChange};
use crate::error::{SyncError, SyncResult};
use crate::transport::{
    parse_response, ConflictKind, ContentAssistEntry, ContentAssistResult, DocumentStateResult,
    FormattingResult, HoverResult, OccurrencesResult, Response, ServiceRequest, Transport,
};

/// Attempts at finding a quiet moment to format in
const MAX_FORMAT_ATTEMPTS: usize = 3;

/// Parameters of a content assist request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentAssistParams {
    pub caret_offset: usize,
    pub proposals_limit: usize,
}

/// An advisory result that may have been discarded
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cancellable<T> {
    Completed(T),
    Cancelled,
}

impl<T> Cancellable<T> {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Cancellable::Cancelled)
    }

    pub fn completed(self) -> Option<T> {
        match self {
            Cancellable::Completed(value) => Some(value),
            Cancellable::Cancelled => None,
        }
    }
}

/// Called with the document text right before it is synchronized
pub type UpdateHook = Box<dyn Fn(&str) + Send + Sync>;

/// Keeps one document synchronized with the analysis service
pub struct SyncService {
    resource: String,
    tracker: UpdateStateTracker,
    transport: Arc<dyn Transport>,
    on_update: Option<UpdateHook>,
    idle: Mutex<Option<IdleUpdater>>,
    update_debounce: Duration,
}

impl SyncService {
    pub fn new(
        document: Arc<dyn DocumentSource>,
        transport: Arc<dyn Transport>,
        settings: &SyncConfig,
        resource_extension: &str,
    ) -> Self {
        let id = uuid::Uuid::new_v4().simple().to_string();
        Self {
            resource: format!("{}.{}", &id[..7], resource_extension),
            tracker: UpdateStateTracker::new(document),
            transport,
            on_update: None,
            idle: Mutex::new(None),
            update_debounce: settings.update_debounce(),
        }
    }

    pub fn with_update_hook(mut self, hook: UpdateHook) -> Self {
        self.on_update = Some(hook);
        self
    }

    /// Name of the document on the server
    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn tracker(&self) -> &UpdateStateTracker {
        &self.tracker
    }

    pub fn state_id(&self) -> Option<String> {
        self.tracker.state_id()
    }

    pub fn is_open(&self) -> bool {
        self.transport.is_open()
    }

    /// Apply a local edit and schedule an idle synchronization
    pub fn on_edit(&self, change: &TextChange) -> Result<bool, DocumentError> {
        let changed = self.tracker.on_edit(change)?;
        if changed {
            if let Some(idle) = self.idle().as_ref() {
                idle.schedule();
            }
        }
        Ok(changed)
    }

    /// The connection (re)opened; the server state may be gone
    ///
    /// Starts idle synchronization and performs a full update in the
    /// background.
    pub fn on_reconnect(self: &Arc<Self>) -> JoinHandle<()> {
        self.tracker.invalidate_state_id();
        {
            let mut idle = self.idle();
            if idle.is_none() {
                *idle = Some(IdleUpdater::start(
                    Arc::downgrade(self),
                    self.update_debounce,
                ));
            }
        }

        let service = Arc::clone(self);
        tokio::spawn(async move {
            let mut guard = service.tracker.lock().await;
            match service.update_full_text_exclusive(&mut guard).await {
                Ok(()) => {}
                Err(SyncError::Cancelled) => debug!("Full text update cancelled"),
                Err(e) => error!("Unexpected error during initial update: {}", e),
            }
        })
    }

    /// The connection was given up; stop idle synchronization
    pub fn on_disconnect(&self) {
        if self.idle().take().is_some() {
            debug!("Stopped idle updates for {}", self.resource);
        }
    }

    /// Make sure the server reflects all local edits
    ///
    /// Resolves without network activity if there is nothing to send. A
    /// call that overlaps a running exchange waits for it and only sends
    /// what is still missing afterwards.
    pub async fn synchronize(&self) -> SyncResult<()> {
        if !self.tracker.has_pending_changes() && self.tracker.state_id().is_some() {
            return Ok(());
        }
        if let Some(hook) = &self.on_update {
            hook(&self.tracker.snapshot().text.to_string());
        }
        let mut guard = self.tracker.lock().await;
        self.update_exclusive(&mut guard).await
    }

    async fn update_exclusive(&self, guard: &mut ExclusiveGuard<'_>) -> SyncResult<()> {
        if guard.state_id().is_none() {
            self.update_full_text_exclusive(guard).await?;
        }
        let Some(delta) = guard.prepare_delta_update()? else {
            return Ok(());
        };
        let Some(state_id) = guard.state_id() else {
            return self.update_full_text_exclusive(guard).await;
        };
        trace!("Editor delta {:?}", delta);

        let response = self
            .send(ServiceRequest::delta_update(&self.resource, state_id, delta))
            .await?;
        match parse_response::<DocumentStateResult>("update", response)? {
            Response::Ok(result) => guard.set_state_id(result.state_id, None),
            Response::Conflict(ConflictKind::InvalidStateId) => {
                debug!("Server state invalid during update");
                self.update_full_text_exclusive(guard).await
            }
            Response::Conflict(ConflictKind::Canceled) => Err(SyncError::Cancelled),
        }
    }

    async fn update_full_text_exclusive(&self, guard: &mut ExclusiveGuard<'_>) -> SyncResult<()> {
        debug!("Performing full text update for {}", self.resource);
        let snapshot = guard.prepare_full_text_update();
        let response = self
            .send(ServiceRequest::full_text_update(
                &self.resource,
                snapshot.text.to_string(),
            ))
            .await?;
        match parse_response::<DocumentStateResult>("update", response)? {
            Response::Ok(result) => guard.set_state_id(result.state_id, None),
            Response::Conflict(ConflictKind::Canceled) => Err(SyncError::Cancelled),
            Response::Conflict(ConflictKind::InvalidStateId) => Err(SyncError::protocol(
                "update",
                "conflict on a full text update",
            )),
        }
    }

    /// Fetch completion proposals at a caret position
    ///
    /// When the server already has every edit the request goes out without
    /// taking the lock. Cancelling `cancel` yields an empty list; a request
    /// already sent is allowed to finish but its result is dropped.
    pub async fn content_assist(
        &self,
        params: ContentAssistParams,
        cancel: &CancellationToken,
    ) -> SyncResult<Vec<ContentAssistEntry>> {
        let result = self.content_assist_inner(&params, cancel).await;
        if cancel.is_cancelled() {
            return match result {
                Err(e) if !e.is_cancelled_or_timeout() => Err(e),
                _ => Ok(Vec::new()),
            };
        }
        result
    }

    async fn content_assist_inner(
        &self,
        params: &ContentAssistParams,
        cancel: &CancellationToken,
    ) -> SyncResult<Vec<ContentAssistEntry>> {
        if cancel.is_cancelled() {
            return Ok(Vec::new());
        }
        if !self.tracker.has_pending_changes() {
            if let Some(state_id) = self.tracker.state_id() {
                match self.fetch_content_assist_only(params, &state_id).await {
                    Err(SyncError::Conflict) => self.tracker.invalidate_state_id_if(&state_id),
                    other => return other,
                }
            }
        }

        let acquired = tokio::select! {
            _ = cancel.cancelled() => return Ok(Vec::new()),
            acquired = self.tracker.acquire(true) => acquired,
        };
        let mut guard = match acquired {
            Acquired::Locked(guard) => guard,
            Acquired::Bypass { state_id } => {
                match self.fetch_content_assist_only(params, &state_id).await {
                    Err(SyncError::Conflict) => {
                        self.tracker.invalidate_state_id_if(&state_id);
                        tokio::select! {
                            _ = cancel.cancelled() => return Ok(Vec::new()),
                            guard = self.tracker.lock() => guard,
                        }
                    }
                    other => return other,
                }
            }
        };
        self.content_assist_exclusive(&mut guard, params, cancel)
            .await
    }

    async fn content_assist_exclusive(
        &self,
        guard: &mut ExclusiveGuard<'_>,
        params: &ContentAssistParams,
        cancel: &CancellationToken,
    ) -> SyncResult<Vec<ContentAssistEntry>> {
        if guard.state_id().is_none() {
            self.update_full_text_exclusive(guard).await?;
        }
        if cancel.is_cancelled() {
            return Ok(Vec::new());
        }
        if let Some(entries) = self.content_assist_with_delta_exclusive(guard, params).await? {
            return Ok(entries);
        }
        if cancel.is_cancelled() {
            return Ok(Vec::new());
        }

        let state_id = self.require_state_id(guard)?;
        match self.fetch_content_assist_only(params, &state_id).await {
            Err(SyncError::Conflict) => {
                warn!("Server state invalid during content assist");
                self.update_full_text_exclusive(guard).await?;
                let state_id = self.require_state_id(guard)?;
                self.fetch_content_assist_only(params, &state_id).await
            }
            other => other,
        }
    }

    /// Send pending edits along with the request; `None` if there were no
    /// edits or the server state turned out to be stale
    async fn content_assist_with_delta_exclusive(
        &self,
        guard: &mut ExclusiveGuard<'_>,
        params: &ContentAssistParams,
    ) -> SyncResult<Option<Vec<ContentAssistEntry>>> {
        let Some(delta) = guard.prepare_delta_update()? else {
            return Ok(None);
        };
        let Some(state_id) = guard.state_id() else {
            self.update_full_text_exclusive(guard).await?;
            return Ok(None);
        };
        trace!("Editor delta for content assist {:?}", delta);

        let response = self
            .send(ServiceRequest::assist(
                &self.resource,
                params.caret_offset,
                params.proposals_limit,
                state_id,
                Some(delta),
            ))
            .await?;
        match parse_response::<ContentAssistResult>("assist", response)? {
            Response::Ok(result) => {
                guard.set_state_id(result.state_id, None)?;
                Ok(Some(result.entries))
            }
            Response::Conflict(ConflictKind::InvalidStateId) => {
                warn!("Server state invalid during content assist");
                self.update_full_text_exclusive(guard).await?;
                Ok(None)
            }
            Response::Conflict(ConflictKind::Canceled) => Err(SyncError::Cancelled),
        }
    }

    /// Read-only fetch against a known state id
    async fn fetch_content_assist_only(
        &self,
        params: &ContentAssistParams,
        state_id: &str,
    ) -> SyncResult<Vec<ContentAssistEntry>> {
        let response = self
            .send(ServiceRequest::assist(
                &self.resource,
                params.caret_offset,
                params.proposals_limit,
                state_id.to_string(),
                None,
            ))
            .await?;
        match parse_response::<ContentAssistResult>("assist", response)? {
            Response::Ok(result) if result.state_id == state_id => Ok(result.entries),
            Response::Ok(result) => Err(SyncError::protocol(
                "assist",
                format!(
                    "unexpected state id, expected: {} got: {}",
                    state_id, result.state_id
                ),
            )),
            Response::Conflict(ConflictKind::InvalidStateId) => Err(SyncError::Conflict),
            Response::Conflict(ConflictKind::Canceled) => Err(SyncError::Cancelled),
        }
    }

    fn require_state_id(&self, guard: &ExclusiveGuard<'_>) -> SyncResult<String> {
        guard
            .state_id()
            .ok_or_else(|| SyncError::protocol("update", "failed to obtain state id"))
    }

    /// Format the selection, or the whole document if nothing is selected
    ///
    /// The server's replacement is applied to the document as part of the
    /// acknowledged state, so it is not sent back as a local edit. Returns
    /// the replacement in the coordinates it was computed for.
    pub async fn format(&self) -> SyncResult<TextChange> {
        let mut guard = self.tracker.lock().await;
        for attempt in 1..=MAX_FORMAT_ATTEMPTS {
            self.update_exclusive(&mut guard).await?;
            let snapshot = self.tracker.snapshot();
            if self.tracker.dirty().is_some() {
                debug!("Document changed before formatting (attempt {})", attempt);
                continue;
            }
            let Some(state_id) = guard.state_id() else {
                continue;
            };

            let range = snapshot.format_range();
            debug!("Formatting from {} to {}", range.from, range.to);
            let response = self
                .send(ServiceRequest::format(
                    &self.resource,
                    range.from,
                    range.to,
                    state_id,
                ))
                .await?;
            match parse_response::<FormattingResult>("format", response)? {
                Response::Ok(result) => {
                    let change = match result.replace_region {
                        Some(region) => {
                            TextChange::new(region.offset, region.length, result.formatted_text)
                        }
                        None => TextChange::new(
                            range.from,
                            range.to - range.from,
                            result.formatted_text,
                        ),
                    };
                    guard.set_state_id(result.state_id, Some(&change))?;
                    return Ok(change);
                }
                Response::Conflict(ConflictKind::InvalidStateId) => {
                    warn!("Server state invalid during formatting");
                    self.tracker.invalidate_state_id();
                }
                Response::Conflict(ConflictKind::Canceled) => return Err(SyncError::Cancelled),
            }
        }
        Err(SyncError::Cancelled)
    }

    /// Hover information at `caret_offset`
    ///
    /// Cancelled if the document changes while the request is in flight.
    pub async fn hover(&self, caret_offset: usize) -> SyncResult<Cancellable<HoverResult>> {
        let Some(expected) = self.synchronized_state_id().await? else {
            return Ok(Cancellable::Cancelled);
        };
        let response = self
            .send(ServiceRequest::hover(
                &self.resource,
                caret_offset,
                expected.clone(),
            ))
            .await;
        let Some(response) = self.still_current(response, &expected)? else {
            return Ok(Cancellable::Cancelled);
        };
        match parse_response::<HoverResult>("hover", response)? {
            Response::Ok(result) if result.state_id == expected => {
                Ok(Cancellable::Completed(result))
            }
            _ => Ok(Cancellable::Cancelled),
        }
    }

    /// Occurrences of the symbol under the caret
    ///
    /// `caret_offset` is asked for the position only once the server is up
    /// to date; it may itself cancel.
    pub async fn occurrences<F>(&self, caret_offset: F) -> SyncResult<Cancellable<OccurrencesResult>>
    where
        F: FnOnce() -> Cancellable<usize>,
    {
        let Some(expected) = self.synchronized_state_id().await? else {
            return Ok(Cancellable::Cancelled);
        };
        let Cancellable::Completed(offset) = caret_offset() else {
            return Ok(Cancellable::Cancelled);
        };
        let response = self
            .send(ServiceRequest::occurrences(
                &self.resource,
                offset,
                expected.clone(),
            ))
            .await;
        let Some(response) = self.still_current(response, &expected)? else {
            return Ok(Cancellable::Cancelled);
        };
        match parse_response::<OccurrencesResult>("occurrences", response)? {
            Response::Ok(result) if result.state_id == expected => {
                Ok(Cancellable::Completed(result))
            }
            _ => Ok(Cancellable::Cancelled),
        }
    }

    /// Synchronize and capture the state id advisory requests run against
    ///
    /// `None` if synchronizing was cancelled or another exchange is
    /// already under way.
    async fn synchronized_state_id(&self) -> SyncResult<Option<String>> {
        match self.synchronize().await {
            Ok(()) => {}
            Err(e) if e.is_cancelled_or_timeout() => return Ok(None),
            Err(e) => return Err(e),
        }
        if self.tracker.has_pending_changes() {
            return Ok(None);
        }
        Ok(self.tracker.state_id())
    }

    /// Keep an advisory response only if nothing changed since `expected`
    ///
    /// Transport errors, timeouts included, reach the caller.
    fn still_current(
        &self,
        response: SyncResult<Value>,
        expected: &str,
    ) -> SyncResult<Option<Value>> {
        let response = response?;
        if self.tracker.has_changes_since(expected) {
            trace!("Document changed while waiting for an advisory response");
            return Ok(None);
        }
        Ok(Some(response))
    }

    /// Called by the idle timer; returns whether to check again later
    pub(crate) fn idle_update(self: &Arc<Self>) -> bool {
        if !self.transport.is_open() || !self.tracker.needs_update() {
            return false;
        }
        if !self.tracker.is_locked() {
            let service = Arc::clone(self);
            tokio::spawn(async move {
                match service.synchronize().await {
                    Ok(()) => {}
                    Err(e) if e.is_cancelled_or_timeout() => debug!("Idle update cancelled"),
                    Err(e) => error!("Unexpected error during scheduled update: {}", e),
                }
            });
        }
        true
    }

    async fn send(&self, request: ServiceRequest) -> SyncResult<Value> {
        trace!(
            "Sending {} request for {}",
            request.service_type(),
            self.resource
        );
        Ok(self.transport.send(request).await?)
    }

    fn idle(&self) -> std::sync::MutexGuard<'_, Option<IdleUpdater>> {
        self.idle.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::SharedDocument;
    use crate::error::TransportError;
    use crate::transport::testing::ScriptedTransport;
    use crate::transport::RequestKind;
    use serde_json::json;

    struct Fixture {
        document: Arc<SharedDocument>,
        transport: Arc<ScriptedTransport>,
        service: Arc<SyncService>,
    }

    fn fixture(text: &str) -> Fixture {
        let document = Arc::new(SharedDocument::new(text));
        let transport = Arc::new(ScriptedTransport::connected());
        let service = Arc::new(SyncService::new(
            document.clone(),
            transport.clone(),
            &SyncConfig::default(),
            "problem",
        ));
        Fixture {
            document,
            transport,
            service,
        }
    }

    /// A fixture whose server already acknowledged the text as `s1`
    async fn synced(text: &str) -> Fixture {
        let f = fixture(text);
        f.transport.respond(json!({ "stateId": "s1" }));
        f.service.synchronize().await.unwrap();
        f
    }

    fn is_full_text(request: &ServiceRequest) -> bool {
        matches!(
            request.kind,
            RequestKind::Update {
                full_text: Some(_),
                ..
            }
        )
    }

    fn entry(proposal: &str) -> Value {
        json!({ "prefix": "", "proposal": proposal })
    }

    #[test]
    fn test_resource_name() {
        let f = fixture("");
        let resource = f.service.resource();
        assert!(resource.ends_with(".problem"));
        assert_eq!(resource.len(), "abcdefg.problem".len());
    }

    #[tokio::test]
    async fn test_edits_before_connect_send_one_full_text_first() {
        let f = fixture("class A.");
        for (offset, text) in [(8, "\n"), (9, "class B."), (17, "\n")] {
            f.service.on_edit(&TextChange::insert(offset, text)).unwrap();
        }

        f.transport.respond(json!({ "stateId": "s1" }));
        f.service.synchronize().await.unwrap();

        let requests = f.transport.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(
            requests[0].kind,
            RequestKind::Update {
                full_text: Some("class A.\nclass B.\n".to_string()),
                delta: None,
                required_state_id: None,
            }
        );
        assert_eq!(f.service.state_id().as_deref(), Some("s1"));

        f.service.on_edit(&TextChange::insert(0, "% ")).unwrap();
        f.transport.respond(json!({ "stateId": "s2" }));
        f.service.synchronize().await.unwrap();
        let requests = f.transport.request_values();
        assert_eq!(
            requests[1],
            json!({
                "resource": f.service.resource(),
                "serviceType": "update",
                "requiredStateId": "s1",
                "deltaOffset": 0,
                "deltaReplaceLength": 0,
                "deltaText": "% ",
            })
        );
    }

    #[tokio::test]
    async fn test_synchronize_is_idempotent() {
        let f = synced("class A.").await;
        f.service.synchronize().await.unwrap();
        f.service.synchronize().await.unwrap();
        assert_eq!(f.transport.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_three_insertions_become_one_delta() {
        let f = synced("pred p(x).").await;
        for (offset, text) in [(10, " "), (11, "q"), (12, ".")] {
            f.service.on_edit(&TextChange::insert(offset, text)).unwrap();
        }
        f.transport.respond(json!({ "stateId": "s2" }));
        f.service.synchronize().await.unwrap();

        let requests = f.transport.requests();
        assert_eq!(requests.len(), 2);
        match &requests[1].kind {
            RequestKind::Update {
                delta: Some(delta),
                required_state_id,
                ..
            } => {
                assert_eq!(required_state_id.as_deref(), Some("s1"));
                assert_eq!(delta.delta_offset, 10);
                assert_eq!(delta.delta_replace_length, 0);
                assert_eq!(delta.delta_text, " q.");
            }
            other => panic!("expected a delta update, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_concurrent_synchronize_sends_one_request() {
        let f = fixture("class A.");
        f.transport.pause();
        f.transport.respond(json!({ "stateId": "s1" }));

        let first = tokio::spawn({
            let service = f.service.clone();
            async move { service.synchronize().await }
        });
        f.transport.wait_for_requests(1).await;
        let second = tokio::spawn({
            let service = f.service.clone();
            async move { service.synchronize().await }
        });
        tokio::task::yield_now().await;

        f.transport.resume();
        first.await.unwrap().unwrap();
        second.await.unwrap().unwrap();

        assert_eq!(f.transport.requests().len(), 1);
        assert_eq!(f.service.state_id().as_deref(), Some("s1"));
    }

    #[tokio::test]
    async fn test_stale_state_resyncs_once_and_succeeds() {
        let f = synced("class A.").await;
        f.service.on_edit(&TextChange::insert(8, "\nclass B.")).unwrap();

        f.transport.respond(json!({ "conflict": "invalidStateId" }));
        f.transport.respond(json!({ "stateId": "s9" }));
        f.service.synchronize().await.unwrap();

        let requests = f.transport.requests();
        assert_eq!(requests.len(), 3);
        assert!(!is_full_text(&requests[1]));
        assert_eq!(
            requests[2].kind,
            RequestKind::Update {
                full_text: Some("class A.\nclass B.".to_string()),
                delta: None,
                required_state_id: None,
            }
        );
        assert_eq!(f.service.state_id().as_deref(), Some("s9"));
        assert!(!f.service.tracker().has_pending_changes());
    }

    #[tokio::test]
    async fn test_server_cancel_is_reported_as_cancelled() {
        let f = synced("a").await;
        f.service.on_edit(&TextChange::insert(1, "b")).unwrap();
        f.transport.respond(json!({ "conflict": "canceled" }));

        let err = f.service.synchronize().await.unwrap_err();
        assert!(matches!(err, SyncError::Cancelled));
        assert!(f.service.tracker().has_pending_changes());
    }

    #[tokio::test]
    async fn test_protocol_error_keeps_edits() {
        let f = synced("a").await;
        f.service.on_edit(&TextChange::insert(1, "b")).unwrap();
        f.transport.respond(json!({ "unexpected": true }));

        let err = f.service.synchronize().await.unwrap_err();
        assert!(matches!(err, SyncError::Protocol { service: "update", .. }));

        // The same edit is sent again next time
        f.transport.respond(json!({ "stateId": "s2" }));
        f.service.synchronize().await.unwrap();
        let requests = f.transport.requests();
        assert_eq!(requests[1], requests[2]);
    }

    #[tokio::test]
    async fn test_timeout_propagates_and_is_retried() {
        let f = synced("a").await;
        f.service.on_edit(&TextChange::insert(0, "b")).unwrap();
        f.transport.fail_next(TransportError::Timeout(15_000));

        let err = f.service.synchronize().await.unwrap_err();
        assert!(matches!(err, SyncError::Timeout(15_000)));
        assert!(f.service.tracker().needs_update());
        assert!(!f.service.tracker().is_locked());
    }

    #[tokio::test]
    async fn test_not_connected() {
        let f = fixture("a");
        f.transport.set_open(false);
        let err = f.service.synchronize().await.unwrap_err();
        assert!(matches!(err, SyncError::NotConnected));
        assert!(f.transport.requests().is_empty());
    }

    #[tokio::test]
    async fn test_update_hook_sees_text() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let document = Arc::new(SharedDocument::new("class A."));
        let transport = Arc::new(ScriptedTransport::connected());
        let service = SyncService::new(document, transport.clone(), &SyncConfig::default(), "problem")
            .with_update_hook(Box::new({
                let seen = seen.clone();
                move |text: &str| seen.lock().unwrap().push(text.to_string())
            }));

        transport.respond(json!({ "stateId": "s1" }));
        service.synchronize().await.unwrap();
        service.synchronize().await.unwrap();
        assert_eq!(*seen.lock().unwrap(), vec!["class A.".to_string()]);
    }

    #[tokio::test]
    async fn test_reconnect_performs_full_update() {
        let f = synced("class A.").await;
        f.transport.respond(json!({ "stateId": "s2" }));

        f.service.on_reconnect().await.unwrap();

        let requests = f.transport.requests();
        assert_eq!(requests.len(), 2);
        assert!(is_full_text(&requests[1]));
        assert_eq!(f.service.state_id().as_deref(), Some("s2"));
        f.service.on_disconnect();
    }

    #[tokio::test]
    async fn test_content_assist_without_pending_edits_skips_lock() {
        let f = synced("class A.").await;
        let _holder = f.service.tracker().lock().await;
        f.transport
            .respond(json!({ "stateId": "s1", "entries": [entry("class")] }));

        let params = ContentAssistParams {
            caret_offset: 0,
            proposals_limit: 10,
        };
        let entries = f
            .service
            .content_assist(params, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].proposal, "class");
        assert_eq!(
            f.transport.request_values()[1],
            json!({
                "resource": f.service.resource(),
                "serviceType": "assist",
                "caretOffset": 0,
                "proposalsLimit": 10,
                "requiredStateId": "s1",
            })
        );
    }

    #[tokio::test]
    async fn test_content_assist_carries_pending_edit() {
        let f = synced("class A.").await;
        f.service.on_edit(&TextChange::insert(8, "\ncl")).unwrap();
        f.transport
            .respond(json!({ "stateId": "s2", "entries": [entry("class")] }));

        let params = ContentAssistParams {
            caret_offset: 11,
            proposals_limit: 5,
        };
        let entries = f
            .service
            .content_assist(params, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(entries.len(), 1);
        match &f.transport.requests()[1].kind {
            RequestKind::Assist {
                required_state_id,
                delta: Some(delta),
                ..
            } => {
                assert_eq!(required_state_id, "s1");
                assert_eq!(delta.delta_text, "\ncl");
            }
            other => panic!("expected assist with delta, got {:?}", other),
        }
        assert_eq!(f.service.state_id().as_deref(), Some("s2"));
        assert!(!f.service.tracker().has_pending_changes());
    }

    #[tokio::test]
    async fn test_content_assist_stale_state_resyncs_and_retries() {
        let f = synced("class A.").await;
        f.service.on_edit(&TextChange::insert(8, " ")).unwrap();
        f.transport.respond(json!({ "conflict": "invalidStateId" }));
        f.transport.respond(json!({ "stateId": "s2" }));
        f.transport
            .respond(json!({ "stateId": "s2", "entries": [entry("pred")] }));

        let params = ContentAssistParams {
            caret_offset: 9,
            proposals_limit: 5,
        };
        let entries = f
            .service
            .content_assist(params, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(entries[0].proposal, "pred");
        let requests = f.transport.requests();
        assert_eq!(requests.len(), 4);
        assert!(is_full_text(&requests[2]));
        assert!(matches!(
            &requests[3].kind,
            RequestKind::Assist { delta: None, required_state_id, .. } if required_state_id == "s2"
        ));
    }

    #[tokio::test]
    async fn test_content_assist_unexpected_state_id() {
        let f = synced("class A.").await;
        f.transport
            .respond(json!({ "stateId": "other", "entries": [] }));
        let params = ContentAssistParams {
            caret_offset: 0,
            proposals_limit: 5,
        };
        let err = f
            .service
            .content_assist(params, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Protocol { service: "assist", .. }));
    }

    #[tokio::test]
    async fn test_content_assist_cancelled_before_start() {
        let f = synced("class A.").await;
        let cancel = CancellationToken::new();
        cancel.cancel();
        let params = ContentAssistParams {
            caret_offset: 0,
            proposals_limit: 5,
        };
        let entries = f.service.content_assist(params, &cancel).await.unwrap();
        assert!(entries.is_empty());
        assert_eq!(f.transport.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_content_assist_cancelled_in_flight() {
        let f = synced("class A.").await;
        f.transport.pause();
        f.transport
            .respond(json!({ "stateId": "s1", "entries": [entry("class")] }));
        let cancel = CancellationToken::new();

        let task = tokio::spawn({
            let service = f.service.clone();
            let cancel = cancel.clone();
            async move {
                let params = ContentAssistParams {
                    caret_offset: 0,
                    proposals_limit: 5,
                };
                service.content_assist(params, &cancel).await
            }
        });
        f.transport.wait_for_requests(2).await;
        cancel.cancel();
        f.transport.resume();

        assert!(task.await.unwrap().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_content_assist_cancelled_while_waiting_for_lock() {
        let f = synced("class A.").await;
        f.service.on_edit(&TextChange::insert(8, " ")).unwrap();
        let holder = f.service.tracker().lock().await;
        let cancel = CancellationToken::new();

        let task = tokio::spawn({
            let service = f.service.clone();
            let cancel = cancel.clone();
            async move {
                let params = ContentAssistParams {
                    caret_offset: 9,
                    proposals_limit: 5,
                };
                service.content_assist(params, &cancel).await
            }
        });
        tokio::task::yield_now().await;
        assert!(!task.is_finished());
        cancel.cancel();

        assert!(task.await.unwrap().unwrap().is_empty());
        assert_eq!(f.transport.requests().len(), 1);
        drop(holder);
        assert!(f.service.tracker().has_pending_changes());
    }

    #[tokio::test]
    async fn test_content_assist_cancelled_while_waiting_after_bypass_conflict() {
        let f = synced("class A.").await;
        f.transport.pause();
        f.transport.respond(json!({ "conflict": "invalidStateId" }));
        f.transport.respond(json!({ "conflict": "invalidStateId" }));
        let cancel = CancellationToken::new();

        let task = tokio::spawn({
            let service = f.service.clone();
            let cancel = cancel.clone();
            async move {
                let params = ContentAssistParams {
                    caret_offset: 0,
                    proposals_limit: 5,
                };
                service.content_assist(params, &cancel).await
            }
        });
        f.transport.wait_for_requests(2).await;

        // Another exchange moves the server on while the first request is out
        let mut holder = f.service.tracker().lock().await;
        holder.set_state_id("s2".to_string(), None).unwrap();
        f.transport.resume();
        f.transport.wait_for_requests(3).await;
        tokio::task::yield_now().await;
        assert!(!task.is_finished());
        cancel.cancel();

        assert!(task.await.unwrap().unwrap().is_empty());
        let requests = f.transport.requests();
        assert!(matches!(
            &requests[2].kind,
            RequestKind::Assist { required_state_id, delta: None, .. } if required_state_id == "s2"
        ));
        drop(holder);
        assert_eq!(f.service.state_id(), None);
    }

    #[tokio::test]
    async fn test_format_whole_document() {
        let f = synced("class  A .").await;
        f.transport
            .respond(json!({ "stateId": "s2", "formattedText": "class A." }));

        let change = f.service.format().await.unwrap();

        assert_eq!(change, TextChange::new(0, 10, "class A."));
        assert_eq!(f.document.text(), "class A.");
        assert_eq!(f.service.state_id().as_deref(), Some("s2"));
        assert!(!f.service.tracker().needs_update());
        match &f.transport.requests()[1].kind {
            RequestKind::Format {
                selection_start,
                selection_end,
                required_state_id,
            } => {
                assert_eq!((*selection_start, *selection_end), (0, 10));
                assert_eq!(required_state_id, "s1");
            }
            other => panic!("expected format, got {:?}", other),
        }

        // The formatted text is the new baseline
        f.service.synchronize().await.unwrap();
        assert_eq!(f.transport.requests().len(), 2);
    }

    #[tokio::test]
    async fn test_format_selection_syncs_first() {
        let f = synced("a.\nb  .").await;
        f.service.on_edit(&TextChange::insert(0, "%\n")).unwrap();
        f.document
            .set_selection(crate::document::SelectionRange::new(5, 9));
        f.transport.respond(json!({ "stateId": "s2" }));
        f.transport.respond(json!({
            "stateId": "s3",
            "formattedText": "b.",
            "replaceRegion": { "offset": 5, "length": 4 },
        }));

        f.service.format().await.unwrap();

        assert_eq!(f.document.text(), "%\na.\nb.");
        let requests = f.transport.requests();
        assert!(matches!(requests[1].kind, RequestKind::Update { delta: Some(_), .. }));
        assert!(matches!(
            requests[2].kind,
            RequestKind::Format { selection_start: 5, selection_end: 9, .. }
        ));
    }

    #[tokio::test]
    async fn test_format_stale_state_resyncs_and_retries() {
        let f = synced("class  A .").await;
        f.transport.respond(json!({ "conflict": "invalidStateId" }));
        f.transport.respond(json!({ "stateId": "s2" }));
        f.transport
            .respond(json!({ "stateId": "s3", "formattedText": "class A." }));

        let change = f.service.format().await.unwrap();

        assert_eq!(change, TextChange::new(0, 10, "class A."));
        assert_eq!(f.document.text(), "class A.");
        assert_eq!(f.service.state_id().as_deref(), Some("s3"));
        let requests = f.transport.requests();
        assert_eq!(requests.len(), 4);
        assert!(is_full_text(&requests[2]));
        assert!(matches!(
            &requests[3].kind,
            RequestKind::Format { required_state_id, .. } if required_state_id == "s2"
        ));
    }

    #[tokio::test]
    async fn test_format_gives_up_after_repeated_conflicts() {
        let f = synced("class  A .").await;
        f.transport.respond(json!({ "conflict": "invalidStateId" }));
        for state_id in ["s2", "s3"] {
            f.transport.respond(json!({ "stateId": state_id }));
            f.transport.respond(json!({ "conflict": "invalidStateId" }));
        }

        let err = f.service.format().await.unwrap_err();

        assert!(matches!(err, SyncError::Cancelled));
        let formats = f
            .transport
            .requests()
            .iter()
            .filter(|r| matches!(r.kind, RequestKind::Format { .. }))
            .count();
        assert_eq!(formats, MAX_FORMAT_ATTEMPTS);
        assert_eq!(f.document.text(), "class  A .");
        assert!(!f.service.tracker().is_locked());
    }

    #[tokio::test]
    async fn test_format_server_cancel() {
        let f = synced("class A.").await;
        f.transport.respond(json!({ "conflict": "canceled" }));

        let err = f.service.format().await.unwrap_err();
        assert!(matches!(err, SyncError::Cancelled));
        assert_eq!(f.transport.requests().len(), 2);
    }

    #[tokio::test]
    async fn test_hover_completes() {
        let f = synced("class A.").await;
        f.transport.respond(json!({
            "stateId": "s1",
            "title": "class A",
            "content": "A class",
        }));

        let result = f.service.hover(6).await.unwrap();
        let hover = result.completed().unwrap();
        assert_eq!(hover.title.as_deref(), Some("class A"));
    }

    #[tokio::test]
    async fn test_hover_with_edit_mid_flight_is_cancelled() {
        let f = synced("class A.").await;
        f.transport.pause();
        f.transport.respond(json!({ "stateId": "s1", "title": "class A" }));

        let task = tokio::spawn({
            let service = f.service.clone();
            async move { service.hover(6).await }
        });
        f.transport.wait_for_requests(2).await;
        f.service.on_edit(&TextChange::insert(7, "B")).unwrap();
        f.transport.resume();

        assert!(task.await.unwrap().unwrap().is_cancelled());
    }

    #[tokio::test]
    async fn test_hover_conflict_is_cancelled() {
        let f = synced("class A.").await;
        f.transport.respond(json!({ "conflict": "invalidStateId" }));
        assert!(f.service.hover(0).await.unwrap().is_cancelled());
    }

    #[tokio::test]
    async fn test_hover_sync_timeout_is_cancelled() {
        let f = synced("class A.").await;
        f.service.on_edit(&TextChange::insert(0, "x")).unwrap();
        f.transport.fail_next(TransportError::Timeout(15_000));
        assert!(f.service.hover(0).await.unwrap().is_cancelled());
        assert_eq!(f.transport.requests().len(), 2);
    }

    #[tokio::test]
    async fn test_hover_send_timeout_reaches_caller() {
        let f = synced("class A.").await;
        f.transport.fail_next(TransportError::Timeout(15_000));

        let err = f.service.hover(6).await.unwrap_err();
        assert!(matches!(err, SyncError::Timeout(15_000)));
        assert_eq!(f.transport.requests().len(), 2);
    }

    #[tokio::test]
    async fn test_occurrences_send_timeout_reaches_caller() {
        let f = synced("pred p(x).").await;
        f.transport.fail_next(TransportError::Timeout(15_000));

        let err = f
            .service
            .occurrences(|| Cancellable::Completed(5))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Timeout(15_000)));
    }

    #[tokio::test]
    async fn test_occurrences() {
        let f = synced("pred p(x) <-> p(x).").await;
        f.transport.respond(json!({
            "stateId": "s1",
            "writeRegions": [{ "offset": 5, "length": 1 }],
            "readRegions": [{ "offset": 14, "length": 1 }],
        }));

        let result = f
            .service
            .occurrences(|| Cancellable::Completed(5))
            .await
            .unwrap()
            .completed()
            .unwrap();
        assert_eq!(result.write_regions.len(), 1);
        assert_eq!(result.read_regions[0].offset, 14);
        assert_eq!(
            f.transport.request_values()[1]["expectedStateId"],
            json!("s1")
        );
    }

    #[tokio::test]
    async fn test_occurrences_provider_cancels() {
        let f = synced("pred p(x).").await;
        let result = f.service.occurrences(|| Cancellable::Cancelled).await.unwrap();
        assert!(result.is_cancelled());
        assert_eq!(f.transport.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_occurrences_state_mismatch_is_cancelled() {
        let f = synced("pred p(x).").await;
        f.transport.respond(json!({ "stateId": "s0" }));
        let result = f
            .service
            .occurrences(|| Cancellable::Completed(5))
            .await
            .unwrap();
        assert!(result.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_update_debounces_edits() {
        let f = fixture("class A.");
        f.transport.respond(json!({ "stateId": "s1" }));
        f.service.on_reconnect().await.unwrap();
        f.transport.respond(json!({ "stateId": "s2" }));

        f.service.on_edit(&TextChange::insert(8, " ")).unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        f.service.on_edit(&TextChange::insert(9, "%")).unwrap();
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(f.transport.requests().len(), 1);

        tokio::time::sleep(Duration::from_millis(200)).await;
        f.transport.wait_for_requests(2).await;
        match &f.transport.requests()[1].kind {
            RequestKind::Update {
                delta: Some(delta), ..
            } => assert_eq!(delta.delta_text, " %"),
            other => panic!("expected delta update, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_update_stops_on_disconnect() {
        let f = fixture("class A.");
        f.transport.respond(json!({ "stateId": "s1" }));
        f.service.on_reconnect().await.unwrap();
        f.service.on_disconnect();

        f.service.on_edit(&TextChange::insert(8, " ")).unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(f.transport.requests().len(), 1);
        assert!(f.service.tracker().needs_update());
    }
}
