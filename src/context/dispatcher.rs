//! Queued request plumbing.
//!
//! A queued operation hands the engine a [`RequestSink`]. Whatever the engine
//! later reports for that request is tagged with its id and republished on the
//! context's [`EventChannel`] and on the caller's per-request channel. The
//! sink lets exactly one terminal event through; tokens after it are dropped.
//!
//! The per-request channel is bounded like the event channel. Tokens that do
//! not fit are dropped and the last slot is kept for the terminal event.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::context::ContextId;
use crate::engine::{EngineBinding, EngineHandle, RequestId};
use crate::error::{Error, Result};
use crate::events::{ContextEvent, EventChannel};
use crate::params::{CompletionParams, EmbeddingParams, RerankParams};
use crate::results::{CompletionResult, RequestOutcome, RequestStatus, RerankScore, TokenChunk};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    Completion,
    Embedding,
    Rerank,
}

type Outstanding = Arc<Mutex<HashMap<RequestId, RequestKind>>>;

struct SinkInner {
    kind: RequestKind,
    events: EventChannel,
    updates: mpsc::Sender<ContextEvent>,
    outstanding: Outstanding,
    finished: AtomicBool,
    status: Arc<Mutex<RequestStatus>>,
}

/// Callback target the engine uses for one queued request.
#[derive(Clone)]
pub struct RequestSink {
    inner: Arc<SinkInner>,
}

impl RequestSink {
    pub(crate) fn new(
        kind: RequestKind,
        events: EventChannel,
        outstanding: Outstanding,
    ) -> (Self, mpsc::Receiver<ContextEvent>) {
        // One slot for a token, one for the terminal event
        let (updates, receiver) = mpsc::channel(events.capacity().max(2));
        let sink = Self {
            inner: Arc::new(SinkInner {
                kind,
                events,
                updates,
                outstanding,
                finished: AtomicBool::new(false),
                status: Arc::new(Mutex::new(RequestStatus::Queued)),
            }),
        };
        (sink, receiver)
    }

    pub fn kind(&self) -> RequestKind {
        self.inner.kind
    }

    pub fn is_finished(&self) -> bool {
        self.inner.finished.load(Ordering::Acquire)
    }

    pub fn status(&self) -> RequestStatus {
        *self.inner.status.lock()
    }

    /// The engine picked the request up.
    pub fn running(&self, request_id: RequestId) {
        self.transition(request_id, RequestStatus::Running);
    }

    /// The engine put a picked-up request back in its queue.
    pub fn requeued(&self, request_id: RequestId) {
        self.transition(request_id, RequestStatus::Queued);
    }

    fn transition(&self, request_id: RequestId, to: RequestStatus) {
        let mut status = self.inner.status.lock();
        if !status.is_terminal() {
            let from = *status;
            trace!(request = %request_id, ?from, ?to, "request status");
            *status = to;
        }
    }

    /// Partial completion token.
    pub fn token(&self, request_id: RequestId, chunk: TokenChunk) {
        if self.is_finished() {
            trace!(request = %request_id, "token after terminal event dropped");
            return;
        }
        self.emit(ContextEvent::Token {
            request_id: Some(request_id),
            chunk,
        });
    }

    pub fn complete(&self, request_id: RequestId, outcome: RequestOutcome<CompletionResult>) {
        self.finish(
            request_id,
            outcome.status(),
            ContextEvent::Completion {
                request_id: Some(request_id),
                outcome,
            },
        );
    }

    pub fn embedding(&self, request_id: RequestId, outcome: RequestOutcome<Vec<f32>>) {
        self.finish(request_id, outcome.status(), ContextEvent::Embedding { request_id, outcome });
    }

    pub fn rerank(&self, request_id: RequestId, outcome: RequestOutcome<Vec<RerankScore>>) {
        self.finish(request_id, outcome.status(), ContextEvent::Rerank { request_id, outcome });
    }

    fn finish(&self, request_id: RequestId, status: RequestStatus, event: ContextEvent) {
        {
            let mut outstanding = self.inner.outstanding.lock();
            if self.inner.finished.swap(true, Ordering::AcqRel) {
                trace!(request = %request_id, "duplicate terminal event dropped");
                return;
            }
            outstanding.remove(&request_id);
            *self.inner.status.lock() = status;
        }
        debug!(request = %request_id, tag = %event.tag(), ?status, "request finished");
        self.emit(event);
    }

    fn emit(&self, event: ContextEvent) {
        self.inner.events.publish(event.clone());
        let updates = &self.inner.updates;
        if !event.is_terminal() && updates.capacity() <= 1 {
            trace!(tag = %event.tag(), "request channel full, event dropped");
            return;
        }
        // The caller may have dropped its handle; the context stream still got it
        let _ = updates.try_send(event);
    }
}

/// Caller's view of one accepted request.
pub struct QueuedRequest {
    id: RequestId,
    kind: RequestKind,
    status: Arc<Mutex<RequestStatus>>,
    updates: mpsc::Receiver<ContextEvent>,
}

impl QueuedRequest {
    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn kind(&self) -> RequestKind {
        self.kind
    }

    /// Where the engine has got to with this request. Terminal once the
    /// terminal event was sent, even if it has not been read yet.
    pub fn status(&self) -> RequestStatus {
        *self.status.lock()
    }

    /// Next event for this request; `None` after the engine let go of it.
    pub async fn next(&mut self) -> Option<ContextEvent> {
        self.updates.recv().await
    }

    pub fn try_next(&mut self) -> Option<ContextEvent> {
        self.updates.try_recv().ok()
    }

    /// Blocking variant for callers outside an async runtime.
    pub fn blocking_next(&mut self) -> Option<ContextEvent> {
        self.updates.blocking_recv()
    }

    /// Skip partial events and wait for the terminal one.
    pub async fn finish(mut self) -> Option<ContextEvent> {
        while let Some(event) = self.updates.recv().await {
            if event.is_terminal() {
                return Some(event);
            }
        }
        None
    }
}

/// Issues queued requests against one context and tracks which are still in
/// flight so cancellation never reaches another context's requests.
pub struct RequestDispatcher {
    context_id: ContextId,
    events: EventChannel,
    outstanding: Outstanding,
}

impl RequestDispatcher {
    pub fn new(context_id: ContextId, events: EventChannel) -> Self {
        Self {
            context_id,
            events,
            outstanding: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn queue_completion(
        &self,
        engine: &dyn EngineBinding,
        handle: EngineHandle,
        params: &CompletionParams,
    ) -> Result<QueuedRequest> {
        params.require_prompt()?;
        self.submit(RequestKind::Completion, |sink| {
            engine.queue_completion(handle, params, sink)
        })
    }

    pub fn queue_embedding(
        &self,
        engine: &dyn EngineBinding,
        handle: EngineHandle,
        text: &str,
        params: &EmbeddingParams,
    ) -> Result<QueuedRequest> {
        if text.is_empty() {
            return Err(Error::invalid("Missing required parameter: text"));
        }
        self.submit(RequestKind::Embedding, |sink| {
            engine.queue_embedding(handle, text, params, sink)
        })
    }

    pub fn queue_rerank(
        &self,
        engine: &dyn EngineBinding,
        handle: EngineHandle,
        query: &str,
        documents: &[String],
        params: &RerankParams,
    ) -> Result<QueuedRequest> {
        if query.is_empty() {
            return Err(Error::invalid("Missing required parameter: query"));
        }
        if documents.is_empty() {
            return Err(Error::invalid("Documents cannot be empty"));
        }
        self.submit(RequestKind::Rerank, |sink| {
            engine.queue_rerank(handle, query, documents, params, sink)
        })
    }

    /// Forward a cancellation if `request_id` is still in flight here.
    /// Returns whether the engine was asked.
    pub fn cancel(
        &self,
        engine: &dyn EngineBinding,
        handle: EngineHandle,
        request_id: RequestId,
    ) -> bool {
        if !self.outstanding.lock().contains_key(&request_id) {
            debug!(context = %self.context_id, request = %request_id, "cancel ignored: not in flight");
            return false;
        }
        debug!(context = %self.context_id, request = %request_id, "cancelling request");
        engine.cancel_request(handle, request_id);
        true
    }

    pub fn outstanding(&self) -> Vec<RequestId> {
        let mut ids: Vec<_> = self.outstanding.lock().keys().copied().collect();
        ids.sort();
        ids
    }

    pub(crate) fn clear(&self) {
        self.outstanding.lock().clear();
    }

    fn submit<F>(&self, kind: RequestKind, enqueue: F) -> Result<QueuedRequest>
    where
        F: FnOnce(RequestSink) -> crate::engine::EngineResult<RequestId>,
    {
        let (sink, updates) = RequestSink::new(kind, self.events.clone(), self.outstanding.clone());
        let id = enqueue(sink.clone())?;
        {
            // The terminal event may already have fired on the engine's thread
            let mut outstanding = self.outstanding.lock();
            if !sink.is_finished() {
                outstanding.insert(id, kind);
            }
        }
        debug!(context = %self.context_id, request = %id, ?kind, "request queued");
        Ok(QueuedRequest {
            id,
            kind,
            status: Arc::clone(&sink.inner.status),
            updates,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sink() -> (RequestSink, mpsc::Receiver<ContextEvent>, EventChannel, Outstanding) {
        let events = EventChannel::new(ContextId(1), 16);
        let outstanding: Outstanding = Arc::new(Mutex::new(HashMap::new()));
        let (sink, rx) = RequestSink::new(RequestKind::Completion, events.clone(), outstanding.clone());
        (sink, rx, events, outstanding)
    }

    #[test]
    fn test_single_terminal_event() {
        let (sink, mut rx, events, outstanding) = sink();
        let mut sub = events.subscribe().unwrap();
        outstanding.lock().insert(RequestId(9), RequestKind::Completion);

        sink.token(RequestId(9), TokenChunk::new("a"));
        sink.complete(RequestId(9), RequestOutcome::Cancelled);
        assert_eq!(sink.status(), RequestStatus::Cancelled);
        sink.running(RequestId(9));
        assert_eq!(sink.status(), RequestStatus::Cancelled);
        sink.complete(RequestId(9), RequestOutcome::Completed(CompletionResult::default()));
        sink.token(RequestId(9), TokenChunk::new("late"));

        assert!(outstanding.lock().is_empty());
        assert!(matches!(rx.try_recv(), Ok(ContextEvent::Token { .. })));
        match rx.try_recv() {
            Ok(ContextEvent::Completion { request_id, outcome }) => {
                assert_eq!(request_id, Some(RequestId(9)));
                assert_eq!(outcome, RequestOutcome::Cancelled);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(rx.try_recv().is_err());
        assert_eq!(sub.try_recv().map(|e| e.tag()), Some(crate::events::EventTag::Token));
        assert_eq!(sub.try_recv().map(|e| e.tag()), Some(crate::events::EventTag::Completion));
        assert!(sub.try_recv().is_none());
    }

    #[test]
    fn test_slow_reader_keeps_terminal_event() {
        let (sink, mut rx, _events, _) = sink();
        assert_eq!(sink.status(), RequestStatus::Queued);
        sink.running(RequestId(3));
        assert_eq!(sink.status(), RequestStatus::Running);

        // Capacity 16: 15 tokens fit, the rest are dropped
        for i in 0..40 {
            sink.token(RequestId(3), TokenChunk::new(i.to_string()));
        }
        sink.complete(RequestId(3), RequestOutcome::Completed(CompletionResult::default()));
        assert_eq!(sink.status(), RequestStatus::Completed);

        let mut tokens = 0;
        let terminal = loop {
            match rx.try_recv() {
                Ok(ContextEvent::Token { .. }) => tokens += 1,
                Ok(event) => break event,
                Err(e) => panic!("terminal event missing: {:?}", e),
            }
        };
        assert_eq!(tokens, 15);
        assert!(terminal.is_terminal());
    }

    #[test]
    fn test_updates_survive_dropped_receiver() {
        let (sink, rx, events, _) = sink();
        let mut sub = events.subscribe().unwrap();
        drop(rx);
        sink.complete(RequestId(1), RequestOutcome::Failed("boom".into()));
        assert!(matches!(sub.try_recv(), Some(ContextEvent::Completion { .. })));
    }
}
