//! Per-context event stream.
//!
//! Each context publishes tagged events (`progress`, `token`, `completion`,
//! `embedding`, `rerank`) on one bounded broadcast channel. Publishing never
//! blocks: a subscriber that falls more than `capacity` events behind loses
//! the oldest ones, and with no subscriber the event is simply dropped.

use futures::{Stream, StreamExt};
use parking_lot::RwLock;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};
use tracing::{trace, warn};

use crate::context::ContextId;
use crate::engine::RequestId;
use crate::results::{CompletionResult, RerankScore, RequestOutcome, TokenChunk};

/// Default buffered events per subscriber
pub const DEFAULT_EVENT_BUFFER: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventTag {
    Progress,
    Token,
    Completion,
    Embedding,
    Rerank,
}

impl fmt::Display for EventTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self {
            EventTag::Progress => "progress",
            EventTag::Token => "token",
            EventTag::Completion => "completion",
            EventTag::Embedding => "embedding",
            EventTag::Rerank => "rerank",
        };
        f.write_str(tag)
    }
}

/// One tagged entry on a context's event stream. Events produced by queued
/// requests carry the engine-assigned request id; events from blocking
/// operations carry `None`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "tag", rename_all = "snake_case")]
pub enum ContextEvent {
    Progress {
        percent: u32,
    },
    Token {
        request_id: Option<RequestId>,
        chunk: TokenChunk,
    },
    Completion {
        request_id: Option<RequestId>,
        outcome: RequestOutcome<CompletionResult>,
    },
    Embedding {
        request_id: RequestId,
        outcome: RequestOutcome<Vec<f32>>,
    },
    Rerank {
        request_id: RequestId,
        outcome: RequestOutcome<Vec<RerankScore>>,
    },
}

impl ContextEvent {
    pub fn tag(&self) -> EventTag {
        match self {
            ContextEvent::Progress { .. } => EventTag::Progress,
            ContextEvent::Token { .. } => EventTag::Token,
            ContextEvent::Completion { .. } => EventTag::Completion,
            ContextEvent::Embedding { .. } => EventTag::Embedding,
            ContextEvent::Rerank { .. } => EventTag::Rerank,
        }
    }

    pub fn request_id(&self) -> Option<RequestId> {
        match self {
            ContextEvent::Progress { .. } => None,
            ContextEvent::Token { request_id, .. } | ContextEvent::Completion { request_id, .. } => {
                *request_id
            }
            ContextEvent::Embedding { request_id, .. } | ContextEvent::Rerank { request_id, .. } => {
                Some(*request_id)
            }
        }
    }

    /// Whether this is the last event a request will produce.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ContextEvent::Progress { .. } | ContextEvent::Token { .. })
    }
}

struct ChannelInner {
    context_id: ContextId,
    capacity: usize,
    sender: RwLock<Option<broadcast::Sender<ContextEvent>>>,
}

/// Bounded fan-out channel owned by one context.
#[derive(Clone)]
pub struct EventChannel {
    inner: Arc<ChannelInner>,
}

impl EventChannel {
    pub fn new(context_id: ContextId, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, _) = broadcast::channel(capacity);
        Self {
            inner: Arc::new(ChannelInner {
                context_id,
                capacity,
                sender: RwLock::new(Some(sender)),
            }),
        }
    }

    pub fn context_id(&self) -> ContextId {
        self.inner.context_id
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Publish to every current subscriber. Returns how many received it.
    pub fn publish(&self, event: ContextEvent) -> usize {
        let guard = self.inner.sender.read();
        let Some(sender) = guard.as_ref() else {
            return 0;
        };
        trace!(context = %self.inner.context_id, tag = %event.tag(), "publish");
        // Err only means nobody is listening
        sender.send(event).unwrap_or(0)
    }

    /// New subscription, or `None` once the channel is closed.
    pub fn subscribe(&self) -> Option<EventSubscription> {
        self.inner.sender.read().as_ref().map(|sender| EventSubscription {
            context_id: self.inner.context_id,
            receiver: sender.subscribe(),
        })
    }

    pub fn receiver_count(&self) -> usize {
        self.inner
            .sender
            .read()
            .as_ref()
            .map_or(0, |sender| sender.receiver_count())
    }

    /// Drop the sender. Subscribers drain what is buffered, then end.
    pub fn close(&self) {
        self.inner.sender.write().take();
    }

    /// Install a fresh sender after [`close`](Self::close). Publishers holding
    /// a clone of this channel deliver to the new subscribers.
    pub fn reopen(&self) {
        let mut sender = self.inner.sender.write();
        if sender.is_none() {
            *sender = Some(broadcast::channel(self.inner.capacity).0);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.sender.read().is_none()
    }
}

impl fmt::Debug for EventChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventChannel")
            .field("context_id", &self.inner.context_id)
            .field("capacity", &self.inner.capacity)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Receiving end of a context's event stream.
pub struct EventSubscription {
    context_id: ContextId,
    receiver: broadcast::Receiver<ContextEvent>,
}

impl EventSubscription {
    pub fn context_id(&self) -> ContextId {
        self.context_id
    }

    /// Next event, skipping over anything lost to overflow. `None` once the
    /// channel is closed and drained.
    pub async fn recv(&mut self) -> Option<ContextEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(context = %self.context_id, skipped, "event subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking variant of [`recv`](Self::recv).
    pub fn try_recv(&mut self) -> Option<ContextEvent> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    warn!(context = %self.context_id, skipped, "event subscriber lagged");
                }
                Err(_) => return None,
            }
        }
    }

    pub fn into_stream(self) -> impl Stream<Item = ContextEvent> + Send + 'static {
        let context_id = self.context_id;
        BroadcastStream::new(self.receiver).filter_map(move |item| async move {
            match item {
                Ok(event) => Some(event),
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    warn!(context = %context_id, skipped, "event stream lagged");
                    None
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn progress(percent: u32) -> ContextEvent {
        ContextEvent::Progress { percent }
    }

    #[test]
    fn test_publish_without_subscribers() {
        let channel = EventChannel::new(ContextId(1), 4);
        assert_eq!(channel.publish(progress(10)), 0);
    }

    #[tokio::test]
    async fn test_fan_out_preserves_order() {
        let channel = EventChannel::new(ContextId(1), 8);
        let mut a = channel.subscribe().unwrap();
        let mut b = channel.subscribe().unwrap();
        for p in [10, 20, 30] {
            assert_eq!(channel.publish(progress(p)), 2);
        }
        for sub in [&mut a, &mut b] {
            assert_eq!(sub.recv().await, Some(progress(10)));
            assert_eq!(sub.recv().await, Some(progress(20)));
            assert_eq!(sub.recv().await, Some(progress(30)));
        }
    }

    #[tokio::test]
    async fn test_overflow_drops_oldest() {
        let channel = EventChannel::new(ContextId(1), 2);
        let mut sub = channel.subscribe().unwrap();
        for p in 0..5 {
            channel.publish(progress(p));
        }
        assert_eq!(sub.recv().await, Some(progress(3)));
        assert_eq!(sub.recv().await, Some(progress(4)));
        assert_eq!(sub.try_recv(), None);
    }

    #[tokio::test]
    async fn test_close_ends_subscriptions() {
        let channel = EventChannel::new(ContextId(3), 4);
        let mut sub = channel.subscribe().unwrap();
        channel.publish(progress(50));
        channel.close();
        assert!(channel.is_closed());
        assert!(channel.subscribe().is_none());
        assert_eq!(channel.publish(progress(60)), 0);
        assert_eq!(sub.recv().await, Some(progress(50)));
        assert_eq!(sub.recv().await, None);

        let publisher = channel.clone();
        channel.reopen();
        let mut fresh = channel.subscribe().unwrap();
        assert_eq!(publisher.publish(progress(70)), 1);
        assert_eq!(fresh.recv().await, Some(progress(70)));
    }

    #[test]
    fn test_event_tags_serialize() {
        let event = ContextEvent::Token {
            request_id: Some(RequestId(4)),
            chunk: TokenChunk::new("hi"),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["tag"], "token");
        assert_eq!(json["request_id"], 4);
        assert_eq!(event.tag().to_string(), "token");
        assert!(!event.is_terminal());
    }
}
