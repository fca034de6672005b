//! Bounded registry of live contexts and their event channels.

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::context::{Context, ContextId, ContextSnapshot, ContextState};
use crate::engine::EngineBinding;
use crate::error::{Error, Result};
use crate::events::{EventChannel, EventSubscription, DEFAULT_EVENT_BUFFER};
use crate::params::ContextOptions;
use crate::platform::Platform;

/// Live contexts allowed when nothing else is configured
pub const DEFAULT_CONTEXT_LIMIT: usize = 1;

pub struct ContextPoolBuilder {
    engine: Arc<dyn EngineBinding>,
    platform: Option<Arc<Platform>>,
    context_limit: usize,
    event_buffer: usize,
}

impl ContextPoolBuilder {
    /// Platform to validate against; defaults to [`Platform::current`].
    pub fn platform(mut self, platform: Arc<Platform>) -> Self {
        self.platform = Some(platform);
        self
    }

    pub fn context_limit(mut self, limit: usize) -> Self {
        self.context_limit = limit;
        self
    }

    pub fn event_buffer(mut self, capacity: usize) -> Self {
        self.event_buffer = capacity;
        self
    }

    pub fn build(self) -> ContextPool {
        let platform = self.platform.unwrap_or_else(Platform::current);
        info!(
            engine = self.engine.name(),
            limit = self.context_limit,
            library = platform.library_name(),
            "context pool ready"
        );
        ContextPool {
            engine: self.engine,
            platform,
            event_buffer: self.event_buffer.max(1),
            next_id: AtomicU32::new(1),
            inner: Mutex::new(PoolInner {
                limit: self.context_limit,
                contexts: HashMap::new(),
                loading: HashSet::new(),
                channels: HashMap::new(),
            }),
        }
    }
}

struct PoolInner {
    limit: usize,
    contexts: HashMap<ContextId, Arc<Context>>,
    /// Ids whose construction is in progress; they count against the limit
    loading: HashSet<ContextId>,
    channels: HashMap<ContextId, EventChannel>,
}

impl PoolInner {
    /// Forget contexts a caller released through a handle from `resolve`.
    fn prune_released(&mut self) {
        let released: Vec<ContextId> = self
            .contexts
            .iter()
            .filter(|(_, context)| context.is_released())
            .map(|(id, _)| *id)
            .collect();
        for id in released {
            self.contexts.remove(&id);
            if let Some(channel) = self.channels.remove(&id) {
                channel.close();
            }
            debug!(context = %id, "dropped context released outside the pool");
        }
    }

    fn live(&self) -> usize {
        self.contexts.len() + self.loading.len()
    }
}

pub struct ContextPool {
    engine: Arc<dyn EngineBinding>,
    platform: Arc<Platform>,
    event_buffer: usize,
    next_id: AtomicU32,
    inner: Mutex<PoolInner>,
}

impl ContextPool {
    pub fn builder(engine: Arc<dyn EngineBinding>) -> ContextPoolBuilder {
        ContextPoolBuilder {
            engine,
            platform: None,
            context_limit: DEFAULT_CONTEXT_LIMIT,
            event_buffer: DEFAULT_EVENT_BUFFER,
        }
    }

    pub fn engine(&self) -> &Arc<dyn EngineBinding> {
        &self.engine
    }

    pub fn platform(&self) -> &Arc<Platform> {
        &self.platform
    }

    /// Load a model into a new context. The id and its event channel are
    /// reserved first so load progress can be observed; both are dropped
    /// again if construction fails.
    pub fn create(&self, options: &ContextOptions) -> Result<(ContextId, ContextSnapshot)> {
        self.create_inner(options, false)
            .map(|(id, snapshot, _)| (id, snapshot))
    }

    /// Like [`create`](Self::create), with a subscription opened before the
    /// model starts loading so `progress` events are not missed.
    pub fn create_subscribed(
        &self,
        options: &ContextOptions,
    ) -> Result<(ContextId, ContextSnapshot, EventSubscription)> {
        let (id, snapshot, subscription) = self.create_inner(options, true)?;
        let subscription = subscription
            .ok_or_else(|| Error::NotFound(format!("Event channel for context {}", id)))?;
        Ok((id, snapshot, subscription))
    }

    fn create_inner(
        &self,
        options: &ContextOptions,
        subscribe: bool,
    ) -> Result<(ContextId, ContextSnapshot, Option<EventSubscription>)> {
        let (id, events) = {
            let mut inner = self.inner.lock();
            inner.prune_released();
            if inner.live() >= inner.limit {
                warn!(limit = inner.limit, "context limit reached");
                return Err(Error::LimitReached { limit: inner.limit });
            }
            let id = ContextId(self.next_id.fetch_add(1, Ordering::Relaxed));
            let events = EventChannel::new(id, self.event_buffer);
            inner.loading.insert(id);
            inner.channels.insert(id, events.clone());
            (id, events)
        };
        let subscription = if subscribe { events.subscribe() } else { None };

        let created = Context::create(
            id,
            options,
            Arc::clone(&self.engine),
            &self.platform,
            events,
        );

        let mut inner = self.inner.lock();
        inner.loading.remove(&id);
        match created {
            Ok(context) => {
                let snapshot = context.snapshot();
                inner.contexts.insert(id, Arc::new(context));
                Ok((id, snapshot, subscription))
            }
            Err(e) => {
                if let Some(channel) = inner.channels.remove(&id) {
                    channel.close();
                }
                warn!(context = %id, "context construction failed: {}", e);
                Err(e)
            }
        }
    }

    pub fn resolve(&self, id: ContextId) -> Result<Arc<Context>> {
        let mut inner = self.inner.lock();
        inner.prune_released();
        inner
            .contexts
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("Context {}", id)))
    }

    /// Release and forget `id`. Unknown ids are ignored.
    pub fn release(&self, id: ContextId) {
        let (context, channel) = {
            let mut inner = self.inner.lock();
            (inner.contexts.remove(&id), inner.channels.remove(&id))
        };
        if let Some(context) = context {
            context.release();
        } else {
            debug!(context = %id, "release of unknown context ignored");
        }
        if let Some(channel) = channel {
            channel.close();
        }
    }

    pub fn release_all(&self) {
        let (contexts, channels) = {
            let mut inner = self.inner.lock();
            let contexts: Vec<_> = inner.contexts.drain().map(|(_, c)| c).collect();
            let channels: Vec<_> = inner.channels.drain().map(|(_, c)| c).collect();
            (contexts, channels)
        };
        if !contexts.is_empty() {
            info!(count = contexts.len(), "releasing all contexts");
        }
        for context in contexts {
            context.release();
        }
        for channel in channels {
            channel.close();
        }
    }

    /// Applies to later `create` calls only; live contexts are kept.
    pub fn set_context_limit(&self, limit: usize) {
        let mut inner = self.inner.lock();
        if inner.live() > limit {
            debug!(live = inner.live(), limit, "context limit below live count");
        }
        inner.limit = limit;
    }

    pub fn context_limit(&self) -> usize {
        self.inner.lock().limit
    }

    pub fn len(&self) -> usize {
        let mut inner = self.inner.lock();
        inner.prune_released();
        inner.contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn ids(&self) -> Vec<ContextId> {
        let mut inner = self.inner.lock();
        inner.prune_released();
        let mut ids: Vec<_> = inner.contexts.keys().copied().collect();
        ids.sort();
        ids
    }

    /// `None` for ids the pool does not hold.
    pub fn state(&self, id: ContextId) -> Option<ContextState> {
        let inner = self.inner.lock();
        if inner.loading.contains(&id) {
            return Some(ContextState::Loading);
        }
        inner.contexts.get(&id).map(|context| context.state())
    }

    pub fn has_channel(&self, id: ContextId) -> bool {
        self.inner.lock().channels.contains_key(&id)
    }

    /// Registered event channels, loading contexts included
    pub fn channel_count(&self) -> usize {
        self.inner.lock().channels.len()
    }

    /// Subscribe to a context's events, including while it is loading.
    pub fn subscribe(&self, id: ContextId) -> Result<EventSubscription> {
        let mut inner = self.inner.lock();
        let channel = match inner.channels.get(&id) {
            Some(channel) => channel.clone(),
            None => {
                let context = inner
                    .contexts
                    .get(&id)
                    .ok_or_else(|| Error::NotFound(format!("Context {}", id)))?;
                let channel = context.events().clone();
                channel.reopen();
                inner.channels.insert(id, channel.clone());
                channel
            }
        };
        channel
            .subscribe()
            .ok_or_else(|| Error::NotFound(format!("Event channel for context {}", id)))
    }

    /// End every subscription on `id` and drop its channel from the registry.
    /// A later `subscribe` on a live context opens it again.
    pub fn unsubscribe(&self, id: ContextId) {
        if let Some(channel) = self.inner.lock().channels.remove(&id) {
            channel.close();
        }
    }
}

impl Drop for ContextPool {
    fn drop(&mut self) {
        self.release_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::LoopbackEngine;
    use crate::platform::{Arch, CpuFeatures};
    use std::io::Write;

    fn pool(limit: usize) -> ContextPool {
        let platform = Arc::new(Platform::new(Arch::X86_64, CpuFeatures::default()));
        ContextPool::builder(Arc::new(LoopbackEngine::default()))
            .platform(platform)
            .context_limit(limit)
            .build()
    }

    fn model(dir: &tempfile::TempDir) -> ContextOptions {
        let path = dir.path().join("m.gguf");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(b"GGUF").unwrap();
        file.write_all(&[0u8; 20]).unwrap();
        ContextOptions::new(path.to_string_lossy())
    }

    #[test]
    fn test_ids_not_reused() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool(1);
        let (a, _) = pool.create(&model(&dir)).unwrap();
        pool.release(a);
        let (b, _) = pool.create(&model(&dir)).unwrap();
        assert_ne!(a, b);
        assert_eq!(pool.ids(), vec![b]);
    }

    #[test]
    fn test_limit_not_retroactive() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool(2);
        let (a, _) = pool.create(&model(&dir)).unwrap();
        let (b, _) = pool.create(&model(&dir)).unwrap();
        pool.set_context_limit(1);
        assert_eq!(pool.len(), 2);
        assert!(pool.resolve(a).is_ok());
        assert!(matches!(
            pool.create(&model(&dir)),
            Err(Error::LimitReached { limit: 1 })
        ));
        pool.release(a);
        assert!(matches!(pool.create(&model(&dir)), Err(Error::LimitReached { .. })));
        pool.release(b);
        assert!(pool.create(&model(&dir)).is_ok());
    }

    #[test]
    fn test_unsubscribe_then_resubscribe() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool(1);
        let (id, _) = pool.create(&model(&dir)).unwrap();
        let mut first = pool.subscribe(id).unwrap();
        pool.unsubscribe(id);
        assert!(!pool.has_channel(id));
        assert!(first.try_recv().is_none());

        let mut second = pool.subscribe(id).unwrap();
        assert!(pool.has_channel(id));
        let context = pool.resolve(id).unwrap();
        context.tokenize("x", &[]).unwrap();
        context
            .completion(&crate::params::CompletionParams::with_prompt("x"))
            .unwrap();
        assert!(second.try_recv().is_some());
    }

    #[test]
    fn test_release_through_handle_frees_slot() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool(1);
        let (id, _) = pool.create(&model(&dir)).unwrap();
        pool.resolve(id).unwrap().release();

        assert!(matches!(pool.resolve(id), Err(Error::NotFound(_))));
        assert!(!pool.has_channel(id));
        assert!(pool.is_empty());
        let (next, _) = pool.create(&model(&dir)).unwrap();
        assert_eq!(pool.ids(), vec![next]);
    }

    #[test]
    fn test_subscribe_unknown() {
        let pool = pool(1);
        assert!(matches!(pool.subscribe(ContextId(42)), Err(Error::NotFound(_))));
        pool.unsubscribe(ContextId(42));
        pool.release(ContextId(42));
    }
}
