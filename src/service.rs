//! Async caller surface over the context pool.
//!
//! Blocking engine work runs on tokio's blocking pool; lookups, queueing and
//! cancellation return immediately.

use async_stream::stream;
use futures::Stream;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task;
use tracing::{debug, error, info, trace, warn};

use crate::config::Settings;
use crate::context::{Context, ContextId, ContextSnapshot, ParallelState, QueuedRequest};
use crate::engine::{EngineBinding, LoopbackEngine, NativeLogFn, RequestId};
use crate::error::{Error, Result};
use crate::events::ContextEvent;
use crate::params::{
    BenchParams, ChatTemplateOptions, CompletionParams, ContextOptions, EmbeddingParams,
    LoraAdapter, MultimodalParams, RerankParams, VocoderParams,
};
use crate::platform::{is_gguf, resolve_path, CpuFeatures, Platform};
use crate::pool::ContextPool;
use crate::results::{
    CompletionResult, FormattedAudio, FormattedChat, Metadata, MultimodalSupport, RerankScore,
    SessionLoad, TokenChunk, Tokenized,
};

/// Target native engine log lines are re-emitted under
pub const NATIVE_LOG_TARGET: &str = "llamactx::native";

/// Item of [`LlamaService::completion_stream`].
#[derive(Debug, Clone, PartialEq)]
pub enum CompletionUpdate {
    Token(TokenChunk),
    Done(CompletionResult),
}

#[derive(Clone)]
pub struct LlamaService {
    pool: Arc<ContextPool>,
}

impl LlamaService {
    pub fn new(pool: ContextPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Service over the loopback binding, sized from `settings`.
    pub fn from_settings(settings: &Settings) -> Self {
        let engine: Arc<dyn EngineBinding> =
            Arc::new(LoopbackEngine::new(settings.loopback_config()));
        let pool = ContextPool::builder(engine)
            .context_limit(settings.pool.context_limit)
            .event_buffer(settings.events.buffer)
            .build();
        Self::new(pool)
    }

    pub fn pool(&self) -> &Arc<ContextPool> {
        &self.pool
    }

    fn platform(&self) -> &Platform {
        self.pool.platform()
    }

    /// Run a blocking context operation off the async runtime.
    async fn blocking<T, F>(&self, id: ContextId, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Context) -> Result<T> + Send + 'static,
    {
        let context = self.pool.resolve(id)?;
        task::spawn_blocking(move || op(&context))
            .await
            .map_err(|e| Error::EngineFailure(format!("blocking task failed: {}", e)))?
    }

    pub async fn create_context(&self, options: ContextOptions) -> Result<(ContextId, ContextSnapshot)> {
        let pool = Arc::clone(&self.pool);
        task::spawn_blocking(move || pool.create(&options))
            .await
            .map_err(|e| Error::ConstructionFailed(format!("load task failed: {}", e)))?
    }

    /// Create with the event stream already attached, so load progress
    /// shows up on it.
    pub async fn create_context_subscribed(
        &self,
        options: ContextOptions,
    ) -> Result<(ContextId, ContextSnapshot, impl Stream<Item = ContextEvent> + Send + 'static)> {
        let pool = Arc::clone(&self.pool);
        let (id, snapshot, subscription) = task::spawn_blocking(move || pool.create_subscribed(&options))
            .await
            .map_err(|e| Error::ConstructionFailed(format!("load task failed: {}", e)))??;
        Ok((id, snapshot, subscription.into_stream()))
    }

    pub async fn release_context(&self, id: ContextId) -> Result<()> {
        let pool = Arc::clone(&self.pool);
        task::spawn_blocking(move || pool.release(id))
            .await
            .map_err(|e| Error::EngineFailure(format!("release task failed: {}", e)))
    }

    pub async fn release_all_contexts(&self) -> Result<()> {
        let pool = Arc::clone(&self.pool);
        task::spawn_blocking(move || pool.release_all())
            .await
            .map_err(|e| Error::EngineFailure(format!("release task failed: {}", e)))
    }

    pub fn set_context_limit(&self, limit: usize) {
        self.pool.set_context_limit(limit);
    }

    pub fn interrupt_load(&self, id: ContextId) -> Result<()> {
        self.pool.resolve(id)?.interrupt_load()
    }

    pub async fn formatted_chat(&self, id: ContextId, messages: String, chat_template: String) -> Result<String> {
        self.blocking(id, move |ctx| ctx.formatted_chat(&messages, &chat_template))
            .await
    }

    pub async fn formatted_chat_jinja(
        &self,
        id: ContextId,
        messages: String,
        options: ChatTemplateOptions,
    ) -> Result<FormattedChat> {
        self.blocking(id, move |ctx| ctx.formatted_chat_jinja(&messages, &options))
            .await
    }

    pub async fn completion(&self, id: ContextId, params: CompletionParams) -> Result<CompletionResult> {
        self.blocking(id, move |ctx| ctx.completion(&params)).await
    }

    /// Blocking completion surfaced as a stream: every partial token, then
    /// the final result. Errors end the stream.
    pub fn completion_stream(
        &self,
        id: ContextId,
        params: CompletionParams,
    ) -> impl Stream<Item = Result<CompletionUpdate>> + Send + 'static {
        let resolved = self.pool.resolve(id);
        stream! {
            let context = match resolved {
                Ok(context) => context,
                Err(e) => {
                    yield Err(e);
                    return;
                }
            };
            let (tx, mut rx) = mpsc::unbounded_channel();
            let worker = task::spawn_blocking(move || {
                let tokens = tx.clone();
                let outcome = context.completion_with(&params, |chunk| {
                    let _ = tokens.send(Ok(CompletionUpdate::Token(chunk.clone())));
                });
                let _ = tx.send(outcome.map(CompletionUpdate::Done));
            });
            while let Some(update) = rx.recv().await {
                trace!(context = %id, "completion stream update");
                let done = !matches!(update, Ok(CompletionUpdate::Token(_)));
                yield update;
                if done {
                    break;
                }
            }
            if let Err(e) = worker.await {
                yield Err(Error::EngineFailure(format!("completion task failed: {}", e)));
            }
        }
    }

    pub fn stop_completion(&self, id: ContextId) -> Result<()> {
        self.pool.resolve(id)?.stop_completion()
    }

    pub fn is_predicting(&self, id: ContextId) -> Result<bool> {
        self.pool.resolve(id)?.is_predicting()
    }

    pub async fn tokenize(&self, id: ContextId, text: String, media_paths: Vec<String>) -> Result<Tokenized> {
        self.blocking(id, move |ctx| ctx.tokenize(&text, &media_paths)).await
    }

    pub async fn detokenize(&self, id: ContextId, tokens: Vec<i32>) -> Result<String> {
        self.blocking(id, move |ctx| ctx.detokenize(&tokens)).await
    }

    pub async fn embedding(&self, id: ContextId, text: String, params: EmbeddingParams) -> Result<Vec<f32>> {
        self.blocking(id, move |ctx| ctx.embedding(&text, &params)).await
    }

    pub async fn rerank(
        &self,
        id: ContextId,
        query: String,
        documents: Vec<String>,
        params: RerankParams,
    ) -> Result<Vec<RerankScore>> {
        self.blocking(id, move |ctx| ctx.rerank(&query, &documents, &params))
            .await
    }

    pub async fn bench(&self, id: ContextId, params: BenchParams) -> Result<String> {
        self.blocking(id, move |ctx| ctx.bench(&params)).await
    }

    pub async fn load_session(&self, id: ContextId, path: String) -> Result<SessionLoad> {
        self.blocking(id, move |ctx| ctx.load_session(&path)).await
    }

    pub async fn save_session(&self, id: ContextId, path: String, max_tokens: Option<usize>) -> Result<usize> {
        self.blocking(id, move |ctx| ctx.save_session(&path, max_tokens))
            .await
    }

    pub async fn apply_lora_adapters(&self, id: ContextId, adapters: Vec<LoraAdapter>) -> Result<()> {
        self.blocking(id, move |ctx| ctx.apply_lora_adapters(&adapters))
            .await
    }

    pub async fn remove_lora_adapters(&self, id: ContextId) -> Result<()> {
        self.blocking(id, |ctx| ctx.remove_lora_adapters()).await
    }

    pub async fn loaded_lora_adapters(&self, id: ContextId) -> Result<Vec<LoraAdapter>> {
        self.blocking(id, |ctx| ctx.loaded_lora_adapters()).await
    }

    pub async fn init_multimodal(&self, id: ContextId, params: MultimodalParams) -> Result<bool> {
        self.blocking(id, move |ctx| ctx.init_multimodal(&params)).await
    }

    pub fn is_multimodal_enabled(&self, id: ContextId) -> Result<bool> {
        self.pool.resolve(id)?.is_multimodal_enabled()
    }

    pub async fn multimodal_support(&self, id: ContextId) -> Result<MultimodalSupport> {
        self.blocking(id, |ctx| ctx.multimodal_support()).await
    }

    pub async fn release_multimodal(&self, id: ContextId) -> Result<()> {
        self.blocking(id, |ctx| ctx.release_multimodal()).await
    }

    pub async fn init_vocoder(&self, id: ContextId, params: VocoderParams) -> Result<bool> {
        self.blocking(id, move |ctx| ctx.init_vocoder(&params)).await
    }

    pub fn is_vocoder_enabled(&self, id: ContextId) -> Result<bool> {
        self.pool.resolve(id)?.is_vocoder_enabled()
    }

    pub async fn formatted_audio_completion(
        &self,
        id: ContextId,
        speaker_json: String,
        text_to_speak: String,
    ) -> Result<FormattedAudio> {
        self.blocking(id, move |ctx| {
            ctx.formatted_audio_completion(&speaker_json, &text_to_speak)
        })
        .await
    }

    pub async fn audio_guide_tokens(&self, id: ContextId, text_to_speak: String) -> Result<Vec<i32>> {
        self.blocking(id, move |ctx| ctx.audio_guide_tokens(&text_to_speak))
            .await
    }

    pub async fn decode_audio_tokens(&self, id: ContextId, tokens: Vec<i32>) -> Result<Vec<f32>> {
        self.blocking(id, move |ctx| ctx.decode_audio_tokens(&tokens)).await
    }

    pub async fn release_vocoder(&self, id: ContextId) -> Result<()> {
        self.blocking(id, |ctx| ctx.release_vocoder()).await
    }

    pub fn queue_completion(&self, id: ContextId, params: &CompletionParams) -> Result<QueuedRequest> {
        self.pool.resolve(id)?.queue_completion(params)
    }

    pub fn queue_embedding(&self, id: ContextId, text: &str, params: &EmbeddingParams) -> Result<QueuedRequest> {
        self.pool.resolve(id)?.queue_embedding(text, params)
    }

    pub fn queue_rerank(
        &self,
        id: ContextId,
        query: &str,
        documents: &[String],
        params: &RerankParams,
    ) -> Result<QueuedRequest> {
        self.pool.resolve(id)?.queue_rerank(query, documents, params)
    }

    pub fn cancel_request(&self, id: ContextId, request_id: RequestId) -> Result<bool> {
        self.pool.resolve(id)?.cancel_request(request_id)
    }

    /// Stopping the processing loop may wait for in-flight work to drain.
    pub async fn enable_parallel_mode(&self, id: ContextId, n_parallel: u32, n_batch: u32) -> Result<bool> {
        self.blocking(id, move |ctx| ctx.enable_parallel_mode(n_parallel, n_batch))
            .await
    }

    pub async fn disable_parallel_mode(&self, id: ContextId) -> Result<()> {
        self.blocking(id, |ctx| ctx.disable_parallel_mode()).await
    }

    pub fn parallel_state(&self, id: ContextId) -> Result<ParallelState> {
        self.pool.resolve(id)?.parallel_state()
    }

    /// Event stream of one context. Lagging consumers lose the oldest events.
    pub fn subscribe(&self, id: ContextId) -> Result<impl Stream<Item = ContextEvent> + Send + 'static> {
        Ok(self.pool.subscribe(id)?.into_stream())
    }

    pub fn unsubscribe(&self, id: ContextId) {
        self.pool.unsubscribe(id);
    }

    /// Forward native engine log lines to `tracing`, or stop forwarding.
    pub fn toggle_native_log(&self, enabled: bool) -> Result<()> {
        self.platform().ensure_supported()?;
        let sink: Option<NativeLogFn> = enabled.then(|| {
            Arc::new(|level: &str, text: &str| {
                let text = text.trim_end();
                match level {
                    "error" => error!(target: NATIVE_LOG_TARGET, "{}", text),
                    "warn" => warn!(target: NATIVE_LOG_TARGET, "{}", text),
                    "info" => info!(target: NATIVE_LOG_TARGET, "{}", text),
                    _ => debug!(target: NATIVE_LOG_TARGET, "{}", text),
                }
            }) as NativeLogFn
        });
        self.pool.engine().set_native_log(sink);
        debug!(enabled, "native log forwarding toggled");
        Ok(())
    }

    /// GGUF metadata without loading a context.
    pub async fn model_info(&self, path: String, skip: Vec<String>) -> Result<Metadata> {
        let path: PathBuf = resolve_path(&path)?;
        let engine = Arc::clone(self.pool.engine());
        task::spawn_blocking(move || {
            if !is_gguf(&path) {
                return Err(Error::FormatInvalid(path.display().to_string()));
            }
            Ok(engine.model_info(&path, &skip)?)
        })
        .await
        .map_err(|e| Error::EngineFailure(format!("model info task failed: {}", e)))?
    }

    pub fn backend_devices_info(&self) -> String {
        self.pool.engine().backend_devices_info()
    }

    pub fn cpu_features(&self) -> &CpuFeatures {
        &self.platform().cpu_features
    }

    pub fn is_arch_supported(&self) -> bool {
        self.platform().is_supported()
    }

    pub fn loaded_library(&self) -> &'static str {
        self.platform().library_name()
    }
}
