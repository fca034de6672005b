//! A loaded model session and its native handle.
//!
//! A [`Context`] only exists once native init succeeded; it is `Ready` until
//! [`Context::release`] frees the handle, after which every operation fails
//! with [`Error::AlreadyReleased`].
//!
//! Locking:
//! - `state` (read) is held for the duration of any call into the handle, so
//!   release (write) waits until in-flight calls return;
//! - `exec` serialises blocking calls and parallel-mode transitions;
//! - `stop_completion`, `is_predicting`, queueing and cancellation only take
//!   `state`, so they work while a blocking completion is running;
//! - once release has begun, calls still waiting for `exec` give up, and the
//!   running completion is stopped until the write lock is obtained.
//!
//! The released check comes before argument validation.

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::engine::{EngineBinding, EngineHandle, ProgressFn, RequestId};
use crate::error::{Error, Result};
use crate::events::{ContextEvent, EventChannel};
use crate::params::{
    BenchParams, ChatTemplateOptions, CompletionParams, ContextOptions, EmbeddingParams,
    LoraAdapter, MultimodalParams, RerankParams, VocoderParams,
};
use crate::platform::{is_gguf, resolve_path, Platform};
use crate::results::{
    CompletionResult, FormattedAudio, FormattedChat, Metadata, MultimodalSupport, RequestOutcome,
    RerankScore, SessionLoad, TokenChunk, Tokenized,
};

pub mod dispatcher;
pub mod parallel;
pub mod sidecar;

pub use dispatcher::{QueuedRequest, RequestDispatcher, RequestKind, RequestSink};
pub use parallel::{ParallelModeController, ParallelState};
pub use sidecar::SubResource;

/// Reason reported when the caller disabled GPU devices
pub const USER_DISABLED_GPU: &str = "GPU devices disabled by user";

/// How long release waits for in-flight calls before stopping again
const RELEASE_RETRY: Duration = Duration::from_millis(10);

/// Pool-assigned context identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContextId(pub u32);

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextState {
    Loading,
    Ready,
    Released,
}

/// What callers learn about a freshly created context.
#[derive(Debug, Clone, Serialize)]
pub struct ContextSnapshot {
    pub context_id: ContextId,
    pub gpu: bool,
    pub reason_no_gpu: String,
    pub gpu_device: String,
    pub model: Metadata,
    pub loaded_library: String,
}

pub struct Context {
    id: ContextId,
    engine: Arc<dyn EngineBinding>,
    handle: EngineHandle,
    state: RwLock<ContextState>,
    releasing: AtomicBool,
    exec: Mutex<()>,
    events: EventChannel,
    gpu: bool,
    reason_no_gpu: String,
    gpu_device: String,
    model: Metadata,
    loaded_library: String,
    dispatcher: RequestDispatcher,
    parallel: ParallelModeController,
    multimodal: SubResource,
    vocoder: SubResource,
}

impl Context {
    /// Validate the options, then load the model. Nothing survives a failure:
    /// a handle obtained before a later step fails is freed again.
    pub fn create(
        id: ContextId,
        options: &ContextOptions,
        engine: Arc<dyn EngineBinding>,
        platform: &Platform,
        events: EventChannel,
    ) -> Result<Self> {
        platform.ensure_supported()?;
        let model_path = resolve_path(&options.model)?;
        if !is_gguf(&model_path) {
            return Err(Error::FormatInvalid(model_path.display().to_string()));
        }

        debug!(context = %id, model = %model_path.display(), "loading context");
        let init_params = options.init_params(model_path);
        let progress_events = events.clone();
        let on_progress = move |percent: u32| {
            progress_events.publish(ContextEvent::Progress {
                percent: percent.min(100),
            });
        };
        let progress: Option<&ProgressFn> = if options.use_progress_callback {
            Some(&on_progress)
        } else {
            None
        };

        let output = engine
            .init(&init_params, progress)
            .map_err(|e| Error::ConstructionFailed(e.0))?;
        if output.handle.is_null() {
            return Err(Error::ConstructionFailed(
                "Invalid native context pointer".to_string(),
            ));
        }
        let model = match engine.model_details(output.handle) {
            Ok(model) => model,
            Err(e) => {
                engine.free(output.handle);
                return Err(Error::ConstructionFailed(e.0));
            }
        };

        let reason_no_gpu = if !output.gpu && options.no_gpu_devices {
            USER_DISABLED_GPU.to_string()
        } else {
            output.reason_no_gpu
        };
        let loaded_library = output
            .library
            .unwrap_or_else(|| platform.library_name().to_string());

        info!(
            context = %id,
            engine = engine.name(),
            gpu = output.gpu,
            library = %loaded_library,
            "context ready"
        );
        Ok(Self {
            id,
            handle: output.handle,
            state: RwLock::new(ContextState::Ready),
            releasing: AtomicBool::new(false),
            exec: Mutex::new(()),
            gpu: output.gpu,
            reason_no_gpu,
            gpu_device: output.gpu_device,
            model,
            loaded_library,
            dispatcher: RequestDispatcher::new(id, events.clone()),
            parallel: ParallelModeController::new(id),
            multimodal: SubResource::new("Multimodal"),
            vocoder: SubResource::new("Vocoder"),
            events,
            engine,
        })
    }

    pub fn id(&self) -> ContextId {
        self.id
    }

    pub fn state(&self) -> ContextState {
        *self.state.read_recursive()
    }

    pub fn is_released(&self) -> bool {
        self.state() == ContextState::Released
    }

    pub fn events(&self) -> &EventChannel {
        &self.events
    }

    pub fn is_gpu_enabled(&self) -> bool {
        self.gpu
    }

    pub fn reason_no_gpu(&self) -> &str {
        &self.reason_no_gpu
    }

    pub fn model_details(&self) -> &Metadata {
        &self.model
    }

    pub fn loaded_library(&self) -> &str {
        &self.loaded_library
    }

    pub fn snapshot(&self) -> ContextSnapshot {
        ContextSnapshot {
            context_id: self.id,
            gpu: self.gpu,
            reason_no_gpu: self.reason_no_gpu.clone(),
            gpu_device: self.gpu_device.clone(),
            model: self.model.clone(),
            loaded_library: self.loaded_library.clone(),
        }
    }

    fn ensure_live(&self, state: &ContextState) -> Result<()> {
        if *state == ContextState::Released || self.releasing.load(Ordering::Acquire) {
            return Err(Error::AlreadyReleased(self.id));
        }
        Ok(())
    }

    /// Run `f` against the live handle; release waits until it returns.
    fn with_handle<T>(&self, f: impl FnOnce(EngineHandle) -> Result<T>) -> Result<T> {
        let state = self.state.read();
        self.ensure_live(&state)?;
        f(self.handle)
    }

    /// Like `with_handle`, and no other blocking call runs meanwhile.
    fn with_exclusive<T>(&self, f: impl FnOnce(EngineHandle) -> Result<T>) -> Result<T> {
        self.with_handle(|handle| {
            let _exec = self.exec.lock();
            if self.releasing.load(Ordering::Acquire) {
                return Err(Error::AlreadyReleased(self.id));
            }
            f(handle)
        })
    }

    /// For short engine queries that a token callback may issue while its
    /// own completion holds `state`.
    fn with_handle_recursive<T>(&self, f: impl FnOnce(EngineHandle) -> Result<T>) -> Result<T> {
        let state = self.state.read_recursive();
        self.ensure_live(&state)?;
        f(self.handle)
    }

    pub fn interrupt_load(&self) -> Result<()> {
        self.with_handle_recursive(|h| {
            self.engine.interrupt_load(h);
            Ok(())
        })
    }

    pub fn formatted_chat(&self, messages: &str, chat_template: &str) -> Result<String> {
        self.with_exclusive(|h| {
            require_non_empty(messages, "messages")?;
            Ok(self.engine.formatted_chat(h, messages, chat_template)?)
        })
    }

    pub fn formatted_chat_jinja(
        &self,
        messages: &str,
        options: &ChatTemplateOptions,
    ) -> Result<FormattedChat> {
        self.with_exclusive(|h| {
            require_non_empty(messages, "messages")?;
            Ok(self.engine.formatted_chat_jinja(h, messages, options)?)
        })
    }

    /// Blocking completion. Every partial token goes to `on_token` and to the
    /// event stream; the final result is published as a `completion` event.
    pub fn completion_with<F>(&self, params: &CompletionParams, mut on_token: F) -> Result<CompletionResult>
    where
        F: FnMut(&TokenChunk) + Send,
    {
        let result = self.with_exclusive(|h| {
            params.require_prompt()?;
            let events = &self.events;
            let mut forward = |chunk: TokenChunk| {
                on_token(&chunk);
                events.publish(ContextEvent::Token {
                    request_id: None,
                    chunk,
                });
            };
            Ok(self.engine.completion(h, params, &mut forward)?)
        })?;
        self.events.publish(ContextEvent::Completion {
            request_id: None,
            outcome: RequestOutcome::Completed(result.clone()),
        });
        Ok(result)
    }

    pub fn completion(&self, params: &CompletionParams) -> Result<CompletionResult> {
        self.completion_with(params, |_| {})
    }

    /// Ask the running blocking completion to end early. Its result still
    /// comes back to whoever called `completion`.
    pub fn stop_completion(&self) -> Result<()> {
        self.with_handle_recursive(|h| {
            self.engine.stop_completion(h);
            Ok(())
        })
    }

    pub fn is_predicting(&self) -> Result<bool> {
        self.with_handle_recursive(|h| Ok(self.engine.is_predicting(h)))
    }

    pub fn tokenize(&self, text: &str, media_paths: &[String]) -> Result<Tokenized> {
        self.with_exclusive(|h| {
            require_non_empty(text, "text")?;
            Ok(self.engine.tokenize(h, text, media_paths)?)
        })
    }

    pub fn detokenize(&self, tokens: &[i32]) -> Result<String> {
        self.with_exclusive(|h| Ok(self.engine.detokenize(h, tokens)?))
    }

    pub fn embedding(&self, text: &str, params: &EmbeddingParams) -> Result<Vec<f32>> {
        self.with_exclusive(|h| {
            require_non_empty(text, "text")?;
            Ok(self.engine.embedding(h, text, params)?)
        })
    }

    pub fn rerank(
        &self,
        query: &str,
        documents: &[String],
        params: &RerankParams,
    ) -> Result<Vec<RerankScore>> {
        self.with_exclusive(|h| {
            require_non_empty(query, "query")?;
            if documents.is_empty() {
                return Err(Error::invalid("Documents cannot be empty"));
            }
            Ok(self.engine.rerank(h, query, documents, params)?)
        })
    }

    pub fn bench(&self, params: &BenchParams) -> Result<String> {
        self.with_exclusive(|h| Ok(self.engine.bench(h, params)?))
    }

    pub fn load_session(&self, path: &str) -> Result<SessionLoad> {
        self.with_exclusive(|h| {
            if path.is_empty() {
                return Err(Error::invalid("File path is empty"));
            }
            let path = resolve_path(path)?;
            if !path.exists() {
                return Err(Error::InvalidArgument(format!(
                    "File does not exist: {}",
                    path.display()
                )));
            }
            Ok(self.engine.load_session(h, &path)?)
        })
    }

    /// Persist the session; `max_tokens` caps how much history is written.
    pub fn save_session(&self, path: &str, max_tokens: Option<usize>) -> Result<usize> {
        self.with_exclusive(|h| {
            if path.is_empty() {
                return Err(Error::invalid("File path is empty"));
            }
            let path = resolve_path(path)?;
            Ok(self.engine.save_session(h, &path, max_tokens)?)
        })
    }

    /// Replace the active adapter set.
    pub fn apply_lora_adapters(&self, adapters: &[LoraAdapter]) -> Result<()> {
        self.with_exclusive(|h| {
            if let Some(bad) = adapters.iter().find(|a| a.path.is_empty()) {
                return Err(Error::InvalidArgument(format!(
                    "LoRA adapter path is empty (scale {})",
                    bad.scaled
                )));
            }
            self.engine
                .apply_adapters(h, adapters)
                .map_err(|e| Error::EngineFailure(format!("Failed to apply lora adapters: {}", e)))
        })
    }

    pub fn remove_lora_adapters(&self) -> Result<()> {
        self.with_exclusive(|h| {
            self.engine.remove_adapters(h);
            Ok(())
        })
    }

    pub fn loaded_lora_adapters(&self) -> Result<Vec<LoraAdapter>> {
        self.with_exclusive(|h| Ok(self.engine.loaded_adapters(h)))
    }

    pub fn init_multimodal(&self, params: &MultimodalParams) -> Result<bool> {
        self.with_exclusive(|h| {
            let path = self.multimodal.resolve_file(&params.path)?;
            let ok = self.engine.init_multimodal(h, &path, params.use_gpu);
            if ok {
                self.multimodal.enable();
            } else {
                warn!(context = %self.id, path = %path.display(), "multimodal init failed");
            }
            Ok(ok)
        })
    }

    pub fn is_multimodal_enabled(&self) -> Result<bool> {
        self.with_handle(|_| Ok(self.multimodal.is_enabled()))
    }

    pub fn multimodal_support(&self) -> Result<MultimodalSupport> {
        self.with_exclusive(|h| {
            self.multimodal.require_enabled()?;
            Ok(self.engine.multimodal_support(h)?)
        })
    }

    pub fn release_multimodal(&self) -> Result<()> {
        self.with_exclusive(|h| {
            if self.multimodal.take() {
                self.engine.release_multimodal(h);
            }
            Ok(())
        })
    }

    pub fn init_vocoder(&self, params: &VocoderParams) -> Result<bool> {
        self.with_exclusive(|h| {
            let path = self.vocoder.resolve_file(&params.path)?;
            let ok = self.engine.init_vocoder(h, &path, params.n_batch);
            if ok {
                self.vocoder.enable();
            } else {
                warn!(context = %self.id, path = %path.display(), "vocoder init failed");
            }
            Ok(ok)
        })
    }

    pub fn is_vocoder_enabled(&self) -> Result<bool> {
        self.with_handle(|_| Ok(self.vocoder.is_enabled()))
    }

    pub fn formatted_audio_completion(
        &self,
        speaker_json: &str,
        text_to_speak: &str,
    ) -> Result<FormattedAudio> {
        self.with_exclusive(|h| {
            self.vocoder.require_enabled()?;
            require_non_empty(text_to_speak, "text_to_speak")?;
            Ok(self
                .engine
                .formatted_audio_completion(h, speaker_json, text_to_speak)?)
        })
    }

    pub fn audio_guide_tokens(&self, text_to_speak: &str) -> Result<Vec<i32>> {
        self.with_exclusive(|h| {
            self.vocoder.require_enabled()?;
            require_non_empty(text_to_speak, "text_to_speak")?;
            Ok(self.engine.audio_guide_tokens(h, text_to_speak)?)
        })
    }

    pub fn decode_audio_tokens(&self, tokens: &[i32]) -> Result<Vec<f32>> {
        self.with_exclusive(|h| {
            self.vocoder.require_enabled()?;
            Ok(self.engine.decode_audio_tokens(h, tokens)?)
        })
    }

    pub fn release_vocoder(&self) -> Result<()> {
        self.with_exclusive(|h| {
            if self.vocoder.take() {
                self.engine.release_vocoder(h);
            }
            Ok(())
        })
    }

    pub fn queue_completion(&self, params: &CompletionParams) -> Result<QueuedRequest> {
        self.with_handle(|h| {
            self.dispatcher
                .queue_completion(self.engine.as_ref(), h, params)
        })
    }

    pub fn queue_embedding(&self, text: &str, params: &EmbeddingParams) -> Result<QueuedRequest> {
        self.with_handle(|h| {
            self.dispatcher
                .queue_embedding(self.engine.as_ref(), h, text, params)
        })
    }

    pub fn queue_rerank(
        &self,
        query: &str,
        documents: &[String],
        params: &RerankParams,
    ) -> Result<QueuedRequest> {
        self.with_handle(|h| {
            self.dispatcher
                .queue_rerank(self.engine.as_ref(), h, query, documents, params)
        })
    }

    /// Advisory cancellation. Returns whether the request was still in flight
    /// on this context; a terminal `cancelled` event follows if so.
    pub fn cancel_request(&self, request_id: RequestId) -> Result<bool> {
        self.with_handle(|h| Ok(self.dispatcher.cancel(self.engine.as_ref(), h, request_id)))
    }

    pub fn outstanding_requests(&self) -> Result<Vec<RequestId>> {
        self.with_handle(|_| Ok(self.dispatcher.outstanding()))
    }

    pub fn enable_parallel_mode(&self, n_parallel: u32, n_batch: u32) -> Result<bool> {
        self.with_exclusive(|h| {
            if n_parallel == 0 || n_batch == 0 {
                return Err(Error::invalid("n_parallel and n_batch must be positive"));
            }
            Ok(self
                .parallel
                .enable(self.engine.as_ref(), h, n_parallel, n_batch))
        })
    }

    pub fn disable_parallel_mode(&self) -> Result<()> {
        self.with_exclusive(|h| {
            self.parallel.disable(self.engine.as_ref(), h);
            Ok(())
        })
    }

    pub fn parallel_state(&self) -> Result<ParallelState> {
        self.with_handle(|_| Ok(self.parallel.state()))
    }

    /// Stop the processing loop, free the handle, mark released. Later calls
    /// are no-ops.
    pub fn release(&self) {
        self.releasing.store(true, Ordering::Release);
        let mut state = loop {
            {
                let state = self.state.read_recursive();
                if *state == ContextState::Released {
                    return;
                }
                // A completion that got `exec` before `releasing` was set
                // clears the engine's stop flag, so keep stopping
                self.engine.stop_completion(self.handle);
            }
            if let Some(state) = self.state.try_write_for(RELEASE_RETRY) {
                break state;
            }
        };
        if *state == ContextState::Released {
            return;
        }
        self.parallel.shutdown(self.engine.as_ref(), self.handle);
        self.engine.free(self.handle);
        self.multimodal.take();
        self.vocoder.take();
        self.dispatcher.clear();
        *state = ContextState::Released;
        info!(context = %self.id, "context released");
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("engine", &self.engine.name())
            .field("gpu", &self.gpu)
            .finish()
    }
}

fn require_non_empty(value: &str, name: &str) -> Result<()> {
    if value.is_empty() {
        Err(Error::InvalidArgument(format!("Missing required parameter: {}", name)))
    } else {
        Ok(())
    }
}
