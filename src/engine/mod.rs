//! Native inference engine binding.
//!
//! The engine is an opaque, synchronous, callback-driven runtime. Contexts
//! hold an [`EngineHandle`] and call into an [`EngineBinding`]; everything the
//! engine computes is treated as untrusted output.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

use crate::params::{
    BenchParams, ChatTemplateOptions, CompletionParams, EmbeddingParams, InitParams, LoraAdapter,
    RerankParams,
};
use crate::results::{
    CompletionResult, FormattedAudio, FormattedChat, Metadata, MultimodalSupport, RerankScore,
    SessionLoad, TokenChunk, Tokenized,
};

pub mod loopback;

pub use crate::context::dispatcher::RequestSink;
pub use loopback::LoopbackEngine;

/// Opaque handle to one native engine context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EngineHandle(pub u64);

impl EngineHandle {
    pub fn is_null(&self) -> bool {
        self.0 == 0
    }
}

/// Engine-assigned identity of a queued request, unique within one context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub i32);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Error message reported by the engine
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{0}")]
pub struct EngineError(pub String);

impl EngineError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Load progress callback, percent in 0..=100
pub type ProgressFn = dyn Fn(u32) + Send + Sync;

/// Per-invocation token callback of a blocking completion
pub type TokenFn<'a> = dyn FnMut(TokenChunk) + Send + 'a;

/// Receiver for native log lines: (level, text)
pub type NativeLogFn = Arc<dyn Fn(&str, &str) + Send + Sync>;

/// What a successful native init reports back.
#[derive(Debug, Clone)]
pub struct InitOutput {
    pub handle: EngineHandle,
    pub gpu: bool,
    pub reason_no_gpu: String,
    pub gpu_device: String,
    /// Identifier of the native library build that served the init
    pub library: Option<String>,
}

/// Entry points of the native inference engine.
///
/// Every method taking a handle may assume the handle came from [`init`] and
/// has not been passed to [`free`]; contexts guarantee that.
///
/// [`init`]: EngineBinding::init
/// [`free`]: EngineBinding::free
pub trait EngineBinding: Send + Sync {
    /// Short identifier for logs
    fn name(&self) -> &str;

    /// GGUF metadata of a model file without creating a context.
    fn model_info(&self, path: &Path, skip: &[String]) -> EngineResult<Metadata>;

    fn backend_devices_info(&self) -> String;

    /// Install or remove the process-wide native log receiver.
    fn set_native_log(&self, sink: Option<NativeLogFn>);

    fn init(&self, params: &InitParams, progress: Option<&ProgressFn>) -> EngineResult<InitOutput>;

    fn interrupt_load(&self, handle: EngineHandle);

    fn model_details(&self, handle: EngineHandle) -> EngineResult<Metadata>;

    fn free(&self, handle: EngineHandle);

    fn formatted_chat(
        &self,
        handle: EngineHandle,
        messages: &str,
        chat_template: &str,
    ) -> EngineResult<String>;

    fn formatted_chat_jinja(
        &self,
        handle: EngineHandle,
        messages: &str,
        options: &ChatTemplateOptions,
    ) -> EngineResult<FormattedChat>;

    /// Blocking completion; `on_token` fires once per partial token.
    fn completion(
        &self,
        handle: EngineHandle,
        params: &CompletionParams,
        on_token: &mut TokenFn<'_>,
    ) -> EngineResult<CompletionResult>;

    fn stop_completion(&self, handle: EngineHandle);

    fn is_predicting(&self, handle: EngineHandle) -> bool;

    fn tokenize(
        &self,
        handle: EngineHandle,
        text: &str,
        media_paths: &[String],
    ) -> EngineResult<Tokenized>;

    fn detokenize(&self, handle: EngineHandle, tokens: &[i32]) -> EngineResult<String>;

    fn embedding(
        &self,
        handle: EngineHandle,
        text: &str,
        params: &EmbeddingParams,
    ) -> EngineResult<Vec<f32>>;

    fn rerank(
        &self,
        handle: EngineHandle,
        query: &str,
        documents: &[String],
        params: &RerankParams,
    ) -> EngineResult<Vec<RerankScore>>;

    fn bench(&self, handle: EngineHandle, params: &BenchParams) -> EngineResult<String>;

    fn load_session(&self, handle: EngineHandle, path: &Path) -> EngineResult<SessionLoad>;

    /// Returns the number of tokens written.
    fn save_session(
        &self,
        handle: EngineHandle,
        path: &Path,
        max_tokens: Option<usize>,
    ) -> EngineResult<usize>;

    /// Replaces the active adapter set.
    fn apply_adapters(&self, handle: EngineHandle, adapters: &[LoraAdapter]) -> EngineResult<()>;

    fn remove_adapters(&self, handle: EngineHandle);

    fn loaded_adapters(&self, handle: EngineHandle) -> Vec<LoraAdapter>;

    fn init_multimodal(&self, handle: EngineHandle, path: &Path, use_gpu: bool) -> bool;

    fn multimodal_support(&self, handle: EngineHandle) -> EngineResult<MultimodalSupport>;

    fn release_multimodal(&self, handle: EngineHandle);

    fn init_vocoder(&self, handle: EngineHandle, path: &Path, n_batch: u32) -> bool;

    fn formatted_audio_completion(
        &self,
        handle: EngineHandle,
        speaker_json: &str,
        text: &str,
    ) -> EngineResult<FormattedAudio>;

    fn audio_guide_tokens(&self, handle: EngineHandle, text: &str) -> EngineResult<Vec<i32>>;

    fn decode_audio_tokens(&self, handle: EngineHandle, tokens: &[i32]) -> EngineResult<Vec<f32>>;

    fn release_vocoder(&self, handle: EngineHandle);

    /// Accept a completion for background processing. Every later callback
    /// for the returned id goes through `sink`.
    fn queue_completion(
        &self,
        handle: EngineHandle,
        params: &CompletionParams,
        sink: RequestSink,
    ) -> EngineResult<RequestId>;

    fn queue_embedding(
        &self,
        handle: EngineHandle,
        text: &str,
        params: &EmbeddingParams,
        sink: RequestSink,
    ) -> EngineResult<RequestId>;

    fn queue_rerank(
        &self,
        handle: EngineHandle,
        query: &str,
        documents: &[String],
        params: &RerankParams,
        sink: RequestSink,
    ) -> EngineResult<RequestId>;

    /// Advisory; unknown or finished ids are ignored.
    fn cancel_request(&self, handle: EngineHandle, request_id: RequestId);

    /// Reconfigure for `n_parallel` slots. Returns whether the engine accepted.
    fn enable_parallel_mode(&self, handle: EngineHandle, n_parallel: u32, n_batch: u32) -> bool;

    fn disable_parallel_mode(&self, handle: EngineHandle);

    fn start_processing_loop(&self, handle: EngineHandle);

    /// Blocks until the loop has fully drained and exited.
    fn stop_processing_loop(&self, handle: EngineHandle);
}
