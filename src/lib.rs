//! Context pool and request dispatch over a native llama inference engine.
//!
//! A [`ContextPool`] owns a bounded set of loaded model [`Context`]s. Each
//! context guards its native handle, runs blocking operations, accepts queued
//! requests in parallel mode and publishes progress, tokens and results on its
//! own event stream. [`LlamaService`] puts an async surface on top.

pub mod cli;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod events;
pub mod params;
pub mod platform;
pub mod pool;
pub mod results;
pub mod service;

// Re-export commonly used types
pub use context::{Context, ContextId, ContextSnapshot, ContextState, QueuedRequest};
pub use engine::{EngineBinding, LoopbackEngine, RequestId};
pub use error::{Error, Result};
pub use events::{ContextEvent, EventChannel, EventSubscription, EventTag};
pub use params::{CompletionParams, ContextOptions, EmbeddingParams, RerankParams};
pub use platform::Platform;
pub use pool::ContextPool;
pub use results::{CompletionResult, RequestOutcome};
pub use service::{CompletionUpdate, LlamaService};
