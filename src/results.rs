//! Values returned by the engine and republished to callers.
//!
//! All of these are immutable once built; events clone them freely across
//! threads.

use serde::{Deserialize, Serialize};

/// Opaque key/value bag reported by the engine (model details, GGUF header).
pub type Metadata = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenProb {
    pub token: String,
    pub prob: f32,
}

/// One partial token emitted during generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenChunk {
    pub token: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub probs: Vec<TokenProb>,
}

impl TokenChunk {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            probs: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Timings {
    pub prompt_n: usize,
    pub prompt_ms: f64,
    pub predicted_n: usize,
    pub predicted_ms: f64,
}

/// Final result of a completion.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompletionResult {
    pub text: String,
    pub tokens_predicted: usize,
    pub tokens_evaluated: usize,
    pub truncated: bool,
    pub stopped_eos: bool,
    pub stopped_word: bool,
    pub stopped_limit: bool,
    pub stopping_word: String,
    /// Set when `stop` or cancellation ended generation early
    pub interrupted: bool,
    pub timings: Timings,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Tokenized {
    pub tokens: Vec<i32>,
    pub has_media: bool,
    #[serde(default)]
    pub chunk_pos: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RerankScore {
    pub index: usize,
    pub score: f32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionLoad {
    pub tokens_loaded: usize,
    pub prompt: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FormattedChat {
    pub prompt: String,
    pub chat_format: i32,
    #[serde(default)]
    pub grammar: Option<String>,
    #[serde(default)]
    pub additional_stops: Vec<String>,
    #[serde(default)]
    pub thinking_forced_open: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultimodalSupport {
    pub vision: bool,
    pub audio: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FormattedAudio {
    pub prompt: String,
    #[serde(default)]
    pub grammar: Option<String>,
}

/// Lifecycle of a queued request as the engine reports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Queued,
    Running,
    Completed,
    Cancelled,
    Failed,
}

impl RequestStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RequestStatus::Completed | RequestStatus::Cancelled | RequestStatus::Failed
        )
    }
}

/// Terminal state of a queued request. Cancelled requests still produce one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "value", rename_all = "snake_case")]
pub enum RequestOutcome<T> {
    Completed(T),
    Cancelled,
    Failed(String),
}

impl<T> RequestOutcome<T> {
    pub fn status(&self) -> RequestStatus {
        match self {
            RequestOutcome::Completed(_) => RequestStatus::Completed,
            RequestOutcome::Cancelled => RequestStatus::Cancelled,
            RequestOutcome::Failed(_) => RequestStatus::Failed,
        }
    }

    pub fn completed(self) -> Option<T> {
        match self {
            RequestOutcome::Completed(value) => Some(value),
            _ => None,
        }
    }
}
