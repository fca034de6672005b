//! Error types for llamactx.
//!
//! Every fallible operation returns [`Result`]. Validation failures are raised
//! before the engine is touched; engine failures carry the engine's message.

use std::result;
use thiserror::Error;

use crate::context::ContextId;

/// A specialized Result type for llamactx operations.
pub type Result<T> = result::Result<T, Error>;

/// The error type for llamactx operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Unknown context id (or a request addressed to the wrong context)
    #[error("{0} not found")]
    NotFound(String),

    /// The pool already holds its configured number of live contexts
    #[error("Context limit reached ({limit} live contexts)")]
    LimitReached { limit: usize },

    /// Operation on a context whose native handle was freed
    #[error("Context {0} has been released")]
    AlreadyReleased(ContextId),

    /// Missing or empty required parameter
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// CPU architecture has no native library build
    #[error("Unsupported platform: {0}")]
    UnsupportedPlatform(String),

    /// Model file does not carry the GGUF signature
    #[error("File is not in GGUF format: {0}")]
    FormatInvalid(String),

    /// Multimodal or vocoder operation before a successful init
    #[error("{0} is not enabled")]
    NotEnabled(&'static str),

    /// Error message reported by the engine
    #[error("Engine error: {0}")]
    EngineFailure(String),

    /// Native init aborted; nothing was registered
    #[error("Failed to initialize context: {0}")]
    ConstructionFailed(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether the caller can fix the failure by changing its input.
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            Error::NotFound(_)
                | Error::AlreadyReleased(_)
                | Error::InvalidArgument(_)
                | Error::NotEnabled(_)
        )
    }

    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Error::Config(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::InvalidArgument(err.to_string())
    }
}

impl From<crate::engine::EngineError> for Error {
    fn from(err: crate::engine::EngineError) -> Self {
        Error::EngineFailure(err.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_caller_errors() {
        assert!(Error::invalid("prompt").is_caller_error());
        assert!(Error::NotEnabled("Vocoder").is_caller_error());
        assert!(!Error::EngineFailure("oom".into()).is_caller_error());
        assert!(!Error::LimitReached { limit: 1 }.is_caller_error());
    }

    #[test]
    fn test_display() {
        let err = Error::AlreadyReleased(ContextId(7));
        assert_eq!(err.to_string(), "Context 7 has been released");
        assert_eq!(
            Error::NotEnabled("Multimodal").to_string(),
            "Multimodal is not enabled"
        );
    }
}
