//! Command-line interface module.
//!
//! This module provides the CLI functionality for:
//! - Blocking and queued completions against a model file
//! - Tokenizer, embedding and benchmark commands
//! - Platform and model inspection

pub mod commands;
pub mod handlers;
pub mod options;

pub use handlers::{init_logging, run};
pub use options::Cli;
