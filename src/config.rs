//! Configuration management for llamactx.
//!
//! Sources, lowest precedence first:
//! 1. Default configuration (embedded in binary)
//! 2. System-wide configuration file (`/etc/llamactx/config.toml`)
//! 3. User-specified configuration file (`--config`)
//! 4. Environment variables (`LLAMACTX_` prefix, `__` between sections,
//!    e.g. `LLAMACTX_POOL__CONTEXT_LIMIT=4`)
//! 5. Command-line arguments

use clap::Args;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::engine::loopback::LoopbackConfig;
use crate::error::Result;

const DEFAULT_CONFIG: &str = include_str!("../config/default.toml");
const SYSTEM_CONFIG: &str = "/etc/llamactx/config.toml";

/// Command-line overrides shared by every subcommand
#[derive(Debug, Clone, Default, Args)]
pub struct ConfigArgs {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", global = true, env = "LLAMACTX_CONFIG")]
    pub config: Option<PathBuf>,

    /// Maximum number of live contexts
    #[arg(long, global = true)]
    pub context_limit: Option<usize>,

    /// Events buffered per subscriber before the oldest are dropped
    #[arg(long, global = true)]
    pub event_buffer: Option<usize>,

    /// Pause between generated tokens of the loopback engine
    #[arg(long, global = true, value_name = "MS")]
    pub token_delay_ms: Option<u64>,

    /// Let the loopback engine report GPU offload
    #[arg(long, global = true)]
    pub gpu_available: Option<bool>,

    /// Increase verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    /// Log filter directives, e.g. "llamactx_core=debug"
    #[arg(long, global = true)]
    pub log_filter: Option<String>,

    /// Also write logs to this file
    #[arg(long, global = true, value_name = "FILE")]
    pub log_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub pool: PoolSettings,
    pub events: EventSettings,
    pub engine: LoopbackSettings,
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSettings {
    #[serde(default = "default_context_limit")]
    pub context_limit: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventSettings {
    /// Per-subscriber buffer
    #[serde(default = "default_event_buffer")]
    pub buffer: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopbackSettings {
    #[serde(default)]
    pub token_delay_ms: u64,
    #[serde(default)]
    pub gpu_available: bool,
    #[serde(default = "default_max_parallel")]
    pub max_parallel: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub filter: Option<String>,
    #[serde(default)]
    pub file: Option<PathBuf>,
}

fn default_context_limit() -> usize {
    crate::pool::DEFAULT_CONTEXT_LIMIT
}

fn default_event_buffer() -> usize {
    crate::events::DEFAULT_EVENT_BUFFER
}

fn default_max_parallel() -> u32 {
    16
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Settings {
    /// Load configuration from all sources
    pub fn load(args: &ConfigArgs) -> Result<Self> {
        let mut builder = config::Config::builder()
            .add_source(config::File::from_str(DEFAULT_CONFIG, config::FileFormat::Toml))
            .add_source(config::File::with_name(SYSTEM_CONFIG).required(false));

        if let Some(path) = &args.config {
            builder = builder.add_source(config::File::from(path.as_path()));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("LLAMACTX")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let mut settings: Settings = builder.build()?.try_deserialize()?;
        settings.apply_args(args);
        Ok(settings)
    }

    fn apply_args(&mut self, args: &ConfigArgs) {
        if let Some(limit) = args.context_limit {
            self.pool.context_limit = limit;
        }
        if let Some(buffer) = args.event_buffer {
            self.events.buffer = buffer;
        }
        if let Some(delay) = args.token_delay_ms {
            self.engine.token_delay_ms = delay;
        }
        if let Some(gpu) = args.gpu_available {
            self.engine.gpu_available = gpu;
        }
        match args.verbose {
            0 => {}
            1 => self.logging.level = "debug".to_string(),
            _ => self.logging.level = "trace".to_string(),
        }
        if let Some(level) = &args.log_level {
            self.logging.level = level.clone();
        }
        if let Some(filter) = &args.log_filter {
            self.logging.filter = Some(filter.clone());
        }
        if let Some(file) = &args.log_file {
            self.logging.file = Some(file.clone());
        }
    }

    pub fn loopback_config(&self) -> LoopbackConfig {
        LoopbackConfig {
            token_delay: Duration::from_millis(self.engine.token_delay_ms),
            gpu_available: self.engine.gpu_available,
            max_parallel: self.engine.max_parallel,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_embedded_defaults() {
        let settings = Settings::load(&ConfigArgs::default()).unwrap();
        assert_eq!(settings.pool.context_limit, 1);
        assert_eq!(settings.events.buffer, 64);
        assert_eq!(settings.logging.level, "info");
        assert!(!settings.engine.gpu_available);
    }

    #[test]
    fn test_file_then_cli_precedence() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[pool]\ncontext_limit = 3\n[engine]\ntoken_delay_ms = 5").unwrap();

        let mut args = ConfigArgs {
            config: Some(file.path().to_path_buf()),
            ..Default::default()
        };
        let settings = Settings::load(&args).unwrap();
        assert_eq!(settings.pool.context_limit, 3);
        assert_eq!(settings.loopback_config().token_delay, Duration::from_millis(5));

        args.context_limit = Some(8);
        args.verbose = 2;
        let settings = Settings::load(&args).unwrap();
        assert_eq!(settings.pool.context_limit, 8);
        assert_eq!(settings.logging.level, "trace");
    }
}
