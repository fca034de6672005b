use clap::{Args, Subcommand};
use std::path::PathBuf;

use crate::params::{BenchParams, CompletionParams, ContextOptions};

#[derive(Subcommand)]
pub enum Commands {
    /// Run a blocking completion and stream tokens to stdout
    Complete(CompleteCommand),
    /// Queue several prompts in parallel mode and print every event
    Queue(QueueCommand),
    /// Print the token ids of a text
    Tokenize(TokenizeCommand),
    /// Print the embedding vector of a text
    Embed(EmbedCommand),
    /// Run the prompt-processing / generation benchmark
    Bench(BenchCommand),
    /// Show platform, library selection and optionally a model's GGUF header
    Info(InfoCommand),
}

/// Model and context options shared by every command that loads a model
#[derive(Args, Debug, Clone)]
pub struct ModelArgs {
    /// Path to a GGUF model file
    #[arg(short, long, env = "LLAMACTX_MODEL")]
    pub model: String,

    /// Context size in tokens
    #[arg(long, default_value_t = 512)]
    pub n_ctx: u32,

    /// Layers to offload to the GPU
    #[arg(long, default_value_t = 0, allow_negative_numbers = true)]
    pub n_gpu_layers: i32,

    /// Worker threads (0 lets the engine pick)
    #[arg(long, default_value_t = 0)]
    pub threads: u32,

    /// Disable all GPU devices
    #[arg(long)]
    pub no_gpu: bool,

    /// Publish load progress events
    #[arg(long)]
    pub progress: bool,
}

impl ModelArgs {
    pub fn context_options(&self) -> ContextOptions {
        let mut options = ContextOptions::new(self.model.clone());
        options.n_ctx = self.n_ctx;
        options.n_gpu_layers = self.n_gpu_layers;
        options.n_threads = self.threads;
        options.no_gpu_devices = self.no_gpu;
        options.use_progress_callback = self.progress;
        options
    }
}

#[derive(Args)]
pub struct CompleteCommand {
    #[command(flatten)]
    pub model: ModelArgs,

    /// Prompt text
    pub prompt: String,

    /// Tokens to generate (-1 until a stop condition)
    #[arg(short = 'n', long, default_value_t = -1, allow_negative_numbers = true)]
    pub n_predict: i32,

    /// Stop generation at this string (repeatable)
    #[arg(long)]
    pub stop: Vec<String>,

    /// Sampling temperature
    #[arg(long, default_value_t = 0.8)]
    pub temperature: f32,
}

impl CompleteCommand {
    pub fn params(&self) -> CompletionParams {
        let mut params = CompletionParams::with_prompt(self.prompt.clone()).n_predict(self.n_predict);
        params.stop = self.stop.clone();
        params.temperature = self.temperature;
        params
    }
}

#[derive(Args)]
pub struct QueueCommand {
    #[command(flatten)]
    pub model: ModelArgs,

    /// Prompts to queue
    #[arg(required = true)]
    pub prompts: Vec<String>,

    /// Concurrent request slots
    #[arg(long, default_value_t = 2)]
    pub n_parallel: u32,

    /// Batch size of the processing loop
    #[arg(long, default_value_t = 512)]
    pub n_batch: u32,

    /// Tokens to generate per request
    #[arg(short = 'n', long, default_value_t = -1, allow_negative_numbers = true)]
    pub n_predict: i32,
}

#[derive(Args)]
pub struct TokenizeCommand {
    #[command(flatten)]
    pub model: ModelArgs,

    pub text: String,
}

#[derive(Args)]
pub struct EmbedCommand {
    #[command(flatten)]
    pub model: ModelArgs,

    pub text: String,

    /// Normalisation (-1 model default, 2 euclidean)
    #[arg(long, default_value_t = -1, allow_negative_numbers = true)]
    pub normalize: i32,
}

#[derive(Args)]
pub struct BenchCommand {
    #[command(flatten)]
    pub model: ModelArgs,

    #[arg(long, default_value_t = 512)]
    pub pp: u32,

    #[arg(long, default_value_t = 128)]
    pub tg: u32,

    #[arg(long, default_value_t = 1)]
    pub pl: u32,

    /// Repetitions
    #[arg(long, default_value_t = 3)]
    pub nr: u32,
}

impl BenchCommand {
    pub fn params(&self) -> BenchParams {
        BenchParams {
            pp: self.pp,
            tg: self.tg,
            pl: self.pl,
            nr: self.nr,
        }
    }
}

#[derive(Args)]
pub struct InfoCommand {
    /// GGUF model to inspect
    #[arg(short, long)]
    pub model: Option<PathBuf>,

    /// Header keys to leave out
    #[arg(long)]
    pub skip: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::Cli;
    use clap::Parser;

    #[test]
    fn test_parse_complete() {
        let cli = Cli::try_parse_from([
            "llamactx", "complete", "-m", "m.gguf", "hello", "-n", "4", "--stop", "lo",
        ])
        .unwrap();
        match cli.command {
            Commands::Complete(cmd) => {
                let params = cmd.params();
                assert_eq!(params.prompt.as_deref(), Some("hello"));
                assert_eq!(params.n_predict, 4);
                assert_eq!(params.stop, vec!["lo".to_string()]);
                assert_eq!(cmd.model.context_options().model, "m.gguf");
            }
            _ => panic!("expected complete"),
        }
    }

    #[test]
    fn test_parse_queue_with_global_flags() {
        let cli = Cli::try_parse_from([
            "llamactx", "queue", "-m", "m.gguf", "a", "b", "--context-limit", "2", "-v",
        ])
        .unwrap();
        assert_eq!(cli.config.context_limit, Some(2));
        assert_eq!(cli.config.verbose, 1);
        match cli.command {
            Commands::Queue(cmd) => assert_eq!(cmd.prompts, vec!["a", "b"]),
            _ => panic!("expected queue"),
        }
    }
}
