use anyhow::{Context as _, Result};
use futures::StreamExt;
use serde_json::json;
use std::io::Write;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_log::LogTracer;
use tracing_subscriber::{filter::LevelFilter, fmt, EnvFilter};

use crate::cli::commands::{
    BenchCommand, Commands, CompleteCommand, EmbedCommand, InfoCommand, QueueCommand,
    TokenizeCommand,
};
use crate::config::LoggingSettings;
use crate::params::{CompletionParams, EmbeddingParams};
use crate::service::{CompletionUpdate, LlamaService};

/// Install the global subscriber. Keep the returned guard alive while
/// logging to a file.
pub fn init_logging(settings: &LoggingSettings) -> Result<Option<WorkerGuard>> {
    LogTracer::init().context("Failed to initialize log tracer")?;

    let filter = EnvFilter::builder()
        .with_default_directive(settings.level.parse().unwrap_or(LevelFilter::INFO).into())
        .parse_lossy(settings.filter.as_deref().unwrap_or(""));

    match &settings.file {
        Some(path) => {
            let directory = path.parent().filter(|p| !p.as_os_str().is_empty());
            let file_name = path
                .file_name()
                .context("Log file path has no file name")?;
            let appender = RollingFileAppender::new(
                Rotation::NEVER,
                directory.unwrap_or_else(|| std::path::Path::new(".")),
                file_name,
            );
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            fmt::Subscriber::builder()
                .with_env_filter(filter)
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_thread_ids(true)
                .with_thread_names(true)
                .with_file(true)
                .with_line_number(true)
                .with_target(true)
                .compact()
                .init();
            Ok(Some(guard))
        }
        None => {
            fmt::Subscriber::builder()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true)
                .init();
            Ok(None)
        }
    }
}

pub async fn run(service: &LlamaService, command: Commands) -> Result<()> {
    match command {
        Commands::Complete(cmd) => handle_complete(service, cmd).await,
        Commands::Queue(cmd) => handle_queue(service, cmd).await,
        Commands::Tokenize(cmd) => handle_tokenize(service, cmd).await,
        Commands::Embed(cmd) => handle_embed(service, cmd).await,
        Commands::Bench(cmd) => handle_bench(service, cmd).await,
        Commands::Info(cmd) => handle_info(service, cmd).await,
    }
}

pub async fn handle_complete(service: &LlamaService, cmd: CompleteCommand) -> Result<()> {
    let (id, snapshot) = service.create_context(cmd.model.context_options()).await?;
    info!(context = %id, gpu = snapshot.gpu, "model loaded");

    let updates = service.completion_stream(id, cmd.params());
    futures::pin_mut!(updates);
    let mut stdout = std::io::stdout();
    while let Some(update) = updates.next().await {
        match update? {
            CompletionUpdate::Token(chunk) => {
                write!(stdout, "{}", chunk.token)?;
                stdout.flush()?;
            }
            CompletionUpdate::Done(result) => {
                writeln!(stdout)?;
                info!(
                    predicted = result.tokens_predicted,
                    evaluated = result.tokens_evaluated,
                    stopped_word = result.stopped_word,
                    stopped_limit = result.stopped_limit,
                    "completion finished"
                );
            }
        }
    }
    service.release_context(id).await?;
    Ok(())
}

pub async fn handle_queue(service: &LlamaService, cmd: QueueCommand) -> Result<()> {
    let (id, _) = service.create_context(cmd.model.context_options()).await?;
    if !service
        .enable_parallel_mode(id, cmd.n_parallel, cmd.n_batch)
        .await?
    {
        anyhow::bail!("Engine rejected parallel mode with {} slots", cmd.n_parallel);
    }

    let events = service.subscribe(id)?;
    futures::pin_mut!(events);

    let mut requests = Vec::new();
    for prompt in &cmd.prompts {
        let params = CompletionParams::with_prompt(prompt.clone()).n_predict(cmd.n_predict);
        let request = service.queue_completion(id, &params)?;
        info!(request = %request.id(), "queued");
        requests.push(request.id());
    }

    let mut remaining = requests.len();
    while remaining > 0 {
        let Some(event) = events.next().await else {
            break;
        };
        println!("{}", serde_json::to_string(&event)?);
        if event.is_terminal() && event.request_id().is_some_and(|r| requests.contains(&r)) {
            remaining -= 1;
        }
    }

    service.disable_parallel_mode(id).await?;
    service.release_context(id).await?;
    Ok(())
}

pub async fn handle_tokenize(service: &LlamaService, cmd: TokenizeCommand) -> Result<()> {
    let (id, _) = service.create_context(cmd.model.context_options()).await?;
    let tokenized = service.tokenize(id, cmd.text, Vec::new()).await?;
    println!("{}", serde_json::to_string(&tokenized)?);
    service.release_context(id).await?;
    Ok(())
}

pub async fn handle_embed(service: &LlamaService, cmd: EmbedCommand) -> Result<()> {
    let mut options = cmd.model.context_options();
    options.embedding = true;
    let (id, _) = service.create_context(options).await?;
    let params = EmbeddingParams {
        embd_normalize: cmd.normalize,
    };
    let embedding = service.embedding(id, cmd.text, params).await?;
    println!("{}", serde_json::to_string(&embedding)?);
    service.release_context(id).await?;
    Ok(())
}

pub async fn handle_bench(service: &LlamaService, cmd: BenchCommand) -> Result<()> {
    let (id, _) = service.create_context(cmd.model.context_options()).await?;
    let report = service.bench(id, cmd.params()).await?;
    println!("{}", report);
    service.release_context(id).await?;
    Ok(())
}

pub async fn handle_info(service: &LlamaService, cmd: InfoCommand) -> Result<()> {
    let devices: serde_json::Value =
        serde_json::from_str(&service.backend_devices_info()).unwrap_or(serde_json::Value::Null);
    let platform = serde_json::to_value(&**service.pool().platform())?;
    let mut report = json!({
        "platform": platform,
        "arch_supported": service.is_arch_supported(),
        "library": service.loaded_library(),
        "devices": devices,
        "context_limit": service.pool().context_limit(),
    });
    if let Some(model) = cmd.model {
        let header = service
            .model_info(model.to_string_lossy().into_owned(), cmd.skip)
            .await?;
        report["model"] = serde_json::Value::Object(header);
    }
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
