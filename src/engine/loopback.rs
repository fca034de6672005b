//! Deterministic in-process engine binding.
//!
//! Tokens are byte values, completions echo the prompt, embeddings are byte
//! histograms. Queued requests run on a real background thread per session
//! that steps up to `n_parallel` requests round-robin, one token per tick.

use parking_lot::{Condvar, Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, trace, warn};

use super::{
    EngineBinding, EngineError, EngineHandle, EngineResult, InitOutput, NativeLogFn, ProgressFn,
    RequestId, RequestSink, TokenFn,
};
use crate::params::{
    BenchParams, ChatTemplateOptions, CompletionParams, EmbeddingParams, InitParams, LoraAdapter,
    RerankParams,
};
use crate::platform::GGUF_MAGIC;
use crate::results::{
    CompletionResult, FormattedAudio, FormattedChat, Metadata, MultimodalSupport, RequestOutcome,
    RerankScore, SessionLoad, TokenChunk, TokenProb, Tokenized, Timings,
};

/// Width of the byte-histogram embedding
pub const EMBEDDING_DIM: usize = 16;

const RELEASED: &str = "Context released";
const PARALLEL_DISABLED: &str = "Parallel mode disabled";

#[derive(Debug, Clone)]
pub struct LoopbackConfig {
    /// Pause before every generated token
    pub token_delay: Duration,
    /// Whether init may offload to a (pretend) GPU
    pub gpu_available: bool,
    /// Largest `n_parallel` accepted by `enable_parallel_mode`
    pub max_parallel: u32,
}

impl Default for LoopbackConfig {
    fn default() -> Self {
        Self {
            token_delay: Duration::ZERO,
            gpu_available: false,
            max_parallel: 16,
        }
    }
}

pub struct LoopbackEngine {
    config: LoopbackConfig,
    next_handle: AtomicU64,
    sessions: RwLock<HashMap<EngineHandle, Arc<Session>>>,
    log_sink: RwLock<Option<NativeLogFn>>,
}

struct Session {
    handle: EngineHandle,
    model: PathBuf,
    model_size: u64,
    embedding: bool,
    embd_normalize: i32,
    n_ctx: u32,
    stop: AtomicBool,
    predicting: AtomicBool,
    history: Mutex<Vec<i32>>,
    adapters: Mutex<Vec<LoraAdapter>>,
    multimodal: AtomicBool,
    vocoder: AtomicBool,
    scheduler: Arc<Scheduler>,
}

impl LoopbackEngine {
    pub fn new(config: LoopbackConfig) -> Self {
        Self {
            config,
            next_handle: AtomicU64::new(1),
            sessions: RwLock::new(HashMap::new()),
            log_sink: RwLock::new(None),
        }
    }

    pub fn config(&self) -> &LoopbackConfig {
        &self.config
    }

    /// Number of handles that have not been freed
    pub fn live_sessions(&self) -> usize {
        self.sessions.read().len()
    }

    fn session(&self, handle: EngineHandle) -> EngineResult<Arc<Session>> {
        self.sessions
            .read()
            .get(&handle)
            .cloned()
            .ok_or_else(|| EngineError::new(format!("Invalid context handle {}", handle.0)))
    }

    fn with_session(&self, handle: EngineHandle, f: impl FnOnce(&Session)) {
        match self.session(handle) {
            Ok(session) => f(&session),
            Err(e) => warn!("{}", e),
        }
    }

    fn log(&self, level: &str, text: &str) {
        if let Some(sink) = self.log_sink.read().as_ref() {
            sink(level, text);
        }
    }

    fn pause(&self) {
        if !self.config.token_delay.is_zero() {
            thread::sleep(self.config.token_delay);
        }
    }
}

impl Default for LoopbackEngine {
    fn default() -> Self {
        Self::new(LoopbackConfig::default())
    }
}

impl EngineBinding for LoopbackEngine {
    fn name(&self) -> &str {
        "loopback"
    }

    fn model_info(&self, path: &Path, skip: &[String]) -> EngineResult<Metadata> {
        let header = read_gguf_header(path)?;
        let mut info = Metadata::new();
        for (key, value) in header {
            if !skip.iter().any(|s| s == &key) {
                info.insert(key, value);
            }
        }
        Ok(info)
    }

    fn backend_devices_info(&self) -> String {
        let mut devices = vec![json!({ "type": "cpu", "name": "loopback-cpu" })];
        if self.config.gpu_available {
            devices.push(json!({ "type": "gpu", "name": "loopback-gpu" }));
        }
        Value::Array(devices).to_string()
    }

    fn set_native_log(&self, sink: Option<NativeLogFn>) {
        *self.log_sink.write() = sink;
    }

    fn init(&self, params: &InitParams, progress: Option<&ProgressFn>) -> EngineResult<InitOutput> {
        let header = read_gguf_header(&params.model)?;
        self.log("info", &format!("loading model from {}", params.model.display()));
        if let Some(progress) = progress {
            for percent in [0, 25, 50, 75, 100] {
                progress(percent);
            }
        }

        let wants_gpu = !params.no_gpu_devices && params.n_gpu_layers.unwrap_or(0) > 0;
        let gpu = self.config.gpu_available && wants_gpu;
        let reason_no_gpu = if gpu {
            String::new()
        } else if !self.config.gpu_available {
            "No GPU backend available".to_string()
        } else {
            "n_gpu_layers is 0".to_string()
        };

        let handle = EngineHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        let model_size = fs::metadata(&params.model).map(|m| m.len()).unwrap_or(0);
        let mut adapters = params.lora_list.clone();
        adapters.extend(params.lora.clone());
        let session = Session {
            handle,
            model: params.model.clone(),
            model_size,
            embedding: params.embedding,
            embd_normalize: params.embd_normalize.unwrap_or(2),
            n_ctx: params.n_ctx,
            stop: AtomicBool::new(false),
            predicting: AtomicBool::new(false),
            history: Mutex::new(Vec::new()),
            adapters: Mutex::new(adapters),
            multimodal: AtomicBool::new(false),
            vocoder: AtomicBool::new(false),
            scheduler: Arc::new(Scheduler::new(self.config.token_delay)),
        };
        self.sessions.write().insert(handle, Arc::new(session));
        let n_threads = params
            .n_threads
            .unwrap_or_else(|| num_cpus::get_physical() as u32);
        let kv_count = header.get("kv_count").cloned().unwrap_or(Value::Null);
        debug!(
            handle = handle.0,
            n_threads,
            kv = %kv_count,
            "loopback session created"
        );

        Ok(InitOutput {
            handle,
            gpu,
            reason_no_gpu,
            gpu_device: if gpu { "loopback-gpu".to_string() } else { String::new() },
            library: None,
        })
    }

    fn interrupt_load(&self, handle: EngineHandle) {
        // Loads complete synchronously in init; nothing left to interrupt
        trace!(handle = handle.0, "interrupt_load ignored");
    }

    fn model_details(&self, handle: EngineHandle) -> EngineResult<Metadata> {
        let session = self.session(handle)?;
        let mut details = Metadata::new();
        details.insert("desc".into(), json!("loopback byte model"));
        details.insert("size".into(), json!(session.model_size));
        details.insert("nEmbd".into(), json!(EMBEDDING_DIM));
        details.insert("nParams".into(), json!(256));
        details.insert("nCtx".into(), json!(session.n_ctx));
        details.insert("isChatTemplateSupported".into(), json!(true));
        details.insert("metadata".into(), Value::Object(read_gguf_header(&session.model)?));
        Ok(details)
    }

    fn free(&self, handle: EngineHandle) {
        let Some(session) = self.sessions.write().remove(&handle) else {
            warn!(handle = handle.0, "free of unknown handle");
            return;
        };
        session.scheduler.stop();
        session.scheduler.fail_pending(RELEASED);
        self.log("info", &format!("freed context {}", handle.0));
    }

    fn formatted_chat(
        &self,
        handle: EngineHandle,
        messages: &str,
        chat_template: &str,
    ) -> EngineResult<String> {
        self.session(handle)?;
        let messages = parse_messages(messages)?;
        let mut prompt = String::new();
        if !chat_template.is_empty() {
            prompt.push_str(&format!("<|template:{}|>\n", chat_template));
        }
        for (role, content) in messages {
            prompt.push_str(&format!("<|{}|>\n{}\n", role, content));
        }
        prompt.push_str("<|assistant|>\n");
        Ok(prompt)
    }

    fn formatted_chat_jinja(
        &self,
        handle: EngineHandle,
        messages: &str,
        options: &ChatTemplateOptions,
    ) -> EngineResult<FormattedChat> {
        self.session(handle)?;
        let messages = parse_messages(messages)?;
        let mut prompt: String = messages
            .iter()
            .map(|(role, content)| format!("<|{}|>\n{}\n", role, content))
            .collect();
        if options.add_generation_prompt {
            prompt.push_str("<|assistant|>\n");
        }
        if options.enable_thinking {
            prompt.push_str("<think>\n");
        }
        Ok(FormattedChat {
            prompt,
            chat_format: 0,
            grammar: (!options.json_schema.is_empty()).then(|| options.json_schema.clone()),
            additional_stops: vec!["<|user|>".to_string()],
            thinking_forced_open: options.enable_thinking,
        })
    }

    fn completion(
        &self,
        handle: EngineHandle,
        params: &CompletionParams,
        on_token: &mut TokenFn<'_>,
    ) -> EngineResult<CompletionResult> {
        let session = self.session(handle)?;
        let prompt = params
            .prompt
            .as_deref()
            .filter(|p| !p.is_empty())
            .ok_or_else(|| EngineError::new("Prompt is empty"))?;
        if !params.media_paths.is_empty() && !session.multimodal.load(Ordering::Acquire) {
            return Err(EngineError::new("Multimodal is not initialized"));
        }

        session.stop.store(false, Ordering::Release);
        session.predicting.store(true, Ordering::Release);
        let mut run = CompletionRun::new(prompt, params);
        let result = loop {
            if session.stop.load(Ordering::Acquire) {
                break run.interrupt();
            }
            match run.step() {
                Step::Token(chunk) => {
                    self.pause();
                    on_token(chunk);
                }
                Step::Done(result) => break result,
            }
        };
        session.predicting.store(false, Ordering::Release);
        *session.history.lock() = run.history();
        Ok(result)
    }

    fn stop_completion(&self, handle: EngineHandle) {
        self.with_session(handle, |session| session.stop.store(true, Ordering::Release));
    }

    fn is_predicting(&self, handle: EngineHandle) -> bool {
        self.session(handle)
            .map(|session| session.predicting.load(Ordering::Acquire))
            .unwrap_or(false)
    }

    fn tokenize(
        &self,
        handle: EngineHandle,
        text: &str,
        media_paths: &[String],
    ) -> EngineResult<Tokenized> {
        let session = self.session(handle)?;
        let has_media = !media_paths.is_empty();
        if has_media && !session.multimodal.load(Ordering::Acquire) {
            return Err(EngineError::new("Multimodal is not initialized"));
        }
        Ok(Tokenized {
            tokens: byte_tokens(text),
            has_media,
            chunk_pos: if has_media { vec![0] } else { Vec::new() },
        })
    }

    fn detokenize(&self, handle: EngineHandle, tokens: &[i32]) -> EngineResult<String> {
        self.session(handle)?;
        detokenize_bytes(tokens)
    }

    fn embedding(
        &self,
        handle: EngineHandle,
        text: &str,
        params: &EmbeddingParams,
    ) -> EngineResult<Vec<f32>> {
        let session = self.session(handle)?;
        let normalize = session.require_embedding(params.embd_normalize)?;
        Ok(embed(text, normalize))
    }

    fn rerank(
        &self,
        handle: EngineHandle,
        query: &str,
        documents: &[String],
        params: &RerankParams,
    ) -> EngineResult<Vec<RerankScore>> {
        let session = self.session(handle)?;
        session.require_embedding(-1)?;
        Ok(rerank_scores(query, documents, params.normalize))
    }

    fn bench(&self, handle: EngineHandle, params: &BenchParams) -> EngineResult<String> {
        let session = self.session(handle)?;
        let prompt = "a".repeat(params.pp as usize);
        let mut pp_speeds = Vec::new();
        let mut tg_speeds = Vec::new();
        for _ in 0..params.nr.max(1) {
            let started = Instant::now();
            let tokens = byte_tokens(&prompt);
            pp_speeds.push(rate(tokens.len() * params.pl.max(1) as usize, started));

            let started = Instant::now();
            let generated: String = (0..params.tg).map(|_| 'a').collect();
            tg_speeds.push(rate(generated.len() * params.pl.max(1) as usize, started));
        }
        let (pp_avg, pp_std) = mean_std(&pp_speeds);
        let (tg_avg, tg_std) = mean_std(&tg_speeds);
        Ok(json!([
            "loopback byte model",
            session.model_size,
            256,
            pp_avg,
            pp_std,
            tg_avg,
            tg_std
        ])
        .to_string())
    }

    fn load_session(&self, handle: EngineHandle, path: &Path) -> EngineResult<SessionLoad> {
        let session = self.session(handle)?;
        let blob = fs::read(path)
            .map_err(|e| EngineError::new(format!("Failed to load session: {}", e)))?;
        let saved: SessionBlob = serde_json::from_slice(&blob)
            .map_err(|e| EngineError::new(format!("Failed to load session: {}", e)))?;
        let prompt = detokenize_bytes(&saved.tokens)?;
        let tokens_loaded = saved.tokens.len();
        *session.history.lock() = saved.tokens;
        Ok(SessionLoad {
            tokens_loaded,
            prompt,
        })
    }

    fn save_session(
        &self,
        handle: EngineHandle,
        path: &Path,
        max_tokens: Option<usize>,
    ) -> EngineResult<usize> {
        let session = self.session(handle)?;
        let mut tokens = session.history.lock().clone();
        if let Some(max) = max_tokens {
            tokens.truncate(max);
        }
        let count = tokens.len();
        let blob = serde_json::to_vec(&SessionBlob { tokens })
            .map_err(|e| EngineError::new(e.to_string()))?;
        fs::write(path, &blob)
            .map_err(|e| EngineError::new(format!("Failed to save session: {}", e)))?;
        Ok(count)
    }

    fn apply_adapters(&self, handle: EngineHandle, adapters: &[LoraAdapter]) -> EngineResult<()> {
        let session = self.session(handle)?;
        if let Some(missing) = adapters.iter().find(|a| !Path::new(&a.path).exists()) {
            return Err(EngineError::new(format!("adapter not found: {}", missing.path)));
        }
        *session.adapters.lock() = adapters.to_vec();
        Ok(())
    }

    fn remove_adapters(&self, handle: EngineHandle) {
        self.with_session(handle, |session| session.adapters.lock().clear());
    }

    fn loaded_adapters(&self, handle: EngineHandle) -> Vec<LoraAdapter> {
        self.session(handle)
            .map(|session| session.adapters.lock().clone())
            .unwrap_or_default()
    }

    fn init_multimodal(&self, handle: EngineHandle, path: &Path, use_gpu: bool) -> bool {
        let Ok(session) = self.session(handle) else {
            return false;
        };
        let ok = path.is_file();
        session.multimodal.store(ok, Ordering::Release);
        debug!(handle = handle.0, use_gpu, ok, "multimodal projector init");
        ok
    }

    fn multimodal_support(&self, handle: EngineHandle) -> EngineResult<MultimodalSupport> {
        let session = self.session(handle)?;
        if !session.multimodal.load(Ordering::Acquire) {
            return Err(EngineError::new("Multimodal is not initialized"));
        }
        Ok(MultimodalSupport {
            vision: true,
            audio: false,
        })
    }

    fn release_multimodal(&self, handle: EngineHandle) {
        self.with_session(handle, |session| session.multimodal.store(false, Ordering::Release));
    }

    fn init_vocoder(&self, handle: EngineHandle, path: &Path, n_batch: u32) -> bool {
        let Ok(session) = self.session(handle) else {
            return false;
        };
        let ok = path.is_file() && n_batch > 0;
        session.vocoder.store(ok, Ordering::Release);
        ok
    }

    fn formatted_audio_completion(
        &self,
        handle: EngineHandle,
        speaker_json: &str,
        text: &str,
    ) -> EngineResult<FormattedAudio> {
        self.session(handle)?.require_vocoder()?;
        let speaker = if speaker_json.is_empty() {
            "default".to_string()
        } else {
            serde_json::from_str::<Value>(speaker_json)
                .map_err(|e| EngineError::new(format!("Invalid speaker: {}", e)))?
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or("custom")
                .to_string()
        };
        Ok(FormattedAudio {
            prompt: format!("<|speaker:{}|>{}<|audio|>", speaker, text),
            grammar: None,
        })
    }

    fn audio_guide_tokens(&self, handle: EngineHandle, text: &str) -> EngineResult<Vec<i32>> {
        self.session(handle)?.require_vocoder()?;
        Ok(byte_tokens(text))
    }

    fn decode_audio_tokens(&self, handle: EngineHandle, tokens: &[i32]) -> EngineResult<Vec<f32>> {
        self.session(handle)?.require_vocoder()?;
        Ok(tokens
            .iter()
            .map(|&t| (t.clamp(0, 255) as f32 / 255.0) * 2.0 - 1.0)
            .collect())
    }

    fn release_vocoder(&self, handle: EngineHandle) {
        self.with_session(handle, |session| session.vocoder.store(false, Ordering::Release));
    }

    fn queue_completion(
        &self,
        handle: EngineHandle,
        params: &CompletionParams,
        sink: RequestSink,
    ) -> EngineResult<RequestId> {
        let session = self.session(handle)?;
        let prompt = params
            .prompt
            .as_deref()
            .filter(|p| !p.is_empty())
            .ok_or_else(|| EngineError::new("Prompt is empty"))?;
        let work = Work::Completion(CompletionRun::new(prompt, params));
        session.scheduler.submit(work, sink)
    }

    fn queue_embedding(
        &self,
        handle: EngineHandle,
        text: &str,
        params: &EmbeddingParams,
        sink: RequestSink,
    ) -> EngineResult<RequestId> {
        let session = self.session(handle)?;
        let normalize = session.require_embedding(params.embd_normalize)?;
        let work = Work::Embedding {
            text: text.to_string(),
            normalize,
        };
        session.scheduler.submit(work, sink)
    }

    fn queue_rerank(
        &self,
        handle: EngineHandle,
        query: &str,
        documents: &[String],
        params: &RerankParams,
        sink: RequestSink,
    ) -> EngineResult<RequestId> {
        let session = self.session(handle)?;
        session.require_embedding(-1)?;
        let work = Work::Rerank {
            query: query.to_string(),
            documents: documents.to_vec(),
            normalize: params.normalize,
        };
        session.scheduler.submit(work, sink)
    }

    fn cancel_request(&self, handle: EngineHandle, request_id: RequestId) {
        self.with_session(handle, |session| session.scheduler.cancel(request_id));
    }

    fn enable_parallel_mode(&self, handle: EngineHandle, n_parallel: u32, n_batch: u32) -> bool {
        let Ok(session) = self.session(handle) else {
            return false;
        };
        if n_parallel == 0 || n_parallel > self.config.max_parallel || n_batch == 0 {
            warn!(n_parallel, n_batch, max = self.config.max_parallel, "parallel configuration rejected");
            // Back to single-request mode; nothing will run what was queued
            session.scheduler.configure(None);
            session.scheduler.fail_pending(PARALLEL_DISABLED);
            return false;
        }
        session.scheduler.configure(Some(n_parallel as usize));
        true
    }

    fn disable_parallel_mode(&self, handle: EngineHandle) {
        self.with_session(handle, |session| {
            session.scheduler.configure(None);
            session.scheduler.fail_pending(PARALLEL_DISABLED);
        });
    }

    fn start_processing_loop(&self, handle: EngineHandle) {
        self.with_session(handle, |session| {
            Scheduler::start(&session.scheduler, session.handle);
        });
    }

    fn stop_processing_loop(&self, handle: EngineHandle) {
        self.with_session(handle, |session| session.scheduler.stop());
    }
}

impl Session {
    /// Effective normalisation, or an error when the context was not
    /// created for embeddings.
    fn require_embedding(&self, requested: i32) -> EngineResult<i32> {
        if !self.embedding {
            return Err(EngineError::new("Embedding is not enabled for this context"));
        }
        Ok(if requested == -1 {
            self.embd_normalize
        } else {
            requested
        })
    }

    fn require_vocoder(&self) -> EngineResult<()> {
        if self.vocoder.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(EngineError::new("Vocoder is not initialized"))
        }
    }
}

enum Step {
    Token(TokenChunk),
    Done(CompletionResult),
}

/// Echo generation state shared by blocking and queued completions.
struct CompletionRun {
    prompt_tokens: Vec<i32>,
    remaining: VecDeque<char>,
    limit: Option<usize>,
    stop: Vec<String>,
    n_probs: u32,
    text: String,
    predicted: usize,
    started: Instant,
}

impl CompletionRun {
    fn new(prompt: &str, params: &CompletionParams) -> Self {
        Self {
            prompt_tokens: byte_tokens(prompt),
            remaining: prompt.chars().collect(),
            limit: usize::try_from(params.n_predict).ok(),
            stop: params.stop.iter().filter(|s| !s.is_empty()).cloned().collect(),
            n_probs: params.n_probs,
            text: String::new(),
            predicted: 0,
            started: Instant::now(),
        }
    }

    fn step(&mut self) -> Step {
        if self.limit.is_some_and(|limit| self.predicted >= limit) {
            return Step::Done(self.result(|r| r.stopped_limit = true));
        }
        let Some(next) = self.remaining.pop_front() else {
            return Step::Done(self.result(|r| r.stopped_eos = true));
        };
        self.text.push(next);
        self.predicted += 1;

        if let Some(word) = self.stop.iter().find(|w| self.text.ends_with(w.as_str())).cloned() {
            self.text.truncate(self.text.len() - word.len());
            return Step::Done(self.result(|r| {
                r.stopped_word = true;
                r.stopping_word = word;
            }));
        }

        let token = next.to_string();
        let probs = if self.n_probs > 0 {
            vec![TokenProb {
                token: token.clone(),
                prob: 1.0,
            }]
        } else {
            Vec::new()
        };
        Step::Token(TokenChunk { token, probs })
    }

    fn interrupt(&self) -> CompletionResult {
        self.result(|r| r.interrupted = true)
    }

    fn result(&self, mark: impl FnOnce(&mut CompletionResult)) -> CompletionResult {
        let elapsed = self.started.elapsed().as_secs_f64() * 1000.0;
        let mut result = CompletionResult {
            text: self.text.clone(),
            tokens_predicted: self.predicted,
            tokens_evaluated: self.prompt_tokens.len(),
            timings: Timings {
                prompt_n: self.prompt_tokens.len(),
                prompt_ms: 0.0,
                predicted_n: self.predicted,
                predicted_ms: elapsed,
            },
            ..Default::default()
        };
        mark(&mut result);
        result
    }

    /// Prompt plus generated tokens, as kept for session save.
    fn history(&self) -> Vec<i32> {
        let mut tokens = self.prompt_tokens.clone();
        tokens.extend(byte_tokens(&self.text));
        tokens
    }
}

enum Work {
    Completion(CompletionRun),
    Embedding { text: String, normalize: i32 },
    Rerank { query: String, documents: Vec<String>, normalize: i32 },
}

struct Job {
    id: RequestId,
    work: Work,
    sink: RequestSink,
}

impl Job {
    /// Advance one tick. Returns true once the terminal callback was sent.
    fn step(&mut self) -> bool {
        match &mut self.work {
            Work::Completion(run) => match run.step() {
                Step::Token(chunk) => {
                    self.sink.token(self.id, chunk);
                    false
                }
                Step::Done(result) => {
                    self.sink.complete(self.id, RequestOutcome::Completed(result));
                    true
                }
            },
            Work::Embedding { text, normalize } => {
                self.sink
                    .embedding(self.id, RequestOutcome::Completed(embed(text, *normalize)));
                true
            }
            Work::Rerank {
                query,
                documents,
                normalize,
            } => {
                let scores = rerank_scores(query, documents, *normalize);
                self.sink.rerank(self.id, RequestOutcome::Completed(scores));
                true
            }
        }
    }

    /// Deliver a terminal callback without a result.
    fn abort(self, reason: Abort) {
        match self.work {
            Work::Completion(_) => self.sink.complete(self.id, reason.outcome()),
            Work::Embedding { .. } => self.sink.embedding(self.id, reason.outcome()),
            Work::Rerank { .. } => self.sink.rerank(self.id, reason.outcome()),
        }
    }
}

enum Abort {
    Cancelled,
    Failed(String),
}

impl Abort {
    fn outcome<T>(&self) -> RequestOutcome<T> {
        match self {
            Abort::Cancelled => RequestOutcome::Cancelled,
            Abort::Failed(reason) => RequestOutcome::Failed(reason.clone()),
        }
    }
}

#[derive(Default)]
struct SchedState {
    /// Slot count while parallel mode is on
    slots: Option<usize>,
    next_id: i32,
    pending: VecDeque<Job>,
    /// Ids handed to the worker and not yet finished
    active: HashSet<RequestId>,
    cancelled: HashSet<RequestId>,
    running: bool,
}

/// Background request processing for one session.
struct Scheduler {
    token_delay: Duration,
    state: Mutex<SchedState>,
    wake: Condvar,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    fn new(token_delay: Duration) -> Self {
        Self {
            token_delay,
            state: Mutex::new(SchedState::default()),
            wake: Condvar::new(),
            worker: Mutex::new(None),
        }
    }

    fn configure(&self, slots: Option<usize>) {
        self.state.lock().slots = slots;
    }

    fn submit(&self, work: Work, sink: RequestSink) -> EngineResult<RequestId> {
        let mut state = self.state.lock();
        if state.slots.is_none() {
            return Err(EngineError::new("Parallel mode is not enabled"));
        }
        state.next_id += 1;
        let id = RequestId(state.next_id);
        state.pending.push_back(Job { id, work, sink });
        self.wake.notify_all();
        trace!(request = %id, pending = state.pending.len(), "request accepted");
        Ok(id)
    }

    fn cancel(&self, request_id: RequestId) {
        let job = {
            let mut state = self.state.lock();
            match state.pending.iter().position(|job| job.id == request_id) {
                Some(index) => state.pending.remove(index),
                None => {
                    if state.active.contains(&request_id) {
                        state.cancelled.insert(request_id);
                    }
                    None
                }
            }
        };
        if let Some(job) = job {
            job.abort(Abort::Cancelled);
        }
    }

    /// Terminate everything still waiting for a slot.
    fn fail_pending(&self, reason: &str) {
        let jobs: Vec<Job> = self.state.lock().pending.drain(..).collect();
        for job in jobs {
            job.abort(Abort::Failed(reason.to_string()));
        }
    }

    fn start(this: &Arc<Self>, handle: EngineHandle) {
        let mut worker = this.worker.lock();
        if worker.is_some() {
            return;
        }
        this.state.lock().running = true;
        let scheduler = Arc::clone(this);
        let spawned = thread::Builder::new()
            .name(format!("loopback-loop-{}", handle.0))
            .spawn(move || scheduler.run());
        match spawned {
            Ok(join) => *worker = Some(join),
            Err(e) => {
                this.state.lock().running = false;
                error!(handle = handle.0, "failed to spawn processing loop: {}", e);
            }
        }
    }

    /// Signal the loop and wait for it to exit. In-flight jobs go back to
    /// the front of the queue.
    fn stop(&self) {
        let Some(join) = self.worker.lock().take() else {
            return;
        };
        self.state.lock().running = false;
        self.wake.notify_all();
        if join.join().is_err() {
            error!("processing loop panicked");
        }
    }

    fn run(&self) {
        let mut active: Vec<Job> = Vec::new();
        loop {
            let (cancelled, stopping) = {
                let mut state = self.state.lock();
                while state.running && !Self::fill(&mut state, &mut active) {
                    self.wake.wait(&mut state);
                }

                let (cancelled, keep): (Vec<Job>, Vec<Job>) = active
                    .drain(..)
                    .partition(|job| state.cancelled.contains(&job.id));
                for job in &cancelled {
                    state.cancelled.remove(&job.id);
                    state.active.remove(&job.id);
                }
                active = keep;

                let stopping = !state.running;
                if stopping {
                    for job in active.drain(..).rev() {
                        state.active.remove(&job.id);
                        job.sink.requeued(job.id);
                        state.pending.push_front(job);
                    }
                }
                (cancelled, stopping)
            };

            for job in cancelled {
                job.abort(Abort::Cancelled);
            }
            if stopping {
                return;
            }

            let mut finished = Vec::new();
            for job in active.iter_mut() {
                if job.step() {
                    finished.push(job.id);
                }
            }
            if !finished.is_empty() {
                active.retain(|job| !finished.contains(&job.id));
                let mut state = self.state.lock();
                for id in &finished {
                    state.active.remove(id);
                    state.cancelled.remove(id);
                }
            }

            if !self.token_delay.is_zero() {
                thread::sleep(self.token_delay);
            }
        }
    }

    /// Top up the active set from the queue. Returns whether there is work.
    fn fill(state: &mut SchedState, active: &mut Vec<Job>) -> bool {
        let slots = state.slots.unwrap_or(1);
        while active.len() < slots {
            let Some(job) = state.pending.pop_front() else {
                break;
            };
            state.active.insert(job.id);
            job.sink.running(job.id);
            active.push(job);
        }
        !active.is_empty()
    }
}

#[derive(Serialize, Deserialize)]
struct SessionBlob {
    tokens: Vec<i32>,
}

fn byte_tokens(text: &str) -> Vec<i32> {
    text.bytes().map(i32::from).collect()
}

fn detokenize_bytes(tokens: &[i32]) -> EngineResult<String> {
    let bytes = tokens
        .iter()
        .map(|&t| u8::try_from(t).map_err(|_| EngineError::new(format!("Invalid token {}", t))))
        .collect::<EngineResult<Vec<u8>>>()?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// Byte histogram; `normalize == 2` scales to unit length.
fn embed(text: &str, normalize: i32) -> Vec<f32> {
    let mut histogram = vec![0f32; EMBEDDING_DIM];
    for byte in text.bytes() {
        histogram[byte as usize % EMBEDDING_DIM] += 1.0;
    }
    if normalize == 2 {
        let norm = histogram.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            histogram.iter_mut().for_each(|v| *v /= norm);
        }
    }
    histogram
}

/// Share of query terms found in each document. With `normalize == 0` the
/// raw match count is reported instead.
fn rerank_scores(query: &str, documents: &[String], normalize: i32) -> Vec<RerankScore> {
    let terms: HashSet<String> = query.split_whitespace().map(str::to_lowercase).collect();
    documents
        .iter()
        .enumerate()
        .map(|(index, doc)| {
            let words: HashSet<String> = doc.split_whitespace().map(str::to_lowercase).collect();
            let hits = terms.intersection(&words).count() as f32;
            let score = if normalize == 0 || terms.is_empty() {
                hits
            } else {
                hits / terms.len() as f32
            };
            RerankScore { index, score }
        })
        .collect()
}

fn parse_messages(messages: &str) -> EngineResult<Vec<(String, String)>> {
    let value: Value = serde_json::from_str(messages)
        .map_err(|e| EngineError::new(format!("Invalid messages: {}", e)))?;
    let list = value
        .as_array()
        .ok_or_else(|| EngineError::new("Messages must be an array"))?;
    Ok(list
        .iter()
        .map(|msg| {
            let field = |name: &str| msg.get(name).and_then(Value::as_str).unwrap_or("").to_string();
            (field("role"), field("content"))
        })
        .collect())
}

/// GGUF preamble: magic, version, tensor count, metadata kv count.
fn read_gguf_header(path: &Path) -> EngineResult<Metadata> {
    let mut header = [0u8; 24];
    fs::File::open(path)
        .and_then(|mut file| file.read_exact(&mut header))
        .map_err(|e| EngineError::new(format!("Failed to read GGUF header: {}", e)))?;
    if header[..4] != GGUF_MAGIC {
        return Err(EngineError::new("Invalid GGUF magic"));
    }
    let u32_at = |at: usize| u32::from_le_bytes([header[at], header[at + 1], header[at + 2], header[at + 3]]);
    let u64_at = |at: usize| u64::from(u32_at(at)) | (u64::from(u32_at(at + 4)) << 32);

    let mut info = Metadata::new();
    info.insert("version".into(), json!(u32_at(4)));
    info.insert("tensor_count".into(), json!(u64_at(8)));
    info.insert("kv_count".into(), json!(u64_at(16)));
    if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
        info.insert("general.name".into(), json!(stem));
    }
    Ok(info)
}

fn rate(tokens: usize, started: Instant) -> f64 {
    let secs = started.elapsed().as_secs_f64().max(1e-9);
    tokens as f64 / secs
}

fn mean_std(values: &[f64]) -> (f64, f64) {
    if values.is_empty() {
        return (0.0, 0.0);
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    (mean, var.sqrt())
}
