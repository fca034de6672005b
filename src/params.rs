//! Typed parameter sets for context creation and every context operation.
//!
//! Defaults are declared once here; call sites never re-derive them.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{Error, Result};

fn default_true() -> bool {
    true
}

fn default_unset() -> i32 {
    -1
}

fn default_scale() -> f32 {
    1.0
}

fn default_batch() -> u32 {
    512
}

fn default_cache_type() -> String {
    "f16".to_string()
}

/// LoRA adapter reference: file path plus scale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoraAdapter {
    pub path: String,
    #[serde(default = "default_scale")]
    pub scaled: f32,
}

impl LoraAdapter {
    pub fn new(path: impl Into<String>, scaled: f32) -> Self {
        Self {
            path: path.into(),
            scaled,
        }
    }
}

/// Options used to construct a context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextOptions {
    /// Model path (required)
    pub model: String,
    #[serde(default)]
    pub chat_template: Option<String>,
    #[serde(default)]
    pub embedding: bool,
    #[serde(default = "default_unset")]
    pub embd_normalize: i32,
    #[serde(default = "default_batch")]
    pub n_ctx: u32,
    #[serde(default = "default_batch")]
    pub n_batch: u32,
    #[serde(default = "default_batch")]
    pub n_ubatch: u32,
    /// 0 lets the engine pick
    #[serde(default)]
    pub n_threads: u32,
    #[serde(default)]
    pub n_parallel: u32,
    #[serde(default)]
    pub n_gpu_layers: i32,
    #[serde(default)]
    pub flash_attn: bool,
    #[serde(default)]
    pub flash_attn_type: String,
    #[serde(default = "default_cache_type")]
    pub cache_type_k: String,
    #[serde(default = "default_cache_type")]
    pub cache_type_v: String,
    #[serde(default = "default_true")]
    pub use_mlock: bool,
    #[serde(default = "default_true")]
    pub use_mmap: bool,
    #[serde(default)]
    pub vocab_only: bool,
    #[serde(default)]
    pub lora: String,
    #[serde(default = "default_scale")]
    pub lora_scaled: f32,
    #[serde(default)]
    pub lora_list: Vec<LoraAdapter>,
    #[serde(default)]
    pub rope_freq_base: f32,
    #[serde(default)]
    pub rope_freq_scale: f32,
    #[serde(default = "default_unset")]
    pub pooling_type: i32,
    #[serde(default = "default_true")]
    pub ctx_shift: bool,
    #[serde(default)]
    pub kv_unified: bool,
    #[serde(default)]
    pub swa_full: bool,
    #[serde(default)]
    pub n_cpu_moe: u32,
    #[serde(default)]
    pub use_progress_callback: bool,
    #[serde(default)]
    pub no_gpu_devices: bool,
}

impl ContextOptions {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            chat_template: None,
            embedding: false,
            embd_normalize: -1,
            n_ctx: default_batch(),
            n_batch: default_batch(),
            n_ubatch: default_batch(),
            n_threads: 0,
            n_parallel: 0,
            n_gpu_layers: 0,
            flash_attn: false,
            flash_attn_type: String::new(),
            cache_type_k: default_cache_type(),
            cache_type_v: default_cache_type(),
            use_mlock: true,
            use_mmap: true,
            vocab_only: false,
            lora: String::new(),
            lora_scaled: 1.0,
            lora_list: Vec::new(),
            rope_freq_base: 0.0,
            rope_freq_scale: 0.0,
            pooling_type: -1,
            ctx_shift: true,
            kv_unified: false,
            swa_full: false,
            n_cpu_moe: 0,
            use_progress_callback: false,
            no_gpu_devices: false,
        }
    }

    /// Parse an untyped option bag.
    pub fn from_json(value: serde_json::Value) -> Result<Self> {
        if value.get("model").and_then(|m| m.as_str()).is_none() {
            return Err(Error::invalid("Missing required parameter: model"));
        }
        Ok(serde_json::from_value(value)?)
    }

    /// Engine init parameters for an already resolved model path. Unset
    /// values are left out so the engine applies its own defaults.
    pub fn init_params(&self, model: PathBuf) -> InitParams {
        let non_empty = |s: &str| (!s.is_empty()).then(|| s.to_string());
        InitParams {
            model,
            chat_template: self.chat_template.as_deref().and_then(non_empty),
            embedding: self.embedding,
            embd_normalize: (self.embd_normalize != -1).then_some(self.embd_normalize),
            n_ctx: self.n_ctx,
            n_batch: self.n_batch,
            n_ubatch: self.n_ubatch,
            n_threads: (self.n_threads > 0).then_some(self.n_threads),
            n_parallel: (self.n_parallel > 0).then_some(self.n_parallel),
            n_gpu_layers: (self.n_gpu_layers >= 0).then_some(self.n_gpu_layers),
            flash_attn: self.flash_attn,
            flash_attn_type: non_empty(&self.flash_attn_type),
            cache_type_k: non_empty(&self.cache_type_k),
            cache_type_v: non_empty(&self.cache_type_v),
            use_mlock: self.use_mlock,
            use_mmap: self.use_mmap,
            vocab_only: self.vocab_only,
            lora: non_empty(&self.lora).map(|path| LoraAdapter::new(path, self.lora_scaled)),
            lora_list: self.lora_list.clone(),
            rope_freq_base: (self.rope_freq_base != 0.0).then_some(self.rope_freq_base),
            rope_freq_scale: (self.rope_freq_scale != 0.0).then_some(self.rope_freq_scale),
            pooling_type: (self.pooling_type != -1).then_some(self.pooling_type),
            ctx_shift: self.ctx_shift,
            kv_unified: self.kv_unified,
            swa_full: self.swa_full,
            n_cpu_moe: (self.n_cpu_moe > 0).then_some(self.n_cpu_moe),
            no_gpu_devices: self.no_gpu_devices,
        }
    }
}

/// Engine-facing init configuration.
#[derive(Debug, Clone, Serialize)]
pub struct InitParams {
    pub model: PathBuf,
    pub chat_template: Option<String>,
    pub embedding: bool,
    pub embd_normalize: Option<i32>,
    pub n_ctx: u32,
    pub n_batch: u32,
    pub n_ubatch: u32,
    pub n_threads: Option<u32>,
    pub n_parallel: Option<u32>,
    pub n_gpu_layers: Option<i32>,
    pub flash_attn: bool,
    pub flash_attn_type: Option<String>,
    pub cache_type_k: Option<String>,
    pub cache_type_v: Option<String>,
    pub use_mlock: bool,
    pub use_mmap: bool,
    pub vocab_only: bool,
    pub lora: Option<LoraAdapter>,
    pub lora_list: Vec<LoraAdapter>,
    pub rope_freq_base: Option<f32>,
    pub rope_freq_scale: Option<f32>,
    pub pooling_type: Option<i32>,
    pub ctx_shift: bool,
    pub kv_unified: bool,
    pub swa_full: bool,
    pub n_cpu_moe: Option<u32>,
    pub no_gpu_devices: bool,
}

fn default_n_predict() -> i32 {
    -1
}

fn default_temperature() -> f32 {
    0.8
}

fn default_top_k() -> i32 {
    40
}

fn default_top_p() -> f32 {
    0.95
}

fn default_min_p() -> f32 {
    0.05
}

/// Text generation parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionParams {
    #[serde(default)]
    pub prompt: Option<String>,
    /// -1 generates until a stop condition
    #[serde(default = "default_n_predict")]
    pub n_predict: i32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_top_k")]
    pub top_k: i32,
    #[serde(default = "default_top_p")]
    pub top_p: f32,
    #[serde(default = "default_min_p")]
    pub min_p: f32,
    #[serde(default = "default_unset")]
    pub seed: i32,
    #[serde(default)]
    pub stop: Vec<String>,
    #[serde(default)]
    pub n_probs: u32,
    #[serde(default)]
    pub grammar: Option<String>,
    #[serde(default)]
    pub json_schema: Option<String>,
    #[serde(default)]
    pub media_paths: Vec<String>,
    #[serde(default)]
    pub ignore_eos: bool,
    /// Engine-specific keys forwarded untouched
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Default for CompletionParams {
    fn default() -> Self {
        Self {
            prompt: None,
            n_predict: default_n_predict(),
            temperature: default_temperature(),
            top_k: default_top_k(),
            top_p: default_top_p(),
            min_p: default_min_p(),
            seed: -1,
            stop: Vec::new(),
            n_probs: 0,
            grammar: None,
            json_schema: None,
            media_paths: Vec::new(),
            ignore_eos: false,
            extra: serde_json::Map::new(),
        }
    }
}

impl CompletionParams {
    pub fn with_prompt(prompt: impl Into<String>) -> Self {
        Self {
            prompt: Some(prompt.into()),
            ..Default::default()
        }
    }

    pub fn n_predict(mut self, n: i32) -> Self {
        self.n_predict = n;
        self
    }

    /// The prompt, which must be present and non-empty.
    pub fn require_prompt(&self) -> Result<&str> {
        match self.prompt.as_deref() {
            Some(p) if !p.is_empty() => Ok(p),
            _ => Err(Error::invalid("Missing required parameter: prompt")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct EmbeddingParams {
    #[serde(default = "default_unset")]
    pub embd_normalize: i32,
}

impl Default for EmbeddingParams {
    fn default() -> Self {
        Self { embd_normalize: -1 }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RerankParams {
    #[serde(default = "default_unset")]
    pub normalize: i32,
}

impl Default for RerankParams {
    fn default() -> Self {
        Self { normalize: -1 }
    }
}

/// Prompt-processing / text-generation benchmark shape.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BenchParams {
    pub pp: u32,
    pub tg: u32,
    pub pl: u32,
    pub nr: u32,
}

impl Default for BenchParams {
    fn default() -> Self {
        Self {
            pp: 512,
            tg: 128,
            pl: 1,
            nr: 3,
        }
    }
}

/// Options for Jinja chat template rendering.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatTemplateOptions {
    #[serde(default)]
    pub chat_template: String,
    #[serde(default)]
    pub json_schema: String,
    #[serde(default)]
    pub tools: String,
    #[serde(default)]
    pub parallel_tool_calls: bool,
    #[serde(default)]
    pub tool_choice: String,
    #[serde(default)]
    pub enable_thinking: bool,
    #[serde(default = "default_true")]
    pub add_generation_prompt: bool,
    #[serde(default)]
    pub now: String,
    #[serde(default)]
    pub chat_template_kwargs: String,
}

impl Default for ChatTemplateOptions {
    fn default() -> Self {
        Self {
            chat_template: String::new(),
            json_schema: String::new(),
            tools: String::new(),
            parallel_tool_calls: false,
            tool_choice: String::new(),
            enable_thinking: false,
            add_generation_prompt: true,
            now: String::new(),
            chat_template_kwargs: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MultimodalParams {
    #[serde(default)]
    pub path: String,
    #[serde(default = "default_true")]
    pub use_gpu: bool,
}

impl MultimodalParams {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            use_gpu: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VocoderParams {
    #[serde(default)]
    pub path: String,
    #[serde(default = "default_batch")]
    pub n_batch: u32,
}

impl VocoderParams {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            n_batch: default_batch(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_context_options_defaults() {
        let opts = ContextOptions::from_json(json!({ "model": "/models/a.gguf" })).unwrap();
        assert_eq!(opts.n_ctx, 512);
        assert_eq!(opts.cache_type_k, "f16");
        assert!(opts.use_mmap);
        assert!(opts.ctx_shift);
        assert_eq!(opts.pooling_type, -1);
    }

    #[test]
    fn test_context_options_missing_model() {
        let err = ContextOptions::from_json(json!({ "n_ctx": 1024 })).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn test_init_params_omit_unset() {
        let mut opts = ContextOptions::new("m.gguf");
        opts.n_threads = 4;
        opts.lora = "adapter.gguf".into();
        opts.lora_scaled = 0.5;
        let init = opts.init_params(PathBuf::from("m.gguf"));
        assert_eq!(init.n_threads, Some(4));
        assert_eq!(init.n_parallel, None);
        assert_eq!(init.n_gpu_layers, Some(0));
        assert_eq!(init.rope_freq_base, None);
        assert_eq!(init.lora, Some(LoraAdapter::new("adapter.gguf", 0.5)));
    }

    #[test]
    fn test_require_prompt() {
        assert!(CompletionParams::default().require_prompt().is_err());
        assert!(CompletionParams::with_prompt("").require_prompt().is_err());
        assert_eq!(CompletionParams::with_prompt("hi").require_prompt().unwrap(), "hi");
    }

    #[test]
    fn test_completion_extra_keys() {
        let params: CompletionParams =
            serde_json::from_value(json!({ "prompt": "x", "mirostat": 2 })).unwrap();
        assert_eq!(params.extra.get("mirostat"), Some(&json!(2)));
        assert_eq!(params.top_k, 40);
    }
}
