//! Common test utilities: GGUF fixtures and pools over the loopback engine.
#![allow(dead_code)]

use llamactx_core::{
    engine::loopback::{LoopbackConfig, LoopbackEngine},
    platform::{Arch, CpuFeatures, Platform},
    ContextOptions, ContextPool,
};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// Minimal GGUF preamble: magic, version 3, 1 tensor, 2 kv pairs.
pub fn write_gguf(dir: &Path, name: &str) -> PathBuf {
    let path = dir.join(name);
    let mut file = fs::File::create(&path).expect("create model file");
    file.write_all(b"GGUF").unwrap();
    file.write_all(&3u32.to_le_bytes()).unwrap();
    file.write_all(&1u64.to_le_bytes()).unwrap();
    file.write_all(&2u64.to_le_bytes()).unwrap();
    path
}

pub fn write_file(dir: &Path, name: &str, contents: &[u8]) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, contents).expect("write fixture");
    path
}

pub fn x86_platform() -> Arc<Platform> {
    Arc::new(Platform::new(Arch::X86_64, CpuFeatures::default()))
}

pub struct Fixture {
    pub dir: TempDir,
    pub model: PathBuf,
    pub pool: ContextPool,
}

impl Fixture {
    pub fn new(limit: usize) -> Self {
        Self::with_engine(limit, LoopbackConfig::default())
    }

    /// Engine that pauses between tokens so work stays in flight.
    pub fn slow(limit: usize, delay_ms: u64) -> Self {
        Self::with_engine(
            limit,
            LoopbackConfig {
                token_delay: Duration::from_millis(delay_ms),
                ..Default::default()
            },
        )
    }

    pub fn with_engine(limit: usize, config: LoopbackConfig) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let model = write_gguf(dir.path(), "model.gguf");
        let pool = ContextPool::builder(Arc::new(LoopbackEngine::new(config)))
            .platform(x86_platform())
            .context_limit(limit)
            .build();
        Self { dir, model, pool }
    }

    pub fn options(&self) -> ContextOptions {
        ContextOptions::new(self.model.to_string_lossy())
    }

    pub fn embedding_options(&self) -> ContextOptions {
        let mut options = self.options();
        options.embedding = true;
        options
    }

    pub fn path(&self, name: &str) -> String {
        self.dir.path().join(name).to_string_lossy().into_owned()
    }
}
