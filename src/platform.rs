//! CPU architecture detection and native library selection.
//!
//! Detection runs once per process through [`Platform::current`]; pools are
//! handed the result explicitly and never consult global state themselves.

use serde::Serialize;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use tracing::{debug, warn};

use crate::error::{Error, Result};

const CPUINFO_PATH: &str = "/proc/cpuinfo";

/// Four magic bytes at the start of every GGUF file
pub const GGUF_MAGIC: [u8; 4] = *b"GGUF";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Arch {
    Arm64,
    X86_64,
    Other,
}

impl Arch {
    pub fn from_target(arch: &str) -> Self {
        match arch {
            "aarch64" | "arm64" | "arm64-v8a" => Arch::Arm64,
            "x86_64" => Arch::X86_64,
            _ => Arch::Other,
        }
    }
}

/// CPU feature flags relevant to library selection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CpuFeatures {
    pub raw: String,
    pub fp16: bool,
    pub dotprod: bool,
    pub i8mm: bool,
    /// Adreno / Qualcomm GPU present (OpenCL build)
    pub adreno: bool,
}

impl CpuFeatures {
    /// Parse the `Features` line of `/proc/cpuinfo` plus a hardware string.
    pub fn parse(features_line: &str, hardware: &str) -> Self {
        let flags: Vec<&str> = features_line
            .split_once(':')
            .map_or(features_line, |(_, rest)| rest)
            .split_whitespace()
            .collect();
        let has = |name: &str| flags.iter().any(|f| *f == name);
        let hardware = hardware.to_lowercase();
        Self {
            raw: features_line.trim().to_string(),
            fp16: has("fp16") || has("fphp"),
            dotprod: has("dotprod") || has("asimddp"),
            i8mm: has("i8mm"),
            adreno: ["adreno", "qcom", "qualcomm"]
                .iter()
                .any(|needle| hardware.contains(needle)),
        }
    }

    fn read() -> Self {
        match fs::read_to_string(CPUINFO_PATH) {
            Ok(cpuinfo) => {
                let features = cpuinfo
                    .lines()
                    .find(|line| line.starts_with("Features"))
                    .unwrap_or("");
                let hardware = cpuinfo
                    .lines()
                    .filter(|line| line.starts_with("Hardware") || line.starts_with("model name"))
                    .collect::<Vec<_>>()
                    .join(" ");
                Self::parse(features, &hardware)
            }
            Err(e) => {
                warn!("Couldn't read {}: {}", CPUINFO_PATH, e);
                Self::default()
            }
        }
    }
}

/// Native library build variants, most specific first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum NativeLibrary {
    V8_2DotprodI8mmOpencl,
    V8_2DotprodI8mm,
    V8_2Dotprod,
    V8_2I8mm,
    V8_2,
    V8,
    X86_64,
}

impl NativeLibrary {
    /// Pick the best build for the architecture, or `None` when unsupported.
    pub fn select(arch: Arch, cpu: &CpuFeatures) -> Option<Self> {
        match arch {
            Arch::Arm64 if cpu.dotprod && cpu.i8mm && cpu.adreno => {
                Some(NativeLibrary::V8_2DotprodI8mmOpencl)
            }
            Arch::Arm64 if cpu.dotprod && cpu.i8mm => Some(NativeLibrary::V8_2DotprodI8mm),
            Arch::Arm64 if cpu.dotprod => Some(NativeLibrary::V8_2Dotprod),
            Arch::Arm64 if cpu.i8mm => Some(NativeLibrary::V8_2I8mm),
            Arch::Arm64 if cpu.fp16 => Some(NativeLibrary::V8_2),
            Arch::Arm64 => Some(NativeLibrary::V8),
            Arch::X86_64 => Some(NativeLibrary::X86_64),
            Arch::Other => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            NativeLibrary::V8_2DotprodI8mmOpencl => "llama_jni_v8_2_dotprod_i8mm_opencl",
            NativeLibrary::V8_2DotprodI8mm => "llama_jni_v8_2_dotprod_i8mm",
            NativeLibrary::V8_2Dotprod => "llama_jni_v8_2_dotprod",
            NativeLibrary::V8_2I8mm => "llama_jni_v8_2_i8mm",
            NativeLibrary::V8_2 => "llama_jni_v8_2",
            NativeLibrary::V8 => "llama_jni_v8",
            NativeLibrary::X86_64 => "llama_jni_x86_64",
        }
    }
}

impl fmt::Display for NativeLibrary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Resolved process platform.
#[derive(Debug, Clone, Serialize)]
pub struct Platform {
    pub arch: Arch,
    pub cpu_features: CpuFeatures,
    pub library: Option<NativeLibrary>,
}

static CURRENT: OnceLock<Arc<Platform>> = OnceLock::new();

impl Platform {
    pub fn new(arch: Arch, cpu_features: CpuFeatures) -> Self {
        let library = NativeLibrary::select(arch, &cpu_features);
        Self {
            arch,
            cpu_features,
            library,
        }
    }

    /// Probe the running machine. Prefer [`Platform::current`].
    pub fn detect() -> Self {
        let platform = Self::new(
            Arch::from_target(std::env::consts::ARCH),
            CpuFeatures::read(),
        );
        debug!(
            arch = ?platform.arch,
            library = ?platform.library,
            "platform detected"
        );
        platform
    }

    /// Detected platform; detection runs at most once per process.
    pub fn current() -> Arc<Platform> {
        CURRENT.get_or_init(|| Arc::new(Self::detect())).clone()
    }

    pub fn is_supported(&self) -> bool {
        self.library.is_some()
    }

    pub fn ensure_supported(&self) -> Result<()> {
        if self.is_supported() {
            Ok(())
        } else {
            Err(Error::UnsupportedPlatform(
                "Only 64-bit architectures are supported".to_string(),
            ))
        }
    }

    pub fn library_name(&self) -> &'static str {
        self.library.map_or("", |lib| lib.name())
    }
}

/// Turn a caller-supplied path into a filesystem path. `file://` URIs are
/// accepted; the path itself must be non-empty.
pub fn resolve_path(raw: &str) -> Result<PathBuf> {
    let trimmed = raw.strip_prefix("file://").unwrap_or(raw);
    if trimmed.is_empty() {
        return Err(Error::invalid("Model path cannot be empty"));
    }
    Ok(PathBuf::from(trimmed))
}

/// Whether the file starts with the GGUF signature. Unreadable or short
/// files are not GGUF.
pub fn is_gguf(path: &Path) -> bool {
    use std::io::Read;

    let mut header = [0u8; 4];
    match fs::File::open(path).and_then(|mut file| file.read_exact(&mut header)) {
        Ok(()) => header == GGUF_MAGIC,
        Err(e) => {
            debug!("GGUF check failed for {}: {}", path.display(), e);
            false
        }
    }
}
