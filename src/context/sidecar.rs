//! Optional sub-resources layered on a context handle (multimodal projector,
//! vocoder). Each one is initialised, queried and released independently.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{Error, Result};
use crate::platform::resolve_path;

pub struct SubResource {
    name: &'static str,
    enabled: AtomicBool,
}

impl SubResource {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            enabled: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn require_enabled(&self) -> Result<()> {
        if self.is_enabled() {
            Ok(())
        } else {
            Err(Error::NotEnabled(self.name))
        }
    }

    pub(crate) fn enable(&self) {
        self.enabled.store(true, Ordering::Release);
    }

    /// Clear the flag, returning whether it was set.
    pub(crate) fn take(&self) -> bool {
        self.enabled.swap(false, Ordering::AcqRel)
    }

    /// Resolve the file backing this sub-resource; it must exist.
    pub fn resolve_file(&self, raw: &str) -> Result<PathBuf> {
        if raw.is_empty() {
            return Err(Error::InvalidArgument(format!("{} path is empty", self.name)));
        }
        let path = resolve_path(raw)?;
        if !path.exists() {
            return Err(Error::InvalidArgument(format!(
                "{} file does not exist: {}",
                self.name,
                path.display()
            )));
        }
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_lifecycle() {
        let res = SubResource::new("Vocoder");
        assert!(matches!(res.require_enabled(), Err(Error::NotEnabled("Vocoder"))));
        res.enable();
        assert!(res.require_enabled().is_ok());
        assert!(res.take());
        assert!(!res.take());
        assert!(!res.is_enabled());
    }

    #[test]
    fn test_resolve_file() {
        let res = SubResource::new("Multimodal");
        assert!(matches!(res.resolve_file(""), Err(Error::InvalidArgument(_))));
        assert!(matches!(
            res.resolve_file("/definitely/not/here.gguf"),
            Err(Error::InvalidArgument(_))
        ));
        let file = tempfile::NamedTempFile::new().unwrap();
        assert_eq!(res.resolve_file(file.path().to_str().unwrap()).unwrap(), file.path());
    }
}
