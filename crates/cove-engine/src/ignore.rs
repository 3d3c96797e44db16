//! Ignore filter — decides whether a relative path is excluded from
//! synchronization.
//!
//! Patterns come from folder configuration and are compiled into a single
//! GlobSet. The folder's own system directory is always excluded. Pattern
//! updates swap the compiled set atomically; concurrent readers see either
//! the old set or the new one, never a torn state.

use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use globset::{Glob, GlobSet, GlobSetBuilder};
use thiserror::Error;

pub struct IgnoreFilter {
    set: RwLock<Arc<GlobSet>>,
    /// Relative prefix of the system directory when it lives inside the
    /// synchronized root; None when system_path is elsewhere.
    system_prefix: Option<PathBuf>,
}

impl IgnoreFilter {
    pub fn new(
        patterns: &[String],
        folder_path: &Path,
        system_path: &Path,
    ) -> Result<Self, IgnoreError> {
        let system_prefix = system_path
            .strip_prefix(folder_path)
            .ok()
            .map(Path::to_path_buf);
        Ok(Self {
            set: RwLock::new(Arc::new(compile(patterns)?)),
            system_prefix,
        })
    }

    /// Replace the pattern set. In-flight queries keep the set they
    /// already grabbed.
    pub fn set_patterns(&self, patterns: &[String]) -> Result<(), IgnoreError> {
        let compiled = Arc::new(compile(patterns)?);
        *self.set.write().unwrap_or_else(|e| e.into_inner()) = compiled;
        Ok(())
    }

    pub fn is_ignored(&self, rel_path: &str) -> bool {
        if let Some(prefix) = &self.system_prefix {
            if Path::new(rel_path).starts_with(prefix) {
                return true;
            }
        }
        let set = self
            .set
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        set.is_match(rel_path)
    }
}

fn compile(patterns: &[String]) -> Result<GlobSet, IgnoreError> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern).map_err(|e| IgnoreError::BadPattern(pattern.clone(), e))?);
    }
    builder.build().map_err(IgnoreError::Build)
}

#[derive(Debug, Error)]
pub enum IgnoreError {
    #[error("bad ignore pattern `{0}`: {1}")]
    BadPattern(String, globset::Error),

    #[error("failed to build ignore matcher: {0}")]
    Build(globset::Error),
}
