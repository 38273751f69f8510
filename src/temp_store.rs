use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use tempfile::TempDir;
use tracing::{debug, warn};

/// Thread-safe, clone-friendly registry of temporary files written by one pipeline scope.
///
/// Every file lives inside a private temp directory, so names only have to be unique
/// within the store. Dropping the last clone removes the directory and everything in it.
#[derive(Debug, Clone)]
pub struct TempStore {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Debug)]
struct Inner {
    dir: Option<TempDir>,
    files: BTreeMap<String, PathBuf>,
}

impl TempStore {
    pub fn new() -> Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix("genpbr_")
            .tempdir()
            .context("failed to create temp directory")?;
        debug!(dir = %dir.path().display(), "created temp store");
        Ok(Self {
            inner: Arc::new(Mutex::new(Inner {
                dir: Some(dir),
                files: BTreeMap::new(),
            })),
        })
    }

    /// Write `bytes` under `file_name`, replacing an earlier file of the same name.
    pub fn write(&self, file_name: &str, bytes: &[u8]) -> Result<PathBuf> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| anyhow::anyhow!("temp store lock poisoned"))?;
        let dir = match inner.dir.as_ref() {
            Some(d) => d.path().to_path_buf(),
            None => {
                let d = tempfile::Builder::new()
                    .prefix("genpbr_")
                    .tempdir()
                    .context("failed to create temp directory")?;
                let path = d.path().to_path_buf();
                inner.dir = Some(d);
                path
            }
        };
        let path = dir.join(file_name);
        std::fs::write(&path, bytes)
            .with_context(|| format!("failed to write temp file {}", path.display()))?;
        inner.files.insert(file_name.to_string(), path.clone());
        Ok(path)
    }

    pub fn get(&self, file_name: &str) -> Option<PathBuf> {
        self.inner.lock().ok()?.files.get(file_name).cloned()
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.inner
            .lock()
            .ok()
            .is_some_and(|inner| inner.files.values().any(|p| p == path))
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|inner| inner.files.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Delete every tracked file and the directory; the store stays usable afterwards.
    pub fn cleanup(&self) {
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        let count = inner.files.len();
        inner.files.clear();
        if let Some(dir) = inner.dir.take() {
            let path = dir.path().to_path_buf();
            if let Err(e) = dir.close() {
                warn!(dir = %path.display(), error = %e, "failed to remove temp directory");
            } else {
                debug!(dir = %path.display(), files = count, "removed temp files");
            }
        }
    }
}

/// Reduce an identifier to characters that are safe in a file name.
pub fn sanitize_file_stem(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for ch in s.chars() {
        if ch.is_ascii_alphanumeric() || ch == '_' || ch == '-' || ch == '.' {
            out.push(ch);
        } else {
            out.push('_');
        }
    }
    let out = out.trim_matches('.').to_string();
    if out.is_empty() { "_".to_string() } else { out }
}

/// Stable file stem for an identifier: sanitized text plus a SHA-256 prefix of the raw id,
/// so two ids that sanitize identically still get distinct names.
pub fn unique_file_stem(prefix: &str, id: &str) -> String {
    let digest = Sha256::digest(id.as_bytes());
    format!(
        "{prefix}_{}_{}",
        sanitize_file_stem(id),
        hex::encode(&digest[..4])
    )
}
