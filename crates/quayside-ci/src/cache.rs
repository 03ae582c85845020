//! Dependency cache keyed by lockfile contents and runtime pins.
//!
//! Each key owns a directory holding copies of the configured workspace
//! paths (`deps`, `_build`). A key is warm only when its marker exists and
//! every saved path is still present; a warm hit restores those paths into
//! the workspace before the suite runs.

use std::io;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::error::CiError;

#[derive(Debug, Clone)]
pub struct DependencyCache {
    dir: PathBuf,
    paths: Vec<String>,
}

impl DependencyCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            paths: Vec::new(),
        }
    }

    /// Workspace-relative paths saved under each key.
    pub fn with_paths(mut self, paths: Vec<String>) -> Self {
        self.paths = paths;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Deterministic key over the version pins (in order) and the lockfile.
    pub fn compute_key(lockfile: &[u8], pins: &[(&str, &str)]) -> String {
        let mut hasher = Sha256::new();
        for (name, version) in pins {
            hasher.update(name.as_bytes());
            hasher.update(b"=");
            hasher.update(version.as_bytes());
            hasher.update(b"\0");
        }
        hasher.update(lockfile);
        hex::encode(hasher.finalize())
    }

    /// Key for the lockfile at `path`. A missing lockfile hashes as empty.
    pub async fn key_for(lockfile: &Path, pins: &[(&str, &str)]) -> Result<String, CiError> {
        let contents = match tokio::fs::read(lockfile).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(lockfile = %lockfile.display(), "no lockfile, caching on pins only");
                Vec::new()
            }
            Err(e) => return Err(e.into()),
        };
        Ok(Self::compute_key(&contents, pins))
    }

    fn entry(&self, key: &str) -> PathBuf {
        self.dir.join(key)
    }

    fn marker(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.ok"))
    }

    pub async fn is_warm(&self, key: &str) -> bool {
        if !tokio::fs::try_exists(self.marker(key)).await.unwrap_or(false) {
            return false;
        }
        let entry = self.entry(key);
        for path in &self.paths {
            if !tokio::fs::try_exists(entry.join(path)).await.unwrap_or(false) {
                debug!(key = %key, path = %path, "cached path missing, treating cache as cold");
                return false;
            }
        }
        true
    }

    /// Copy the cached paths for `key` into `workdir`, replacing what is there.
    /// Returns the number of files restored.
    pub async fn restore(&self, key: &str, workdir: &Path) -> Result<u64, CiError> {
        let entry = self.entry(key);
        let paths = self.paths.clone();
        let workdir = workdir.to_path_buf();
        let files = blocking(move || {
            let mut files = 0;
            for path in &paths {
                let target = workdir.join(path);
                remove_path(&target)?;
                files += copy_tree(&entry.join(path), &target)?;
            }
            Ok(files)
        })
        .await?;
        info!(key = %&key[..key.len().min(12)], files, "dependency cache restored");
        Ok(files)
    }

    /// Save the configured paths from `workdir` under `key` and mark it warm.
    /// Paths the install did not produce are left out, which keeps the key
    /// cold for the next run.
    pub async fn save(&self, key: &str, workdir: &Path) -> Result<u64, CiError> {
        let entry = self.entry(key);
        let paths = self.paths.clone();
        let workdir = workdir.to_path_buf();
        let files = blocking(move || {
            remove_path(&entry)?;
            std::fs::create_dir_all(&entry)?;
            let mut files = 0;
            for path in &paths {
                let source = workdir.join(path);
                if source.exists() {
                    files += copy_tree(&source, &entry.join(path))?;
                }
            }
            Ok(files)
        })
        .await?;
        tokio::fs::write(self.marker(key), chrono::Utc::now().to_rfc3339()).await?;
        Ok(files)
    }
}

async fn blocking<T, F>(work: F) -> Result<T, CiError>
where
    F: FnOnce() -> io::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| CiError::Io(io::Error::new(io::ErrorKind::Other, e)))?
        .map_err(CiError::from)
}

fn remove_path(path: &Path) -> io::Result<()> {
    match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => std::fs::remove_dir_all(path),
        Ok(_) => std::fs::remove_file(path),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Recursively copy `src` to `dst`, recreating symlinks as links.
fn copy_tree(src: &Path, dst: &Path) -> io::Result<u64> {
    let mut files = 0;
    for entry in WalkDir::new(src) {
        let entry = entry?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        let target = dst.join(rel);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            std::fs::create_dir_all(&target)?;
            continue;
        }
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if file_type.is_symlink() {
            #[cfg(unix)]
            std::os::unix::fs::symlink(std::fs::read_link(entry.path())?, &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
        files += 1;
    }
    Ok(files)
}
