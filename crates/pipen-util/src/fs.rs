//! A thin façade over filesystem operations, used by the path plugin (C1)
//! and the job lifecycle so that every filesystem touch point is one place
//! to audit, instead of calling `std`/`tokio::fs` ad hoc throughout.

use anyhow::{Context as _, Result};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Filesystem façade. Cheap to construct; holds no state.
#[derive(Clone, Copy, Default)]
pub struct Fs;

impl Fs {
    pub fn new() -> Self {
        Self
    }

    pub fn exists(&self, path: impl AsRef<Path>) -> bool {
        path.as_ref().exists()
    }

    pub fn is_symlink(&self, path: impl AsRef<Path>) -> bool {
        path.as_ref()
            .symlink_metadata()
            .map(|m| m.is_symlink())
            .unwrap_or(false)
    }

    pub fn expand_home(&self, path: impl AsRef<Path>) -> PathBuf {
        let path = path.as_ref();
        let Ok(rest) = path.strip_prefix("~") else {
            return path.to_owned();
        };
        match std::env::var_os("HOME") {
            Some(home) => PathBuf::from(home).join(rest),
            None => path.to_owned(),
        }
    }

    /// Resolve a path the way the core path plugin does for input paths:
    /// expand a leading `~`, then canonicalize. Canonicalization requires
    /// the path to exist, matching the original's `Path.resolve()` contract.
    pub fn resolve(&self, path: impl AsRef<Path>) -> Result<PathBuf> {
        let expanded = self.expand_home(path);
        std::fs::canonicalize(&expanded)
            .with_context(|| format!("resolving path {}", expanded.display()))
    }

    pub async fn create_dir_all(&self, path: impl AsRef<Path>) -> Result<()> {
        tokio::fs::create_dir_all(&path)
            .await
            .with_context(|| format!("creating directory {}", path.as_ref().display()))
    }

    pub async fn read_to_string(&self, path: impl AsRef<Path>) -> Result<String> {
        tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading {}", path.as_ref().display()))
    }

    /// Write `contents` atomically: write to a sibling temp file, then
    /// rename over the destination. Used for the cache signature file so a
    /// crash mid-write can never leave a half-written signature behind.
    pub async fn write_atomic(&self, path: impl AsRef<Path>, contents: &[u8]) -> Result<()> {
        let path = path.as_ref();
        let tmp = path.with_extension(format!(
            "{}.tmp",
            path.extension().and_then(|e| e.to_str()).unwrap_or("")
        ));
        tokio::fs::write(&tmp, contents)
            .await
            .with_context(|| format!("writing {}", tmp.display()))?;
        tokio::fs::rename(&tmp, path)
            .await
            .with_context(|| format!("renaming {} to {}", tmp.display(), path.display()))
    }

    pub async fn remove_file(&self, path: impl AsRef<Path>) -> Result<()> {
        tokio::fs::remove_file(&path)
            .await
            .with_context(|| format!("removing file {}", path.as_ref().display()))
    }

    pub async fn remove_dir_all(&self, path: impl AsRef<Path>) -> Result<()> {
        tokio::fs::remove_dir_all(&path)
            .await
            .with_context(|| format!("removing directory {}", path.as_ref().display()))
    }

    pub async fn is_empty_dir(&self, path: impl AsRef<Path>) -> Result<bool> {
        let mut entries = tokio::fs::read_dir(&path)
            .await
            .with_context(|| format!("reading directory {}", path.as_ref().display()))?;
        Ok(entries.next_entry().await?.is_none())
    }

    /// mtime of a single file or directory (non-recursive).
    pub fn mtime(&self, path: impl AsRef<Path>) -> Result<SystemTime> {
        let path = path.as_ref();
        std::fs::metadata(path)
            .with_context(|| format!("stat {}", path.display()))?
            .modified()
            .with_context(|| format!("reading mtime of {}", path.display()))
    }

    /// mtime of a directory tree, recursing at most `dirsig` levels deep and
    /// taking the maximum mtime seen (so any change anywhere under the
    /// directory, up to that depth, is reflected). `dirsig == 0` is
    /// equivalent to a plain, non-recursive [`Self::mtime`].
    ///
    /// This walks the filesystem synchronously (`walkdir` has no async
    /// variant); callers on a cooperative runtime should run it inside
    /// `tokio::task::spawn_blocking`.
    pub fn mtime_recursive(&self, path: impl AsRef<Path>, dirsig: usize) -> Result<SystemTime> {
        let path = path.as_ref();
        let meta = std::fs::metadata(path).with_context(|| format!("stat {}", path.display()))?;
        if !meta.is_dir() || dirsig == 0 {
            return meta.modified().context("reading mtime");
        }

        let mut newest = meta.modified().context("reading mtime")?;
        for entry in walkdir::WalkDir::new(path)
            .min_depth(1)
            .max_depth(dirsig)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            if let Ok(mtime) = entry.metadata().and_then(|m| m.modified()) {
                if mtime > newest {
                    newest = mtime;
                }
            }
        }
        Ok(newest)
    }
}
