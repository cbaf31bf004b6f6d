//! The seam between the build graph and whatever transport actually moves
//! bytes. Network code lives behind [`Fetcher`]; this module only adds the
//! policy every download must follow: the offline check, atomic placement of
//! the finished file, and one writer per target path.

use std::collections::HashMap;
use std::fs;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::Context;
use camino::{Utf8Path, Utf8PathBuf};

use crate::artifact::Artifact;
use crate::mode::ExecutionMode;
use crate::utils::ensure_parent;

/// Transfers the resource at `url` into the file at `target`.
pub trait Fetcher: Send + Sync {
    fn fetch(&self, url: &str, target: &Utf8Path) -> anyhow::Result<()>;
}

/// Serves `file://` URLs and plain filesystem paths by copying. Useful for
/// local mirrors.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileFetcher;

impl Fetcher for FileFetcher {
    fn fetch(&self, url: &str, target: &Utf8Path) -> anyhow::Result<()> {
        let source = match url.strip_prefix("file://") {
            Some(path) => path,
            None if !url.contains("://") => url,
            None => anyhow::bail!("unsupported URL scheme: {url}"),
        };

        fs::copy(source, target).with_context(|| format!("couldn't copy {source}"))?;
        Ok(())
    }
}

type PathLock = Arc<Mutex<()>>;

pub struct Downloader {
    fetcher: Arc<dyn Fetcher>,
    locks: Mutex<HashMap<Utf8PathBuf, PathLock>>,
}

impl Downloader {
    pub fn new(fetcher: Arc<dyn Fetcher>) -> Self {
        Self {
            fetcher,
            locks: Mutex::default(),
        }
    }

    /// Runs `f` while holding the lock of `target`. Entries for targets that
    /// nobody else is waiting on are dropped afterwards, so the map only ever
    /// holds the paths that are in use.
    fn with_lock<R>(&self, target: &Utf8Path, f: impl FnOnce() -> R) -> R {
        let lock = self
            .locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(target.to_path_buf())
            .or_default()
            .clone();

        let result = {
            let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
            f()
        };

        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        // one reference in the map, one here
        if Arc::strong_count(&lock) == 2 {
            locks.remove(target);
        }

        result
    }

    /// Downloads `url` to `target`, replacing whatever is there. Concurrent
    /// downloads to the same target are serialized.
    pub fn download(&self, mode: &ExecutionMode, url: &str, target: &Utf8Path) -> anyhow::Result<()> {
        self.with_lock(target, || self.download_locked(mode, url, target))
    }

    fn download_locked(
        &self,
        mode: &ExecutionMode,
        url: &str,
        target: &Utf8Path,
    ) -> anyhow::Result<()> {
        mode.assert_online(format!("download {url}"))?;

        tracing::info!("downloading {url}");
        place(target, |part| {
            self.fetcher
                .fetch(url, part)
                .with_context(|| format!("couldn't download {url}"))
        })
    }

    /// Produces `target` with `write` unless it already exists. `write` fills
    /// a temporary sibling that is renamed into place once complete, and
    /// concurrent callers for the same target are serialized with downloads.
    pub fn ensure(
        &self,
        target: &Utf8Path,
        write: impl FnOnce(&Utf8Path) -> anyhow::Result<()>,
    ) -> anyhow::Result<()> {
        self.with_lock(target, || {
            if target.exists() {
                return Ok(());
            }
            place(target, write)
        })
    }

    /// Resolves an artifact into `<cache>/libraries/<maven path>`, downloading
    /// it from `repo` only if it is not already present.
    pub fn artifact(
        &self,
        mode: &ExecutionMode,
        repo: &str,
        artifact: &Artifact,
        cache: &Utf8Path,
    ) -> anyhow::Result<Utf8PathBuf> {
        let target = cache.join("libraries").join(artifact.path());

        self.with_lock(&target, || {
            if !target.exists() {
                self.download_locked(mode, &artifact.url(repo), &target)
                    .with_context(|| format!("couldn't resolve {artifact}"))?;
            }
            anyhow::Ok(())
        })?;

        Ok(target)
    }
}

/// Writes `target` through a temporary sibling. The sibling is named after
/// this process, so separate processes sharing a cache never write the same
/// file.
fn place(target: &Utf8Path, write: impl FnOnce(&Utf8Path) -> anyhow::Result<()>) -> anyhow::Result<()> {
    ensure_parent(target)?;

    let name = target.file_name().unwrap_or("download");
    let part = target.with_file_name(format!("{name}.{}.part", std::process::id()));

    if let Err(err) = write(&part) {
        let _ = fs::remove_file(&part);
        return Err(err);
    }

    fs::rename(&part, target).with_context(|| format!("couldn't move {part} to {target}"))?;
    Ok(())
}

impl std::fmt::Debug for Downloader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Downloader(*)")
    }
}
