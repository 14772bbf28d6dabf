// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Cross-process lock file.
//!
//! The lock is a file created exclusively next to the state record. It is
//! the only mutual-exclusion primitive shared with other processes touching
//! the same bus root.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::error::{BusError, Result};

/// First retry delay; doubles up to [`MAX_BACKOFF`].
const INITIAL_BACKOFF: Duration = Duration::from_millis(10);
const MAX_BACKOFF: Duration = Duration::from_millis(200);

/// A held lock. Released (the file removed) on drop.
#[derive(Debug)]
pub struct StateLock {
    path: PathBuf,
}

impl StateLock {
    /// Acquire the lock at `path`, retrying with backoff until `timeout`.
    ///
    /// A lock file older than `stale_after` is assumed to belong to a dead
    /// process and is removed.
    pub async fn acquire(path: &Path, timeout: Duration, stale_after: Duration) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let started = Instant::now();
        let mut backoff = INITIAL_BACKOFF;
        loop {
            match OpenOptions::new()
                .create_new(true)
                .write(true)
                .open(path)
                .await
            {
                Ok(mut file) => {
                    let stamp = format!("pid={}\n", std::process::id());
                    if let Err(e) = file.write_all(stamp.as_bytes()).await {
                        let _ = fs::remove_file(path).await;
                        return Err(e.into());
                    }
                    debug!(path = %path.display(), "Lock acquired");
                    return Ok(Self {
                        path: path.to_path_buf(),
                    });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if is_stale(path, stale_after).await {
                        warn!(path = %path.display(), "Removing stale lock");
                        let _ = fs::remove_file(path).await;
                        continue;
                    }
                    let waited = started.elapsed();
                    if waited >= timeout {
                        return Err(BusError::LockTimeout {
                            path: path.to_path_buf(),
                            waited_ms: waited.as_millis() as u64,
                        });
                    }
                    sleep(backoff.min(timeout - waited)).await;
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for StateLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), "Failed to release lock: {}", e);
            }
        }
    }
}

async fn is_stale(path: &Path, stale_after: Duration) -> bool {
    let modified = match fs::metadata(path).await.and_then(|m| m.modified()) {
        Ok(modified) => modified,
        Err(_) => return false,
    };
    SystemTime::now()
        .duration_since(modified)
        .map(|age| age > stale_after)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const LONG: Duration = Duration::from_secs(60);

    #[tokio::test]
    async fn test_acquire_and_release() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("state.lock");

        let lock = StateLock::acquire(&path, Duration::from_millis(100), LONG)
            .await
            .unwrap();
        assert!(path.exists());
        drop(lock);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_contended_lock_times_out() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("state.lock");

        let _held = StateLock::acquire(&path, Duration::from_millis(100), LONG)
            .await
            .unwrap();
        let err = StateLock::acquire(&path, Duration::from_millis(50), LONG)
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::LockTimeout { .. }));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_waiter_gets_lock_after_release() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("state.lock");

        let held = StateLock::acquire(&path, Duration::from_millis(100), LONG)
            .await
            .unwrap();
        let waiter_path = path.clone();
        let waiter = tokio::spawn(async move {
            StateLock::acquire(&waiter_path, Duration::from_secs(2), LONG).await
        });
        sleep(Duration::from_millis(30)).await;
        drop(held);
        assert!(waiter.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_stale_lock_is_broken() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("state.lock");
        std::fs::write(&path, "pid=0\n").unwrap();
        sleep(Duration::from_millis(20)).await;

        let lock = StateLock::acquire(&path, Duration::from_millis(100), Duration::from_millis(1)).await;
        assert!(lock.is_ok());
    }
}
