// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Self-notification suppression.
//!
//! Before the bus moves or writes a file the watcher will see, it registers
//! the destination path here. The watch layer consumes the entry instead of
//! publishing an event. Entries expire after a short TTL.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tracing::trace;

/// Short-lived set of paths whose next creation event belongs to the bus.
#[derive(Debug)]
pub struct IgnoreSet {
    entries: Mutex<HashMap<PathBuf, Instant>>,
    ttl: Duration,
}

impl IgnoreSet {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<PathBuf, Instant>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a path the bus is about to create.
    pub fn register(&self, path: impl Into<PathBuf>) {
        let path = path.into();
        trace!(path = %path.display(), "Ignoring next event");
        let mut entries = self.lock();
        let now = Instant::now();
        entries.retain(|_, expires| *expires > now);
        entries.insert(path, now + self.ttl);
    }

    /// Remove a matching live entry. Returns whether the event should be suppressed.
    pub fn consume(&self, path: &Path) -> bool {
        match self.lock().remove(path) {
            Some(expires) => expires > Instant::now(),
            None => false,
        }
    }

    /// Forget a registration that will not produce an event (the move failed).
    pub fn forget(&self, path: &Path) {
        self.lock().remove(path);
    }

    /// Number of unexpired entries.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.lock().values().filter(|e| **e > now).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_suppresses_exactly_once() {
        let set = IgnoreSet::new(Duration::from_secs(5));
        let path = Path::new("/bus/domains/d/msgs/next/x.md");
        set.register(path);
        assert!(set.consume(path));
        assert!(!set.consume(path));
        assert!(set.is_empty());
    }

    #[test]
    fn test_entries_expire() {
        let set = IgnoreSet::new(Duration::from_millis(10));
        let path = Path::new("/bus/log/x.md");
        set.register(path);
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(set.len(), 0);
        assert!(!set.consume(path));
    }

    #[test]
    fn test_unregistered_path_passes() {
        let set = IgnoreSet::new(Duration::from_secs(5));
        set.register("/a.md");
        assert!(!set.consume(Path::new("/b.md")));
        set.forget(Path::new("/a.md"));
        assert!(set.is_empty());
    }
}
