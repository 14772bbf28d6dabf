// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Recursive filesystem watcher feeding the [`WatchLayer`].

use std::path::{Path, PathBuf};
use std::sync::Arc;

use notify::event::{CreateKind, ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::layer::WatchLayer;
use crate::error::Result;

/// A running watcher. Dropping it stops the notify backend; `stop` also
/// ends the forwarding task.
pub struct FsWatcher {
    watcher: Option<RecommendedWatcher>,
    task: JoinHandle<()>,
    root: PathBuf,
}

impl FsWatcher {
    /// Watch `root` recursively and hand every created file to `layer`.
    ///
    /// Events are forwarded to a single task, so the layer sees them one at
    /// a time in arrival order.
    pub fn start(root: &Path, layer: Arc<WatchLayer>) -> Result<Self> {
        let (tx, mut rx) = mpsc::unbounded_channel::<PathBuf>();

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(mut event) => {
                if !is_arrival(&event.kind) {
                    return;
                }
                // A two-path rename reports [from, to].
                if matches!(event.kind, EventKind::Modify(ModifyKind::Name(RenameMode::Both))) {
                    event.paths = event.paths.split_off(event.paths.len().saturating_sub(1));
                }
                for path in event.paths {
                    let _ = tx.send(path);
                }
            }
            Err(e) => warn!("Watch error: {}", e),
        })?;
        watcher.watch(root, RecursiveMode::Recursive)?;

        let task = tokio::spawn(async move {
            while let Some(path) = rx.recv().await {
                if !path.is_file() {
                    // Already moved on; whoever moved it owns the follow-up.
                    continue;
                }
                let outcome = layer.handle_created(&path).await;
                debug!(path = %path.display(), ?outcome, "Watch event handled");
            }
        });

        info!(root = %root.display(), "Watching bus root");
        Ok(Self {
            watcher: Some(watcher),
            task,
            root: root.to_path_buf(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Stop watching. Events already queued are dropped.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if self.watcher.take().is_some() {
            self.task.abort();
            info!(root = %self.root.display(), "Stopped watching bus root");
        }
    }
}

impl Drop for FsWatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Creation, or a rename whose destination is the reported path.
fn is_arrival(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Create(CreateKind::File | CreateKind::Any)
            | EventKind::Modify(ModifyKind::Name(
                RenameMode::To | RenameMode::Both | RenameMode::Any
            ))
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{DataChange, RemoveKind};

    #[test]
    fn test_arrival_kinds() {
        assert!(is_arrival(&EventKind::Create(CreateKind::File)));
        assert!(is_arrival(&EventKind::Modify(ModifyKind::Name(RenameMode::To))));
        assert!(!is_arrival(&EventKind::Create(CreateKind::Folder)));
        assert!(!is_arrival(&EventKind::Modify(ModifyKind::Name(RenameMode::From))));
        assert!(!is_arrival(&EventKind::Modify(ModifyKind::Data(DataChange::Content))));
        assert!(!is_arrival(&EventKind::Remove(RemoveKind::File)));
    }
}
