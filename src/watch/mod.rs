// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Filesystem watch layer.
//!
//! [`FsWatcher`] receives raw notify events, [`WatchLayer`] filters them
//! (terminal files, the bus's own moves via [`IgnoreSet`]) and publishes a
//! routed event for each genuine arrival.

mod ignore;
mod layer;
mod watcher;

pub use ignore::IgnoreSet;
pub use layer::{WatchLayer, WatchOutcome};
pub use watcher::FsWatcher;
