// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Atomic per-owner state.

mod lock;
mod store;

pub use lock::StateLock;
pub use store::{
    OwnerState, StatePatch, StateStore, WorkflowRecord, STATUS_IDLE, STATUS_PROCESSING,
};
