// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Event dispatch.
//!
//! Decouples "a file appeared" from "do something about it": the watch
//! layer publishes, the router and the consumers subscribe.

mod dispatcher;
mod types;

pub use dispatcher::{
    handler_error, wildcard_matches, BoxFuture, EventDispatcher, SubscribeOptions,
    SubscriptionId, DEFAULT_HISTORY,
};
pub use types::{topics, ArrivedMessage, BusEvent, EventPayload, RoutingHint};
