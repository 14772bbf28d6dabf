// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! meshbus - a filesystem message bus for AI coding-agent sessions.
//!
//! Agents exchange addressed Markdown files through a shared directory
//! tree; the bus moves them through per-destination queue tiers and pastes
//! them into each agent's terminal session one at a time.
//!
//! # Architecture
//!
//! - [`message`] - Message codec, addresses and the filename grammar
//! - [`paths`] - Directory layout shared by every component
//! - [`state`] - Lock-protected per-owner state records
//! - [`events`] - In-process event dispatcher
//! - [`watch`] - Filesystem watching and self-write suppression
//! - [`router`] - Queue-tier state machine, routing and workflows
//! - [`consumer`] - Offset-tracked consumers of the shared log
//! - [`delivery`] - Session host contract, tmux backend, paced injection
//! - [`evidence`] - Append-only anomaly log
//! - [`bus`] - Context object and start/stop lifecycle
//! - [`config`] - Configuration loading and merging
//! - [`telemetry`] - Tracing subscriber setup
//! - [`error`] - Error types and result aliases
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use meshbus::{Bus, BusConfig, TmuxHost};
//!
//! let config = BusConfig::with_root(".meshbus");
//! let host = Arc::new(TmuxHost::new("tmux", config.delivery.settle_delay()));
//! let mut bus = Bus::new(config, host)?;
//! bus.start().await?;
//! ```

pub mod bus;
pub mod config;
pub mod consumer;
pub mod delivery;
pub mod error;
pub mod events;
pub mod evidence;
pub mod message;
pub mod paths;
pub mod router;
pub mod state;
pub mod telemetry;
pub mod watch;

// Re-export commonly used types at crate root
pub use bus::{Bus, BusContext};
pub use config::{BusConfig, DomainConfig};
pub use delivery::{SessionHost, TmuxHost};
pub use error::{BusError, CodecError, ConfigError, Result, SessionError};
pub use evidence::{EvidenceKind, EvidenceRecorder};
pub use message::{Address, Message, MessageType};
pub use paths::{BusPaths, Tier, TierOwner};
pub use router::Router;

/// meshbus version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
