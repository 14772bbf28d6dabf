// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Subscriber setup for the bus's `tracing` output.
//!
//! Library code only emits events and spans; the binary (or a test) decides
//! where they go:
//!
//! ```rust,ignore
//! use meshbus::telemetry::{init_telemetry, TelemetryConfig};
//!
//! let _guard = init_telemetry(&TelemetryConfig::default())?;
//! ```
//!
//! Public async entry points carry `#[instrument]` with the owner, file or
//! session as fields; message bodies are never recorded.

mod init;

pub use init::{init_telemetry, LogFormat, TelemetryConfig, TelemetryGuard};
