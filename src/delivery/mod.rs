// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Delivery into agent sessions.
//!
//! The [`SessionHost`] trait is the whole contract with the environment
//! running the sessions; [`TmuxHost`] implements it over tmux. The
//! [`DeliverySerializer`] paces injections one at a time per session.

mod host;
mod idle;
mod serializer;
pub mod testing;
mod tmux;

pub use host::{Readiness, ReadinessGate, SessionHost};
pub use idle::{wait_for_idle, IdleOutcome};
pub use serializer::{DeliveryItem, DeliverySerializer, QueueStatus};
pub use tmux::{file_reference, TmuxHost};

#[cfg(test)]
pub use host::MockSessionHost;

#[cfg(test)]
mod tests {
    use super::testing::FakeHost;
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_readiness_gates() {
        let host = FakeHost::new();
        let missing = host.readiness_check("s", Duration::from_millis(50)).await;
        assert_eq!(missing.gate, ReadinessGate::Missing);
        assert!(!missing.ready);

        host.add_session("s");
        let ready = host.readiness_check("s", Duration::from_millis(100)).await;
        assert_eq!(ready.gate, ReadinessGate::Ready);
        assert!(ready.ready);

        host.set_busy_for("s", 10_000);
        let busy = host.readiness_check("s", Duration::from_millis(40)).await;
        assert_eq!(busy.gate, ReadinessGate::Busy);
    }

    #[tokio::test]
    async fn test_mock_host_wait_for_idle_expectation() {
        let mut host = MockSessionHost::new();
        host.expect_wait_for_idle().times(1).returning(|_, _, _, _| true);
        assert!(
            host.wait_for_idle("s", Duration::ZERO, Duration::ZERO, Duration::ZERO)
                .await
        );
    }
}
