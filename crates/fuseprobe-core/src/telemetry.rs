// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Telemetry collaborator interface.
//!
//! The channel reports to a [`StatsSink`] chosen at construction. All
//! methods default to no-ops so collaborators implement only what they
//! observe; [`NullStatsSink`] is the canonical no-op selection.

use std::time::Duration;

#[cfg_attr(test, mockall::automock)]
pub trait StatsSink: Send + Sync {
    /// A request finished (successfully or not) after `duration`.
    fn record_request(&self, op: &'static str, duration: Duration) {
        let _ = (op, duration);
    }

    /// A request waited `waited` for an in-flight permit before dispatch.
    fn record_queue_wait(&self, op: &'static str, waited: Duration) {
        let _ = (op, waited);
    }

    /// An in-flight request exceeded the long-running threshold.
    fn record_long_request(&self, op: &'static str, elapsed: Duration) {
        let _ = (op, elapsed);
    }
}

/// No-op sink used when no telemetry collaborator is configured.
pub struct NullStatsSink;

impl StatsSink for NullStatsSink {}
