// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Channel configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Name-comparison semantics threaded through to higher-level dispatch
/// layers. The channel itself never compares names; it only carries the
/// mode unchanged.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CaseSensitivity {
    #[default]
    Sensitive,
    Insensitive,
}

/// Immutable bundle of channel tunables, bound at construction and
/// enforced for the channel's full lifetime.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Number of worker threads pulling requests from the transport.
    pub worker_threads: usize,
    /// Bound on requests awaiting asynchronous completion (reads, writes,
    /// directory listings). Sub-bound of `max_inflight_requests`.
    pub max_background_requests: usize,
    /// Bound on total concurrently outstanding requests. Requests beyond
    /// the bound queue; they are never dropped.
    pub max_inflight_requests: usize,
    /// Wall-clock threshold after which an in-flight request is reported
    /// as long-running. Diagnostic only, never cancellation.
    pub long_request_threshold: Duration,
    /// Minimum interval between saturation log lines while the in-flight
    /// bound is being hit.
    pub high_load_log_interval: Duration,
    /// Capacity of the in-memory ring of recent request traces.
    pub trace_bus_capacity: usize,
    pub case_sensitivity: CaseSensitivity,
    /// When set, lookup names that are not valid UTF-8 are rejected at
    /// the channel boundary instead of reaching the dispatcher.
    pub require_utf8_paths: bool,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            worker_threads: 4,
            max_background_requests: 12,
            max_inflight_requests: 1000,
            long_request_threshold: Duration::from_secs(5 * 60),
            high_load_log_interval: Duration::from_secs(10 * 60),
            trace_bus_capacity: 25_000,
            case_sensitivity: CaseSensitivity::Sensitive,
            require_utf8_paths: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_harness_conventions() {
        let config = ChannelConfig::default();
        assert_eq!(config.max_background_requests, 12);
        assert_eq!(config.max_inflight_requests, 1000);
        assert_eq!(config.trace_bus_capacity, 25_000);
        assert_eq!(config.case_sensitivity, CaseSensitivity::Sensitive);
        assert!(config.require_utf8_paths);
    }

    #[test]
    fn config_survives_json() {
        let config = ChannelConfig {
            worker_threads: 8,
            case_sensitivity: CaseSensitivity::Insensitive,
            require_utf8_paths: false,
            ..Default::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        let parsed: ChannelConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.worker_threads, 8);
        assert_eq!(parsed.case_sensitivity, CaseSensitivity::Insensitive);
        assert!(!parsed.require_utf8_paths);
    }
}
