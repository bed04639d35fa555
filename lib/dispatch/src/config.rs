// SPDX-FileCopyrightText: Copyright (c) 2025-2026 Easel Project Developers. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Dispatch configuration.
//!
//! Settings are merged from three sources, lowest priority first: built-in
//! defaults, an optional TOML file pointed to by `EASEL_CONFIG_PATH`, and
//! `EASEL_`-prefixed environment variables.

use std::time::Duration;

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

/// ENV pointing at an optional TOML settings file.
const CONFIG_PATH_ENV: &str = "EASEL_CONFIG_PATH";

/// Prefix for environment overrides, e.g. `EASEL_MAX_INIT_ATTEMPTS=5`.
const ENV_PREFIX: &str = "EASEL_";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Init attempts per worker before it is left Errored.
    pub max_init_attempts: u32,

    /// Inactivity threshold: a worker holding a claim without emitting
    /// progress for this long is declared stalled.
    pub max_timeout_minutes: u64,

    /// Upper bound on the time a request may wait for a worker, queueing
    /// behind other claims included. Default one week.
    pub per_request_timeout_minutes: u64,

    /// Depth of the worker (re)initialization queue.
    pub init_queue_depth: usize,

    /// Cadence at which an idle federation driver re-probes its peer.
    pub idle_probe_secs: u64,

    /// Cadence at which a Loading federation driver re-lists its peer.
    pub loading_poll_millis: u64,

    /// Federated peer instances to mirror into the local pool.
    pub federation: Vec<FederationConfig>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_init_attempts: 3,
            max_timeout_minutes: 20,
            per_request_timeout_minutes: 10_080,
            init_queue_depth: 64,
            idle_probe_secs: 30,
            loading_poll_millis: 1_000,
            federation: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FederationConfig {
    /// Peer endpoint, e.g. `http://peer:7801`.
    pub address: String,

    /// Park the driver Idle instead of Errored when the peer is unreachable.
    #[serde(default)]
    pub allow_idle: bool,

    /// Extra shadow slots to queue beyond the peer's running count.
    #[serde(default)]
    pub over_queue: u32,
}

impl DispatchConfig {
    /// Load settings from defaults, the optional TOML file and environment.
    pub fn from_settings() -> anyhow::Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(DispatchConfig::default()));
        if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
            figment = figment.merge(Toml::file(path));
        }
        let config: DispatchConfig = figment
            .merge(Env::prefixed(ENV_PREFIX))
            .extract()
            .map_err(|e| anyhow::anyhow!("invalid dispatch configuration: {e}"))?;
        Ok(config)
    }

    /// Per-request acquire deadline.
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.per_request_timeout_minutes * 60)
    }

    /// Per-backend inactivity threshold.
    pub fn stall_timeout(&self) -> Duration {
        Duration::from_secs(self.max_timeout_minutes * 60)
    }

    pub fn idle_probe_interval(&self) -> Duration {
        Duration::from_secs(self.idle_probe_secs)
    }

    pub fn loading_poll_interval(&self) -> Duration {
        Duration::from_millis(self.loading_poll_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_settings_surface() {
        let config = DispatchConfig::default();
        assert_eq!(config.max_init_attempts, 3);
        assert_eq!(config.max_timeout_minutes, 20);
        assert_eq!(config.per_request_timeout_minutes, 10_080);
        assert!(config.federation.is_empty());
    }

    #[test]
    fn timeouts_convert_to_durations() {
        let config = DispatchConfig::default();
        assert_eq!(config.stall_timeout(), Duration::from_secs(20 * 60));
        assert_eq!(config.acquire_timeout(), Duration::from_secs(10_080 * 60));
    }

    #[test]
    fn federation_entry_defaults() {
        let entry: FederationConfig =
            serde_json::from_str(r#"{"address": "http://peer:7801"}"#).unwrap();
        assert!(!entry.allow_idle);
        assert_eq!(entry.over_queue, 0);
    }
}
