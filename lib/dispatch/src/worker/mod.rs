// SPDX-FileCopyrightText: Copyright (c) 2025-2026 Easel Project Developers. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Worker drivers and per-worker records.
//!
//! A [`WorkerDriver`] is the capability interface over one generation
//! worker; shared state (status, current model, busy flag) lives on the
//! [`record::WorkerRecord`], not the driver.

pub mod record;

pub use record::{WorkerRecord, WorkerStats};

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::DispatchError;
use crate::protocols::{GenerateOutcome, GenerationRequest, GenerationUpdate};

/// Stable opaque worker identifier, unique within this process lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkerId(String);

impl WorkerId {
    pub fn random() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for WorkerId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for WorkerId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Disabled,
    Waiting,
    Loading,
    Idle,
    Running,
    Errored,
}

impl WorkerStatus {
    /// Whether moving from `self` to `next` is a permitted transition.
    ///
    /// Same-state transitions are no-ops and always allowed. Shutdown may
    /// disable from any state; a stall or health probe may drop Running to
    /// Errored.
    pub fn can_transition_to(self, next: WorkerStatus) -> bool {
        use WorkerStatus::*;
        if self == next || next == Disabled {
            return true;
        }
        matches!(
            (self, next),
            (Disabled, Waiting)
                | (Waiting, Loading)
                | (Loading, Running)
                | (Loading, Idle)
                | (Loading, Errored)
                | (Running, Idle)
                | (Idle, Running)
                | (Running, Errored)
                | (Errored, Waiting)
        )
    }
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WorkerStatus::Disabled => "disabled",
            WorkerStatus::Waiting => "waiting",
            WorkerStatus::Loading => "loading",
            WorkerStatus::Idle => "idle",
            WorkerStatus::Running => "running",
            WorkerStatus::Errored => "errored",
        };
        f.write_str(name)
    }
}

/// Capability interface over one generation worker.
///
/// Drivers are adapters: network I/O and model state live behind this
/// trait, while the dispatcher owns status and the busy flag. No exit path
/// of any method may leave the record busy; the dispatcher's access guard
/// enforces that rather than trusting the driver.
#[async_trait]
pub trait WorkerDriver: Send + Sync {
    /// Tag naming the driver variant, e.g. `"federation"`.
    fn driver_type(&self) -> &str;

    /// Bring the worker up. May suspend on network I/O and must be
    /// idempotent under retry.
    ///
    /// `Ok(Running)` or `Ok(Idle)` report the status the record should take.
    /// `Ok(Errored)` is a terminal failure the init loop will not retry
    /// (e.g. federation loop detection). `Err(_)` is retryable.
    async fn init(&self) -> anyhow::Result<WorkerStatus>;

    /// Release all resources. Tolerates being called from any non-terminal
    /// state.
    async fn shutdown(&self);

    /// Load `model_id`, returning whether the worker confirmed the load.
    /// Drivers that manage their own model state may no-op with `Ok(true)`.
    async fn load_model(&self, model_id: &str) -> anyhow::Result<bool>;

    /// Stream progress objects and image payloads into `sink` until the
    /// generation finishes. Must honor `cancel` by stopping promptly.
    async fn generate(
        &self,
        request: &GenerationRequest,
        batch_id: &str,
        sink: mpsc::Sender<GenerationUpdate>,
        cancel: CancellationToken,
    ) -> Result<GenerateOutcome, DispatchError>;

    /// Snapshot of the capability tags this worker currently advertises.
    fn supported_features(&self) -> HashSet<String>;
}

/// Everything needed to register a worker with the dispatcher.
pub struct WorkerSpec {
    pub id: Option<WorkerId>,
    pub driver_type: String,
    pub settings: Value,
    pub is_real: bool,
    pub driver: Arc<dyn WorkerDriver>,
}

impl WorkerSpec {
    pub fn real(driver: Arc<dyn WorkerDriver>, settings: Value) -> Self {
        Self {
            id: None,
            driver_type: driver.driver_type().to_string(),
            settings,
            is_real: true,
            driver,
        }
    }

    pub fn shadow(driver: Arc<dyn WorkerDriver>, settings: Value) -> Self {
        Self {
            id: None,
            driver_type: driver.driver_type().to_string(),
            settings,
            is_real: false,
            driver,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::WorkerStatus::*;
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(Disabled, Waiting, true)]
    #[case(Waiting, Loading, true)]
    #[case(Loading, Running, true)]
    #[case(Loading, Idle, true)]
    #[case(Loading, Errored, true)]
    #[case(Running, Idle, true)]
    #[case(Idle, Running, true)]
    #[case(Running, Errored, true)]
    #[case(Errored, Waiting, true)]
    #[case(Running, Disabled, true)]
    #[case(Errored, Running, false)]
    #[case(Disabled, Running, false)]
    #[case(Idle, Loading, false)]
    #[case(Waiting, Running, false)]
    fn transition_table(
        #[case] from: WorkerStatus,
        #[case] to: WorkerStatus,
        #[case] allowed: bool,
    ) {
        assert_eq!(from.can_transition_to(to), allowed, "{from} -> {to}");
    }

    #[test]
    fn same_state_is_a_no_op() {
        for status in [Disabled, Waiting, Loading, Idle, Running, Errored] {
            assert!(status.can_transition_to(status));
        }
    }
}
