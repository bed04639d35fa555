// SPDX-FileCopyrightText: Copyright (c) 2025-2026 Easel Project Developers. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Per-worker state: status, current model, busy flag, statistics.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::Notify;

use super::{WorkerDriver, WorkerId, WorkerStatus};

/// Usage statistics kept per worker.
#[derive(Debug, Clone, Default)]
pub struct WorkerStats {
    pub total_generations: u64,
    pub generation_secs: f64,
    pub last_used: Option<Instant>,
}

#[derive(Debug)]
struct RecordState {
    status: WorkerStatus,
    current_model: Option<String>,
    supported_features: HashSet<String>,
}

/// Pure data with two mutators: [`WorkerRecord::set_status`] (broadcasts the
/// pool notifier so waiters re-scan) and [`WorkerRecord::try_acquire`] /
/// [`WorkerRecord::release`] (atomic on the busy flag).
pub struct WorkerRecord {
    id: WorkerId,
    driver_type: String,
    settings: Value,
    is_real: bool,
    driver: Arc<dyn WorkerDriver>,
    state: Mutex<RecordState>,
    busy: AtomicBool,
    /// Claims currently holding this worker, for the matcher's tie-break.
    outstanding: AtomicUsize,
    stats: Mutex<WorkerStats>,
    notifier: Arc<Notify>,
}

impl WorkerRecord {
    pub(crate) fn new(
        id: WorkerId,
        driver_type: String,
        settings: Value,
        is_real: bool,
        driver: Arc<dyn WorkerDriver>,
        notifier: Arc<Notify>,
    ) -> Self {
        Self {
            id,
            driver_type,
            settings,
            is_real,
            driver,
            state: Mutex::new(RecordState {
                status: WorkerStatus::Disabled,
                current_model: None,
                supported_features: HashSet::new(),
            }),
            busy: AtomicBool::new(false),
            outstanding: AtomicUsize::new(0),
            stats: Mutex::new(WorkerStats::default()),
            notifier,
        }
    }

    pub fn id(&self) -> &WorkerId {
        &self.id
    }

    pub fn driver_type(&self) -> &str {
        &self.driver_type
    }

    pub fn settings(&self) -> &Value {
        &self.settings
    }

    /// False for records synthesized by a federation driver.
    pub fn is_real(&self) -> bool {
        self.is_real
    }

    pub fn driver(&self) -> &Arc<dyn WorkerDriver> {
        &self.driver
    }

    pub fn status(&self) -> WorkerStatus {
        self.state.lock().status
    }

    /// Transition to `next`, refresh the feature snapshot from the driver
    /// and wake every pool waiter. Forbidden transitions leave the record
    /// unchanged.
    pub fn set_status(&self, next: WorkerStatus) -> anyhow::Result<()> {
        {
            let mut state = self.state.lock();
            if !state.status.can_transition_to(next) {
                anyhow::bail!(
                    "forbidden status transition {} -> {} on worker {}",
                    state.status,
                    next,
                    self.id
                );
            }
            if state.status != next {
                tracing::debug!(worker = %self.id, from = %state.status, to = %next, "worker status change");
            }
            state.status = next;
            state.supported_features = self.driver.supported_features();
        }
        self.notifier.notify_waiters();
        Ok(())
    }

    pub fn current_model(&self) -> Option<String> {
        self.state.lock().current_model.clone()
    }

    pub fn set_current_model(&self, model: Option<String>) {
        self.state.lock().current_model = model;
    }

    pub fn supported_features(&self) -> HashSet<String> {
        self.state.lock().supported_features.clone()
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    /// Claims currently holding this worker.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }

    /// Compare-and-swap the busy flag. Succeeds only while the record is
    /// Running; the status is re-checked after the swap so a concurrent
    /// transition cannot leave a busy non-Running worker behind.
    pub fn try_acquire(&self) -> bool {
        if self.status() != WorkerStatus::Running {
            return false;
        }
        if self
            .busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }
        if self.status() != WorkerStatus::Running {
            self.busy.store(false, Ordering::SeqCst);
            self.notifier.notify_waiters();
            return false;
        }
        self.outstanding.fetch_add(1, Ordering::SeqCst);
        true
    }

    /// Clear the busy flag and wake every pool waiter.
    pub fn release(&self) {
        self.outstanding.fetch_sub(1, Ordering::SeqCst);
        self.busy.store(false, Ordering::SeqCst);
        self.notifier.notify_waiters();
    }

    pub fn stats(&self) -> WorkerStats {
        self.stats.lock().clone()
    }

    pub(crate) fn record_generation(&self, elapsed: Duration) {
        let mut stats = self.stats.lock();
        stats.total_generations += 1;
        stats.generation_secs += elapsed.as_secs_f64();
        stats.last_used = Some(Instant::now());
    }
}

impl std::fmt::Debug for WorkerRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerRecord")
            .field("id", &self.id)
            .field("driver_type", &self.driver_type)
            .field("status", &self.status())
            .field("busy", &self.is_busy())
            .field("is_real", &self.is_real)
            .finish()
    }
}
