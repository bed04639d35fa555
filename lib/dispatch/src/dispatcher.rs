// SPDX-FileCopyrightText: Copyright (c) 2025-2026 Easel Project Developers. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Worker pool and request-to-worker matching.
//!
//! The dispatcher owns the record map, enforces at-most-one generation per
//! worker via the busy CAS, runs the background init-retry loop and the
//! inactivity watchdog, and holds the listener registry the pipeline fires
//! around each generation.
//!
//! Wake-ups are broadcast (all waiters re-scan) rather than single-signaled:
//! waiters carry different capability filters, so a targeted wake could be
//! lost on a filter mismatch.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::claim::Claim;
use crate::config::DispatchConfig;
use crate::error::DispatchError;
use crate::protocols::{GenerationRequest, ImagePayload};
use crate::worker::{WorkerDriver, WorkerId, WorkerRecord, WorkerSpec, WorkerStatus};

/// Immutable event passed to pre-generate listeners.
pub struct PreGenerateEvent<'a> {
    pub request: &'a GenerationRequest,
    pub batch_id: &'a str,
}

/// Immutable event passed to post-generate listeners, together with a
/// `refuse` mutator that discards the image.
pub struct PostImageEvent<'a> {
    pub request: &'a GenerationRequest,
    pub batch_id: &'a str,
    pub image: &'a ImagePayload,
    pub index: u32,
}

pub type PreGenerateListener =
    Arc<dyn Fn(&PreGenerateEvent<'_>) -> Result<(), DispatchError> + Send + Sync>;

/// Post-generate listeners may `refuse()` to discard the one image, or
/// return a hard error to abort the whole request.
pub type PostImageListener =
    Arc<dyn Fn(&PostImageEvent<'_>, &mut dyn FnMut()) -> Result<(), DispatchError> + Send + Sync>;

struct ActiveEntry {
    cancel: CancellationToken,
    last_progress: Arc<Mutex<Instant>>,
    stalled: Arc<AtomicBool>,
}

enum MatchAttempt {
    Granted(Arc<WorkerRecord>),
    /// A candidate existed but its busy CAS was lost; re-snapshot at once.
    Contended,
    NoCandidate,
}

pub struct Dispatcher {
    config: DispatchConfig,
    records: RwLock<HashMap<WorkerId, Arc<WorkerRecord>>>,
    notifier: Arc<Notify>,
    active: Mutex<HashMap<WorkerId, ActiveEntry>>,
    init_tx: mpsc::Sender<WorkerId>,
    admitting: AtomicBool,
    shutdown: CancellationToken,
    /// Loop-prevention id reported to federation peers.
    server_id: String,
    pre_listeners: RwLock<Vec<PreGenerateListener>>,
    post_listeners: RwLock<Vec<PostImageListener>>,
}

impl Dispatcher {
    pub fn new(config: DispatchConfig) -> Arc<Self> {
        let (init_tx, init_rx) = mpsc::channel(config.init_queue_depth.max(1));
        let dispatcher = Arc::new(Self {
            config,
            records: RwLock::new(HashMap::new()),
            notifier: Arc::new(Notify::new()),
            active: Mutex::new(HashMap::new()),
            init_tx,
            admitting: AtomicBool::new(true),
            shutdown: CancellationToken::new(),
            server_id: uuid::Uuid::new_v4().to_string(),
            pre_listeners: RwLock::new(Vec::new()),
            post_listeners: RwLock::new(Vec::new()),
        });

        tokio::spawn(dispatcher.clone().init_loop(init_rx));
        tokio::spawn(dispatcher.clone().watchdog_loop());
        dispatcher
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// The id federation peers compare against to detect request loops.
    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    /// Root token cancelled on shutdown; claims are parented to it.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    // ---- pool mutation ------------------------------------------------

    /// Insert a record and queue it for initialization.
    pub fn register(self: &Arc<Self>, spec: WorkerSpec) -> Arc<WorkerRecord> {
        let record = self.insert(spec);
        self.enqueue_init(record.id().clone());
        record
    }

    /// Insert a record already known to be up (federation shadows mirror
    /// their parent's state and never run init themselves).
    pub fn register_ready(
        self: &Arc<Self>,
        spec: WorkerSpec,
        status: WorkerStatus,
    ) -> anyhow::Result<Arc<WorkerRecord>> {
        anyhow::ensure!(
            matches!(status, WorkerStatus::Running | WorkerStatus::Idle),
            "register_ready only accepts Running or Idle, got {status}"
        );
        let record = self.insert(spec);
        record.set_status(WorkerStatus::Waiting)?;
        record.set_status(WorkerStatus::Loading)?;
        record.set_status(status)?;
        Ok(record)
    }

    fn insert(self: &Arc<Self>, spec: WorkerSpec) -> Arc<WorkerRecord> {
        let id = spec.id.unwrap_or_else(WorkerId::random);
        let record = Arc::new(WorkerRecord::new(
            id.clone(),
            spec.driver_type,
            spec.settings,
            spec.is_real,
            spec.driver,
            self.notifier.clone(),
        ));
        self.records.write().insert(id, record.clone());
        self.notifier.notify_waiters();
        record
    }

    /// Detach a record from the pool and wait for any in-flight claim on it
    /// to drain before handing it back.
    pub async fn remove(&self, id: &WorkerId) -> Option<Arc<WorkerRecord>> {
        let record = self.records.write().remove(id)?;
        self.notifier.notify_waiters();
        loop {
            let notified = self.notifier.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if !record.is_busy() {
                break;
            }
            tokio::select! {
                _ = &mut notified => {}
                _ = self.shutdown.cancelled() => break,
            }
        }
        let _ = record.set_status(WorkerStatus::Disabled);
        Some(record)
    }

    pub fn get(&self, id: &WorkerId) -> Option<Arc<WorkerRecord>> {
        self.records.read().get(id).cloned()
    }

    pub fn snapshot(&self) -> Vec<Arc<WorkerRecord>> {
        self.records.read().values().cloned().collect()
    }

    /// Flip a group of records in one step under the pool lock, so matcher
    /// snapshots observe either all-old or all-new (federation shadows must
    /// move with their parent).
    pub fn set_status_many(&self, ids: &[WorkerId], status: WorkerStatus) -> anyhow::Result<()> {
        let records = self.records.write();
        for id in ids {
            if let Some(record) = records.get(id) {
                record.set_status(status)?;
            }
        }
        Ok(())
    }

    pub(crate) fn enqueue_init(&self, id: WorkerId) {
        if let Err(err) = self.init_tx.try_send(id) {
            tracing::warn!(error = %err, "init queue full; dropping init request");
        }
    }

    /// Queue an Errored record for another round of init attempts.
    pub fn retry_init(&self, id: &WorkerId) {
        self.enqueue_init(id.clone());
    }

    // ---- acquisition --------------------------------------------------

    /// Reserve a matching, not-busy Running worker, waiting until one frees
    /// or the deadline elapses. `on_will_load` fires at most once, before
    /// the call would hand out a worker that needs a model swap.
    pub async fn acquire<F, W>(
        self: &Arc<Self>,
        filter: F,
        preferred_model: Option<&str>,
        timeout: Duration,
        claim: &Claim,
        mut on_will_load: W,
    ) -> Result<WorkerAccess, DispatchError>
    where
        F: Fn(&WorkerRecord) -> bool,
        W: FnMut(),
    {
        let deadline = Instant::now() + timeout;
        let mut will_load_signalled = false;
        loop {
            if !self.admitting.load(Ordering::SeqCst) || self.shutdown.is_cancelled() {
                return Err(DispatchError::Cancelled);
            }
            if claim.should_cancel() {
                return Err(DispatchError::Cancelled);
            }

            // Register interest before scanning so a release between the
            // scan and the await cannot be lost.
            let notified = self.notifier.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.try_match(
                &filter,
                preferred_model,
                &mut will_load_signalled,
                &mut on_will_load,
            ) {
                MatchAttempt::Granted(record) => return Ok(self.grant(record, claim)),
                MatchAttempt::Contended => continue,
                MatchAttempt::NoCandidate => {}
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = claim.token().cancelled() => return Err(DispatchError::Cancelled),
                _ = self.shutdown.cancelled() => return Err(DispatchError::Cancelled),
                _ = tokio::time::sleep_until(deadline) => return Err(DispatchError::Timeout),
            }
        }
    }

    fn try_match<F, W>(
        &self,
        filter: &F,
        preferred_model: Option<&str>,
        will_load_signalled: &mut bool,
        on_will_load: &mut W,
    ) -> MatchAttempt
    where
        F: Fn(&WorkerRecord) -> bool,
        W: FnMut(),
    {
        let candidates: Vec<Arc<WorkerRecord>> = {
            let records = self.records.read();
            records
                .values()
                .filter(|r| {
                    r.status() == WorkerStatus::Running && !r.is_busy() && filter(r.as_ref())
                })
                .cloned()
                .collect()
        };
        if candidates.is_empty() {
            return MatchAttempt::NoCandidate;
        }

        // With no preferred model every candidate is an exact match; with
        // one, the rest would need a reload.
        let (matching, needs_load): (Vec<_>, Vec<_>) = match preferred_model {
            Some(model) => candidates
                .into_iter()
                .partition(|r| r.current_model().as_deref() == Some(model)),
            None => (candidates, Vec::new()),
        };

        let pool = if !matching.is_empty() {
            matching
        } else {
            if !*will_load_signalled {
                on_will_load();
                *will_load_signalled = true;
            }
            needs_load
        };

        let best = pool
            .into_iter()
            .min_by_key(|r| (r.outstanding(), r.id().clone()))
            .expect("pool is non-empty");
        if best.try_acquire() {
            MatchAttempt::Granted(best)
        } else {
            MatchAttempt::Contended
        }
    }

    fn grant(self: &Arc<Self>, record: Arc<WorkerRecord>, claim: &Claim) -> WorkerAccess {
        let cancel = claim.token().child_token();
        let last_progress = Arc::new(Mutex::new(Instant::now()));
        let stalled = Arc::new(AtomicBool::new(false));
        self.active.lock().insert(
            record.id().clone(),
            ActiveEntry {
                cancel: cancel.clone(),
                last_progress: last_progress.clone(),
                stalled: stalled.clone(),
            },
        );
        tracing::debug!(worker = %record.id(), "worker acquired");
        WorkerAccess {
            record,
            dispatcher: self.clone(),
            cancel,
            last_progress,
            stalled,
            released: false,
        }
    }

    fn finish_access(&self, record: &Arc<WorkerRecord>, stalled: bool) {
        self.active.lock().remove(record.id());
        record.release();
        if stalled {
            tracing::warn!(worker = %record.id(), "worker stalled; marking errored and requeueing init");
            let _ = record.set_status(WorkerStatus::Errored);
            self.enqueue_init(record.id().clone());
        }
        self.notifier.notify_waiters();
    }

    /// Wait until at least one record is Running, or `timeout` passes.
    pub async fn wait_for_ready(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.notifier.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self
                .records
                .read()
                .values()
                .any(|r| r.status() == WorkerStatus::Running)
            {
                return true;
            }
            tokio::select! {
                _ = &mut notified => {}
                _ = self.shutdown.cancelled() => return false,
                _ = tokio::time::sleep_until(deadline) => return false,
            }
        }
    }

    // ---- listeners ----------------------------------------------------

    pub fn add_pre_generate_listener(&self, listener: PreGenerateListener) {
        self.pre_listeners.write().push(listener);
    }

    pub fn add_post_image_listener(&self, listener: PostImageListener) {
        self.post_listeners.write().push(listener);
    }

    /// Run pre-generate listeners synchronously. The first refusal aborts.
    pub fn fire_pre_generate(&self, event: &PreGenerateEvent<'_>) -> Result<(), DispatchError> {
        let listeners = self.pre_listeners.read().clone();
        for listener in &listeners {
            listener(event)?;
        }
        Ok(())
    }

    /// Run post-generate listeners. `Ok(false)` means some listener refused
    /// the image; a hard error aborts the request.
    pub fn fire_post_image(&self, event: &PostImageEvent<'_>) -> Result<bool, DispatchError> {
        let listeners = self.post_listeners.read().clone();
        let mut refused = false;
        for listener in &listeners {
            let mut refuse = || refused = true;
            listener(event, &mut refuse)?;
        }
        Ok(!refused)
    }

    // ---- background loops ---------------------------------------------

    async fn init_loop(self: Arc<Self>, mut init_rx: mpsc::Receiver<WorkerId>) {
        loop {
            let id = tokio::select! {
                _ = self.shutdown.cancelled() => return,
                id = init_rx.recv() => match id {
                    Some(id) => id,
                    None => return,
                },
            };
            tokio::spawn(self.clone().init_record(id));
        }
    }

    async fn init_record(self: Arc<Self>, id: WorkerId) {
        let Some(record) = self.get(&id) else {
            return;
        };
        match record.status() {
            WorkerStatus::Disabled | WorkerStatus::Errored => {
                if record.set_status(WorkerStatus::Waiting).is_err() {
                    return;
                }
            }
            WorkerStatus::Waiting => {}
            // already loading or up; nothing to do
            _ => return,
        }

        let max_attempts = self.config.max_init_attempts.max(1);
        for attempt in 1..=max_attempts {
            if self.shutdown.is_cancelled() {
                return;
            }
            if record.set_status(WorkerStatus::Loading).is_err() {
                return;
            }
            match record.driver().init().await {
                Ok(status @ (WorkerStatus::Running | WorkerStatus::Idle)) => {
                    if let Err(err) = record.set_status(status) {
                        tracing::warn!(worker = %id, error = %err, "could not publish init result");
                    }
                    return;
                }
                Ok(_) => {
                    // terminal failure (e.g. loop detection); do not retry
                    tracing::warn!(worker = %id, "worker init failed terminally");
                    let _ = record.set_status(WorkerStatus::Errored);
                    return;
                }
                Err(err) => {
                    tracing::warn!(worker = %id, attempt, max_attempts, error = %format!("{err:#}"), "worker init failed");
                    let _ = record.set_status(WorkerStatus::Errored);
                    if attempt < max_attempts {
                        let _ = record.set_status(WorkerStatus::Waiting);
                        let delay = Duration::from_secs(1u64 << (attempt - 1).min(5));
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            _ = self.shutdown.cancelled() => return,
                        }
                    }
                }
            }
        }
    }

    /// Declare workers failed when they hold a claim without progress for
    /// longer than the inactivity threshold.
    async fn watchdog_loop(self: Arc<Self>) {
        let stall = self.config.stall_timeout();
        let poll = (stall / 4).clamp(Duration::from_secs(1), Duration::from_secs(30));
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = tokio::time::sleep(poll) => {}
            }
            let now = Instant::now();
            let expired: Vec<(WorkerId, CancellationToken, Arc<AtomicBool>)> = self
                .active
                .lock()
                .iter()
                .filter(|(_, entry)| now.duration_since(*entry.last_progress.lock()) >= stall)
                .map(|(id, entry)| (id.clone(), entry.cancel.clone(), entry.stalled.clone()))
                .collect();
            for (id, cancel, stalled) in expired {
                tracing::warn!(worker = %id, "no progress within inactivity threshold; cancelling generation");
                stalled.store(true, Ordering::SeqCst);
                cancel.cancel();
            }
        }
    }

    // ---- shutdown ------------------------------------------------------

    /// Two-phase shutdown: stop admitting new acquisitions, drain live
    /// claims, then cancel the root token and shut drivers down.
    pub async fn shutdown(&self) {
        tracing::info!("dispatcher shutdown initiated");
        self.admitting.store(false, Ordering::SeqCst);
        self.notifier.notify_waiters();

        loop {
            let notified = self.notifier.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.active.lock().is_empty() {
                break;
            }
            notified.await;
        }

        self.shutdown.cancel();

        let records = self.snapshot();
        for record in &records {
            if record.is_real() {
                record.driver().shutdown().await;
            }
            let _ = record.set_status(WorkerStatus::Disabled);
        }
        tracing::info!("dispatcher shutdown complete");
    }
}

/// Scoped reservation of one worker. Dropping it (on any exit path)
/// restores `busy = false` and wakes every pool waiter; a stalled access
/// additionally moves the worker to Errored and requeues it for init.
pub struct WorkerAccess {
    record: Arc<WorkerRecord>,
    dispatcher: Arc<Dispatcher>,
    cancel: CancellationToken,
    last_progress: Arc<Mutex<Instant>>,
    stalled: Arc<AtomicBool>,
    released: bool,
}

impl std::fmt::Debug for WorkerAccess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerAccess").finish_non_exhaustive()
    }
}

impl WorkerAccess {
    pub fn record(&self) -> &Arc<WorkerRecord> {
        &self.record
    }

    pub fn driver(&self) -> Arc<dyn WorkerDriver> {
        self.record.driver().clone()
    }

    /// Token the driver's generate call must honor; cancelled by the claim,
    /// by global shutdown, or by the stall watchdog.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Record that the worker emitted progress, resetting the inactivity
    /// clock.
    pub fn touch(&self) {
        *self.last_progress.lock() = Instant::now();
    }

    /// True once the watchdog declared this access stalled.
    pub fn is_stalled(&self) -> bool {
        self.stalled.load(Ordering::SeqCst)
    }

    pub fn release(mut self) {
        self.do_release();
    }

    fn do_release(&mut self) {
        if !self.released {
            self.released = true;
            self.dispatcher
                .finish_access(&self.record, self.is_stalled());
        }
    }
}

impl Drop for WorkerAccess {
    fn drop(&mut self) {
        self.do_release();
    }
}
