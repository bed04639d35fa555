// SPDX-FileCopyrightText: Copyright (c) 2025-2026 Easel Project Developers. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Federation: mirroring a peer instance's pool into the local pool.
//!
//! A [`FederationDriver`] is an ordinary worker driver whose worker is a
//! whole peer instance. It reserves one concurrency slot per peer sub-worker
//! by synthesizing shadow records (`is_real = false`) next to itself; the
//! dispatcher treats them like any other worker. The generation pipeline
//! never sees any of this.

pub mod protocol;

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::config::FederationConfig;
use crate::dispatcher::Dispatcher;
use crate::error::DispatchError;
use crate::protocols::{GenerateOutcome, GenerationRequest, GenerationUpdate, ImagePayload};
use crate::worker::{WorkerDriver, WorkerId, WorkerRecord, WorkerSpec, WorkerStatus};

use protocol::{
    check_error_id, generate_body, BackendsListRequest, BackendsListResponse, GenerateResponse,
    NewSessionResponse, RemoteStatus, StreamFrame,
};

const DRIVER_TYPE: &str = "federation";

/// Timeout for the short control-plane calls (session, list). Generate
/// streams are unbounded and rely on cancellation instead.
const CONTROL_TIMEOUT: Duration = Duration::from_secs(30);

/// What the peer last told us about itself.
#[derive(Debug, Default, Clone)]
struct RemoteSnapshot {
    features: HashSet<String>,
    backend_types: HashSet<String>,
    count_running: u32,
    any_loading: bool,
}

/// Number of shadow records to keep next to the parent driver. The `- 1`
/// reserves the parent itself as the active slot.
fn shadow_target(count_running: u32, over_queue: u32) -> usize {
    (count_running as i64 - 1 + over_queue as i64).max(0) as usize
}

pub struct FederationDriver {
    address: String,
    allow_idle: bool,
    over_queue: u32,
    client: reqwest::Client,
    dispatcher: Weak<Dispatcher>,
    self_ref: Weak<FederationDriver>,
    parent_id: WorkerId,
    settings: Value,
    session: Mutex<Option<String>>,
    remote: RwLock<RemoteSnapshot>,
    shadows: Mutex<VecDeque<WorkerId>>,
    loop_detected: AtomicBool,
    idle_monitor_started: AtomicBool,
}

impl FederationDriver {
    /// Create a driver for `config` and register it (as a real record) with
    /// the dispatcher; init runs through the normal init queue.
    pub fn register(
        dispatcher: &Arc<Dispatcher>,
        config: FederationConfig,
        client: reqwest::Client,
    ) -> anyhow::Result<(Arc<WorkerRecord>, Arc<FederationDriver>)> {
        let parent_id = WorkerId::random();
        let settings = serde_json::to_value(&config)?;
        let driver = Arc::new_cyclic(|self_ref| FederationDriver {
            address: config.address.trim_end_matches('/').to_string(),
            allow_idle: config.allow_idle,
            over_queue: config.over_queue,
            client,
            dispatcher: Arc::downgrade(dispatcher),
            self_ref: self_ref.clone(),
            parent_id: parent_id.clone(),
            settings: settings.clone(),
            session: Mutex::new(None),
            remote: RwLock::new(RemoteSnapshot::default()),
            shadows: Mutex::new(VecDeque::new()),
            loop_detected: AtomicBool::new(false),
            idle_monitor_started: AtomicBool::new(false),
        });
        let mut spec = WorkerSpec::real(driver.clone(), settings);
        spec.id = Some(parent_id);
        let record = dispatcher.register(spec);
        Ok((record, driver))
    }

    /// Re-list the peer and resize the shadow set to match. Runs on init
    /// and on idle re-probe; callers may also invoke it directly after a
    /// known pool change on the peer.
    pub async fn refresh(&self) -> Result<(), DispatchError> {
        self.refresh_backends(WorkerStatus::Running).await
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub async fn shadow_ids(&self) -> Vec<WorkerId> {
        self.shadows.lock().await.iter().cloned().collect()
    }

    fn dispatcher(&self) -> Result<Arc<Dispatcher>, DispatchError> {
        self.dispatcher
            .upgrade()
            .ok_or_else(|| DispatchError::internal(anyhow::anyhow!("dispatcher dropped")))
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.address, path)
    }

    async fn post_control<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        body: &Value,
    ) -> Result<T, DispatchError> {
        let response = self
            .client
            .post(self.url(path))
            .timeout(CONTROL_TIMEOUT)
            .json(body)
            .send()
            .await
            .map_err(|e| DispatchError::Connection(format!("{path}: {e}")))?;
        if !response.status().is_success() {
            return Err(DispatchError::Connection(format!(
                "{path}: HTTP {}",
                response.status()
            )));
        }
        response
            .json::<T>()
            .await
            .map_err(|e| DispatchError::Connection(format!("{path}: bad response: {e}")))
    }

    // ---- session ------------------------------------------------------

    async fn ensure_session(&self) -> Result<String, DispatchError> {
        if let Some(session_id) = self.session.lock().await.clone() {
            return Ok(session_id);
        }
        self.open_session().await
    }

    async fn open_session(&self) -> Result<String, DispatchError> {
        let response: NewSessionResponse =
            self.post_control("session/new", &serde_json::json!({})).await?;
        check_error_id(&response.error_id)?;

        let dispatcher = self.dispatcher()?;
        if response.server_id == dispatcher.server_id() {
            self.loop_detected.store(true, Ordering::SeqCst);
            return Err(DispatchError::Connection(format!(
                "peer {} reports our own server id; refusing to federate with ourselves",
                self.address
            )));
        }

        *self.session.lock().await = Some(response.session_id.clone());
        self.remote.write().count_running = response.count_running;
        tracing::debug!(peer = %self.address, "federation session established");
        Ok(response.session_id)
    }

    /// Run `op` against the peer, transparently re-establishing the session
    /// and retrying exactly once when the peer invalidates it. A second
    /// invalidation surfaces as a connection error.
    async fn with_session<T, F, Fut>(&self, op: F) -> Result<T, DispatchError>
    where
        F: Fn(String) -> Fut,
        Fut: std::future::Future<Output = Result<T, DispatchError>>,
    {
        let session_id = self.ensure_session().await?;
        match op(session_id).await {
            Err(DispatchError::SessionInvalid) => {
                tracing::debug!(peer = %self.address, "session invalidated; re-establishing once");
                *self.session.lock().await = None;
                let session_id = self.open_session().await?;
                match op(session_id).await {
                    Err(DispatchError::SessionInvalid) => Err(DispatchError::Connection(format!(
                        "peer {} invalidated a freshly established session",
                        self.address
                    ))),
                    other => other,
                }
            }
            other => other,
        }
    }

    // ---- pool reflection ----------------------------------------------

    async fn establish(&self, shadow_status: WorkerStatus) -> Result<(), DispatchError> {
        self.open_session().await?;
        self.refresh_backends(shadow_status).await
    }

    /// List the peer's sub-workers, waiting out any that are still loading,
    /// then resize the local shadow set to match.
    async fn refresh_backends(&self, shadow_status: WorkerStatus) -> Result<(), DispatchError> {
        let dispatcher = self.dispatcher()?;
        let poll = dispatcher.config().loading_poll_interval();
        let shutdown = dispatcher.cancellation_token().clone();

        loop {
            let response: BackendsListResponse = self
                .with_session(|session_id| async move {
                    let response: BackendsListResponse = self
                        .post_control(
                            "backends/list",
                            &serde_json::to_value(BackendsListRequest {
                                session_id: &session_id,
                            })
                            .map_err(DispatchError::internal)?,
                        )
                        .await?;
                    check_error_id(&response.error_id)?;
                    Ok(response)
                })
                .await?;

            let any_loading = response
                .backends
                .iter()
                .any(|b| b.status == RemoteStatus::Loading);
            let count_running = response
                .backends
                .iter()
                .filter(|b| b.status == RemoteStatus::Running)
                .count() as u32;
            {
                let mut remote = self.remote.write();
                remote.any_loading = any_loading;
                remote.count_running = count_running;
                remote.features = response
                    .backends
                    .iter()
                    .flat_map(|b| b.features.iter().cloned())
                    .collect();
                remote.backend_types = response
                    .backends
                    .iter()
                    .map(|b| b.backend_type.clone())
                    .collect();
            }

            if !any_loading {
                break;
            }
            tracing::debug!(peer = %self.address, "peer still loading; re-querying");
            tokio::select! {
                _ = tokio::time::sleep(poll) => {}
                _ = shutdown.cancelled() => return Err(DispatchError::Cancelled),
            }
        }

        self.sync_shadows(shadow_status).await
    }

    /// Resize the shadow set to `max(0, count_running - 1 + over_queue)`.
    /// Oversize trims from the front, draining in-flight claims before the
    /// record goes away; undersize appends fresh shadows.
    async fn sync_shadows(&self, status: WorkerStatus) -> Result<(), DispatchError> {
        let dispatcher = self.dispatcher()?;
        let driver = self
            .self_ref
            .upgrade()
            .ok_or_else(|| DispatchError::internal(anyhow::anyhow!("driver dropped")))?;
        let target = shadow_target(self.remote.read().count_running, self.over_queue);

        let mut shadows = self.shadows.lock().await;
        while shadows.len() > target {
            let id = shadows.pop_front().expect("len checked above");
            tracing::debug!(peer = %self.address, shadow = %id, "trimming shadow record");
            dispatcher.remove(&id).await;
        }
        while shadows.len() < target {
            let spec = WorkerSpec {
                id: None,
                driver_type: DRIVER_TYPE.to_string(),
                settings: self.settings.clone(),
                is_real: false,
                driver: driver.clone(),
            };
            let record = dispatcher
                .register_ready(spec, status)
                .map_err(DispatchError::internal)?;
            shadows.push_back(record.id().clone());
        }
        Ok(())
    }

    // ---- idle mode -----------------------------------------------------

    /// Re-probe an unreachable peer on a cadence; on success flip the parent
    /// and every shadow to Running in one step.
    fn spawn_idle_monitor(&self) {
        if self.idle_monitor_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(driver) = self.self_ref.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            let Some(dispatcher) = driver.dispatcher.upgrade() else {
                return;
            };
            let interval = dispatcher.config().idle_probe_interval();
            let shutdown = dispatcher.cancellation_token().clone();
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = tokio::time::sleep(interval) => {}
                }
                let Some(parent) = dispatcher.get(&driver.parent_id) else {
                    return;
                };
                match parent.status() {
                    WorkerStatus::Idle => {}
                    WorkerStatus::Disabled => return,
                    _ => continue,
                }
                match driver.establish(WorkerStatus::Idle).await {
                    Ok(()) => {
                        let mut ids = vec![driver.parent_id.clone()];
                        ids.extend(driver.shadows.lock().await.iter().cloned());
                        match dispatcher.set_status_many(&ids, WorkerStatus::Running) {
                            Ok(()) => {
                                tracing::info!(peer = %driver.address, "idle peer is reachable again")
                            }
                            Err(err) => {
                                tracing::warn!(peer = %driver.address, error = %err, "could not promote idle peer")
                            }
                        }
                    }
                    Err(err) => {
                        tracing::debug!(peer = %driver.address, error = %err, "idle probe failed");
                        *driver.session.lock().await = None;
                    }
                }
            }
        });
    }

    // ---- generation ----------------------------------------------------

    async fn generate_streaming(
        &self,
        session_id: String,
        request: &GenerationRequest,
        sink: mpsc::Sender<GenerationUpdate>,
        cancel: CancellationToken,
    ) -> Result<GenerateOutcome, DispatchError> {
        let body = generate_body(&session_id, request);
        let response = self
            .client
            .post(self.url("generate-stream"))
            .json(&body)
            .send()
            .await
            .map_err(|e| DispatchError::Connection(format!("generate-stream: {e}")))?;

        // peers predating the streaming endpoint answer unary
        if response.status() == reqwest::StatusCode::NOT_FOUND
            || response.status() == reqwest::StatusCode::METHOD_NOT_ALLOWED
        {
            return self.generate_unary(session_id, request, sink).await;
        }
        if !response.status().is_success() {
            return Err(DispatchError::Connection(format!(
                "generate-stream: HTTP {}",
                response.status()
            )));
        }

        let mut stream = response.bytes_stream();
        let mut buffer: Vec<u8> = Vec::new();
        loop {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => return Err(DispatchError::Cancelled),
                chunk = stream.next() => chunk,
            };
            match chunk {
                Some(Ok(bytes)) => {
                    buffer.extend_from_slice(&bytes);
                    while let Some(newline) = buffer.iter().position(|&b| b == b'\n') {
                        let line: Vec<u8> = buffer.drain(..=newline).collect();
                        self.handle_frame(&line[..line.len() - 1], &sink).await?;
                    }
                }
                Some(Err(err)) => {
                    return Err(DispatchError::Connection(format!(
                        "generate-stream: {err}"
                    )));
                }
                None => break,
            }
        }
        if !buffer.is_empty() {
            self.handle_frame(&buffer, &sink).await?;
        }
        Ok(GenerateOutcome::Complete)
    }

    async fn handle_frame(
        &self,
        line: &[u8],
        sink: &mpsc::Sender<GenerationUpdate>,
    ) -> Result<(), DispatchError> {
        let line = match std::str::from_utf8(line) {
            Ok(s) if !s.trim().is_empty() => s.trim(),
            _ => return Ok(()),
        };
        let frame: StreamFrame = serde_json::from_str(line)
            .map_err(|e| DispatchError::Connection(format!("malformed stream frame: {e}")))?;
        check_error_id(&frame.error_id)?;
        let update = if let Some(progress) = frame.gen_progress {
            GenerationUpdate::Progress(progress)
        } else if let Some(image) = frame.image {
            GenerationUpdate::Image(ImagePayload::from_data_uri(image))
        } else {
            return Ok(());
        };
        sink.send(update)
            .await
            .map_err(|_| DispatchError::Cancelled)
    }

    async fn generate_unary(
        &self,
        session_id: String,
        request: &GenerationRequest,
        sink: mpsc::Sender<GenerationUpdate>,
    ) -> Result<GenerateOutcome, DispatchError> {
        let body = generate_body(&session_id, request);
        let response: GenerateResponse = self.post_control("generate", &body).await?;
        check_error_id(&response.error_id)?;
        for data_uri in response.images {
            sink.send(GenerationUpdate::Image(ImagePayload::from_data_uri(
                data_uri,
            )))
            .await
            .map_err(|_| DispatchError::Cancelled)?;
        }
        Ok(GenerateOutcome::Complete)
    }
}

#[async_trait]
impl WorkerDriver for FederationDriver {
    fn driver_type(&self) -> &str {
        DRIVER_TYPE
    }

    async fn init(&self) -> anyhow::Result<WorkerStatus> {
        self.loop_detected.store(false, Ordering::SeqCst);
        *self.session.lock().await = None;

        match self.establish(WorkerStatus::Running).await {
            Ok(()) => Ok(WorkerStatus::Running),
            Err(err) => {
                if self.loop_detected.load(Ordering::SeqCst) {
                    // terminal: retrying would only re-detect ourselves
                    tracing::error!(peer = %self.address, "federation loop detected");
                    return Ok(if self.allow_idle {
                        WorkerStatus::Idle
                    } else {
                        WorkerStatus::Errored
                    });
                }
                if self.allow_idle {
                    tracing::warn!(peer = %self.address, error = %err, "peer unreachable; parking idle");
                    self.spawn_idle_monitor();
                    return Ok(WorkerStatus::Idle);
                }
                Err(err.into())
            }
        }
    }

    async fn shutdown(&self) {
        *self.session.lock().await = None;
    }

    async fn load_model(&self, _model_id: &str) -> anyhow::Result<bool> {
        // the peer picks its own worker; the model rides along in the
        // generate body
        Ok(true)
    }

    async fn generate(
        &self,
        request: &GenerationRequest,
        _batch_id: &str,
        sink: mpsc::Sender<GenerationUpdate>,
        cancel: CancellationToken,
    ) -> Result<GenerateOutcome, DispatchError> {
        self.with_session(|session_id| {
            self.generate_streaming(session_id, request, sink.clone(), cancel.clone())
        })
        .await
    }

    fn supported_features(&self) -> HashSet<String> {
        self.remote.read().features.clone()
    }
}

/// Register one federation driver per configured peer.
pub fn bootstrap(dispatcher: &Arc<Dispatcher>) -> anyhow::Result<Vec<Arc<WorkerRecord>>> {
    let peers = dispatcher.config().federation.clone();
    if peers.is_empty() {
        return Ok(Vec::new());
    }
    let client = reqwest::Client::builder()
        .pool_max_idle_per_host(8)
        .connect_timeout(Duration::from_secs(10))
        .build()?;
    peers
        .into_iter()
        .map(|config| {
            FederationDriver::register(dispatcher, config, client.clone())
                .map(|(record, _driver)| record)
        })
        .collect()
}
