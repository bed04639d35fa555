// SPDX-FileCopyrightText: Copyright (c) 2025-2026 Easel Project Developers. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Federation scenarios against a mock peer served over real HTTP.

mod common;

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Json, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::Router;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use common::CountingHooks;
use easel_dispatch::error::DispatchError;
use easel_dispatch::federation::FederationDriver;
use easel_dispatch::{
    Claim, DispatchConfig, Dispatcher, FederationConfig, GenerationPipeline, GenerationRequest,
    ImagePayload, WorkerRecord, WorkerStatus,
};

/// Scriptable peer instance.
struct PeerState {
    server_id: String,
    sessions: Mutex<HashSet<String>>,
    session_count: AtomicU32,
    count_running: AtomicU32,
    loading_lists_remaining: AtomicU32,
    expire_next_generate: AtomicBool,
    list_calls: AtomicU32,
    generate_calls: AtomicU32,
    stream_enabled: bool,
}

impl PeerState {
    fn new(server_id: &str, count_running: u32) -> Arc<Self> {
        Arc::new(Self {
            server_id: server_id.to_string(),
            sessions: Mutex::new(HashSet::new()),
            session_count: AtomicU32::new(0),
            count_running: AtomicU32::new(count_running),
            loading_lists_remaining: AtomicU32::new(0),
            expire_next_generate: AtomicBool::new(false),
            list_calls: AtomicU32::new(0),
            generate_calls: AtomicU32::new(0),
            stream_enabled: true,
        })
    }

    fn session_valid(&self, body: &Value) -> bool {
        body.get("session_id")
            .and_then(|v| v.as_str())
            .map(|sid| self.sessions.lock().contains(sid))
            .unwrap_or(false)
    }
}

async fn session_new(State(state): State<Arc<PeerState>>) -> Json<Value> {
    let n = state.session_count.fetch_add(1, Ordering::SeqCst) + 1;
    let session_id = format!("sess-{n}");
    state.sessions.lock().insert(session_id.clone());
    Json(json!({
        "session_id": session_id,
        "server_id": state.server_id,
        "count_running": state.count_running.load(Ordering::SeqCst),
    }))
}

async fn backends_list(
    State(state): State<Arc<PeerState>>,
    Json(body): Json<Value>,
) -> Json<Value> {
    if !state.session_valid(&body) {
        return Json(json!({"error_id": "invalid_session_id"}));
    }
    state.list_calls.fetch_add(1, Ordering::SeqCst);

    let mut backends: Vec<Value> = (0..state.count_running.load(Ordering::SeqCst))
        .map(|_| json!({"status": "running", "type": "mock", "features": ["sdxl"]}))
        .collect();
    if state
        .loading_lists_remaining
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
    {
        backends.push(json!({"status": "loading", "type": "mock", "features": []}));
    }
    Json(json!({"backends": backends}))
}

fn peer_image() -> String {
    ImagePayload::from_png_bytes(b"peer image").data_uri
}

async fn generate_stream(
    State(state): State<Arc<PeerState>>,
    Json(body): Json<Value>,
) -> Response {
    if !state.stream_enabled {
        return StatusCode::NOT_FOUND.into_response();
    }
    state.generate_calls.fetch_add(1, Ordering::SeqCst);
    if state.expire_next_generate.swap(false, Ordering::SeqCst) {
        if let Some(sid) = body.get("session_id").and_then(|v| v.as_str()) {
            state.sessions.lock().remove(sid);
        }
        return "{\"error_id\": \"invalid_session_id\"}\n".into_response();
    }
    if !state.session_valid(&body) {
        return "{\"error_id\": \"invalid_session_id\"}\n".into_response();
    }
    let frames = format!(
        "{}\n{}\n",
        json!({"gen_progress": {"percent": 50}}),
        json!({"image": peer_image()}),
    );
    frames.into_response()
}

async fn generate_unary(
    State(state): State<Arc<PeerState>>,
    Json(body): Json<Value>,
) -> Json<Value> {
    state.generate_calls.fetch_add(1, Ordering::SeqCst);
    if !state.session_valid(&body) {
        return Json(json!({"error_id": "invalid_session_id"}));
    }
    Json(json!({"images": [peer_image()]}))
}

/// Serve the mock peer on a random local port, returning its base address.
async fn serve_peer(state: Arc<PeerState>) -> String {
    let app = Router::new()
        .route("/session/new", post(session_new))
        .route("/backends/list", post(backends_list))
        .route("/generate-stream", post(generate_stream))
        .route("/generate", post(generate_unary))
        .with_state(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind mock peer");
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve mock peer");
    });
    format!("http://{addr}")
}

fn test_config() -> DispatchConfig {
    DispatchConfig {
        loading_poll_millis: 50,
        idle_probe_secs: 1,
        ..DispatchConfig::default()
    }
}

fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(2))
        .build()
        .unwrap()
}

async fn wait_for_status(record: &Arc<WorkerRecord>, status: WorkerStatus) {
    for _ in 0..200 {
        if record.status() == status {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!(
        "worker {} never reached {status}, stuck at {}",
        record.id(),
        record.status()
    );
}

async fn wait_for_shadows(driver: &Arc<FederationDriver>, count: usize) {
    for _ in 0..200 {
        if driver.shadow_ids().await.len() == count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!(
        "expected {count} shadows, have {}",
        driver.shadow_ids().await.len()
    );
}

#[tokio::test]
async fn generation_flows_through_peer() {
    let peer = PeerState::new("peer-1", 1);
    let address = serve_peer(peer.clone()).await;

    let dispatcher = Dispatcher::new(test_config());
    let (record, _driver) = FederationDriver::register(
        &dispatcher,
        FederationConfig {
            address,
            allow_idle: false,
            over_queue: 0,
        },
        http_client(),
    )
    .unwrap();
    wait_for_status(&record, WorkerStatus::Running).await;
    assert!(record.supported_features().contains("sdxl"));

    let pipeline = GenerationPipeline::new(dispatcher.clone());
    let claim = Claim::new(dispatcher.cancellation_token());
    let (emit, _updates) = mpsc::unbounded_channel();
    let hooks = CountingHooks::default();

    let report = pipeline
        .run(
            &GenerationRequest::new("local").with_feature("sdxl"),
            "batch-1",
            &claim,
            &emit,
            &hooks,
            Duration::from_secs(5),
        )
        .await
        .unwrap();

    assert_eq!(report.num_generated, 1);
    assert_eq!(hooks.saved.load(Ordering::SeqCst), 1);
    assert!(claim.is_complete());
}

#[tokio::test]
async fn expired_session_recovers_with_exactly_one_retry() {
    let peer = PeerState::new("peer-1", 1);
    let address = serve_peer(peer.clone()).await;

    let dispatcher = Dispatcher::new(test_config());
    let (record, _driver) = FederationDriver::register(
        &dispatcher,
        FederationConfig {
            address,
            allow_idle: false,
            over_queue: 0,
        },
        http_client(),
    )
    .unwrap();
    wait_for_status(&record, WorkerStatus::Running).await;
    let sessions_after_init = peer.session_count.load(Ordering::SeqCst);
    peer.expire_next_generate.store(true, Ordering::SeqCst);

    let pipeline = GenerationPipeline::new(dispatcher.clone());
    let claim = Claim::new(dispatcher.cancellation_token());
    let (emit, _updates) = mpsc::unbounded_channel();
    let hooks = CountingHooks::default();

    let report = pipeline
        .run(
            &GenerationRequest::new("local"),
            "batch-1",
            &claim,
            &emit,
            &hooks,
            Duration::from_secs(5),
        )
        .await
        .unwrap();

    assert_eq!(report.num_generated, 1);
    assert!(claim.is_complete());
    // exactly one re-session and one retried generate
    assert_eq!(
        peer.session_count.load(Ordering::SeqCst),
        sessions_after_init + 1
    );
    assert_eq!(peer.generate_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn loop_detection_fails_init_without_retry_storm() {
    let dispatcher = Dispatcher::new(test_config());
    // the peer claims to be us
    let peer = PeerState::new(dispatcher.server_id(), 3);
    let address = serve_peer(peer.clone()).await;

    let (record, driver) = FederationDriver::register(
        &dispatcher,
        FederationConfig {
            address,
            allow_idle: false,
            over_queue: 1,
        },
        http_client(),
    )
    .unwrap();
    wait_for_status(&record, WorkerStatus::Errored).await;

    assert!(driver.shadow_ids().await.is_empty());
    assert_eq!(dispatcher.snapshot().len(), 1);
    // no retry storm: settle and confirm the session count stays put
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(peer.session_count.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn loop_detection_parks_idle_when_allowed() {
    let dispatcher = Dispatcher::new(test_config());
    let peer = PeerState::new(dispatcher.server_id(), 1);
    let address = serve_peer(peer.clone()).await;

    let (record, driver) = FederationDriver::register(
        &dispatcher,
        FederationConfig {
            address,
            allow_idle: true,
            over_queue: 0,
        },
        http_client(),
    )
    .unwrap();
    wait_for_status(&record, WorkerStatus::Idle).await;
    assert!(driver.shadow_ids().await.is_empty());
}

#[tokio::test]
async fn shadow_set_tracks_peer_count_and_trims_from_front() {
    let peer = PeerState::new("peer-1", 3);
    let address = serve_peer(peer.clone()).await;

    let dispatcher = Dispatcher::new(test_config());
    let (record, driver) = FederationDriver::register(
        &dispatcher,
        FederationConfig {
            address,
            allow_idle: false,
            over_queue: 1,
        },
        http_client(),
    )
    .unwrap();
    wait_for_status(&record, WorkerStatus::Running).await;

    // target = 3 - 1 + 1
    wait_for_shadows(&driver, 3).await;
    let before = driver.shadow_ids().await;
    assert_eq!(dispatcher.snapshot().len(), 4);
    for id in &before {
        let shadow = dispatcher.get(id).unwrap();
        assert!(!shadow.is_real());
        assert_eq!(shadow.status(), WorkerStatus::Running);
    }

    // peer shrinks to one running sub-worker; target = 1 - 1 + 1
    peer.count_running.store(1, Ordering::SeqCst);
    driver.refresh().await.unwrap();

    let after = driver.shadow_ids().await;
    assert_eq!(after.len(), 1);
    // extras were deleted from the front of the sequence
    assert_eq!(after[0], before[2]);
    assert_eq!(dispatcher.snapshot().len(), 2);
}

#[tokio::test]
async fn init_waits_out_loading_peers() {
    let peer = PeerState::new("peer-1", 1);
    peer.loading_lists_remaining.store(2, Ordering::SeqCst);
    let address = serve_peer(peer.clone()).await;

    let dispatcher = Dispatcher::new(test_config());
    let (record, _driver) = FederationDriver::register(
        &dispatcher,
        FederationConfig {
            address,
            allow_idle: false,
            over_queue: 0,
        },
        http_client(),
    )
    .unwrap();

    wait_for_status(&record, WorkerStatus::Running).await;
    // two loading responses plus the final clean list
    assert!(peer.list_calls.load(Ordering::SeqCst) >= 3);
}

#[tokio::test]
async fn unreachable_peer_parks_idle_when_allowed() {
    let dispatcher = Dispatcher::new(test_config());
    let (record, driver) = FederationDriver::register(
        &dispatcher,
        FederationConfig {
            // nothing listens here
            address: "http://127.0.0.1:9".to_string(),
            allow_idle: true,
            over_queue: 0,
        },
        http_client(),
    )
    .unwrap();

    wait_for_status(&record, WorkerStatus::Idle).await;
    assert!(driver.shadow_ids().await.is_empty());

    // the matcher never hands out an idle worker
    let claim = Claim::new(dispatcher.cancellation_token());
    let err = dispatcher
        .acquire(|_| true, None, Duration::from_millis(100), &claim, || {})
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::Timeout));
}

#[tokio::test]
async fn falls_back_to_unary_generate() {
    let peer = Arc::new(PeerState {
        server_id: "peer-1".to_string(),
        sessions: Mutex::new(HashSet::new()),
        session_count: AtomicU32::new(0),
        count_running: AtomicU32::new(1),
        loading_lists_remaining: AtomicU32::new(0),
        expire_next_generate: AtomicBool::new(false),
        list_calls: AtomicU32::new(0),
        generate_calls: AtomicU32::new(0),
        stream_enabled: false,
    });
    let address = serve_peer(peer.clone()).await;

    let dispatcher = Dispatcher::new(test_config());
    let (record, _driver) = FederationDriver::register(
        &dispatcher,
        FederationConfig {
            address,
            allow_idle: false,
            over_queue: 0,
        },
        http_client(),
    )
    .unwrap();
    wait_for_status(&record, WorkerStatus::Running).await;

    let pipeline = GenerationPipeline::new(dispatcher.clone());
    let claim = Claim::new(dispatcher.cancellation_token());
    let (emit, _updates) = mpsc::unbounded_channel();
    let hooks = CountingHooks::default();

    let report = pipeline
        .run(
            &GenerationRequest::new("local"),
            "batch-1",
            &claim,
            &emit,
            &hooks,
            Duration::from_secs(5),
        )
        .await
        .unwrap();

    assert_eq!(report.num_generated, 1);
    assert!(claim.is_complete());
}
