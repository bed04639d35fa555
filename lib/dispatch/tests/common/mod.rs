// SPDX-FileCopyrightText: Copyright (c) 2025-2026 Easel Project Developers. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Shared test fixtures: a scriptable in-process worker driver and
//! recording session hooks.

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use easel_dispatch::error::DispatchError;
use easel_dispatch::{
    Dispatcher, GenerateOutcome, GenerationRequest, GenerationUpdate, ImagePayload, SessionHooks,
    WorkerDriver, WorkerId, WorkerRecord, WorkerSpec, WorkerStatus,
};

/// How a [`MockDriver`] behaves on generate.
#[derive(Debug, Clone)]
pub enum Behavior {
    /// Emit progress and `images` images, then complete.
    Instant { images: u32 },
    /// Hold for `hold`, then emit `images` images. Honors cancellation.
    HoldThenComplete { hold: Duration, images: u32 },
    /// Never emit anything; wait for cancellation.
    BlockUntilCancelled,
}

pub struct MockDriver {
    pub features: Vec<String>,
    pub behavior: Behavior,
    pub load_calls: AtomicU32,
    pub generate_calls: AtomicU32,
    pub loaded: Mutex<Option<String>>,
}

impl MockDriver {
    pub fn new(features: &[&str], behavior: Behavior) -> Arc<Self> {
        Arc::new(Self {
            features: features.iter().map(|s| s.to_string()).collect(),
            behavior,
            load_calls: AtomicU32::new(0),
            generate_calls: AtomicU32::new(0),
            loaded: Mutex::new(None),
        })
    }
}

#[async_trait]
impl WorkerDriver for MockDriver {
    fn driver_type(&self) -> &str {
        "mock"
    }

    async fn init(&self) -> anyhow::Result<WorkerStatus> {
        Ok(WorkerStatus::Running)
    }

    async fn shutdown(&self) {}

    async fn load_model(&self, model_id: &str) -> anyhow::Result<bool> {
        self.load_calls.fetch_add(1, Ordering::SeqCst);
        *self.loaded.lock() = Some(model_id.to_string());
        Ok(true)
    }

    async fn generate(
        &self,
        _request: &GenerationRequest,
        _batch_id: &str,
        sink: mpsc::Sender<GenerationUpdate>,
        cancel: CancellationToken,
    ) -> Result<GenerateOutcome, DispatchError> {
        self.generate_calls.fetch_add(1, Ordering::SeqCst);
        let emit_images = |count: u32, sink: mpsc::Sender<GenerationUpdate>| async move {
            for step in 0..count {
                let _ = sink
                    .send(GenerationUpdate::Progress(json!({"step": step})))
                    .await;
                let _ = sink
                    .send(GenerationUpdate::Image(ImagePayload::from_png_bytes(
                        b"mock image",
                    )))
                    .await;
            }
        };
        match &self.behavior {
            Behavior::Instant { images } => {
                emit_images(*images, sink).await;
                Ok(GenerateOutcome::Complete)
            }
            Behavior::HoldThenComplete { hold, images } => {
                tokio::select! {
                    _ = tokio::time::sleep(*hold) => {
                        emit_images(*images, sink).await;
                        Ok(GenerateOutcome::Complete)
                    }
                    _ = cancel.cancelled() => Err(DispatchError::Cancelled),
                }
            }
            Behavior::BlockUntilCancelled => {
                cancel.cancelled().await;
                Err(DispatchError::Cancelled)
            }
        }
    }

    fn supported_features(&self) -> HashSet<String> {
        self.features.iter().cloned().collect()
    }
}

/// Register a Running mock worker with a fixed id and current model.
pub fn add_worker(
    dispatcher: &Arc<Dispatcher>,
    id: &str,
    driver: Arc<MockDriver>,
    current_model: Option<&str>,
) -> Arc<WorkerRecord> {
    let mut spec = WorkerSpec::real(driver, serde_json::Value::Null);
    spec.id = Some(WorkerId::from(id));
    let record = dispatcher
        .register_ready(spec, WorkerStatus::Running)
        .expect("register mock worker");
    record.set_current_model(current_model.map(|m| m.to_string()));
    record
}

/// Session hooks that count saves and stamp predictable metadata.
#[derive(Default)]
pub struct CountingHooks {
    pub saved: AtomicU32,
}

#[async_trait]
impl SessionHooks for CountingHooks {
    async fn apply_metadata(
        &self,
        image: ImagePayload,
        request: &GenerationRequest,
        index: u32,
    ) -> anyhow::Result<(ImagePayload, String)> {
        Ok((image, format!("user={} index={index}", request.user_id)))
    }

    async fn save_image(&self, _image: ImagePayload, _metadata: String) -> anyhow::Result<()> {
        self.saved.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
