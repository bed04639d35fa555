// SPDX-FileCopyrightText: Copyright (c) 2025-2026 Easel Project Developers. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Per-request generation lifecycle.
//!
//! Phase order: pre-generate hook, acquire, stream generate, per-image
//! handling, redirect, release. Every path through [`GenerationPipeline::run`]
//! balances the claim's counters and releases any held worker access.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::claim::{Claim, ClaimKind};
use crate::dispatcher::{Dispatcher, PostImageEvent, PreGenerateEvent, WorkerAccess};
use crate::error::DispatchError;
use crate::protocols::{GenerateOutcome, GenerationRequest, GenerationUpdate, ImagePayload};

/// Caller-side updates stream. Unbounded so progress can be forwarded from
/// synchronous contexts without backpressure stalling a worker.
pub type UpdateSender = mpsc::UnboundedSender<Value>;

/// Per-session collaborators the pipeline needs to finish an image: the
/// metadata embedder and the durable store write. Both live outside the
/// core.
#[async_trait]
pub trait SessionHooks: Send + Sync {
    /// Re-encode `image` with embedded metadata, returning the image to
    /// store and the metadata string describing it.
    async fn apply_metadata(
        &self,
        image: ImagePayload,
        request: &GenerationRequest,
        index: u32,
    ) -> anyhow::Result<(ImagePayload, String)>;

    /// Write the finished image to the durable store.
    async fn save_image(&self, image: ImagePayload, metadata: String) -> anyhow::Result<()>;
}

#[derive(Debug, Clone)]
pub struct GenerationReport {
    /// Accepted images only; refused ones do not count.
    pub num_generated: u32,
    /// `"{prep:.2} (prep) and {gen:.2} (gen) seconds"`, per image when the
    /// batch produced more than one.
    pub timing: String,
}

pub struct GenerationPipeline {
    dispatcher: Arc<Dispatcher>,
}

impl GenerationPipeline {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self { dispatcher }
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Run one request to completion. `timeout` bounds the total time spent
    /// waiting for workers, redirect chains included.
    pub async fn run(
        &self,
        request: &GenerationRequest,
        batch_id: &str,
        claim: &Claim,
        emit: &UpdateSender,
        session: &dyn SessionHooks,
        timeout: Duration,
    ) -> Result<GenerationReport, DispatchError> {
        // Pre-generate hook runs before any worker is claimed; a refusal
        // aborts with the listener's message.
        self.dispatcher
            .fire_pre_generate(&PreGenerateEvent { request, batch_id })?;

        claim.extend(ClaimKind::Gens, 1)?;
        let mut gens_open: usize = 1;
        let result = self
            .run_attempts(request, batch_id, claim, emit, session, timeout, &mut gens_open)
            .await;
        // the exit path balances every gens extension, redirects included
        claim.complete(ClaimKind::Gens, gens_open);

        if let Err(err) = &result {
            match err {
                DispatchError::Cancelled => {
                    tracing::debug!(batch = batch_id, "generation cancelled")
                }
                other => {
                    tracing::error!(batch = batch_id, error = ?other, "generation failed")
                }
            }
        }
        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_attempts(
        &self,
        request: &GenerationRequest,
        batch_id: &str,
        claim: &Claim,
        emit: &UpdateSender,
        session: &dyn SessionHooks,
        timeout: Duration,
        gens_open: &mut usize,
    ) -> Result<GenerationReport, DispatchError> {
        let started = Instant::now();
        let deadline = started + timeout;
        let mut num_generated = 0u32;

        // Redirect re-enters this loop in tail position; the remaining
        // deadline is the only bound on the chain length.
        loop {
            claim.extend(ClaimKind::Waits, 1)?;
            let _ = emit.send(json!({"status": "waiting_for_backend"}));
            let acquired = self
                .dispatcher
                .acquire(
                    |record| request.required_features.is_subset(&record.supported_features()),
                    request.preferred_model.as_deref(),
                    deadline.saturating_duration_since(Instant::now()),
                    claim,
                    || {
                        let _ = emit.send(json!({"status": "loading_model"}));
                    },
                )
                .await;
            claim.complete(ClaimKind::Waits, 1);
            let access = acquired?;

            self.swap_model_if_needed(request, &access).await?;
            let prep_time = started.elapsed();

            claim.extend(ClaimKind::Live, 1)?;
            let gen_started = Instant::now();
            let outcome = self
                .drive_generation(request, batch_id, &access, emit, session, &mut num_generated)
                .await;
            claim.complete(ClaimKind::Live, 1);
            let gen_time = gen_started.elapsed();

            match outcome {
                Ok(GenerateOutcome::Complete) => {
                    access.record().record_generation(gen_time);
                    drop(access);
                    let per_image = num_generated.max(1) as f64;
                    let timing = format!(
                        "{:.2} (prep) and {:.2} (gen) seconds",
                        prep_time.as_secs_f64() / per_image,
                        gen_time.as_secs_f64() / per_image,
                    );
                    tracing::info!(batch = batch_id, images = num_generated, timing = %timing, "generation complete");
                    return Ok(GenerationReport {
                        num_generated,
                        timing,
                    });
                }
                Ok(GenerateOutcome::Redirect) => {
                    tracing::debug!(batch = batch_id, worker = %access.record().id(), "worker redirected request");
                    access.release();
                    claim.extend(ClaimKind::Gens, 1)?;
                    *gens_open += 1;
                }
                Err(err) => {
                    let stalled = access.is_stalled();
                    drop(access);
                    if stalled {
                        return Err(DispatchError::BackendStalled);
                    }
                    return Err(err);
                }
            }
        }
    }

    async fn swap_model_if_needed(
        &self,
        request: &GenerationRequest,
        access: &WorkerAccess,
    ) -> Result<(), DispatchError> {
        let Some(model) = request.preferred_model.as_deref() else {
            return Ok(());
        };
        if access.record().current_model().as_deref() == Some(model) {
            return Ok(());
        }
        match access.driver().load_model(model).await {
            Ok(true) => {
                access.record().set_current_model(Some(model.to_string()));
                Ok(())
            }
            Ok(false) => {
                // worker declined the swap; generate with whatever is loaded
                tracing::warn!(worker = %access.record().id(), model, "worker declined model load");
                Ok(())
            }
            Err(err) => Err(DispatchError::internal(
                err.context(format!("loading model {model}")),
            )),
        }
    }

    async fn drive_generation(
        &self,
        request: &GenerationRequest,
        batch_id: &str,
        access: &WorkerAccess,
        emit: &UpdateSender,
        session: &dyn SessionHooks,
        num_generated: &mut u32,
    ) -> Result<GenerateOutcome, DispatchError> {
        let (tx, mut rx) = mpsc::channel::<GenerationUpdate>(16);
        let driver = access.driver();
        let cancel = access.cancel_token();
        let request_for_driver = request.clone();
        let batch = batch_id.to_string();
        let task = tokio::spawn(async move {
            driver
                .generate(&request_for_driver, &batch, tx, cancel)
                .await
        });

        let mut image_index = 0u32;
        let mut failure: Option<DispatchError> = None;
        while let Some(update) = rx.recv().await {
            access.touch();
            match update {
                GenerationUpdate::Progress(progress) => {
                    let _ = emit.send(json!({"gen_progress": progress}));
                }
                GenerationUpdate::Image(image) => {
                    let handled = self
                        .handle_image(
                            request,
                            batch_id,
                            image,
                            image_index,
                            emit,
                            session,
                            num_generated,
                        )
                        .await;
                    image_index += 1;
                    if let Err(err) = handled {
                        // stop the driver before the worker is released
                        failure = Some(err);
                        access.cancel_token().cancel();
                        break;
                    }
                }
            }
        }

        // closing the channel unblocks a driver that ignores cancellation
        drop(rx);
        let outcome = match task.await {
            Ok(outcome) => outcome,
            Err(join_err) => Err(DispatchError::internal(anyhow::anyhow!(
                "generate task failed: {join_err}"
            ))),
        };
        match failure {
            Some(err) => Err(err),
            None => outcome,
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn handle_image(
        &self,
        request: &GenerationRequest,
        batch_id: &str,
        image: ImagePayload,
        index: u32,
        emit: &UpdateSender,
        session: &dyn SessionHooks,
        num_generated: &mut u32,
    ) -> Result<(), DispatchError> {
        let accepted = self.dispatcher.fire_post_image(&PostImageEvent {
            request,
            batch_id,
            image: &image,
            index,
        })?;
        if !accepted {
            tracing::debug!(batch = batch_id, index, "image refused by listener");
            let _ = emit.send(json!({"discarded": index}));
            return Ok(());
        }

        let (image, metadata) = session
            .apply_metadata(image, request, index)
            .await
            .map_err(DispatchError::internal)?;
        let _ = emit.send(json!({"image": image.data_uri, "metadata": metadata}));
        session
            .save_image(image, metadata)
            .await
            .map_err(DispatchError::internal)?;
        *num_generated += 1;
        Ok(())
    }
}
