// SPDX-FileCopyrightText: Copyright (c) 2025-2026 Easel Project Developers. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Easel dispatch core.
//!
//! The subsystem between the request surface and the generation workers:
//! it keeps a pool of heterogeneous workers initialized and healthy,
//! matches each request's capability filter against the pool, reserves at
//! most one generation per worker, streams progress back to callers, and
//! mirrors federated peer instances into the pool as ordinary workers.

pub use anyhow::{Context as ErrorContext, Error, Result};

pub mod claim;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod federation;
pub mod logging;
pub mod pipeline;
pub mod protocols;
pub mod worker;

pub use claim::{Claim, ClaimKind};
pub use config::{DispatchConfig, FederationConfig};
pub use dispatcher::{Dispatcher, WorkerAccess};
pub use error::DispatchError;
pub use pipeline::{GenerationPipeline, GenerationReport, SessionHooks};
pub use protocols::{GenerateOutcome, GenerationRequest, GenerationUpdate, ImagePayload};
pub use tokio_util::sync::CancellationToken;
pub use worker::{WorkerDriver, WorkerId, WorkerRecord, WorkerSpec, WorkerStatus};
