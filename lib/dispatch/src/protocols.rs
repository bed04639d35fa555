// SPDX-FileCopyrightText: Copyright (c) 2025-2026 Easel Project Developers. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Request and streaming-update types shared by drivers, the dispatcher and
//! the pipeline.

use std::collections::HashSet;

use base64::prelude::*;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single text-to-image generation request as the core sees it.
///
/// The dispatch core never interprets `params` beyond forwarding it; the
/// capability tags and the preferred model are the only fields it reads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationRequest {
    /// Opaque caller identity, assigned by the (out of scope) auth surface.
    pub user_id: String,

    /// Capability tags the serving worker must advertise.
    #[serde(default)]
    pub required_features: HashSet<String>,

    /// Model identifier used to break ties between otherwise equal workers.
    #[serde(default)]
    pub preferred_model: Option<String>,

    /// Number of images requested in this batch.
    #[serde(default = "default_images")]
    pub images: u32,

    /// Everything else: sampler settings, prompt, dimensions, ... forwarded
    /// verbatim to the worker.
    #[serde(default)]
    pub params: Value,
}

fn default_images() -> u32 {
    1
}

impl GenerationRequest {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            required_features: HashSet::new(),
            preferred_model: None,
            images: 1,
            params: Value::Null,
        }
    }

    pub fn with_feature(mut self, tag: impl Into<String>) -> Self {
        self.required_features.insert(tag.into());
        self
    }

    pub fn with_preferred_model(mut self, model: impl Into<String>) -> Self {
        self.preferred_model = Some(model.into());
        self
    }
}

/// One finished image as produced by a worker, carried as a data URI so it
/// can cross the federation wire unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImagePayload {
    pub data_uri: String,
}

impl ImagePayload {
    pub fn from_png_bytes(bytes: &[u8]) -> Self {
        Self {
            data_uri: format!("data:image/png;base64,{}", BASE64_STANDARD.encode(bytes)),
        }
    }

    pub fn from_data_uri(data_uri: impl Into<String>) -> Self {
        Self {
            data_uri: data_uri.into(),
        }
    }

    /// Decode the payload back to raw bytes. Fails on a malformed URI.
    pub fn bytes(&self) -> anyhow::Result<Bytes> {
        let encoded = self
            .data_uri
            .split_once(";base64,")
            .map(|(_, b64)| b64)
            .unwrap_or(self.data_uri.as_str());
        Ok(Bytes::from(BASE64_STANDARD.decode(encoded)?))
    }
}

/// Items a driver pushes into its sink while a generation is running.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationUpdate {
    /// Opaque progress object, forwarded to the caller as `{gen_progress: ...}`.
    Progress(Value),
    /// A finished image.
    Image(ImagePayload),
}

/// Terminal result of a driver's generate call.
///
/// Redirect is a result variant rather than an error: the driver is asking
/// the pipeline to re-acquire a different worker and re-issue the same
/// logical generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerateOutcome {
    Complete,
    Redirect,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_payload_round_trips_bytes() {
        let payload = ImagePayload::from_png_bytes(b"not really a png");
        assert!(payload.data_uri.starts_with("data:image/png;base64,"));
        assert_eq!(payload.bytes().unwrap().as_ref(), b"not really a png");
    }

    #[test]
    fn request_defaults_apply_on_deserialize() {
        let req: GenerationRequest =
            serde_json::from_str(r#"{"user_id": "local"}"#).unwrap();
        assert_eq!(req.images, 1);
        assert!(req.required_features.is_empty());
        assert!(req.preferred_model.is_none());
    }
}
