// SPDX-FileCopyrightText: Copyright (c) 2025-2026 Easel Project Developers. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Wire types for the peer federation protocol.
//!
//! Peers are instances of this same system. Every response may carry an
//! `error_id` instead of its payload; `invalid_session_id` is the one the
//! session-recovery wrapper reacts to.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::error::DispatchError;
use crate::protocols::GenerationRequest;

/// `error_id` value signalling that the peer no longer honors our session.
pub const INVALID_SESSION_ID: &str = "invalid_session_id";

#[derive(Debug, Deserialize)]
pub struct NewSessionResponse {
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub server_id: String,
    #[serde(default)]
    pub count_running: u32,
    #[serde(default)]
    pub error_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct BackendsListRequest<'a> {
    pub session_id: &'a str,
}

#[derive(Debug, Default, Deserialize)]
pub struct BackendsListResponse {
    #[serde(default)]
    pub backends: Vec<RemoteBackend>,
    #[serde(default)]
    pub error_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteBackend {
    pub status: RemoteStatus,
    #[serde(rename = "type")]
    pub backend_type: String,
    #[serde(default)]
    pub features: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemoteStatus {
    Disabled,
    Waiting,
    Loading,
    Idle,
    Running,
    Errored,
}

#[derive(Debug, Default, Deserialize)]
pub struct GenerateResponse {
    #[serde(default)]
    pub images: Vec<String>,
    #[serde(default)]
    pub error_id: Option<String>,
}

/// One JSON-lines frame of the streaming generate endpoint.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct StreamFrame {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gen_progress: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_id: Option<String>,
}

/// Body for both generate endpoints: the session envelope merged over the
/// caller's raw parameters. `donotsave` tells the peer we store the result
/// ourselves.
pub fn generate_body(session_id: &str, request: &GenerationRequest) -> Value {
    let mut body = match &request.params {
        Value::Object(map) => map.clone(),
        _ => Map::new(),
    };
    if let Some(model) = &request.preferred_model {
        body.entry("model".to_string())
            .or_insert_with(|| json!(model));
    }
    body.insert("session_id".to_string(), json!(session_id));
    body.insert("images".to_string(), json!(request.images));
    body.insert("donotsave".to_string(), json!(true));
    Value::Object(body)
}

/// Map a response's `error_id` onto the dispatch taxonomy.
pub fn check_error_id(error_id: &Option<String>) -> Result<(), DispatchError> {
    match error_id.as_deref() {
        None => Ok(()),
        Some(INVALID_SESSION_ID) => Err(DispatchError::SessionInvalid),
        Some(other) => Err(DispatchError::internal(anyhow::anyhow!(
            "peer reported error_id {other}"
        ))),
    }
}
