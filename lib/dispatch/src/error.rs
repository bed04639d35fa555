// SPDX-FileCopyrightText: Copyright (c) 2025-2026 Easel Project Developers. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Dispatch error taxonomy.
//!
//! These are the error values the pipeline matches on to decide what the
//! caller sees. Anything that is not one of the named kinds is wrapped as
//! [`DispatchError::Internal`] and logged with its full chain; the caller
//! only ever receives the generic message.

use thiserror::Error;

/// Message shown to callers when no worker became free before the deadline.
pub const OCCUPIED_MESSAGE: &str = "All backends are occupied.";

/// Message shown to callers for any internal failure.
pub const INTERNAL_MESSAGE: &str = "Something went wrong while generating images.";

#[derive(Debug, Error)]
pub enum DispatchError {
    /// A pre-generate listener or bad user input refused the request.
    #[error("{0}")]
    User(String),

    /// A post-generate listener issued a hard refusal.
    #[error("{0}")]
    UserData(String),

    /// The acquire deadline elapsed, queueing included.
    #[error("All backends are occupied.")]
    Timeout,

    /// The claim's cancel token fired or the process is shutting down.
    #[error("request cancelled")]
    Cancelled,

    /// The peer rejected our session token. Handled internally by the
    /// federation recovery wrapper; a second rejection becomes [`Self::Connection`].
    #[error("peer session is no longer valid")]
    SessionInvalid,

    /// Failed to reach or keep a connection to a federation peer.
    #[error("peer connection failed: {0}")]
    Connection(String),

    /// A worker held a claim without emitting progress for too long.
    #[error("backend stalled without reporting progress")]
    BackendStalled,

    #[error("Something went wrong while generating images.")]
    Internal(#[source] anyhow::Error),
}

impl DispatchError {
    /// The refusal string surfaced to the caller, or `None` when the error
    /// is swallowed silently (cancellation).
    pub fn user_message(&self) -> Option<String> {
        match self {
            DispatchError::User(msg) | DispatchError::UserData(msg) => Some(msg.clone()),
            DispatchError::Timeout => Some(OCCUPIED_MESSAGE.to_string()),
            DispatchError::Cancelled => None,
            DispatchError::SessionInvalid
            | DispatchError::Connection(_)
            | DispatchError::BackendStalled
            | DispatchError::Internal(_) => Some(INTERNAL_MESSAGE.to_string()),
        }
    }

    pub fn is_cancellation(&self) -> bool {
        matches!(self, DispatchError::Cancelled)
    }

    /// Wrap any error chain as an internal failure.
    pub fn internal(err: impl Into<anyhow::Error>) -> Self {
        DispatchError::Internal(err.into())
    }
}

impl From<anyhow::Error> for DispatchError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<DispatchError>() {
            Ok(dispatch) => dispatch,
            Err(err) => DispatchError::Internal(err),
        }
    }
}
