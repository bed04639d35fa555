// SPDX-FileCopyrightText: Copyright (c) 2025-2026 Easel Project Developers. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Per-caller claim ledger.
//!
//! A [`Claim`] is a caller's bag of outstanding dispatcher resources: queue
//! waits, live generations and still-pending sub-generations. The ledger
//! enforces no ordering between the three kinds; the pipeline orders its own
//! `extend`/`complete` pairs. A claim is complete only when all three
//! counters are back to zero.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use tokio_util::sync::CancellationToken;

use crate::error::DispatchError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimKind {
    /// Outstanding waits for a worker.
    Waits,
    /// In-flight generations currently holding a worker.
    Live,
    /// Pending sub-generations (a batch may fan out, a redirect re-queues).
    Gens,
}

#[derive(Debug)]
pub struct Claim {
    waits: AtomicUsize,
    live: AtomicUsize,
    gens: AtomicUsize,
    cancel: CancellationToken,
    session_closed: AtomicBool,
}

impl Claim {
    /// Create a claim whose cancel token is a child of `parent` so that the
    /// global shutdown signal cancels every outstanding claim.
    pub fn new(parent: &CancellationToken) -> Self {
        Self {
            waits: AtomicUsize::new(0),
            live: AtomicUsize::new(0),
            gens: AtomicUsize::new(0),
            cancel: parent.child_token(),
            session_closed: AtomicBool::new(false),
        }
    }

    fn counter(&self, kind: ClaimKind) -> &AtomicUsize {
        match kind {
            ClaimKind::Waits => &self.waits,
            ClaimKind::Live => &self.live,
            ClaimKind::Gens => &self.gens,
        }
    }

    /// Increase one of the counters. Forbidden once the claim is cancelled.
    pub fn extend(&self, kind: ClaimKind, n: usize) -> Result<(), DispatchError> {
        if self.should_cancel() {
            return Err(DispatchError::Cancelled);
        }
        self.counter(kind).fetch_add(n, Ordering::SeqCst);
        Ok(())
    }

    /// Decrease one of the counters. Underflow is a pipeline bug; release
    /// builds clamp to zero rather than wrap.
    pub fn complete(&self, kind: ClaimKind, n: usize) {
        let counter = self.counter(kind);
        let mut current = counter.load(Ordering::SeqCst);
        loop {
            debug_assert!(current >= n, "claim counter underflow: {:?}", kind);
            let next = current.saturating_sub(n);
            match counter.compare_exchange(current, next, Ordering::SeqCst, Ordering::SeqCst) {
                Ok(_) => return,
                Err(observed) => current = observed,
            }
        }
    }

    /// Set the cancel token. Wakes any suspended acquire held under this
    /// claim and stops the driver stream it is routed to.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Mark the owning session as torn down. Observed by `should_cancel`.
    pub fn close_session(&self) {
        self.session_closed.store(true, Ordering::SeqCst);
    }

    pub fn should_cancel(&self) -> bool {
        self.cancel.is_cancelled() || self.session_closed.load(Ordering::SeqCst)
    }

    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn waits(&self) -> usize {
        self.waits.load(Ordering::SeqCst)
    }

    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub fn gens(&self) -> usize {
        self.gens.load(Ordering::SeqCst)
    }

    /// True once every counter is back to zero.
    pub fn is_complete(&self) -> bool {
        self.waits() == 0 && self.live() == 0 && self.gens() == 0
    }
}
