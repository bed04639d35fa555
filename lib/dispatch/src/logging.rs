// SPDX-FileCopyrightText: Copyright (c) 2025-2026 Easel Project Developers. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Logging setup.
//!
//! Filters come from the `EASEL_LOG` environment variable (default `info`).
//! Output is human-readable by default; set `EASEL_LOG_JSONL=1` for JSON
//! lines.

use std::sync::Once;

use tracing_subscriber::{fmt, EnvFilter};

/// ENV used to set the log filter.
const FILTER_ENV: &str = "EASEL_LOG";

/// ENV enabling JSONL output.
const JSONL_ENV: &str = "EASEL_LOG_JSONL";

/// Default log level.
const DEFAULT_FILTER_LEVEL: &str = "info";

static INIT: Once = Once::new();

/// Initialize the global tracing subscriber. Safe to call more than once;
/// only the first call takes effect.
pub fn init() {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_env(FILTER_ENV)
            .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER_LEVEL));

        let jsonl = std::env::var(JSONL_ENV).map(|v| v == "1").unwrap_or(false);
        if jsonl {
            fmt()
                .with_env_filter(filter)
                .json()
                .with_current_span(false)
                .init();
        } else {
            fmt().with_env_filter(filter).init();
        }
    });
}
