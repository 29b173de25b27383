/*
 * SPDX-FileCopyrightText: Copyright 2024 LG Electronics Inc.
 * SPDX-License-Identifier: Apache-2.0
 */

//! Logging setup for the control plane.

use anyhow::{anyhow, Result};
use tracing_subscriber::EnvFilter;

/// Workspace crates whose spans follow the configured level; everything
/// else stays at `warn`.
const LOG_TARGETS: [&str; 2] = ["scheduler", "common"];

/// Initialize logging at the configured level. An explicit `RUST_LOG`
/// in the environment wins over the settings-driven directives.
pub fn init_logging(level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_directives(level)));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
        .map_err(|err| anyhow!("logging init failed: {err}"))
}

fn filter_directives(level: &str) -> String {
    let mut directives: Vec<String> = LOG_TARGETS
        .iter()
        .map(|target| format!("{}={}", target, level))
        .collect();
    directives.push(String::from("warn"));
    directives.join(",")
}
