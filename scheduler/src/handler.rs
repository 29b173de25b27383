/*
 * SPDX-FileCopyrightText: Copyright 2024 LG Electronics Inc.
 * SPDX-License-Identifier: Apache-2.0
 */

//! Timeout sweeps that bound stuck state transitions.
//!
//! Slow boots are given up on, slow terminations are force-killed, and
//! terminated records are swept out of the store. Unplaced `pending`
//! instances are exempt: waiting for a worker is not being stuck.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::Duration;
use tracing::{info, warn};

use common::spec::{Instance, InstanceState};

use crate::store::{InstanceStore, InstanceWriter};
use crate::util::RecurringTask;
use crate::worker::WorkerManager;

const SWEEP_INTERVAL: Duration = Duration::from_secs(10);

/// Instances stuck mid-boot: dispatch or re-image was requested but the
/// worker has not delivered within the threshold.
fn stuck_booting(
    instances: &[Instance],
    now: DateTime<Utc>,
    threshold: ChronoDuration,
) -> Vec<Instance> {
    instances
        .iter()
        .filter(|inst| {
            matches!(
                inst.state,
                InstanceState::PendingDispatch | InstanceState::Migrating
            ) && now - inst.changed_at >= threshold
        })
        .cloned()
        .collect()
}

/// Instances stuck shutting down past the threshold.
fn stuck_stopping(
    instances: &[Instance],
    now: DateTime<Utc>,
    threshold: ChronoDuration,
) -> Vec<Instance> {
    instances
        .iter()
        .filter(|inst| {
            inst.state == InstanceState::ShuttingDown && now - inst.changed_at >= threshold
        })
        .cloned()
        .collect()
}

/// Gives up on instances that do not boot quickly enough by requesting
/// their shutdown.
pub struct SlowBootHandler {
    store: Arc<InstanceStore>,
    threshold: ChronoDuration,
    leadership: watch::Receiver<bool>,
}

impl SlowBootHandler {
    pub fn new(
        store: Arc<InstanceStore>,
        threshold_secs: u64,
        leadership: watch::Receiver<bool>,
    ) -> Self {
        SlowBootHandler {
            store,
            threshold: ChronoDuration::seconds(threshold_secs as i64),
            leadership,
        }
    }

    pub fn start(self) -> RecurringTask {
        let this = Arc::new(self);
        RecurringTask::spawn(SWEEP_INTERVAL, move || {
            let this = Arc::clone(&this);
            async move { this.tick().await }
        })
    }

    pub async fn tick(&self) {
        if !*self.leadership.borrow() {
            return;
        }
        let snapshot = self.store.snapshot().await;
        for mut inst in stuck_booting(&snapshot, Utc::now(), self.threshold) {
            info!(
                instance = %inst.name,
                "no boot in {}s, giving up",
                self.threshold.num_seconds()
            );
            inst.state = InstanceState::ShuttingDown;
            if let Err(err) = self.store.update(&mut inst).await {
                warn!(instance = %inst.name, "failed to request shutdown: {err}");
            }
        }
    }
}

/// Force-kills instances that do not shut down quickly enough: a
/// best-effort container delete plus removal from the store.
pub struct SlowTermHandler {
    store: Arc<InstanceStore>,
    workers: Arc<WorkerManager>,
    threshold: ChronoDuration,
    leadership: watch::Receiver<bool>,
}

impl SlowTermHandler {
    pub fn new(
        store: Arc<InstanceStore>,
        workers: Arc<WorkerManager>,
        threshold_secs: u64,
        leadership: watch::Receiver<bool>,
    ) -> Self {
        SlowTermHandler {
            store,
            workers,
            threshold: ChronoDuration::seconds(threshold_secs as i64),
            leadership,
        }
    }

    pub fn start(self) -> RecurringTask {
        let this = Arc::new(self);
        RecurringTask::spawn(SWEEP_INTERVAL, move || {
            let this = Arc::clone(&this);
            async move { this.tick().await }
        })
    }

    pub async fn tick(&self) {
        if !*self.leadership.borrow() {
            return;
        }
        let snapshot = self.store.snapshot().await;
        for inst in stuck_stopping(&snapshot, Utc::now(), self.threshold) {
            info!(
                instance = %inst.name,
                "no stop in {}s, force killing",
                self.threshold.num_seconds()
            );
            if let Err(err) = self.workers.terminate(&inst).await {
                warn!(instance = %inst.name, "force kill container delete failed: {err}");
            }
            if let Err(err) = self.store.delete(&inst).await {
                warn!(instance = %inst.name, "failed to remove record: {err}");
            }
        }
    }
}

/// Sweeps terminated records out of the store. `lost` records are left
/// for the operator.
pub struct RemoveTerminatedHandler {
    store: Arc<InstanceStore>,
    interval: Duration,
    leadership: watch::Receiver<bool>,
}

impl RemoveTerminatedHandler {
    pub fn new(
        store: Arc<InstanceStore>,
        interval_secs: u64,
        leadership: watch::Receiver<bool>,
    ) -> Self {
        RemoveTerminatedHandler {
            store,
            interval: Duration::from_secs(interval_secs),
            leadership,
        }
    }

    pub fn start(self) -> RecurringTask {
        let interval = self.interval;
        let this = Arc::new(self);
        RecurringTask::spawn(interval, move || {
            let this = Arc::clone(&this);
            async move { this.tick().await }
        })
    }

    pub async fn tick(&self) {
        if !*self.leadership.borrow() {
            return;
        }
        for inst in self.store.terminated().await {
            info!(instance = %inst.name, "removing terminated instance");
            if let Err(err) = self.store.delete(&inst).await {
                warn!(instance = %inst.name, "failed to remove record: {err}");
            }
        }
    }
}
