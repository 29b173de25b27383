/*
 * SPDX-FileCopyrightText: Copyright 2024 LG Electronics Inc.
 * SPDX-License-Identifier: Apache-2.0
 */

//! The periodic reconciliation loops: placement, dispatch, config
//! updates and termination.
//!
//! Each loop re-reads the instance store on every pass and never holds
//! state of its own; a pass that loses a race simply corrects itself on
//! the next one. All loops observe the leadership flag at the loop head
//! and stay quiet while this process is not the leader.

use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::time::Duration;
use tracing::{debug, info, warn};

use common::spec::{Instance, InstanceState};

use crate::health::HealthStore;
use crate::store::{InstanceStore, InstanceWriter};
use crate::util::{RecurringTask, TokenBucketRateLimiter};
use crate::worker::{ContainerInfo, WorkerManager};

use super::policy::PlacementPolicy;

const LOOP_INTERVAL: Duration = Duration::from_secs(3);
const RATE_WINDOW_SECS: u64 = 30;
const PLACEMENT_RATE: u32 = 100;
const DISPATCH_RATE: u32 = 10;

/// Binds unplaced instances to workers.
pub struct Scheduler {
    store: Arc<InstanceStore>,
    workers: Arc<WorkerManager>,
    policy: PlacementPolicy,
    limiter: Mutex<TokenBucketRateLimiter>,
    leadership: watch::Receiver<bool>,
}

impl Scheduler {
    pub fn new(
        store: Arc<InstanceStore>,
        workers: Arc<WorkerManager>,
        leadership: watch::Receiver<bool>,
    ) -> Self {
        Scheduler {
            store,
            workers,
            policy: PlacementPolicy,
            limiter: Mutex::new(TokenBucketRateLimiter::new(PLACEMENT_RATE, RATE_WINDOW_SECS)),
            leadership,
        }
    }

    pub fn start(self) -> RecurringTask {
        let this = Arc::new(self);
        RecurringTask::spawn(LOOP_INTERVAL, move || {
            let this = Arc::clone(&this);
            async move { this.tick().await }
        })
    }

    pub async fn tick(&self) {
        if !*self.leadership.borrow() {
            return;
        }
        let unassigned = self.store.unassigned().await;
        if unassigned.is_empty() {
            return;
        }
        let mut candidates = self.workers.candidates().await;

        for mut inst in unassigned {
            if !self.limiter.lock().await.check() {
                break;
            }
            let Some(chosen) = self.policy.select(&candidates, inst.placement.as_ref()) else {
                continue;
            };
            inst.state = InstanceState::PendingDispatch;
            inst.assigned_to = Some(chosen.clone());
            if let Err(err) = self.store.update(&mut inst).await {
                warn!(instance = %inst.name, "failed to record placement: {err}");
                continue;
            }
            debug!(instance = %inst.name, worker = %chosen, "placed");

            // Count the placement locally so one pass spreads a batch
            // instead of stacking it on the same worker.
            if let Some(candidate) = candidates.iter_mut().find(|c| c.name == chosen) {
                candidate.containers += 1;
            }
        }
    }
}

/// Realizes placed instances on their worker.
pub struct Dispatcher {
    store: Arc<InstanceStore>,
    workers: Arc<WorkerManager>,
    health: Arc<HealthStore>,
    limiter: Mutex<TokenBucketRateLimiter>,
    leadership: watch::Receiver<bool>,
}

impl Dispatcher {
    pub fn new(
        store: Arc<InstanceStore>,
        workers: Arc<WorkerManager>,
        health: Arc<HealthStore>,
        leadership: watch::Receiver<bool>,
    ) -> Self {
        Dispatcher {
            store,
            workers,
            health,
            limiter: Mutex::new(TokenBucketRateLimiter::new(DISPATCH_RATE, RATE_WINDOW_SECS)),
            leadership,
        }
    }

    pub fn start(self) -> RecurringTask {
        let this = Arc::new(self);
        RecurringTask::spawn(LOOP_INTERVAL, move || {
            let this = Arc::clone(&this);
            async move { this.tick().await }
        })
    }

    pub async fn tick(&self) {
        if !*self.leadership.borrow() {
            return;
        }
        for mut inst in self.store.pending_dispatch().await {
            let Some(worker) = inst.assigned_to.clone() else {
                warn!(instance = %inst.name, "pending-dispatch without a worker, back to pending");
                inst.state = InstanceState::Pending;
                if let Err(err) = self.store.update(&mut inst).await {
                    warn!(instance = %inst.name, "failed to reset: {err}");
                }
                continue;
            };

            // A retried dispatch may already have a container; adopt it
            // instead of creating a duplicate.
            if self.workers.container_for(&inst).await.is_some() {
                debug!(instance = %inst.name, "already realized, marking running");
                inst.state = InstanceState::Running;
                if let Err(err) = self.store.update(&mut inst).await {
                    warn!(instance = %inst.name, "failed to mark running: {err}");
                }
                continue;
            }

            if !self.health.check(&worker) {
                debug!(instance = %inst.name, worker = %worker, "worker not confirmed alive, holding dispatch");
                continue;
            }
            if !self.limiter.lock().await.check() {
                break;
            }

            match self.workers.dispatch(&inst, &worker).await {
                Ok(()) => {
                    inst.state = InstanceState::Running;
                    if let Err(err) = self.store.update(&mut inst).await {
                        warn!(instance = %inst.name, "failed to mark running: {err}");
                    } else {
                        info!(instance = %inst.name, worker = %worker, "dispatched");
                    }
                }
                Err(err) => {
                    debug!(instance = %inst.name, worker = %worker, "dispatch failed, will retry: {err}")
                }
            }
        }
    }
}

/// Restarts containers whose config drifted from their instance, which
/// is how `migrating` instances get re-imaged in place.
pub struct Updater {
    store: Arc<InstanceStore>,
    workers: Arc<WorkerManager>,
    limiter: Mutex<TokenBucketRateLimiter>,
    leadership: watch::Receiver<bool>,
}

impl Updater {
    pub fn new(
        store: Arc<InstanceStore>,
        workers: Arc<WorkerManager>,
        leadership: watch::Receiver<bool>,
    ) -> Self {
        Updater {
            store,
            workers,
            limiter: Mutex::new(TokenBucketRateLimiter::new(DISPATCH_RATE, RATE_WINDOW_SECS)),
            leadership,
        }
    }

    pub fn start(self) -> RecurringTask {
        let this = Arc::new(self);
        RecurringTask::spawn(LOOP_INTERVAL, move || {
            let this = Arc::clone(&this);
            async move { this.tick().await }
        })
    }

    pub async fn tick(&self) {
        if !*self.leadership.borrow() {
            return;
        }
        for inst in self.store.snapshot().await {
            if !inst.state.is_live() {
                continue;
            }
            let Some(container) = self.workers.container_for(&inst).await else {
                continue;
            };
            if container_matches(&inst, &container) {
                continue;
            }
            if !self.limiter.lock().await.check() {
                break;
            }
            match self.workers.restart(&inst).await {
                Ok(()) => {
                    let mut inst = inst;
                    inst.state = InstanceState::Running;
                    if let Err(err) = self.store.update(&mut inst).await {
                        warn!(instance = %inst.name, "failed to mark running: {err}");
                    } else {
                        info!(instance = %inst.name, "restarted with updated config");
                    }
                }
                Err(err) => debug!(instance = %inst.name, "restart failed, will retry: {err}"),
            }
        }
    }
}

/// Whether the live container still realizes the instance's config.
fn container_matches(inst: &Instance, container: &ContainerInfo) -> bool {
    inst.image == container.image
        && inst.command == container.command
        && inst.env == container.env
}

/// Moves `shutting-down` instances to `terminated` by deleting their
/// container.
pub struct Terminator {
    store: Arc<InstanceStore>,
    workers: Arc<WorkerManager>,
    limiter: Mutex<TokenBucketRateLimiter>,
    leadership: watch::Receiver<bool>,
}

impl Terminator {
    pub fn new(
        store: Arc<InstanceStore>,
        workers: Arc<WorkerManager>,
        leadership: watch::Receiver<bool>,
    ) -> Self {
        Terminator {
            store,
            workers,
            limiter: Mutex::new(TokenBucketRateLimiter::new(DISPATCH_RATE, RATE_WINDOW_SECS)),
            leadership,
        }
    }

    pub fn start(self) -> RecurringTask {
        let this = Arc::new(self);
        RecurringTask::spawn(LOOP_INTERVAL, move || {
            let this = Arc::clone(&this);
            async move { this.tick().await }
        })
    }

    pub async fn tick(&self) {
        if !*self.leadership.borrow() {
            return;
        }
        for mut inst in self.store.shutting_down().await {
            if !self.limiter.lock().await.check() {
                break;
            }
            match self.workers.terminate(&inst).await {
                Ok(()) => {
                    inst.state = InstanceState::Terminated;
                    if let Err(err) = self.store.update(&mut inst).await {
                        warn!(instance = %inst.name, "failed to mark terminated: {err}");
                    } else {
                        info!(instance = %inst.name, "terminated");
                    }
                }
                Err(err) => {
                    debug!(instance = %inst.name, "terminate failed, will retry: {err}")
                }
            }
        }
    }
}
