/*
 * SPDX-FileCopyrightText: Copyright 2024 LG Electronics Inc.
 * SPDX-License-Identifier: Apache-2.0
 */

//! Advisory leader lock over etcd.
//!
//! At most one control plane per deployment runs the reconciliation
//! loops; the others block in [`LeaderLock::acquire`] until the key
//! frees up.

use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::{error, info, warn};

use common::spec::keys;

pub struct LeaderLock {
    key: String,
    owner: String,
    ttl: i64,
    lease: Mutex<Option<i64>>,
    leadership: Arc<watch::Sender<bool>>,
    stop: watch::Sender<bool>,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
}

impl LeaderLock {
    pub fn new(owner: &str, ttl_secs: i64) -> Self {
        let (leadership, _) = watch::channel(false);
        let (stop, _) = watch::channel(false);
        LeaderLock {
            key: keys::LEADER_KEY.to_owned(),
            owner: owner.to_owned(),
            ttl: ttl_secs,
            lease: Mutex::new(None),
            leadership: Arc::new(leadership),
            stop,
            heartbeat: Mutex::new(None),
        }
    }

    /// Current-leadership channel. Flips to `false` when the heartbeat
    /// fails; every loop observes it at its loop head.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.leadership.subscribe()
    }

    /// Block until the lock is held, then keep it alive at ttl/2.
    ///
    /// Transient etcd errors are retried; this only returns once the
    /// key was claimed under a live lease.
    pub async fn acquire(&self) {
        loop {
            let lease = match common::etcd::grant_lease(self.ttl).await {
                Ok(id) => id,
                Err(err) => {
                    warn!("leader lock: lease grant failed, retrying: {err}");
                    tokio::time::sleep(self.retry_interval()).await;
                    continue;
                }
            };

            match common::etcd::put_if_absent(&self.key, &self.owner, Some(lease)).await {
                Ok(()) => {
                    info!(owner = %self.owner, "acquired leader lock");
                    *self.lease.lock().await = Some(lease);
                    let _ = self.leadership.send(true);
                    self.start_heartbeat(lease).await;
                    return;
                }
                Err(common::StoreError::AlreadyExists(_)) => {
                    let _ = common::etcd::revoke_lease(lease).await;
                    tokio::time::sleep(self.retry_interval()).await;
                }
                Err(err) => {
                    warn!("leader lock: claim failed, retrying: {err}");
                    let _ = common::etcd::revoke_lease(lease).await;
                    tokio::time::sleep(self.retry_interval()).await;
                }
            }
        }
    }

    async fn start_heartbeat(&self, lease: i64) {
        let interval = self.retry_interval();
        let leadership = Arc::clone(&self.leadership);
        let mut stop_rx = self.stop.subscribe();

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = stop_rx.changed() => {}
                }
                if *stop_rx.borrow() {
                    break;
                }
                if let Err(err) = common::etcd::keep_alive(lease).await {
                    error!("leader heartbeat failed: {err}");
                    let _ = leadership.send(false);
                    break;
                }
            }
        });
        *self.heartbeat.lock().await = Some(handle);
    }

    /// Stop the heartbeat and best-effort delete the claim.
    pub async fn release(&self) {
        let _ = self.stop.send(true);
        if let Some(handle) = self.heartbeat.lock().await.take() {
            let _ = handle.await;
        }
        let _ = self.leadership.send(false);

        if let Some(lease) = self.lease.lock().await.take() {
            let _ = common::etcd::revoke_lease(lease).await;
        }
        if let Err(err) = common::etcd::delete(&self.key).await {
            warn!("leader lock: release delete failed: {err}");
        }
    }

    fn retry_interval(&self) -> Duration {
        Duration::from_secs((self.ttl / 2).max(1) as u64)
    }
}
