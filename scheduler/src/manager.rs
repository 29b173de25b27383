/*
 * SPDX-FileCopyrightText: Copyright 2024 LG Electronics Inc.
 * SPDX-License-Identifier: Apache-2.0
 */

//! Wires the stores, worker clients and reconciliation loops together
//! and runs them for as long as this process holds the leader lock.

use std::sync::Arc;
use tokio::time::Duration;
use tracing::{error, info};

use crate::api::{self, AppState};
use crate::cache::{start_mirror, StateCache};
use crate::handler::{RemoveTerminatedHandler, SlowBootHandler, SlowTermHandler};
use crate::health::{HealthStore, PHI_THRESHOLD};
use crate::sched::{Dispatcher, Scheduler, Terminator, Updater};
use crate::store::InstanceStore;
use crate::util::{LeaderLock, RecurringTask};
use crate::worker::{RegistryClient, WorkerManager};

const LEADER_TTL_SECS: i64 = 30;

pub async fn run() -> anyhow::Result<()> {
    let settings = common::setting::get_config();

    let store = Arc::new(InstanceStore::new());
    let health = Arc::new(HealthStore::new(PHI_THRESHOLD));
    let registry = RegistryClient::new(settings.registry_nodes())?;
    let workers = Arc::new(WorkerManager::new(
        &settings.formation,
        Duration::from_secs(settings.check_interval),
        Arc::clone(&store),
        Arc::clone(&health),
        registry,
    ));

    let cache = settings
        .state_cache
        .as_deref()
        .and_then(StateCache::new)
        .map(Arc::new);

    // The API serves reads and store writes regardless of leadership;
    // only the reconciliation loops are gated.
    let api_state = AppState {
        store: Arc::clone(&store),
        cache: cache.clone(),
    };
    let port = settings.port;
    tokio::spawn(async move {
        if let Err(err) = api::serve(api_state, port).await {
            error!("http api failed: {err}");
        }
    });

    let owner = format!("scheduler-{}", uuid::Uuid::new_v4().simple());
    let lock = LeaderLock::new(&owner, LEADER_TTL_SECS);
    info!(owner = %owner, "waiting for leader lock");
    lock.acquire().await;

    store.start().await?;
    workers.start().await;

    let mirror = cache
        .clone()
        .map(|cache| start_mirror(cache, store.subscribe()));

    let leadership = lock.subscribe();
    let tasks: Vec<RecurringTask> = vec![
        Scheduler::new(Arc::clone(&store), Arc::clone(&workers), leadership.clone()).start(),
        Dispatcher::new(
            Arc::clone(&store),
            Arc::clone(&workers),
            Arc::clone(&health),
            leadership.clone(),
        )
        .start(),
        Updater::new(Arc::clone(&store), Arc::clone(&workers), leadership.clone()).start(),
        Terminator::new(Arc::clone(&store), Arc::clone(&workers), leadership.clone()).start(),
        SlowBootHandler::new(
            Arc::clone(&store),
            settings.slow_boot_threshold,
            leadership.clone(),
        )
        .start(),
        SlowTermHandler::new(
            Arc::clone(&store),
            Arc::clone(&workers),
            settings.slow_term_threshold,
            leadership.clone(),
        )
        .start(),
        RemoveTerminatedHandler::new(
            Arc::clone(&store),
            settings.remove_terminated_interval,
            leadership.clone(),
        )
        .start(),
    ];
    info!(formation = %settings.formation, "reconciliation loops running");

    let mut leadership = leadership;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt, shutting down");
        }
        _ = watch_leadership(&mut leadership) => {
            error!("leadership lost, stopping reconciliation");
        }
    }

    for task in &tasks {
        task.stop();
    }
    for task in tasks {
        task.join().await;
    }
    if let Some(mirror) = mirror {
        mirror.abort();
    }
    workers.stop().await;
    store.stop().await;
    lock.release().await;
    info!("scheduler stopped");
    Ok(())
}

async fn watch_leadership(leadership: &mut tokio::sync::watch::Receiver<bool>) {
    loop {
        if leadership.changed().await.is_err() {
            return;
        }
        if !*leadership.borrow() {
            return;
        }
    }
}
