/*
 * SPDX-FileCopyrightText: Copyright 2024 LG Electronics Inc.
 * SPDX-License-Identifier: Apache-2.0
 */

//! Watched in-memory mirror of the `instances/` prefix.
//!
//! The command side writes plain SETs to etcd (last writer wins); the
//! watch task is the only owner of the in-memory map and applies the
//! change stream back into it, emitting events as it goes. Readers get
//! snapshots and tolerate staleness; the next reconciliation pass
//! corrects any drift.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::{error, info, warn};

use common::spec::{keys, Instance, InstanceState};

use super::{InstanceWriter, StoreEvent};

const EVENT_CAPACITY: usize = 256;
const WATCH_RETRY: Duration = Duration::from_secs(2);

type InstanceKey = (String, String);

pub struct InstanceStore {
    instances: RwLock<HashMap<InstanceKey, Instance>>,
    events: broadcast::Sender<StoreEvent>,
    stop: watch::Sender<bool>,
    watch_task: Mutex<Option<JoinHandle<()>>>,
}

impl Default for InstanceStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InstanceStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (stop, _) = watch::channel(false);
        InstanceStore {
            instances: RwLock::new(HashMap::new()),
            events,
            stop,
            watch_task: Mutex::new(None),
        }
    }

    /// Populate the mirror from a full scan, then begin watching the
    /// prefix from the revision the scan was taken at.
    pub async fn start(self: &Arc<Self>) -> common::Result<()> {
        let revision = self.rescan().await?;
        let store = Arc::clone(self);
        let stop_rx = self.stop.subscribe();
        let handle = tokio::spawn(async move {
            store.run_watch(stop_rx, revision + 1).await;
        });
        *self.watch_task.lock().await = Some(handle);
        Ok(())
    }

    /// Halt the watch task at its next suspension point.
    pub async fn stop(&self) {
        let _ = self.stop.send(true);
        if let Some(handle) = self.watch_task.lock().await.take() {
            let _ = handle.await;
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    // ---- queries ------------------------------------------------------

    pub async fn get(&self, formation: &str, service: &str, instance: &str) -> Option<Instance> {
        let name = format!("{}.{}", service, instance);
        self.instances
            .read()
            .await
            .get(&(formation.to_owned(), name))
            .cloned()
    }

    pub async fn get_by_name(&self, formation: &str, name: &str) -> Option<Instance> {
        self.instances
            .read()
            .await
            .get(&(formation.to_owned(), name.to_owned()))
            .cloned()
    }

    pub async fn snapshot(&self) -> Vec<Instance> {
        self.instances.read().await.values().cloned().collect()
    }

    /// Instances of a formation, ordered by name.
    pub async fn query_formation(&self, formation: &str) -> Vec<Instance> {
        let mut insts: Vec<Instance> = self
            .instances
            .read()
            .await
            .values()
            .filter(|inst| inst.formation == formation)
            .cloned()
            .collect();
        insts.sort_by(|a, b| a.name.cmp(&b.name));
        insts
    }

    pub async fn unassigned(&self) -> Vec<Instance> {
        self.filtered(InstanceState::Pending).await
    }

    pub async fn pending_dispatch(&self) -> Vec<Instance> {
        self.filtered(InstanceState::PendingDispatch).await
    }

    pub async fn shutting_down(&self) -> Vec<Instance> {
        self.filtered(InstanceState::ShuttingDown).await
    }

    pub async fn terminated(&self) -> Vec<Instance> {
        self.filtered(InstanceState::Terminated).await
    }

    pub async fn running(&self) -> Vec<Instance> {
        self.filtered(InstanceState::Running).await
    }

    async fn filtered(&self, state: InstanceState) -> Vec<Instance> {
        self.instances
            .read()
            .await
            .values()
            .filter(|inst| inst.state == state)
            .cloned()
            .collect()
    }

    // ---- watch plumbing ----------------------------------------------

    async fn run_watch(self: Arc<Self>, mut stop_rx: watch::Receiver<bool>, start: i64) {
        let mut from_revision = Some(start);
        loop {
            if *stop_rx.borrow() {
                return;
            }
            // A missed range is recovered with a full rescan.
            if from_revision.is_none() {
                match self.rescan().await {
                    Ok(revision) => from_revision = Some(revision + 1),
                    Err(err) => {
                        error!("instance rescan failed: {err}");
                        tokio::time::sleep(WATCH_RETRY).await;
                        continue;
                    }
                }
            }

            let (mut watcher, mut stream) =
                match common::etcd::watch_prefix(keys::INSTANCE_SCAN_PREFIX, from_revision).await {
                    Ok(pair) => pair,
                    Err(err) => {
                        error!("instance watch failed to open: {err}");
                        tokio::time::sleep(WATCH_RETRY).await;
                        continue;
                    }
                };
            info!(revision = ?from_revision, "watching instance records");

            loop {
                tokio::select! {
                    _ = stop_rx.changed() => {
                        let _ = watcher.cancel().await;
                        return;
                    }
                    msg = stream.message() => match msg {
                        Ok(Some(resp)) => {
                            if resp.compact_revision() > 0 {
                                warn!(
                                    compacted = resp.compact_revision(),
                                    "instance watch compacted, rebuilding from scan"
                                );
                                from_revision = None;
                                break;
                            }
                            if resp.canceled() {
                                warn!("instance watch canceled, re-arming");
                                break;
                            }
                            for event in resp.events() {
                                if let Some(revision) = self.apply(event).await {
                                    from_revision = Some(revision + 1);
                                }
                            }
                        }
                        // A timed-out or exhausted watch simply re-arms.
                        Ok(None) => break,
                        Err(err) => {
                            error!("instance watch stream error: {err}");
                            tokio::time::sleep(WATCH_RETRY).await;
                            break;
                        }
                    }
                }
            }
        }
    }

    /// Apply one watch event; returns the revision it carried.
    async fn apply(&self, event: &etcd_client::Event) -> Option<i64> {
        let kv = event.kv()?;
        let key = match kv.key_str() {
            Ok(key) => key.to_owned(),
            Err(err) => {
                warn!("instance event with non-utf8 key: {err}");
                return Some(kv.mod_revision());
            }
        };
        match event.event_type() {
            etcd_client::EventType::Put => self.apply_put(&key, kv.value()).await,
            etcd_client::EventType::Delete => self.apply_delete(&key).await,
        }
        Some(kv.mod_revision())
    }

    async fn apply_put(&self, key: &str, value: &[u8]) {
        let Some((formation, name)) = keys::split_instance(key) else {
            warn!(key = %key, "ignoring instance record with malformed key");
            return;
        };
        let incoming: Instance = match serde_json::from_slice(value) {
            Ok(inst) => inst,
            Err(err) => {
                warn!(key = %key, "undecodable instance record: {err}");
                return;
            }
        };

        let event = {
            let mut map = self.instances.write().await;
            match map.get(&(formation.clone(), name.clone())) {
                // The payload equals what we already hold; a write we
                // made ourselves echoing back. Suppress.
                Some(current) if *current == incoming => None,
                Some(_) => {
                    map.insert((formation, name), incoming.clone());
                    Some(StoreEvent::Updated(incoming))
                }
                None => {
                    map.insert((formation, name), incoming.clone());
                    Some(StoreEvent::Created(incoming))
                }
            }
        };
        if let Some(event) = event {
            let _ = self.events.send(event);
        }
    }

    async fn apply_delete(&self, key: &str) {
        let Some((formation, name)) = keys::split_instance(key) else {
            return;
        };
        let removed = self.instances.write().await.remove(&(formation, name));
        if let Some(inst) = removed {
            let _ = self.events.send(StoreEvent::Deleted(inst));
        }
    }

    /// Rebuild the mirror from a full prefix read, emitting the delta
    /// as events. Returns the revision the scan was taken at.
    async fn rescan(&self) -> common::Result<i64> {
        let (pairs, revision) =
            common::etcd::get_all_with_revision(keys::INSTANCE_SCAN_PREFIX).await?;

        let mut fresh: HashMap<InstanceKey, Instance> = HashMap::new();
        for pair in pairs {
            let Some(parts) = keys::split_instance(&pair.key) else {
                warn!(key = %pair.key, "skipping instance record with malformed key");
                continue;
            };
            match serde_json::from_str::<Instance>(&pair.value) {
                Ok(inst) => {
                    fresh.insert(parts, inst);
                }
                Err(err) => warn!(key = %pair.key, "skipping undecodable instance record: {err}"),
            }
        }

        let mut events = Vec::new();
        {
            let mut map = self.instances.write().await;
            for (key, inst) in &fresh {
                match map.get(key) {
                    Some(current) if current == inst => {}
                    Some(_) => events.push(StoreEvent::Updated(inst.clone())),
                    None => events.push(StoreEvent::Created(inst.clone())),
                }
            }
            for (key, inst) in map.iter() {
                if !fresh.contains_key(key) {
                    events.push(StoreEvent::Deleted(inst.clone()));
                }
            }
            *map = fresh;
        }
        for event in events {
            let _ = self.events.send(event);
        }
        Ok(revision)
    }
}

#[async_trait]
impl InstanceWriter for InstanceStore {
    async fn create(&self, mut instance: Instance) -> common::Result<Instance> {
        instance.changed_at = Utc::now();
        let value = serde_json::to_string(&instance)?;
        common::etcd::put(&instance.key(), &value).await?;
        Ok(instance)
    }

    async fn update(&self, instance: &mut Instance) -> common::Result<()> {
        instance.changed_at = Utc::now();
        let value = serde_json::to_string(instance)?;
        common::etcd::put(&instance.key(), &value).await
    }

    async fn delete(&self, instance: &Instance) -> common::Result<()> {
        common::etcd::delete(&instance.key()).await
    }
}

//Unit Test Cases
#[cfg(test)]
mod tests {
    use super::*;
    use common::spec::ServiceTemplate;

    fn record(service: &str, state: InstanceState) -> Instance {
        let template = ServiceTemplate {
            image: String::from("registry/app:1"),
            ..ServiceTemplate::default()
        };
        let mut inst = Instance::from_template("assembly", service, "1", &template);
        inst.state = state;
        inst
    }

    async fn put_record(store: &InstanceStore, inst: &Instance) {
        let value = serde_json::to_vec(inst).unwrap();
        store.apply_put(&inst.key(), &value).await;
    }

    #[tokio::test]
    async fn test_put_creates_and_emits() {
        let store = InstanceStore::new();
        let mut events = store.subscribe();

        let inst = record("web", InstanceState::Pending);
        put_record(&store, &inst).await;

        let got = store
            .get("assembly", "web", &inst.instance)
            .await
            .expect("instance should be mirrored");
        assert_eq!(got, inst);
        assert!(matches!(events.try_recv().unwrap(), StoreEvent::Created(_)));
    }

    #[tokio::test]
    async fn test_identical_put_is_suppressed() {
        let store = InstanceStore::new();
        let inst = record("web", InstanceState::Pending);
        put_record(&store, &inst).await;

        let mut events = store.subscribe();
        put_record(&store, &inst).await;
        assert!(events.try_recv().is_err(), "echoed SET must not re-emit");
    }

    #[tokio::test]
    async fn test_changed_put_emits_update() {
        let store = InstanceStore::new();
        let mut inst = record("web", InstanceState::Pending);
        put_record(&store, &inst).await;

        let mut events = store.subscribe();
        inst.state = InstanceState::PendingDispatch;
        inst.assigned_to = Some(String::from("hype1"));
        put_record(&store, &inst).await;

        assert!(matches!(events.try_recv().unwrap(), StoreEvent::Updated(_)));
        let got = store.get("assembly", "web", &inst.instance).await.unwrap();
        assert_eq!(got.state, InstanceState::PendingDispatch);
    }

    #[tokio::test]
    async fn test_delete_removes_and_emits() {
        let store = InstanceStore::new();
        let inst = record("web", InstanceState::Running);
        put_record(&store, &inst).await;

        let mut events = store.subscribe();
        store.apply_delete(&inst.key()).await;

        assert!(store.get("assembly", "web", &inst.instance).await.is_none());
        assert!(matches!(events.try_recv().unwrap(), StoreEvent::Deleted(_)));
    }

    #[tokio::test]
    async fn test_delete_of_unknown_key_is_silent() {
        let store = InstanceStore::new();
        let mut events = store.subscribe();
        store.apply_delete("instances/assembly/web.nope").await;
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_malformed_key_is_ignored() {
        let store = InstanceStore::new();
        store.apply_put("instances/broken", b"{}").await;
        assert!(store.snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn test_state_filters() {
        let store = InstanceStore::new();
        put_record(&store, &record("web", InstanceState::Pending)).await;
        put_record(&store, &record("web", InstanceState::Running)).await;
        put_record(&store, &record("db", InstanceState::ShuttingDown)).await;
        put_record(&store, &record("db", InstanceState::Terminated)).await;

        assert_eq!(store.unassigned().await.len(), 1);
        assert_eq!(store.running().await.len(), 1);
        assert_eq!(store.shutting_down().await.len(), 1);
        assert_eq!(store.terminated().await.len(), 1);
        assert_eq!(store.pending_dispatch().await.len(), 0);
        assert_eq!(store.snapshot().await.len(), 4);
    }

    #[tokio::test]
    async fn test_replaying_the_stream_is_idempotent() {
        // Applying the same ordered change stream once or twice must
        // yield the same mirror.
        let mut a = record("web", InstanceState::Pending);
        let b = record("db", InstanceState::Pending);

        let once = InstanceStore::new();
        let twice = InstanceStore::new();

        for store in [&once, &twice] {
            put_record(store, &a).await;
            put_record(store, &b).await;
            a.state = InstanceState::Running;
            a.assigned_to = Some(String::from("hype1"));
            put_record(store, &a).await;
            store.apply_delete(&b.key()).await;
            a.state = InstanceState::Pending;
            a.assigned_to = None;
        }
        // Second replay against `twice`.
        put_record(&twice, &a).await;
        put_record(&twice, &b).await;
        a.state = InstanceState::Running;
        a.assigned_to = Some(String::from("hype1"));
        put_record(&twice, &a).await;
        twice.apply_delete(&b.key()).await;

        let mut left = once.snapshot().await;
        let mut right = twice.snapshot().await;
        left.sort_by(|x, y| x.name.cmp(&y.name));
        right.sort_by(|x, y| x.name.cmp(&y.name));
        assert_eq!(left, right);
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].state, InstanceState::Running);
    }

    #[tokio::test]
    async fn test_query_formation_is_sorted_and_scoped() {
        let store = InstanceStore::new();
        put_record(&store, &record("web", InstanceState::Running)).await;
        put_record(&store, &record("db", InstanceState::Running)).await;

        let mut other = record("web", InstanceState::Running);
        other.formation = String::from("elsewhere");
        put_record(&store, &other).await;

        let insts = store.query_formation("assembly").await;
        assert_eq!(insts.len(), 2);
        let names: Vec<&str> = insts.iter().map(|inst| inst.name.as_str()).collect();
        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(names, sorted);
    }
}
