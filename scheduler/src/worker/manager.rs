/*
 * SPDX-FileCopyrightText: Copyright 2024 LG Electronics Inc.
 * SPDX-License-Identifier: Apache-2.0
 */

//! Keeps one [`WorkerClient`] per worker the registry knows about.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Duration;
use tracing::{info, warn};

use common::spec::Instance;

use crate::health::HealthStore;
use crate::sched::policy::Candidate;
use crate::store::InstanceStore;
use crate::util::RecurringTask;

use super::api::ContainerInfo;
use super::client::WorkerClient;
use super::registry::{RegistryClient, WorkerInfo};
use super::{Result, WorkerError};

const REGISTRY_SYNC_INTERVAL: Duration = Duration::from_secs(10);

pub struct WorkerManager {
    formation: String,
    check_interval: Duration,
    store: Arc<InstanceStore>,
    health: Arc<HealthStore>,
    registry: RegistryClient,
    clients: RwLock<HashMap<String, Arc<WorkerClient>>>,
    sync_task: Mutex<Option<RecurringTask>>,
}

impl WorkerManager {
    pub fn new(
        formation: &str,
        check_interval: Duration,
        store: Arc<InstanceStore>,
        health: Arc<HealthStore>,
        registry: RegistryClient,
    ) -> Self {
        WorkerManager {
            formation: formation.to_owned(),
            check_interval,
            store,
            health,
            registry,
            clients: RwLock::new(HashMap::new()),
            sync_task: Mutex::new(None),
        }
    }

    /// Populate clients from the registry and keep following it.
    pub async fn start(self: &Arc<Self>) {
        self.sync_registry().await;

        let manager = Arc::clone(self);
        let task = RecurringTask::spawn(REGISTRY_SYNC_INTERVAL, move || {
            let manager = Arc::clone(&manager);
            async move { manager.sync_registry().await }
        });
        *self.sync_task.lock().await = Some(task);
    }

    pub async fn stop(&self) {
        if let Some(task) = self.sync_task.lock().await.take() {
            task.stop();
            task.join().await;
        }
        let clients: Vec<Arc<WorkerClient>> = self.clients.write().await.drain().map(|(_, c)| c).collect();
        for client in clients {
            client.stop().await;
        }
    }

    /// Diff the registry view against the clients we run and create or
    /// dispose clients accordingly.
    async fn sync_registry(&self) {
        let workers = match self.registry.query_formation(&self.formation).await {
            Ok(map) => map,
            Err(err) => {
                warn!("registry query failed: {err}");
                return;
            }
        };
        let desired: HashMap<String, WorkerInfo> = workers
            .into_values()
            .map(|info| (info.instance.clone(), info))
            .collect();
        let current: HashSet<String> = self.clients.read().await.keys().cloned().collect();

        for (name, info) in &desired {
            if current.contains(name) {
                continue;
            }
            info!(worker = %name, "worker appeared, starting client");
            match WorkerClient::new(
                info.clone(),
                &self.formation,
                Arc::clone(&self.store),
                Arc::clone(&self.health),
                self.check_interval,
            ) {
                Ok(client) => {
                    let client = Arc::new(client);
                    client.start().await;
                    self.clients.write().await.insert(name.clone(), client);
                }
                Err(err) => warn!(worker = %name, "failed to build client: {err}"),
            }
        }

        for name in current {
            if desired.contains_key(&name) {
                continue;
            }
            info!(worker = %name, "worker disappeared, dropping client");
            if let Some(client) = self.clients.write().await.remove(&name) {
                client.stop().await;
            }
            self.health.forget(&name);
        }
    }

    pub async fn get(&self, name: &str) -> Option<Arc<WorkerClient>> {
        self.clients.read().await.get(name).cloned()
    }

    pub async fn clients(&self) -> Vec<Arc<WorkerClient>> {
        self.clients.read().await.values().cloned().collect()
    }

    /// Placement candidates for the current worker set.
    pub async fn candidates(&self) -> Vec<Candidate> {
        let clients = self.clients().await;
        let mut candidates = Vec::with_capacity(clients.len());
        for client in clients {
            let info = client.info();
            candidates.push(Candidate {
                name: info.instance.clone(),
                tags: info.tags.clone(),
                host: info.host.clone(),
                domain: info.domain.clone(),
                containers: client.container_count().await,
            });
        }
        candidates
    }

    pub async fn dispatch(&self, inst: &Instance, name: &str) -> Result<()> {
        let client = self
            .get(name)
            .await
            .ok_or_else(|| WorkerError::UnknownWorker(name.to_owned()))?;
        client.dispatch(inst).await
    }

    pub async fn restart(&self, inst: &Instance) -> Result<()> {
        let client = self.assigned_client(inst).await?;
        client.restart(inst).await
    }

    /// Delete the instance's container. An instance that never reached
    /// a worker has nothing to delete.
    pub async fn terminate(&self, inst: &Instance) -> Result<()> {
        match inst.assigned_to.as_deref() {
            None => Ok(()),
            Some(name) => {
                let client = self
                    .get(name)
                    .await
                    .ok_or_else(|| WorkerError::UnknownWorker(name.to_owned()))?;
                client.delete(inst).await
            }
        }
    }

    /// Wait for an instance to settle on the named worker.
    pub async fn wait(&self, inst: &Instance, name: &str, timeout: Duration) -> Result<String> {
        let client = self
            .get(name)
            .await
            .ok_or_else(|| WorkerError::UnknownWorker(name.to_owned()))?;
        client.wait(inst, timeout).await
    }

    /// The live container realizing an instance, if any.
    pub async fn container_for(&self, inst: &Instance) -> Option<ContainerInfo> {
        let name = inst.assigned_to.as_deref()?;
        self.get(name).await?.find(inst).await
    }

    async fn assigned_client(&self, inst: &Instance) -> Result<Arc<WorkerClient>> {
        let name = inst
            .assigned_to
            .as_deref()
            .ok_or_else(|| WorkerError::UnknownWorker(String::from("<unassigned>")))?;
        self.get(name)
            .await
            .ok_or_else(|| WorkerError::UnknownWorker(name.to_owned()))
    }
}

//Unit Test Cases
#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::PHI_THRESHOLD;
    use common::spec::ServiceTemplate;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn manager_for(registry_uri: &str) -> WorkerManager {
        WorkerManager::new(
            "assembly",
            Duration::from_secs(3600),
            Arc::new(InstanceStore::new()),
            Arc::new(HealthStore::new(PHI_THRESHOLD)),
            RegistryClient::new(vec![registry_uri.to_owned()]).unwrap(),
        )
    }

    fn worker_json(name: &str, tags: &[&str]) -> serde_json::Value {
        json!({
            "instance": name,
            "tags": tags,
            "host": format!("{}.example", name),
            "domain": "dc1",
        })
    }

    fn instance() -> Instance {
        let template = ServiceTemplate {
            image: String::from("registry/web:1"),
            ..ServiceTemplate::default()
        };
        Instance::from_template("assembly", "web", "1", &template)
    }

    #[tokio::test]
    async fn test_appearing_worker_gets_a_client() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/formation/assembly"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "hype1": worker_json("hype1", &["ssd"]),
            })))
            .mount(&server)
            .await;

        let manager = manager_for(&server.uri());
        manager.sync_registry().await;

        let client = manager.get("hype1").await.expect("client should exist");
        assert_eq!(client.info().tags, vec!["ssd"]);
        assert_eq!(manager.clients().await.len(), 1);

        // A second pass over the same registry view reuses the client.
        manager.sync_registry().await;
        let again = manager.get("hype1").await.unwrap();
        assert!(Arc::ptr_eq(&client, &again));
    }

    #[tokio::test]
    async fn test_disappearing_worker_is_dropped_and_forgotten() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/formation/assembly"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "hype1": worker_json("hype1", &[]),
                "hype2": worker_json("hype2", &[]),
            })))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/formation/assembly"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "hype2": worker_json("hype2", &[]),
            })))
            .mount(&server)
            .await;

        let manager = manager_for(&server.uri());
        manager.sync_registry().await;
        assert_eq!(manager.clients().await.len(), 2);

        // Give hype1 some health history to forget.
        manager.health.mark("hype1");
        manager.health.mark("hype1");
        assert!(manager.health.phi("hype1").is_some());

        manager.sync_registry().await;
        assert!(manager.get("hype1").await.is_none());
        assert!(manager.get("hype2").await.is_some());
        assert!(manager.health.phi("hype1").is_none());
    }

    #[tokio::test]
    async fn test_registry_outage_keeps_current_clients() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/formation/assembly"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "hype1": worker_json("hype1", &[]),
            })))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/formation/assembly"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let manager = manager_for(&server.uri());
        manager.sync_registry().await;
        assert_eq!(manager.clients().await.len(), 1);

        // A registry outage must not tear the fleet down.
        manager.sync_registry().await;
        assert_eq!(manager.clients().await.len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_worker_surfaces_as_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/formation/assembly"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .mount(&server)
            .await;

        let manager = manager_for(&server.uri());
        manager.sync_registry().await;

        let err = manager.dispatch(&instance(), "ghost").await.unwrap_err();
        assert!(matches!(err, WorkerError::UnknownWorker(_)));

        let mut assigned = instance();
        assigned.assigned_to = Some(String::from("ghost"));
        assert!(matches!(
            manager.terminate(&assigned).await.unwrap_err(),
            WorkerError::UnknownWorker(_)
        ));
        assert!(matches!(
            manager
                .wait(&assigned, "ghost", Duration::from_millis(10))
                .await
                .unwrap_err(),
            WorkerError::UnknownWorker(_)
        ));
        assert!(manager.container_for(&assigned).await.is_none());

        // Nothing was ever placed, so there is nothing to delete.
        assert!(manager.terminate(&instance()).await.is_ok());
    }
}
