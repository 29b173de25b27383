/*
 * SPDX-FileCopyrightText: Copyright 2024 LG Electronics Inc.
 * SPDX-License-Identifier: Apache-2.0
 */

//! Per-worker controller: local container view, poll loop, dispatch.
//!
//! A client starts out problematic and refuses outbound calls until its
//! first successful poll. Recovering from problematic triggers a
//! reconciliation pass that adopts containers created before a restart,
//! marks vanished ones lost and retries deletes that failed earlier.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::Duration;
use tracing::{info, warn};

use common::spec::{Instance, InstanceState};

use crate::health::HealthStore;
use crate::store::{InstanceStore, InstanceWriter};
use crate::util::RecurringTask;

use super::api::{ContainerInfo, WorkerApi};
use super::registry::WorkerInfo;
use super::{Result, WorkerError};

const WAIT_POLL: Duration = Duration::from_secs(5);

/// Container states that end a [`WorkerClient::wait`].
const SETTLED_STATES: [&str; 4] = ["running", "fail", "done", "error"];

#[derive(Default)]
struct LocalView {
    containers: HashMap<String, ContainerInfo>,
    problematic: bool,
    deferred_deletes: Vec<String>,
}

pub struct WorkerClient {
    info: WorkerInfo,
    api: WorkerApi,
    view: Mutex<LocalView>,
    store: Arc<InstanceStore>,
    health: Arc<HealthStore>,
    interval: Duration,
    poll: Mutex<Option<RecurringTask>>,
}

impl WorkerClient {
    pub fn new(
        info: WorkerInfo,
        formation: &str,
        store: Arc<InstanceStore>,
        health: Arc<HealthStore>,
        interval: Duration,
    ) -> Result<Self> {
        let api = WorkerApi::new(&info.instance, formation)?;
        Ok(Self::with_api(info, api, store, health, interval))
    }

    pub fn with_api(
        info: WorkerInfo,
        api: WorkerApi,
        store: Arc<InstanceStore>,
        health: Arc<HealthStore>,
        interval: Duration,
    ) -> Self {
        WorkerClient {
            info,
            api,
            view: Mutex::new(LocalView {
                problematic: true,
                ..LocalView::default()
            }),
            store,
            health,
            interval,
            poll: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.info.instance
    }

    pub fn info(&self) -> &WorkerInfo {
        &self.info
    }

    pub async fn start(self: &Arc<Self>) {
        let client = Arc::clone(self);
        let task = RecurringTask::spawn(self.interval, move || {
            let client = Arc::clone(&client);
            async move { client.check_status().await }
        });
        *self.poll.lock().await = Some(task);
    }

    pub async fn stop(&self) {
        if let Some(task) = self.poll.lock().await.take() {
            task.stop();
            task.join().await;
        }
    }

    pub async fn is_problematic(&self) -> bool {
        self.view.lock().await.problematic
    }

    pub async fn container_count(&self) -> usize {
        self.view.lock().await.containers.len()
    }

    /// One poll of the worker's container endpoint.
    pub async fn check_status(&self) {
        let remote = match self.api.containers().await {
            Ok(remote) => remote,
            Err(err) => {
                warn!(worker = %self.name(), "container poll failed: {err}");
                self.view.lock().await.problematic = true;
                return;
            }
        };

        let was_problematic = self.view.lock().await.problematic;
        if was_problematic {
            self.reconcile(&remote).await;
            self.view.lock().await.problematic = false;
        }

        // Containers we tracked that the worker stopped reporting are
        // gone for good; their instances are lost.
        let vanished = {
            let mut view = self.view.lock().await;
            let gone: Vec<String> = view
                .containers
                .keys()
                .filter(|cid| !remote.contains_key(*cid))
                .cloned()
                .collect();
            gone.into_iter()
                .filter_map(|cid| view.containers.remove(&cid))
                .collect::<Vec<_>>()
        };
        for container in vanished {
            self.mark_lost(&container).await;
        }

        {
            let mut view = self.view.lock().await;
            for (cid, container) in &remote {
                view.containers.insert(cid.clone(), container.clone());
            }
        }

        for container in remote.values() {
            if container.state == "error" {
                self.mark_lost(container).await;
            }
        }

        self.health.mark(self.name());
    }

    /// Reconciliation pass on the first good poll after trouble.
    async fn reconcile(&self, remote: &HashMap<String, ContainerInfo>) {
        let (unknown, deferred) = {
            let view = self.view.lock().await;
            let unknown: Vec<String> = remote
                .keys()
                .filter(|cid| {
                    !view.containers.contains_key(*cid)
                        && !view.deferred_deletes.iter().any(|d| d == *cid)
                })
                .cloned()
                .collect();
            (unknown, view.deferred_deletes.clone())
        };

        for cid in unknown {
            let container = &remote[&cid];
            match self
                .store
                .get(&container.formation, &container.service, &container.instance)
                .await
            {
                Some(_) => {
                    info!(worker = %self.name(), container = %cid, "adopting container");
                    self.view
                        .lock()
                        .await
                        .containers
                        .insert(cid.clone(), container.clone());
                }
                None => {
                    // Orphan policy: leave it running for the operator.
                    warn!(
                        worker = %self.name(),
                        container = %cid,
                        "container has no instance record, leaving it alone"
                    );
                }
            }
        }

        for cid in deferred {
            if !remote.contains_key(&cid) {
                self.view.lock().await.deferred_deletes.retain(|d| d != &cid);
                continue;
            }
            match self.api.delete(&cid).await {
                Ok(()) => {
                    self.view.lock().await.deferred_deletes.retain(|d| d != &cid);
                }
                Err(err) => {
                    warn!(worker = %self.name(), container = %cid, "deferred delete failed again: {err}")
                }
            }
        }
    }

    async fn mark_lost(&self, container: &ContainerInfo) {
        let Some(mut inst) = self
            .store
            .get(&container.formation, &container.service, &container.instance)
            .await
        else {
            return;
        };
        if inst.state == InstanceState::Lost {
            return;
        }
        info!(
            instance = %inst.name,
            worker = %self.name(),
            "container gone, marking instance lost"
        );
        inst.state = InstanceState::Lost;
        if let Err(err) = self.store.update(&mut inst).await {
            warn!(instance = %inst.name, "failed to mark instance lost: {err}");
        }
    }

    async fn ensure_callable(&self) -> Result<()> {
        if self.view.lock().await.problematic {
            Err(WorkerError::Problematic)
        } else {
            Ok(())
        }
    }

    /// Realize the instance as a container on this worker.
    pub async fn dispatch(&self, inst: &Instance) -> Result<()> {
        self.ensure_callable().await?;
        match self.api.create(inst).await {
            Ok(container) => {
                self.view
                    .lock()
                    .await
                    .containers
                    .insert(container.id.clone(), container);
                Ok(())
            }
            Err(err) => {
                self.view.lock().await.problematic = true;
                Err(err)
            }
        }
    }

    /// Recreate the instance's container in place.
    pub async fn restart(&self, inst: &Instance) -> Result<()> {
        self.ensure_callable().await?;
        let Some(container) = self.find(inst).await else {
            return Ok(());
        };
        match self.api.restart(&container.id, inst).await {
            Ok(updated) => {
                self.view
                    .lock()
                    .await
                    .containers
                    .insert(updated.id.clone(), updated);
                Ok(())
            }
            Err(err) => {
                self.view.lock().await.problematic = true;
                Err(err)
            }
        }
    }

    /// Delete the instance's container. A failed delete is queued for
    /// retry in the next reconciliation pass and the error propagated.
    pub async fn delete(&self, inst: &Instance) -> Result<()> {
        self.ensure_callable().await?;
        let Some(container) = self.find(inst).await else {
            return Ok(());
        };
        self.view.lock().await.containers.remove(&container.id);
        match self.api.delete(&container.id).await {
            Ok(()) => Ok(()),
            Err(err) => {
                let mut view = self.view.lock().await;
                view.deferred_deletes.push(container.id.clone());
                view.problematic = true;
                Err(err)
            }
        }
    }

    /// Look up the container realizing an instance, if any.
    pub async fn find(&self, inst: &Instance) -> Option<ContainerInfo> {
        self.view
            .lock()
            .await
            .containers
            .values()
            .find(|container| container.matches(inst))
            .cloned()
    }

    /// Container states for the given instances; `"unknown"` where no
    /// container exists.
    pub async fn statuses(&self, instances: &[Instance]) -> Vec<String> {
        let view = self.view.lock().await;
        instances
            .iter()
            .map(|inst| {
                view.containers
                    .values()
                    .find(|container| container.matches(inst))
                    .map(|container| container.state.clone())
                    .unwrap_or_else(|| String::from("unknown"))
            })
            .collect()
    }

    /// Block until the worker reports the instance in a settled state,
    /// or fail after the timeout.
    pub async fn wait(&self, inst: &Instance, timeout: Duration) -> Result<String> {
        let poll = async {
            loop {
                if let Some(container) = self.find(inst).await {
                    if SETTLED_STATES.contains(&container.state.as_str()) {
                        return container.state;
                    }
                }
                tokio::time::sleep(WAIT_POLL).await;
            }
        };
        tokio::time::timeout(timeout, poll)
            .await
            .map_err(|_| WorkerError::WaitTimeout(inst.name.clone()))
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

    fn test_client(server_url: &str) -> WorkerClient {
        let info = WorkerInfo {
            instance: String::from("hype1"),
            tags: vec![],
            host: String::from("host1"),
            domain: String::from("dc1"),
        };
        WorkerClient::with_api(
            info,
            WorkerApi::with_base_url(server_url).unwrap(),
            Arc::new(InstanceStore::new()),
            Arc::new(HealthStore::new(PHI_THRESHOLD)),
            Duration::from_secs(10),
        )
    }

    fn instance(service: &str) -> Instance {
        let template = ServiceTemplate {
            image: String::from("registry/app:1"),
            ..ServiceTemplate::default()
        };
        Instance::from_template("assembly", service, "1", &template)
    }

    fn container_json(cid: &str, inst: &Instance, state: &str) -> serde_json::Value {
        json!({
            "id": cid,
            "formation": inst.formation,
            "service": inst.service,
            "instance": inst.instance,
            "image": inst.image,
            "command": inst.command,
            "env": {},
            "ports": [],
            "state": state,
        })
    }

    #[tokio::test]
    async fn test_starts_problematic_and_fails_fast() {
        let client = test_client("http://127.0.0.1:9");
        assert!(client.is_problematic().await);

        let err = client.dispatch(&instance("web")).await.unwrap_err();
        assert!(matches!(err, WorkerError::Problematic));
    }

    #[tokio::test]
    async fn test_successful_poll_clears_problematic() {
        let server = MockServer::start().await;
        let inst = instance("web");
        Mock::given(method("GET"))
            .and(path("/container"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"c1": container_json("c1", &inst, "running")})),
            )
            .mount(&server)
            .await;

        let client = test_client(&server.uri());
        client.check_status().await;

        assert!(!client.is_problematic().await);
        assert_eq!(client.container_count().await, 1);
    }

    #[tokio::test]
    async fn test_failed_poll_sets_problematic() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/container"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/container"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let client = test_client(&server.uri());
        client.check_status().await;
        assert!(!client.is_problematic().await);

        client.check_status().await;
        assert!(client.is_problematic().await);
    }

    #[tokio::test]
    async fn test_dispatch_remembers_container() {
        let server = MockServer::start().await;
        let inst = instance("web");
        Mock::given(method("GET"))
            .and(path("/container"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/container"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(container_json("c9", &inst, "running")),
            )
            .mount(&server)
            .await;

        let client = test_client(&server.uri());
        client.check_status().await;
        client.dispatch(&inst).await.unwrap();

        let found = client.find(&inst).await.unwrap();
        assert_eq!(found.id, "c9");
        assert_eq!(client.statuses(&[inst]).await, vec!["running"]);
    }

    #[tokio::test]
    async fn test_failed_delete_is_deferred() {
        let server = MockServer::start().await;
        let inst = instance("web");
        Mock::given(method("GET"))
            .and(path("/container"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"c1": container_json("c1", &inst, "running")})),
            )
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/container/c1"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let client = test_client(&server.uri());
        client.check_status().await;

        let err = client.delete(&inst).await.unwrap_err();
        assert!(matches!(err, WorkerError::Http(_)));
        assert!(client.is_problematic().await);
        assert_eq!(client.view.lock().await.deferred_deletes, vec!["c1"]);
    }

    #[tokio::test]
    async fn test_reconcile_retries_deferred_deletes() {
        let server = MockServer::start().await;
        let inst = instance("web");
        Mock::given(method("GET"))
            .and(path("/container"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"c1": container_json("c1", &inst, "running")})),
            )
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/container/c1"))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/container/c1"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;

        let client = test_client(&server.uri());
        client.check_status().await;
        assert!(client.delete(&inst).await.is_err());

        // Next poll runs the reconciliation pass and retries the delete.
        client.check_status().await;
        assert!(client.view.lock().await.deferred_deletes.is_empty());
    }

    #[tokio::test]
    async fn test_delete_without_container_is_noop() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/container"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .mount(&server)
            .await;

        let client = test_client(&server.uri());
        client.check_status().await;
        client.delete(&instance("web")).await.unwrap();
    }

    #[tokio::test]
    async fn test_vanished_container_is_forgotten() {
        let server = MockServer::start().await;
        let inst = instance("web");
        Mock::given(method("GET"))
            .and(path("/container"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"c1": container_json("c1", &inst, "running")})),
            )
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/container"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .mount(&server)
            .await;

        let client = test_client(&server.uri());
        client.check_status().await;
        assert_eq!(client.container_count().await, 1);

        client.check_status().await;
        assert_eq!(client.container_count().await, 0);
        assert!(client.find(&inst).await.is_none());
    }

    #[tokio::test]
    async fn test_wait_returns_settled_state() {
        let server = MockServer::start().await;
        let inst = instance("web");
        Mock::given(method("GET"))
            .and(path("/container"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"c1": container_json("c1", &inst, "running")})),
            )
            .mount(&server)
            .await;

        let client = test_client(&server.uri());
        client.check_status().await;

        let state = client.wait(&inst, Duration::from_secs(5)).await.unwrap();
        assert_eq!(state, "running");
    }

    #[tokio::test]
    async fn test_wait_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/container"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .mount(&server)
            .await;

        let client = test_client(&server.uri());
        client.check_status().await;

        let err = client
            .wait(&instance("web"), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::WaitTimeout(_)));
    }
}
