/*
 * SPDX-FileCopyrightText: Copyright 2024 LG Electronics Inc.
 * SPDX-License-Identifier: Apache-2.0
 */

//! Typed client for the container API every worker exposes.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use common::spec::{Instance, PortSpec};

use super::Result;

const CALL_TIMEOUT: Duration = Duration::from_secs(10);

/// Worker-side view of a container, echoing the identifying triple the
/// orchestrator correlates on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerInfo {
    pub id: String,
    pub formation: String,
    pub service: String,
    pub instance: String,
    pub image: String,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub ports: Vec<PortSpec>,
    pub state: String,
}

impl ContainerInfo {
    /// Whether this container realizes the given instance.
    pub fn matches(&self, inst: &Instance) -> bool {
        self.formation == inst.formation
            && self.service == inst.service
            && self.instance == inst.instance
    }
}

/// REST client for one worker's container endpoint.
pub struct WorkerApi {
    http: reqwest::Client,
    base_url: String,
}

impl WorkerApi {
    /// Client for a registered worker, addressed through the service
    /// mesh naming scheme.
    pub fn new(worker: &str, formation: &str) -> Result<Self> {
        Self::with_base_url(format!("http://{}.api.{}.service:9000", worker, formation))
    }

    pub fn with_base_url(base_url: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(CALL_TIMEOUT).build()?;
        Ok(WorkerApi {
            http,
            base_url: base_url.into(),
        })
    }

    /// All containers the worker currently reports, keyed by id.
    pub async fn containers(&self) -> Result<HashMap<String, ContainerInfo>> {
        let resp = self
            .http
            .get(format!("{}/container", self.base_url))
            .send()
            .await?
            .error_for_status()?;
        Ok(resp.json().await?)
    }

    pub async fn create(&self, inst: &Instance) -> Result<ContainerInfo> {
        let resp = self
            .http
            .post(format!("{}/container", self.base_url))
            .json(&container_request(inst))
            .send()
            .await?
            .error_for_status()?;
        Ok(resp.json().await?)
    }

    /// Recreate the container in place with the instance's current
    /// config.
    pub async fn restart(&self, cid: &str, inst: &Instance) -> Result<ContainerInfo> {
        let resp = self
            .http
            .put(format!("{}/container/{}", self.base_url, cid))
            .json(&container_request(inst))
            .send()
            .await?
            .error_for_status()?;
        Ok(resp.json().await?)
    }

    pub async fn delete(&self, cid: &str) -> Result<()> {
        self.http
            .delete(format!("{}/container/{}", self.base_url, cid))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

fn container_request(inst: &Instance) -> serde_json::Value {
    serde_json::json!({
        "image": inst.image,
        "command": inst.command,
        "formation": inst.formation,
        "service": inst.service,
        "instance": inst.instance,
        "env": inst.env,
        "ports": inst.ports,
    })
}
