/*
 * SPDX-FileCopyrightText: Copyright 2024 LG Electronics Inc.
 * SPDX-License-Identifier: Apache-2.0
 */

//! Service registry lookups.
//!
//! The registry answers `GET /v1/formation/<name>` with a JSON map of
//! worker-name to worker attributes. Nodes are tried in order; the
//! first one that answers wins.

use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

use super::{Result, WorkerError};

const CALL_TIMEOUT: Duration = Duration::from_secs(10);

/// Worker attributes as reported by the service registry.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct WorkerInfo {
    /// Worker identifier; also the DNS label its API lives under.
    pub instance: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub domain: String,
}

pub struct RegistryClient {
    http: reqwest::Client,
    nodes: Vec<String>,
}

impl RegistryClient {
    pub fn new(nodes: Vec<String>) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(CALL_TIMEOUT).build()?;
        Ok(RegistryClient { http, nodes })
    }

    /// Current workers of a formation, keyed by registry entry name.
    pub async fn query_formation(&self, formation: &str) -> Result<HashMap<String, WorkerInfo>> {
        for node in &self.nodes {
            let url = format!("{}/v1/formation/{}", node_url(node), formation);
            match self.try_node(&url).await {
                Ok(workers) => return Ok(workers),
                Err(err) => debug!(node = %node, "registry node failed: {err}"),
            }
        }
        Err(WorkerError::RegistryUnavailable)
    }

    async fn try_node(&self, url: &str) -> Result<HashMap<String, WorkerInfo>> {
        let resp = self.http.get(url).send().await?.error_for_status()?;
        Ok(resp.json().await?)
    }
}

fn node_url(node: &str) -> String {
    if node.starts_with("http://") || node.starts_with("https://") {
        node.trim_end_matches('/').to_owned()
    } else {
        format!("http://{}", node)
    }
}
