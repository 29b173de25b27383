/*
 * SPDX-FileCopyrightText: Copyright 2024 LG Electronics Inc.
 * SPDX-License-Identifier: Apache-2.0
 */

//! Best-effort mirror of observed instance state into redis.
//!
//! The API reads through this cache instead of hitting the store for
//! every status request. Cache failures are swallowed; the mirror is a
//! convenience, never a dependency.

use redis::AsyncCommands;
use serde_json::json;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use common::spec::Instance;

use crate::store::StoreEvent;

const TTL_SECS: u64 = 24 * 60 * 60;

pub struct StateCache {
    client: redis::Client,
}

impl StateCache {
    pub fn new(url: &str) -> Option<Self> {
        match redis::Client::open(url) {
            Ok(client) => Some(StateCache { client }),
            Err(err) => {
                warn!("state cache disabled, bad redis url: {err}");
                None
            }
        }
    }

    /// Save state for the given service instance and publish it on the
    /// formation channel.
    pub async fn save(&self, formation: &str, service: &str, instance: &str, data: &serde_json::Value) {
        if let Err(err) = self.try_save(formation, service, instance, data).await {
            debug!("cannot talk to redis: {err}");
        }
    }

    async fn try_save(
        &self,
        formation: &str,
        service: &str,
        instance: &str,
        data: &serde_json::Value,
    ) -> redis::RedisResult<()> {
        let mut con = self.client.get_multiplexed_async_connection().await?;
        let payload = data.to_string();
        let key = format!("{}:{}:{}", formation, service, instance);
        con.set_ex::<_, _, ()>(&key, &payload, TTL_SECS).await?;
        con.publish::<_, _, ()>(format!("formation:{}", formation), payload)
            .await?;
        Ok(())
    }

    /// Read-through lookup; an unreachable cache reads as empty state.
    pub async fn lookup(&self, formation: &str, service: &str, instance: &str) -> serde_json::Value {
        match self.try_lookup(formation, service, instance).await {
            Ok(Some(value)) => value,
            Ok(None) => json!({}),
            Err(err) => {
                debug!("cannot talk to redis: {err}");
                json!({})
            }
        }
    }

    async fn try_lookup(
        &self,
        formation: &str,
        service: &str,
        instance: &str,
    ) -> redis::RedisResult<Option<serde_json::Value>> {
        let mut con = self.client.get_multiplexed_async_connection().await?;
        let key = format!("{}:{}:{}", formation, service, instance);
        let raw: Option<String> = con.get(&key).await?;
        Ok(raw.and_then(|data| serde_json::from_str(&data).ok()))
    }
}

fn cache_payload(inst: &Instance) -> serde_json::Value {
    json!({
        "name": inst.name,
        "release": inst.release,
        "state": inst.state,
        "assigned_to": inst.assigned_to,
        "changed_at": inst.changed_at,
    })
}

/// Feed store events into the cache until the event bus closes.
pub fn start_mirror(
    cache: std::sync::Arc<StateCache>,
    mut events: broadcast::Receiver<StoreEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    let inst = event.instance();
                    let payload = match event {
                        StoreEvent::Deleted(_) => json!({}),
                        _ => cache_payload(inst),
                    };
                    cache
                        .save(&inst.formation, &inst.service, &inst.instance, &payload)
                        .await;
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!("state cache mirror lagged by {missed} events");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

//Unit Test Cases
#[cfg(test)]
mod tests {
    use super::*;
    use common::spec::{InstanceState, ServiceTemplate};

    #[test]
    fn test_bad_url_disables_cache() {
        assert!(StateCache::new("not a url").is_none());
        assert!(StateCache::new("redis://localhost:6379").is_some());
    }

    #[test]
    fn test_cache_payload_shape() {
        let template = ServiceTemplate {
            image: String::from("registry/web:1"),
            ..ServiceTemplate::default()
        };
        let mut inst = Instance::from_template("assembly", "web", "1", &template);
        inst.state = InstanceState::Running;
        inst.assigned_to = Some(String::from("hype1"));

        let payload = cache_payload(&inst);
        assert_eq!(payload["name"], inst.name.as_str());
        assert_eq!(payload["state"], "running");
        assert_eq!(payload["assigned_to"], "hype1");
        assert_eq!(payload["release"], "1");
    }
}
