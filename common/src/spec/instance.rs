/*
 * SPDX-FileCopyrightText: Copyright 2024 LG Electronics Inc.
 * SPDX-License-Identifier: Apache-2.0
 */

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::keys;
use super::release::{PortSpec, ServiceTemplate};

/// Closed set of instance lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InstanceState {
    /// Created, not yet placed on a worker.
    Pending,
    /// Placed but not yet realized on the worker.
    PendingDispatch,
    /// The worker has acknowledged the container.
    Running,
    /// Re-imaged for a new release; the worker must recreate it.
    Migrating,
    /// Terminate requested; the worker should delete the container.
    ShuttingDown,
    /// Terminate acknowledged; pending removal from the store.
    Terminated,
    /// The worker no longer reports the container, or it errored.
    Lost,
}

impl InstanceState {
    /// States that count towards a release's declared scale.
    pub fn is_live(self) -> bool {
        matches!(
            self,
            InstanceState::Pending
                | InstanceState::PendingDispatch
                | InstanceState::Running
                | InstanceState::Migrating
        )
    }
}

/// Placement options carried by an instance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Placement {
    /// Requirement expressions; a worker must satisfy every one.
    #[serde(default)]
    pub requirements: Vec<String>,
    /// Rank expression; lower score wins. Fewest containers when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rank: Option<String>,
}

/// One scheduled copy of a service.
///
/// Plain data: mutation goes through the store that owns the record,
/// never through the entity itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    pub formation: String,
    pub service: String,
    /// Short unique id within the service.
    pub instance: String,
    /// Derived `<service>.<instance>`, unique per formation.
    pub name: String,
    pub release: String,
    pub image: String,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub ports: Vec<PortSpec>,
    pub state: InstanceState,
    #[serde(default)]
    pub assigned_to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub placement: Option<Placement>,
    /// Bumped on every write through the command path; the timeout
    /// handlers key off it.
    pub changed_at: DateTime<Utc>,
}

impl Instance {
    /// Build a fresh pending instance from a service template.
    pub fn from_template(
        formation: &str,
        service: &str,
        release: &str,
        template: &ServiceTemplate,
    ) -> Self {
        let id = uuid::Uuid::new_v4().simple().to_string();
        Instance {
            formation: formation.to_owned(),
            service: service.to_owned(),
            name: format!("{}.{}", service, id),
            instance: id,
            release: release.to_owned(),
            image: template.image.clone(),
            command: template.command.clone(),
            env: template.env.clone(),
            ports: template.ports.clone(),
            state: InstanceState::Pending,
            assigned_to: None,
            placement: None,
            changed_at: Utc::now(),
        }
    }

    pub fn key(&self) -> String {
        keys::instance(&self.formation, &self.name)
    }

    /// Whether the frozen container config still matches the template.
    pub fn matches_template(&self, template: &ServiceTemplate) -> bool {
        self.image == template.image
            && self.command == template.command
            && self.env == template.env
            && self.ports == template.ports
    }
}
