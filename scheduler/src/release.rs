/*
 * SPDX-FileCopyrightText: Copyright 2024 LG Electronics Inc.
 * SPDX-License-Identifier: Apache-2.0
 */

//! Scale and migration steps over a release.
//!
//! Both operations do one bounded step per call and report whether more
//! work may remain, so a rollout stays interruptible and composable
//! with external retries. Callers drive them until `None`.

use rand::seq::SliceRandom;
use std::collections::BTreeMap;
use tracing::{info, warn};

use common::spec::{Instance, InstanceState, Release, ServiceTemplate};

use crate::store::InstanceWriter;

pub struct ReleaseCtl {
    formation: String,
    name: String,
    services: BTreeMap<String, ServiceTemplate>,
}

impl ReleaseCtl {
    pub fn new(release: Release) -> Self {
        ReleaseCtl {
            formation: release.formation,
            name: release.name,
            services: release.services,
        }
    }

    /// One scale step against the given snapshot of instances.
    ///
    /// Returns the instance written this step, or `None` when every
    /// service in `scales` is balanced.
    pub async fn scale(
        &self,
        instances: &[Instance],
        writer: &dyn InstanceWriter,
        scales: &BTreeMap<String, u32>,
    ) -> common::Result<Option<Instance>> {
        let mut per_service: BTreeMap<&str, Vec<&Instance>> = BTreeMap::new();
        for inst in instances {
            if inst.formation == self.formation
                && inst.release == self.name
                && inst.state.is_live()
            {
                per_service
                    .entry(inst.service.as_str())
                    .or_default()
                    .push(inst);
            }
        }

        for (service, want) in scales {
            let live = per_service
                .get(service.as_str())
                .map_or(&[][..], |group| group.as_slice());
            let want = *want as usize;

            if live.len() > want {
                let Some(victim) = live.choose(&mut rand::thread_rng()) else {
                    continue;
                };
                let mut victim = (*victim).clone();
                info!(instance = %victim.name, service = %service, "scaling down");
                victim.state = InstanceState::ShuttingDown;
                writer.update(&mut victim).await?;
                return Ok(Some(victim));
            }
            if live.len() < want {
                let Some(template) = self.services.get(service.as_str()) else {
                    warn!(service = %service, "scale requested for unknown service, skipping");
                    continue;
                };
                let inst =
                    Instance::from_template(&self.formation, service, &self.name, template);
                info!(instance = %inst.name, service = %service, "scaling up");
                let created = writer.create(inst).await?;
                return Ok(Some(created));
            }
        }
        Ok(None)
    }

    /// One migration step: roll the next live instance forward onto
    /// this release, in build order.
    ///
    /// Instances whose frozen config already equals the new template
    /// are re-released in place; the rest are re-imaged and handed to
    /// the updater via the `migrating` state. Instances of services
    /// this release dropped are shut down.
    pub async fn migrate(
        &self,
        instances: &[Instance],
        writer: &dyn InstanceWriter,
        from_release: Option<&str>,
    ) -> common::Result<Option<Instance>> {
        let candidates: Vec<&Instance> = instances
            .iter()
            .filter(|inst| {
                inst.formation == self.formation
                    && inst.state.is_live()
                    && from_release.map_or(true, |from| inst.release == from)
                    && inst.release != self.name
            })
            .collect();

        let mut by_service: BTreeMap<&str, Vec<&Instance>> = BTreeMap::new();
        for inst in &candidates {
            by_service
                .entry(inst.service.as_str())
                .or_default()
                .push(inst);
        }

        let mut ordered: Vec<&Instance> = Vec::new();
        for service in self.build_order() {
            if let Some(group) = by_service.remove(service.as_str()) {
                ordered.extend(group);
            }
        }
        // Services dropped by this release roll out last.
        for group in by_service.into_values() {
            ordered.extend(group);
        }

        let Some(first) = ordered.first() else {
            return Ok(None);
        };
        let mut inst = (*first).clone();

        match self.services.get(&inst.service) {
            None => {
                info!(instance = %inst.name, release = %self.name, "service dropped, shutting down");
                inst.state = InstanceState::ShuttingDown;
            }
            Some(template) if inst.matches_template(template) => {
                info!(instance = %inst.name, release = %self.name, "re-release");
                inst.release = self.name.clone();
            }
            Some(template) => {
                info!(instance = %inst.name, release = %self.name, "migrate");
                inst.release = self.name.clone();
                inst.image = template.image.clone();
                inst.command = template.command.clone();
                inst.env = template.env.clone();
                inst.ports = template.ports.clone();
                inst.state = InstanceState::Migrating;
            }
        }
        writer.update(&mut inst).await?;
        Ok(Some(inst))
    }

    /// Service roll order: every service comes after everything it
    /// requires. Stable for equal-rank services (name order); a
    /// requires cycle degrades to name order for the remainder.
    pub fn build_order(&self) -> Vec<String> {
        let mut emitted: Vec<String> = Vec::new();
        let mut remaining: Vec<(&String, &ServiceTemplate)> = self.services.iter().collect();

        while !remaining.is_empty() {
            let before = emitted.len();
            let mut next = Vec::new();
            for (name, template) in remaining {
                let ready = template
                    .requires
                    .iter()
                    .all(|req| emitted.contains(req) || !self.services.contains_key(req));
                if ready {
                    emitted.push(name.clone());
                } else {
                    next.push((name, template));
                }
            }
            if emitted.len() == before {
                warn!(release = %self.name, "requires cycle, using name order for the rest");
                emitted.extend(next.into_iter().map(|(name, _)| name.clone()));
                break;
            }
            remaining = next;
        }
        emitted
    }
}
