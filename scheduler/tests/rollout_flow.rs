/*
 * SPDX-FileCopyrightText: Copyright 2024 LG Electronics Inc.
 * SPDX-License-Identifier: Apache-2.0
 */

//! End-to-end flow over the pure decision layers: scale a release up,
//! place the instances, then roll the formation onto a new release.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Mutex;

use common::spec::{Instance, InstanceState, Release, ServiceTemplate};
use scheduler::release::ReleaseCtl;
use scheduler::sched::policy::{Candidate, PlacementPolicy};
use scheduler::store::InstanceWriter;

#[derive(Default)]
struct MemWriter {
    log: Mutex<Vec<Instance>>,
}

#[async_trait]
impl InstanceWriter for MemWriter {
    async fn create(&self, instance: Instance) -> common::Result<Instance> {
        self.log.lock().unwrap().push(instance.clone());
        Ok(instance)
    }

    async fn update(&self, instance: &mut Instance) -> common::Result<()> {
        instance.changed_at = chrono::Utc::now();
        self.log.lock().unwrap().push(instance.clone());
        Ok(())
    }

    async fn delete(&self, _instance: &Instance) -> common::Result<()> {
        Ok(())
    }
}

fn release(name: &str, services: Vec<(&str, ServiceTemplate)>) -> Release {
    Release {
        formation: String::from("assembly"),
        name: name.to_owned(),
        services: services
            .into_iter()
            .map(|(service, template)| (service.to_owned(), template))
            .collect(),
    }
}

fn template(image: &str, requires: &[&str]) -> ServiceTemplate {
    ServiceTemplate {
        image: image.to_owned(),
        requires: requires.iter().map(|r| (*r).to_owned()).collect(),
        ..ServiceTemplate::default()
    }
}

fn candidate(name: &str, containers: usize) -> Candidate {
    Candidate {
        name: name.to_owned(),
        tags: vec![],
        host: format!("{}.example", name),
        domain: String::from("dc1"),
        containers,
    }
}

fn upsert(view: &mut Vec<Instance>, inst: Instance) {
    if let Some(slot) = view.iter_mut().find(|existing| existing.name == inst.name) {
        *slot = inst;
    } else {
        view.push(inst);
    }
}

/// Scale up from zero, then place every pending instance the way the
/// scheduler loop does: select, assign, count the placement.
#[tokio::test]
async fn test_scale_up_and_spread_across_workers() {
    let rel = release("1", vec![("web", template("w:1", &[]))]);
    let ctl = ReleaseCtl::new(rel);
    let writer = MemWriter::default();
    let mut view: Vec<Instance> = Vec::new();
    let scales = BTreeMap::from([(String::from("web"), 3)]);

    while let Some(inst) = ctl.scale(&view, &writer, &scales).await.unwrap() {
        upsert(&mut view, inst);
    }
    assert_eq!(view.len(), 3);
    assert!(view.iter().all(|inst| inst.state == InstanceState::Pending));

    let policy = PlacementPolicy;
    let mut candidates = vec![candidate("hype1", 0), candidate("hype2", 0)];
    for inst in view.iter_mut() {
        let chosen = policy
            .select(&candidates, inst.placement.as_ref())
            .expect("a worker qualifies");
        inst.state = InstanceState::PendingDispatch;
        inst.assigned_to = Some(chosen.clone());
        if let Some(cand) = candidates.iter_mut().find(|c| c.name == chosen) {
            cand.containers += 1;
        }
    }

    // Three instances over two workers must not pile onto one.
    let on_hype1 = view
        .iter()
        .filter(|inst| inst.assigned_to.as_deref() == Some("hype1"))
        .count();
    let on_hype2 = view
        .iter()
        .filter(|inst| inst.assigned_to.as_deref() == Some("hype2"))
        .count();
    assert_eq!(on_hype1 + on_hype2, 3);
    assert!(on_hype1 >= 1 && on_hype2 >= 1);
}

/// Roll a two-service formation to a new release and verify the
/// dependency rolls before its dependent, with the scale preserved.
#[tokio::test]
async fn test_rolling_migration_keeps_dependency_order() {
    let old = release(
        "1",
        vec![
            ("db", template("d:1", &[])),
            ("web", template("w:1", &["db"])),
        ],
    );
    let new = release(
        "2",
        vec![
            ("db", template("d:2", &[])),
            ("web", template("w:2", &["db"])),
        ],
    );

    // Two running instances of each service on release 1.
    let writer = MemWriter::default();
    let mut view: Vec<Instance> = Vec::new();
    let ctl_old = ReleaseCtl::new(old);
    let scales = BTreeMap::from([(String::from("db"), 2), (String::from("web"), 2)]);
    while let Some(inst) = ctl_old.scale(&view, &writer, &scales).await.unwrap() {
        upsert(&mut view, inst);
    }
    for inst in view.iter_mut() {
        inst.state = InstanceState::Running;
        inst.assigned_to = Some(String::from("hype1"));
    }

    let ctl_new = ReleaseCtl::new(new);
    let rollout = MemWriter::default();
    while let Some(inst) = ctl_new.migrate(&view, &rollout, None).await.unwrap() {
        upsert(&mut view, inst);
    }

    let order: Vec<String> = rollout
        .log
        .lock()
        .unwrap()
        .iter()
        .map(|inst| inst.service.clone())
        .collect();
    assert_eq!(order, vec!["db", "db", "web", "web"]);

    assert!(view
        .iter()
        .all(|inst| inst.release == "2" && inst.state == InstanceState::Migrating));
    assert_eq!(view.len(), 4);

    // Idempotence: the rollout is complete.
    assert!(ctl_new.migrate(&view, &rollout, None).await.unwrap().is_none());
}
