/*
 * SPDX-FileCopyrightText: Copyright 2024 LG Electronics Inc.
 * SPDX-License-Identifier: Apache-2.0
 */

//! Stores over the etcd key space: the watched instance mirror and the
//! CAS-on-create formation and release stores.

mod event;
mod formation;
mod instance;
mod release;

pub use event::StoreEvent;
pub use formation::FormationStore;
pub use instance::InstanceStore;
pub use release::ReleaseStore;

use async_trait::async_trait;
use common::spec::Instance;

/// Command-side handle to the instance store.
///
/// Mutators receive one of these; entities never hold a reference back
/// to their store. The production implementation writes through to
/// etcd, tests substitute an in-memory fake.
#[async_trait]
pub trait InstanceWriter: Send + Sync {
    /// Persist a new instance. Returns the record as written.
    async fn create(&self, instance: Instance) -> common::Result<Instance>;

    /// Persist changed fields, bumping `changed_at`.
    async fn update(&self, instance: &mut Instance) -> common::Result<()>;

    /// Remove the record.
    async fn delete(&self, instance: &Instance) -> common::Result<()>;
}
