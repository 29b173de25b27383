/*
 * SPDX-FileCopyrightText: Copyright 2024 LG Electronics Inc.
 * SPDX-License-Identifier: Apache-2.0
 */

//! Release records under `release/<formation>/<name>`.
//!
//! Releases are immutable: creation is SET-if-absent so a version can
//! never be overwritten by accident.

use common::spec::{keys, Release};

pub struct ReleaseStore;

impl ReleaseStore {
    pub async fn get(formation: &str, name: &str) -> common::Result<Option<Release>> {
        match common::etcd::get(&keys::release(formation, name)).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Store a new release. Fails with [`common::StoreError::AlreadyExists`]
    /// when the version is already present.
    pub async fn create(release: &Release) -> common::Result<()> {
        let key = keys::release(&release.formation, &release.name);
        let value = serde_json::to_string(release)?;
        common::etcd::put_if_absent(&key, &value, None).await
    }

    pub async fn delete(formation: &str, name: &str) -> common::Result<()> {
        common::etcd::delete(&keys::release(formation, name)).await
    }

    /// All releases of a formation.
    pub async fn index(formation: &str) -> common::Result<Vec<Release>> {
        let prefix = format!("{}/{}/", keys::RELEASE_PREFIX, formation);
        let pairs = common::etcd::get_all_with_prefix(&prefix).await?;

        let mut releases = Vec::new();
        for pair in pairs {
            match serde_json::from_str::<Release>(&pair.value) {
                Ok(release) => releases.push(release),
                Err(err) => {
                    tracing::warn!(key = %pair.key, "skipping undecodable release: {err}")
                }
            }
        }
        Ok(releases)
    }
}
