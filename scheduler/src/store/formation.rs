/*
 * SPDX-FileCopyrightText: Copyright 2024 LG Electronics Inc.
 * SPDX-License-Identifier: Apache-2.0
 */

//! Formation records under `formation/<name>`.

use common::spec::{keys, Formation};

pub struct FormationStore;

impl FormationStore {
    pub async fn get(name: &str) -> common::Result<Option<Formation>> {
        match common::etcd::get(&keys::formation(name)).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Store a new formation, SET-if-absent.
    pub async fn create(formation: &Formation) -> common::Result<()> {
        let key = keys::formation(&formation.name);
        let value = serde_json::to_string(formation)?;
        common::etcd::put_if_absent(&key, &value, None).await
    }

    pub async fn delete(name: &str) -> common::Result<()> {
        common::etcd::delete(&keys::formation(name)).await
    }

    pub async fn list() -> common::Result<Vec<Formation>> {
        let prefix = format!("{}/", keys::FORMATION_PREFIX);
        let pairs = common::etcd::get_all_with_prefix(&prefix).await?;

        let mut formations = Vec::new();
        for pair in pairs {
            match serde_json::from_str::<Formation>(&pair.value) {
                Ok(formation) => formations.push(formation),
                Err(err) => {
                    tracing::warn!(key = %pair.key, "skipping undecodable formation: {err}")
                }
            }
        }
        Ok(formations)
    }
}
