/*
 * SPDX-FileCopyrightText: Copyright 2024 LG Electronics Inc.
 * SPDX-License-Identifier: Apache-2.0
 */

//! Access layer for the etcd key-value store.
//!
//! Every value stored through this module is a JSON blob. Lookups of
//! absent keys are not errors; they return `None`.

pub use etcd_client::{WatchStream, Watcher};

use etcd_client::{
    Client, Compare, CompareOp, DeleteOptions, GetOptions, PutOptions, Txn, TxnOp, WatchOptions,
};

use crate::error::{Result, StoreError};

/// Key/value pair as read back from a prefix scan.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
}

pub fn open_server() -> String {
    crate::setting::get_config().database.clone()
}

async fn get_client() -> Result<Client> {
    Ok(Client::connect([open_server()], None).await?)
}

pub async fn put(key: &str, value: &str) -> Result<()> {
    let mut client = get_client().await?;
    client.put(key, value, None).await?;
    Ok(())
}

pub async fn put_with_lease(key: &str, value: &str, lease: i64) -> Result<()> {
    let mut client = get_client().await?;
    client
        .put(key, value, Some(PutOptions::new().with_lease(lease)))
        .await?;
    Ok(())
}

/// SET-if-absent, atomically, via a transaction on the key's create
/// revision. Fails with [`StoreError::AlreadyExists`] when the key is
/// already present.
pub async fn put_if_absent(key: &str, value: &str, lease: Option<i64>) -> Result<()> {
    let mut client = get_client().await?;
    let put = match lease {
        Some(id) => TxnOp::put(key, value, Some(PutOptions::new().with_lease(id))),
        None => TxnOp::put(key, value, None),
    };
    let txn = Txn::new()
        .when(vec![Compare::create_revision(key, CompareOp::Equal, 0)])
        .and_then(vec![put]);
    let resp = client.txn(txn).await?;
    if resp.succeeded() {
        Ok(())
    } else {
        Err(StoreError::AlreadyExists(key.to_owned()))
    }
}

pub async fn get(key: &str) -> Result<Option<String>> {
    let mut client = get_client().await?;
    let resp = client.get(key, None).await?;

    match resp.kvs().first() {
        Some(kv) => Ok(Some(kv.value_str()?.to_owned())),
        None => Ok(None),
    }
}

pub async fn get_all_with_prefix(prefix: &str) -> Result<Vec<KeyValue>> {
    let mut client = get_client().await?;
    let option = Some(GetOptions::new().with_prefix());
    let resp = client.get(prefix, option).await?;

    let mut pairs = Vec::new();
    for kv in resp.kvs() {
        pairs.push(KeyValue {
            key: kv.key_str()?.to_owned(),
            value: kv.value_str()?.to_owned(),
        });
    }
    Ok(pairs)
}

/// Prefix scan together with the store revision it was taken at, for
/// starting a watch right after the snapshot.
pub async fn get_all_with_revision(prefix: &str) -> Result<(Vec<KeyValue>, i64)> {
    let mut client = get_client().await?;
    let option = Some(GetOptions::new().with_prefix());
    let resp = client.get(prefix, option).await?;

    let revision = resp.header().map(|h| h.revision()).unwrap_or(0);
    let mut pairs = Vec::new();
    for kv in resp.kvs() {
        pairs.push(KeyValue {
            key: kv.key_str()?.to_owned(),
            value: kv.value_str()?.to_owned(),
        });
    }
    Ok((pairs, revision))
}

pub async fn delete(key: &str) -> Result<()> {
    let mut client = get_client().await?;
    client.delete(key, None).await?;
    Ok(())
}

pub async fn delete_all(prefix: &str) -> Result<()> {
    let mut client = get_client().await?;
    let option = Some(DeleteOptions::new().with_prefix());
    client.delete(prefix, option).await?;
    Ok(())
}

pub async fn grant_lease(ttl: i64) -> Result<i64> {
    let mut client = get_client().await?;
    let resp = client.lease_grant(ttl, None).await?;
    Ok(resp.id())
}

/// Send one keep-alive for the lease and confirm it is still live.
pub async fn keep_alive(lease: i64) -> Result<()> {
    let mut client = get_client().await?;
    let (mut keeper, mut stream) = client.lease_keep_alive(lease).await?;
    keeper.keep_alive().await?;
    if let Some(resp) = stream.message().await? {
        if resp.ttl() <= 0 {
            return Err(StoreError::LeaseExpired(lease));
        }
    }
    Ok(())
}

pub async fn revoke_lease(lease: i64) -> Result<()> {
    let mut client = get_client().await?;
    client.lease_revoke(lease).await?;
    Ok(())
}

/// Open a watch over a key prefix, optionally resuming from a revision.
pub async fn watch_prefix(prefix: &str, from_revision: Option<i64>) -> Result<(Watcher, WatchStream)> {
    let mut client = get_client().await?;
    let mut options = WatchOptions::new().with_prefix();
    if let Some(revision) = from_revision {
        options = options.with_start_revision(revision);
    }
    Ok(client.watch(prefix, Some(options)).await?)
}
