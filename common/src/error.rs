/*
 * SPDX-FileCopyrightText: Copyright 2024 LG Electronics Inc.
 * SPDX-License-Identifier: Apache-2.0
 */

//! Error types shared by the etcd-backed stores

use thiserror::Error;

/// Errors surfaced by the storage layer.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("etcd operation failed: {0}")]
    Etcd(#[from] etcd_client::Error),

    #[error("serialization failed: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("key already exists: {0}")]
    AlreadyExists(String),

    #[error("malformed key: {0}")]
    MalformedKey(String),

    #[error("lease {0} expired")]
    LeaseExpired(i64),
}

pub type Result<T> = std::result::Result<T, StoreError>;
