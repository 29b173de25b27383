/*
 * SPDX-FileCopyrightText: Copyright 2024 LG Electronics Inc.
 * SPDX-License-Identifier: Apache-2.0
 */

//! Clients for the worker nodes that actually run containers.
//!
//! One [`WorkerClient`] exists per registered worker; the
//! [`WorkerManager`] keeps that set in step with the service registry.

mod api;
mod client;
mod manager;
mod registry;

pub use api::{ContainerInfo, WorkerApi};
pub use client::WorkerClient;
pub use manager::WorkerManager;
pub use registry::{RegistryClient, WorkerInfo};

use thiserror::Error;

/// Errors surfaced by worker interactions.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// The client recently failed and refuses calls until the next
    /// successful poll.
    #[error("worker is marked problematic")]
    Problematic,

    #[error("no client for worker {0}")]
    UnknownWorker(String),

    #[error("no registry node answered")]
    RegistryUnavailable,

    #[error("worker call failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("store write failed: {0}")]
    Store(#[from] common::StoreError),

    #[error("timed out waiting for {0}")]
    WaitTimeout(String),
}

pub type Result<T> = std::result::Result<T, WorkerError>;
