/*
 * SPDX-FileCopyrightText: Copyright 2024 LG Electronics Inc.
 * SPDX-License-Identifier: Apache-2.0
 */

pub mod error;
pub mod etcd;
pub mod setting;
pub mod spec;

pub use error::{Result, StoreError};
