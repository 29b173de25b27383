/*
 * SPDX-FileCopyrightText: Copyright 2024 LG Electronics Inc.
 * SPDX-License-Identifier: Apache-2.0
 */

//! Placement and the periodic reconciliation loops.

pub mod expr;
pub mod loops;
pub mod policy;

pub use loops::{Dispatcher, Scheduler, Terminator, Updater};
pub use policy::PlacementPolicy;
