/*
 * SPDX-FileCopyrightText: Copyright 2024 LG Electronics Inc.
 * SPDX-License-Identifier: Apache-2.0
 */

pub mod limiter;
pub mod lock;
pub mod logging;
pub mod task;

pub use limiter::TokenBucketRateLimiter;
pub use lock::LeaderLock;
pub use task::RecurringTask;
