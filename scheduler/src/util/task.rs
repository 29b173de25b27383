/*
 * SPDX-FileCopyrightText: Copyright 2024 LG Electronics Inc.
 * SPDX-License-Identifier: Apache-2.0
 */

//! Recurring task runner backing the reconciliation loops.

use std::future::Future;
use std::sync::Arc;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::Duration;

/// Runs a closure, sleeps for the interval, repeats. A stop signal or
/// an explicit wake-up interrupts the sleep; on stop the task exits at
/// the next loop head.
pub struct RecurringTask {
    stop: watch::Sender<bool>,
    wake: Arc<Notify>,
    handle: JoinHandle<()>,
}

impl RecurringTask {
    pub fn spawn<F, Fut>(interval: Duration, mut body: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let wake = Arc::new(Notify::new());
        let wake_rx = Arc::clone(&wake);

        let handle = tokio::spawn(async move {
            loop {
                body().await;
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = wake_rx.notified() => {}
                    _ = stop_rx.changed() => {}
                }
                if *stop_rx.borrow() {
                    break;
                }
            }
        });

        RecurringTask {
            stop: stop_tx,
            wake,
            handle,
        }
    }

    /// Make sure the task body runs again soon.
    pub fn touch(&self) {
        self.wake.notify_one();
    }

    pub fn stop(&self) {
        let _ = self.stop.send(true);
    }

    pub async fn join(self) {
        let _ = self.handle.await;
    }
}
