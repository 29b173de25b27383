/*
 * SPDX-FileCopyrightText: Copyright 2024 LG Electronics Inc.
 * SPDX-License-Identifier: Apache-2.0
 */

//! PHI-accrual failure detection for worker nodes.
//!
//! Each successful worker poll is recorded as an arrival; the phi value
//! grows with the time since the last arrival relative to the observed
//! mean interval. The dispatcher stops sending work to a node whose phi
//! crosses the threshold, without removing it from the registry.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Instant;

const SAMPLE_WINDOW: usize = 100;

/// Default suspicion threshold; a worker polled every `t` seconds is
/// suspected roughly `8 * t` seconds after its last successful poll.
pub const PHI_THRESHOLD: f64 = 8.0;

#[derive(Debug, Default)]
struct FailureDetector {
    last_time: Option<f64>,
    intervals: VecDeque<f64>,
}

impl FailureDetector {
    fn add(&mut self, arrival_time: f64) {
        if let Some(last) = self.last_time.replace(arrival_time) {
            if self.intervals.len() == SAMPLE_WINDOW {
                self.intervals.pop_front();
            }
            self.intervals.push_back(arrival_time - last);
        }
    }

    fn phi(&self, current_time: f64) -> Option<f64> {
        let last = self.last_time?;
        if self.intervals.is_empty() {
            return None;
        }
        let mean = self.intervals.iter().sum::<f64>() / self.intervals.len() as f64;
        let exp = -1.0 * (current_time - last) / mean;
        Some(-1.0 * (exp.exp().ln() / 10f64.ln()))
    }
}

/// A repository of per-worker health state.
pub struct HealthStore {
    threshold: f64,
    epoch: Instant,
    states: Mutex<HashMap<String, FailureDetector>>,
}

impl HealthStore {
    pub fn new(threshold: f64) -> Self {
        HealthStore {
            threshold,
            epoch: Instant::now(),
            states: Mutex::new(HashMap::new()),
        }
    }

    fn now(&self) -> f64 {
        self.epoch.elapsed().as_secs_f64()
    }

    /// Record that the worker is alive at this point in time.
    pub fn mark(&self, id: &str) {
        self.mark_at(id, self.now());
    }

    pub fn phi(&self, id: &str) -> Option<f64> {
        self.phi_at(id, self.now())
    }

    /// `true` if the worker is considered alive. A worker without a
    /// phi value yet is considered dead.
    pub fn check(&self, id: &str) -> bool {
        self.check_at(id, self.now())
    }

    /// Drop state for a worker removed from the registry.
    pub fn forget(&self, id: &str) {
        self.states.lock().unwrap().remove(id);
    }

    fn mark_at(&self, id: &str, time: f64) {
        self.states
            .lock()
            .unwrap()
            .entry(id.to_owned())
            .or_default()
            .add(time);
    }

    fn phi_at(&self, id: &str, time: f64) -> Option<f64> {
        self.states.lock().unwrap().get(id).and_then(|d| d.phi(time))
    }

    fn check_at(&self, id: &str, time: f64) -> bool {
        match self.phi_at(id, time) {
            Some(phi) => phi <= self.threshold,
            None => false,
        }
    }
}
