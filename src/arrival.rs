//! Infers from GPS samples that the user has parked on their last reported
//! spot.
//!
//! A sample qualifies when it lies within the arrival radius of the target
//! and every sample in the sliding window stays within the movement threshold
//! of the window's oldest sample. Qualifying samples spanning the dwell
//! duration without interruption trigger one auto-claim per report id.

use std::collections::{HashSet, VecDeque};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::MAX_WINDOW_SECS;
use crate::geo::{distance_m, max_deviation_m};
use crate::models::{Coordinates, LastReported, PositionSample};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArrivalConfig {
    pub enabled: bool,
    pub radius_m: f64,
    pub movement_threshold_m: f64,
    pub dwell_secs: i64,
    pub window_capacity: usize,
}

impl Default for ArrivalConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            radius_m: 25.0,
            movement_threshold_m: 15.0,
            dwell_secs: 60,
            window_capacity: 12,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ArrivalDecision {
    /// No target, target already claimed, or detection disabled
    Idle,
    /// Sample failed the coordinate check and was dropped
    Rejected,
    /// Outside the radius or moving; dwell timer cleared
    Away { distance_m: f64 },
    /// Qualifying sample, still waiting for the dwell duration
    Dwelling { since: DateTime<Utc> },
    /// Dwell complete, claim this report now
    Arrived { report_id: String },
}

#[derive(Debug)]
pub struct ArrivalDetector {
    config: ArrivalConfig,
    dwell: Duration,
    window: VecDeque<Coordinates>,
    dwell_start: Option<DateTime<Utc>>,
    target_id: Option<String>,
    claimed: HashSet<String>,
}

impl ArrivalDetector {
    pub fn new(config: ArrivalConfig) -> Self {
        let capacity = config.window_capacity.max(1);
        let dwell = Duration::seconds(config.dwell_secs.clamp(0, MAX_WINDOW_SECS));
        Self {
            config,
            dwell,
            window: VecDeque::with_capacity(capacity),
            dwell_start: None,
            target_id: None,
            claimed: HashSet::new(),
        }
    }

    pub fn is_claimed(&self, report_id: &str) -> bool {
        self.claimed.contains(report_id)
    }

    /// Process one position sample against the current target.
    pub fn observe(
        &mut self,
        sample: &PositionSample,
        target: Option<&LastReported>,
    ) -> ArrivalDecision {
        let Some(target) = target.filter(|_| self.config.enabled) else {
            return ArrivalDecision::Idle;
        };
        let report_id = target.report_id();
        if self.claimed.contains(report_id) {
            return ArrivalDecision::Idle;
        }

        let position = match sample.coordinates() {
            Ok(position) => position,
            Err(e) => {
                warn!("Dropping position sample: {}", e);
                return ArrivalDecision::Rejected;
            }
        };

        if self.target_id.as_deref() != Some(target.local_id.as_str()) {
            self.target_id = Some(target.local_id.clone());
            self.dwell_start = None;
        }

        self.window.push_back(position);
        while self.window.len() > self.config.window_capacity.max(1) {
            self.window.pop_front();
        }

        let distance = distance_m(&position, &target.coordinates);
        let inside = distance <= self.config.radius_m;
        let stationary = match self.window.front() {
            Some(oldest) => {
                max_deviation_m(oldest, self.window.iter()) <= self.config.movement_threshold_m
            }
            None => true,
        };

        if !(inside && stationary) {
            if self.dwell_start.take().is_some() {
                debug!(
                    "Dwell reset at {:.1} m from {} (stationary: {})",
                    distance, report_id, stationary
                );
            }
            return ArrivalDecision::Away {
                distance_m: distance,
            };
        }

        let now = sample.timestamp;
        let since = *self.dwell_start.get_or_insert_with(|| {
            debug!("Dwell started near {}", report_id);
            now
        });

        if now - since >= self.dwell {
            self.dwell_start = None;
            self.claimed.insert(report_id.to_string());
            info!(
                "Arrival detected at {} after {}s",
                report_id,
                (now - since).num_seconds()
            );
            return ArrivalDecision::Arrived {
                report_id: report_id.to_string(),
            };
        }

        ArrivalDecision::Dwelling { since }
    }

    /// Forget a claim marker so detection can fire again. Used when the
    /// remote claim failed or the claim was undone. Idempotent.
    pub fn release(&mut self, report_id: &str) -> bool {
        let released = self.claimed.remove(report_id);
        if released {
            self.dwell_start = None;
        }
        released
    }

    pub fn mark_claimed(&mut self, report_id: &str) {
        self.claimed.insert(report_id.to_string());
        self.dwell_start = None;
    }

    /// Carry the claim marker over when a pending record gets its remote id.
    pub fn rename(&mut self, from: &str, to: &str) {
        if self.claimed.remove(from) {
            self.claimed.insert(to.to_string());
        }
    }

    pub fn reset(&mut self) {
        self.window.clear();
        self.dwell_start = None;
        self.target_id = None;
    }
}
