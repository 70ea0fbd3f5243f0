//! Status of a spot as a pure function of time and claim state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{Claim, SpotRecord};

/// Derived lifecycle status. Ordered by progression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpotStatus {
    Fresh,
    Expiring,
    Expired,
    Claimed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Evaluation {
    /// Whole seconds since creation, never negative
    pub age_seconds: i64,
    pub status: SpotStatus,
}

/// Point at which a spot of the given duration starts expiring.
pub fn warning_threshold(duration_seconds: u32) -> i64 {
    (f64::from(duration_seconds) * 0.9).floor() as i64
}

/// Classify a spot. Claims win over time; a future `created_at` counts as age 0.
pub fn evaluate(
    created_at: DateTime<Utc>,
    duration_seconds: u32,
    now: DateTime<Utc>,
    claim: Option<&Claim>,
) -> Evaluation {
    let age_seconds = (now - created_at).num_seconds().max(0);
    let duration = i64::from(duration_seconds);

    let status = if claim.is_some() {
        SpotStatus::Claimed
    } else if age_seconds >= duration {
        SpotStatus::Expired
    } else if age_seconds >= warning_threshold(duration_seconds) {
        SpotStatus::Expiring
    } else {
        SpotStatus::Fresh
    };

    Evaluation {
        age_seconds,
        status,
    }
}

pub fn evaluate_record(record: &SpotRecord, now: DateTime<Utc>) -> Evaluation {
    evaluate(
        record.created_at,
        record.duration_seconds,
        now,
        record.claim.as_ref(),
    )
}

/// Seconds left before the spot expires, zero once it has.
pub fn remaining_seconds(record: &SpotRecord, now: DateTime<Utc>) -> i64 {
    let age = evaluate_record(record, now).age_seconds;
    (i64::from(record.duration_seconds) - age).max(0)
}
