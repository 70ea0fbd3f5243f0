use serde::{Deserialize, Serialize};

use crate::models::BoundingBox;

/// Which slice of the remote reports a feed subscription follows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedScope {
    /// Open reports inside a region, from everyone
    Region,
    /// Every report the current identity authored, any status
    Mine,
}

/// Parameters for a feed subscription
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedQuery {
    pub scope: FeedScope,
    /// Only used for `Region`; `None` means unbounded
    pub bounds: Option<BoundingBox>,
    /// Only used for `Mine`
    pub owner_id: Option<String>,
}

impl FeedQuery {
    pub fn region(bounds: Option<BoundingBox>) -> Self {
        Self {
            scope: FeedScope::Region,
            bounds,
            owner_id: None,
        }
    }

    pub fn mine(owner_id: &str) -> Self {
        Self {
            scope: FeedScope::Mine,
            bounds: None,
            owner_id: Some(owner_id.to_string()),
        }
    }
}

/// Desired accuracy for the position stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Accuracy {
    Low,
    Balanced,
    High,
}

impl Accuracy {
    /// Decimal places a fix is reported with, `None` for full precision.
    pub fn decimals(self) -> Option<i32> {
        match self {
            Accuracy::Low => Some(3),
            Accuracy::Balanced => Some(4),
            Accuracy::High => None,
        }
    }

    pub fn apply(self, value: f64) -> f64 {
        match self.decimals() {
            Some(places) => {
                let scale = 10f64.powi(places);
                (value * scale).round() / scale
            }
            None => value,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionOptions {
    pub accuracy: Accuracy,
    /// Minimum interval between samples
    pub interval_ms: u64,
}

impl Default for PositionOptions {
    fn default() -> Self {
        Self {
            accuracy: Accuracy::High,
            interval_ms: 1000,
        }
    }
}
