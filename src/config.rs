use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::arrival::ArrivalConfig;
use crate::remote::overpass::DEFAULT_ENDPOINT;

/// Upper bound for the undo window and the arrival dwell, one day
pub const MAX_WINDOW_SECS: i64 = 24 * 60 * 60;

/// Engine configuration. Every field has a default, so a config file only
/// needs to name what it changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Owner id for reports and claims; a random one is generated if unset
    pub identity: Option<String>,
    /// Period of the status re-evaluation tick
    pub tick_interval_ms: u64,
    pub undo_window_secs: i64,
    /// Quiet period before a map region change resubscribes the feed
    pub viewport_debounce_ms: i64,
    pub arrival: ArrivalConfig,
    pub remote: RemoteConfig,
    pub road_check: RoadCheckConfig,
    /// Where my spots survive restarts
    pub storage_path: PathBuf,
    /// Optional GPS trace to replay into the arrival detector
    pub positions_path: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            identity: None,
            tick_interval_ms: 1000,
            undo_window_secs: 45,
            viewport_debounce_ms: 300,
            arrival: ArrivalConfig::default(),
            remote: RemoteConfig::default(),
            road_check: RoadCheckConfig::default(),
            storage_path: PathBuf::from("parking-scout-state.json"),
            positions_path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// Report API root; the in-memory backend is used when unset
    pub base_url: Option<String>,
    pub poll_interval_ms: u64,
    pub timeout_secs: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            poll_interval_ms: 2000,
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RoadCheckConfig {
    pub enabled: bool,
    pub endpoint: String,
    pub radius_m: f64,
    pub timeout_secs: u64,
}

impl Default for RoadCheckConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: DEFAULT_ENDPOINT.to_string(),
            radius_m: 30.0,
            timeout_secs: 5,
        }
    }
}

impl Config {
    pub async fn load(path: &Path) -> Result<Self> {
        let raw = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: Config = serde_json::from_str(&raw)
            .with_context(|| format!("Invalid config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.tick_interval_ms == 0 {
            anyhow::bail!("tick_interval_ms must be positive");
        }
        if !(1..=MAX_WINDOW_SECS).contains(&self.undo_window_secs) {
            anyhow::bail!("undo_window_secs must be between 1 and {MAX_WINDOW_SECS}");
        }
        if !(0..=MAX_WINDOW_SECS * 1000).contains(&self.viewport_debounce_ms) {
            anyhow::bail!("viewport_debounce_ms must be between 0 and {}", MAX_WINDOW_SECS * 1000);
        }
        let arrival = &self.arrival;
        if !(arrival.radius_m > 0.0 && arrival.movement_threshold_m > 0.0) {
            anyhow::bail!("arrival radius and movement threshold must be positive");
        }
        if !(0..=MAX_WINDOW_SECS).contains(&arrival.dwell_secs) {
            anyhow::bail!("arrival dwell_secs must be between 0 and {MAX_WINDOW_SECS}");
        }
        if arrival.window_capacity == 0 {
            anyhow::bail!("arrival window_capacity must be positive");
        }
        Ok(())
    }
}
