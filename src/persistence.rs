//! On-device persistence of my spots and the last reported pointer.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::lifecycle::{evaluate_record, SpotStatus};
use crate::models::{LastReported, SpotRecord};

pub const MY_SPOTS_KEY: &str = "my_spots";
pub const LAST_REPORTED_KEY: &str = "last_reported_spot";

/// String key-value storage that survives restarts
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: String) -> Result<()>;
}

/// All keys in one pretty-printed JSON file.
pub struct JsonFileStore {
    path: PathBuf,
    lock: tokio::sync::Mutex<()>,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: tokio::sync::Mutex::new(()),
        }
    }

    async fn read_all(&self) -> Result<HashMap<String, String>> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => serde_json::from_str(&raw)
                .with_context(|| format!("Corrupt state file {}", self.path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
            Err(e) => Err(e).with_context(|| format!("Failed to read {}", self.path.display())),
        }
    }
}

#[async_trait]
impl KeyValueStore for JsonFileStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let _guard = self.lock.lock().await;
        Ok(self.read_all().await?.remove(key))
    }

    async fn set(&self, key: &str, value: String) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut all = self.read_all().await?;
        all.insert(key.to_string(), value);

        let json = serde_json::to_string_pretty(&all)?;
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, json)
            .await
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("Failed to replace {}", self.path.display()))?;
        debug!("Saved {} to {}", key, self.path.display());
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    values: Mutex<HashMap<String, String>>,
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self
            .values
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned())
    }

    async fn set(&self, key: &str, value: String) -> Result<()> {
        self.values
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_string(), value);
        Ok(())
    }
}

/// Everything restored at session start
#[derive(Debug, Default)]
pub struct SavedState {
    pub spots: Vec<SpotRecord>,
    pub last_reported: Option<LastReported>,
}

pub async fn save_spots<'a, I>(kv: &dyn KeyValueStore, spots: I) -> Result<()>
where
    I: IntoIterator<Item = &'a SpotRecord>,
{
    let spots: Vec<&SpotRecord> = spots.into_iter().collect();
    kv.set(MY_SPOTS_KEY, serde_json::to_string(&spots)?).await
}

pub async fn save_last_reported(kv: &dyn KeyValueStore, last: Option<&LastReported>) -> Result<()> {
    kv.set(LAST_REPORTED_KEY, serde_json::to_string(&last)?).await
}

/// Load saved state, dropping anything invalid or already expired.
pub async fn load(kv: &dyn KeyValueStore, now: DateTime<Utc>) -> Result<SavedState> {
    let mut state = SavedState::default();

    if let Some(raw) = kv.get(MY_SPOTS_KEY).await? {
        let spots: Vec<SpotRecord> = match serde_json::from_str(&raw) {
            Ok(spots) => spots,
            Err(e) => {
                warn!("Discarding unreadable saved spots: {}", e);
                Vec::new()
            }
        };
        state.spots = spots
            .into_iter()
            .filter(|r| match r.coordinates.validate() {
                Ok(()) => true,
                Err(e) => {
                    warn!("Dropping saved spot {}: {}", r.id, e);
                    false
                }
            })
            .filter(|r| r.duration_seconds > 0)
            .filter(|r| evaluate_record(r, now).status != SpotStatus::Expired)
            .collect();
    }

    if let Some(raw) = kv.get(LAST_REPORTED_KEY).await? {
        state.last_reported = serde_json::from_str::<Option<LastReported>>(&raw)
            .unwrap_or_default()
            .filter(|last| last.coordinates.validate().is_ok());
    }

    Ok(state)
}
