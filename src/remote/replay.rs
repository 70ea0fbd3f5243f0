use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::models::PositionSample;
use crate::remote::traits::{PositionSource, Subscription};
use crate::remote::types::PositionOptions;

/// Plays back a recorded GPS trace in real time.
///
/// Timestamps are shifted so the first sample lands at subscription time;
/// gaps between samples are preserved but never shorter than the requested
/// interval. Coordinates are rounded to the requested accuracy.
pub struct ReplayPositionSource {
    samples: Vec<PositionSample>,
}

impl ReplayPositionSource {
    pub fn new(mut samples: Vec<PositionSample>) -> Self {
        samples.sort_by_key(|s| s.timestamp);
        Self { samples }
    }

    /// Load a JSON array of `{latitude, longitude, timestamp}` objects.
    pub async fn from_file(path: &Path) -> Result<Self> {
        let raw = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read trace {}", path.display()))?;
        let samples: Vec<PositionSample> = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse trace {}", path.display()))?;
        info!("Loaded {} position samples from {}", samples.len(), path.display());
        Ok(Self::new(samples))
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

impl PositionSource for ReplayPositionSource {
    fn subscribe(
        &self,
        options: PositionOptions,
        samples: mpsc::Sender<PositionSample>,
    ) -> Subscription {
        let trace = self.samples.clone();
        let min_gap = Duration::from_millis(options.interval_ms);
        let accuracy = options.accuracy;

        let task = tokio::spawn(async move {
            let Some(first) = trace.first().map(|s| s.timestamp) else {
                warn!("Position trace is empty");
                return;
            };
            let start = Utc::now();
            let mut previous = first;

            for sample in trace {
                let gap = (sample.timestamp - previous).to_std().unwrap_or_default();
                tokio::time::sleep(gap.max(min_gap)).await;
                previous = sample.timestamp;

                let shifted = PositionSample {
                    latitude: accuracy.apply(sample.latitude),
                    longitude: accuracy.apply(sample.longitude),
                    timestamp: start + (sample.timestamp - first),
                };
                if samples.send(shifted).await.is_err() {
                    return;
                }
            }
            info!("Position trace finished");
        });

        Subscription::new("position replay", task)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::types::Accuracy;
    use std::io::Write;

    #[tokio::test]
    async fn test_replay_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"[
                {{"latitude": 59.3146, "longitude": 18.0736, "timestamp": "2024-05-01T10:00:01Z"}},
                {{"latitude": 59.3145, "longitude": 18.0736, "timestamp": "2024-05-01T10:00:00Z"}}
            ]"#
        )
        .unwrap();

        let source = ReplayPositionSource::from_file(file.path()).await.unwrap();
        assert_eq!(source.len(), 2);

        let (tx, mut rx) = mpsc::channel(4);
        let options = PositionOptions {
            interval_ms: 1,
            ..PositionOptions::default()
        };
        let _sub = source.subscribe(options, tx);

        let a = rx.recv().await.unwrap();
        let b = rx.recv().await.unwrap();
        assert_eq!(a.latitude, 59.3145);
        assert_eq!((b.timestamp - a.timestamp).num_seconds(), 1);
    }

    #[tokio::test]
    async fn test_low_accuracy_rounds_fixes() {
        let source = ReplayPositionSource::new(vec![PositionSample {
            latitude: 59.314_56,
            longitude: 18.073_64,
            timestamp: Utc::now(),
        }]);

        let (tx, mut rx) = mpsc::channel(1);
        let options = PositionOptions {
            accuracy: Accuracy::Low,
            interval_ms: 1,
        };
        let _sub = source.subscribe(options, tx);

        let fix = rx.recv().await.unwrap();
        assert!((fix.latitude - 59.315).abs() < 1e-9);
        assert!((fix.longitude - 18.074).abs() < 1e-9);
    }
}
