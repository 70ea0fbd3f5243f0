use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::models::{Coordinates, PositionSample, RemoteReport, ReportDraft};
use crate::remote::types::{FeedQuery, FeedScope, PositionOptions};

/// Mutations on the shared report collection.
///
/// Calls are fire-and-forget from the engine's point of view: a failure is
/// reported to the user, never retried automatically.
#[async_trait]
pub trait ReportApi: Send + Sync {
    /// Create a report, returning its server id
    async fn create(&self, draft: &ReportDraft) -> Result<String>;

    async fn delete(&self, id: &str) -> Result<()>;

    /// Mark a report resolved by `claimant_id`
    async fn claim(&self, id: &str, claimant_id: &str) -> Result<()>;

    /// Undo a claim, making the report open again
    async fn reopen(&self, id: &str) -> Result<()>;

    fn backend_name(&self) -> &'static str;
}

/// Something the feed pushed
#[derive(Debug, Clone)]
pub enum FeedEvent {
    Snapshot {
        scope: FeedScope,
        reports: Vec<RemoteReport>,
    },
    Error {
        scope: FeedScope,
        message: String,
    },
}

/// Push-based source of report snapshots. Each subscription may redeliver
/// full snapshots any number of times.
pub trait ReportFeed: Send + Sync {
    fn subscribe(&self, query: FeedQuery, events: mpsc::Sender<FeedEvent>) -> Subscription;
}

/// Stream of GPS fixes
pub trait PositionSource: Send + Sync {
    fn subscribe(
        &self,
        options: PositionOptions,
        samples: mpsc::Sender<PositionSample>,
    ) -> Subscription;
}

/// Advisory check that a location is plausibly somewhere a car can park
#[async_trait]
pub trait RoadVerifier: Send + Sync {
    async fn is_near_road(&self, coords: &Coordinates) -> Result<bool>;
}

/// Run the road check, allowing the action when the check itself fails.
pub async fn verify_or_allow(verifier: &dyn RoadVerifier, coords: &Coordinates) -> bool {
    match verifier.is_near_road(coords).await {
        Ok(near) => near,
        Err(e) => {
            warn!("Road check failed, allowing spot: {:#}", e);
            true
        }
    }
}

/// Handle to a running subscription. Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    label: String,
    task: Option<JoinHandle<()>>,
}

impl Subscription {
    pub fn new(label: impl Into<String>, task: JoinHandle<()>) -> Self {
        Self {
            label: label.into(),
            task: Some(task),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            debug!("Unsubscribed {}", self.label);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Broken;

    #[async_trait]
    impl RoadVerifier for Broken {
        async fn is_near_road(&self, _coords: &Coordinates) -> Result<bool> {
            anyhow::bail!("lookup timed out")
        }
    }

    struct Field;

    #[async_trait]
    impl RoadVerifier for Field {
        async fn is_near_road(&self, _coords: &Coordinates) -> Result<bool> {
            Ok(false)
        }
    }

    #[tokio::test]
    async fn test_road_check_fails_open() {
        let coords = Coordinates::new(59.31, 18.07).unwrap();
        assert!(verify_or_allow(&Broken, &coords).await);
        assert!(!verify_or_allow(&Field, &coords).await);
    }

    #[tokio::test]
    async fn test_dropping_subscription_aborts_task() {
        let (tx, mut rx) = mpsc::channel::<()>(1);
        let task = tokio::spawn(async move {
            while tx.send(()).await.is_ok() {
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
        });
        let sub = Subscription::new("test", task);
        assert!(rx.recv().await.is_some());

        drop(sub);
        // The aborted task drops its sender, closing the channel
        while rx.recv().await.is_some() {}
    }
}
