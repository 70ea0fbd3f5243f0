use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};
use tracing::debug;

use crate::clock::Clock;
use crate::models::{RemoteReport, ReportDraft, ReportStatus};
use crate::remote::traits::{FeedEvent, ReportApi, ReportFeed, Subscription};
use crate::remote::types::{FeedQuery, FeedScope};

/// Remote operations that can be made to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Create,
    Delete,
    Claim,
    Reopen,
}

#[derive(Default)]
struct Inner {
    reports: BTreeMap<String, RemoteReport>,
    next_id: u64,
    failing: HashSet<Operation>,
}

/// Report backend living in process memory. Every mutation pushes a fresh
/// snapshot to all subscribers.
#[derive(Clone)]
pub struct MemoryReportService {
    inner: Arc<Mutex<Inner>>,
    changes: broadcast::Sender<()>,
    clock: Arc<dyn Clock>,
}

impl MemoryReportService {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        let (changes, _) = broadcast::channel(16);
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            changes,
            clock,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Make an operation fail until cleared.
    pub fn set_failing(&self, op: Operation, failing: bool) {
        let mut inner = self.lock();
        if failing {
            inner.failing.insert(op);
        } else {
            inner.failing.remove(&op);
        }
    }

    fn check(&self, op: Operation) -> Result<()> {
        if self.lock().failing.contains(&op) {
            anyhow::bail!("{op:?} rejected by server");
        }
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<RemoteReport> {
        self.lock().reports.get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().reports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of live feed subscriptions
    pub fn subscriber_count(&self) -> usize {
        self.changes.receiver_count()
    }

    pub fn snapshot(&self, query: &FeedQuery) -> Vec<RemoteReport> {
        self.lock()
            .reports
            .values()
            .filter(|r| match query.scope {
                FeedScope::Region => {
                    r.status == ReportStatus::Open
                        && query.bounds.map_or(true, |b| b.contains(&r.coordinates))
                }
                FeedScope::Mine => query.owner_id.as_deref() == Some(r.owner_id.as_str()),
            })
            .cloned()
            .collect()
    }

    fn update<F>(&self, id: &str, f: F) -> Result<()>
    where
        F: FnOnce(&mut RemoteReport),
    {
        {
            let mut inner = self.lock();
            let report = inner
                .reports
                .get_mut(id)
                .ok_or_else(|| anyhow::anyhow!("No report {id}"))?;
            f(report);
        }
        let _ = self.changes.send(());
        Ok(())
    }
}

#[async_trait]
impl ReportApi for MemoryReportService {
    async fn create(&self, draft: &ReportDraft) -> Result<String> {
        self.check(Operation::Create)?;
        let id = {
            let mut inner = self.lock();
            inner.next_id += 1;
            let id = format!("R{}", inner.next_id);
            inner.reports.insert(
                id.clone(),
                RemoteReport {
                    id: id.clone(),
                    owner_id: draft.owner_id.clone(),
                    coordinates: draft.coordinates,
                    kind: draft.kind,
                    rate: draft.rate.clone(),
                    status: ReportStatus::Open,
                    created_at: self.clock.now(),
                    duration_seconds: draft.duration_seconds,
                    resolved_by: None,
                    resolved_at: None,
                },
            );
            id
        };
        debug!("Memory backend created {}", id);
        let _ = self.changes.send(());
        Ok(id)
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.check(Operation::Delete)?;
        self.lock().reports.remove(id);
        let _ = self.changes.send(());
        Ok(())
    }

    async fn claim(&self, id: &str, claimant_id: &str) -> Result<()> {
        self.check(Operation::Claim)?;
        let now = self.clock.now();
        self.update(id, |r| {
            r.status = ReportStatus::Resolved;
            r.resolved_by = Some(claimant_id.to_string());
            r.resolved_at = Some(now);
        })
    }

    async fn reopen(&self, id: &str) -> Result<()> {
        self.check(Operation::Reopen)?;
        self.update(id, |r| {
            r.status = ReportStatus::Open;
            r.resolved_by = None;
            r.resolved_at = None;
        })
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

impl ReportFeed for MemoryReportService {
    fn subscribe(&self, query: FeedQuery, events: mpsc::Sender<FeedEvent>) -> Subscription {
        let service = self.clone();
        let mut changes = self.changes.subscribe();
        let label = format!("memory {:?} feed", query.scope);

        let task = tokio::spawn(async move {
            loop {
                let event = FeedEvent::Snapshot {
                    scope: query.scope,
                    reports: service.snapshot(&query),
                };
                if events.send(event).await.is_err() {
                    break;
                }
                match changes.recv().await {
                    Ok(()) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Subscription::new(label, task)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::models::{BoundingBox, Coordinates, SpotKind};

    fn draft(owner: &str, lat: f64) -> ReportDraft {
        ReportDraft {
            owner_id: owner.to_string(),
            coordinates: Coordinates::new(lat, 18.07).unwrap(),
            kind: SpotKind::Free,
            rate: None,
            duration_seconds: 600,
        }
    }

    #[tokio::test]
    async fn test_claim_and_reopen() {
        let service = MemoryReportService::new(Arc::new(SystemClock));
        let id = service.create(&draft("me", 59.31)).await.unwrap();

        service.claim(&id, "you").await.unwrap();
        let report = service.get(&id).unwrap();
        assert_eq!(report.status, ReportStatus::Resolved);
        assert_eq!(report.resolved_by.as_deref(), Some("you"));
        assert!(service.snapshot(&FeedQuery::region(None)).is_empty());
        assert_eq!(service.snapshot(&FeedQuery::mine("me")).len(), 1);

        service.reopen(&id).await.unwrap();
        assert_eq!(service.snapshot(&FeedQuery::region(None)).len(), 1);
    }

    #[tokio::test]
    async fn test_region_query_uses_bounds() {
        let service = MemoryReportService::new(Arc::new(SystemClock));
        service.create(&draft("a", 59.31)).await.unwrap();
        service.create(&draft("b", 10.0)).await.unwrap();

        let bounds = BoundingBox::new(18.0, 59.0, 18.2, 59.5);
        let reports = service.snapshot(&FeedQuery::region(Some(bounds)));
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].owner_id, "a");
    }

    #[tokio::test]
    async fn test_failure_injection() {
        let service = MemoryReportService::new(Arc::new(SystemClock));
        service.set_failing(Operation::Create, true);
        assert!(service.create(&draft("me", 59.31)).await.is_err());
        service.set_failing(Operation::Create, false);
        assert!(service.create(&draft("me", 59.31)).await.is_ok());
    }

    #[tokio::test]
    async fn test_subscription_pushes_changes() {
        let service = MemoryReportService::new(Arc::new(SystemClock));
        let (tx, mut rx) = mpsc::channel(8);
        let _sub = service.subscribe(FeedQuery::region(None), tx);

        match rx.recv().await {
            Some(FeedEvent::Snapshot { reports, .. }) => assert!(reports.is_empty()),
            other => panic!("unexpected {other:?}"),
        }

        service.create(&draft("a", 59.31)).await.unwrap();
        match rx.recv().await {
            Some(FeedEvent::Snapshot { reports, .. }) => assert_eq!(reports.len(), 1),
            other => panic!("unexpected {other:?}"),
        }
    }
}
