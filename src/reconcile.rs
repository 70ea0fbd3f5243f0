//! Folding remote snapshots into the store and producing the render view.

use std::collections::HashSet;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{debug, info};

use crate::lifecycle::{evaluate_record, SpotStatus};
use crate::models::{BoundingBox, Coordinates, Ownership, RemoteReport, SpotKind};
use crate::store::SpotStore;

/// One marker the map surface should draw
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VisibleSpot {
    pub id: String,
    pub remote_id: Option<String>,
    pub coordinates: Coordinates,
    pub kind: SpotKind,
    pub rate: Option<String>,
    pub ownership: Ownership,
    pub status: SpotStatus,
    pub age_seconds: i64,
    pub remaining_seconds: i64,
}

/// What a snapshot changed
#[derive(Debug, Default, Clone, PartialEq)]
pub struct MergeOutcome {
    pub upserted: usize,
    pub rejected: usize,
    pub suppressed: usize,
    pub dropped: usize,
    /// Mine records removed because the server no longer lists them
    pub deleted_remotely: Vec<String>,
}

/// Fold the viewport-wide snapshot of open reports into the store.
///
/// The snapshot is a full picture of the current region, so records of
/// others missing from it are dropped, except claimed ones an undo may still
/// reopen. Reports pending local deletion are skipped.
pub fn apply_snapshot(
    store: &mut SpotStore,
    reports: &[RemoteReport],
    identity: &str,
) -> MergeOutcome {
    let mut outcome = MergeOutcome::default();
    let mut seen = HashSet::new();

    for report in reports {
        if store.is_suppressed(&report.id) {
            outcome.suppressed += 1;
            continue;
        }
        let ownership = if report.owner_id == identity {
            Ownership::Mine
        } else {
            Ownership::Other
        };
        if store.upsert_remote(report, ownership) {
            outcome.upserted += 1;
            seen.insert(report.id.as_str());
        } else {
            outcome.rejected += 1;
        }
    }

    outcome.dropped = store.retain_others(|id| seen.contains(id));
    debug!(
        "Snapshot merged: {} upserted, {} rejected, {} suppressed, {} dropped",
        outcome.upserted, outcome.rejected, outcome.suppressed, outcome.dropped
    );
    outcome
}

/// Fold the snapshot scoped to the current identity's reports.
///
/// A record of mine that the feed listed before and no longer lists was
/// deleted on the server and is removed locally.
pub fn apply_my_snapshot(store: &mut SpotStore, reports: &[RemoteReport]) -> MergeOutcome {
    let mut outcome = MergeOutcome::default();
    let mut listed = HashSet::new();

    for report in reports {
        listed.insert(report.id.as_str());
        if store.is_suppressed(&report.id) {
            outcome.suppressed += 1;
            continue;
        }
        if store.upsert_remote(report, Ownership::Mine) {
            outcome.upserted += 1;
        } else {
            outcome.rejected += 1;
        }
    }

    let gone: Vec<String> = store
        .mine()
        .filter(|r| r.seen_in_feed)
        .filter(|r| r.remote_id().is_some_and(|id| !listed.contains(id)))
        .map(|r| r.id.clone())
        .collect();
    for id in &gone {
        info!("Spot {} no longer on the server, removing", id);
        store.remove_local(id);
    }
    outcome.deleted_remotely = gone;
    outcome
}

/// Markers to render: everything neither claimed nor expired.
pub fn visible(store: &SpotStore, now: DateTime<Utc>) -> Vec<VisibleSpot> {
    let mut spots: Vec<VisibleSpot> = store
        .records()
        .filter_map(|record| {
            let eval = evaluate_record(record, now);
            if matches!(eval.status, SpotStatus::Claimed | SpotStatus::Expired) {
                return None;
            }
            Some(VisibleSpot {
                id: record.id.clone(),
                remote_id: record.remote_id().map(str::to_string),
                coordinates: record.coordinates,
                kind: record.kind,
                rate: record.rate.clone(),
                ownership: record.ownership,
                status: eval.status,
                age_seconds: eval.age_seconds,
                remaining_seconds: (i64::from(record.duration_seconds) - eval.age_seconds).max(0),
            })
        })
        .collect();
    spots.sort_by(|a, b| a.id.cmp(&b.id));
    spots
}

/// Coalesces bursts of map region changes into one resubscription.
#[derive(Debug)]
pub struct ViewportDebouncer {
    quiet: Duration,
    pending: Option<(BoundingBox, DateTime<Utc>)>,
    current: Option<BoundingBox>,
}

impl ViewportDebouncer {
    pub fn new(quiet: Duration) -> Self {
        Self {
            quiet,
            pending: None,
            current: None,
        }
    }

    /// Note a region change. Restarts the quiet period.
    pub fn propose(&mut self, bounds: BoundingBox, now: DateTime<Utc>) {
        self.pending = Some((bounds, now));
    }

    /// When the pending region becomes due, if any.
    pub fn deadline(&self) -> Option<DateTime<Utc>> {
        self.pending.map(|(_, at)| at + self.quiet)
    }

    /// Returns the region to subscribe to once the quiet period has passed
    /// and it differs from the current subscription.
    pub fn poll(&mut self, now: DateTime<Utc>) -> Option<BoundingBox> {
        let (bounds, at) = self.pending?;
        if now - at < self.quiet {
            return None;
        }
        self.pending = None;
        if self.current == Some(bounds) {
            return None;
        }
        self.current = Some(bounds);
        Some(bounds)
    }

    pub fn current(&self) -> Option<BoundingBox> {
        self.current
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{NewSpot, ReportStatus};

    fn report(id: &str, owner: &str, status: ReportStatus) -> RemoteReport {
        RemoteReport {
            id: id.to_string(),
            owner_id: owner.to_string(),
            coordinates: Coordinates::new(59.315, 18.07).unwrap(),
            kind: SpotKind::Free,
            rate: None,
            status,
            created_at: Utc::now(),
            duration_seconds: 900,
            resolved_by: None,
            resolved_at: None,
        }
    }

    #[test]
    fn test_local_and_remote_render_once() {
        let now = Utc::now();
        let mut store = SpotStore::new();
        let record = NewSpot::free(59.315, 18.07, 900).into_record(now).unwrap();
        let local_id = record.id.clone();
        store.insert_local(record).unwrap();
        store.attach_remote_id(&local_id, "R1").unwrap();

        apply_snapshot(&mut store, &[report("R1", "me", ReportStatus::Open)], "me");

        let shown = visible(&store, now);
        assert_eq!(shown.len(), 1);
        assert_eq!(shown[0].id, local_id);
        assert_eq!(shown[0].remote_id.as_deref(), Some("R1"));
    }

    #[test]
    fn test_resolved_reports_never_render() {
        let now = Utc::now();
        let mut store = SpotStore::new();
        apply_snapshot(
            &mut store,
            &[
                report("R1", "them", ReportStatus::Resolved),
                report("R2", "them", ReportStatus::Open),
            ],
            "me",
        );

        let shown = visible(&store, now);
        assert_eq!(shown.len(), 1);
        assert_eq!(shown[0].id, "R2");
    }

    #[test]
    fn test_invalid_remote_report_rejected() {
        let mut store = SpotStore::new();
        let mut bad = report("R9", "them", ReportStatus::Open);
        bad.coordinates.latitude = 200.0;

        let outcome = apply_snapshot(&mut store, &[bad], "me");
        assert_eq!(outcome.rejected, 1);
        assert!(store.is_empty());
    }

    #[test]
    fn test_hidden_report_stays_suppressed() {
        let now = Utc::now();
        let mut store = SpotStore::new();
        let record = NewSpot::free(59.315, 18.07, 900).into_record(now).unwrap();
        let local_id = record.id.clone();
        store.insert_local(record).unwrap();
        store.attach_remote_id(&local_id, "R1").unwrap();
        store.hide(&local_id);

        // Feed has not caught up with the delete yet
        let outcome = apply_snapshot(&mut store, &[report("R1", "me", ReportStatus::Open)], "me");
        assert_eq!(outcome.suppressed, 1);
        assert!(visible(&store, now).is_empty());
    }

    #[test]
    fn test_snapshot_replaces_others() {
        let mut store = SpotStore::new();
        apply_snapshot(&mut store, &[report("R1", "them", ReportStatus::Open)], "me");
        let outcome = apply_snapshot(&mut store, &[report("R2", "them", ReportStatus::Open)], "me");
        assert_eq!(outcome.dropped, 1);
        assert!(store.get_by_remote("R1").is_none());
        assert!(store.get_by_remote("R2").is_some());
    }

    #[test]
    fn test_my_snapshot_detects_remote_delete() {
        let now = Utc::now();
        let mut store = SpotStore::new();
        let record = NewSpot::free(59.315, 18.07, 900).into_record(now).unwrap();
        let local_id = record.id.clone();
        store.insert_local(record).unwrap();
        store.attach_remote_id(&local_id, "R1").unwrap();

        // Not yet listed: a lagging feed must not delete it
        let outcome = apply_my_snapshot(&mut store, &[]);
        assert!(outcome.deleted_remotely.is_empty());

        apply_my_snapshot(&mut store, &[report("R1", "me", ReportStatus::Open)]);
        let outcome = apply_my_snapshot(&mut store, &[]);
        assert_eq!(outcome.deleted_remotely, vec![local_id]);
        assert!(store.is_empty());
    }

    #[test]
    fn test_debouncer_coalesces() {
        let t = Utc::now();
        let mut debouncer = ViewportDebouncer::new(Duration::milliseconds(300));
        let a = BoundingBox::new(18.0, 59.0, 18.1, 59.1);
        let b = BoundingBox::new(18.2, 59.0, 18.3, 59.1);

        debouncer.propose(a, t);
        debouncer.propose(b, t + Duration::milliseconds(100));
        assert_eq!(debouncer.poll(t + Duration::milliseconds(350)), None);
        assert_eq!(debouncer.poll(t + Duration::milliseconds(400)), Some(b));
        assert_eq!(debouncer.poll(t + Duration::milliseconds(900)), None);

        // Same region again is not a new subscription
        debouncer.propose(b, t + Duration::seconds(2));
        assert_eq!(debouncer.poll(t + Duration::seconds(3)), None);
        assert_eq!(debouncer.current(), Some(b));
    }
}
