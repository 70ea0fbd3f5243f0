//! Periodic re-evaluation of every record.
//!
//! Statuses are only recomputed on ticks, so a transition that happens
//! between two ticks is observed up to one tick period late. With the default
//! one second period a spot can appear `fresh` for up to a second after it
//! crossed into `expiring`, and linger for up to a second after expiring.

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::lifecycle::{evaluate_record, remaining_seconds, SpotStatus};
use crate::notify::{expired_message, expiring_message, NotificationSink};
use crate::store::SpotStore;
use crate::undo::UndoSlot;

#[derive(Debug, Default, Clone, PartialEq)]
pub struct TickReport {
    /// Records that raised their expiring-soon alert on this tick
    pub expiring_alerts: Vec<String>,
    /// Records of mine removed as expired
    pub expired_mine: usize,
    pub expired_total: usize,
    /// Claimed records removed once no undo could bring them back
    pub resolved_purged: usize,
    pub undo_closed: bool,
}

impl TickReport {
    pub fn changed_mine(&self) -> bool {
        !self.expiring_alerts.is_empty() || self.expired_mine > 0 || self.resolved_purged > 0
    }
}

/// Run one tick against the store.
pub fn tick(
    store: &mut SpotStore,
    undo: &mut UndoSlot,
    sink: &dyn NotificationSink,
    now: DateTime<Utc>,
) -> TickReport {
    let mut report = TickReport::default();

    let expiring: Vec<(String, i64)> = store
        .mine()
        .filter(|r| !r.already_notified)
        .filter(|r| evaluate_record(r, now).status == SpotStatus::Expiring)
        .map(|r| (r.id.clone(), remaining_seconds(r, now)))
        .collect();
    for (id, remaining) in expiring {
        store.mark_notified(&id);
        sink.notify(&expiring_message(remaining));
        report.expiring_alerts.push(id);
    }

    let swept = store.sweep_expired(now);
    report.expired_mine = swept.mine.len();
    report.expired_total = swept.total();
    if report.expired_mine > 0 {
        sink.notify(&expired_message(report.expired_mine));
    }

    if let Some(closed) = undo.expire(now) {
        debug!("Undo window for {} closed", closed.report_id);
        report.undo_closed = true;
    }

    let resolved: Vec<String> = store
        .records()
        .filter(|r| r.claim.is_some() && !undo.covers(&r.id))
        .map(|r| r.id.clone())
        .collect();
    for id in &resolved {
        store.remove_local(id);
    }
    report.resolved_purged = resolved.len();

    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Claim, NewSpot};
    use crate::notify::CollectingSink;
    use crate::undo::ClaimSource;
    use chrono::Duration;

    fn setup(now: DateTime<Utc>) -> (SpotStore, UndoSlot, CollectingSink) {
        let mut store = SpotStore::new();
        store
            .insert_local(NewSpot::free(59.31, 18.07, 30).into_record(now).unwrap())
            .unwrap();
        store
            .insert_local(NewSpot::free(59.32, 18.07, 30).into_record(now).unwrap())
            .unwrap();
        (store, UndoSlot::new(Duration::seconds(45)), CollectingSink::new())
    }

    #[test]
    fn test_expiring_alert_raised_once() {
        let t = Utc::now();
        let (mut store, mut undo, sink) = setup(t);

        tick(&mut store, &mut undo, &sink, t + Duration::seconds(10));
        assert!(sink.messages().is_empty());

        let report = tick(&mut store, &mut undo, &sink, t + Duration::seconds(27));
        assert_eq!(report.expiring_alerts.len(), 2);
        tick(&mut store, &mut undo, &sink, t + Duration::seconds(28));
        tick(&mut store, &mut undo, &sink, t + Duration::seconds(29));

        assert_eq!(sink.messages(), vec!["Your spot expires in 3s"; 2]);
    }

    #[test]
    fn test_one_aggregate_expired_notification() {
        let t = Utc::now();
        let (mut store, mut undo, sink) = setup(t);

        let report = tick(&mut store, &mut undo, &sink, t + Duration::seconds(31));
        assert_eq!(report.expired_mine, 2);
        assert!(store.is_empty());

        // Jumped straight past the warning: no expiring alert, one summary
        assert_eq!(sink.messages(), vec!["2 of your spots expired".to_string()]);

        let again = tick(&mut store, &mut undo, &sink, t + Duration::seconds(31));
        assert_eq!(again.expired_total, 0);
        assert_eq!(sink.messages().len(), 1);
    }

    #[test]
    fn test_claimed_record_kept_while_undo_open() {
        let t = Utc::now();
        let (mut store, mut undo, sink) = setup(t);
        let id = store.mine().next().unwrap().id.clone();
        store.set_claim(
            &id,
            Claim {
                claimed_by: "me".to_string(),
                claimed_at: t,
            },
        );
        undo.open(&id, &id, ClaimSource::Manual, t);

        let report = tick(&mut store, &mut undo, &sink, t + Duration::seconds(5));
        assert_eq!(report.resolved_purged, 0);
        assert!(store.get(&id).is_some());

        let report = tick(&mut store, &mut undo, &sink, t + Duration::seconds(46));
        assert!(report.undo_closed);
        assert!(store.get(&id).is_none());
    }
}
