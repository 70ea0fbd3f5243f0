//! In-memory collection of spot records.
//!
//! Records are keyed by local id with a secondary index on the remote id, so a
//! local record and its remote echo always resolve to one entry.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::error::SpotError;
use crate::lifecycle::{evaluate_record, SpotStatus};
use crate::models::{Claim, Ownership, RemoteReport, SpotRecord, SyncPhase};

/// Result of an expiration sweep
#[derive(Debug, Default, Clone)]
pub struct SweepOutcome {
    /// Expired records the current identity authored
    pub mine: Vec<SpotRecord>,
    /// Number of expired records observed from others
    pub others: usize,
}

impl SweepOutcome {
    pub fn total(&self) -> usize {
        self.mine.len() + self.others
    }
}

#[derive(Debug, Default)]
pub struct SpotStore {
    records: HashMap<String, SpotRecord>,
    by_remote: HashMap<String, String>,
    /// Records removed optimistically while a remote delete is in flight
    hidden: HashMap<String, SpotRecord>,
}

impl SpotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&SpotRecord> {
        self.records.get(id)
    }

    pub fn get_by_remote(&self, remote_id: &str) -> Option<&SpotRecord> {
        self.by_remote
            .get(remote_id)
            .and_then(|local| self.records.get(local))
    }

    pub fn records(&self) -> impl Iterator<Item = &SpotRecord> {
        self.records.values()
    }

    pub fn mine(&self) -> impl Iterator<Item = &SpotRecord> {
        self.records.values().filter(|r| r.is_mine())
    }

    /// Add a record created on this device.
    pub fn insert_local(&mut self, record: SpotRecord) -> Result<(), SpotError> {
        record.coordinates.validate()?;
        if record.duration_seconds == 0 {
            return Err(SpotError::InvalidDuration(0));
        }

        if let Some(remote_id) = record.remote_id().map(str::to_string) {
            if let Some(existing) = self.by_remote.get(&remote_id).cloned() {
                if existing != record.id {
                    debug!("Dropping {} in favour of restored {}", existing, record.id);
                    self.records.remove(&existing);
                }
            }
            self.by_remote.insert(remote_id, record.id.clone());
        }

        info!(
            "Stored spot {} at ({:.5}, {:.5}) for {}s",
            record.id,
            record.coordinates.latitude,
            record.coordinates.longitude,
            record.duration_seconds
        );
        self.records.insert(record.id.clone(), record);
        Ok(())
    }

    /// Record the id the remote collaborator assigned after a successful create.
    ///
    /// If the remote echo already arrived as a separate entry, the two are
    /// merged: the local record stays, picking up server time and claim.
    pub fn attach_remote_id(&mut self, local_id: &str, remote_id: &str) -> Result<(), SpotError> {
        if !self.records.contains_key(local_id) {
            if let Some(hidden) = self.hidden.get_mut(local_id) {
                hidden.sync = SyncPhase::Confirmed(remote_id.to_string());
                return Ok(());
            }
            return Err(SpotError::UnknownSpot(local_id.to_string()));
        }

        let echo = match self.by_remote.get(remote_id) {
            Some(other) if other != local_id => self.records.remove(other),
            _ => None,
        };

        let Some(record) = self.records.get_mut(local_id) else {
            return Err(SpotError::UnknownSpot(local_id.to_string()));
        };
        record.sync = SyncPhase::Confirmed(remote_id.to_string());

        if let Some(echo) = echo {
            debug!("Merging remote echo {} into {}", remote_id, local_id);
            record.created_at = echo.created_at;
            record.server_time = true;
            record.seen_in_feed = true;
            if record.claim.is_none() {
                record.claim = echo.claim;
            }
        }

        self.by_remote
            .insert(remote_id.to_string(), local_id.to_string());
        info!("Spot {} confirmed as {}", local_id, remote_id);
        Ok(())
    }

    /// Fold one remote report in. Returns false if it was rejected.
    ///
    /// A record already known under this remote id keeps its local id; for
    /// records of mine only server time and claim are taken over.
    pub fn upsert_remote(&mut self, report: &RemoteReport, ownership: Ownership) -> bool {
        if let Err(e) = Self::check_remote(report) {
            warn!("Rejected remote report {}: {}", report.id, e);
            return false;
        }

        if let Some(local_id) = self.by_remote.get(&report.id).cloned() {
            if let Some(record) = self.records.get_mut(&local_id) {
                if record.is_mine() {
                    if !record.server_time {
                        record.created_at = report.created_at;
                        record.server_time = true;
                    }
                    record.seen_in_feed = true;
                } else {
                    record.coordinates = report.coordinates;
                    record.kind = report.kind;
                    record.rate = report.rate.clone();
                    record.created_at = report.created_at;
                    record.duration_seconds = report.duration_seconds;
                }
                if record.reopening {
                    debug!("Ignoring stale status of {} while reopening", report.id);
                } else if record.claim.is_none() {
                    record.claim = report.claim();
                }
                return true;
            }
        }

        match report.to_record(ownership) {
            Ok(record) => {
                self.by_remote.insert(report.id.clone(), record.id.clone());
                self.records.insert(record.id.clone(), record);
                true
            }
            Err(e) => {
                warn!("Rejected remote report {}: {}", report.id, e);
                false
            }
        }
    }

    fn check_remote(report: &RemoteReport) -> Result<(), SpotError> {
        report.coordinates.validate()?;
        if report.duration_seconds == 0 {
            return Err(SpotError::InvalidDuration(0));
        }
        Ok(())
    }

    /// Remove a record outright.
    pub fn remove_local(&mut self, id: &str) -> Option<SpotRecord> {
        let record = self.records.remove(id)?;
        if let Some(remote_id) = record.remote_id() {
            if self.by_remote.get(remote_id).map(String::as_str) == Some(id) {
                self.by_remote.remove(remote_id);
            }
        }
        debug!("Removed spot {}", id);
        Some(record)
    }

    /// Take a record out of view while its remote delete is in flight.
    pub fn hide(&mut self, id: &str) -> Option<&SpotRecord> {
        let record = self.remove_local(id)?;
        self.hidden.insert(id.to_string(), record);
        self.hidden.get(id)
    }

    /// Put a hidden record back after its remote delete failed. Idempotent.
    pub fn restore(&mut self, id: &str) -> bool {
        let Some(record) = self.hidden.remove(id) else {
            return false;
        };
        if let Some(remote_id) = record.remote_id() {
            self.by_remote.insert(remote_id.to_string(), id.to_string());
        }
        self.records.insert(id.to_string(), record);
        info!("Restored spot {} after failed delete", id);
        true
    }

    /// Drop a hidden record for good once the remote delete succeeded.
    pub fn forget_hidden(&mut self, id: &str) -> Option<SpotRecord> {
        self.hidden.remove(id)
    }

    pub fn get_hidden(&self, id: &str) -> Option<&SpotRecord> {
        self.hidden.get(id)
    }

    /// True if a pending delete covers this remote id.
    pub fn is_suppressed(&self, remote_id: &str) -> bool {
        self.hidden
            .values()
            .any(|r| r.remote_id() == Some(remote_id))
    }

    /// Set a claim unless one is already present.
    pub fn set_claim(&mut self, id: &str, claim: Claim) -> bool {
        match self.records.get_mut(id) {
            Some(record) if record.claim.is_none() => {
                record.claim = Some(claim);
                true
            }
            _ => false,
        }
    }

    /// Clear a claim. Used by undo and by claim rollback.
    pub fn reopen(&mut self, id: &str) -> bool {
        match self.records.get_mut(id) {
            Some(record) => record.claim.take().is_some(),
            None => false,
        }
    }

    /// Flag a record whose remote reopen is in flight, or clear the flag
    /// once the server answered.
    pub fn set_reopening(&mut self, id: &str, reopening: bool) {
        if let Some(record) = self.records.get_mut(id) {
            record.reopening = reopening;
        }
    }

    pub fn mark_notified(&mut self, id: &str) {
        if let Some(record) = self.records.get_mut(id) {
            record.already_notified = true;
        }
    }

    /// Drop records of others whose remote id is not in `keep`.
    ///
    /// Claimed records and records with a reopen in flight stay: the region
    /// feed only lists open reports, and an undo may still need them. The
    /// tick purges claimed records once no undo covers them.
    pub fn retain_others<F>(&mut self, mut keep: F) -> usize
    where
        F: FnMut(&str) -> bool,
    {
        let stale: Vec<String> = self
            .records
            .values()
            .filter(|r| r.ownership == Ownership::Other)
            .filter(|r| r.claim.is_none() && !r.reopening)
            .filter(|r| !keep(r.report_id()))
            .map(|r| r.id.clone())
            .collect();
        for id in &stale {
            self.remove_local(id);
        }
        stale.len()
    }

    /// Remove every record whose evaluated status is expired.
    pub fn sweep_expired(&mut self, now: DateTime<Utc>) -> SweepOutcome {
        let expired: Vec<String> = self
            .records
            .values()
            .filter(|r| evaluate_record(r, now).status == SpotStatus::Expired)
            .map(|r| r.id.clone())
            .collect();

        let mut outcome = SweepOutcome::default();
        for id in expired {
            if let Some(record) = self.remove_local(&id) {
                if record.is_mine() {
                    outcome.mine.push(record);
                } else {
                    outcome.others += 1;
                }
            }
        }

        if outcome.total() > 0 {
            info!(
                "Swept {} expired spots ({} mine)",
                outcome.total(),
                outcome.mine.len()
            );
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Coordinates, NewSpot, ReportStatus, SpotKind};
    use chrono::Duration;

    fn remote(id: &str, created_at: DateTime<Utc>) -> RemoteReport {
        RemoteReport {
            id: id.to_string(),
            owner_id: "other".to_string(),
            coordinates: Coordinates::new(59.31, 18.07).unwrap(),
            kind: SpotKind::Free,
            rate: None,
            status: ReportStatus::Open,
            created_at,
            duration_seconds: 600,
            resolved_by: None,
            resolved_at: None,
        }
    }

    #[test]
    fn test_insert_rejects_bad_coordinates() {
        let mut store = SpotStore::new();
        let mut record = NewSpot::free(59.3, 18.0, 60)
            .into_record(Utc::now())
            .unwrap();
        record.coordinates.latitude = 200.0;

        assert!(store.insert_local(record).is_err());
        assert!(store.is_empty());
    }

    #[test]
    fn test_attach_merges_remote_echo() {
        let now = Utc::now();
        let mut store = SpotStore::new();
        let record = NewSpot::free(59.31, 18.07, 600).into_record(now).unwrap();
        let local_id = record.id.clone();
        store.insert_local(record).unwrap();

        // Echo arrives before the create call returns
        let server_time = now - Duration::seconds(2);
        assert!(store.upsert_remote(&remote("R1", server_time), Ownership::Mine));
        assert_eq!(store.len(), 2);

        store.attach_remote_id(&local_id, "R1").unwrap();
        assert_eq!(store.len(), 1);
        let merged = store.get_by_remote("R1").unwrap();
        assert_eq!(merged.id, local_id);
        assert_eq!(merged.created_at, server_time);
        assert!(merged.server_time);
    }

    #[test]
    fn test_upsert_existing_remote_keeps_single_entry() {
        let now = Utc::now();
        let mut store = SpotStore::new();
        store.upsert_remote(&remote("R1", now), Ownership::Other);
        store.upsert_remote(&remote("R1", now), Ownership::Other);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_claim_is_monotonic() {
        let now = Utc::now();
        let mut store = SpotStore::new();
        store.upsert_remote(&remote("R1", now), Ownership::Other);

        let first = Claim {
            claimed_by: "a".to_string(),
            claimed_at: now,
        };
        let second = Claim {
            claimed_by: "b".to_string(),
            claimed_at: now,
        };
        assert!(store.set_claim("R1", first));
        assert!(!store.set_claim("R1", second));
        let claim = store.get("R1").unwrap().claim.clone().unwrap();
        assert_eq!(claim.claimed_by, "a");

        // An open snapshot does not unclaim
        store.upsert_remote(&remote("R1", now), Ownership::Other);
        assert!(store.get("R1").unwrap().claim.is_some());
    }

    #[test]
    fn test_hide_and_restore_idempotent() {
        let now = Utc::now();
        let mut store = SpotStore::new();
        let record = NewSpot::free(59.31, 18.07, 600).into_record(now).unwrap();
        let id = record.id.clone();
        store.insert_local(record).unwrap();
        store.attach_remote_id(&id, "R7").unwrap();

        assert!(store.hide(&id).is_some());
        assert!(store.get(&id).is_none());
        assert!(store.is_suppressed("R7"));

        assert!(store.restore(&id));
        assert!(!store.restore(&id));
        assert!(store.get_by_remote("R7").is_some());
        assert!(!store.is_suppressed("R7"));
    }

    #[test]
    fn test_sweep_is_idempotent() {
        let now = Utc::now();
        let mut store = SpotStore::new();
        let old = NewSpot::free(59.31, 18.07, 30)
            .into_record(now - Duration::seconds(31))
            .unwrap();
        let young = NewSpot::free(59.32, 18.07, 30).into_record(now).unwrap();
        store.insert_local(old).unwrap();
        store.insert_local(young).unwrap();
        store.upsert_remote(&remote("R2", now - Duration::hours(1)), Ownership::Other);

        let first = store.sweep_expired(now);
        assert_eq!(first.mine.len(), 1);
        assert_eq!(first.others, 1);
        assert_eq!(store.sweep_expired(now).total(), 0);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_retain_others_leaves_mine() {
        let now = Utc::now();
        let mut store = SpotStore::new();
        let mine = NewSpot::free(59.31, 18.07, 600).into_record(now).unwrap();
        store.insert_local(mine).unwrap();
        store.upsert_remote(&remote("R1", now), Ownership::Other);
        store.upsert_remote(&remote("R2", now), Ownership::Other);

        let dropped = store.retain_others(|id| id == "R2");
        assert_eq!(dropped, 1);
        assert_eq!(store.len(), 2);
        assert!(store.get_by_remote("R1").is_none());
    }

    #[test]
    fn test_retain_others_keeps_claimed() {
        let now = Utc::now();
        let mut store = SpotStore::new();
        store.upsert_remote(&remote("R1", now), Ownership::Other);
        store.upsert_remote(&remote("R2", now), Ownership::Other);
        store.set_claim(
            "R1",
            Claim {
                claimed_by: "me".to_string(),
                claimed_at: now,
            },
        );

        assert_eq!(store.retain_others(|_| false), 1);
        assert!(store.get("R1").is_some());
        assert!(store.get("R2").is_none());
    }

    #[test]
    fn test_redelivered_report_passes_firewall() {
        let now = Utc::now();
        let mut store = SpotStore::new();
        assert!(store.upsert_remote(&remote("R1", now), Ownership::Other));

        let mut bad = remote("R1", now);
        bad.coordinates.latitude = 200.0;
        assert!(!store.upsert_remote(&bad, Ownership::Other));

        let mut zero = remote("R1", now);
        zero.duration_seconds = 0;
        assert!(!store.upsert_remote(&zero, Ownership::Other));

        let stored = store.get("R1").unwrap();
        assert_eq!(stored.coordinates.latitude, 59.31);
        assert_eq!(stored.duration_seconds, 600);
    }

    #[test]
    fn test_stale_resolved_ignored_while_reopening() {
        let now = Utc::now();
        let mut store = SpotStore::new();
        store.upsert_remote(&remote("R1", now), Ownership::Other);
        store.set_reopening("R1", true);

        let mut resolved = remote("R1", now);
        resolved.status = ReportStatus::Resolved;
        resolved.resolved_by = Some("me".to_string());
        assert!(store.upsert_remote(&resolved, Ownership::Other));
        assert!(store.get("R1").unwrap().claim.is_none());

        store.set_reopening("R1", false);
        store.upsert_remote(&resolved, Ownership::Other);
        assert!(store.get("R1").unwrap().claim.is_some());
    }
}
