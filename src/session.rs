//! The per-session context object owning all engine state.
//!
//! Every handler is synchronous and runs to completion. Handlers that need the
//! remote collaborator return [`RemoteCommand`]s; the caller executes them and
//! feeds the results back through [`Session::on_remote_outcome`]. The local
//! effect of an operation never waits for its remote counterpart.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};

use crate::arrival::{ArrivalDecision, ArrivalDetector};
use crate::clock::Clock;
use crate::config::{Config, MAX_WINDOW_SECS};
use crate::error::SpotError;
use crate::models::{
    BoundingBox, Claim, LastReported, NewSpot, PositionSample, ReportDraft, SpotRecord,
};
use crate::notify::NotificationSink;
use crate::persistence::SavedState;
use crate::reconcile::{self, VisibleSpot, ViewportDebouncer};
use crate::remote::traits::FeedEvent;
use crate::remote::types::FeedScope;
use crate::store::SpotStore;
use crate::ticker::{self, TickReport};
use crate::undo::{ClaimSource, PendingUndo, UndoRejected, UndoSlot};

/// Work for the remote collaborator
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteCommand {
    Create {
        local_id: String,
        draft: ReportDraft,
    },
    Delete {
        local_id: String,
        remote_id: String,
    },
    Claim {
        local_id: String,
        remote_id: String,
        claimant_id: String,
    },
    Reopen {
        local_id: String,
        remote_id: String,
    },
}

/// Result of a [`RemoteCommand`]
#[derive(Debug)]
pub enum RemoteOutcome {
    Created {
        local_id: String,
        result: anyhow::Result<String>,
    },
    Deleted {
        local_id: String,
        remote_id: String,
        result: anyhow::Result<()>,
    },
    Claimed {
        local_id: String,
        remote_id: String,
        result: anyhow::Result<()>,
    },
    Reopened {
        local_id: String,
        remote_id: String,
        result: anyhow::Result<()>,
    },
}

pub struct Session {
    identity: String,
    clock: Arc<dyn Clock>,
    sink: Arc<dyn NotificationSink>,
    store: SpotStore,
    detector: ArrivalDetector,
    undo: UndoSlot,
    undo_window: Duration,
    viewport: ViewportDebouncer,
    last_reported: Option<LastReported>,
    /// Local ids whose remote create is in flight
    creating: HashSet<String>,
    failing_feeds: HashSet<FeedScope>,
    dirty: bool,
}

impl Session {
    pub fn new(
        identity: &str,
        config: &Config,
        clock: Arc<dyn Clock>,
        sink: Arc<dyn NotificationSink>,
    ) -> Self {
        let undo_window = Duration::seconds(config.undo_window_secs.clamp(0, MAX_WINDOW_SECS));
        let debounce =
            Duration::milliseconds(config.viewport_debounce_ms.clamp(0, MAX_WINDOW_SECS * 1000));
        Self {
            identity: identity.to_string(),
            clock,
            sink,
            store: SpotStore::new(),
            detector: ArrivalDetector::new(config.arrival.clone()),
            undo: UndoSlot::new(undo_window),
            undo_window,
            viewport: ViewportDebouncer::new(debounce),
            last_reported: None,
            creating: HashSet::new(),
            failing_feeds: HashSet::new(),
            dirty: false,
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn store(&self) -> &SpotStore {
        &self.store
    }

    pub fn last_reported(&self) -> Option<&LastReported> {
        self.last_reported.as_ref()
    }

    pub fn pending_undo(&self) -> Option<&PendingUndo> {
        self.undo.pending()
    }

    pub fn visible(&self) -> Vec<VisibleSpot> {
        reconcile::visible(&self.store, self.clock.now())
    }

    /// Whether something worth persisting changed since the last call.
    pub fn take_dirty(&mut self) -> bool {
        std::mem::take(&mut self.dirty)
    }

    /// Load records saved by a previous session. Each passes the coordinate
    /// firewall again.
    pub fn restore(&mut self, state: SavedState) {
        let mut restored = 0;
        for record in state.spots.into_iter().filter(SpotRecord::is_mine) {
            let id = record.id.clone();
            match self.store.insert_local(record) {
                Ok(()) => restored += 1,
                Err(e) => warn!("Skipping saved spot {}: {}", id, e),
            }
        }
        self.last_reported = state.last_reported;
        info!("Restored {} saved spots", restored);
    }

    /// Report a new spot. The record is stored and visible immediately; the
    /// returned command shares it with everyone else.
    pub fn report_spot(&mut self, spot: NewSpot) -> Result<RemoteCommand, SpotError> {
        let record = spot.into_record(self.clock.now())?;
        let local_id = record.id.clone();
        let draft = ReportDraft::from_record(&record, &self.identity);
        let coordinates = record.coordinates;

        self.store.insert_local(record)?;
        self.last_reported = Some(LastReported {
            local_id: local_id.clone(),
            remote_id: None,
            coordinates,
        });
        self.detector.reset();
        self.creating.insert(local_id.clone());
        self.dirty = true;

        Ok(RemoteCommand::Create { local_id, draft })
    }

    /// Delete one of my spots. It disappears at once; a failed remote delete
    /// brings it back.
    pub fn delete_spot(&mut self, id: &str) -> Result<Option<RemoteCommand>, SpotError> {
        let record = self
            .store
            .get(id)
            .ok_or_else(|| SpotError::UnknownSpot(id.to_string()))?;
        if !record.is_mine() {
            return Err(SpotError::NotOwned(id.to_string()));
        }
        let remote_id = record.remote_id().map(str::to_string);
        self.dirty = true;

        match remote_id {
            Some(remote_id) => {
                self.store.hide(id);
                info!("Deleting spot {} ({})", id, remote_id);
                Ok(Some(RemoteCommand::Delete {
                    local_id: id.to_string(),
                    remote_id,
                }))
            }
            None if self.creating.contains(id) => {
                // Delete goes out once the create returns an id
                self.store.hide(id);
                Ok(None)
            }
            None => {
                self.store.remove_local(id);
                Ok(None)
            }
        }
    }

    /// Mark someone else's spot as taken by me.
    pub fn claim_spot(&mut self, id: &str) -> Result<RemoteCommand, SpotError> {
        let now = self.clock.now();
        let record = self
            .store
            .get(id)
            .ok_or_else(|| SpotError::UnknownSpot(id.to_string()))?;
        if record.is_mine() {
            return Err(SpotError::OwnSpot(id.to_string()));
        }
        if record.claim.is_some() {
            return Err(SpotError::AlreadyClaimed(id.to_string()));
        }
        let remote_id = record
            .remote_id()
            .ok_or_else(|| SpotError::NoRemoteId(id.to_string()))?
            .to_string();

        let claim = self.own_claim(now);
        self.store.set_claim(id, claim);
        self.open_undo(id, &remote_id, ClaimSource::Manual, now);

        Ok(RemoteCommand::Claim {
            local_id: id.to_string(),
            remote_id,
            claimant_id: self.identity.clone(),
        })
    }

    /// Reverse the most recent claim while its window is open.
    pub fn undo(&mut self) -> Result<Option<RemoteCommand>, UndoRejected> {
        let pending = self.undo.take(self.clock.now())?;
        let remote_id = match self.store.get(&pending.local_id) {
            Some(record) => record.remote_id().map(str::to_string),
            // Gone locally; the claim went out under this id
            None => Some(pending.report_id.clone()),
        };

        self.store.reopen(&pending.local_id);
        self.detector.release(&pending.report_id);
        if let Some(remote_id) = &remote_id {
            self.store.set_reopening(&pending.local_id, true);
            self.detector.release(remote_id);
        }

        self.dirty = true;
        info!("Claim on {} undone", pending.report_id);
        self.sink.notify("Spot reopened");

        Ok(remote_id.map(|remote_id| RemoteCommand::Reopen {
            local_id: pending.local_id,
            remote_id,
        }))
    }

    /// Feed one GPS fix to the arrival detector.
    pub fn on_position(&mut self, sample: &PositionSample) -> Option<RemoteCommand> {
        let target = self
            .last_reported
            .clone()
            .filter(|t| self.store.get(&t.local_id).is_some());

        let ArrivalDecision::Arrived { report_id } = self.detector.observe(sample, target.as_ref())
        else {
            return None;
        };
        let target = target?;
        let now = self.clock.now();

        let claim = self.own_claim(now);
        if !self.store.set_claim(&target.local_id, claim) {
            debug!("Spot {} was already claimed", target.local_id);
            return None;
        }
        self.open_undo(&target.local_id, &report_id, ClaimSource::Arrival, now);
        self.dirty = true;
        self.sink.notify(&format!(
            "Looks like you parked. Spot marked as taken, undo within {}s",
            self.undo_window.num_seconds()
        ));

        let remote_id = self.store.get(&target.local_id)?.remote_id()?.to_string();
        Some(RemoteCommand::Claim {
            local_id: target.local_id,
            remote_id,
            claimant_id: self.identity.clone(),
        })
    }

    pub fn on_feed(&mut self, event: FeedEvent) {
        match event {
            FeedEvent::Snapshot { scope, reports } => {
                if self.failing_feeds.remove(&scope) {
                    info!("{:?} feed recovered", scope);
                }
                let outcome = match scope {
                    FeedScope::Region => {
                        reconcile::apply_snapshot(&mut self.store, &reports, &self.identity)
                    }
                    FeedScope::Mine => reconcile::apply_my_snapshot(&mut self.store, &reports),
                };
                if !outcome.deleted_remotely.is_empty() {
                    self.sink.notify(&format!(
                        "{} of your spots were removed elsewhere",
                        outcome.deleted_remotely.len()
                    ));
                }
                if scope == FeedScope::Mine || !outcome.deleted_remotely.is_empty() {
                    self.dirty = true;
                }
            }
            FeedEvent::Error { scope, message } => {
                warn!("{:?} feed error: {}", scope, message);
                if self.failing_feeds.insert(scope) {
                    self.sink
                        .notify(&format!("Live updates unavailable: {message}"));
                }
            }
        }
    }

    pub fn on_remote_outcome(&mut self, outcome: RemoteOutcome) -> Vec<RemoteCommand> {
        match outcome {
            RemoteOutcome::Created { local_id, result } => self.on_created(&local_id, result),
            RemoteOutcome::Deleted {
                local_id,
                remote_id,
                result,
            } => {
                self.on_deleted(&local_id, &remote_id, result);
                Vec::new()
            }
            RemoteOutcome::Claimed {
                local_id,
                remote_id,
                result,
            } => {
                self.on_claimed(&local_id, &remote_id, result);
                Vec::new()
            }
            RemoteOutcome::Reopened {
                local_id,
                remote_id,
                result,
            } => {
                self.on_reopened(&local_id, &remote_id, result);
                Vec::new()
            }
        }
    }

    fn on_created(&mut self, local_id: &str, result: anyhow::Result<String>) -> Vec<RemoteCommand> {
        self.creating.remove(local_id);
        self.dirty = true;

        let remote_id = match result {
            Ok(remote_id) => remote_id,
            Err(e) => {
                warn!("Create of {} failed: {:#}", local_id, e);
                if self.store.forget_hidden(local_id).is_none() {
                    self.sink
                        .notify(&format!("Couldn't share your spot: {e}"));
                }
                return Vec::new();
            }
        };

        if let Err(e) = self.store.attach_remote_id(local_id, &remote_id) {
            warn!("Created {} for a spot that is gone: {}", remote_id, e);
            return Vec::new();
        }
        if let Some(last) = self
            .last_reported
            .as_mut()
            .filter(|l| l.local_id == local_id)
        {
            last.remote_id = Some(remote_id.clone());
            self.detector.rename(local_id, &remote_id);
        }

        if self.store.get_hidden(local_id).is_some() {
            return vec![RemoteCommand::Delete {
                local_id: local_id.to_string(),
                remote_id,
            }];
        }

        // Claimed while the create was in flight
        let claimed_by_me = self
            .store
            .get(local_id)
            .and_then(|r| r.claim.as_ref())
            .is_some_and(|c| c.claimed_by == self.identity);
        if claimed_by_me {
            return vec![RemoteCommand::Claim {
                local_id: local_id.to_string(),
                remote_id,
                claimant_id: self.identity.clone(),
            }];
        }
        Vec::new()
    }

    fn on_deleted(&mut self, local_id: &str, remote_id: &str, result: anyhow::Result<()>) {
        match result {
            Ok(()) => {
                self.store.forget_hidden(local_id);
                info!("Deleted {}", remote_id);
            }
            Err(e) => {
                warn!("Delete of {} failed: {:#}", remote_id, e);
                if self.store.restore(local_id) {
                    self.dirty = true;
                    self.sink
                        .notify(&format!("Couldn't delete your spot: {e}"));
                }
            }
        }
    }

    fn on_claimed(&mut self, local_id: &str, remote_id: &str, result: anyhow::Result<()>) {
        let Err(e) = result else {
            info!("Claim on {} confirmed", remote_id);
            return;
        };
        warn!("Claim on {} failed: {:#}", remote_id, e);

        let mine = self
            .store
            .get(local_id)
            .and_then(|r| r.claim.as_ref())
            .is_some_and(|c| c.claimed_by == self.identity);
        let reopened = mine && self.store.reopen(local_id);
        self.undo.cancel(local_id);
        self.detector.release(remote_id);
        self.detector.release(local_id);

        if reopened {
            self.dirty = true;
            self.sink
                .notify(&format!("Couldn't mark the spot as taken: {e}"));
        }
    }

    fn on_reopened(&mut self, local_id: &str, remote_id: &str, result: anyhow::Result<()>) {
        self.store.set_reopening(local_id, false);
        let Err(e) = result else {
            info!("Reopened {}", remote_id);
            return;
        };
        warn!("Reopen of {} failed: {:#}", remote_id, e);

        // The server still has it claimed, so local state follows
        let now = self.clock.now();
        let claim = self.own_claim(now);
        if self.store.set_claim(local_id, claim) {
            self.dirty = true;
            self.sink.notify(&format!("Couldn't undo: {e}"));
        }
        if self
            .last_reported
            .as_ref()
            .is_some_and(|l| l.local_id == local_id)
        {
            self.detector.mark_claimed(remote_id);
        }
    }

    /// Note a map region change; resubscription waits for the quiet period.
    pub fn on_viewport_changed(&mut self, bounds: BoundingBox) {
        self.viewport.propose(bounds, self.clock.now());
    }

    pub fn viewport_deadline(&self) -> Option<DateTime<Utc>> {
        self.viewport.deadline()
    }

    /// The region to resubscribe to, once due.
    pub fn poll_viewport(&mut self) -> Option<BoundingBox> {
        self.viewport.poll(self.clock.now())
    }

    pub fn current_viewport(&self) -> Option<BoundingBox> {
        self.viewport.current()
    }

    pub fn tick(&mut self) -> TickReport {
        let now = self.clock.now();
        let report = ticker::tick(&mut self.store, &mut self.undo, self.sink.as_ref(), now);
        if report.changed_mine() {
            self.dirty = true;
        }

        let stale_pointer = self.last_reported.as_ref().is_some_and(|l| {
            self.store.get(&l.local_id).is_none() && self.store.get_hidden(&l.local_id).is_none()
        });
        if stale_pointer {
            debug!("Last reported spot is gone, stopping arrival detection");
            self.last_reported = None;
            self.detector.reset();
            self.dirty = true;
        }
        report
    }

    fn own_claim(&self, now: DateTime<Utc>) -> Claim {
        Claim {
            claimed_by: self.identity.clone(),
            claimed_at: now,
        }
    }

    fn open_undo(
        &mut self,
        local_id: &str,
        report_id: &str,
        source: ClaimSource,
        now: DateTime<Utc>,
    ) {
        if let Some(replaced) = self.undo.open(local_id, report_id, source, now) {
            debug!("Discarded pending undo for {}", replaced.report_id);
        }
    }

    /// End the session, handing back what should be persisted.
    pub fn teardown(mut self) -> SavedState {
        self.detector.reset();
        let spots = self.store.mine().cloned().collect();
        info!("Session for {} ended", self.identity);
        SavedState {
            spots,
            last_reported: self.last_reported.take(),
        }
    }
}
