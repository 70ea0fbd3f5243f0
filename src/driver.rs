//! Cooperative event loop around a [`Session`].
//!
//! One task owns the session and dispatches, one at a time, periodic ticks,
//! feed snapshots, position samples, remote-operation results and user
//! actions. Remote calls run as spawned tasks and report back through a
//! channel, so a slow server never delays a tick.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::models::{BoundingBox, Coordinates, NewSpot};
use crate::notify::NotificationSink;
use crate::persistence::{self, KeyValueStore, SavedState};
use crate::remote::traits::{
    verify_or_allow, FeedEvent, PositionSource, ReportApi, ReportFeed, RoadVerifier, Subscription,
};
use crate::remote::types::{FeedQuery, PositionOptions};
use crate::session::{RemoteCommand, RemoteOutcome, Session};

/// Something the user did on the map
#[derive(Debug, Clone)]
pub enum UserAction {
    Report(NewSpot),
    Delete(String),
    Claim(String),
    Undo,
    ViewportChanged(BoundingBox),
    /// Print the markers currently on the map
    Show,
    Shutdown,
}

enum Internal {
    Remote(RemoteOutcome),
    Verified { spot: NewSpot, allowed: bool },
}

/// External collaborators the driver talks to
pub struct Collaborators {
    pub api: Arc<dyn ReportApi>,
    pub feed: Arc<dyn ReportFeed>,
    pub kv: Arc<dyn KeyValueStore>,
    pub sink: Arc<dyn NotificationSink>,
    pub positions: Option<Arc<dyn PositionSource>>,
    pub verifier: Option<Arc<dyn RoadVerifier>>,
}

pub struct Driver {
    session: Session,
    collab: Collaborators,
    tick_interval: Duration,
    internal_tx: mpsc::Sender<Internal>,
    internal_rx: mpsc::Receiver<Internal>,
    feed_tx: mpsc::Sender<FeedEvent>,
    feed_rx: mpsc::Receiver<FeedEvent>,
    region_sub: Option<Subscription>,
}

impl Driver {
    pub fn new(session: Session, collab: Collaborators, tick_interval: Duration) -> Self {
        let (internal_tx, internal_rx) = mpsc::channel(64);
        let (feed_tx, feed_rx) = mpsc::channel(16);
        Self {
            session,
            collab,
            tick_interval,
            internal_tx,
            internal_rx,
            feed_tx,
            feed_rx,
            region_sub: None,
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Run until `Shutdown` arrives or the action channel closes, then persist
    /// and hand back the final state.
    pub async fn run(mut self, mut actions: mpsc::Receiver<UserAction>) -> Result<SavedState> {
        info!(
            "Session {} running against {} backend",
            self.session.identity(),
            self.collab.api.backend_name()
        );

        let _mine_sub = self.collab.feed.subscribe(
            FeedQuery::mine(self.session.identity()),
            self.feed_tx.clone(),
        );
        self.region_sub = Some(
            self.collab
                .feed
                .subscribe(FeedQuery::region(None), self.feed_tx.clone()),
        );

        let (pos_tx, mut pos_rx) = mpsc::channel(32);
        let _pos_sub = self
            .collab
            .positions
            .as_ref()
            .map(|p| p.subscribe(PositionOptions::default(), pos_tx));

        let mut ticker = tokio::time::interval(self.tick_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            let viewport_wait = self.session.viewport_deadline().map(|deadline| {
                (deadline - self.session.now())
                    .to_std()
                    .unwrap_or_default()
            });

            tokio::select! {
                _ = ticker.tick() => {
                    self.session.tick();
                }
                Some(event) = self.feed_rx.recv() => {
                    self.session.on_feed(event);
                }
                Some(sample) = pos_rx.recv() => {
                    if let Some(cmd) = self.session.on_position(&sample) {
                        self.dispatch(cmd);
                    }
                }
                Some(internal) = self.internal_rx.recv() => {
                    self.handle_internal(internal);
                }
                _ = sleep_opt(viewport_wait), if viewport_wait.is_some() => {
                    if let Some(bounds) = self.session.poll_viewport() {
                        self.resubscribe(bounds);
                    }
                }
                action = actions.recv() => match action {
                    Some(UserAction::Shutdown) | None => break,
                    Some(action) => self.handle_action(action),
                },
            }

            self.persist_if_dirty().await;
        }

        self.region_sub = None;
        let state = self.session.teardown();
        save(self.collab.kv.as_ref(), &state).await?;
        Ok(state)
    }

    fn handle_action(&mut self, action: UserAction) {
        match action {
            UserAction::Report(spot) => match &self.collab.verifier {
                Some(verifier) => {
                    let verifier = Arc::clone(verifier);
                    let tx = self.internal_tx.clone();
                    tokio::spawn(async move {
                        let allowed = match Coordinates::new(spot.latitude, spot.longitude) {
                            Ok(coords) => verify_or_allow(verifier.as_ref(), &coords).await,
                            // Validation reports the problem
                            Err(_) => true,
                        };
                        let _ = tx.send(Internal::Verified { spot, allowed }).await;
                    });
                }
                None => self.report(spot),
            },
            UserAction::Delete(id) => match self.session.delete_spot(&id) {
                Ok(Some(cmd)) => self.dispatch(cmd),
                Ok(None) => {}
                Err(e) => self.collab.sink.notify(&e.to_string()),
            },
            UserAction::Claim(id) => match self.session.claim_spot(&id) {
                Ok(cmd) => self.dispatch(cmd),
                Err(e) => self.collab.sink.notify(&e.to_string()),
            },
            UserAction::Undo => match self.session.undo() {
                Ok(Some(cmd)) => self.dispatch(cmd),
                Ok(None) => {}
                Err(rejected) => debug!("Undo ignored: {:?}", rejected),
            },
            UserAction::ViewportChanged(bounds) => self.session.on_viewport_changed(bounds),
            UserAction::Show => self.print_visible(),
            UserAction::Shutdown => {}
        }
    }

    fn handle_internal(&mut self, internal: Internal) {
        match internal {
            Internal::Remote(outcome) => {
                for cmd in self.session.on_remote_outcome(outcome) {
                    self.dispatch(cmd);
                }
            }
            Internal::Verified { spot, allowed } if allowed => self.report(spot),
            Internal::Verified { .. } => {
                self.collab
                    .sink
                    .notify("That doesn't look like a place to park");
            }
        }
    }

    fn print_visible(&self) {
        let spots = self.session.visible();
        println!("{} spots on the map", spots.len());
        for (i, spot) in spots.iter().enumerate() {
            println!(
                "{}. {} {:?} {:?} ({:?}, {}s left)",
                i + 1,
                spot.id,
                spot.kind,
                spot.ownership,
                spot.status,
                spot.remaining_seconds
            );
            println!(
                "   ({:.5}, {:.5}){}",
                spot.coordinates.latitude,
                spot.coordinates.longitude,
                spot.rate
                    .as_ref()
                    .map(|r| format!(" rate {r}"))
                    .unwrap_or_default()
            );
        }
        if let Some(undo) = self.session.pending_undo() {
            println!("Undo available for {} until {}", undo.report_id, undo.expires_at);
        }
    }

    fn report(&mut self, spot: NewSpot) {
        match self.session.report_spot(spot) {
            Ok(cmd) => self.dispatch(cmd),
            Err(e) => {
                warn!("Rejected spot: {}", e);
                self.collab.sink.notify(&e.to_string());
            }
        }
    }

    /// Run a remote command in the background; its outcome comes back
    /// through the internal channel.
    fn dispatch(&self, cmd: RemoteCommand) {
        let api = Arc::clone(&self.collab.api);
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let outcome = execute(api.as_ref(), cmd).await;
            if tx.send(Internal::Remote(outcome)).await.is_err() {
                debug!("Session ended before a remote call returned");
            }
        });
    }

    /// Replace the region subscription. Dropping the old one cancels it.
    fn resubscribe(&mut self, bounds: BoundingBox) {
        if let Some(old) = self.region_sub.take() {
            debug!("Replacing {}", old.label());
        }
        info!("Viewport settled, resubscribing to {:?}", bounds);
        self.region_sub = Some(
            self.collab
                .feed
                .subscribe(FeedQuery::region(Some(bounds)), self.feed_tx.clone()),
        );
    }

    async fn persist_if_dirty(&mut self) {
        if !self.session.take_dirty() {
            return;
        }
        let kv = self.collab.kv.as_ref();
        let result = async {
            persistence::save_spots(kv, self.session.store().mine()).await?;
            persistence::save_last_reported(kv, self.session.last_reported()).await
        }
        .await;
        if let Err(e) = result {
            warn!("Failed to persist spots: {:#}", e);
        }
    }
}

pub async fn execute(api: &dyn ReportApi, cmd: RemoteCommand) -> RemoteOutcome {
    match cmd {
        RemoteCommand::Create { local_id, draft } => RemoteOutcome::Created {
            result: api.create(&draft).await,
            local_id,
        },
        RemoteCommand::Delete {
            local_id,
            remote_id,
        } => RemoteOutcome::Deleted {
            result: api.delete(&remote_id).await,
            local_id,
            remote_id,
        },
        RemoteCommand::Claim {
            local_id,
            remote_id,
            claimant_id,
        } => RemoteOutcome::Claimed {
            result: api.claim(&remote_id, &claimant_id).await,
            local_id,
            remote_id,
        },
        RemoteCommand::Reopen {
            local_id,
            remote_id,
        } => RemoteOutcome::Reopened {
            result: api.reopen(&remote_id).await,
            local_id,
            remote_id,
        },
    }
}

async fn save(kv: &dyn KeyValueStore, state: &SavedState) -> Result<()> {
    persistence::save_spots(kv, state.spots.iter()).await?;
    persistence::save_last_reported(kv, state.last_reported.as_ref()).await
}

async fn sleep_opt(wait: Option<Duration>) {
    match wait {
        Some(wait) => tokio::time::sleep(wait).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::config::Config;
    use crate::models::ReportStatus;
    use crate::notify::CollectingSink;
    use crate::persistence::MemoryStore;
    use crate::remote::memory::{MemoryReportService, Operation};
    use crate::remote::types::FeedScope;
    use std::sync::Mutex;

    /// Memory feed that remembers every query it was subscribed with
    struct RecordingFeed {
        inner: MemoryReportService,
        queries: Arc<Mutex<Vec<FeedQuery>>>,
    }

    impl ReportFeed for RecordingFeed {
        fn subscribe(&self, query: FeedQuery, events: mpsc::Sender<FeedEvent>) -> Subscription {
            self.queries.lock().unwrap().push(query.clone());
            self.inner.subscribe(query, events)
        }
    }

    struct Harness {
        service: MemoryReportService,
        queries: Arc<Mutex<Vec<FeedQuery>>>,
        kv: Arc<MemoryStore>,
        sink: CollectingSink,
        actions: mpsc::Sender<UserAction>,
        handle: tokio::task::JoinHandle<Result<SavedState>>,
    }

    fn start() -> Harness {
        let clock = Arc::new(SystemClock);
        let service = MemoryReportService::new(clock.clone());
        let kv = Arc::new(MemoryStore::default());
        let sink = CollectingSink::new();
        let queries = Arc::new(Mutex::new(Vec::new()));
        let feed = RecordingFeed {
            inner: service.clone(),
            queries: queries.clone(),
        };

        let config = Config {
            viewport_debounce_ms: 50,
            ..Config::default()
        };
        let session = Session::new("me", &config, clock, Arc::new(sink.clone()));
        let collab = Collaborators {
            api: Arc::new(service.clone()),
            feed: Arc::new(feed),
            kv: kv.clone(),
            sink: Arc::new(sink.clone()),
            positions: None,
            verifier: None,
        };
        let driver = Driver::new(session, collab, Duration::from_millis(20));
        let (actions, rx) = mpsc::channel(8);
        let handle = tokio::spawn(driver.run(rx));

        Harness {
            service,
            queries,
            kv,
            sink,
            actions,
            handle,
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    #[tokio::test]
    async fn test_report_reaches_server_and_persists() {
        let h = start();
        h.actions
            .send(UserAction::Report(NewSpot::free(59.3145, 18.0736, 600)))
            .await
            .unwrap();
        settle().await;
        assert_eq!(h.service.len(), 1);

        h.actions.send(UserAction::Shutdown).await.unwrap();
        let state = h.handle.await.unwrap().unwrap();
        assert_eq!(state.spots.len(), 1);
        assert_eq!(state.spots[0].remote_id(), Some("R1"));

        let saved = persistence::load(h.kv.as_ref(), chrono::Utc::now()).await.unwrap();
        assert_eq!(saved.spots.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_delete_surfaces_error() {
        let h = start();
        h.actions
            .send(UserAction::Report(NewSpot::free(59.3145, 18.0736, 600)))
            .await
            .unwrap();
        settle().await;

        h.service.set_failing(Operation::Delete, true);
        let state_before = h.service.get("R1").unwrap();
        assert_eq!(state_before.status, ReportStatus::Open);

        // Find the local id through the persisted state
        let saved = persistence::load(h.kv.as_ref(), chrono::Utc::now()).await.unwrap();
        let local_id = saved.spots[0].id.clone();
        h.actions.send(UserAction::Delete(local_id)).await.unwrap();
        settle().await;

        assert_eq!(h.service.len(), 1);
        assert!(h
            .sink
            .messages()
            .iter()
            .any(|m| m.starts_with("Couldn't delete your spot")));

        h.actions.send(UserAction::Shutdown).await.unwrap();
        let state = h.handle.await.unwrap().unwrap();
        assert_eq!(state.spots.len(), 1);
    }

    #[tokio::test]
    async fn test_claim_from_elsewhere_removes_my_spot() {
        let h = start();
        h.actions
            .send(UserAction::Report(NewSpot::free(59.3145, 18.0736, 600)))
            .await
            .unwrap();
        settle().await;

        h.service.claim("R1", "someone").await.unwrap();
        settle().await;

        h.actions.send(UserAction::Shutdown).await.unwrap();
        let state = h.handle.await.unwrap().unwrap();
        assert!(state.spots.is_empty());
    }

    #[tokio::test]
    async fn test_viewport_change_replaces_region_subscription() {
        let h = start();
        settle().await;
        assert_eq!(h.service.subscriber_count(), 2);

        let first = BoundingBox::new(18.0, 59.0, 18.1, 59.1);
        let second = BoundingBox::new(18.1, 59.0, 18.2, 59.1);
        h.actions.send(UserAction::ViewportChanged(first)).await.unwrap();
        h.actions.send(UserAction::ViewportChanged(second)).await.unwrap();
        settle().await;

        let regions: Vec<_> = h
            .queries
            .lock()
            .unwrap()
            .iter()
            .filter(|q| q.scope == FeedScope::Region)
            .map(|q| q.bounds)
            .collect();
        // Rapid changes coalesce into one resubscription
        assert_eq!(regions, vec![None, Some(second)]);
        // The replaced subscription is gone, not accumulated
        assert_eq!(h.service.subscriber_count(), 2);

        h.actions.send(UserAction::Shutdown).await.unwrap();
        h.handle.await.unwrap().unwrap();
    }
}
