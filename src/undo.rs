//! Single time-boxed undo opportunity for the most recent claim.

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimSource {
    /// Inferred by the arrival detector
    Arrival,
    /// User tapped "taken"
    Manual,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PendingUndo {
    pub local_id: String,
    pub report_id: String,
    pub source: ClaimSource,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UndoRejected {
    NothingPending,
    WindowClosed,
}

#[derive(Debug)]
pub struct UndoSlot {
    window: Duration,
    pending: Option<PendingUndo>,
}

impl UndoSlot {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            pending: None,
        }
    }

    pub fn pending(&self) -> Option<&PendingUndo> {
        self.pending.as_ref()
    }

    /// Open a new window, returning whatever it replaced.
    pub fn open(
        &mut self,
        local_id: &str,
        report_id: &str,
        source: ClaimSource,
        now: DateTime<Utc>,
    ) -> Option<PendingUndo> {
        let replaced = self.pending.replace(PendingUndo {
            local_id: local_id.to_string(),
            report_id: report_id.to_string(),
            source,
            expires_at: now + self.window,
        });
        if let Some(prev) = &replaced {
            debug!("Undo for {} superseded by {}", prev.report_id, report_id);
        }
        replaced
    }

    /// Consume the pending undo if its window is still open.
    pub fn take(&mut self, now: DateTime<Utc>) -> Result<PendingUndo, UndoRejected> {
        match self.pending.take() {
            None => Err(UndoRejected::NothingPending),
            Some(pending) if now >= pending.expires_at => {
                info!("Undo for {} rejected, window closed", pending.report_id);
                Err(UndoRejected::WindowClosed)
            }
            Some(pending) => Ok(pending),
        }
    }

    /// Close the window if it has run out.
    pub fn expire(&mut self, now: DateTime<Utc>) -> Option<PendingUndo> {
        if self.pending.as_ref().is_some_and(|p| now >= p.expires_at) {
            return self.pending.take();
        }
        None
    }

    /// Drop the pending undo for a record whose claim was rolled back.
    pub fn cancel(&mut self, local_id: &str) -> bool {
        if self.covers(local_id) {
            self.pending = None;
            return true;
        }
        false
    }

    pub fn covers(&self, local_id: &str) -> bool {
        self.pending.as_ref().is_some_and(|p| p.local_id == local_id)
    }
}
