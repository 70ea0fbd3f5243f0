use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::SpotError;

/// A latitude/longitude pair in WGS84 degrees.
///
/// Values only come into existence through [`Coordinates::new`], which is the
/// coordinate firewall: non-finite or out-of-range values never reach a
/// stored structure.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinates {
    pub fn new(latitude: f64, longitude: f64) -> Result<Self, SpotError> {
        let coords = Self {
            latitude,
            longitude,
        };
        coords.validate()?;
        Ok(coords)
    }

    /// Re-checks a value that arrived through deserialization.
    pub fn validate(&self) -> Result<(), SpotError> {
        let lat_ok = self.latitude.is_finite() && (-90.0..=90.0).contains(&self.latitude);
        let lon_ok = self.longitude.is_finite() && (-180.0..=180.0).contains(&self.longitude);
        if lat_ok && lon_ok {
            Ok(())
        } else {
            Err(SpotError::InvalidCoordinates {
                latitude: self.latitude,
                longitude: self.longitude,
            })
        }
    }
}

/// Whether parking at the spot costs money
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpotKind {
    Free,
    Paid,
}

/// Who authored a record relative to the current identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Ownership {
    Mine,
    Other,
}

/// Marks a spot as taken.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claim {
    pub claimed_by: String,
    pub claimed_at: DateTime<Utc>,
}

/// Whether a record has been acknowledged by the remote collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "phase", content = "remote_id", rename_all = "lowercase")]
pub enum SyncPhase {
    /// Created locally, remote create not yet acknowledged (or it failed).
    Pending,
    /// The remote collaborator assigned this id.
    Confirmed(String),
}

/// A reported parking spot as held by the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpotRecord {
    /// Local id, stable for the record's lifetime on this device
    pub id: String,
    pub sync: SyncPhase,
    pub coordinates: Coordinates,
    pub kind: SpotKind,
    /// Only set for paid spots
    pub rate: Option<String>,
    pub created_at: DateTime<Utc>,
    /// True once `created_at` has been replaced by server time
    #[serde(default)]
    pub server_time: bool,
    pub duration_seconds: u32,
    pub ownership: Ownership,
    pub claim: Option<Claim>,
    /// The expiring-soon alert has already been raised for this record
    #[serde(default)]
    pub already_notified: bool,
    /// The remote "my reports" snapshot has listed this record at least once
    #[serde(default)]
    pub seen_in_feed: bool,
    /// An undo sent a reopen that the server has not acknowledged yet, so
    /// resolved snapshots of this record are stale
    #[serde(default)]
    pub reopening: bool,
}

impl SpotRecord {
    pub fn remote_id(&self) -> Option<&str> {
        match &self.sync {
            SyncPhase::Pending => None,
            SyncPhase::Confirmed(id) => Some(id.as_str()),
        }
    }

    pub fn is_mine(&self) -> bool {
        self.ownership == Ownership::Mine
    }

    /// Id to use when talking to the remote collaborator, falling back to the
    /// local id while the record is still pending.
    pub fn report_id(&self) -> &str {
        self.remote_id().unwrap_or(&self.id)
    }
}

/// A user's request to report a spot, validated before it becomes a record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewSpot {
    pub latitude: f64,
    pub longitude: f64,
    pub kind: SpotKind,
    pub rate: Option<String>,
    pub duration_seconds: i64,
}

impl NewSpot {
    pub fn free(latitude: f64, longitude: f64, duration_seconds: i64) -> Self {
        Self {
            latitude,
            longitude,
            kind: SpotKind::Free,
            rate: None,
            duration_seconds,
        }
    }

    pub fn paid(latitude: f64, longitude: f64, rate: &str, duration_seconds: i64) -> Self {
        Self {
            latitude,
            longitude,
            kind: SpotKind::Paid,
            rate: Some(rate.to_string()),
            duration_seconds,
        }
    }

    /// Validate and build the optimistic local record.
    pub fn into_record(self, now: DateTime<Utc>) -> Result<SpotRecord, SpotError> {
        let coordinates = Coordinates::new(self.latitude, self.longitude)?;

        let duration_seconds = u32::try_from(self.duration_seconds)
            .ok()
            .filter(|d| *d > 0)
            .ok_or(SpotError::InvalidDuration(self.duration_seconds))?;

        let rate = match self.kind {
            SpotKind::Free => None,
            SpotKind::Paid => {
                let rate = self
                    .rate
                    .map(|r| r.trim().to_string())
                    .filter(|r| !r.is_empty())
                    .ok_or(SpotError::MissingRate)?;
                Some(rate)
            }
        };

        Ok(SpotRecord {
            id: uuid::Uuid::new_v4().to_string(),
            sync: SyncPhase::Pending,
            coordinates,
            kind: self.kind,
            rate,
            created_at: now,
            server_time: false,
            duration_seconds,
            ownership: Ownership::Mine,
            claim: None,
            already_notified: false,
            seen_in_feed: false,
            reopening: false,
        })
    }
}

/// Remote-side status of a report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportStatus {
    Open,
    Resolved,
}

/// A report as delivered by the remote feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteReport {
    pub id: String,
    pub owner_id: String,
    pub coordinates: Coordinates,
    pub kind: SpotKind,
    pub rate: Option<String>,
    pub status: ReportStatus,
    /// Server-assigned
    pub created_at: DateTime<Utc>,
    pub duration_seconds: u32,
    pub resolved_by: Option<String>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl RemoteReport {
    /// Build a store record for a report authored by someone else.
    pub fn to_record(&self, ownership: Ownership) -> Result<SpotRecord, SpotError> {
        self.coordinates.validate()?;
        if self.duration_seconds == 0 {
            return Err(SpotError::InvalidDuration(0));
        }

        Ok(SpotRecord {
            id: self.id.clone(),
            sync: SyncPhase::Confirmed(self.id.clone()),
            coordinates: self.coordinates,
            kind: self.kind,
            rate: self.rate.clone(),
            created_at: self.created_at,
            server_time: true,
            duration_seconds: self.duration_seconds,
            ownership,
            claim: self.claim(),
            already_notified: false,
            seen_in_feed: ownership == Ownership::Mine,
            reopening: false,
        })
    }

    pub fn claim(&self) -> Option<Claim> {
        match self.status {
            ReportStatus::Open => None,
            ReportStatus::Resolved => Some(Claim {
                claimed_by: self.resolved_by.clone().unwrap_or_default(),
                claimed_at: self.resolved_at.unwrap_or(self.created_at),
            }),
        }
    }
}

/// Payload sent to the remote collaborator when creating a report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportDraft {
    pub owner_id: String,
    pub coordinates: Coordinates,
    pub kind: SpotKind,
    pub rate: Option<String>,
    pub duration_seconds: u32,
}

impl ReportDraft {
    pub fn from_record(record: &SpotRecord, owner_id: &str) -> Self {
        Self {
            owner_id: owner_id.to_string(),
            coordinates: record.coordinates,
            kind: record.kind,
            rate: record.rate.clone(),
            duration_seconds: record.duration_seconds,
        }
    }
}

/// One GPS fix from the position stream.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PositionSample {
    pub latitude: f64,
    pub longitude: f64,
    pub timestamp: DateTime<Utc>,
}

impl PositionSample {
    pub fn coordinates(&self) -> Result<Coordinates, SpotError> {
        Coordinates::new(self.latitude, self.longitude)
    }
}

/// A geographic bounding box in WGS84 coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub west: f64,
    pub south: f64,
    pub east: f64,
    pub north: f64,
}

impl BoundingBox {
    pub fn new(west: f64, south: f64, east: f64, north: f64) -> Self {
        Self {
            west,
            south,
            east,
            north,
        }
    }

    pub fn contains(&self, coords: &Coordinates) -> bool {
        let lat_ok = coords.latitude >= self.south && coords.latitude <= self.north;
        let lon_ok = if self.west <= self.east {
            coords.longitude >= self.west && coords.longitude <= self.east
        } else {
            // crosses the antimeridian
            coords.longitude >= self.west || coords.longitude <= self.east
        };
        lat_ok && lon_ok
    }
}

/// Pointer to the spot the user most recently reported, kept for arrival
/// detection across restarts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LastReported {
    pub local_id: String,
    pub remote_id: Option<String>,
    pub coordinates: Coordinates,
}

impl LastReported {
    pub fn report_id(&self) -> &str {
        self.remote_id.as_deref().unwrap_or(&self.local_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coordinate_firewall() {
        assert!(Coordinates::new(59.3, 18.07).is_ok());
        assert!(Coordinates::new(200.0, 18.07).is_err());
        assert!(Coordinates::new(59.3, -180.5).is_err());
        assert!(Coordinates::new(f64::NAN, 0.0).is_err());
        assert!(Coordinates::new(0.0, f64::INFINITY).is_err());
    }

    #[test]
    fn test_new_spot_validation() {
        let now = Utc::now();

        let record = NewSpot::free(59.3, 18.07, 600).into_record(now).unwrap();
        assert_eq!(record.sync, SyncPhase::Pending);
        assert_eq!(record.ownership, Ownership::Mine);
        assert_eq!(record.rate, None);

        assert!(matches!(
            NewSpot::free(59.3, 18.07, 0).into_record(now),
            Err(SpotError::InvalidDuration(0))
        ));
        assert!(matches!(
            NewSpot::free(59.3, 18.07, -5).into_record(now),
            Err(SpotError::InvalidDuration(-5))
        ));
        assert!(matches!(
            NewSpot::paid(59.3, 18.07, "  ", 600).into_record(now),
            Err(SpotError::MissingRate)
        ));
        assert!(matches!(
            NewSpot::free(200.0, 18.07, 600).into_record(now),
            Err(SpotError::InvalidCoordinates { .. })
        ));
    }

    #[test]
    fn test_free_spot_drops_rate() {
        let mut spot = NewSpot::free(59.3, 18.07, 600);
        spot.rate = Some("20 kr/h".to_string());
        let record = spot.into_record(Utc::now()).unwrap();
        assert_eq!(record.rate, None);
    }

    #[test]
    fn test_bounding_box_antimeridian() {
        let bbox = BoundingBox::new(170.0, -10.0, -170.0, 10.0);
        assert!(bbox.contains(&Coordinates::new(0.0, 179.0).unwrap()));
        assert!(bbox.contains(&Coordinates::new(0.0, -175.0).unwrap()));
        assert!(!bbox.contains(&Coordinates::new(0.0, 0.0).unwrap()));
    }
}
