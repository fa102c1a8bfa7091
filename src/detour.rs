use crate::configuration::ConfidenceThresholds;
use crate::feed::AlertEffect;
use crate::state::RouteKey;
use chrono::{DateTime, Duration, Utc};
use route_geometry::LatLng;
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};

const RECENT_BONUS_WINDOW_MINS: i64 = 5;
const FRESH_BONUS_WINDOW_MINS: i64 = 15;
const RECENT_BONUS: u32 = 5;
const FRESH_BONUS: u32 = 2;
const ALERT_BONUS: u32 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetourStatus {
    Suspected,
    Cleared,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConfidenceLevel {
    Suspected,
    Likely,
    HighConfidence,
}

impl ConfidenceLevel {
    pub fn from_score(score: u8, thresholds: &ConfidenceThresholds) -> Self {
        if score >= thresholds.high {
            ConfidenceLevel::HighConfidence
        } else if score >= thresholds.likely {
            ConfidenceLevel::Likely
        } else {
            ConfidenceLevel::Suspected
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Evidence {
    pub vehicle_id: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfficialAlertMatch {
    pub matched: bool,
    pub id: String,
    pub title: String,
    pub effect: AlertEffect,
    pub severity: Option<String>,
    pub matched_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AffectedStop {
    pub stop_id: String,
    pub name: String,
    pub position: LatLng,
    pub distance_m: f64,
    /// Segment of the detour polyline the stop is closest to.
    pub path_index: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Detour {
    pub id: String,
    pub route_id: String,
    pub direction_id: Option<String>,
    pub route_key: RouteKey,
    pub polyline: Vec<LatLng>,
    pub centroid: LatLng,
    pub confirmed_by_vehicles: Vec<Evidence>,
    pub first_detected: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub status: DetourStatus,
    pub evidence_count: usize,
    pub confidence_score: u8,
    pub confidence_level: ConfidenceLevel,
    pub official_alert: Option<OfficialAlertMatch>,
    pub affected_stops: Vec<AffectedStop>,
    pub segment_label: Option<String>,
    pub clearing_evidence: Vec<Evidence>,
    pub cleared_at: Option<DateTime<Utc>>,
    pub cleared_by: Option<String>,
}

/// Score in 0..=100 from the number of distinct confirming vehicles, how recently the detour
/// was last seen and whether an official alert backs it.
pub fn confidence_score(
    distinct_vehicles: usize,
    last_seen: DateTime<Utc>,
    now: DateTime<Utc>,
    alert_matched: bool,
) -> u8 {
    let base: u32 = match distinct_vehicles {
        0 => 0,
        1 => 40,
        2 => 65,
        3 => 75,
        4 => 85,
        _ => 92,
    };

    let age = now - last_seen;
    let recency = if age <= Duration::minutes(RECENT_BONUS_WINDOW_MINS) {
        RECENT_BONUS
    } else if age <= Duration::minutes(FRESH_BONUS_WINDOW_MINS) {
        FRESH_BONUS
    } else {
        0
    };

    let alert = if alert_matched { ALERT_BONUS } else { 0 };

    (base + recency + alert).min(100) as u8
}

impl Detour {
    pub fn distinct_vehicles(&self) -> FxHashSet<&str> {
        self.confirmed_by_vehicles
            .iter()
            .map(|e| e.vehicle_id.as_str())
            .collect()
    }

    pub fn is_active(&self) -> bool {
        self.status == DetourStatus::Suspected
    }

    pub fn alert_matched(&self) -> bool {
        self.official_alert.as_ref().map_or(false, |a| a.matched)
    }

    /// Re-derives evidence count, score and level. The only place these fields are written.
    pub fn refresh_confidence(&mut self, now: DateTime<Utc>, thresholds: &ConfidenceThresholds) {
        self.evidence_count = self.distinct_vehicles().len();
        self.confidence_score =
            confidence_score(self.evidence_count, self.last_seen, now, self.alert_matched());
        self.confidence_level = ConfidenceLevel::from_score(self.confidence_score, thresholds);
    }

    pub fn distinct_clearing_vehicles(&self, since: DateTime<Utc>) -> usize {
        self.clearing_evidence
            .iter()
            .filter(|e| e.timestamp >= since)
            .map(|e| e.vehicle_id.as_str())
            .collect::<FxHashSet<_>>()
            .len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArchiveReason {
    Expired,
    Cleared,
    ExpiredMaxRetention,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchivedDetour {
    #[serde(flatten)]
    pub detour: Detour,
    pub archived_at: DateTime<Utc>,
    pub archive_reason: ArchiveReason,
}
