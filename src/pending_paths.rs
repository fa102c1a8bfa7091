//! Off-route paths seen by a single vehicle, waiting for a second vehicle to corroborate them.

use crate::configuration::RouteConfig;
use crate::state::RouteKey;
use crate::tracker::CompletedPath;
use chrono::{DateTime, Duration, Utc};
use log::debug;
use route_geometry::{path_length, paths_overlap, LatLng};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingPath {
    pub origin_vehicle_id: String,
    pub path: Vec<LatLng>,
    /// Creation time, refreshed whenever the same vehicle matches the path again.
    pub timestamp: DateTime<Utc>,
    pub route_id: String,
    pub direction_id: Option<String>,
    pub matched_vehicles: BTreeSet<String>,
    pub match_count: usize,
}

impl PendingPath {
    fn from_completed(completed: CompletedPath) -> Self {
        PendingPath {
            matched_vehicles: BTreeSet::from([completed.vehicle_id.clone()]),
            origin_vehicle_id: completed.vehicle_id,
            path: completed.path,
            timestamp: completed.ended_at,
            route_id: completed.route_id,
            direction_id: completed.direction_id,
            match_count: 1,
        }
    }
}

/// Two or more distinct vehicles drove the same off-route geometry.
#[derive(Debug, Clone, PartialEq)]
pub struct Promotion {
    pub route_id: String,
    pub direction_id: Option<String>,
    pub route_key: RouteKey,
    pub pending_path: Vec<LatLng>,
    pub new_path: Vec<LatLng>,
    pub vehicles: Vec<String>,
    pub observed_at: DateTime<Utc>,
}

impl Promotion {
    /// The longer of the two matched paths. Ties keep the pending one.
    pub fn representative_path(&self) -> &[LatLng] {
        if path_length(&self.new_path) > path_length(&self.pending_path) {
            &self.new_path
        } else {
            &self.pending_path
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MatchOutcome {
    Inserted,
    /// Matched a path from the same vehicle; still uncorroborated.
    Refreshed,
    Promote(Promotion),
}

/// Drops pending paths not refreshed within `expiry`. Returns how many were removed.
pub fn prune_expired(pending: &mut Vec<PendingPath>, now: DateTime<Utc>, expiry: Duration) -> usize {
    let before = pending.len();
    pending.retain(|p| now - p.timestamp <= expiry);
    before - pending.len()
}

/// Matches `completed` against the pending paths of its route key. The first overlapping
/// pending path wins.
pub fn match_path(
    pending: &mut Vec<PendingPath>,
    completed: CompletedPath,
    config: &RouteConfig,
) -> MatchOutcome {
    let now = completed.ended_at;
    let pruned = prune_expired(pending, now, config.pending_path_expiry);
    if pruned > 0 {
        debug!("Pruned {pruned} expired pending paths on {}", completed.route_key);
    }

    let matched = pending.iter().position(|p| {
        paths_overlap(
            &p.path,
            &completed.path,
            config.corridor_width_m,
            config.path_overlap_pct,
        )
    });

    let Some(index) = matched else {
        debug!(
            "New pending path on {} from vehicle {} ({} points)",
            completed.route_key,
            completed.vehicle_id,
            completed.path.len()
        );
        pending.push(PendingPath::from_completed(completed));
        return MatchOutcome::Inserted;
    };

    let candidate = &mut pending[index];
    candidate.matched_vehicles.insert(completed.vehicle_id.clone());
    candidate.match_count += 1;

    if candidate.matched_vehicles.len() >= 2 {
        let promoted = pending.remove(index);
        return MatchOutcome::Promote(Promotion {
            route_id: completed.route_id,
            direction_id: completed.direction_id,
            route_key: completed.route_key,
            pending_path: promoted.path,
            new_path: completed.path,
            vehicles: promoted.matched_vehicles.into_iter().collect(),
            observed_at: now,
        });
    }

    if path_length(&completed.path) > path_length(&candidate.path) {
        candidate.path = completed.path;
    }
    candidate.timestamp = now;
    MatchOutcome::Refreshed
}
