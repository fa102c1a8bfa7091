//! Per-vehicle off-route tracking.
//!
//! Every update is snapped to the nearest published shape variant of the vehicle's route. A
//! vehicle further than the route's threshold from every variant is off-route; while it stays
//! off-route a breadcrumb trail is kept, and when it comes back the trail is closed into a
//! [CompletedPath] if it is long enough to be more than GPS noise.

use crate::configuration::RouteConfig;
use crate::feed::{RouteShape, ValidUpdate};
use crate::state::RouteKey;
use chrono::{DateTime, Duration, Utc};
use log::debug;
use route_geometry::{distance_to_polyline, path_length, simplify, LatLng};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Breadcrumb {
    pub position: LatLng,
    pub timestamp: DateTime<Utc>,
    pub shape_id: String,
    pub off_route_distance_m: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VehicleTrackingRecord {
    pub vehicle_id: String,
    pub trip_id: Option<String>,
    pub route_id: String,
    pub direction_id: Option<String>,
    pub off_route: bool,
    pub breadcrumbs: Vec<Breadcrumb>,
    pub off_route_since: Option<DateTime<Utc>>,
    pub last_shape_id: Option<String>,
    pub last_update: DateTime<Utc>,
}

impl VehicleTrackingRecord {
    fn new(update: &ValidUpdate) -> Self {
        VehicleTrackingRecord {
            vehicle_id: update.vehicle_id.to_string(),
            trip_id: update.trip_id.map(str::to_string),
            route_id: update.route_id.to_string(),
            direction_id: update.direction_id.map(str::to_string),
            off_route: false,
            breadcrumbs: Vec::new(),
            off_route_since: None,
            last_shape_id: None,
            last_update: update.timestamp,
        }
    }

    pub fn route_key(&self) -> RouteKey {
        RouteKey::new(&self.route_id, self.direction_id.as_deref())
    }

    fn reset_trail(&mut self) {
        self.off_route = false;
        self.breadcrumbs.clear();
        self.off_route_since = None;
    }
}

/// A closed off-route trail that passed every noise filter.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletedPath {
    pub vehicle_id: String,
    pub route_id: String,
    pub direction_id: Option<String>,
    pub route_key: RouteKey,
    /// Simplified trail.
    pub path: Vec<LatLng>,
    pub breadcrumb_count: usize,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
}

impl CompletedPath {
    pub fn duration(&self) -> Duration {
        self.ended_at - self.started_at
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ClosureRejection {
    TooFewPoints(usize),
    TooBrief(Duration),
    TooShort(f64),
}

#[derive(Debug, Clone, PartialEq)]
pub enum TrackEvent {
    OnRoute,
    WentOffRoute,
    StillOffRoute { breadcrumb_added: bool },
    /// Back on the route. `completed` is `None` when the trail was filtered out as noise.
    Returned { completed: Option<CompletedPath> },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub vehicle_id: String,
    pub route_id: String,
    pub route_key: RouteKey,
    pub position: LatLng,
    pub timestamp: DateTime<Utc>,
    pub distance_from_route_m: f64,
    pub event: TrackEvent,
}

impl Observation {
    /// On the route without having just finished an excursion.
    pub fn is_plain_on_route(&self) -> bool {
        self.event == TrackEvent::OnRoute
    }
}

/// Nearest shape variant to `position` and the distance to it.
pub fn nearest_shape<'a>(position: &LatLng, shapes: &'a [RouteShape]) -> Option<(&'a RouteShape, f64)> {
    let mut best = None;
    let mut best_dist = f64::INFINITY;
    for shape in shapes {
        if let Some(m) = distance_to_polyline(position, &shape.points) {
            if m.distance_m < best_dist {
                best_dist = m.distance_m;
                best = Some(shape);
            }
        }
    }
    best.map(|shape| (shape, best_dist))
}

/// Applies filters to a finished trail and simplifies it.
pub fn close_trail(
    record: &VehicleTrackingRecord,
    breadcrumbs: &[Breadcrumb],
    started_at: DateTime<Utc>,
    ended_at: DateTime<Utc>,
    config: &RouteConfig,
) -> Result<CompletedPath, ClosureRejection> {
    if breadcrumbs.len() < config.min_off_route_points {
        return Err(ClosureRejection::TooFewPoints(breadcrumbs.len()));
    }

    let elapsed = ended_at - started_at;
    if elapsed < config.min_off_route_duration {
        return Err(ClosureRejection::TooBrief(elapsed));
    }

    let points: Vec<LatLng> = breadcrumbs.iter().map(|b| b.position).collect();
    let path = simplify(&points, config.simplify_tolerance_m);
    let length = path_length(&path);
    if length < config.min_path_length_m {
        return Err(ClosureRejection::TooShort(length));
    }

    Ok(CompletedPath {
        vehicle_id: record.vehicle_id.clone(),
        route_id: record.route_id.clone(),
        direction_id: record.direction_id.clone(),
        route_key: record.route_key(),
        path,
        breadcrumb_count: breadcrumbs.len(),
        started_at,
        ended_at,
    })
}

/// Feeds one update through the vehicle's state machine.
///
/// Returns `None` when the vehicle cannot be tracked (no shapes for its route) or when the
/// update is older than what was already seen for the vehicle.
pub fn observe(
    records: &mut FxHashMap<String, VehicleTrackingRecord>,
    update: &ValidUpdate,
    shapes: &[RouteShape],
    config: &RouteConfig,
) -> Option<Observation> {
    let (shape, distance) = nearest_shape(&update.position, shapes)?;

    let record = records
        .entry(update.vehicle_id.to_string())
        .or_insert_with(|| VehicleTrackingRecord::new(update));

    if update.timestamp < record.last_update {
        debug!(
            "Ignoring out of order update for vehicle {} ({} < {})",
            update.vehicle_id, update.timestamp, record.last_update
        );
        return None;
    }

    let same_route = record.route_id == update.route_id
        && record.direction_id.as_deref() == update.direction_id;
    if !same_route {
        if record.off_route {
            debug!(
                "Vehicle {} switched to route {} while off-route, dropping {} breadcrumbs",
                record.vehicle_id,
                update.route_id,
                record.breadcrumbs.len()
            );
        }
        record.reset_trail();
        record.route_id = update.route_id.to_string();
        record.direction_id = update.direction_id.map(str::to_string);
    }
    record.trip_id = update.trip_id.map(str::to_string);
    record.last_shape_id = Some(shape.shape_id.clone());
    record.last_update = update.timestamp;

    let is_off_route = distance > config.off_route_threshold_m;
    let breadcrumb = || Breadcrumb {
        position: update.position,
        timestamp: update.timestamp,
        shape_id: shape.shape_id.clone(),
        off_route_distance_m: distance,
    };

    let event = match (record.off_route, is_off_route) {
        (false, false) => TrackEvent::OnRoute,
        (false, true) => {
            record.off_route = true;
            record.off_route_since = Some(update.timestamp);
            record.breadcrumbs = vec![breadcrumb()];
            TrackEvent::WentOffRoute
        }
        (true, true) => {
            let far_enough = record.breadcrumbs.last().map_or(true, |last| {
                last.position.haversine_distance(&update.position) >= config.breadcrumb_spacing_m
            });
            if far_enough {
                record.breadcrumbs.push(breadcrumb());
            }
            TrackEvent::StillOffRoute {
                breadcrumb_added: far_enough,
            }
        }
        (true, false) => {
            let breadcrumbs = std::mem::take(&mut record.breadcrumbs);
            let started_at = record.off_route_since.unwrap_or(update.timestamp);
            let closed = close_trail(record, &breadcrumbs, started_at, update.timestamp, config);
            record.reset_trail();

            let completed = match closed {
                Ok(path) => Some(path),
                Err(reason) => {
                    debug!(
                        "Vehicle {} back on route {}, trail discarded: {:?}",
                        record.vehicle_id, record.route_id, reason
                    );
                    None
                }
            };
            TrackEvent::Returned { completed }
        }
    };

    Some(Observation {
        vehicle_id: record.vehicle_id.clone(),
        route_id: record.route_id.clone(),
        route_key: record.route_key(),
        position: update.position,
        timestamp: update.timestamp,
        distance_from_route_m: distance,
        event,
    })
}
