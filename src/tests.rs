use crate::configuration::{ConfidenceThresholds, MAX_DURATION_SECS};
use crate::detour::confidence_score;
use crate::engine::{self, BatchReport};
use crate::lifecycle::required_clearing_vehicles;
use crate::query::{
    active_detours, active_detours_for_route, detour_history, find_detour, has_active_detour,
};
use crate::*;
use chrono::{DateTime, Duration, TimeZone, Utc};
use rustc_hash::{FxHashMap, FxHashSet};

const ROUTE_LAT: f64 = 43.650;
// ~111 m north of the published shape
const DETOUR_LAT: f64 = 43.651;

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 2, 8, 0, 0).unwrap()
}

fn mins(m: i64) -> Duration {
    Duration::minutes(m)
}

fn shapes_for(route_ids: &[&str]) -> RouteShapes {
    route_ids
        .iter()
        .map(|r| {
            (
                r.to_string(),
                vec![RouteShape {
                    shape_id: format!("{r}-main"),
                    points: vec![
                        LatLng::from_lat_lng(ROUTE_LAT, -79.410),
                        LatLng::from_lat_lng(ROUTE_LAT, -79.370),
                    ],
                }],
            )
        })
        .collect()
}

fn update(vehicle: &str, route: &str, lat: f64, lng: f64) -> VehicleUpdate {
    VehicleUpdate {
        id: Some(vehicle.to_string()),
        coordinate: Some(LatLng::from_lat_lng(lat, lng)),
        route_id: Some(route.to_string()),
        direction_id: Some("0".to_string()),
        trip_id: Some(format!("trip-{vehicle}")),
        bearing: None,
        timestamp: None,
    }
}

fn assert_evidence_invariant(detour: &Detour) {
    let distinct: FxHashSet<&str> = detour
        .confirmed_by_vehicles
        .iter()
        .map(|e| e.vehicle_id.as_str())
        .collect();
    assert_eq!(detour.evidence_count, distinct.len(), "{detour:?}");
}

struct Harness {
    state: DetourState,
    settings: DetourSettings,
    shapes: RouteShapes,
}

impl Harness {
    fn new() -> Self {
        Self::with_settings(DetourSettings::default())
    }

    fn with_settings(settings: DetourSettings) -> Self {
        Harness {
            state: DetourState::new(),
            settings,
            shapes: shapes_for(&["12", "8", "5"]),
        }
    }

    fn push(&self, updates: Vec<VehicleUpdate>, at: DateTime<Utc>) -> BatchReport {
        engine::process_batch(&self.state, &self.settings, &self.shapes, &updates, at)
    }

    /// One vehicle leaves the route, drives ~480 m parallel to it for 150 s and rejoins.
    /// The excursion closes at `start + 3 min`.
    fn drive_detour(&self, vehicle: &str, route: &str, start: DateTime<Utc>) -> BatchReport {
        self.push(vec![update(vehicle, route, ROUTE_LAT, -79.398)], start);
        for i in 0..5 {
            let at = start + Duration::seconds(30 * (i + 1));
            let lng = -79.396 + 0.0015 * i as f64;
            self.push(vec![update(vehicle, route, DETOUR_LAT, lng)], at);
        }
        self.push(
            vec![update(vehicle, route, ROUTE_LAT, -79.386)],
            start + mins(3),
        )
    }

    /// On-route report right next to the detour centroid.
    fn pass_centroid(&self, vehicle: &str, route: &str, at: DateTime<Utc>) -> BatchReport {
        self.push(vec![update(vehicle, route, ROUTE_LAT, -79.393)], at)
    }

    fn tick(&self, at: DateTime<Utc>) -> sweep::SweepReport {
        engine::tick(&self.state, &self.settings, at)
    }

    fn only_detour(&self) -> Detour {
        let active = active_detours(&self.state);
        assert_eq!(active.len(), 1, "{active:?}");
        active.into_iter().next().unwrap()
    }
}

#[test]
fn two_vehicles_on_the_same_excursion_create_a_detour() {
    let h = Harness::new();

    let a = h.drive_detour("A", "12", t0());
    assert_eq!(a.completed_paths, 1);
    assert_eq!(a.pending_inserted, 1);
    assert!(active_detours(&h.state).is_empty());
    assert_eq!(h.state.pending_path_count(), 1);

    let b = h.drive_detour("B", "12", t0() + mins(2));
    assert_eq!(b.detours_created, 1);
    assert_eq!(h.state.pending_path_count(), 0);

    let detour = h.only_detour();
    assert_eq!(detour.status, DetourStatus::Suspected);
    assert_eq!(detour.evidence_count, 2);
    assert_eq!(detour.route_id, "12");
    assert_eq!(detour.direction_id.as_deref(), Some("0"));
    assert_eq!(detour.route_key, RouteKey::new("12", Some("0")));
    // 65 for two vehicles, +5 for being seen just now
    assert_eq!(detour.confidence_score, 70);
    assert_eq!(detour.confidence_level, ConfidenceLevel::Likely);
    assert_eq!(detour.first_detected, t0() + mins(5));
    assert!((detour.centroid.latitude - DETOUR_LAT).abs() < 1e-9);
    assert_evidence_invariant(&detour);

    assert!(has_active_detour(&h.state, "12"));
    assert!(!has_active_detour(&h.state, "8"));
    assert_eq!(active_detours_for_route(&h.state, "12", Some("0")).len(), 1);
    assert!(active_detours_for_route(&h.state, "12", Some("1")).is_empty());
}

#[test]
fn one_vehicle_never_creates_a_detour() {
    let h = Harness::new();
    for k in 0..3 {
        let report = h.drive_detour("A", "12", t0() + mins(10 * k));
        assert_eq!(report.completed_paths, 1);
        assert_eq!(report.detours_created, 0);
    }
    assert!(active_detours(&h.state).is_empty());

    let slot = h.state.slot(&RouteKey::new("12", Some("0"))).unwrap();
    let slot = slot.lock();
    assert_eq!(slot.pending.len(), 1);
    assert_eq!(slot.pending[0].match_count, 3);
    assert_eq!(slot.pending[0].matched_vehicles.len(), 1);
    assert_eq!(slot.pending[0].timestamp, t0() + mins(23));
}

#[test]
fn stale_pending_path_is_not_corroborated() {
    let h = Harness::new();
    h.drive_detour("A", "12", t0());
    let b = h.drive_detour("B", "12", t0() + mins(40));
    assert_eq!(b.detours_created, 0);
    assert_eq!(b.pending_inserted, 1);
    assert!(active_detours(&h.state).is_empty());
    assert_eq!(h.state.pending_path_count(), 1);
}

#[test]
fn clearing_needs_two_distinct_on_route_vehicles() {
    let h = Harness::new();
    h.drive_detour("A", "12", t0());
    h.drive_detour("B", "12", t0() + mins(2));
    let id = h.only_detour().id;

    h.pass_centroid("C", "12", t0() + mins(6));
    let detour = find_detour(&h.state, &id).unwrap();
    assert_eq!(detour.clearing_evidence.len(), 1);
    assert_eq!(detour.status, DetourStatus::Suspected);

    // the same vehicle again does not count twice
    h.pass_centroid("C", "12", t0() + mins(7));
    let detour = find_detour(&h.state, &id).unwrap();
    assert_eq!(detour.distinct_clearing_vehicles(t0()), 1);
    assert_eq!(detour.status, DetourStatus::Suspected);

    // likely tier would need 3, capped at the 2 confirming vehicles
    assert_eq!(detour.confidence_level, ConfidenceLevel::Likely);
    let report = h.pass_centroid("D", "12", t0() + mins(8));
    assert_eq!(report.detours_cleared, 1);

    let detour = find_detour(&h.state, &id).unwrap();
    assert_eq!(detour.status, DetourStatus::Cleared);
    assert_eq!(detour.cleared_by.as_deref(), Some("D"));
    assert_eq!(detour.cleared_at, Some(t0() + mins(8)));
    assert!(!has_active_detour(&h.state, "12"));
    assert!(active_detours(&h.state).is_empty());
}

#[test]
fn on_route_vehicles_far_from_the_detour_do_not_clear_it() {
    let h = Harness::new();
    h.drive_detour("A", "12", t0());
    h.drive_detour("B", "12", t0() + mins(2));

    // 800 m west of the centroid
    h.push(vec![update("C", "12", ROUTE_LAT, -79.403)], t0() + mins(6));
    h.push(vec![update("D", "12", ROUTE_LAT, -79.403)], t0() + mins(6));
    // right next to it, but serving another route
    h.pass_centroid("E", "8", t0() + mins(6));

    let detour = h.only_detour();
    assert!(detour.clearing_evidence.is_empty());
}

#[test]
fn cleared_detour_never_reopens() {
    let h = Harness::new();
    h.drive_detour("A", "12", t0());
    h.drive_detour("B", "12", t0() + mins(2));
    let id = h.only_detour().id;
    h.pass_centroid("C", "12", t0() + mins(6));
    h.pass_centroid("D", "12", t0() + mins(7));

    // the same excursion happens again: it becomes a new record
    h.drive_detour("E", "12", t0() + mins(10));
    let f = h.drive_detour("F", "12", t0() + mins(12));
    assert_eq!(f.detours_created, 1);
    assert_eq!(f.detours_merged, 0);

    let old = find_detour(&h.state, &id).unwrap();
    assert_eq!(old.status, DetourStatus::Cleared);
    assert_eq!(old.evidence_count, 2);

    let active = h.only_detour();
    assert_ne!(active.id, id);
}

#[test]
fn more_vehicles_merge_into_the_same_detour() {
    let h = Harness::new();
    h.drive_detour("A", "12", t0());
    h.drive_detour("B", "12", t0() + mins(2));
    let created = h.only_detour();

    h.drive_detour("C", "12", t0() + mins(10));
    let d = h.drive_detour("D", "12", t0() + mins(12));
    assert_eq!(d.detours_merged, 1);
    let merged = h.only_detour();
    assert_eq!(merged.id, created.id);
    assert_eq!(merged.evidence_count, 4);
    assert_eq!(merged.last_seen, t0() + mins(15));
    assert!(merged.confidence_score >= created.confidence_score);
    assert_eq!(merged.confidence_level, ConfidenceLevel::HighConfidence);
    assert_evidence_invariant(&merged);

    // A confirmed 10 minutes ago, so only G adds evidence
    h.drive_detour("A", "12", t0() + mins(20));
    h.drive_detour("G", "12", t0() + mins(22));
    let merged = h.only_detour();
    assert_eq!(merged.confirmed_by_vehicles.len(), 5);
    assert_eq!(merged.evidence_count, 5);
    assert_evidence_invariant(&merged);
}

#[test]
fn low_confidence_detour_expires_high_confidence_does_not() {
    let h = Harness::new();
    h.drive_detour("A", "12", t0());
    h.drive_detour("B", "12", t0() + mins(2));
    h.drive_detour("P", "8", t0());
    h.drive_detour("Q", "8", t0() + mins(2));
    for (i, v) in ["R", "S", "T", "U"].iter().enumerate() {
        h.drive_detour(v, "8", t0() + mins(10 + 2 * i as i64));
    }
    let strong = active_detours_for_route(&h.state, "8", None);
    assert_eq!(strong.len(), 1);
    assert_eq!(strong[0].evidence_count, 6);

    // route 12 was last seen at t0+5, route 8 at t0+19
    let report = h.tick(t0() + mins(55));
    assert_eq!(report.expired, 1);

    let history = detour_history(&h.state, None, 10);
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].archive_reason, ArchiveReason::Expired);
    assert_eq!(history[0].detour.route_id, "12");
    assert_eq!(history[0].archived_at, t0() + mins(55));

    let remaining = h.only_detour();
    assert_eq!(remaining.route_id, "8");
    assert_eq!(remaining.confidence_level, ConfidenceLevel::HighConfidence);

    let report = h.tick(remaining.first_detected + Duration::hours(24) + mins(1));
    assert_eq!(report.expired_max_retention, 1);
    assert!(active_detours(&h.state).is_empty());
    let history = detour_history(&h.state, None, 10);
    assert_eq!(history[0].archive_reason, ArchiveReason::ExpiredMaxRetention);
}

#[test]
fn fresh_detour_survives_sweep() {
    let h = Harness::new();
    h.drive_detour("A", "12", t0());
    h.drive_detour("B", "12", t0() + mins(2));

    let report = h.tick(t0() + mins(25));
    assert_eq!(report.archived(), 0);
    let detour = h.only_detour();
    // recency bonus decays with the sweep clock
    assert_eq!(detour.confidence_score, 65);
    assert_eq!(detour.confidence_level, ConfidenceLevel::Suspected);
}

#[test]
fn cleared_detour_is_retired_after_retention() {
    let h = Harness::new();
    h.drive_detour("A", "12", t0());
    h.drive_detour("B", "12", t0() + mins(2));
    let id = h.only_detour().id;
    h.pass_centroid("C", "12", t0() + mins(6));
    h.pass_centroid("D", "12", t0() + mins(7));

    assert_eq!(h.tick(t0() + mins(11)).archived(), 0);
    assert!(find_detour(&h.state, &id).is_some());

    let report = h.tick(t0() + mins(12));
    assert_eq!(report.cleared, 1);
    assert!(find_detour(&h.state, &id).is_none());
    let history = detour_history(&h.state, Some("12"), 5);
    assert_eq!(history[0].archive_reason, ArchiveReason::Cleared);
    assert_eq!(history[0].detour.status, DetourStatus::Cleared);
}

#[test]
fn sweep_prunes_pending_paths_and_stale_vehicles() {
    let h = Harness::new();
    h.drive_detour("A", "12", t0());
    assert_eq!(h.state.pending_path_count(), 1);
    assert_eq!(h.state.tracked_vehicles(), 1);

    let report = h.tick(t0() + mins(40));
    assert_eq!(report.pending_pruned, 1);
    assert_eq!(report.vehicles_evicted, 1);
    assert_eq!(report.routes_dropped, 1);
    assert_eq!(h.state.pending_path_count(), 0);
    assert_eq!(h.state.tracked_vehicles(), 0);
}

#[test]
fn history_is_capped_most_recent_first() {
    let settings = DetourSettings {
        history_cap: 2,
        ..Default::default()
    };
    let h = Harness::with_settings(settings);
    for route in ["12", "8", "5"] {
        h.drive_detour(&format!("{route}-A"), route, t0());
        h.drive_detour(&format!("{route}-B"), route, t0() + mins(2));
    }
    assert_eq!(active_detours(&h.state).len(), 3);

    let report = h.tick(t0() + mins(40));
    assert_eq!(report.expired, 3);

    let routes: Vec<String> = detour_history(&h.state, None, 10)
        .into_iter()
        .map(|a| a.detour.route_id)
        .collect();
    assert_eq!(routes, vec!["8", "5"]);
    assert_eq!(detour_history(&h.state, Some("8"), 10).len(), 1);
    assert!(detour_history(&h.state, Some("12"), 10).is_empty());
    assert_eq!(detour_history(&h.state, None, 1).len(), 1);
}

#[test]
fn short_excursion_is_rejected() {
    let h = Harness::new();
    h.push(vec![update("A", "12", ROUTE_LAT, -79.398)], t0());
    // three breadcrumbs spanning ~80 m over three minutes
    for (i, lng) in [-79.396, -79.3955, -79.395].iter().enumerate() {
        let at = t0() + Duration::seconds(60 * (i as i64 + 1));
        h.push(vec![update("A", "12", DETOUR_LAT, *lng)], at);
    }
    let report = h.push(vec![update("A", "12", ROUTE_LAT, -79.393)], t0() + mins(4));
    assert_eq!(report.completed_paths, 0);
    assert_eq!(h.state.pending_path_count(), 0);
}

#[test]
fn brief_excursion_is_rejected() {
    let h = Harness::new();
    h.push(vec![update("A", "12", ROUTE_LAT, -79.398)], t0());
    for i in 0..5 {
        let at = t0() + Duration::seconds(5 * (i + 1));
        h.push(vec![update("A", "12", DETOUR_LAT, -79.396 + 0.0015 * i as f64)], at);
    }
    let report = h.push(vec![update("A", "12", ROUTE_LAT, -79.386)], t0() + Duration::seconds(30));
    assert_eq!(report.completed_paths, 0);
}

#[test]
fn breadcrumbs_skip_gps_jitter() {
    let h = Harness::new();
    let steps = [-79.396, -79.39594, -79.3958, -79.39579, -79.3950];
    for (i, lng) in steps.iter().enumerate() {
        let at = t0() + Duration::seconds(15 * i as i64);
        h.push(vec![update("A", "12", DETOUR_LAT, *lng)], at);
    }

    let vehicles = h.state.vehicles();
    let record = vehicles.get("A").unwrap();
    assert!(record.off_route);
    assert_eq!(record.off_route_since, Some(t0()));
    assert_eq!(record.breadcrumbs.len(), 3);
    for pair in record.breadcrumbs.windows(2) {
        assert!(pair[0].position.haversine_distance(&pair[1].position) >= 10.0);
    }
    assert_eq!(record.breadcrumbs[0].shape_id, "12-main");
    assert!(record.breadcrumbs[0].off_route_distance_m > 100.0);
}

#[test]
fn switching_route_while_off_route_drops_the_trail() {
    let h = Harness::new();
    h.push(vec![update("A", "12", DETOUR_LAT, -79.396)], t0());
    h.push(vec![update("A", "12", DETOUR_LAT, -79.394)], t0() + mins(1));
    let report = h.push(vec![update("A", "5", ROUTE_LAT, -79.390)], t0() + mins(2));
    assert_eq!(report.completed_paths, 0);

    let vehicles = h.state.vehicles();
    let record = vehicles.get("A").unwrap();
    assert_eq!(record.route_id, "5");
    assert!(!record.off_route);
    assert!(record.breadcrumbs.is_empty());
}

#[test]
fn incomplete_and_untrackable_updates_are_ignored() {
    let h = Harness::new();
    let mut no_id = update("A", "12", ROUTE_LAT, -79.39);
    no_id.id = None;
    let mut no_coordinate = update("B", "12", ROUTE_LAT, -79.39);
    no_coordinate.coordinate = None;
    let mut no_route = update("C", "12", ROUTE_LAT, -79.39);
    no_route.route_id = None;
    let bad_coordinate = update("D", "12", f64::NAN, -79.39);
    let unknown_route = update("E", "99", ROUTE_LAT, -79.39);
    let no_fix = update("F", "12", 0.0, 0.0);

    let report = h.push(
        vec![no_id, no_coordinate, no_route, bad_coordinate, unknown_route, no_fix],
        t0(),
    );
    assert_eq!(report.updates, 6);
    assert_eq!(report.ignored, 5);
    assert_eq!(report.untracked, 1);
    assert_eq!(h.state.tracked_vehicles(), 0);
}

#[test]
fn out_of_order_update_is_ignored() {
    let h = Harness::new();
    h.push(vec![update("A", "12", DETOUR_LAT, -79.396)], t0() + mins(1));
    let mut late = update("A", "12", ROUTE_LAT, -79.390);
    late.timestamp = Some(t0());
    let report = h.push(vec![late], t0() + mins(2));
    assert_eq!(report.untracked, 1);
    assert!(h.state.vehicles().get("A").unwrap().off_route);
}

#[test]
fn alert_correlation_adds_bonus() {
    let h = Harness::new();
    h.drive_detour("A", "8", t0());
    h.drive_detour("B", "8", t0() + mins(2));
    let now = t0() + mins(5);
    let before = h.only_detour();

    let alerts: Vec<ServiceAlert> = serde_json::from_str(
        r#"[
            {"id": "moved", "title": "Stop moved", "effect": "Stop Moved", "affectedRoutes": ["8"]},
            {"id": "a-12", "title": "Route 12 detour", "effect": "Detour", "affectedRoutes": ["12"]},
            {"id": "a-8", "title": "Route 8 detour", "effect": "Detour", "severity": "WARNING", "affectedRoutes": ["7", "8"]}
        ]"#,
    )
    .unwrap();
    assert_eq!(alerts[0].effect, AlertEffect::Other);

    assert_eq!(engine::correlate(&h.state, &h.settings, &alerts, now), 1);
    let after = h.only_detour();
    let alert = after.official_alert.as_ref().unwrap();
    assert!(alert.matched);
    assert_eq!(alert.id, "a-8");
    assert_eq!(alert.severity.as_deref(), Some("WARNING"));
    assert_eq!(after.confidence_score, before.confidence_score + 8);

    // same alert again keeps the original match time
    engine::correlate(&h.state, &h.settings, &alerts, now + mins(1));
    assert_eq!(h.only_detour().official_alert.unwrap().matched_at, now);

    // alert withdrawn
    assert_eq!(engine::correlate(&h.state, &h.settings, &alerts[..2], now), 1);
    let withdrawn = h.only_detour();
    assert!(withdrawn.official_alert.is_none());
    assert_eq!(withdrawn.confidence_score, before.confidence_score);
}

#[test]
fn cleared_detours_are_not_correlated() {
    let h = Harness::new();
    h.drive_detour("A", "12", t0());
    h.drive_detour("B", "12", t0() + mins(2));
    let id = h.only_detour().id;
    h.pass_centroid("C", "12", t0() + mins(6));
    h.pass_centroid("D", "12", t0() + mins(7));

    let alerts = vec![ServiceAlert {
        id: "a".to_string(),
        title: "Detour".to_string(),
        effect: AlertEffect::Detour,
        severity: None,
        affected_routes: vec!["12".to_string()],
    }];
    assert_eq!(engine::correlate(&h.state, &h.settings, &alerts, t0() + mins(8)), 0);
    assert!(find_detour(&h.state, &id).unwrap().official_alert.is_none());
}

fn stop(id: &str, name: &str, lat: f64, lng: f64) -> Stop {
    Stop {
        id: id.to_string(),
        name: name.to_string(),
        position: LatLng::from_lat_lng(lat, lng),
    }
}

#[test]
fn enrichment_lists_bypassed_stops() {
    let h = Harness::new();
    h.drive_detour("A", "12", t0());
    h.drive_detour("B", "12", t0() + mins(2));
    let before = h.only_detour();

    let index = StopIndex::new(vec![
        stop("S2", "King & Yonge", 43.6512, -79.3905),
        stop("S1", "King & Bay", 43.6511, -79.3955),
        stop("S3", "Queen & Bay", 43.660, -79.393),
        stop("S4", "Other line", 43.6511, -79.392),
        stop("S5", "Bad fix", f64::NAN, -79.392),
    ]);
    assert_eq!(index.len(), 4);
    assert!(!index.is_empty());
    let mut route_stops = RouteStops::default();
    route_stops.insert(
        "12".to_string(),
        vec!["S1".to_string(), "S2".to_string(), "S3".to_string()],
    );

    engine::enrich(&h.state, &h.settings, &index, &route_stops);
    let detour = h.only_detour();
    let ids: Vec<&str> = detour.affected_stops.iter().map(|s| s.stop_id.as_str()).collect();
    assert_eq!(ids, vec!["S1", "S2"]);
    assert_eq!(detour.segment_label.as_deref(), Some("King & Bay to King & Yonge"));
    assert_eq!(detour.confidence_score, before.confidence_score);
    assert_eq!(detour.status, before.status);

    let settings = DetourSettings::default().with_route_override(
        "12",
        RouteOverride {
            max_affected_stops: Some(1),
            ..Default::default()
        },
    );
    engine::enrich(&h.state, &settings, &index, &route_stops);
    let detour = h.only_detour();
    assert_eq!(detour.affected_stops.len(), 1);
    assert_eq!(detour.segment_label.as_deref(), Some("Near King & Bay"));
}

#[test]
fn snapshot_restores_working_state() {
    let h = Harness::new();
    h.drive_detour("A", "12", t0());
    h.drive_detour("B", "12", t0() + mins(2));
    h.drive_detour("C", "8", t0());
    h.pass_centroid("D", "12", t0() + mins(6));

    let json = serde_json::to_string(&h.state.snapshot()).unwrap();
    let restored = DetourState::restore(serde_json::from_str(&json).unwrap());

    let original = active_detours(&h.state);
    let copy = active_detours(&restored);
    assert_eq!(copy.len(), original.len());
    assert_eq!(copy[0].id, original[0].id);
    assert_eq!(copy[0].evidence_count, 2);
    assert_eq!(copy[0].clearing_evidence.len(), 1);
    assert_eq!(restored.pending_path_count(), 1);
    assert_eq!(restored.tracked_vehicles(), 4);

    // carries on where the original left off
    let report = engine::process_batch(
        &restored,
        &h.settings,
        &h.shapes,
        &[update("E", "12", ROUTE_LAT, -79.393)],
        t0() + mins(7),
    );
    assert_eq!(report.detours_cleared, 1);

    // detour ids keep counting from the snapshot
    let mut next = Harness::new();
    next.state = restored;
    next.drive_detour("Y", "5", t0() + mins(10));
    next.drive_detour("Z", "5", t0() + mins(12));
    let created = active_detours_for_route(&next.state, "5", None);
    assert_eq!(created.len(), 1);
    assert!(created[0].id.ends_with("-2"), "{}", created[0].id);
}

#[test]
fn confidence_grows_with_distinct_vehicles() {
    let now = t0();
    for recent in [now, now - mins(10), now - mins(30)] {
        for alert in [false, true] {
            let mut previous = 0;
            for n in 0..8 {
                let score = confidence_score(n, recent, now, alert);
                assert!(score >= previous, "n={n} score={score} previous={previous}");
                assert!(score <= 100);
                previous = score;
            }
        }
    }
    assert_eq!(confidence_score(1, now - mins(30), now, false), 40);
    assert_eq!(confidence_score(3, now - mins(10), now, false), 77);
    assert_eq!(confidence_score(4, now, now, false), 90);
    assert_eq!(confidence_score(5, now, now, true), 100);
}

#[test]
fn confidence_levels_follow_configured_thresholds() {
    let defaults = ConfidenceThresholds { likely: 70, high: 85 };
    assert_eq!(ConfidenceLevel::from_score(69, &defaults), ConfidenceLevel::Suspected);
    assert_eq!(ConfidenceLevel::from_score(70, &defaults), ConfidenceLevel::Likely);
    assert_eq!(ConfidenceLevel::from_score(85, &defaults), ConfidenceLevel::HighConfidence);

    let strict = ConfidenceThresholds { likely: 90, high: 99 };
    assert_eq!(ConfidenceLevel::from_score(85, &strict), ConfidenceLevel::Suspected);
}

#[test]
fn clearing_requirement_never_exceeds_evidence() {
    let settings = DetourSettings::default().with_route_override(
        "12",
        RouteOverride {
            likely_threshold: Some(60),
            high_threshold: Some(65),
            ..Default::default()
        },
    );
    let h = Harness::with_settings(settings);
    h.drive_detour("A", "12", t0());
    h.drive_detour("B", "12", t0() + mins(2));
    let detour = h.only_detour();
    assert_eq!(detour.confidence_level, ConfidenceLevel::HighConfidence);

    let config = h.settings.for_route("12");
    assert_eq!(config.clearing.high_confidence, 4);
    assert_eq!(required_clearing_vehicles(&detour, &config), 2);

    h.pass_centroid("C", "12", t0() + mins(6));
    h.pass_centroid("D", "12", t0() + mins(6));
    assert!(active_detours(&h.state).is_empty());
}

#[test]
fn branch_routes_fall_back_to_base_override() {
    let settings = DetourSettings::from_json_str(
        r#"{
            "defaults": {"corridor_width_m": 40.0},
            "routes": {"2": {"off_route_threshold_m": 120.0}, "2b": {"off_route_threshold_m": 90.0}},
            "history_cap": 50
        }"#,
    )
    .unwrap();

    assert_eq!(settings.history_cap, 50);
    assert_eq!(settings.for_route("2").off_route_threshold_m, 120.0);
    assert_eq!(settings.for_route("2A").off_route_threshold_m, 120.0);
    assert_eq!(settings.for_route(" 2a ").off_route_threshold_m, 120.0);
    assert_eq!(settings.for_route("2B").off_route_threshold_m, 90.0);
    assert_eq!(settings.for_route("12").off_route_threshold_m, 60.0);
    assert_eq!(settings.for_route("N2").off_route_threshold_m, 60.0);

    let config = settings.for_route("2A");
    assert_eq!(config.corridor_width_m, 40.0);
    assert_eq!(config.clearing_radius_m(), 120.0);
    assert_eq!(config.pending_path_expiry, mins(30));
    assert_eq!(config.max_retention, Duration::hours(24));
    assert_eq!(config.min_path_length_m, 150.0);
}

#[test]
fn invalid_settings_are_rejected() {
    let err = DetourSettings::from_json_str(
        r#"{"routes": {"7": {"likely_threshold": 90, "high_threshold": 80}}}"#,
    )
    .unwrap_err();
    assert!(
        matches!(err, ConfigError::Invalid { field: "likely_threshold", .. }),
        "{err}"
    );

    let err = DetourSettings::from_json_str(r#"{"history_cap": 0}"#).unwrap_err();
    assert!(matches!(err, ConfigError::Invalid { field: "history_cap", .. }));

    for field in ["max_retention_secs", "clearing_window_secs"] {
        let json = format!(r#"{{"defaults": {{"{field}": 9223372036854775807}}}}"#);
        let err = DetourSettings::from_json_str(&json).unwrap_err();
        assert!(
            matches!(&err, ConfigError::Invalid { field: f, .. } if *f == field),
            "{err}"
        );
    }
    let err = DetourSettings::from_json_str(r#"{"routes": {"12": {"suspected_expiry_secs": -1}}}"#)
        .unwrap_err();
    assert!(matches!(err, ConfigError::Invalid { field: "suspected_expiry_secs", .. }));

    assert!(matches!(
        DetourSettings::from_json_str("{not json"),
        Err(ConfigError::Parse(_))
    ));
    assert!(matches!(
        DetourSettings::from_path("/nonexistent/detour-settings.json"),
        Err(ConfigError::Io { .. })
    ));
}

#[test]
fn geojson_export_carries_detour_properties() {
    let h = Harness::new();
    h.drive_detour("A", "12", t0());
    h.drive_detour("B", "12", t0() + mins(2));

    let collection = export::detours_to_geojson(&active_detours(&h.state));
    assert_eq!(collection.features.len(), 1);
    let feature = &collection.features[0];
    let properties = feature.properties.as_ref().unwrap();
    assert_eq!(properties["routeId"], "12");
    assert_eq!(properties["status"], "suspected");
    assert_eq!(properties["confidenceLevel"], "likely");
    assert_eq!(properties["evidenceCount"], 2);
    match &feature.geometry.as_ref().unwrap().value {
        geojson::Value::LineString(coords) => {
            assert_eq!(coords.len(), 2);
            assert!((coords[0][1] - DETOUR_LAT).abs() < 1e-9);
        }
        other => panic!("unexpected geometry {other:?}"),
    }
}

#[test]
fn engine_state_is_shareable_across_threads() {
    let h = Harness::new();
    let routes = ["12", "8", "5"];
    std::thread::scope(|scope| {
        for route in routes {
            let h = &h;
            scope.spawn(move || {
                h.drive_detour(&format!("{route}-A"), route, t0());
                h.drive_detour(&format!("{route}-B"), route, t0() + mins(2));
            });
        }
    });
    let active = active_detours(&h.state);
    assert_eq!(active.len(), 3);
    let ids: FxHashSet<&str> = active.iter().map(|d| d.id.as_str()).collect();
    assert_eq!(ids.len(), 3);
    let per_route: FxHashMap<&str, usize> = active.iter().fold(FxHashMap::default(), |mut m, d| {
        *m.entry(d.route_id.as_str()).or_default() += 1;
        m
    });
    assert!(per_route.values().all(|&n| n == 1));
}

#[test]
fn oversized_durations_are_clamped() {
    let mut settings = DetourSettings::default();
    settings.defaults.max_retention_secs = i64::MAX;
    settings.defaults.clearing_window_secs = i64::MAX;
    let config = settings.for_route("12");
    assert_eq!(config.max_retention, Duration::seconds(MAX_DURATION_SECS));
    assert_eq!(config.clearing_window, Duration::seconds(MAX_DURATION_SECS));

    let h = Harness::with_settings(settings);
    h.drive_detour("A", "12", t0());
    h.drive_detour("B", "12", t0() + mins(2));
    h.pass_centroid("C", "12", t0() + mins(6));
    let report = h.pass_centroid("D", "12", t0() + mins(7));
    assert_eq!(report.detours_cleared, 1);
    assert_eq!(h.tick(t0() + mins(12)).cleared, 1);
}

#[test]
fn noise_floors_cannot_be_configured_away() {
    for (json, field) in [
        (r#"{"min_path_length_m": 0.0}"#, "min_path_length_m"),
        (r#"{"breadcrumb_spacing_m": 0.0}"#, "breadcrumb_spacing_m"),
        (r#"{"min_path_length_m": 149.0}"#, "min_path_length_m"),
    ] {
        let err = DetourSettings::from_json_str(json).unwrap_err();
        assert!(
            matches!(&err, ConfigError::Invalid { field: f, .. } if *f == field),
            "{err}"
        );
    }
    assert!(DetourSettings::from_json_str(r#"{"min_path_length_m": 300.0}"#).is_ok());

    // built in code, so never validated
    let settings = DetourSettings {
        min_path_length_m: 0.0,
        breadcrumb_spacing_m: 0.0,
        ..Default::default()
    };
    let config = settings.for_route("12");
    assert_eq!(config.min_path_length_m, 150.0);
    assert_eq!(config.breadcrumb_spacing_m, 10.0);

    // two vehicles repeat the same ~80 m excursion
    let h = Harness::with_settings(settings);
    for (k, vehicle) in ["A", "B"].iter().enumerate() {
        let start = t0() + mins(5 * k as i64);
        h.push(vec![update(vehicle, "12", ROUTE_LAT, -79.398)], start);
        for (i, lng) in [-79.396, -79.3955, -79.395].iter().enumerate() {
            let at = start + Duration::seconds(60 * (i as i64 + 1));
            h.push(vec![update(vehicle, "12", DETOUR_LAT, *lng)], at);
        }
        let report = h.push(vec![update(vehicle, "12", ROUTE_LAT, -79.393)], start + mins(4));
        assert_eq!(report.completed_paths, 0);
    }
    assert!(active_detours(&h.state).is_empty());
    assert_eq!(h.state.pending_path_count(), 0);
}

#[test]
fn simultaneous_closures_on_one_route_make_one_detour() {
    for _ in 0..8 {
        let h = Harness::new();
        let vehicles = ["A", "B", "C", "D", "E"];
        let barrier = std::sync::Barrier::new(vehicles.len());
        std::thread::scope(|scope| {
            for vehicle in vehicles {
                let (h, barrier) = (&h, &barrier);
                scope.spawn(move || {
                    barrier.wait();
                    h.drive_detour(vehicle, "12", t0());
                });
            }
        });

        // closures are serialized per route key: insert, create, insert, merge, insert
        let detour = h.only_detour();
        assert_eq!(detour.route_key, RouteKey::new("12", Some("0")));
        assert_eq!(detour.evidence_count, 4);
        assert_evidence_invariant(&detour);
        assert!(detour.id.ends_with("-1"), "{}", detour.id);
        assert_eq!(h.state.pending_path_count(), 1);
        assert_eq!(h.state.tracked_vehicles(), 5);
    }
}
