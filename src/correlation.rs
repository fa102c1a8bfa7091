//! Read-side enrichment of detours with data owned by other collaborators: official service
//! alerts and the stops a detour bypasses.

use crate::configuration::RouteConfig;
use crate::detour::{AffectedStop, Detour, OfficialAlertMatch};
use crate::feed::{RouteStops, ServiceAlert};
use crate::stop_index::StopIndex;
use chrono::{DateTime, Utc};
use log::info;
use route_geometry::distance_to_polyline;
use rustc_hash::FxHashSet;

fn same_route(a: &str, b: &str) -> bool {
    a.trim().eq_ignore_ascii_case(b.trim())
}

/// First alert naming the detour's route with a detour-like effect.
pub fn find_alert<'a>(detour: &Detour, alerts: &'a [ServiceAlert]) -> Option<&'a ServiceAlert> {
    alerts.iter().find(|alert| {
        alert.effect.indicates_detour()
            && alert
                .affected_routes
                .iter()
                .any(|route_id| same_route(route_id, &detour.route_id))
    })
}

/// Attaches (or detaches) the matching official alert and recomputes confidence.
/// Cleared detours are left alone. Returns whether the attachment changed.
pub fn correlate_alerts(
    detour: &mut Detour,
    alerts: &[ServiceAlert],
    now: DateTime<Utc>,
    config: &RouteConfig,
) -> bool {
    if !detour.is_active() {
        return false;
    }

    let previous = detour.official_alert.as_ref().map(|a| a.id.clone());
    detour.official_alert = find_alert(detour, alerts).map(|alert| {
        let matched_at = detour
            .official_alert
            .as_ref()
            .filter(|a| a.id == alert.id)
            .map_or(now, |a| a.matched_at);
        OfficialAlertMatch {
            matched: true,
            id: alert.id.clone(),
            title: alert.title.clone(),
            effect: alert.effect,
            severity: alert.severity.clone(),
            matched_at,
        }
    });
    detour.refresh_confidence(now, &config.confidence);

    let current = detour.official_alert.as_ref().map(|a| a.id.clone());
    if previous != current {
        info!(
            "Detour {} official alert {:?} -> {:?}, confidence {}",
            detour.id, previous, current, detour.confidence_score
        );
        return true;
    }
    false
}

/// Rider-facing name of the stretch a detour bypasses.
pub fn segment_label(stops: &[AffectedStop]) -> Option<String> {
    match stops {
        [] => None,
        [only] => Some(format!("Near {}", only.name)),
        [first, .., last] if first.name == last.name => Some(format!("Near {}", first.name)),
        [first, .., last] => Some(format!("{} to {}", first.name, last.name)),
    }
}

/// Stops of the detour's route within the match radius of its polyline, in path order.
pub fn affected_stops(
    detour: &Detour,
    index: &StopIndex,
    route_stops: &RouteStops,
    config: &RouteConfig,
) -> Vec<AffectedStop> {
    let Some(serving) = route_stops.get(&detour.route_id) else {
        return Vec::new();
    };
    let serving: FxHashSet<&str> = serving.iter().map(String::as_str).collect();

    let mut stops: Vec<AffectedStop> = index
        .near_path(&detour.polyline, config.stop_match_radius_m)
        .filter(|stop| serving.contains(stop.id.as_str()))
        .filter_map(|stop| {
            let m = distance_to_polyline(&stop.position, &detour.polyline)?;
            (m.distance_m <= config.stop_match_radius_m).then(|| AffectedStop {
                stop_id: stop.id.clone(),
                name: stop.name.clone(),
                position: stop.position,
                distance_m: m.distance_m,
                path_index: m.segment_index,
            })
        })
        .collect();

    stops.sort_by(|a, b| {
        a.path_index
            .cmp(&b.path_index)
            .then(a.distance_m.total_cmp(&b.distance_m))
    });
    stops.truncate(config.max_affected_stops);
    stops
}

pub fn enrich_detour(
    detour: &mut Detour,
    index: &StopIndex,
    route_stops: &RouteStops,
    config: &RouteConfig,
) {
    let stops = affected_stops(detour, index, route_stops, config);
    detour.segment_label = segment_label(&stops);
    detour.affected_stops = stops;
}
