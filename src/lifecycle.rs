//! Turning corroborated paths into detours, and clearing detours once vehicles are back on the
//! published path.

use crate::configuration::RouteConfig;
use crate::detour::{ConfidenceLevel, Detour, DetourStatus, Evidence};
use crate::pending_paths::Promotion;
use crate::state::RouteSlot;
use crate::tracker::Observation;
use chrono::{DateTime, Utc};
use log::{info, warn};
use route_geometry::{centroid, path_length, paths_overlap, LatLng};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromotionResult {
    Created(String),
    Merged(String),
}

fn add_confirmation(detour: &mut Detour, vehicle_id: &str, now: DateTime<Utc>, config: &RouteConfig) {
    let recently_confirmed = detour.confirmed_by_vehicles.iter().any(|e| {
        e.vehicle_id == vehicle_id && now - e.timestamp <= config.pending_path_expiry
    });
    if !recently_confirmed {
        detour.confirmed_by_vehicles.push(Evidence {
            vehicle_id: vehicle_id.to_string(),
            timestamp: now,
        });
    }
}

fn set_polyline(detour: &mut Detour, polyline: &[LatLng]) -> bool {
    match centroid(polyline) {
        Some(c) => {
            detour.polyline = polyline.to_vec();
            detour.centroid = c;
            true
        }
        None => false,
    }
}

/// Merges `promotion` into an overlapping suspected detour of the slot, or creates a new one.
pub fn promote(
    slot: &mut RouteSlot,
    promotion: Promotion,
    config: &RouteConfig,
    new_id: impl FnOnce() -> String,
) -> Option<PromotionResult> {
    let now = promotion.observed_at;
    let representative = promotion.representative_path();

    let existing = slot.detours.iter_mut().find(|d| {
        d.status == DetourStatus::Suspected
            && paths_overlap(
                &d.polyline,
                &promotion.new_path,
                config.corridor_width_m,
                config.path_overlap_pct,
            )
    });

    if let Some(detour) = existing {
        let before = detour.confidence_score;
        for vehicle_id in &promotion.vehicles {
            add_confirmation(detour, vehicle_id, now, config);
        }
        detour.last_seen = detour.last_seen.max(now);
        if path_length(representative) > path_length(&detour.polyline) {
            set_polyline(detour, representative);
        }
        // fresh confirmations outweigh on-route sightings collected so far
        detour.clearing_evidence.clear();
        detour.refresh_confidence(now, &config.confidence);
        info!(
            "Detour {} on {} reconfirmed by {:?}: {} vehicles, confidence {} -> {}",
            detour.id,
            detour.route_key,
            promotion.vehicles,
            detour.evidence_count,
            before,
            detour.confidence_score
        );
        return Some(PromotionResult::Merged(detour.id.clone()));
    }

    let Some(center) = centroid(representative) else {
        warn!("Empty path promoted on {}, ignoring", promotion.route_key);
        return None;
    };

    let mut detour = Detour {
        id: new_id(),
        route_id: promotion.route_id.clone(),
        direction_id: promotion.direction_id.clone(),
        route_key: promotion.route_key.clone(),
        polyline: representative.to_vec(),
        centroid: center,
        confirmed_by_vehicles: promotion
            .vehicles
            .iter()
            .map(|vehicle_id| Evidence {
                vehicle_id: vehicle_id.clone(),
                timestamp: now,
            })
            .collect(),
        first_detected: now,
        last_seen: now,
        status: DetourStatus::Suspected,
        evidence_count: 0,
        confidence_score: 0,
        confidence_level: ConfidenceLevel::Suspected,
        official_alert: None,
        affected_stops: Vec::new(),
        segment_label: None,
        clearing_evidence: Vec::new(),
        cleared_at: None,
        cleared_by: None,
    };
    detour.refresh_confidence(now, &config.confidence);

    info!(
        "New detour {} on {} confirmed by {:?} (confidence {}, {:?})",
        detour.id,
        detour.route_key,
        promotion.vehicles,
        detour.confidence_score,
        detour.confidence_level
    );
    let id = detour.id.clone();
    slot.detours.push(detour);
    Some(PromotionResult::Created(id))
}

/// Distinct clearing vehicles a detour needs, never more than the vehicles that confirmed it.
pub fn required_clearing_vehicles(detour: &Detour, config: &RouteConfig) -> usize {
    config
        .clearing
        .for_level(detour.confidence_level)
        .min(detour.evidence_count)
        .max(1)
}

/// Records `observation` as clearing evidence for every suspected detour of the slot whose
/// centroid it is near. Returns the ids of detours that became cleared.
pub fn record_clearing(
    slot: &mut RouteSlot,
    observation: &Observation,
    config: &RouteConfig,
) -> Vec<String> {
    let now = observation.timestamp;
    let window_start = now
        .checked_sub_signed(config.clearing_window)
        .unwrap_or(DateTime::<Utc>::MIN_UTC);
    let mut cleared = Vec::new();

    for detour in slot.detours.iter_mut().filter(|d| d.is_active()) {
        if observation.position.haversine_distance(&detour.centroid) > config.clearing_radius_m() {
            continue;
        }

        detour.clearing_evidence.retain(|e| e.timestamp >= window_start);
        let already_counted = detour
            .clearing_evidence
            .iter()
            .any(|e| e.vehicle_id == observation.vehicle_id);
        if !already_counted {
            detour.clearing_evidence.push(Evidence {
                vehicle_id: observation.vehicle_id.clone(),
                timestamp: now,
            });
        }

        detour.refresh_confidence(now, &config.confidence);
        let required = required_clearing_vehicles(detour, config);
        let have = detour.distinct_clearing_vehicles(window_start);
        if have >= required {
            detour.status = DetourStatus::Cleared;
            detour.cleared_at = Some(now);
            detour.cleared_by = Some(observation.vehicle_id.clone());
            info!(
                "Detour {} on {} cleared by {} ({}/{} on-route vehicles)",
                detour.id, detour.route_key, observation.vehicle_id, have, required
            );
            cleared.push(detour.id.clone());
        }
    }
    cleared
}
