//! Entry points driven by the caller's polling loop.
//!
//! A typical deployment calls [process_batch] for every vehicle-positions poll, [tick] on a
//! slower cadence and [correlate] / [enrich] whenever fresh alerts or static data arrive.

use crate::configuration::{DetourSettings, RouteConfig};
use crate::correlation;
use crate::feed::{RouteShapes, RouteStops, ServiceAlert, VehicleUpdate};
use crate::lifecycle::{self, PromotionResult};
use crate::pending_paths::{match_path, MatchOutcome};
use crate::state::{DetourState, RouteKey};
use crate::stop_index::StopIndex;
use crate::sweep::{self, SweepReport};
use crate::tracker::{self, Observation, TrackEvent};
use chrono::{DateTime, Utc};
use log::{debug, info};
use rustc_hash::FxHashMap;
use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub updates: usize,
    /// Missing id, coordinate or route.
    pub ignored: usize,
    /// No shapes loaded for the route, or out of order.
    pub untracked: usize,
    pub off_route: usize,
    pub completed_paths: usize,
    pub pending_inserted: usize,
    pub detours_created: usize,
    pub detours_merged: usize,
    pub detours_cleared: usize,
}

/// Resolves each route's configuration at most once per call.
struct ConfigCache<'a> {
    settings: &'a DetourSettings,
    resolved: FxHashMap<String, RouteConfig>,
}

impl<'a> ConfigCache<'a> {
    fn new(settings: &'a DetourSettings) -> Self {
        ConfigCache {
            settings,
            resolved: FxHashMap::default(),
        }
    }

    fn get(&mut self, route_id: &str) -> &RouteConfig {
        let settings = self.settings;
        self.resolved
            .entry(route_id.to_string())
            .or_insert_with(|| settings.for_route(route_id))
    }
}

/// Runs one poll worth of vehicle updates through tracking, matching and clearing.
///
/// Tracking happens under the vehicle map lock; everything that touches pending paths or
/// detours happens under the lock of the route key involved, one key at a time.
pub fn process_batch(
    state: &DetourState,
    settings: &DetourSettings,
    shapes: &RouteShapes,
    updates: &[VehicleUpdate],
    now: DateTime<Utc>,
) -> BatchReport {
    let mut report = BatchReport {
        updates: updates.len(),
        ..Default::default()
    };
    let mut configs = ConfigCache::new(settings);

    let mut by_route: BTreeMap<RouteKey, Vec<Observation>> = BTreeMap::new();
    {
        let mut vehicles = state.vehicles();
        for update in updates {
            let Some(valid) = update.validate(now) else {
                debug!("Ignoring incomplete vehicle update {:?}", update.id);
                report.ignored += 1;
                continue;
            };
            let route_shapes = shapes
                .get(valid.route_id)
                .map(Vec::as_slice)
                .unwrap_or_default();
            let config = configs.get(valid.route_id);

            match tracker::observe(&mut vehicles, &valid, route_shapes, config) {
                Some(observation) => {
                    if matches!(
                        observation.event,
                        TrackEvent::WentOffRoute | TrackEvent::StillOffRoute { .. }
                    ) {
                        report.off_route += 1;
                    }
                    by_route
                        .entry(observation.route_key.clone())
                        .or_default()
                        .push(observation);
                }
                None => report.untracked += 1,
            }
        }
    }

    for (key, observations) in by_route {
        let completes_path = observations
            .iter()
            .any(|o| matches!(o.event, TrackEvent::Returned { completed: Some(_) }));
        let slot = if completes_path {
            state.slot_or_insert(&key, &observations[0].route_id)
        } else {
            match state.slot(&key) {
                Some(slot) => slot,
                // nothing to match and nothing to clear
                None => continue,
            }
        };

        let mut slot = slot.lock();
        for observation in observations {
            let config = configs.get(&observation.route_id);
            if observation.is_plain_on_route() {
                report.detours_cleared +=
                    lifecycle::record_clearing(&mut slot, &observation, config).len();
                continue;
            }
            let TrackEvent::Returned {
                completed: Some(completed),
            } = observation.event
            else {
                continue;
            };

            report.completed_paths += 1;
            debug!(
                "Vehicle {} completed a {}s off-route path on {} ({} breadcrumbs, {} points kept)",
                completed.vehicle_id,
                completed.duration().num_seconds(),
                key,
                completed.breadcrumb_count,
                completed.path.len()
            );
            match match_path(&mut slot.pending, completed, config) {
                MatchOutcome::Inserted => report.pending_inserted += 1,
                MatchOutcome::Refreshed => {}
                MatchOutcome::Promote(promotion) => {
                    match lifecycle::promote(&mut slot, promotion, config, || {
                        state.next_detour_id(&key)
                    }) {
                        Some(PromotionResult::Created(_)) => report.detours_created += 1,
                        Some(PromotionResult::Merged(_)) => report.detours_merged += 1,
                        None => {}
                    }
                }
            }
        }
    }

    if report.detours_created + report.detours_merged + report.detours_cleared > 0 {
        info!(
            "Batch at {now}: {} created, {} merged, {} cleared from {} updates",
            report.detours_created, report.detours_merged, report.detours_cleared, report.updates
        );
    }
    report
}

/// Expiry and archival sweep. Must be called periodically to keep memory bounded.
pub fn tick(state: &DetourState, settings: &DetourSettings, now: DateTime<Utc>) -> SweepReport {
    let report = sweep::sweep(state, settings, now);
    if report.archived() > 0 || report.vehicles_evicted > 0 {
        info!(
            "Sweep at {now}: archived {} (expired {}, cleared {}, max retention {}), evicted {} vehicles",
            report.archived(),
            report.expired,
            report.cleared,
            report.expired_max_retention,
            report.vehicles_evicted
        );
    }
    report
}

/// Attaches matching official alerts to every suspected detour. Returns how many detours
/// changed attachment.
pub fn correlate(
    state: &DetourState,
    settings: &DetourSettings,
    alerts: &[ServiceAlert],
    now: DateTime<Utc>,
) -> usize {
    let mut configs = ConfigCache::new(settings);
    let mut changed = 0;
    for (_, slot) in state.all_slots() {
        let mut slot = slot.lock();
        let config = configs.get(&slot.route_id).clone();
        for detour in slot.detours.iter_mut() {
            if correlation::correlate_alerts(detour, alerts, now, &config) {
                changed += 1;
            }
        }
    }
    changed
}

/// Recomputes affected stops and segment labels of every active detour.
pub fn enrich(
    state: &DetourState,
    settings: &DetourSettings,
    stops: &StopIndex,
    route_stops: &RouteStops,
) {
    let mut configs = ConfigCache::new(settings);
    for (_, slot) in state.all_slots() {
        let mut slot = slot.lock();
        let config = configs.get(&slot.route_id).clone();
        for detour in slot.detours.iter_mut() {
            correlation::enrich_detour(detour, stops, route_stops, &config);
        }
    }
}
