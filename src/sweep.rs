//! Periodic expiry and archival. Nothing here runs on its own: the caller decides the cadence.

use crate::configuration::{DetourSettings, RouteConfig};
use crate::detour::{ArchiveReason, ArchivedDetour, ConfidenceLevel, Detour, DetourStatus};
use crate::pending_paths::prune_expired;
use crate::state::DetourState;
use chrono::{DateTime, Utc};
use log::{debug, info};
use serde::Serialize;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub expired: usize,
    pub cleared: usize,
    pub expired_max_retention: usize,
    pub pending_pruned: usize,
    pub vehicles_evicted: usize,
    pub routes_dropped: usize,
}

impl SweepReport {
    pub fn archived(&self) -> usize {
        self.expired + self.cleared + self.expired_max_retention
    }

    fn count(&mut self, reason: ArchiveReason) {
        match reason {
            ArchiveReason::Expired => self.expired += 1,
            ArchiveReason::Cleared => self.cleared += 1,
            ArchiveReason::ExpiredMaxRetention => self.expired_max_retention += 1,
        }
    }
}

/// Why `detour` should leave the active set at `now`, if it should. Expects confidence to be
/// current.
pub fn archive_reason(detour: &Detour, now: DateTime<Utc>, config: &RouteConfig) -> Option<ArchiveReason> {
    if now - detour.first_detected > config.max_retention {
        return Some(ArchiveReason::ExpiredMaxRetention);
    }
    match detour.status {
        DetourStatus::Cleared => {
            let cleared_at = detour.cleared_at.unwrap_or(detour.last_seen);
            (now - cleared_at >= config.cleared_retention).then_some(ArchiveReason::Cleared)
        }
        DetourStatus::Suspected => {
            // likely and high-confidence detours only leave by clearing or the absolute cap
            let expirable = detour.confidence_level == ConfidenceLevel::Suspected;
            (expirable && now - detour.last_seen > config.suspected_expiry)
                .then_some(ArchiveReason::Expired)
        }
    }
}

pub fn sweep(state: &DetourState, settings: &DetourSettings, now: DateTime<Utc>) -> SweepReport {
    let mut report = SweepReport::default();
    let mut archived = Vec::new();
    let mut empty_keys = Vec::new();

    let slots = state.all_slots();
    for (key, slot) in &slots {
        let mut slot = slot.lock();
        let config = settings.for_route(&slot.route_id);

        report.pending_pruned += prune_expired(&mut slot.pending, now, config.pending_path_expiry);

        let mut kept = Vec::with_capacity(slot.detours.len());
        for mut detour in slot.detours.drain(..) {
            detour.refresh_confidence(now, &config.confidence);
            match archive_reason(&detour, now, &config) {
                Some(reason) => {
                    info!(
                        "Archiving detour {} on {} ({:?}, {} vehicles, confidence {})",
                        detour.id, key, reason, detour.evidence_count, detour.confidence_score
                    );
                    report.count(reason);
                    archived.push(ArchivedDetour {
                        detour,
                        archived_at: now,
                        archive_reason: reason,
                    });
                }
                None => kept.push(detour),
            }
        }
        slot.detours = kept;

        if slot.is_empty() {
            empty_keys.push(key.clone());
        }
    }
    drop(slots);

    state.archive(archived, settings.history_cap);

    for key in &empty_keys {
        if state.drop_slot_if_empty(key) {
            report.routes_dropped += 1;
        }
    }

    {
        let mut vehicles = state.vehicles();
        let before = vehicles.len();
        vehicles.retain(|_, record| {
            let expiry = settings.for_route(&record.route_id).pending_path_expiry;
            now - record.last_update <= expiry
        });
        report.vehicles_evicted = before - vehicles.len();
    }

    debug!("Sweep at {now}: {report:?}");
    report
}
