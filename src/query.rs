use crate::detour::{ArchivedDetour, Detour};
use crate::state::DetourState;
use std::cmp::Ordering;

fn by_confidence_then_recency(a: &Detour, b: &Detour) -> Ordering {
    b.confidence_score
        .cmp(&a.confidence_score)
        .then(b.last_seen.cmp(&a.last_seen))
        .then_with(|| a.id.cmp(&b.id))
}

fn collect_active(state: &DetourState, mut keep: impl FnMut(&Detour) -> bool) -> Vec<Detour> {
    let mut detours: Vec<Detour> = state
        .all_slots()
        .iter()
        .flat_map(|(_, slot)| {
            slot.lock()
                .detours
                .iter()
                .filter(|d| d.is_active() && keep(d))
                .cloned()
                .collect::<Vec<_>>()
        })
        .collect();
    detours.sort_by(by_confidence_then_recency);
    detours
}

/// Detours that are still in effect (not cleared), strongest first.
pub fn active_detours(state: &DetourState) -> Vec<Detour> {
    collect_active(state, |_| true)
}

pub fn active_detours_for_route(
    state: &DetourState,
    route_id: &str,
    direction_id: Option<&str>,
) -> Vec<Detour> {
    collect_active(state, |d| {
        d.route_id == route_id
            && direction_id.map_or(true, |dir| d.direction_id.as_deref() == Some(dir))
    })
}

pub fn has_active_detour(state: &DetourState, route_id: &str) -> bool {
    state.all_slots().iter().any(|(_, slot)| {
        let slot = slot.lock();
        slot.route_id == route_id && slot.detours.iter().any(Detour::is_active)
    })
}

/// Any detour still held in memory, cleared ones included.
pub fn find_detour(state: &DetourState, detour_id: &str) -> Option<Detour> {
    state.all_slots().iter().find_map(|(_, slot)| {
        slot.lock()
            .detours
            .iter()
            .find(|d| d.id == detour_id)
            .cloned()
    })
}

/// Archived detours, most recent first.
pub fn detour_history(state: &DetourState, route_id: Option<&str>, limit: usize) -> Vec<ArchivedDetour> {
    state
        .history()
        .iter()
        .filter(|a| route_id.map_or(true, |r| a.detour.route_id == r))
        .take(limit)
        .cloned()
        .collect()
}
