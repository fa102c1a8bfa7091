//! Process-wide engine state. Owned by the caller and passed into every engine call.
//!
//! Locking: the vehicle map has one mutex; each route key owns its own mutex guarding the
//! pending paths and detours of that key, so two vehicles closing paths on the same route
//! are serialized while different routes proceed independently. A route slot lock is never
//! held while taking the route map lock or the history lock.

use crate::detour::{ArchivedDetour, Detour};
use crate::pending_paths::PendingPath;
use crate::tracker::VehicleTrackingRecord;
use parking_lot::{Mutex, MutexGuard, RwLock};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Route and direction, e.g. `12_0`. Vehicles without a direction share the `12_-` key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RouteKey(String);

impl RouteKey {
    pub fn new(route_id: &str, direction_id: Option<&str>) -> Self {
        RouteKey(format!("{}_{}", route_id, direction_id.unwrap_or("-")))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RouteKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Everything the matcher and lifecycle manager mutate for one route key.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RouteSlot {
    pub route_id: String,
    pub pending: Vec<PendingPath>,
    /// Active detours in creation order.
    pub detours: Vec<Detour>,
}

impl RouteSlot {
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty() && self.detours.is_empty()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub vehicles: FxHashMap<String, VehicleTrackingRecord>,
    pub routes: FxHashMap<RouteKey, RouteSlot>,
    /// Most recent first.
    pub history: Vec<ArchivedDetour>,
    pub next_id: u64,
}

/// Memory is bounded only if the caller runs [crate::engine::tick] regularly: without the
/// sweep, vehicle records, pending paths and detours accumulate forever.
#[derive(Debug, Default)]
pub struct DetourState {
    vehicles: Mutex<FxHashMap<String, VehicleTrackingRecord>>,
    routes: RwLock<FxHashMap<RouteKey, Arc<Mutex<RouteSlot>>>>,
    history: Mutex<VecDeque<ArchivedDetour>>,
    next_id: AtomicU64,
}

impl DetourState {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn vehicles(&self) -> MutexGuard<'_, FxHashMap<String, VehicleTrackingRecord>> {
        self.vehicles.lock()
    }

    pub(crate) fn slot(&self, key: &RouteKey) -> Option<Arc<Mutex<RouteSlot>>> {
        self.routes.read().get(key).cloned()
    }

    pub(crate) fn slot_or_insert(&self, key: &RouteKey, route_id: &str) -> Arc<Mutex<RouteSlot>> {
        if let Some(slot) = self.slot(key) {
            return slot;
        }
        self.routes
            .write()
            .entry(key.clone())
            .or_insert_with(|| {
                Arc::new(Mutex::new(RouteSlot {
                    route_id: route_id.to_string(),
                    ..Default::default()
                }))
            })
            .clone()
    }

    pub(crate) fn all_slots(&self) -> Vec<(RouteKey, Arc<Mutex<RouteSlot>>)> {
        let mut slots: Vec<_> = self
            .routes
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        slots.sort_by(|a, b| a.0.cmp(&b.0));
        slots
    }

    /// Removes the slot of `key` if it holds nothing.
    pub(crate) fn drop_slot_if_empty(&self, key: &RouteKey) -> bool {
        let mut routes = self.routes.write();
        // a slot someone else still holds a handle to may be about to receive a path
        let empty = routes
            .get(key)
            .map_or(false, |slot| Arc::strong_count(slot) == 1 && slot.lock().is_empty());
        if empty {
            routes.remove(key);
        }
        empty
    }

    pub(crate) fn next_detour_id(&self, key: &RouteKey) -> String {
        let n = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        format!("detour-{key}-{n}")
    }

    /// Pushes archived detours to the front of the history, dropping the oldest past `cap`.
    pub(crate) fn archive(&self, archived: Vec<ArchivedDetour>, cap: usize) {
        if archived.is_empty() {
            return;
        }
        let mut history = self.history.lock();
        for entry in archived {
            history.push_front(entry);
        }
        history.truncate(cap);
    }

    pub(crate) fn history(&self) -> MutexGuard<'_, VecDeque<ArchivedDetour>> {
        self.history.lock()
    }

    pub fn tracked_vehicles(&self) -> usize {
        self.vehicles.lock().len()
    }

    pub fn pending_path_count(&self) -> usize {
        self.all_slots()
            .iter()
            .map(|(_, slot)| slot.lock().pending.len())
            .sum()
    }

    pub fn snapshot(&self) -> StateSnapshot {
        let vehicles = self.vehicles.lock().clone();
        let routes = self
            .all_slots()
            .into_iter()
            .map(|(key, slot)| (key, slot.lock().clone()))
            .collect();
        let history = self.history.lock().iter().cloned().collect();
        StateSnapshot {
            vehicles,
            routes,
            history,
            next_id: self.next_id.load(Ordering::Relaxed),
        }
    }

    pub fn restore(snapshot: StateSnapshot) -> Self {
        DetourState {
            vehicles: Mutex::new(snapshot.vehicles),
            routes: RwLock::new(
                snapshot
                    .routes
                    .into_iter()
                    .map(|(key, slot)| (key, Arc::new(Mutex::new(slot))))
                    .collect(),
            ),
            history: Mutex::new(snapshot.history.into()),
            next_id: AtomicU64::new(snapshot.next_id),
        }
    }
}
