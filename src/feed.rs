//! Inputs handed to the engine by the collaborators that own the live feeds and static data.

use chrono::{DateTime, Utc};
use route_geometry::LatLng;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

/// One entry of a vehicle-positions poll. Every field is optional on the wire; updates
/// missing an id, a usable coordinate or a route are dropped by the engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VehicleUpdate {
    pub id: Option<String>,
    pub coordinate: Option<LatLng>,
    pub route_id: Option<String>,
    pub direction_id: Option<String>,
    pub trip_id: Option<String>,
    pub bearing: Option<f32>,
    /// Position fix time. Falls back to the batch time when absent.
    pub timestamp: Option<DateTime<Utc>>,
}

/// An update that carries everything tracking needs.
#[derive(Debug, Clone)]
pub(crate) struct ValidUpdate<'a> {
    pub vehicle_id: &'a str,
    pub position: LatLng,
    pub route_id: &'a str,
    pub direction_id: Option<&'a str>,
    pub trip_id: Option<&'a str>,
    pub timestamp: DateTime<Utc>,
}

impl VehicleUpdate {
    pub(crate) fn validate(&self, batch_time: DateTime<Utc>) -> Option<ValidUpdate<'_>> {
        let vehicle_id = self.id.as_deref().filter(|id| !id.trim().is_empty())?;
        let route_id = self.route_id.as_deref().filter(|id| !id.trim().is_empty())?;
        // (0, 0) is what broken AVL units report when they have no fix
        let position = self
            .coordinate
            .filter(|p| p.is_valid() && !(p.latitude == 0.0 && p.longitude == 0.0))?;
        Some(ValidUpdate {
            vehicle_id,
            position,
            route_id,
            direction_id: self.direction_id.as_deref(),
            trip_id: self.trip_id.as_deref(),
            timestamp: self.timestamp.unwrap_or(batch_time),
        })
    }
}

/// One published shape variant of a route.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteShape {
    pub shape_id: String,
    pub points: Vec<LatLng>,
}

/// Route id -> candidate shape variants.
pub type RouteShapes = FxHashMap<String, Vec<RouteShape>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AlertEffect {
    #[serde(rename = "Detour", alias = "DETOUR")]
    Detour,
    #[serde(rename = "Modified Service", alias = "MODIFIED_SERVICE")]
    ModifiedService,
    #[serde(rename = "No Service", alias = "NO_SERVICE")]
    NoService,
    #[serde(rename = "Reduced Service", alias = "REDUCED_SERVICE")]
    ReducedService,
    #[serde(other)]
    Other,
}

impl AlertEffect {
    /// Effects that plausibly explain a vehicle leaving its published path.
    pub fn indicates_detour(&self) -> bool {
        !matches!(self, AlertEffect::Other)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceAlert {
    pub id: String,
    #[serde(default)]
    pub title: String,
    pub effect: AlertEffect,
    #[serde(default)]
    pub severity: Option<String>,
    #[serde(default)]
    pub affected_routes: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stop {
    pub id: String,
    pub name: String,
    #[serde(flatten)]
    pub position: LatLng,
}

/// Route id -> ids of the stops it serves.
pub type RouteStops = FxHashMap<String, Vec<String>>;
