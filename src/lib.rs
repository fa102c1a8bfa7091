/*! Detour detection for bus fleets from real-time vehicle positions.

The engine watches every vehicle against the published shapes of its route. A vehicle that
leaves the route leaves a breadcrumb trail; once it rejoins, the trail becomes a candidate
path. A detour is only declared once a second, independent vehicle drives an overlapping path.
Detours then gain confidence with more vehicles, an official alert and recency, and are cleared
when enough vehicles are seen back on the normal route near the detour.

All state lives in a caller-owned [DetourState] that is passed to the functions of [engine]
and [query]. Inputs (vehicle positions, route shapes, alerts, stops) come from collaborators
and are described in [feed].
*/

pub mod configuration;
pub mod correlation;
pub mod detour;
pub mod engine;
pub mod error;
pub mod export;
pub mod feed;
pub mod lifecycle;
pub mod pending_paths;
pub mod query;
pub mod state;
pub mod stop_index;
pub mod sweep;
pub mod tracker;

#[cfg(test)]
mod tests;

pub use configuration::{DetourSettings, RouteConfig, RouteOverride, RouteSettings};
pub use detour::{ArchiveReason, ArchivedDetour, ConfidenceLevel, Detour, DetourStatus};
pub use error::ConfigError;
pub use feed::{AlertEffect, RouteShape, RouteShapes, RouteStops, ServiceAlert, Stop, VehicleUpdate};
pub use route_geometry::LatLng;
pub use state::{DetourState, RouteKey, StateSnapshot};
pub use stop_index::StopIndex;
