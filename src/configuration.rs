use crate::detour::ConfidenceLevel;
use crate::error::ConfigError;
use chrono::Duration;
use lazy_static::lazy_static;
use regex::Regex;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Trails shorter than this are GPS noise whatever the settings say.
pub const MIN_PATH_LENGTH_FLOOR_M: f64 = 150.0;
/// Breadcrumbs closer together than this are jitter whatever the settings say.
pub const BREADCRUMB_SPACING_FLOOR_M: f64 = 10.0;
/// Upper bound for every duration setting (one year).
pub const MAX_DURATION_SECS: i64 = 366 * 24 * 3600;

lazy_static! {
    // "2A", "2B", "2X" all share the overrides of route "2"
    static ref BASE_ROUTE: Regex = Regex::new(r"^(\d+)").unwrap();
}

/// Tunables that can differ per route. Durations are in seconds on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouteSettings {
    pub off_route_threshold_m: f64,
    pub corridor_width_m: f64,
    pub path_overlap_pct: f64,
    pub min_off_route_points: usize,
    pub min_off_route_secs: i64,
    pub suspected_expiry_secs: i64,
    pub pending_path_expiry_secs: i64,
    pub stop_match_radius_m: f64,
    pub max_affected_stops: usize,
    pub likely_threshold: u8,
    pub high_threshold: u8,
    pub clearing_suspected: usize,
    pub clearing_likely: usize,
    pub clearing_high_confidence: usize,
    pub clearing_window_secs: i64,
    pub cleared_retention_secs: i64,
    pub max_retention_secs: i64,
}

impl Default for RouteSettings {
    fn default() -> Self {
        Self {
            off_route_threshold_m: 60.0,
            corridor_width_m: 50.0,
            path_overlap_pct: 60.0,
            min_off_route_points: 3,
            min_off_route_secs: 60,
            suspected_expiry_secs: 30 * 60,
            pending_path_expiry_secs: 30 * 60,
            stop_match_radius_m: 100.0,
            max_affected_stops: 8,
            likely_threshold: 70,
            high_threshold: 85,
            clearing_suspected: 2,
            clearing_likely: 3,
            clearing_high_confidence: 4,
            clearing_window_secs: 30 * 60,
            cleared_retention_secs: 5 * 60,
            max_retention_secs: 24 * 3600,
        }
    }
}

/// Partial [RouteSettings]; any field left out keeps the global default.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouteOverride {
    pub off_route_threshold_m: Option<f64>,
    pub corridor_width_m: Option<f64>,
    pub path_overlap_pct: Option<f64>,
    pub min_off_route_points: Option<usize>,
    pub min_off_route_secs: Option<i64>,
    pub suspected_expiry_secs: Option<i64>,
    pub pending_path_expiry_secs: Option<i64>,
    pub stop_match_radius_m: Option<f64>,
    pub max_affected_stops: Option<usize>,
    pub likely_threshold: Option<u8>,
    pub high_threshold: Option<u8>,
    pub clearing_suspected: Option<usize>,
    pub clearing_likely: Option<usize>,
    pub clearing_high_confidence: Option<usize>,
    pub clearing_window_secs: Option<i64>,
    pub cleared_retention_secs: Option<i64>,
    pub max_retention_secs: Option<i64>,
}

macro_rules! apply_overrides {
    ($target:expr, $over:expr, $($field:ident),+ $(,)?) => {
        $(
            if let Some(value) = $over.$field {
                $target.$field = value;
            }
        )+
    };
}

impl RouteOverride {
    pub fn apply(&self, settings: &mut RouteSettings) {
        apply_overrides!(
            settings,
            self,
            off_route_threshold_m,
            corridor_width_m,
            path_overlap_pct,
            min_off_route_points,
            min_off_route_secs,
            suspected_expiry_secs,
            pending_path_expiry_secs,
            stop_match_radius_m,
            max_affected_stops,
            likely_threshold,
            high_threshold,
            clearing_suspected,
            clearing_likely,
            clearing_high_confidence,
            clearing_window_secs,
            cleared_retention_secs,
            max_retention_secs,
        );
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfidenceThresholds {
    pub likely: u8,
    pub high: u8,
}

/// Distinct on-route vehicles needed to clear a detour, by confidence tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClearingThresholds {
    pub suspected: usize,
    pub likely: usize,
    pub high_confidence: usize,
}

impl ClearingThresholds {
    pub fn for_level(&self, level: ConfidenceLevel) -> usize {
        match level {
            ConfidenceLevel::Suspected => self.suspected,
            ConfidenceLevel::Likely => self.likely,
            ConfidenceLevel::HighConfidence => self.high_confidence,
        }
    }
}

/// Fully resolved configuration for one route. Built by [DetourSettings::for_route].
#[derive(Debug, Clone, PartialEq)]
pub struct RouteConfig {
    pub off_route_threshold_m: f64,
    pub corridor_width_m: f64,
    pub path_overlap_pct: f64,
    pub min_off_route_points: usize,
    pub min_off_route_duration: Duration,
    pub suspected_expiry: Duration,
    pub pending_path_expiry: Duration,
    pub stop_match_radius_m: f64,
    pub max_affected_stops: usize,
    pub confidence: ConfidenceThresholds,
    pub clearing: ClearingThresholds,
    pub clearing_window: Duration,
    pub cleared_retention: Duration,
    pub max_retention: Duration,
    pub breadcrumb_spacing_m: f64,
    pub min_path_length_m: f64,
    pub simplify_tolerance_m: f64,
}

impl RouteConfig {
    /// On-route vehicles within this distance of a detour centroid count as clearing evidence.
    pub fn clearing_radius_m(&self) -> f64 {
        self.corridor_width_m * 3.0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetourSettings {
    pub defaults: RouteSettings,
    pub routes: FxHashMap<String, RouteOverride>,
    pub history_cap: usize,
    pub breadcrumb_spacing_m: f64,
    pub min_path_length_m: f64,
    pub simplify_tolerance_m: f64,
}

impl Default for DetourSettings {
    fn default() -> Self {
        Self {
            defaults: RouteSettings::default(),
            routes: FxHashMap::default(),
            history_cap: 100,
            breadcrumb_spacing_m: 10.0,
            min_path_length_m: 150.0,
            simplify_tolerance_m: 10.0,
        }
    }
}

fn normalize_route_id(route_id: &str) -> String {
    route_id.trim().to_ascii_uppercase()
}

fn secs(s: i64) -> Duration {
    Duration::seconds(s.clamp(0, MAX_DURATION_SECS))
}

impl DetourSettings {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json_str(&text)
    }

    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        let mut settings: DetourSettings = serde_json::from_str(text)?;
        settings.routes = settings
            .routes
            .into_iter()
            .map(|(route_id, over)| (normalize_route_id(&route_id), over))
            .collect();
        settings.validate()?;
        Ok(settings)
    }

    pub fn with_route_override(mut self, route_id: &str, over: RouteOverride) -> Self {
        self.routes.insert(normalize_route_id(route_id), over);
        self
    }

    fn override_for(&self, route_id: &str) -> Option<&RouteOverride> {
        let normalized = normalize_route_id(route_id);
        if let Some(over) = self.routes.get(&normalized) {
            return Some(over);
        }
        let base = BASE_ROUTE.captures(&normalized)?.get(1)?.as_str();
        if base == normalized {
            return None;
        }
        self.routes.get(base)
    }

    /// Global defaults merged with the route's override, or its base route's override.
    pub fn for_route(&self, route_id: &str) -> RouteConfig {
        let mut s = self.defaults.clone();
        if let Some(over) = self.override_for(route_id) {
            over.apply(&mut s);
        }
        RouteConfig {
            off_route_threshold_m: s.off_route_threshold_m,
            corridor_width_m: s.corridor_width_m,
            path_overlap_pct: s.path_overlap_pct,
            min_off_route_points: s.min_off_route_points,
            min_off_route_duration: secs(s.min_off_route_secs),
            suspected_expiry: secs(s.suspected_expiry_secs),
            pending_path_expiry: secs(s.pending_path_expiry_secs),
            stop_match_radius_m: s.stop_match_radius_m,
            max_affected_stops: s.max_affected_stops,
            confidence: ConfidenceThresholds {
                likely: s.likely_threshold,
                high: s.high_threshold,
            },
            clearing: ClearingThresholds {
                suspected: s.clearing_suspected,
                likely: s.clearing_likely,
                high_confidence: s.clearing_high_confidence,
            },
            clearing_window: secs(s.clearing_window_secs),
            cleared_retention: secs(s.cleared_retention_secs),
            max_retention: secs(s.max_retention_secs),
            breadcrumb_spacing_m: self.breadcrumb_spacing_m.max(BREADCRUMB_SPACING_FLOOR_M),
            min_path_length_m: self.min_path_length_m.max(MIN_PATH_LENGTH_FLOOR_M),
            simplify_tolerance_m: self.simplify_tolerance_m,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.history_cap == 0 {
            return Err(invalid("global", "history_cap", "must be at least 1"));
        }
        for (field, value, floor) in [
            ("breadcrumb_spacing_m", self.breadcrumb_spacing_m, BREADCRUMB_SPACING_FLOOR_M),
            ("min_path_length_m", self.min_path_length_m, MIN_PATH_LENGTH_FLOOR_M),
            ("simplify_tolerance_m", self.simplify_tolerance_m, 0.0),
        ] {
            if !value.is_finite() || value < floor {
                return Err(invalid(
                    "global",
                    field,
                    &format!("must be a number of at least {floor}"),
                ));
            }
        }

        validate_route("defaults", &self.defaults)?;
        for (route_id, over) in &self.routes {
            let mut s = self.defaults.clone();
            over.apply(&mut s);
            validate_route(&format!("route {route_id}"), &s)?;
        }
        Ok(())
    }
}

fn invalid(scope: &str, field: &'static str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        scope: scope.to_string(),
        field,
        reason: reason.to_string(),
    }
}

fn validate_route(scope: &str, s: &RouteSettings) -> Result<(), ConfigError> {
    for (field, value) in [
        ("off_route_threshold_m", s.off_route_threshold_m),
        ("corridor_width_m", s.corridor_width_m),
        ("stop_match_radius_m", s.stop_match_radius_m),
    ] {
        if !value.is_finite() || value <= 0.0 {
            return Err(invalid(scope, field, "must be a positive number"));
        }
    }
    if !(s.path_overlap_pct > 0.0 && s.path_overlap_pct <= 100.0) {
        return Err(invalid(scope, "path_overlap_pct", "must be in (0, 100]"));
    }
    if s.high_threshold > 100 || s.likely_threshold > s.high_threshold {
        return Err(invalid(
            scope,
            "likely_threshold",
            "thresholds must satisfy likely <= high <= 100",
        ));
    }
    for (field, value) in [
        ("clearing_suspected", s.clearing_suspected),
        ("clearing_likely", s.clearing_likely),
        ("clearing_high_confidence", s.clearing_high_confidence),
    ] {
        if value == 0 {
            return Err(invalid(scope, field, "must be at least 1"));
        }
    }
    for (field, value) in [
        ("min_off_route_secs", s.min_off_route_secs),
        ("suspected_expiry_secs", s.suspected_expiry_secs),
        ("pending_path_expiry_secs", s.pending_path_expiry_secs),
        ("clearing_window_secs", s.clearing_window_secs),
        ("cleared_retention_secs", s.cleared_retention_secs),
        ("max_retention_secs", s.max_retention_secs),
    ] {
        if !(0..=MAX_DURATION_SECS).contains(&value) {
            return Err(invalid(
                scope,
                field,
                &format!("must be between 0 and {MAX_DURATION_SECS} seconds"),
            ));
        }
    }
    Ok(())
}
