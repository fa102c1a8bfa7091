use crate::detour::Detour;
use geo_types::LineString;
use geojson::{Feature, FeatureCollection, Geometry};
use route_geometry::to_line_string;
use serde_json::{Map, Value as JsonValue};

fn detour_properties(detour: &Detour) -> Map<String, JsonValue> {
    let mut properties = Map::new();
    properties.insert("id".to_string(), JsonValue::from(detour.id.clone()));
    properties.insert("routeId".to_string(), JsonValue::from(detour.route_id.clone()));
    properties.insert(
        "directionId".to_string(),
        JsonValue::from(detour.direction_id.clone()),
    );
    properties.insert(
        "status".to_string(),
        serde_json::to_value(detour.status).unwrap_or(JsonValue::Null),
    );
    properties.insert(
        "confidenceLevel".to_string(),
        serde_json::to_value(detour.confidence_level).unwrap_or(JsonValue::Null),
    );
    properties.insert(
        "confidenceScore".to_string(),
        JsonValue::from(detour.confidence_score),
    );
    properties.insert(
        "evidenceCount".to_string(),
        JsonValue::from(detour.evidence_count),
    );
    properties.insert(
        "segmentLabel".to_string(),
        JsonValue::from(detour.segment_label.clone()),
    );
    properties.insert(
        "lastSeen".to_string(),
        JsonValue::from(detour.last_seen.to_rfc3339()),
    );
    properties
}

/// A LineString feature in GeoJSON (longitude, latitude) order.
pub fn detour_feature(detour: &Detour) -> Feature {
    let line: LineString<f64> = to_line_string(&detour.polyline);
    Feature {
        bbox: None,
        geometry: Some(Geometry::new(geojson::Value::from(&line))),
        id: Some(geojson::feature::Id::String(detour.id.clone())),
        properties: Some(detour_properties(detour)),
        foreign_members: None,
    }
}

pub fn detours_to_geojson(detours: &[Detour]) -> FeatureCollection {
    FeatureCollection {
        bbox: None,
        features: detours.iter().map(detour_feature).collect(),
        foreign_members: None,
    }
}
