/*! Geometry helpers for comparing vehicle trails against published route shapes.

Everything in here works on WGS84 latitude/longitude pairs and returns distances in metres.
Distances between nearby points are computed on a local equirectangular projection, which is
accurate to well under a metre at the scales a bus detour covers (a few kilometres at most).
Longer distances go through the haversine formula.
*/

mod point;
mod polyline;


pub use point::{LatLng, EARTH_RADIUS_M};
pub use polyline::{
    centroid, densify, distance_to_polyline, overlap_ratio, path_length, paths_overlap,
    point_segment_distance, simplify, to_line_string, PolylineMatch,
};
