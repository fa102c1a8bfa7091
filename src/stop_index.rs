use crate::feed::Stop;
use route_geometry::LatLng;
use rstar::primitives::GeomWithData;
use rstar::{RTree, AABB};

const METRES_PER_DEGREE: f64 = 111_320.0;

/// Spatial index over the static stop list, in (longitude, latitude) degrees.
#[derive(Debug)]
pub struct StopIndex {
    stops: Vec<Stop>,
    tree: RTree<GeomWithData<[f64; 2], usize>>,
}

impl StopIndex {
    pub fn new(stops: Vec<Stop>) -> Self {
        let stops: Vec<Stop> = stops.into_iter().filter(|s| s.position.is_valid()).collect();
        let points = stops
            .iter()
            .enumerate()
            .map(|(i, s)| GeomWithData::new([s.position.longitude, s.position.latitude], i))
            .collect();
        StopIndex {
            stops,
            tree: RTree::bulk_load(points),
        }
    }

    pub fn len(&self) -> usize {
        self.stops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stops.is_empty()
    }

    /// Stops inside the bounding box of `path` grown by `radius_m`. A coarse filter: callers
    /// still measure the exact distance.
    pub fn near_path<'a>(&'a self, path: &[LatLng], radius_m: f64) -> impl Iterator<Item = &'a Stop> + 'a {
        let envelope = path.first().map(|first| {
            let (mut min_lat, mut max_lat) = (first.latitude, first.latitude);
            let (mut min_lng, mut max_lng) = (first.longitude, first.longitude);
            for p in path {
                min_lat = min_lat.min(p.latitude);
                max_lat = max_lat.max(p.latitude);
                min_lng = min_lng.min(p.longitude);
                max_lng = max_lng.max(p.longitude);
            }
            let widest_lat = min_lat.abs().max(max_lat.abs()).to_radians();
            let d_lat = radius_m / METRES_PER_DEGREE;
            let d_lng = radius_m / (METRES_PER_DEGREE * widest_lat.cos().max(0.01));
            AABB::from_corners(
                [min_lng - d_lng, min_lat - d_lat],
                [max_lng + d_lng, max_lat + d_lat],
            )
        });

        envelope
            .into_iter()
            .flat_map(move |envelope| {
                self.tree
                    .locate_in_envelope(&envelope)
                    .map(|geom| geom.data)
                    .collect::<Vec<_>>()
            })
            .map(move |i| &self.stops[i])
    }
}
