use crate::point::LatLng;
use geo_types::{Coord, LineString};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PolylineMatch {
    pub distance_m: f64,
    /// Index of the segment (or of the vertex, for single point lines) closest to the query point.
    pub segment_index: usize,
}

pub fn path_length(path: &[LatLng]) -> f64 {
    path.windows(2)
        .map(|pair| pair[0].haversine_distance(&pair[1]))
        .sum()
}

/// Shortest distance from `p` to the segment `a`-`b`, in metres.
pub fn point_segment_distance(p: &LatLng, a: &LatLng, b: &LatLng) -> f64 {
    let (ax, ay) = a.local_xy(p);
    let (bx, by) = b.local_xy(p);
    let (dx, dy) = (bx - ax, by - ay);
    let len_sq = dx * dx + dy * dy;

    if len_sq == 0.0 {
        return (ax * ax + ay * ay).sqrt();
    }

    // p sits at the origin of the projection
    let t = (-(ax * dx + ay * dy) / len_sq).clamp(0.0, 1.0);
    let cx = ax + t * dx;
    let cy = ay + t * dy;
    (cx * cx + cy * cy).sqrt()
}

pub fn distance_to_polyline(p: &LatLng, line: &[LatLng]) -> Option<PolylineMatch> {
    match line {
        [] => None,
        [only] => Some(PolylineMatch {
            distance_m: p.haversine_distance(only),
            segment_index: 0,
        }),
        _ => {
            let mut best = PolylineMatch {
                distance_m: f64::INFINITY,
                segment_index: 0,
            };
            for (segment_index, pair) in line.windows(2).enumerate() {
                let distance_m = point_segment_distance(p, &pair[0], &pair[1]);
                if distance_m < best.distance_m {
                    best = PolylineMatch {
                        distance_m,
                        segment_index,
                    };
                }
            }
            Some(best)
        }
    }
}

/// Douglas-Peucker simplification. Endpoints are always kept.
pub fn simplify(path: &[LatLng], tolerance_m: f64) -> Vec<LatLng> {
    if path.len() <= 2 {
        return path.to_vec();
    }

    let mut keep = vec![false; path.len()];
    keep[0] = true;
    keep[path.len() - 1] = true;

    let mut stack = vec![(0usize, path.len() - 1)];
    while let Some((start, end)) = stack.pop() {
        if end <= start + 1 {
            continue;
        }

        let mut farthest = start;
        let mut farthest_dist = 0.0;
        for i in start + 1..end {
            let d = point_segment_distance(&path[i], &path[start], &path[end]);
            if d > farthest_dist {
                farthest_dist = d;
                farthest = i;
            }
        }

        if farthest_dist > tolerance_m {
            keep[farthest] = true;
            stack.push((start, farthest));
            stack.push((farthest, end));
        }
    }

    path.iter()
        .zip(keep)
        .filter_map(|(p, kept)| kept.then_some(*p))
        .collect()
}

/// Mean of the vertices.
pub fn centroid(path: &[LatLng]) -> Option<LatLng> {
    if path.is_empty() {
        return None;
    }
    let n = path.len() as f64;
    let (lat, lng) = path.iter().fold((0.0, 0.0), |(lat, lng), p| {
        (lat + p.latitude, lng + p.longitude)
    });
    Some(LatLng::from_lat_lng(lat / n, lng / n))
}

/// Resamples `path` so that no two consecutive points are further than `step_m` apart.
/// Original vertices are kept.
pub fn densify(path: &[LatLng], step_m: f64) -> Vec<LatLng> {
    let Some(first) = path.first() else {
        return Vec::new();
    };
    let mut result = vec![*first];
    if step_m <= 0.0 {
        result.extend_from_slice(&path[1..]);
        return result;
    }

    for pair in path.windows(2) {
        let length = pair[0].haversine_distance(&pair[1]);
        let pieces = (length / step_m).ceil().max(1.0) as usize;
        for k in 1..pieces {
            result.push(pair[0].interpolate(&pair[1], k as f64 / pieces as f64));
        }
        result.push(pair[1]);
    }
    result
}

/// Fraction (0..=1) of `a`, sampled along its length, that lies within `corridor_m` of `b`.
pub fn overlap_ratio(a: &[LatLng], b: &[LatLng], corridor_m: f64) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let samples = densify(a, (corridor_m / 2.0).max(5.0));
    let inside = samples
        .iter()
        .filter(|p| {
            distance_to_polyline(p, b)
                .map(|m| m.distance_m <= corridor_m)
                .unwrap_or(false)
        })
        .count();
    inside as f64 / samples.len() as f64
}

/// Two paths describe the same geometry when either one lies inside the other's corridor
/// for at least `min_overlap_pct` percent of its length.
pub fn paths_overlap(a: &[LatLng], b: &[LatLng], corridor_m: f64, min_overlap_pct: f64) -> bool {
    let required = min_overlap_pct / 100.0;
    overlap_ratio(a, b, corridor_m) >= required || overlap_ratio(b, a, corridor_m) >= required
}

pub fn to_line_string(path: &[LatLng]) -> LineString<f64> {
    LineString::new(path.iter().map(|p| Coord::from(*p)).collect())
}
