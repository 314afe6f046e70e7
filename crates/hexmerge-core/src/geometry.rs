//! Planar polygon predicates over (lon, lat) vertices.
//!
//! Chunk footprints and hex cells are a few metres to a few kilometres across,
//! so treating degrees as a plane is accurate enough for containment tests.
//! Semantics follow the usual simple-features conventions: a point on the
//! boundary is *covered* but not *contained*.

use crate::coords::LatLon;

/// Tolerance for collinearity and on-segment tests, in degrees.
const EPS: f64 = 1e-12;

/// A simple polygon. The ring is implicitly closed.
#[derive(Debug, Clone, PartialEq)]
pub struct Polygon {
    vertices: Vec<LatLon>,
}

impl Polygon {
    /// Builds a polygon, dropping an explicit closing vertex if present.
    pub fn new(mut vertices: Vec<LatLon>) -> Self {
        if vertices.len() > 1 && vertices.first() == vertices.last() {
            vertices.pop();
        }
        Self { vertices }
    }

    pub fn vertices(&self) -> &[LatLon] {
        &self.vertices
    }

    fn edges(&self) -> impl Iterator<Item = (LatLon, LatLon)> + '_ {
        let n = self.vertices.len();
        (0..n).map(move |i| (self.vertices[i], self.vertices[(i + 1) % n]))
    }

    /// True if `p` lies on one of the polygon's edges.
    pub fn on_boundary(&self, p: LatLon) -> bool {
        self.edges().any(|(a, b)| on_segment(a, b, p))
    }

    /// Strict interior test: boundary points are not contained.
    pub fn contains_point(&self, p: LatLon) -> bool {
        !self.on_boundary(p) && self.crossing_parity(p)
    }

    /// Interior or boundary.
    pub fn covers_point(&self, p: LatLon) -> bool {
        self.on_boundary(p) || self.crossing_parity(p)
    }

    /// True if `other` lies entirely inside this polygon (touching the
    /// boundary from the inside is allowed).
    pub fn contains_polygon(&self, other: &Polygon) -> bool {
        if other.vertices.is_empty() || !other.vertices.iter().all(|&v| self.covers_point(v)) {
            return false;
        }
        // With every vertex covered, leaving the container requires a proper
        // edge crossing (only possible for a non-convex container).
        !other
            .edges()
            .any(|(a, b)| self.edges().any(|(c, d)| proper_crossing(a, b, c, d)))
    }

    /// True if the polygons share any point, boundaries included.
    pub fn intersects(&self, other: &Polygon) -> bool {
        if self.vertices.is_empty() || other.vertices.is_empty() {
            return false;
        }
        if other.edges().any(|(a, b)| self.edges().any(|(c, d)| segments_touch(a, b, c, d))) {
            return true;
        }
        // No edge contact: either disjoint or one nested in the other.
        self.covers_point(other.vertices[0]) || other.covers_point(self.vertices[0])
    }

    /// Even-odd ray cast towards +lon.
    fn crossing_parity(&self, p: LatLon) -> bool {
        let mut inside = false;
        for (a, b) in self.edges() {
            if (a.lat > p.lat) != (b.lat > p.lat) {
                let lon_at = a.lon + (p.lat - a.lat) / (b.lat - a.lat) * (b.lon - a.lon);
                if p.lon < lon_at {
                    inside = !inside;
                }
            }
        }
        inside
    }
}

/// Signed area of the triangle (a, b, c) times two; positive when counter-clockwise.
fn orient(a: LatLon, b: LatLon, c: LatLon) -> f64 {
    (b.lon - a.lon) * (c.lat - a.lat) - (b.lat - a.lat) * (c.lon - a.lon)
}

fn on_segment(a: LatLon, b: LatLon, p: LatLon) -> bool {
    if orient(a, b, p).abs() > EPS {
        return false;
    }
    p.lon >= a.lon.min(b.lon) - EPS
        && p.lon <= a.lon.max(b.lon) + EPS
        && p.lat >= a.lat.min(b.lat) - EPS
        && p.lat <= a.lat.max(b.lat) + EPS
}

/// Segments cross at a single interior point of both.
fn proper_crossing(a: LatLon, b: LatLon, c: LatLon, d: LatLon) -> bool {
    let d1 = orient(c, d, a);
    let d2 = orient(c, d, b);
    let d3 = orient(a, b, c);
    let d4 = orient(a, b, d);
    ((d1 > EPS && d2 < -EPS) || (d1 < -EPS && d2 > EPS))
        && ((d3 > EPS && d4 < -EPS) || (d3 < -EPS && d4 > EPS))
}

/// Segments share at least one point.
fn segments_touch(a: LatLon, b: LatLon, c: LatLon, d: LatLon) -> bool {
    proper_crossing(a, b, c, d)
        || on_segment(c, d, a)
        || on_segment(c, d, b)
        || on_segment(a, b, c)
        || on_segment(a, b, d)
}
