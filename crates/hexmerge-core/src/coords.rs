/// Coordinate types for the two spaces the pipeline moves between:
/// a study area's projected source CRS and geographic WGS84.
/// All coordinate math uses f64 for precision.

/// A point in geographic coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LatLon {
    /// Latitude in degrees, -90 to +90.
    pub lat: f64,
    /// Longitude in degrees, -180 to +180.
    pub lon: f64,
}

impl LatLon {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }

    pub fn is_valid(self) -> bool {
        self.lat.is_finite()
            && self.lon.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lon)
    }
}

/// A point in a study area's source CRS (projection units, usually metres).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SourcePoint {
    pub x: f64,
    pub y: f64,
}

impl SourcePoint {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// Axis-aligned rectangle in the source CRS.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SourceRect {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl SourceRect {
    /// Corners counter-clockwise from the lower-left.
    pub fn corners(&self) -> [SourcePoint; 4] {
        [
            SourcePoint::new(self.min_x, self.min_y),
            SourcePoint::new(self.max_x, self.min_y),
            SourcePoint::new(self.max_x, self.max_y),
            SourcePoint::new(self.min_x, self.max_y),
        ]
    }

    pub fn width(&self) -> f64 {
        self.max_x - self.min_x
    }

    pub fn height(&self) -> f64 {
        self.max_y - self.min_y
    }
}
