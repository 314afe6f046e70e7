//! H3 cell primitives at a fixed resolution.

use h3o::{CellIndex, LatLng, Resolution};

use crate::coords::LatLon;
use crate::error::PipelineError;
use crate::geometry::Polygon;
use crate::metadata::{Chunk, StudyArea};

/// Default output resolution: ~44 m² cells, ~3.9 m edges.
///
/// Changing the resolution changes which neighbor chunks can contribute to a
/// boundary hex; [`HexGrid::check_neighbor_sufficiency`] guards the bound.
pub const DEFAULT_RESOLUTION: u8 = 13;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HexGrid {
    resolution: Resolution,
}

impl HexGrid {
    pub fn new(level: u8) -> Result<Self, PipelineError> {
        let resolution = Resolution::try_from(level).map_err(|e| {
            PipelineError::HexResolution(format!("invalid H3 resolution {level}: {e}"))
        })?;
        Ok(Self { resolution })
    }

    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    /// The hex containing `p`.
    pub fn cell_at(&self, p: LatLon) -> Result<CellIndex, PipelineError> {
        let ll = LatLng::new(p.lat, p.lon)
            .map_err(|_| PipelineError::InvalidCoordinate { lat: p.lat, lon: p.lon })?;
        Ok(ll.to_cell(self.resolution))
    }

    pub fn centroid(&self, cell: CellIndex) -> LatLon {
        let ll = LatLng::from(cell);
        LatLon::new(ll.lat_radians().to_degrees(), ll.lng_radians().to_degrees())
    }

    pub fn boundary(&self, cell: CellIndex) -> Polygon {
        Polygon::new(
            cell.boundary()
                .iter()
                .map(|ll| LatLon::new(ll.lat_radians().to_degrees(), ll.lng_radians().to_degrees()))
                .collect(),
        )
    }

    /// Largest distance between two points of one hex, in metres (approximate).
    pub fn diameter_m(&self) -> f64 {
        2.0 * self.resolution.edge_length_m()
    }

    /// Checks that a hex straddling `chunk`'s edge can only reach into the 8
    /// adjacent chunks: the hex must be narrower than the chunk's shorter side.
    ///
    /// Only meaningful for projected CRSs in metres; callers skip the check for
    /// geographic source CRSs.
    pub fn check_neighbor_sufficiency(
        &self,
        area: &StudyArea,
        chunk: &Chunk,
    ) -> Result<(), PipelineError> {
        let extent = chunk.extent(area.cell_size);
        let shorter_side = extent.width().min(extent.height());
        let diameter = self.diameter_m();
        if diameter < shorter_side {
            return Ok(());
        }
        Err(PipelineError::HexResolution(format!(
            "H3 resolution {} cells (~{diameter:.1} m across) are not smaller than chunk \"{}\" \
             ({shorter_side:.1} m shorter side); 8-neighbor aggregation would miss contributions",
            u8::from(self.resolution),
            chunk.id,
        )))
    }
}

impl Default for HexGrid {
    fn default() -> Self {
        Self { resolution: Resolution::Thirteen }
    }
}
