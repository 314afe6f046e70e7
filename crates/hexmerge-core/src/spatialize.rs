//! Raster cell -> geographic point projection.

use crate::coords::LatLon;
use crate::error::PipelineError;
use crate::geometry::Polygon;
use crate::metadata::{Chunk, StudyArea};
use crate::projection::CrsTransform;
use crate::raster::RasterPrediction;

/// One raster cell centre in WGS84 with its predicted value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpatializedPoint {
    pub lat: f64,
    pub lon: f64,
    pub value: f64,
}

impl SpatializedPoint {
    pub fn location(&self) -> LatLon {
        LatLon::new(self.lat, self.lon)
    }
}

/// Projects every cell of `raster` to its geographic centre.
///
/// Output is row-major with row 0 the chunk's bottom row, so point `i` is cell
/// `(i / col_count, i % col_count)` counted from the lower-left corner. Values
/// come from the vertically flipped raster.
pub fn spatialize(
    area: &StudyArea,
    chunk: &Chunk,
    raster: &RasterPrediction,
    transform: &dyn CrsTransform,
) -> Result<Vec<SpatializedPoint>, PipelineError> {
    if raster.rows() != chunk.row_count || raster.cols() != chunk.col_count {
        return Err(PipelineError::RasterShape {
            chunk_id: chunk.id.clone(),
            expected_rows: chunk.row_count,
            expected_cols: chunk.col_count,
            actual_rows: raster.rows(),
            actual_cols: raster.cols(),
        });
    }

    let mut points = Vec::with_capacity(chunk.row_count * chunk.col_count);
    for row in 0..chunk.row_count {
        for col in 0..chunk.col_count {
            let ll = transform.to_geographic(chunk.cell_center(area.cell_size, row, col))?;
            let value = raster.get_bottom_up(row, col);
            points.push(SpatializedPoint { lat: ll.lat, lon: ll.lon, value });
        }
    }
    Ok(points)
}

/// The chunk's rectangle in geographic coordinates (its four reprojected corners).
pub fn chunk_boundary(
    area: &StudyArea,
    chunk: &Chunk,
    transform: &dyn CrsTransform,
) -> Result<Polygon, PipelineError> {
    let corners = chunk
        .extent(area.cell_size)
        .corners()
        .into_iter()
        .map(|c| transform.to_geographic(c))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Polygon::new(corners))
}
