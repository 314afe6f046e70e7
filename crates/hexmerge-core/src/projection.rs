//! Source CRS <-> WGS84 reprojection.
//!
//! The pipeline only needs point transforms, so the seam is a small trait;
//! [`ProjTransform`] backs it with proj4rs (pure Rust, no libproj).

use proj4rs::proj::Proj;
use proj4rs::transform::transform;

use crate::coords::{LatLon, SourcePoint};
use crate::error::PipelineError;

pub const EPSG_WGS84: u32 = 4326;
pub const EPSG_WEB_MERCATOR: u32 = 3857;

const WGS84_PROJ: &str = "+proj=longlat +datum=WGS84 +no_defs";

pub trait CrsTransform {
    /// Source CRS -> geographic.
    fn to_geographic(&self, p: SourcePoint) -> Result<LatLon, PipelineError>;

    /// Geographic -> source CRS.
    fn to_source(&self, p: LatLon) -> Result<SourcePoint, PipelineError>;

    /// True when the source CRS is itself geographic (units are degrees).
    fn is_geographic(&self) -> bool;
}

/// proj4 definition for the EPSG codes the study areas use.
pub fn proj_string_for_epsg(code: u32) -> Option<String> {
    match code {
        EPSG_WGS84 => Some(WGS84_PROJ.to_string()),
        EPSG_WEB_MERCATOR => Some(
            concat!(
                "+proj=merc +a=6378137 +b=6378137 +lat_ts=0 +lon_0=0 ",
                "+x_0=0 +y_0=0 +k=1 +units=m +no_defs"
            )
            .to_string(),
        ),
        // WGS84 / UTM north and south.
        32601..=32660 => {
            Some(format!("+proj=utm +zone={} +datum=WGS84 +units=m +no_defs", code - 32600))
        }
        32701..=32760 => Some(format!(
            "+proj=utm +zone={} +south +datum=WGS84 +units=m +no_defs",
            code - 32700
        )),
        // NAD83 / UTM; NAD83 and WGS84 agree to well under a hex edge.
        26901..=26923 => Some(format!(
            "+proj=utm +zone={} +ellps=GRS80 +towgs84=0,0,0 +units=m +no_defs",
            code - 26900
        )),
        _ => None,
    }
}

/// Parses `EPSG:<code>` (case-insensitive) into the numeric code.
pub fn parse_epsg(crs: &str) -> Option<u32> {
    let (authority, code) = crs.trim().split_once(':')?;
    if !authority.eq_ignore_ascii_case("epsg") {
        return None;
    }
    code.trim().parse().ok()
}

pub struct ProjTransform {
    crs: String,
    source: Proj,
    target: Proj,
    geographic: bool,
}

impl std::fmt::Debug for ProjTransform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProjTransform")
            .field("crs", &self.crs)
            .field("geographic", &self.geographic)
            .finish_non_exhaustive()
    }
}

impl ProjTransform {
    /// Accepts `EPSG:<code>` for the supported codes, or a raw `+proj=` string.
    pub fn from_crs(crs: &str) -> Result<Self, PipelineError> {
        let err = |reason: String| PipelineError::Projection { crs: crs.to_string(), reason };

        let (definition, geographic) = if crs.trim_start().starts_with("+proj=") {
            let def = crs.trim().to_string();
            let geographic = def.contains("+proj=longlat") || def.contains("+proj=latlong");
            (def, geographic)
        } else {
            let code = parse_epsg(crs).ok_or_else(|| err("expected EPSG:<code>".into()))?;
            let def = proj_string_for_epsg(code)
                .ok_or_else(|| err(format!("EPSG:{code} not supported")))?;
            (def, code == EPSG_WGS84)
        };

        let source = Proj::from_proj_string(&definition).map_err(|e| err(format!("{e:?}")))?;
        let target = Proj::from_proj_string(WGS84_PROJ).map_err(|e| err(format!("{e:?}")))?;
        Ok(Self { crs: crs.to_string(), source, target, geographic })
    }

    pub fn crs(&self) -> &str {
        &self.crs
    }

    fn run(&self, from: &Proj, to: &Proj, x: f64, y: f64) -> Result<(f64, f64), PipelineError> {
        let mut point = (x, y, 0.0);
        transform(from, to, &mut point).map_err(|e| PipelineError::Projection {
            crs: self.crs.clone(),
            reason: format!("transform of ({x}, {y}) failed: {e:?}"),
        })?;
        Ok((point.0, point.1))
    }
}

impl CrsTransform for ProjTransform {
    fn to_geographic(&self, p: SourcePoint) -> Result<LatLon, PipelineError> {
        if self.geographic {
            return Ok(LatLon::new(p.y, p.x));
        }
        let (lon, lat) = self.run(&self.source, &self.target, p.x, p.y)?;
        Ok(LatLon::new(lat.to_degrees(), lon.to_degrees()))
    }

    fn to_source(&self, p: LatLon) -> Result<SourcePoint, PipelineError> {
        if self.geographic {
            return Ok(SourcePoint::new(p.lon, p.lat));
        }
        let (x, y) = self.run(&self.target, &self.source, p.lon.to_radians(), p.lat.to_radians())?;
        Ok(SourcePoint::new(x, y))
    }

    fn is_geographic(&self) -> bool {
        self.geographic
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn parses_epsg_identifiers() {
        assert_eq!(parse_epsg("EPSG:32618"), Some(32618));
        assert_eq!(parse_epsg("epsg: 4326"), Some(4326));
        assert_eq!(parse_epsg("ESRI:102003"), None);
        assert_eq!(parse_epsg("32618"), None);
    }

    #[test]
    fn utm_zone_strings() {
        assert!(proj_string_for_epsg(32618).unwrap().contains("+zone=18"));
        assert!(proj_string_for_epsg(32733).unwrap().contains("+south"));
        assert!(proj_string_for_epsg(26918).unwrap().contains("+ellps=GRS80"));
        assert!(proj_string_for_epsg(2263).is_none());
    }

    #[test]
    fn utm_central_meridian_maps_to_zone_longitude() {
        let t = ProjTransform::from_crs("EPSG:32618").unwrap();
        assert!(!t.is_geographic());
        // Zone 18 central meridian is 75W; false easting 500 km.
        let ll = t.to_geographic(SourcePoint::new(500_000.0, 0.0)).unwrap();
        assert_abs_diff_eq!(ll.lon, -75.0, epsilon = 1e-6);
        assert_abs_diff_eq!(ll.lat, 0.0, epsilon = 1e-6);
    }

    #[test]
    fn utm_roundtrip() {
        let t = ProjTransform::from_crs("EPSG:32618").unwrap();
        for &(x, y) in &[(500.0, 100.0), (583_000.0, 4_507_000.0), (420_000.0, 4_650_000.0)] {
            let ll = t.to_geographic(SourcePoint::new(x, y)).unwrap();
            let back = t.to_source(ll).unwrap();
            assert_abs_diff_eq!(back.x, x, epsilon = 1e-3);
            assert_abs_diff_eq!(back.y, y, epsilon = 1e-3);
        }
    }

    #[test]
    fn wgs84_is_identity() {
        let t = ProjTransform::from_crs("EPSG:4326").unwrap();
        assert!(t.is_geographic());
        let ll = t.to_geographic(SourcePoint::new(-73.9, 40.7)).unwrap();
        assert_eq!(ll, LatLon::new(40.7, -73.9));
    }

    #[test]
    fn unsupported_crs_is_a_projection_error() {
        match ProjTransform::from_crs("EPSG:2263") {
            Err(PipelineError::Projection { crs, .. }) => assert_eq!(crs, "EPSG:2263"),
            other => panic!("expected projection error, got {other:?}"),
        }
    }
}
