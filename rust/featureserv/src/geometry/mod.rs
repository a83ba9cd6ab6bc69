//! Conversion between WKT as stored by PostGIS and the Esri JSON geometry dialect.

pub mod rings;

use crate::models::{GeometryType, SpatialReference, WEB_MERCATOR_SRID};
use geo_types::{
    Coord as GeoCoord, Geometry, LineString, MultiLineString, MultiPolygon, Polygon,
};
use rings::{group_rings, CrossingNumber, RingContainment};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use wkt::{ToWkt, TryFromWkt};

pub type Coord = [f64; 2];

#[derive(Debug, Error, Clone, PartialEq)]
#[error("{0}")]
pub struct GeometryFormatError(pub String);

type Result<T> = std::result::Result<T, GeometryFormatError>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EsriGeometry {
    Point {
        x: f64,
        y: f64,
        #[serde(
            rename = "spatialReference",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        spatial_reference: Option<SpatialReference>,
    },
    Polyline {
        paths: Vec<Vec<Coord>>,
        #[serde(
            rename = "spatialReference",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        spatial_reference: Option<SpatialReference>,
    },
    Polygon {
        rings: Vec<Vec<Coord>>,
        #[serde(
            rename = "spatialReference",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        spatial_reference: Option<SpatialReference>,
    },
}

impl EsriGeometry {
    pub fn point(x: f64, y: f64) -> Self {
        Self::Point {
            x,
            y,
            spatial_reference: None,
        }
    }

    pub fn geometry_type(&self) -> GeometryType {
        match self {
            Self::Point { .. } => GeometryType::Point,
            Self::Polyline { .. } => GeometryType::Polyline,
            Self::Polygon { .. } => GeometryType::Polygon,
        }
    }

    pub fn spatial_reference(&self) -> Option<&SpatialReference> {
        match self {
            Self::Point {
                spatial_reference, ..
            }
            | Self::Polyline {
                spatial_reference, ..
            }
            | Self::Polygon {
                spatial_reference, ..
            } => spatial_reference.as_ref(),
        }
    }
}

pub fn wkt_to_esri(text: &str) -> Result<EsriGeometry> {
    let geometry = Geometry::<f64>::try_from_wkt_str(text.trim())
        .map_err(|err| GeometryFormatError(format!("invalid geometry '{text}': {err}")))?;

    match geometry {
        Geometry::Point(point) => Ok(EsriGeometry::point(point.x(), point.y())),
        Geometry::MultiPoint(points) => match points.0.as_slice() {
            [point] => Ok(EsriGeometry::point(point.x(), point.y())),
            _ => Err(GeometryFormatError(format!(
                "invalid point geometry: {text}"
            ))),
        },
        Geometry::LineString(line) => Ok(EsriGeometry::Polyline {
            paths: vec![line_coords(&line)],
            spatial_reference: None,
        }),
        Geometry::MultiLineString(lines) => Ok(EsriGeometry::Polyline {
            paths: lines.0.iter().map(line_coords).collect(),
            spatial_reference: None,
        }),
        Geometry::Polygon(polygon) => Ok(EsriGeometry::Polygon {
            rings: polygon_rings(&polygon),
            spatial_reference: None,
        }),
        Geometry::MultiPolygon(polygons) => Ok(EsriGeometry::Polygon {
            rings: polygons.0.iter().flat_map(polygon_rings).collect(),
            spatial_reference: None,
        }),
        other => Err(GeometryFormatError(format!(
            "unsupported geometry kind in '{}'",
            other.wkt_string()
        ))),
    }
}

/// Writes an Esri geometry as EWKT for `ST_GeomFromEWKT`.
///
/// The SRID comes from the geometry's own `spatialReference` and falls back
/// to Web Mercator. Lines and polygons are always written as their MULTI forms.
pub fn esri_to_ewkt(geometry: &EsriGeometry, expected: GeometryType) -> Result<String> {
    esri_to_ewkt_with(geometry, expected, &CrossingNumber)
}

pub fn esri_to_ewkt_with<C: RingContainment>(
    geometry: &EsriGeometry,
    expected: GeometryType,
    containment: &C,
) -> Result<String> {
    if geometry.geometry_type() != expected {
        return Err(GeometryFormatError(format!(
            "expected {} geometry, got {}",
            expected.as_str(),
            geometry.geometry_type().as_str()
        )));
    }

    let srid = geometry
        .spatial_reference()
        .map(|sr| sr.wkid)
        .unwrap_or(WEB_MERCATOR_SRID);
    let body = esri_to_wkt(geometry, containment)?;
    Ok(format!("SRID={srid};{body}"))
}

pub fn esri_to_wkt<C: RingContainment>(geometry: &EsriGeometry, containment: &C) -> Result<String> {
    match geometry {
        EsriGeometry::Point { x, y, .. } => Ok(format!("POINT({x} {y})")),
        EsriGeometry::Polyline { paths, .. } => {
            if paths.iter().any(|path| path.len() < 2) {
                return Err(GeometryFormatError(
                    "polyline paths need at least two points".into(),
                ));
            }
            let lines = paths.iter().map(|path| to_line(path)).collect::<Vec<_>>();
            Ok(MultiLineString::new(lines).wkt_string())
        }
        EsriGeometry::Polygon { rings, .. } => {
            let grouped = group_rings(rings, containment);
            if grouped.is_empty() {
                return Err(GeometryFormatError(
                    "polygon has no ring with at least four points".into(),
                ));
            }
            let polygons = grouped
                .into_iter()
                .map(|mut rings| {
                    let shell = to_line(&rings.remove(0));
                    let holes = rings.iter().map(|ring| to_line(ring)).collect();
                    Polygon::new(shell, holes)
                })
                .collect::<Vec<_>>();
            Ok(MultiPolygon::new(polygons).wkt_string())
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub xmin: f64,
    pub ymin: f64,
    pub xmax: f64,
    pub ymax: f64,
}

impl Envelope {
    pub fn to_wkt(&self) -> String {
        let Envelope {
            xmin,
            ymin,
            xmax,
            ymax,
        } = *self;
        format!(
            "POLYGON(({xmin} {ymin}, {xmax} {ymin}, {xmax} {ymax}, {xmin} {ymax}, {xmin} {ymin}))"
        )
    }
}

fn to_line(coords: &[Coord]) -> LineString<f64> {
    LineString::new(
        coords
            .iter()
            .map(|[x, y]| GeoCoord { x: *x, y: *y })
            .collect(),
    )
}

fn line_coords(line: &LineString<f64>) -> Vec<Coord> {
    line.0.iter().map(|c| [c.x, c.y]).collect()
}

fn polygon_rings(polygon: &Polygon<f64>) -> Vec<Vec<Coord>> {
    std::iter::once(polygon.exterior())
        .chain(polygon.interiors())
        .map(line_coords)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::rings::is_clockwise;
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn reads_points() {
        assert_eq!(wkt_to_esri("POINT(1.5 -2)").unwrap(), EsriGeometry::point(1.5, -2.0));
        assert_eq!(
            wkt_to_esri("MULTIPOINT((3 4))").unwrap(),
            EsriGeometry::point(3.0, 4.0)
        );
    }

    #[test]
    fn rejects_malformed_points() {
        assert!(wkt_to_esri("POINT(1)").is_err());
        assert!(wkt_to_esri("POINT(a b)").is_err());
        assert!(wkt_to_esri("MULTIPOINT((1 2),(3 4))").is_err());
    }

    #[test]
    fn reads_lines_as_paths() {
        let geometry = wkt_to_esri("MULTILINESTRING((0 0,1 1),(2 2,3 3))").unwrap();
        assert_eq!(
            geometry,
            EsriGeometry::Polyline {
                paths: vec![vec![[0.0, 0.0], [1.0, 1.0]], vec![[2.0, 2.0], [3.0, 3.0]]],
                spatial_reference: None,
            }
        );
    }

    #[test]
    fn reads_multipolygon_rings_flattened() {
        let geometry = wkt_to_esri(
            "MULTIPOLYGON(((0 0,0 10,10 10,10 0,0 0),(2 2,4 2,4 4,2 4,2 2)),((20 20,20 30,30 30,20 20)))",
        )
        .unwrap();
        match geometry {
            EsriGeometry::Polygon { rings, .. } => assert_eq!(rings.len(), 3),
            other => panic!("expected polygon, got {other:?}"),
        }
    }

    #[test]
    fn point_writes_ewkt_with_default_srid() {
        let ewkt = esri_to_ewkt(&EsriGeometry::point(1.0, 2.0), GeometryType::Point).unwrap();
        assert_eq!(ewkt, "SRID=3857;POINT(1 2)");
    }

    #[test]
    fn explicit_spatial_reference_wins() {
        let geometry = EsriGeometry::Point {
            x: 1.0,
            y: 2.0,
            spatial_reference: Some(SpatialReference { wkid: 4326 }),
        };
        let ewkt = esri_to_ewkt(&geometry, GeometryType::Point).unwrap();
        assert!(ewkt.starts_with("SRID=4326;"), "got {ewkt}");
    }

    #[test]
    fn type_mismatch_is_rejected() {
        let err = esri_to_ewkt(&EsriGeometry::point(1.0, 2.0), GeometryType::Polygon).unwrap_err();
        assert!(err.0.contains("esriGeometryPolygon"));
    }

    #[test]
    fn polygon_round_trip_keeps_orientation() {
        let geometry = EsriGeometry::Polygon {
            rings: vec![
                vec![[0.0, 0.0], [0.0, 10.0], [10.0, 10.0], [10.0, 0.0]],
                vec![[2.0, 2.0], [4.0, 2.0], [4.0, 4.0], [2.0, 4.0], [2.0, 2.0]],
            ],
            spatial_reference: None,
        };
        let ewkt = esri_to_ewkt(&geometry, GeometryType::Polygon).unwrap();
        let (prefix, body) = ewkt.split_once(';').unwrap();
        assert_eq!(prefix, "SRID=3857");
        assert!(body.starts_with("MULTIPOLYGON"));

        match wkt_to_esri(body).unwrap() {
            EsriGeometry::Polygon { rings, .. } => {
                assert_eq!(rings.len(), 2);
                assert!(is_clockwise(&rings[0]));
                assert!(!is_clockwise(&rings[1]));
                assert_eq!(rings[0].first(), rings[0].last());
            }
            other => panic!("expected polygon, got {other:?}"),
        }
    }

    #[test]
    fn polyline_round_trip() {
        let geometry = EsriGeometry::Polyline {
            paths: vec![vec![[0.5, 1.25], [2.0, 3.0]]],
            spatial_reference: None,
        };
        let ewkt = esri_to_ewkt(&geometry, GeometryType::Polyline).unwrap();
        let body = ewkt.split_once(';').unwrap().1;
        assert!(body.starts_with("MULTILINESTRING"));
        assert_eq!(wkt_to_esri(body).unwrap(), geometry);
    }

    #[test]
    fn esri_json_shapes_deserialize() {
        let point: EsriGeometry = serde_json::from_str(r#"{"x": 1, "y": 2}"#).unwrap();
        assert_eq!(point.geometry_type(), GeometryType::Point);
        let polygon: EsriGeometry =
            serde_json::from_str(r#"{"rings": [[[0,0],[0,1],[1,1],[0,0]]], "spatialReference": {"wkid": 102100}}"#)
                .unwrap();
        assert_eq!(polygon.spatial_reference().map(|sr| sr.wkid), Some(102100));
    }

    #[test]
    fn envelope_renders_closed_polygon() {
        let envelope = Envelope {
            xmin: -1.0,
            ymin: -2.0,
            xmax: 3.0,
            ymax: 4.0,
        };
        assert_eq!(
            envelope.to_wkt(),
            "POLYGON((-1 -2, 3 -2, 3 4, -1 4, -1 -2))"
        );
    }
}
