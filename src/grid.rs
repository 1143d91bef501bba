use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GridError {
    #[error("grid is not a GeoJSON FeatureCollection")]
    NotAFeatureCollection,

    #[error("invalid feature {index}: {reason}")]
    InvalidFeature { index: usize, reason: String },

    #[error("duplicate cell id {0}")]
    DuplicateCell(CellId),
}

/// Grid cell identifier as issued by the backend (INSPIRE id or H3 index).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CellId(String);

impl CellId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CellId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CellId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// WGS84 coordinate in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
}

impl GeoPoint {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }
}

/// One polygon: exterior ring followed by zero or more holes.
/// Rings are `(lon, lat)` pairs in GeoJSON order.
#[derive(Debug, Clone)]
pub struct Polygon {
    pub exterior: Vec<(f64, f64)>,
    pub holes: Vec<Vec<(f64, f64)>>,
}

impl Polygon {
    pub fn contains(&self, lon: f64, lat: f64) -> bool {
        ring_contains(&self.exterior, lon, lat)
            && !self.holes.iter().any(|hole| ring_contains(hole, lon, lat))
    }
}

#[derive(Debug, Clone, Copy)]
struct BoundingBox {
    min_lon: f64,
    min_lat: f64,
    max_lon: f64,
    max_lat: f64,
}

impl BoundingBox {
    fn around(polygons: &[Polygon]) -> Self {
        let mut bbox = BoundingBox {
            min_lon: f64::INFINITY,
            min_lat: f64::INFINITY,
            max_lon: f64::NEG_INFINITY,
            max_lat: f64::NEG_INFINITY,
        };
        for &(lon, lat) in polygons.iter().flat_map(|p| p.exterior.iter()) {
            bbox.min_lon = bbox.min_lon.min(lon);
            bbox.min_lat = bbox.min_lat.min(lat);
            bbox.max_lon = bbox.max_lon.max(lon);
            bbox.max_lat = bbox.max_lat.max(lat);
        }
        bbox
    }

    fn contains(&self, lon: f64, lat: f64) -> bool {
        lon >= self.min_lon && lon <= self.max_lon && lat >= self.min_lat && lat <= self.max_lat
    }
}

#[derive(Debug, Clone)]
pub struct Cell {
    pub id: CellId,
    pub polygons: Vec<Polygon>,
    bbox: BoundingBox,
}

impl Cell {
    pub fn new(id: CellId, polygons: Vec<Polygon>) -> Self {
        let bbox = BoundingBox::around(&polygons);
        Self { id, polygons, bbox }
    }

    pub fn contains(&self, point: GeoPoint) -> bool {
        self.bbox.contains(point.lon, point.lat)
            && self.polygons.iter().any(|p| p.contains(point.lon, point.lat))
    }
}

/// Immutable set of cells for one session, in backend order.
#[derive(Debug, Clone, Default)]
pub struct Grid {
    cells: Vec<Cell>,
}

impl Grid {
    pub fn new(cells: Vec<Cell>) -> Result<Self, GridError> {
        let mut seen = HashSet::with_capacity(cells.len());
        for cell in &cells {
            if !seen.insert(&cell.id) {
                return Err(GridError::DuplicateCell(cell.id.clone()));
            }
        }
        Ok(Self { cells })
    }

    /// Parse a FeatureCollection whose features carry a `cell_id` property and
    /// a Polygon or MultiPolygon geometry.
    pub fn from_geojson(value: &Value) -> Result<Self, GridError> {
        let obj = value.as_object().ok_or(GridError::NotAFeatureCollection)?;
        if obj.get("type").and_then(Value::as_str) != Some("FeatureCollection") {
            return Err(GridError::NotAFeatureCollection);
        }
        let features = obj
            .get("features")
            .and_then(Value::as_array)
            .ok_or(GridError::NotAFeatureCollection)?;

        let mut cells = Vec::with_capacity(features.len());
        for (index, feature) in features.iter().enumerate() {
            let invalid = |reason: String| GridError::InvalidFeature { index, reason };

            let id = feature
                .get("properties")
                .and_then(|p| p.get("cell_id"))
                .and_then(Value::as_str)
                .ok_or_else(|| invalid("missing cell_id property".into()))?;
            let geometry = feature
                .get("geometry")
                .ok_or_else(|| invalid("missing geometry".into()))?;
            let polygons = parse_geometry(geometry).map_err(invalid)?;

            cells.push(Cell::new(CellId::new(id), polygons));
        }

        Self::new(cells)
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn cells(&self) -> &[Cell] {
        &self.cells
    }

    pub fn contains_cell(&self, id: &CellId) -> bool {
        self.cells.iter().any(|c| &c.id == id)
    }
}

/// Return the first cell (in grid order) containing `point`.
///
/// Grids from the backend never overlap, so the first match is the only one.
pub fn locate(point: GeoPoint, grid: &Grid) -> Option<CellId> {
    grid.cells
        .iter()
        .find(|cell| cell.contains(point))
        .map(|cell| cell.id.clone())
}

/// Ray-casting point-in-ring test. The closing vertex may or may not repeat
/// the first one.
fn ring_contains(ring: &[(f64, f64)], x: f64, y: f64) -> bool {
    let n = ring.len();
    if n < 3 {
        return false;
    }
    let mut inside = false;
    let mut j = n - 1;
    for i in 0..n {
        let (xi, yi) = ring[i];
        let (xj, yj) = ring[j];
        if (yi > y) != (yj > y) {
            let intersect_x = (xj - xi) * (y - yi) / (yj - yi) + xi;
            if x < intersect_x {
                inside = !inside;
            }
        }
        j = i;
    }
    inside
}

fn parse_geometry(geometry: &Value) -> Result<Vec<Polygon>, String> {
    let ty = geometry
        .get("type")
        .and_then(Value::as_str)
        .ok_or("geometry missing type")?;
    let coords = geometry
        .get("coordinates")
        .ok_or("geometry missing coordinates")?;

    match ty {
        "Polygon" => Ok(vec![parse_polygon(coords)?]),
        "MultiPolygon" => coords
            .as_array()
            .ok_or("MultiPolygon coordinates must be an array")?
            .iter()
            .map(parse_polygon)
            .collect(),
        other => Err(format!("unsupported geometry type: {other}")),
    }
}

fn parse_polygon(coords: &Value) -> Result<Polygon, String> {
    let rings = coords
        .as_array()
        .ok_or("polygon coordinates must be an array of rings")?;
    let mut rings = rings.iter().map(parse_ring);
    let exterior = rings.next().ok_or("polygon has no exterior ring")??;
    let holes = rings.collect::<Result<Vec<_>, _>>()?;
    Ok(Polygon { exterior, holes })
}

fn parse_ring(ring: &Value) -> Result<Vec<(f64, f64)>, String> {
    let positions = ring.as_array().ok_or("ring must be an array of positions")?;
    let ring = positions
        .iter()
        .map(|pos| {
            let lon = pos.get(0).and_then(Value::as_f64);
            let lat = pos.get(1).and_then(Value::as_f64);
            match (lon, lat) {
                (Some(lon), Some(lat)) => Ok((lon, lat)),
                _ => Err(format!("invalid position: {pos}")),
            }
        })
        .collect::<Result<Vec<_>, _>>()?;
    if ring.len() < 3 {
        return Err(format!("ring has {} positions, need at least 3", ring.len()));
    }
    Ok(ring)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;

    fn square(id: &str, lon0: f64, lat0: f64, size: f64) -> Value {
        json!({
            "type": "Feature",
            "geometry": {
                "type": "Polygon",
                "coordinates": [[
                    [lon0, lat0],
                    [lon0 + size, lat0],
                    [lon0 + size, lat0 + size],
                    [lon0, lat0 + size],
                    [lon0, lat0],
                ]]
            },
            "properties": {"cell_id": id}
        })
    }

    /// 2x2 block of 0.01° squares anchored at (24.90, 60.10):
    ///
    /// ```text
    ///   C D
    ///   A B
    /// ```
    pub(crate) fn four_cell_geojson() -> Value {
        json!({
            "type": "FeatureCollection",
            "features": [
                square("A", 24.90, 60.10, 0.01),
                square("B", 24.91, 60.10, 0.01),
                square("C", 24.90, 60.11, 0.01),
                square("D", 24.91, 60.11, 0.01),
            ]
        })
    }

    pub(crate) fn four_cell_grid() -> Grid {
        Grid::from_geojson(&four_cell_geojson()).expect("fixture grid parses")
    }

    pub(crate) fn center_of(id: &str) -> GeoPoint {
        match id {
            "A" => GeoPoint::new(60.105, 24.905),
            "B" => GeoPoint::new(60.105, 24.915),
            "C" => GeoPoint::new(60.115, 24.905),
            "D" => GeoPoint::new(60.115, 24.915),
            other => panic!("no fixture cell {other}"),
        }
    }

    pub(crate) fn outside() -> GeoPoint {
        GeoPoint::new(60.5, 25.5)
    }

    #[test]
    fn test_locate_returns_containing_cell() {
        let grid = four_cell_grid();
        for id in ["A", "B", "C", "D"] {
            assert_eq!(locate(center_of(id), &grid), Some(CellId::from(id)));
        }
    }

    #[test]
    fn test_locate_outside_grid_is_none() {
        let grid = four_cell_grid();
        assert_eq!(locate(outside(), &grid), None);
        assert_eq!(locate(GeoPoint::new(60.105, 24.899), &grid), None);
    }

    #[test]
    fn test_fixture_cells_do_not_overlap() {
        let grid = four_cell_grid();
        // Sample a lattice over the fixture extent, off the shared edges.
        for i in 0..40 {
            for j in 0..40 {
                let p = GeoPoint::new(60.10 + 0.0005 * j as f64 + 0.00025, 24.90 + 0.0005 * i as f64 + 0.00025);
                let hits = grid.cells().iter().filter(|c| c.contains(p)).count();
                assert!(hits <= 1, "point {p:?} matched {hits} cells");
            }
        }
    }

    #[test]
    fn test_hole_is_outside() {
        let value = json!({
            "type": "FeatureCollection",
            "features": [{
                "type": "Feature",
                "geometry": {
                    "type": "Polygon",
                    "coordinates": [
                        [[0.0, 0.0], [10.0, 0.0], [10.0, 10.0], [0.0, 10.0]],
                        [[4.0, 4.0], [6.0, 4.0], [6.0, 6.0], [4.0, 6.0]]
                    ]
                },
                "properties": {"cell_id": "ring"}
            }]
        });
        let grid = Grid::from_geojson(&value).unwrap();
        assert_eq!(locate(GeoPoint::new(2.0, 2.0), &grid), Some(CellId::from("ring")));
        assert_eq!(locate(GeoPoint::new(5.0, 5.0), &grid), None);
    }

    #[test]
    fn test_hexagon_and_multipolygon() {
        let value = json!({
            "type": "FeatureCollection",
            "features": [
                {
                    "type": "Feature",
                    "geometry": {
                        "type": "Polygon",
                        "coordinates": [[
                            [1.0, 0.0], [0.5, 0.866], [-0.5, 0.866],
                            [-1.0, 0.0], [-0.5, -0.866], [0.5, -0.866], [1.0, 0.0]
                        ]]
                    },
                    "properties": {"cell_id": "hex"}
                },
                {
                    "type": "Feature",
                    "geometry": {
                        "type": "MultiPolygon",
                        "coordinates": [
                            [[[5.0, 5.0], [6.0, 5.0], [6.0, 6.0], [5.0, 6.0]]],
                            [[[8.0, 8.0], [9.0, 8.0], [9.0, 9.0], [8.0, 9.0]]]
                        ]
                    },
                    "properties": {"cell_id": "split"}
                }
            ]
        });
        let grid = Grid::from_geojson(&value).unwrap();
        assert_eq!(grid.len(), 2);
        assert_eq!(locate(GeoPoint::new(0.0, 0.0), &grid), Some(CellId::from("hex")));
        assert_eq!(locate(GeoPoint::new(0.8, 0.9), &grid), None);
        assert_eq!(locate(GeoPoint::new(8.5, 8.5), &grid), Some(CellId::from("split")));
        assert_eq!(locate(GeoPoint::new(7.0, 7.0), &grid), None);
    }

    #[test]
    fn test_duplicate_cell_ids_rejected() {
        let value = json!({
            "type": "FeatureCollection",
            "features": [square("A", 0.0, 0.0, 1.0), square("A", 1.0, 0.0, 1.0)]
        });
        assert!(matches!(
            Grid::from_geojson(&value),
            Err(GridError::DuplicateCell(id)) if id.as_str() == "A"
        ));
    }

    #[test]
    fn test_invalid_features_rejected() {
        let not_collection = json!({"type": "Feature"});
        assert!(matches!(
            Grid::from_geojson(&not_collection),
            Err(GridError::NotAFeatureCollection)
        ));

        let missing_id = json!({
            "type": "FeatureCollection",
            "features": [{
                "type": "Feature",
                "geometry": {"type": "Polygon", "coordinates": [[[0, 0], [1, 0], [1, 1]]]},
                "properties": {}
            }]
        });
        assert!(matches!(
            Grid::from_geojson(&missing_id),
            Err(GridError::InvalidFeature { index: 0, .. })
        ));

        let point = json!({
            "type": "FeatureCollection",
            "features": [{
                "type": "Feature",
                "geometry": {"type": "Point", "coordinates": [0, 0]},
                "properties": {"cell_id": "p"}
            }]
        });
        assert!(matches!(
            Grid::from_geojson(&point),
            Err(GridError::InvalidFeature { index: 0, .. })
        ));
    }
}
