//! Geometry values: GeoJSON decode/encode and the WKB binary codec.
//!
//! Coordinates are kept exactly as parsed (2- or 3-dimensional positions), so
//! re-marshaling a parsed geometry reproduces the input coordinate shape.

use serde_json::{json, Value as Json};

use super::{QueryError, Result};

/// A position is 2 or 3 doubles. All positions within one geometry must
/// share a dimension.
pub type Position = Vec<f64>;

/// Geometry union covering the GeoJSON types the store accepts.
#[derive(Clone, Debug, PartialEq)]
pub enum Geometry {
    /// Single position.
    Point(Position),
    /// Sequence of positions.
    LineString(Vec<Position>),
    /// Outer ring plus holes.
    Polygon(Vec<Vec<Position>>),
    /// Set of positions.
    MultiPoint(Vec<Position>),
    /// Set of line strings.
    MultiLineString(Vec<Vec<Position>>),
    /// Set of polygons.
    MultiPolygon(Vec<Vec<Vec<Position>>>),
}

const WKB_POINT: u32 = 1;
const WKB_LINESTRING: u32 = 2;
const WKB_POLYGON: u32 = 3;
const WKB_MULTIPOINT: u32 = 4;
const WKB_MULTILINESTRING: u32 = 5;
const WKB_MULTIPOLYGON: u32 = 6;
// ISO WKB offsets the type code by 1000 when positions carry a Z value.
const WKB_Z_OFFSET: u32 = 1000;

impl Geometry {
    /// Parses a GeoJSON geometry object. Single-quoted JSON (as produced by
    /// some clients) is normalized to standard form first.
    pub fn from_geojson(text: &str) -> Result<Geometry> {
        let text = text.trim();
        if text.is_empty() {
            return Err(QueryError::InvalidGeometry("empty input".into()));
        }
        let normalized;
        let text = if text.contains('\'') && !text.contains('"') {
            normalized = text.replace('\'', "\"");
            &normalized
        } else {
            text
        };
        let doc: Json = serde_json::from_str(text)
            .map_err(|e| QueryError::InvalidGeometry(format!("malformed json: {e}")))?;
        let obj = doc
            .as_object()
            .ok_or_else(|| QueryError::InvalidGeometry("expected a json object".into()))?;
        let ty = obj
            .get("type")
            .and_then(Json::as_str)
            .ok_or_else(|| QueryError::InvalidGeometry("missing geometry type".into()))?;
        let coords = obj
            .get("coordinates")
            .ok_or_else(|| QueryError::InvalidGeometry("missing coordinates".into()))?;
        let geom = match ty {
            "Point" => Geometry::Point(parse_position(coords)?),
            "LineString" => Geometry::LineString(parse_line(coords)?),
            "Polygon" => Geometry::Polygon(parse_rings(coords)?),
            "MultiPoint" => Geometry::MultiPoint(parse_line(coords)?),
            "MultiLineString" => Geometry::MultiLineString(parse_rings(coords)?),
            "MultiPolygon" => {
                let arr = as_array(coords)?;
                let polys = arr.iter().map(parse_rings).collect::<Result<Vec<_>>>()?;
                Geometry::MultiPolygon(polys)
            }
            other => {
                return Err(QueryError::InvalidGeometry(format!(
                    "unsupported geometry type {other:?}"
                )))
            }
        };
        geom.dimension()?;
        Ok(geom)
    }

    /// Renders the geometry back to GeoJSON text.
    pub fn to_geojson(&self) -> String {
        self.to_json().to_string()
    }

    /// GeoJSON form as a `serde_json` tree. Integral coordinates serialize
    /// as integers so the output matches common hand-written input.
    pub fn to_json(&self) -> Json {
        let (ty, coords) = match self {
            Geometry::Point(p) => ("Point", position_json(p)),
            Geometry::LineString(l) => ("LineString", line_json(l)),
            Geometry::Polygon(r) => ("Polygon", rings_json(r)),
            Geometry::MultiPoint(l) => ("MultiPoint", line_json(l)),
            Geometry::MultiLineString(r) => ("MultiLineString", rings_json(r)),
            Geometry::MultiPolygon(ps) => (
                "MultiPolygon",
                Json::Array(ps.iter().map(|p| rings_json(p)).collect()),
            ),
        };
        json!({ "type": ty, "coordinates": coords })
    }

    /// Shared position dimension (2 or 3). Ragged geometries are rejected.
    pub fn dimension(&self) -> Result<usize> {
        let mut dim = None;
        self.for_each_position(&mut |p| {
            let d = p.len();
            if d != 2 && d != 3 {
                return Err(QueryError::InvalidGeometry(format!(
                    "position has {d} ordinates"
                )));
            }
            match dim {
                None => {
                    dim = Some(d);
                    Ok(())
                }
                Some(prev) if prev == d => Ok(()),
                Some(_) => Err(QueryError::InvalidGeometry(
                    "mixed position dimensions".into(),
                )),
            }
        })?;
        dim.ok_or_else(|| QueryError::InvalidGeometry("geometry has no positions".into()))
    }

    fn for_each_position(&self, f: &mut dyn FnMut(&Position) -> Result<()>) -> Result<()> {
        match self {
            Geometry::Point(p) => f(p),
            Geometry::LineString(l) | Geometry::MultiPoint(l) => l.iter().try_for_each(|p| f(p)),
            Geometry::Polygon(r) | Geometry::MultiLineString(r) => {
                r.iter().flatten().try_for_each(|p| f(p))
            }
            Geometry::MultiPolygon(ps) => {
                ps.iter().flatten().flatten().try_for_each(|p| f(p))
            }
        }
    }

    /// Encodes the geometry as little-endian (ISO) WKB.
    pub fn to_wkb(&self) -> Result<Vec<u8>> {
        let dim = self.dimension()?;
        let mut out = Vec::new();
        self.write_wkb(dim, &mut out);
        Ok(out)
    }

    fn write_wkb(&self, dim: usize, out: &mut Vec<u8>) {
        out.push(1); // little endian
        let code = match self {
            Geometry::Point(_) => WKB_POINT,
            Geometry::LineString(_) => WKB_LINESTRING,
            Geometry::Polygon(_) => WKB_POLYGON,
            Geometry::MultiPoint(_) => WKB_MULTIPOINT,
            Geometry::MultiLineString(_) => WKB_MULTILINESTRING,
            Geometry::MultiPolygon(_) => WKB_MULTIPOLYGON,
        };
        let code = if dim == 3 { code + WKB_Z_OFFSET } else { code };
        out.extend_from_slice(&code.to_le_bytes());
        match self {
            Geometry::Point(p) => write_position(p, out),
            Geometry::LineString(l) => write_line(l, out),
            Geometry::Polygon(rings) => {
                out.extend_from_slice(&(rings.len() as u32).to_le_bytes());
                for ring in rings {
                    write_line(ring, out);
                }
            }
            Geometry::MultiPoint(points) => {
                out.extend_from_slice(&(points.len() as u32).to_le_bytes());
                for p in points {
                    Geometry::Point(p.clone()).write_wkb(dim, out);
                }
            }
            Geometry::MultiLineString(lines) => {
                out.extend_from_slice(&(lines.len() as u32).to_le_bytes());
                for l in lines {
                    Geometry::LineString(l.clone()).write_wkb(dim, out);
                }
            }
            Geometry::MultiPolygon(polys) => {
                out.extend_from_slice(&(polys.len() as u32).to_le_bytes());
                for p in polys {
                    Geometry::Polygon(p.clone()).write_wkb(dim, out);
                }
            }
        }
    }

    /// Decodes a WKB byte string produced by [`Geometry::to_wkb`].
    pub fn from_wkb(bytes: &[u8]) -> Result<Geometry> {
        let mut reader = WkbReader { bytes, pos: 0 };
        let geom = reader.read_geometry()?;
        if reader.pos != bytes.len() {
            return Err(QueryError::InvalidGeometry("trailing bytes in wkb".into()));
        }
        Ok(geom)
    }
}

fn as_array(v: &Json) -> Result<&Vec<Json>> {
    v.as_array()
        .ok_or_else(|| QueryError::InvalidGeometry("expected a coordinate array".into()))
}

fn parse_position(v: &Json) -> Result<Position> {
    let arr = as_array(v)?;
    arr.iter()
        .map(|n| {
            n.as_f64()
                .ok_or_else(|| QueryError::InvalidGeometry("non-numeric ordinate".into()))
        })
        .collect()
}

fn parse_line(v: &Json) -> Result<Vec<Position>> {
    as_array(v)?.iter().map(parse_position).collect()
}

fn parse_rings(v: &Json) -> Result<Vec<Vec<Position>>> {
    as_array(v)?.iter().map(parse_line).collect()
}

fn ordinate_json(f: f64) -> Json {
    if f.fract() == 0.0 && f.abs() < 9.0e15 {
        Json::from(f as i64)
    } else {
        Json::from(f)
    }
}

fn position_json(p: &Position) -> Json {
    Json::Array(p.iter().copied().map(ordinate_json).collect())
}

fn line_json(l: &[Position]) -> Json {
    Json::Array(l.iter().map(|p| position_json(p)).collect())
}

fn rings_json(r: &[Vec<Position>]) -> Json {
    Json::Array(r.iter().map(|l| line_json(l)).collect())
}

fn write_position(p: &Position, out: &mut Vec<u8>) {
    for v in p {
        out.extend_from_slice(&v.to_le_bytes());
    }
}

fn write_line(l: &[Position], out: &mut Vec<u8>) {
    out.extend_from_slice(&(l.len() as u32).to_le_bytes());
    for p in l {
        write_position(p, out);
    }
}

struct WkbReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl WkbReader<'_> {
    fn take(&mut self, n: usize) -> Result<&[u8]> {
        if self.pos + n > self.bytes.len() {
            return Err(QueryError::InvalidGeometry("truncated wkb".into()));
        }
        let s = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    fn read_u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn read_f64(&mut self) -> Result<f64> {
        let b = self.take(8)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(b);
        Ok(f64::from_le_bytes(buf))
    }

    fn read_position(&mut self, dim: usize) -> Result<Position> {
        (0..dim).map(|_| self.read_f64()).collect()
    }

    fn read_line(&mut self, dim: usize) -> Result<Vec<Position>> {
        let n = self.read_u32()? as usize;
        (0..n).map(|_| self.read_position(dim)).collect()
    }

    fn read_rings(&mut self, dim: usize) -> Result<Vec<Vec<Position>>> {
        let n = self.read_u32()? as usize;
        (0..n).map(|_| self.read_line(dim)).collect()
    }

    fn read_geometry(&mut self) -> Result<Geometry> {
        let order = self.take(1)?[0];
        if order != 1 {
            return Err(QueryError::InvalidGeometry(format!(
                "unsupported wkb byte order {order}"
            )));
        }
        let raw = self.read_u32()?;
        let (code, dim) = if raw > WKB_Z_OFFSET {
            (raw - WKB_Z_OFFSET, 3)
        } else {
            (raw, 2)
        };
        match code {
            WKB_POINT => Ok(Geometry::Point(self.read_position(dim)?)),
            WKB_LINESTRING => Ok(Geometry::LineString(self.read_line(dim)?)),
            WKB_POLYGON => Ok(Geometry::Polygon(self.read_rings(dim)?)),
            WKB_MULTIPOINT => {
                let n = self.read_u32()? as usize;
                let mut points = Vec::with_capacity(n);
                for _ in 0..n {
                    match self.read_geometry()? {
                        Geometry::Point(p) => points.push(p),
                        _ => {
                            return Err(QueryError::InvalidGeometry(
                                "multipoint member is not a point".into(),
                            ))
                        }
                    }
                }
                Ok(Geometry::MultiPoint(points))
            }
            WKB_MULTILINESTRING => {
                let n = self.read_u32()? as usize;
                let mut lines = Vec::with_capacity(n);
                for _ in 0..n {
                    match self.read_geometry()? {
                        Geometry::LineString(l) => lines.push(l),
                        _ => {
                            return Err(QueryError::InvalidGeometry(
                                "multilinestring member is not a linestring".into(),
                            ))
                        }
                    }
                }
                Ok(Geometry::MultiLineString(lines))
            }
            WKB_MULTIPOLYGON => {
                let n = self.read_u32()? as usize;
                let mut polys = Vec::with_capacity(n);
                for _ in 0..n {
                    match self.read_geometry()? {
                        Geometry::Polygon(p) => polys.push(p),
                        _ => {
                            return Err(QueryError::InvalidGeometry(
                                "multipolygon member is not a polygon".into(),
                            ))
                        }
                    }
                }
                Ok(Geometry::MultiPolygon(polys))
            }
            other => Err(QueryError::InvalidGeometry(format!(
                "unknown wkb type code {other}"
            ))),
        }
    }
}
