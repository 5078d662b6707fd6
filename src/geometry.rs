//! WKT geometry codec.
//!
//! Writes wrap a bound WKT parameter in backend geometry constructors
//! (`ST_GeomFromText`, `ST_Force2D`, `ST_CurveToLine`, `ST_Transform`,
//! `ST_Multi`). Reads select geometry as WKT and clean it up on the client:
//! measured-dimension artifacts are scrubbed and, where the backend cannot
//! reproject itself, coordinates are transformed through a [`WktTransformer`].

use geo::{Coord, Geometry, MapCoords};
use proj4rs::proj::Proj;
use regex::Regex;
use std::str::FromStr;
use std::sync::OnceLock;
use wkt::types::{MultiLineString, MultiPoint, MultiPolygon};
use wkt::{ToWkt, TryFromWkt, Wkt};

use crate::{DatumError, Result};

/// SQL geometry functions of one backend. `None` means the backend has no
/// such function and the step is done on the WKT text instead (or skipped
/// for curves, which such backends store natively).
#[derive(Debug, Clone, Copy)]
pub struct GeometryFunctions {
    pub from_text: &'static str,
    pub as_text: &'static str,
    pub transform: &'static str,
    pub force_2d: Option<&'static str>,
    pub curve_to_line: Option<&'static str>,
    pub multi: Option<&'static str>,
}

pub const POSTGIS_FUNCTIONS: GeometryFunctions = GeometryFunctions {
    from_text: "ST_GeomFromText",
    as_text: "ST_AsText",
    transform: "ST_Transform",
    force_2d: Some("ST_Force2D"),
    curve_to_line: Some("ST_CurveToLine"),
    multi: Some("ST_Multi"),
};

pub const SDE_FUNCTIONS: GeometryFunctions = GeometryFunctions {
    from_text: "SDE.ST_GeomFromText",
    as_text: "SDE.ST_AsText",
    transform: "SDE.ST_Transform",
    force_2d: None,
    curve_to_line: None,
    multi: None,
};

/// An insertable geometry: `expr` references the placeholder that `wkt`
/// gets bound to.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedGeometry {
    pub expr: String,
    pub wkt: String,
}

fn nan_token() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\bnan\b").expect("valid NaN regex"))
}

fn measure_qualifier() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b([A-Za-z]+)\s+M\s*\(").expect("valid M qualifier regex"))
}

fn measure_placeholder() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\s+[-+]?(?:1\.#(?:QNAN|SNAN|IND|INF)\d*|nan)\b").expect("valid placeholder regex")
    })
}

/// Leading type keyword of a WKT string, upper-cased (`POLYGON`, `MULTIPOINT`...).
pub fn geometry_type(wkt: &str) -> Option<String> {
    let word: String = wkt
        .trim_start()
        .chars()
        .take_while(|c| c.is_ascii_alphabetic())
        .collect();
    if word.is_empty() {
        None
    } else {
        Some(word.to_ascii_uppercase())
    }
}

pub fn is_multi(geom_type: &str) -> bool {
    geom_type.trim().to_ascii_uppercase().starts_with("MULTI")
}

/// True for `NULL`-like input: blank text or any `... EMPTY` geometry.
pub fn is_empty(wkt: &str) -> bool {
    let trimmed = wkt.trim();
    trimmed.is_empty() || trimmed.to_ascii_uppercase().ends_with("EMPTY")
}

/// Literal used in place of a null geometry so the column keeps its type.
pub fn empty_literal(declared_type: Option<&str>) -> String {
    let kind = declared_type
        .map(|t| t.trim().to_ascii_uppercase())
        .filter(|t| !t.is_empty() && t != "GEOMETRY")
        .unwrap_or_else(|| "GEOMETRYCOLLECTION".to_string());
    format!("{} EMPTY", kind)
}

/// Whether single-part values must be promoted to fit a multi-part column,
/// judged from the first non-empty geometry of the batch.
pub fn needs_force_multi(declared_type: Option<&str>, sample_wkt: Option<&str>) -> bool {
    let declared_multi = declared_type.map(is_multi).unwrap_or(false);
    let sample_multi = sample_wkt
        .and_then(geometry_type)
        .map(|t| is_multi(&t) || t == "GEOMETRYCOLLECTION");
    match sample_multi {
        Some(sample_multi) => declared_multi && !sample_multi,
        None => false,
    }
}

pub fn has_nan_ordinate(wkt: &str) -> bool {
    nan_token().is_match(wkt)
}

pub fn is_curved(wkt: &str) -> bool {
    let upper = wkt.trim_start().to_ascii_uppercase();
    upper.contains("CURVE") || upper.starts_with("CIRC")
}

fn dimension_qualifier() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\b([A-Z]+)\s+(?:ZM|Z|M)\b\s*").expect("valid qualifier regex"))
}

fn extra_ordinates() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        let num = r"[-+]?(?:\d+(?:\.\d*)?|\.\d+)(?:[eE][-+]?\d+)?";
        Regex::new(&format!(r"({num})\s+({num})(?:\s+{num})+")).expect("valid ordinate regex")
    })
}

/// Drops dimension qualifiers and every ordinate past X and Y.
pub fn force_2d_wkt(wkt: &str) -> String {
    let trimmed = wkt.trim();
    if is_empty(trimmed) {
        return geometry_type(trimmed)
            .map(|kind| format!("{} EMPTY", kind))
            .unwrap_or_default();
    }
    match Geometry::<f64>::try_from_wkt_str(trimmed) {
        Ok(geom) => geom.wkt_string(),
        // curves have no `geo` representation
        Err(_) => {
            let unqualified = dimension_qualifier().replace_all(trimmed, "$1 ");
            extra_ordinates()
                .replace_all(&unqualified, "$1 $2")
                .into_owned()
        }
    }
}

/// Rewrites a single-part geometry as its multi-part equivalent, keeping its
/// dimension. Multi-part input and collections come back unchanged.
pub fn promote_to_multi_wkt(wkt: &str) -> String {
    let trimmed = wkt.trim();
    if is_empty(trimmed) || is_curved(trimmed) {
        return promote_text(trimmed);
    }
    match Wkt::<f64>::from_str(trimmed) {
        Ok(Wkt::Point(point)) => {
            let dim = point.dimension();
            Wkt::MultiPoint(MultiPoint::new(vec![point], dim)).to_string()
        }
        Ok(Wkt::LineString(line)) => {
            let dim = line.dimension();
            Wkt::MultiLineString(MultiLineString::new(vec![line], dim)).to_string()
        }
        Ok(Wkt::Polygon(polygon)) => {
            let dim = polygon.dimension();
            Wkt::MultiPolygon(MultiPolygon::new(vec![polygon], dim)).to_string()
        }
        Ok(_) | Err(_) => trimmed.to_string(),
    }
}

/// Renames the type keyword of empties and curves, which the `wkt` types
/// cannot wrap.
fn promote_text(wkt: &str) -> String {
    let Some(kind) = geometry_type(wkt) else {
        return wkt.to_string();
    };
    let multi_kind = match kind.as_str() {
        "POINT" | "LINESTRING" | "POLYGON" => format!("MULTI{}", kind),
        "COMPOUNDCURVE" | "CIRCULARSTRING" => "MULTICURVE".to_string(),
        "CURVEPOLYGON" => "MULTISURFACE".to_string(),
        _ => return wkt.to_string(),
    };

    let rest = wkt[kind.len()..].trim_start();
    match rest.find('(') {
        Some(open) => {
            let qualifier = rest[..open].trim();
            let body = &rest[open..];
            if qualifier.is_empty() {
                format!("{} ({})", multi_kind, body)
            } else {
                format!("{} {} ({})", multi_kind, qualifier, body)
            }
        }
        None => format!("{} {}", multi_kind, rest),
    }
}

/// Builds insertable geometry expressions for one backend.
#[derive(Debug, Clone, Copy)]
pub struct GeometryEncoder {
    funcs: GeometryFunctions,
}

impl GeometryEncoder {
    pub fn new(funcs: GeometryFunctions) -> Self {
        Self { funcs }
    }

    pub fn functions(&self) -> &GeometryFunctions {
        &self.funcs
    }

    /// Encodes `wkt` for insertion, applying in order: construct from text,
    /// 2D forcing of NaN ordinates, curve linearization, reprojection to
    /// `target_srid`, and multi-part promotion.
    pub fn encode(
        &self,
        placeholder: &str,
        wkt: &str,
        srid: Option<i32>,
        target_srid: Option<i32>,
        force_multi: bool,
    ) -> EncodedGeometry {
        let mut wkt = wkt.trim().to_string();
        let mut expr = match srid {
            Some(srid) => format!("{}({}, {})", self.funcs.from_text, placeholder, srid),
            None => format!("{}({})", self.funcs.from_text, placeholder),
        };

        if has_nan_ordinate(&wkt) {
            wkt = nan_token().replace_all(&wkt, "0").into_owned();
            match self.funcs.force_2d {
                Some(force_2d) => expr = format!("{}({})", force_2d, expr),
                None => wkt = force_2d_wkt(&wkt),
            }
        }

        if is_curved(&wkt) {
            if let Some(curve_to_line) = self.funcs.curve_to_line {
                expr = format!("{}({})", curve_to_line, expr);
            }
        }

        if let Some(target) = target_srid {
            if srid != Some(target) {
                expr = format!("{}({}, {})", self.funcs.transform, expr, target);
            }
        }

        if force_multi {
            match self.funcs.multi {
                Some(multi) => expr = format!("{}({})", multi, expr),
                None => wkt = promote_to_multi_wkt(&wkt),
            }
        }

        EncodedGeometry { expr, wkt }
    }

    /// Select-list expression returning the column as WKT, optionally
    /// reprojected on the server.
    pub fn wkt_selector(&self, column: &str, to_srid: Option<i32>) -> String {
        match to_srid {
            Some(srid) => format!(
                "{}({}({}, {}))",
                self.funcs.as_text, self.funcs.transform, column, srid
            ),
            None => format!("{}({})", self.funcs.as_text, column),
        }
    }
}

/// Removes the `M` qualifier and the not-a-number measure placeholders some
/// backends emit for linear-referencing geometries
/// (`POLYGON M ((1 2 1.#QNAN000, ...))`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MeasureScrub;

impl MeasureScrub {
    /// Decides once, from the column type and the first decoded value,
    /// whether every value of the result set needs scrubbing.
    pub fn detect(geom_type: Option<&str>, first_wkt: &str) -> Option<Self> {
        let declared_measured = geom_type
            .map(|t| {
                let t = t.trim().to_ascii_uppercase();
                t.ends_with(" M") || (t.ends_with('M') && !t.ends_with("ZM") && t != "GEOM")
            })
            .unwrap_or(false);
        if declared_measured || measure_qualifier().is_match(first_wkt) {
            Some(MeasureScrub)
        } else {
            None
        }
    }

    pub fn apply(&self, wkt: &str) -> String {
        let without_qualifier = measure_qualifier().replace_all(wkt, "$1 (");
        measure_placeholder()
            .replace_all(&without_qualifier, "")
            .into_owned()
    }
}

/// Reprojects WKT between spatial reference systems.
pub trait WktTransformer: Send + Sync {
    fn transform(&self, wkt: &str, from_srid: i32, to_srid: i32) -> Result<String>;
}

const WEB_MERCATOR: &str =
    "+proj=merc +a=6378137 +b=6378137 +lat_ts=0 +lon_0=0 +x_0=0 +y_0=0 +k=1 +units=m +no_defs";

/// Resolves an SRID as an EPSG code. Web Mercator and its legacy ESRI and
/// Google codes share one spherical definition.
fn projection(srid: i32) -> Result<Proj> {
    let parsed = match srid {
        3857 | 900913 | 102100 | 102113 => Proj::from_proj_string(WEB_MERCATOR),
        _ => {
            let code = u16::try_from(srid)
                .map_err(|_| DatumError::Transform(format!("unknown SRID {}", srid)))?;
            Proj::from_epsg_code(code)
        }
    };
    parsed.map_err(|e| DatumError::Transform(format!("EPSG:{}: {}", srid, e)))
}

/// Transformer backed by `proj4rs` and its bundled EPSG definitions.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProjTransformer;

impl WktTransformer for ProjTransformer {
    fn transform(&self, wkt: &str, from_srid: i32, to_srid: i32) -> Result<String> {
        if from_srid == to_srid || is_empty(wkt) {
            return Ok(wkt.to_string());
        }
        let from = projection(from_srid)?;
        let to = projection(to_srid)?;
        let (from_degrees, to_degrees) = (from.is_latlong(), to.is_latlong());

        let geom = Geometry::<f64>::try_from_wkt_str(wkt)
            .map_err(|e| DatumError::Transform(format!("cannot parse WKT: {}", e)))?;
        let projected = geom.try_map_coords(|c: Coord<f64>| -> Result<Coord<f64>> {
            let mut point = if from_degrees {
                (c.x.to_radians(), c.y.to_radians(), 0.0)
            } else {
                (c.x, c.y, 0.0)
            };
            proj4rs::transform::transform(&from, &to, &mut point).map_err(|e| {
                DatumError::Transform(format!(
                    "EPSG:{} to EPSG:{} failed at ({} {}): {}",
                    from_srid, to_srid, c.x, c.y, e
                ))
            })?;
            Ok(if to_degrees {
                Coord { x: point.0.to_degrees(), y: point.1.to_degrees() }
            } else {
                Coord { x: point.0, y: point.1 }
            })
        })?;
        Ok(projected.wkt_string())
    }
}
