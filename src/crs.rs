//! Coordinate reference systems and UTM projection math.
//!
//! Records are stored in geographic WGS84 (`EPSG:4326`). Distance-based
//! clustering runs in a UTM zone so that epsilon is a ground distance in
//! meters. Projection uses the Krüger series to fourth order in the third
//! flattening, which is accurate to well under a millimeter inside a zone.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::BizmapError;

/// WGS84 semi-major axis in meters.
const WGS84_A: f64 = 6_378_137.0;
/// WGS84 flattening.
const WGS84_F: f64 = 1.0 / 298.257_223_563;
/// UTM central meridian scale factor.
const UTM_K0: f64 = 0.9996;
const UTM_FALSE_EASTING: f64 = 500_000.0;
const UTM_FALSE_NORTHING_SOUTH: f64 = 10_000_000.0;

/// A coordinate reference system this crate can read, write and project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Crs {
    /// Geographic WGS84 longitude/latitude in degrees (`EPSG:4326`).
    Wgs84,
    /// WGS84 / UTM zone, easting/northing in meters (`EPSG:326NN` / `EPSG:327NN`).
    Utm { zone: u8, north: bool },
}

impl Crs {
    /// UTM zone containing a geographic position.
    ///
    /// Uses the regular 6-degree grid; the Norway/Svalbard exceptions do not
    /// apply to any service area this crate targets.
    pub fn utm_for(longitude: f64, latitude: f64) -> Crs {
        let lon = if longitude >= 180.0 { longitude - 360.0 } else { longitude };
        let zone = (((lon + 180.0) / 6.0).floor() as i32 + 1).clamp(1, 60) as u8;
        Crs::Utm {
            zone,
            north: latitude >= 0.0,
        }
    }

    /// EPSG code of this CRS.
    pub fn epsg(&self) -> u32 {
        match *self {
            Crs::Wgs84 => 4326,
            Crs::Utm { zone, north: true } => 32600 + zone as u32,
            Crs::Utm { zone, north: false } => 32700 + zone as u32,
        }
    }

    /// Whether coordinates are planar meters.
    pub fn is_projected(&self) -> bool {
        matches!(self, Crs::Utm { .. })
    }

    /// Convert an `(x, y)` pair from `self` into `target`.
    ///
    /// Geographic pairs are `(longitude, latitude)`.
    pub fn transform(&self, target: &Crs, x: f64, y: f64) -> (f64, f64) {
        if self == target {
            return (x, y);
        }
        let (lon, lat) = match *self {
            Crs::Wgs84 => (x, y),
            Crs::Utm { zone, north } => utm_to_geographic(zone, north, x, y),
        };
        match *target {
            Crs::Wgs84 => (lon, lat),
            Crs::Utm { zone, north } => geographic_to_utm(zone, north, lon, lat),
        }
    }
}

impl Default for Crs {
    fn default() -> Self {
        Crs::Wgs84
    }
}

impl fmt::Display for Crs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EPSG:{}", self.epsg())
    }
}

impl FromStr for Crs {
    type Err = BizmapError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let unsupported = || BizmapError::UnsupportedCrs { crs: s.to_string() };
        let trimmed = s.trim();
        let code = trimmed
            .strip_prefix("EPSG:")
            .or_else(|| trimmed.strip_prefix("epsg:"))
            .unwrap_or(trimmed);
        let code: u32 = code.parse().map_err(|_| unsupported())?;
        match code {
            4326 => Ok(Crs::Wgs84),
            32601..=32660 => Ok(Crs::Utm {
                zone: (code - 32600) as u8,
                north: true,
            }),
            32701..=32760 => Ok(Crs::Utm {
                zone: (code - 32700) as u8,
                north: false,
            }),
            _ => Err(unsupported()),
        }
    }
}

// ============================================================================
// Transverse Mercator (Krüger series)
// ============================================================================

struct KruegerSeries {
    n: f64,
    /// Rectifying radius scaled by k0.
    k0_a: f64,
    alpha: [f64; 4],
    beta: [f64; 4],
    delta: [f64; 4],
}

impl KruegerSeries {
    fn wgs84() -> Self {
        let n = WGS84_F / (2.0 - WGS84_F);
        let n2 = n * n;
        let n3 = n2 * n;
        let n4 = n3 * n;
        let a = WGS84_A / (1.0 + n) * (1.0 + n2 / 4.0 + n4 / 64.0);
        Self {
            n,
            k0_a: UTM_K0 * a,
            alpha: [
                n / 2.0 - 2.0 * n2 / 3.0 + 5.0 * n3 / 16.0 + 41.0 * n4 / 180.0,
                13.0 * n2 / 48.0 - 3.0 * n3 / 5.0 + 557.0 * n4 / 1440.0,
                61.0 * n3 / 240.0 - 103.0 * n4 / 140.0,
                49561.0 * n4 / 161_280.0,
            ],
            beta: [
                n / 2.0 - 2.0 * n2 / 3.0 + 37.0 * n3 / 96.0 - n4 / 360.0,
                n2 / 48.0 + n3 / 15.0 - 437.0 * n4 / 1440.0,
                17.0 * n3 / 480.0 - 37.0 * n4 / 840.0,
                4397.0 * n4 / 161_280.0,
            ],
            delta: [
                2.0 * n - 2.0 * n2 / 3.0 - 2.0 * n3 + 116.0 * n4 / 45.0,
                7.0 * n2 / 3.0 - 8.0 * n3 / 5.0 - 227.0 * n4 / 45.0,
                56.0 * n3 / 15.0 - 136.0 * n4 / 35.0,
                4279.0 * n4 / 630.0,
            ],
        }
    }
}

#[inline]
fn central_meridian(zone: u8) -> f64 {
    (zone as f64 * 6.0 - 183.0).to_radians()
}

/// Project geographic degrees into UTM meters for a fixed zone.
pub fn geographic_to_utm(zone: u8, north: bool, longitude: f64, latitude: f64) -> (f64, f64) {
    let s = KruegerSeries::wgs84();
    let phi = latitude.to_radians();
    let dlambda = longitude.to_radians() - central_meridian(zone);

    let c = 2.0 * s.n.sqrt() / (1.0 + s.n);
    let sin_phi = phi.sin();
    let t = (sin_phi.atanh() - c * (c * sin_phi).atanh()).sinh();
    let xi_p = t.atan2(dlambda.cos());
    let eta_p = (dlambda.sin() / (1.0 + t * t).sqrt()).atanh();

    let mut xi = xi_p;
    let mut eta = eta_p;
    for (j, alpha) in s.alpha.iter().enumerate() {
        let k = 2.0 * (j as f64 + 1.0);
        xi += alpha * (k * xi_p).sin() * (k * eta_p).cosh();
        eta += alpha * (k * xi_p).cos() * (k * eta_p).sinh();
    }

    let easting = UTM_FALSE_EASTING + s.k0_a * eta;
    let false_northing = if north { 0.0 } else { UTM_FALSE_NORTHING_SOUTH };
    let northing = false_northing + s.k0_a * xi;
    (easting, northing)
}

/// Inverse of [`geographic_to_utm`]; returns `(longitude, latitude)` in degrees.
pub fn utm_to_geographic(zone: u8, north: bool, easting: f64, northing: f64) -> (f64, f64) {
    let s = KruegerSeries::wgs84();
    let false_northing = if north { 0.0 } else { UTM_FALSE_NORTHING_SOUTH };
    let xi = (northing - false_northing) / s.k0_a;
    let eta = (easting - UTM_FALSE_EASTING) / s.k0_a;

    let mut xi_p = xi;
    let mut eta_p = eta;
    for (j, beta) in s.beta.iter().enumerate() {
        let k = 2.0 * (j as f64 + 1.0);
        xi_p -= beta * (k * xi).sin() * (k * eta).cosh();
        eta_p -= beta * (k * xi).cos() * (k * eta).sinh();
    }

    let chi = (xi_p.sin() / eta_p.cosh()).asin();
    let mut phi = chi;
    for (j, delta) in s.delta.iter().enumerate() {
        let k = 2.0 * (j as f64 + 1.0);
        phi += delta * (k * chi).sin();
    }
    let lambda = central_meridian(zone) + eta_p.sinh().atan2(xi_p.cos());
    (lambda.to_degrees(), phi.to_degrees())
}
