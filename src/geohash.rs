//! Spatial hash codec and great-circle distance.
//!
//! Cluster keys are fixed-precision base-32 strings produced by iterative
//! binary subdivision of the lat/lng bounding box, alternating longitude and
//! latitude bits (standard geohash bit order). Decoding returns the midpoint
//! of the final cell, an approximation of the encoded point rather than the
//! original coordinates.
//!
//! Clustering itself never compares hash prefixes: nearby points usually
//! share a long prefix, but points straddling a cell edge do not, so the
//! cluster manager always measures real haversine distance between decoded
//! centers.

use once_cell::sync::Lazy;

use crate::error::{Result, SentinelError};
use crate::GpsPoint;

/// Earth radius used for haversine distances, in kilometers.
pub const EARTH_RADIUS_KM: f64 = 6371.0;

/// Base-32 alphabet used by the geohash encoding (no a, i, l, o).
const BASE32: &[u8; 32] = b"0123456789bcdefghjkmnpqrstuvwxyz";

/// Reverse lookup table: byte -> alphabet index, -1 for invalid bytes.
static BASE32_INDEX: Lazy<[i8; 256]> = Lazy::new(|| {
    let mut table = [-1i8; 256];
    for (i, &c) in BASE32.iter().enumerate() {
        table[c as usize] = i as i8;
    }
    table
});

/// Encode a coordinate into a base-32 spatial hash of `precision` characters.
///
/// Deterministic: the same input always yields the same hash.
///
/// # Example
/// ```
/// use route_sentinel::geohash::encode;
/// let hash = encode(28.61, 77.20, 9);
/// assert_eq!(hash.len(), 9);
/// assert_eq!(hash, encode(28.61, 77.20, 9));
/// ```
pub fn encode(latitude: f64, longitude: f64, precision: usize) -> String {
    let mut hash = String::with_capacity(precision);
    let (mut lat_min, mut lat_max) = (-90.0f64, 90.0f64);
    let (mut lng_min, mut lng_max) = (-180.0f64, 180.0f64);

    let mut idx: usize = 0;
    let mut bit = 0;
    let mut even_bit = true;

    while hash.len() < precision {
        if even_bit {
            let mid = (lng_min + lng_max) / 2.0;
            if longitude >= mid {
                idx = idx * 2 + 1;
                lng_min = mid;
            } else {
                idx *= 2;
                lng_max = mid;
            }
        } else {
            let mid = (lat_min + lat_max) / 2.0;
            if latitude >= mid {
                idx = idx * 2 + 1;
                lat_min = mid;
            } else {
                idx *= 2;
                lat_max = mid;
            }
        }
        even_bit = !even_bit;

        bit += 1;
        if bit == 5 {
            hash.push(BASE32[idx] as char);
            bit = 0;
            idx = 0;
        }
    }

    hash
}

/// Decode a spatial hash back to the center of its cell.
///
/// Returns [`SentinelError::InvalidGeohash`] for empty input or characters
/// outside the base-32 alphabet.
pub fn decode(hash: &str) -> Result<GpsPoint> {
    if hash.is_empty() {
        return Err(SentinelError::InvalidGeohash {
            hash: hash.to_string(),
            message: "empty hash".to_string(),
        });
    }

    let (mut lat_min, mut lat_max) = (-90.0f64, 90.0f64);
    let (mut lng_min, mut lng_max) = (-180.0f64, 180.0f64);
    let mut even_bit = true;

    for c in hash.bytes() {
        let idx = BASE32_INDEX[c as usize];
        if idx < 0 {
            return Err(SentinelError::InvalidGeohash {
                hash: hash.to_string(),
                message: format!("invalid character '{}'", c as char),
            });
        }

        for n in (0..5).rev() {
            let bit = (idx >> n) & 1;
            if even_bit {
                let mid = (lng_min + lng_max) / 2.0;
                if bit == 1 {
                    lng_min = mid;
                } else {
                    lng_max = mid;
                }
            } else {
                let mid = (lat_min + lat_max) / 2.0;
                if bit == 1 {
                    lat_min = mid;
                } else {
                    lat_max = mid;
                }
            }
            even_bit = !even_bit;
        }
    }

    Ok(GpsPoint::new(
        (lat_min + lat_max) / 2.0,
        (lng_min + lng_max) / 2.0,
    ))
}

/// Haversine great-circle distance between two points, in kilometers.
pub fn haversine_km(a: &GpsPoint, b: &GpsPoint) -> f64 {
    let d_lat = (b.latitude - a.latitude).to_radians();
    let d_lng = (b.longitude - a.longitude).to_radians();

    let h = (d_lat / 2.0).sin().powi(2)
        + a.latitude.to_radians().cos()
            * b.latitude.to_radians().cos()
            * (d_lng / 2.0).sin().powi(2);

    let c = 2.0 * h.sqrt().atan2((1.0 - h).sqrt());
    EARTH_RADIUS_KM * c
}
