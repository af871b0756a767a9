//! Geodesic distance and the geo-lookup seam.

use serde::{Deserialize, Serialize};

/// Mean Earth radius in kilometers, as used by the Haversine formula.
pub const EARTH_RADIUS_KM: f64 = 6371.0;

/// Coarse location resolved from a client IP.
///
/// Every field is optional; an unknown address yields an empty location.
/// Missing geodata is treated as benign by all consumers, never as a signal.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GeoLocation {
    pub country: Option<String>,
    pub country_code: Option<String>,
    pub city: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

impl GeoLocation {
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Both coordinates, when present.
    #[must_use]
    pub fn coordinates(&self) -> Option<(f64, f64)> {
        Some((self.latitude?, self.longitude?))
    }

    /// The value used for country typicality: ISO code when known,
    /// otherwise the country name.
    #[must_use]
    pub fn country_key(&self) -> Option<&str> {
        self.country_code.as_deref().or(self.country.as_deref())
    }
}

/// Great-circle distance between two coordinate pairs, in kilometers.
///
/// Returns `None` when either pair is absent; the caller decides how to treat
/// missing geodata (by convention: not suspicious).
#[must_use]
pub fn distance_km(from: Option<(f64, f64)>, to: Option<(f64, f64)>) -> Option<f64> {
    let (lat1, lon1) = from?;
    let (lat2, lon2) = to?;

    let d_lat = (lat2 - lat1).to_radians();
    let d_lon = (lon2 - lon1).to_radians();
    let a = (d_lat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (d_lon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());

    Some(EARTH_RADIUS_KM * c)
}

/// Resolves a client IP to a coarse location.
///
/// Implementations never fail: an unknown or unparsable address resolves to
/// `GeoLocation::empty()`.
pub trait GeoLookup: Send + Sync {
    fn lookup(&self, ip: &str) -> GeoLocation;
}

/// Lookup that knows nothing; every address resolves to an empty location.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullGeoLookup;

impl GeoLookup for NullGeoLookup {
    fn lookup(&self, _ip: &str) -> GeoLocation {
        GeoLocation::empty()
    }
}
