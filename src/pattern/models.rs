//! Per-user login pattern: bounded histories plus a last-login snapshot.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::geo::{self, GeoLocation};
use crate::pattern::history::BoundedHistory;

pub const COUNTRY_HISTORY_CAP: usize = 10;
pub const CITY_HISTORY_CAP: usize = 10;
pub const HOUR_HISTORY_CAP: usize = 24;
pub const DEVICE_TYPE_HISTORY_CAP: usize = 5;

/// Hours within this distance of a historical hour count as typical.
/// The 24-hour clock is treated as circular.
pub const HOUR_TOLERANCE: u8 = 2;

/// One successful login, reduced to the fields the pattern tracks.
#[derive(Clone, Debug, Default)]
pub struct LoginObservation {
    pub country: Option<String>,
    pub city: Option<String>,
    pub hour: u8,
    pub device_type: Option<String>,
    pub ip: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

/// Rolling summary of where, when, and with what a user usually logs in.
///
/// Created lazily on the first recorded login. Histories are bounded and
/// deduplicated; the last-login snapshot is overwritten unconditionally on
/// every recorded login, even when some fields are absent.
#[derive(Clone, Debug)]
pub struct LoginPattern {
    user_id: Uuid,
    countries: BoundedHistory<String>,
    cities: BoundedHistory<String>,
    hours: BoundedHistory<u8>,
    device_types: BoundedHistory<String>,
    last_login_at: Option<DateTime<Utc>>,
    last_ip: Option<String>,
    last_country: Option<String>,
    last_city: Option<String>,
    last_latitude: Option<f64>,
    last_longitude: Option<f64>,
    updated_at: Option<DateTime<Utc>>,
}

impl LoginPattern {
    #[must_use]
    pub fn new(user_id: Uuid) -> Self {
        Self {
            user_id,
            countries: BoundedHistory::new(COUNTRY_HISTORY_CAP),
            cities: BoundedHistory::new(CITY_HISTORY_CAP),
            hours: BoundedHistory::new(HOUR_HISTORY_CAP),
            device_types: BoundedHistory::new(DEVICE_TYPE_HISTORY_CAP),
            last_login_at: None,
            last_ip: None,
            last_country: None,
            last_city: None,
            last_latitude: None,
            last_longitude: None,
            updated_at: None,
        }
    }

    #[must_use]
    pub fn user_id(&self) -> Uuid {
        self.user_id
    }

    /// True until the first login is recorded. First logins suppress all
    /// risk signals: there is no baseline to compare against.
    #[must_use]
    pub fn is_first_login(&self) -> bool {
        self.last_login_at.is_none()
    }

    #[must_use]
    pub fn last_login_at(&self) -> Option<DateTime<Utc>> {
        self.last_login_at
    }

    #[must_use]
    pub fn last_coordinates(&self) -> Option<(f64, f64)> {
        Some((self.last_latitude?, self.last_longitude?))
    }

    #[must_use]
    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.updated_at
    }

    /// Fold one successful login into the histories, then overwrite the
    /// last-login snapshot unconditionally.
    pub fn record(&mut self, observation: &LoginObservation, at: DateTime<Utc>) {
        if let Some(country) = observation.country.as_deref() {
            self.countries.insert_str(country);
        }
        if let Some(city) = observation.city.as_deref() {
            self.cities.insert_str(city);
        }
        self.hours.insert(observation.hour % 24);
        if let Some(device_type) = observation.device_type.as_deref() {
            self.device_types.insert_str(device_type);
        }

        self.last_login_at = Some(at);
        self.last_ip = observation.ip.clone();
        self.last_country = observation.country.clone();
        self.last_city = observation.city.clone();
        self.last_latitude = observation.latitude;
        self.last_longitude = observation.longitude;
        self.updated_at = Some(at);
    }

    /// Empty history means no data, which is treated as typical.
    #[must_use]
    pub fn is_typical_country(&self, country: &str) -> bool {
        self.countries.is_empty() || self.countries.contains_str(country)
    }

    #[must_use]
    pub fn is_typical_city(&self, city: &str) -> bool {
        self.cities.is_empty() || self.cities.contains_str(city)
    }

    #[must_use]
    pub fn is_typical_device_type(&self, device_type: &str) -> bool {
        self.device_types.is_empty() || self.device_types.contains_str(device_type)
    }

    /// Circular ±[`HOUR_TOLERANCE`] match: 23:00 is typical for a user who
    /// logs in at 01:00.
    #[must_use]
    pub fn is_typical_hour(&self, hour: u8) -> bool {
        let hour = hour % 24;
        self.hours.is_empty()
            || self.hours.iter().any(|&known| {
                let diff = (i16::from(known) - i16::from(hour)).unsigned_abs();
                diff.min(24 - diff) <= u16::from(HOUR_TOLERANCE)
            })
    }

    /// Whether reaching `location` from the last-login snapshot would imply
    /// a travel speed above `max_speed_kmh`.
    ///
    /// Missing coordinates on either side, no prior login, and non-positive
    /// elapsed time (clock skew, out-of-order delivery) all count as
    /// plausible, never as impossible.
    #[must_use]
    pub fn impossible_travel(
        &self,
        location: &GeoLocation,
        at: DateTime<Utc>,
        max_speed_kmh: f64,
    ) -> bool {
        let Some(last_at) = self.last_login_at else {
            return false;
        };
        let Some(distance) = geo::distance_km(self.last_coordinates(), location.coordinates())
        else {
            return false;
        };

        let elapsed_ms = at.signed_duration_since(last_at).num_milliseconds();
        if elapsed_ms <= 0 {
            return false;
        }
        #[allow(clippy::cast_precision_loss)]
        let elapsed_hours = elapsed_ms as f64 / 3_600_000.0;

        distance / elapsed_hours > max_speed_kmh
    }

    pub(crate) fn snapshot(&self) -> PatternSnapshot {
        PatternSnapshot {
            user_id: self.user_id,
            countries: self.countries.items().to_vec(),
            cities: self.cities.items().to_vec(),
            hours: self.hours.items().to_vec(),
            device_types: self.device_types.items().to_vec(),
            last_login_at: self.last_login_at,
            last_ip: self.last_ip.clone(),
            last_country: self.last_country.clone(),
            last_city: self.last_city.clone(),
            last_latitude: self.last_latitude,
            last_longitude: self.last_longitude,
            updated_at: self.updated_at,
        }
    }

    pub(crate) fn from_snapshot(snapshot: PatternSnapshot) -> Self {
        Self {
            user_id: snapshot.user_id,
            countries: BoundedHistory::from_items(COUNTRY_HISTORY_CAP, snapshot.countries),
            cities: BoundedHistory::from_items(CITY_HISTORY_CAP, snapshot.cities),
            hours: BoundedHistory::from_items(HOUR_HISTORY_CAP, snapshot.hours),
            device_types: BoundedHistory::from_items(
                DEVICE_TYPE_HISTORY_CAP,
                snapshot.device_types,
            ),
            last_login_at: snapshot.last_login_at,
            last_ip: snapshot.last_ip,
            last_country: snapshot.last_country,
            last_city: snapshot.last_city,
            last_latitude: snapshot.last_latitude,
            last_longitude: snapshot.last_longitude,
            updated_at: snapshot.updated_at,
        }
    }
}

/// Flattened pattern state as the storage layer reads and writes it.
/// The serialized shape of the history lists is an implementation detail of
/// each store, not a contract.
#[derive(Clone, Debug)]
pub(crate) struct PatternSnapshot {
    pub user_id: Uuid,
    pub countries: Vec<String>,
    pub cities: Vec<String>,
    pub hours: Vec<u8>,
    pub device_types: Vec<String>,
    pub last_login_at: Option<DateTime<Utc>>,
    pub last_ip: Option<String>,
    pub last_country: Option<String>,
    pub last_city: Option<String>,
    pub last_latitude: Option<f64>,
    pub last_longitude: Option<f64>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, hour, 0, 0).unwrap()
    }

    fn observation(country: &str, city: &str, hour: u8) -> LoginObservation {
        LoginObservation {
            country: Some(country.to_string()),
            city: Some(city.to_string()),
            hour,
            device_type: Some("desktop".to_string()),
            ip: Some("203.0.113.7".to_string()),
            latitude: Some(52.52),
            longitude: Some(13.405),
        }
    }

    #[test]
    fn empty_history_is_typical() {
        let pattern = LoginPattern::new(Uuid::new_v4());
        assert!(pattern.is_typical_country("DE"));
        assert!(pattern.is_typical_city("Berlin"));
        assert!(pattern.is_typical_device_type("desktop"));
        assert!(pattern.is_typical_hour(3));
        assert!(pattern.is_first_login());
    }

    #[test]
    fn record_updates_histories_and_snapshot() {
        let mut pattern = LoginPattern::new(Uuid::new_v4());
        pattern.record(&observation("DE", "Berlin", 9), at(9));

        assert!(!pattern.is_first_login());
        assert!(pattern.is_typical_country("de"));
        assert!(pattern.is_typical_city("BERLIN"));
        assert!(!pattern.is_typical_country("FR"));
        assert_eq!(pattern.last_login_at(), Some(at(9)));
        assert_eq!(pattern.last_coordinates(), Some((52.52, 13.405)));
    }

    #[test]
    fn snapshot_overwritten_even_when_fields_absent() {
        let mut pattern = LoginPattern::new(Uuid::new_v4());
        pattern.record(&observation("DE", "Berlin", 9), at(9));
        pattern.record(
            &LoginObservation {
                hour: 10,
                ..LoginObservation::default()
            },
            at(10),
        );

        assert_eq!(pattern.last_coordinates(), None);
        assert_eq!(pattern.last_login_at(), Some(at(10)));
        // Histories keep the earlier observations.
        assert!(pattern.is_typical_country("DE"));
    }

    #[test]
    fn typical_hour_wraps_around_midnight() {
        let mut pattern = LoginPattern::new(Uuid::new_v4());
        pattern.record(&observation("DE", "Berlin", 23), at(23));

        assert!(pattern.is_typical_hour(23));
        assert!(pattern.is_typical_hour(1)); // 23 -> 1 is 2 hours across the wrap
        assert!(!pattern.is_typical_hour(12));
    }

    #[test]
    fn impossible_travel_threshold() {
        let mut pattern = LoginPattern::new(Uuid::new_v4());
        pattern.record(&observation("DE", "Berlin", 9), at(9));

        // ~1600 km east of Berlin at the same latitude.
        let far = GeoLocation {
            latitude: Some(52.52),
            longitude: Some(37.0),
            ..GeoLocation::empty()
        };
        assert!(pattern.impossible_travel(&far, at(10), 800.0));
        assert!(!pattern.impossible_travel(&far, at(12), 800.0));
    }

    #[test]
    fn impossible_travel_is_false_without_baseline_or_elapsed_time() {
        let pattern = LoginPattern::new(Uuid::new_v4());
        let here = GeoLocation {
            latitude: Some(52.52),
            longitude: Some(13.405),
            ..GeoLocation::empty()
        };
        assert!(!pattern.impossible_travel(&here, at(10), 800.0));

        let mut pattern = LoginPattern::new(Uuid::new_v4());
        pattern.record(&observation("DE", "Berlin", 9), at(9));
        let far = GeoLocation {
            latitude: Some(35.6762),
            longitude: Some(139.6503),
            ..GeoLocation::empty()
        };
        // Event delivered out of order: elapsed time is non-positive.
        assert!(!pattern.impossible_travel(&far, at(9), 800.0));
        assert!(!pattern.impossible_travel(&far, at(8), 800.0));
        // Missing coordinates on the new location are benign.
        assert!(!pattern.impossible_travel(&GeoLocation::empty(), at(10), 800.0));
    }

    #[test]
    fn snapshot_round_trip() {
        let mut pattern = LoginPattern::new(Uuid::new_v4());
        pattern.record(&observation("DE", "Berlin", 9), at(9));
        pattern.record(&observation("FR", "Paris", 14), at(14));

        let restored = LoginPattern::from_snapshot(pattern.snapshot());
        assert_eq!(restored.user_id(), pattern.user_id());
        assert!(restored.is_typical_country("FR"));
        assert!(restored.is_typical_city("Paris"));
        assert_eq!(restored.last_login_at(), pattern.last_login_at());
    }
}
