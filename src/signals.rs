//! Login attempt value objects and the user-agent parser seam.

use serde::{Deserialize, Serialize};

use crate::geo::GeoLocation;

/// Parsed user-agent details.
///
/// Supplied by an external parser; every field is optional and refreshed on
/// each use of a device.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub browser: Option<String>,
    pub browser_version: Option<String>,
    pub os: Option<String>,
    pub os_version: Option<String>,
    pub device_type: Option<String>,
}

/// Parses a raw user-agent string into [`DeviceInfo`].
pub trait UserAgentParser: Send + Sync {
    fn parse(&self, user_agent: &str) -> DeviceInfo;
}

/// Parser that extracts nothing; every user agent yields empty device info.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullUserAgentParser;

impl UserAgentParser for NullUserAgentParser {
    fn parse(&self, _user_agent: &str) -> DeviceInfo {
        DeviceInfo::default()
    }
}

/// The device and network signals accompanying one login attempt.
///
/// Collected by the caller (request handlers own the geo lookup and the
/// user-agent parsing); the engine only consumes the resolved values.
#[derive(Clone, Debug, Default)]
pub struct LoginSignals {
    /// Stable per-device identifier, client- or server-generated.
    pub device_id: String,
    pub fingerprint: Option<String>,
    pub user_agent: Option<String>,
    pub ip: Option<String>,
    pub location: GeoLocation,
    pub device_info: DeviceInfo,
}

impl LoginSignals {
    #[must_use]
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_parser_yields_empty_info() {
        let info = NullUserAgentParser.parse("Mozilla/5.0 (X11; Linux x86_64)");
        assert_eq!(info, DeviceInfo::default());
    }

    #[test]
    fn signals_default_to_empty_location() {
        let signals = LoginSignals::new("device-1");
        assert_eq!(signals.device_id, "device-1");
        assert_eq!(signals.location, GeoLocation::empty());
        assert!(signals.ip.is_none());
    }
}
