//! Additive, explainable risk scoring.

use chrono::{DateTime, Timelike, Utc};

use crate::geo::GeoLocation;
use crate::pattern::LoginPattern;
use crate::risk::policy::RiskPolicy;
use crate::risk::score::{RiskFactor, RiskScore, MAX_SCORE};
use crate::signals::DeviceInfo;

/// Everything the scorer looks at for one login attempt.
pub struct AttemptContext<'a> {
    /// Whether a device row already exists for `(user, device_id)`.
    pub device_is_known: bool,
    /// The user's rolling pattern; `None` when nothing was ever recorded.
    pub pattern: Option<&'a LoginPattern>,
    pub location: &'a GeoLocation,
    pub device_info: &'a DeviceInfo,
    pub at: DateTime<Utc>,
}

/// Outcome of re-checking an already-trusted device.
#[derive(Clone, Debug)]
pub struct SpoofingAssessment {
    pub suspicious: bool,
    pub risk: RiskScore,
}

/// Deterministic rule engine: additive factor weights with a cap, no
/// trained model anywhere.
#[derive(Clone, Debug)]
pub struct RiskScorer {
    policy: RiskPolicy,
}

impl RiskScorer {
    #[must_use]
    pub fn new(policy: RiskPolicy) -> Self {
        Self { policy }
    }

    #[must_use]
    pub fn policy(&self) -> &RiskPolicy {
        &self.policy
    }

    /// Score one login attempt against the user's pattern.
    ///
    /// A first-ever login short-circuits to zero: there is no baseline, and
    /// enrollment must not trip its own alarms.
    #[must_use]
    pub fn score_attempt(&self, ctx: &AttemptContext<'_>) -> RiskScore {
        let Some(pattern) = ctx.pattern.filter(|pattern| !pattern.is_first_login()) else {
            return RiskScore::none();
        };

        let mut factors = Vec::new();

        if !ctx.device_is_known {
            factors.push(RiskFactor::NewDevice);
        }

        // City only counts when the country itself is typical; an atypical
        // country already covers the location signal.
        if let Some(country) = ctx.location.country_key() {
            if !pattern.is_typical_country(country) {
                factors.push(RiskFactor::NewCountry);
            } else if let Some(city) = ctx.location.city.as_deref() {
                if !pattern.is_typical_city(city) {
                    factors.push(RiskFactor::NewCity);
                }
            }
        }

        if pattern.impossible_travel(ctx.location, ctx.at, self.policy.max_travel_speed_kmh()) {
            factors.push(RiskFactor::ImpossibleTravel);
        }

        #[allow(clippy::cast_possible_truncation)]
        let hour = ctx.at.hour() as u8;
        if !pattern.is_typical_hour(hour) {
            factors.push(RiskFactor::UnusualHour);
        }

        if let Some(device_type) = ctx.device_info.device_type.as_deref() {
            if !pattern.is_typical_device_type(device_type) {
                factors.push(RiskFactor::UnusualDeviceType);
            }
        }

        self.score_from_factors(factors)
    }

    /// Whether the score demands out-of-band approval before trusting the
    /// device.
    #[must_use]
    pub fn requires_approval(&self, score: &RiskScore) -> bool {
        self.policy.requires_approval(score.value())
    }

    /// Re-verification check for an already-trusted device.
    ///
    /// A trusted device presenting from a geographically implausible
    /// location, with a drifted device type, or with a different fingerprint
    /// points at token or cookie theft, not a legitimate new device. A
    /// suspicious assessment demotes the device back to pending approval.
    #[must_use]
    pub fn check_spoofing(
        &self,
        pattern: Option<&LoginPattern>,
        stored_device_type: Option<&str>,
        stored_fingerprint: Option<&str>,
        location: &GeoLocation,
        device_info: &DeviceInfo,
        fingerprint: Option<&str>,
        at: DateTime<Utc>,
    ) -> SpoofingAssessment {
        let mut factors = Vec::new();

        if let Some(pattern) = pattern {
            if pattern.impossible_travel(location, at, self.policy.max_travel_speed_kmh()) {
                factors.push(RiskFactor::ImpossibleTravel);
            }
        }

        if let (Some(stored), Some(current)) = (stored_device_type, device_info.device_type.as_deref())
        {
            if !stored.eq_ignore_ascii_case(current) {
                factors.push(RiskFactor::UnusualDeviceType);
            }
        }

        if let (Some(stored), Some(current)) = (stored_fingerprint, fingerprint) {
            if stored != current {
                factors.push(RiskFactor::FingerprintMismatch);
            }
        }

        let suspicious = !factors.is_empty();
        SpoofingAssessment {
            suspicious,
            risk: self.score_from_factors(factors),
        }
    }

    fn score_from_factors(&self, factors: Vec<RiskFactor>) -> RiskScore {
        let total: u32 = factors
            .iter()
            .map(|&factor| self.policy.weight(factor))
            .sum();
        let clamped = total.min(MAX_SCORE);
        RiskScore::new(clamped, self.policy.severity_for(clamped), factors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pattern::LoginObservation;
    use crate::risk::score::Severity;
    use chrono::TimeZone;
    use uuid::Uuid;

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 2, hour, 0, 0).unwrap()
    }

    fn established_pattern() -> LoginPattern {
        let mut pattern = LoginPattern::new(Uuid::new_v4());
        pattern.record(
            &LoginObservation {
                country: Some("DE".to_string()),
                city: Some("Berlin".to_string()),
                hour: 9,
                device_type: Some("desktop".to_string()),
                ip: Some("203.0.113.7".to_string()),
                latitude: Some(52.52),
                longitude: Some(13.405),
            },
            Utc.with_ymd_and_hms(2025, 6, 1, 9, 0, 0).unwrap(),
        );
        pattern
    }

    fn location(country: &str, city: &str) -> GeoLocation {
        GeoLocation {
            country_code: Some(country.to_string()),
            city: Some(city.to_string()),
            ..GeoLocation::empty()
        }
    }

    #[test]
    fn first_login_scores_zero() {
        let scorer = RiskScorer::new(RiskPolicy::new());
        let ctx = AttemptContext {
            device_is_known: false,
            pattern: None,
            location: &location("FR", "Paris"),
            device_info: &DeviceInfo::default(),
            at: at(3),
        };
        let score = scorer.score_attempt(&ctx);
        assert_eq!(score.value(), 0);
        assert_eq!(score.severity(), Severity::Low);
        assert!(score.factors().is_empty());
        assert!(!scorer.requires_approval(&score));

        // An empty pattern row behaves the same as no row at all.
        let empty = LoginPattern::new(Uuid::new_v4());
        let ctx = AttemptContext {
            pattern: Some(&empty),
            ..ctx
        };
        assert_eq!(scorer.score_attempt(&ctx).value(), 0);
    }

    #[test]
    fn new_device_from_new_country_requires_approval() {
        let scorer = RiskScorer::new(RiskPolicy::new());
        let pattern = established_pattern();
        let ctx = AttemptContext {
            device_is_known: false,
            pattern: Some(&pattern),
            location: &location("FR", "Paris"),
            device_info: &DeviceInfo {
                device_type: Some("desktop".to_string()),
                ..DeviceInfo::default()
            },
            at: at(9),
        };
        let score = scorer.score_attempt(&ctx);

        assert!(score.has_factor(RiskFactor::NewDevice));
        assert!(score.has_factor(RiskFactor::NewCountry));
        assert!(!score.has_factor(RiskFactor::NewCity));
        assert!(score.value() >= 55);
        assert!(scorer.requires_approval(&score));
    }

    #[test]
    fn new_city_only_counts_when_country_is_typical() {
        let scorer = RiskScorer::new(RiskPolicy::new());
        let pattern = established_pattern();
        let ctx = AttemptContext {
            device_is_known: true,
            pattern: Some(&pattern),
            location: &location("DE", "Munich"),
            device_info: &DeviceInfo::default(),
            at: at(9),
        };
        let score = scorer.score_attempt(&ctx);

        assert!(score.has_factor(RiskFactor::NewCity));
        assert!(!score.has_factor(RiskFactor::NewCountry));
        assert_eq!(score.value(), 10);
        assert!(!scorer.requires_approval(&score));
    }

    #[test]
    fn impossible_travel_pushes_past_the_threshold() {
        let scorer = RiskScorer::new(RiskPolicy::new());
        let pattern = established_pattern();
        // Tokyo one hour after a Berlin login.
        let tokyo = GeoLocation {
            country_code: Some("JP".to_string()),
            city: Some("Tokyo".to_string()),
            latitude: Some(35.6762),
            longitude: Some(139.6503),
            ..GeoLocation::empty()
        };
        let ctx = AttemptContext {
            device_is_known: true,
            pattern: Some(&pattern),
            location: &tokyo,
            device_info: &DeviceInfo::default(),
            at: Utc.with_ymd_and_hms(2025, 6, 1, 10, 0, 0).unwrap(),
        };
        let score = scorer.score_attempt(&ctx);

        assert!(score.has_factor(RiskFactor::ImpossibleTravel));
        assert!(scorer.requires_approval(&score));
    }

    #[test]
    fn unusual_hour_and_device_type_add_up() {
        let scorer = RiskScorer::new(RiskPolicy::new());
        let pattern = established_pattern();
        let ctx = AttemptContext {
            device_is_known: true,
            pattern: Some(&pattern),
            location: &location("DE", "Berlin"),
            device_info: &DeviceInfo {
                device_type: Some("tablet".to_string()),
                ..DeviceInfo::default()
            },
            at: at(3),
        };
        let score = scorer.score_attempt(&ctx);

        assert_eq!(
            score.factors(),
            &[RiskFactor::UnusualHour, RiskFactor::UnusualDeviceType]
        );
        assert_eq!(score.value(), 20);
    }

    #[test]
    fn missing_geodata_is_never_suspicious() {
        let scorer = RiskScorer::new(RiskPolicy::new());
        let pattern = established_pattern();
        let ctx = AttemptContext {
            device_is_known: true,
            pattern: Some(&pattern),
            location: &GeoLocation::empty(),
            device_info: &DeviceInfo::default(),
            at: at(9),
        };
        let score = scorer.score_attempt(&ctx);
        assert!(score.factors().is_empty());
    }

    #[test]
    fn spoofing_flags_travel_and_device_drift() {
        let scorer = RiskScorer::new(RiskPolicy::new());
        let pattern = established_pattern();
        let tokyo = GeoLocation {
            latitude: Some(35.6762),
            longitude: Some(139.6503),
            ..GeoLocation::empty()
        };
        let assessment = scorer.check_spoofing(
            Some(&pattern),
            Some("desktop"),
            Some("fp-a"),
            &tokyo,
            &DeviceInfo {
                device_type: Some("mobile".to_string()),
                ..DeviceInfo::default()
            },
            Some("fp-b"),
            Utc.with_ymd_and_hms(2025, 6, 1, 10, 0, 0).unwrap(),
        );

        assert!(assessment.suspicious);
        assert!(assessment.risk.has_factor(RiskFactor::ImpossibleTravel));
        assert!(assessment.risk.has_factor(RiskFactor::UnusualDeviceType));
        assert!(assessment.risk.has_factor(RiskFactor::FingerprintMismatch));
    }

    #[test]
    fn spoofing_clear_for_plausible_reuse() {
        let scorer = RiskScorer::new(RiskPolicy::new());
        let pattern = established_pattern();
        let nearby = GeoLocation {
            latitude: Some(52.52),
            longitude: Some(13.405),
            ..GeoLocation::empty()
        };
        let assessment = scorer.check_spoofing(
            Some(&pattern),
            Some("desktop"),
            Some("fp-a"),
            &nearby,
            &DeviceInfo {
                device_type: Some("desktop".to_string()),
                ..DeviceInfo::default()
            },
            Some("fp-a"),
            Utc.with_ymd_and_hms(2025, 6, 1, 10, 0, 0).unwrap(),
        );

        assert!(!assessment.suspicious);
        assert_eq!(assessment.risk.value(), 0);
    }
}
