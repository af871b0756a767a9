//! Risk score value object and its contributing factors.

use serde::{Deserialize, Serialize};

/// Scores are clamped to `0..=MAX_SCORE`.
pub const MAX_SCORE: u32 = 100;

/// Named, explainable signal that contributed to a score.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskFactor {
    NewDevice,
    NewCountry,
    NewCity,
    ImpossibleTravel,
    UnusualHour,
    UnusualDeviceType,
    FingerprintMismatch,
}

impl RiskFactor {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NewDevice => "new_device",
            Self::NewCountry => "new_country",
            Self::NewCity => "new_city",
            Self::ImpossibleTravel => "impossible_travel",
            Self::UnusualHour => "unusual_hour",
            Self::UnusualDeviceType => "unusual_device_type",
            Self::FingerprintMismatch => "fingerprint_mismatch",
        }
    }

    #[must_use]
    pub fn from_str(value: &str) -> Option<Self> {
        match value.trim() {
            "new_device" => Some(Self::NewDevice),
            "new_country" => Some(Self::NewCountry),
            "new_city" => Some(Self::NewCity),
            "impossible_travel" => Some(Self::ImpossibleTravel),
            "unusual_hour" => Some(Self::UnusualHour),
            "unusual_device_type" => Some(Self::UnusualDeviceType),
            "fingerprint_mismatch" => Some(Self::FingerprintMismatch),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl Severity {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

/// Outcome of scoring one login attempt: a clamped numeric score, its
/// severity band, and the ordered list of factors that produced it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RiskScore {
    value: u32,
    severity: Severity,
    factors: Vec<RiskFactor>,
}

impl RiskScore {
    #[must_use]
    pub(crate) fn new(value: u32, severity: Severity, factors: Vec<RiskFactor>) -> Self {
        Self {
            value: value.min(MAX_SCORE),
            severity,
            factors,
        }
    }

    /// A zero score with no factors, used when there is no baseline to
    /// compare against.
    #[must_use]
    pub fn none() -> Self {
        Self {
            value: 0,
            severity: Severity::Low,
            factors: Vec::new(),
        }
    }

    #[must_use]
    pub fn value(&self) -> u32 {
        self.value
    }

    #[must_use]
    pub fn severity(&self) -> Severity {
        self.severity
    }

    #[must_use]
    pub fn factors(&self) -> &[RiskFactor] {
        &self.factors
    }

    #[must_use]
    pub fn has_factor(&self, factor: RiskFactor) -> bool {
        self.factors.contains(&factor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn factor_names_round_trip() {
        let factors = [
            RiskFactor::NewDevice,
            RiskFactor::NewCountry,
            RiskFactor::NewCity,
            RiskFactor::ImpossibleTravel,
            RiskFactor::UnusualHour,
            RiskFactor::UnusualDeviceType,
            RiskFactor::FingerprintMismatch,
        ];
        for factor in factors {
            assert_eq!(RiskFactor::from_str(factor.as_str()), Some(factor));
        }
        assert_eq!(RiskFactor::from_str("totally_new_signal"), None);
    }

    #[test]
    fn severity_orders_low_to_high() {
        assert!(Severity::Low < Severity::Medium);
        assert!(Severity::Medium < Severity::High);
    }

    #[test]
    fn score_is_clamped() {
        let score = RiskScore::new(140, Severity::High, vec![RiskFactor::ImpossibleTravel]);
        assert_eq!(score.value(), MAX_SCORE);
    }

    #[test]
    fn none_score_is_low_and_factorless() {
        let score = RiskScore::none();
        assert_eq!(score.value(), 0);
        assert_eq!(score.severity(), Severity::Low);
        assert!(score.factors().is_empty());
    }
}
