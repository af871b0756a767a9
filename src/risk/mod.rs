//! Risk scoring: a deterministic, explainable rule engine over login
//! signals, with a dedicated re-verification check for trusted devices.

mod policy;
mod score;
mod scorer;

pub use policy::RiskPolicy;
pub use score::{RiskFactor, RiskScore, Severity, MAX_SCORE};
pub use scorer::{AttemptContext, RiskScorer, SpoofingAssessment};
