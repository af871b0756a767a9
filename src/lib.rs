//! # Fidem (Risk-Based Device Trust Engine)
//!
//! `fidem` decides, per login attempt, whether a device/location combination
//! should be trusted immediately, challenged with an out-of-band approval
//! step, or flagged as likely credential theft.
//!
//! ## Decision Flow
//!
//! A login attempt supplies device and network signals. The pattern tracker
//! classifies how typical the attempt is for the user (countries, cities,
//! hours of day, device types) and whether the implied travel speed from the
//! last login is plausible. The scorer folds those signals into an additive,
//! explainable risk score; the decision is never a trained model, only a
//! configurable rule table.
//!
//! - **Trust immediately** — known trusted device, plausible reuse.
//! - **Challenge** — a pending device is issued a 256-bit link token plus an
//!   8-character human code, delivered out of band. Either secret, or an
//!   approval from an existing trusted session, resolves the request.
//! - **Re-verify** — an already-trusted device reused from an implausible
//!   location or with a drifted identity is demoted back to pending
//!   approval. Trust is per device and survives session revocation, so this
//!   demotion is the defense against stolen tokens and cookies.
//!
//! ## Secrets
//!
//! Approval secrets are stored only as SHA-256 hashes. The plaintexts are
//! returned once, wrapped in [`secrecy`] types, and handed to the delivery
//! seam; they never appear in logs or storage.
//!
//! ## Concurrency
//!
//! The engine runs synchronously inside each request. Races on a single
//! device row (competing code guesses, an approval resolving while a
//! spoofing check fires) are closed by status-guarded updates and atomic
//! counter increments at the storage layer; once any path resolves an
//! approval request, every competing request for that device is invalidated.

pub mod approval;
pub mod clock;
pub mod engine;
pub mod error;
pub mod geo;
pub mod pattern;
pub mod risk;
pub mod signals;
pub mod storage;
pub mod trust;

pub use approval::{ApprovalCoordinator, ApprovalDelivery, ApprovalNotifier, LogNotifier};
pub use clock::{Clock, FixedClock, SystemClock};
pub use engine::{LoginDecision, SpoofingOutcome, TrustEngine};
pub use error::{TrustError, TrustResult};
pub use geo::{GeoLocation, GeoLookup, NullGeoLookup};
pub use pattern::{LoginPattern, LoginPatternTracker, PatternRepo};
pub use risk::{RiskFactor, RiskPolicy, RiskScore, RiskScorer, Severity};
pub use signals::{DeviceInfo, LoginSignals, NullUserAgentParser, UserAgentParser};
pub use storage::{MemoryStore, PgStore};
pub use trust::{
    ApprovalRequest, ApprovalRequestStatus, Device, DeviceRepo, DeviceStatus, DeviceTrustStore,
    IssuedApproval, ResolutionChannel, TrustConfig,
};
