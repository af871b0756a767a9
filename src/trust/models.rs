//! Device aggregate, its approval state machine, and the approval-request
//! ledger.

use anyhow::bail;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{TrustError, TrustResult};
use crate::risk::RiskFactor;
use crate::signals::LoginSignals;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceStatus {
    PendingApproval,
    Trusted,
    Revoked,
}

impl DeviceStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PendingApproval => "pending_approval",
            Self::Trusted => "trusted",
            Self::Revoked => "revoked",
        }
    }

    #[must_use]
    pub fn from_str(value: &str) -> Option<Self> {
        match value.trim() {
            "pending_approval" => Some(Self::PendingApproval),
            "trusted" => Some(Self::Trusted),
            "revoked" => Some(Self::Revoked),
            _ => None,
        }
    }
}

/// Secrets and counters that exist only while a device awaits approval.
///
/// Holding them in an `Option` on [`Device`] makes the invariant structural:
/// a trusted or revoked device cannot carry approval secrets.
#[derive(Clone, Debug, PartialEq)]
pub struct ApprovalState {
    pub(crate) token_hash: Vec<u8>,
    pub(crate) code_hash: Vec<u8>,
    pub(crate) expires_at: DateTime<Utc>,
    pub(crate) attempts: i32,
    pub(crate) risk_score: u32,
    pub(crate) risk_factors: Vec<RiskFactor>,
}

impl ApprovalState {
    #[must_use]
    pub fn token_hash(&self) -> &[u8] {
        &self.token_hash
    }

    #[must_use]
    pub fn code_hash(&self) -> &[u8] {
        &self.code_hash
    }

    #[must_use]
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    #[must_use]
    pub fn attempts(&self) -> i32 {
        self.attempts
    }

    #[must_use]
    pub fn risk_score(&self) -> u32 {
        self.risk_score
    }

    #[must_use]
    pub fn risk_factors(&self) -> &[RiskFactor] {
        &self.risk_factors
    }
}

/// One physical device of one user. Aggregate root: all mutation goes
/// through the transition methods, so invalid states are unrepresentable.
///
/// `(user_id, device_id)` is unique; one record per physical device per
/// user. Records are never deleted here; revocation is terminal.
#[derive(Clone, Debug)]
pub struct Device {
    user_id: Uuid,
    device_id: String,
    fingerprint: Option<String>,
    browser: Option<String>,
    browser_version: Option<String>,
    os: Option<String>,
    os_version: Option<String>,
    device_type: Option<String>,
    user_agent: Option<String>,
    ip: Option<String>,
    country: Option<String>,
    city: Option<String>,
    latitude: Option<f64>,
    longitude: Option<f64>,
    status: DeviceStatus,
    created_at: DateTime<Utc>,
    trusted_at: Option<DateTime<Utc>>,
    revoked_at: Option<DateTime<Utc>>,
    last_used_at: Option<DateTime<Utc>>,
    approval: Option<ApprovalState>,
}

impl Device {
    /// New device awaiting out-of-band approval.
    #[must_use]
    pub(crate) fn create_pending(
        user_id: Uuid,
        signals: &LoginSignals,
        approval: ApprovalState,
        now: DateTime<Utc>,
    ) -> Self {
        let mut device = Self::bare(user_id, signals, now);
        device.status = DeviceStatus::PendingApproval;
        device.approval = Some(approval);
        device
    }

    /// New device trusted immediately, for flows already verified by other
    /// means (first-time login after signup verification).
    #[must_use]
    pub(crate) fn create_trusted(
        user_id: Uuid,
        signals: &LoginSignals,
        now: DateTime<Utc>,
    ) -> Self {
        let mut device = Self::bare(user_id, signals, now);
        device.status = DeviceStatus::Trusted;
        device.trusted_at = Some(now);
        device.last_used_at = Some(now);
        device
    }

    fn bare(user_id: Uuid, signals: &LoginSignals, now: DateTime<Utc>) -> Self {
        Self {
            user_id,
            device_id: signals.device_id.clone(),
            fingerprint: signals.fingerprint.clone(),
            browser: signals.device_info.browser.clone(),
            browser_version: signals.device_info.browser_version.clone(),
            os: signals.device_info.os.clone(),
            os_version: signals.device_info.os_version.clone(),
            device_type: signals.device_info.device_type.clone(),
            user_agent: signals.user_agent.clone(),
            ip: signals.ip.clone(),
            country: signals.location.country_key().map(str::to_string),
            city: signals.location.city.clone(),
            latitude: signals.location.latitude,
            longitude: signals.location.longitude,
            status: DeviceStatus::PendingApproval,
            created_at: now,
            trusted_at: None,
            revoked_at: None,
            last_used_at: None,
            approval: None,
        }
    }

    /// PendingApproval -> Trusted. Approval secrets never outlive their
    /// purpose: they are cleared here.
    pub(crate) fn mark_trusted(&mut self, now: DateTime<Utc>) -> TrustResult<()> {
        match self.status {
            DeviceStatus::PendingApproval => {
                self.status = DeviceStatus::Trusted;
                self.trusted_at = Some(now);
                self.approval = None;
                Ok(())
            }
            DeviceStatus::Trusted | DeviceStatus::Revoked => {
                Err(TrustError::DeviceAlreadyResolved)
            }
        }
    }

    /// PendingApproval/Trusted -> Revoked. Terminal.
    pub(crate) fn revoke(&mut self, now: DateTime<Utc>) -> TrustResult<()> {
        match self.status {
            DeviceStatus::PendingApproval | DeviceStatus::Trusted => {
                self.status = DeviceStatus::Revoked;
                self.revoked_at = Some(now);
                self.approval = None;
                Ok(())
            }
            DeviceStatus::Revoked => Err(TrustError::DeviceAlreadyResolved),
        }
    }

    /// Re-enter PendingApproval with fresh secrets and a reset attempt
    /// counter. Covers the spoofing demotion of a trusted device and the
    /// re-issue of secrets for a device still pending.
    pub(crate) fn reset_to_pending(
        &mut self,
        approval: ApprovalState,
        _now: DateTime<Utc>,
    ) -> TrustResult<()> {
        match self.status {
            DeviceStatus::PendingApproval | DeviceStatus::Trusted => {
                self.status = DeviceStatus::PendingApproval;
                self.trusted_at = None;
                self.approval = Some(approval);
                Ok(())
            }
            DeviceStatus::Revoked => Err(TrustError::Conflict),
        }
    }

    /// Refresh descriptive fields from the latest signals and stamp
    /// `last_used_at`. Fields the new signals do not carry keep their
    /// previous values.
    pub(crate) fn refresh_metadata(&mut self, signals: &LoginSignals, now: DateTime<Utc>) {
        if signals.fingerprint.is_some() {
            self.fingerprint = signals.fingerprint.clone();
        }
        if signals.device_info.browser.is_some() {
            self.browser = signals.device_info.browser.clone();
            self.browser_version = signals.device_info.browser_version.clone();
        }
        if signals.device_info.os.is_some() {
            self.os = signals.device_info.os.clone();
            self.os_version = signals.device_info.os_version.clone();
        }
        if signals.device_info.device_type.is_some() {
            self.device_type = signals.device_info.device_type.clone();
        }
        if signals.user_agent.is_some() {
            self.user_agent = signals.user_agent.clone();
        }
        if signals.ip.is_some() {
            self.ip = signals.ip.clone();
        }
        if signals.location.country_key().is_some() {
            self.country = signals.location.country_key().map(str::to_string);
        }
        if signals.location.city.is_some() {
            self.city = signals.location.city.clone();
        }
        if signals.location.coordinates().is_some() {
            self.latitude = signals.location.latitude;
            self.longitude = signals.location.longitude;
        }
        self.last_used_at = Some(now);
    }

    /// Expiry is evaluated at read time; no background sweep is needed for
    /// correctness.
    #[must_use]
    pub fn is_approval_expired(&self, now: DateTime<Utc>) -> bool {
        self.approval
            .as_ref()
            .is_some_and(|approval| now > approval.expires_at)
    }

    #[must_use]
    pub fn user_id(&self) -> Uuid {
        self.user_id
    }

    #[must_use]
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    #[must_use]
    pub fn fingerprint(&self) -> Option<&str> {
        self.fingerprint.as_deref()
    }

    #[must_use]
    pub fn device_type(&self) -> Option<&str> {
        self.device_type.as_deref()
    }

    #[must_use]
    pub fn status(&self) -> DeviceStatus {
        self.status
    }

    #[must_use]
    pub fn is_trusted(&self) -> bool {
        self.status == DeviceStatus::Trusted
    }

    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    #[must_use]
    pub fn trusted_at(&self) -> Option<DateTime<Utc>> {
        self.trusted_at
    }

    #[must_use]
    pub fn revoked_at(&self) -> Option<DateTime<Utc>> {
        self.revoked_at
    }

    #[must_use]
    pub fn last_used_at(&self) -> Option<DateTime<Utc>> {
        self.last_used_at
    }

    #[must_use]
    pub fn approval(&self) -> Option<&ApprovalState> {
        self.approval.as_ref()
    }

    pub(crate) fn set_attempts(&mut self, attempts: i32) {
        if let Some(approval) = self.approval.as_mut() {
            approval.attempts = attempts;
        }
    }

    pub(crate) fn snapshot(&self) -> DeviceSnapshot {
        let approval = self.approval.as_ref();
        DeviceSnapshot {
            user_id: self.user_id,
            device_id: self.device_id.clone(),
            fingerprint: self.fingerprint.clone(),
            browser: self.browser.clone(),
            browser_version: self.browser_version.clone(),
            os: self.os.clone(),
            os_version: self.os_version.clone(),
            device_type: self.device_type.clone(),
            user_agent: self.user_agent.clone(),
            ip: self.ip.clone(),
            country: self.country.clone(),
            city: self.city.clone(),
            latitude: self.latitude,
            longitude: self.longitude,
            status: self.status,
            created_at: self.created_at,
            trusted_at: self.trusted_at,
            revoked_at: self.revoked_at,
            last_used_at: self.last_used_at,
            approval_token_hash: approval.map(|a| a.token_hash.clone()),
            approval_code_hash: approval.map(|a| a.code_hash.clone()),
            approval_expires_at: approval.map(|a| a.expires_at),
            approval_attempts: approval.map_or(0, |a| a.attempts),
            risk_score: approval.map(|a| a.risk_score),
            risk_factors: approval.map(|a| a.risk_factors.clone()),
        }
    }

    /// Rehydrate from storage, enforcing the approval-field invariant:
    /// secrets are present iff the device is pending approval.
    pub(crate) fn from_snapshot(snapshot: DeviceSnapshot) -> anyhow::Result<Self> {
        let approval = match (
            snapshot.status,
            snapshot.approval_token_hash,
            snapshot.approval_code_hash,
            snapshot.approval_expires_at,
        ) {
            (DeviceStatus::PendingApproval, Some(token_hash), Some(code_hash), Some(expires_at)) => {
                Some(ApprovalState {
                    token_hash,
                    code_hash,
                    expires_at,
                    attempts: snapshot.approval_attempts,
                    risk_score: snapshot.risk_score.unwrap_or(0),
                    risk_factors: snapshot.risk_factors.unwrap_or_default(),
                })
            }
            (DeviceStatus::PendingApproval, ..) => {
                bail!(
                    "pending device {}/{} is missing approval fields",
                    snapshot.user_id,
                    snapshot.device_id
                )
            }
            (_, None, None, None) => None,
            _ => bail!(
                "device {}/{} holds approval fields outside pending_approval",
                snapshot.user_id,
                snapshot.device_id
            ),
        };

        Ok(Self {
            user_id: snapshot.user_id,
            device_id: snapshot.device_id,
            fingerprint: snapshot.fingerprint,
            browser: snapshot.browser,
            browser_version: snapshot.browser_version,
            os: snapshot.os,
            os_version: snapshot.os_version,
            device_type: snapshot.device_type,
            user_agent: snapshot.user_agent,
            ip: snapshot.ip,
            country: snapshot.country,
            city: snapshot.city,
            latitude: snapshot.latitude,
            longitude: snapshot.longitude,
            status: snapshot.status,
            created_at: snapshot.created_at,
            trusted_at: snapshot.trusted_at,
            revoked_at: snapshot.revoked_at,
            last_used_at: snapshot.last_used_at,
            approval,
        })
    }
}

/// Flattened device row as the storage layer reads and writes it.
#[derive(Clone, Debug)]
pub(crate) struct DeviceSnapshot {
    pub user_id: Uuid,
    pub device_id: String,
    pub fingerprint: Option<String>,
    pub browser: Option<String>,
    pub browser_version: Option<String>,
    pub os: Option<String>,
    pub os_version: Option<String>,
    pub device_type: Option<String>,
    pub user_agent: Option<String>,
    pub ip: Option<String>,
    pub country: Option<String>,
    pub city: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub status: DeviceStatus,
    pub created_at: DateTime<Utc>,
    pub trusted_at: Option<DateTime<Utc>>,
    pub revoked_at: Option<DateTime<Utc>>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub approval_token_hash: Option<Vec<u8>>,
    pub approval_code_hash: Option<Vec<u8>>,
    pub approval_expires_at: Option<DateTime<Utc>>,
    pub approval_attempts: i32,
    pub risk_score: Option<u32>,
    pub risk_factors: Option<Vec<RiskFactor>>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalRequestStatus {
    Pending,
    Approved,
    Denied,
    Superseded,
}

impl ApprovalRequestStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Denied => "denied",
            Self::Superseded => "superseded",
        }
    }

    #[must_use]
    pub fn from_str(value: &str) -> Option<Self> {
        match value.trim() {
            "pending" => Some(Self::Pending),
            "approved" => Some(Self::Approved),
            "denied" => Some(Self::Denied),
            "superseded" => Some(Self::Superseded),
            _ => None,
        }
    }
}

/// How a request was resolved.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionChannel {
    EmailLink,
    EmailCode,
    SessionTrust,
}

impl ResolutionChannel {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::EmailLink => "email_link",
            Self::EmailCode => "email_code",
            Self::SessionTrust => "session_trust",
        }
    }

    #[must_use]
    pub fn from_str(value: &str) -> Option<Self> {
        match value.trim() {
            "email_link" => Some(Self::EmailLink),
            "email_code" => Some(Self::EmailCode),
            "session_trust" => Some(Self::SessionTrust),
            _ => None,
        }
    }
}

/// Ledger row for one issued token/code pair.
///
/// At most one row per device is pending at any time; issuing fresh secrets
/// supersedes older rows, and resolving one denies the rest. Resolved rows
/// are kept so a replayed link or code can be answered with "already
/// resolved" instead of "invalid".
#[derive(Clone, Debug)]
pub struct ApprovalRequest {
    pub id: Uuid,
    pub user_id: Uuid,
    pub device_id: String,
    pub token_hash: Vec<u8>,
    pub status: ApprovalRequestStatus,
    pub resolved_by: Option<ResolutionChannel>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl ApprovalRequest {
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.status == ApprovalRequestStatus::Pending
    }
}
