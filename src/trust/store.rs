//! Device trust store: the state machine over devices and their approval
//! secrets.

use chrono::{DateTime, Duration, Utc};
use secrecy::SecretString;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::{TrustError, TrustResult};
use crate::risk::RiskScore;
use crate::signals::LoginSignals;
use crate::trust::models::{
    ApprovalRequest, ApprovalRequestStatus, ApprovalState, Device, DeviceStatus, ResolutionChannel,
};
use crate::trust::repo::{
    DeviceInsertOutcome, DeviceRepo, DeviceUpdateOutcome, RequestInsertOutcome,
};
use crate::trust::secrets::{generate_approval_code, generate_approval_token, hash_code, hash_secret};

const DEFAULT_APPROVAL_TTL_MINUTES: i64 = 30;
const DEFAULT_MAX_CODE_ATTEMPTS: i32 = 5;
const DEFAULT_SECRET_RETRY_BUDGET: u32 = 3;

/// Re-reads allowed when a metadata update loses a row-level race.
const MUTATION_RETRIES: u32 = 3;

/// Limits for approval issuance and validation.
#[derive(Clone, Copy, Debug)]
pub struct TrustConfig {
    approval_ttl_minutes: i64,
    max_code_attempts: i32,
    secret_retry_budget: u32,
}

impl TrustConfig {
    /// Defaults: 30 minute approval window, 5 code attempts, 3 retries on
    /// token-hash collision.
    #[must_use]
    pub fn new() -> Self {
        Self {
            approval_ttl_minutes: DEFAULT_APPROVAL_TTL_MINUTES,
            max_code_attempts: DEFAULT_MAX_CODE_ATTEMPTS,
            secret_retry_budget: DEFAULT_SECRET_RETRY_BUDGET,
        }
    }

    #[must_use]
    pub fn with_approval_ttl_minutes(mut self, minutes: i64) -> Self {
        self.approval_ttl_minutes = minutes;
        self
    }

    #[must_use]
    pub fn with_max_code_attempts(mut self, attempts: i32) -> Self {
        self.max_code_attempts = attempts;
        self
    }

    #[must_use]
    pub fn with_secret_retry_budget(mut self, budget: u32) -> Self {
        self.secret_retry_budget = budget.max(1);
        self
    }

    #[must_use]
    pub fn approval_ttl_minutes(&self) -> i64 {
        self.approval_ttl_minutes
    }

    #[must_use]
    pub fn max_code_attempts(&self) -> i32 {
        self.max_code_attempts
    }

    #[must_use]
    pub fn secret_retry_budget(&self) -> u32 {
        self.secret_retry_budget
    }
}

impl Default for TrustConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// A freshly issued pending approval: the device, the ledger row id, and the
/// plaintext secrets for out-of-band delivery.
///
/// The plaintexts exist only here; storage holds their hashes.
pub struct IssuedApproval {
    pub device: Device,
    pub request_id: Uuid,
    pub token: SecretString,
    pub code: SecretString,
    pub expires_at: DateTime<Utc>,
}

/// Owns the device lifecycle: issuance and validation of approval secrets,
/// and the transitions between pending, trusted, and revoked.
#[derive(Clone)]
pub struct DeviceTrustStore {
    repo: Arc<dyn DeviceRepo>,
    clock: Arc<dyn Clock>,
    config: TrustConfig,
}

impl DeviceTrustStore {
    #[must_use]
    pub fn new(repo: Arc<dyn DeviceRepo>, clock: Arc<dyn Clock>, config: TrustConfig) -> Self {
        Self {
            repo,
            clock,
            config,
        }
    }

    #[must_use]
    pub fn config(&self) -> &TrustConfig {
        &self.config
    }

    /// Look up one device of a user.
    ///
    /// # Errors
    /// Returns an error if the lookup fails.
    pub async fn find_device(
        &self,
        user_id: Uuid,
        device_id: &str,
    ) -> TrustResult<Option<Device>> {
        Ok(self.repo.find_device(user_id, device_id).await?)
    }

    /// All devices of a user, for account-security surfaces.
    ///
    /// # Errors
    /// Returns an error if the lookup fails.
    pub async fn list_devices(&self, user_id: Uuid) -> TrustResult<Vec<Device>> {
        Ok(self.repo.list_devices(user_id).await?)
    }

    /// Create (or re-issue for) a pending device and hand back the plaintext
    /// secrets for delivery.
    ///
    /// An existing pending device gets fresh secrets and a reset attempt
    /// counter; its outstanding request is superseded so only one secret
    /// pair is ever live per device.
    ///
    /// # Errors
    /// `Conflict` when the device is already trusted or revoked;
    /// `SecretGenerationExhausted` when the collision-retry budget runs out.
    pub async fn create_pending(
        &self,
        user_id: Uuid,
        signals: &LoginSignals,
        risk: &RiskScore,
    ) -> TrustResult<IssuedApproval> {
        let now = self.clock.now();

        match self.repo.find_device(user_id, &signals.device_id).await? {
            None => {
                let issued = self
                    .issue_secrets(user_id, &signals.device_id, risk, now)
                    .await?;
                let device = Device::create_pending(user_id, signals, issued.state, now);
                match self.repo.insert_device(&device).await? {
                    DeviceInsertOutcome::Created => {}
                    DeviceInsertOutcome::AlreadyExists => {
                        // Lost a create race; drop our request and report the
                        // conflict so the caller retries against the winner.
                        self.abandon_request(issued.request_id, now).await;
                        return Err(TrustError::Conflict);
                    }
                }
                info!(%user_id, device_id = %signals.device_id, "pending device created");
                Ok(IssuedApproval {
                    device,
                    request_id: issued.request_id,
                    token: issued.token,
                    code: issued.code,
                    expires_at: issued.expires_at,
                })
            }
            Some(mut device) => match device.status() {
                DeviceStatus::PendingApproval => {
                    let issued = self
                        .issue_secrets(user_id, &signals.device_id, risk, now)
                        .await?;
                    device.reset_to_pending(issued.state, now)?;
                    device.refresh_metadata(signals, now);
                    self.repo
                        .supersede_pending_requests(
                            user_id,
                            &signals.device_id,
                            Some(issued.request_id),
                            now,
                        )
                        .await?;
                    match self
                        .repo
                        .update_device(&device, DeviceStatus::PendingApproval)
                        .await?
                    {
                        DeviceUpdateOutcome::Updated => {}
                        DeviceUpdateOutcome::StatusConflict => {
                            self.abandon_request(issued.request_id, now).await;
                            return Err(TrustError::DeviceAlreadyResolved);
                        }
                    }
                    info!(%user_id, device_id = %signals.device_id, "pending approval re-issued");
                    Ok(IssuedApproval {
                        device,
                        request_id: issued.request_id,
                        token: issued.token,
                        code: issued.code,
                        expires_at: issued.expires_at,
                    })
                }
                DeviceStatus::Trusted | DeviceStatus::Revoked => Err(TrustError::Conflict),
            },
        }
    }

    /// Create a device directly in trusted state, for flows already
    /// verified out of band (first login after signup verification).
    ///
    /// # Errors
    /// `Conflict` when a record for `(user, device)` already exists.
    pub async fn create_trusted(
        &self,
        user_id: Uuid,
        signals: &LoginSignals,
    ) -> TrustResult<Device> {
        let now = self.clock.now();
        let device = Device::create_trusted(user_id, signals, now);
        match self.repo.insert_device(&device).await? {
            DeviceInsertOutcome::Created => {
                info!(%user_id, device_id = %signals.device_id, "device created trusted");
                Ok(device)
            }
            DeviceInsertOutcome::AlreadyExists => Err(TrustError::Conflict),
        }
    }

    /// Resolve an approval token to its pending device.
    ///
    /// # Errors
    /// `TokenInvalid` when no request matches; `DeviceAlreadyResolved` when
    /// the matching request or device was resolved by another caller;
    /// `TokenExpired` past the approval window.
    pub async fn validate_token(&self, token: &str) -> TrustResult<(Device, ApprovalRequest)> {
        let token_hash = hash_secret(token);
        let Some(request) = self.repo.find_request_by_token_hash(&token_hash).await? else {
            return Err(TrustError::TokenInvalid);
        };
        if !request.is_pending() {
            return Err(TrustError::DeviceAlreadyResolved);
        }

        let now = self.clock.now();
        if now > request.expires_at {
            return Err(TrustError::TokenExpired);
        }

        let Some(device) = self
            .repo
            .find_device(request.user_id, &request.device_id)
            .await?
        else {
            return Err(TrustError::TokenInvalid);
        };
        if device.status() != DeviceStatus::PendingApproval {
            return Err(TrustError::DeviceAlreadyResolved);
        }
        if device.is_approval_expired(now) {
            return Err(TrustError::TokenExpired);
        }
        // The ledger row must still be the device's live secret.
        if device.approval().map(ApprovalState::token_hash) != Some(token_hash.as_slice()) {
            return Err(TrustError::TokenInvalid);
        }

        Ok((device, request))
    }

    /// Resolve a pending device by identity instead of by token — the
    /// session-trust path, where an already-authenticated companion device
    /// approves without ever seeing the secrets.
    ///
    /// # Errors
    /// `DeviceNotFound` when no record exists; `DeviceAlreadyResolved` when
    /// the device or its request is no longer pending; `TokenExpired` past
    /// the approval window.
    pub async fn validate_pending_device(
        &self,
        user_id: Uuid,
        device_id: &str,
    ) -> TrustResult<(Device, ApprovalRequest)> {
        let Some(device) = self.repo.find_device(user_id, device_id).await? else {
            return Err(TrustError::DeviceNotFound);
        };
        if device.status() != DeviceStatus::PendingApproval {
            return Err(TrustError::DeviceAlreadyResolved);
        }

        let now = self.clock.now();
        if device.is_approval_expired(now) {
            return Err(TrustError::TokenExpired);
        }

        let Some(request) = self.repo.find_pending_request(user_id, device_id).await? else {
            return Err(TrustError::DeviceAlreadyResolved);
        };

        Ok((device, request))
    }

    /// Validate a human code against the request identified by `token`.
    ///
    /// The attempt cap is checked before comparing, so a correct code after
    /// exhaustion still answers `MaxAttemptsReached`. A mismatch increments
    /// the counter atomically; a match never mutates it.
    ///
    /// # Errors
    /// Everything `validate_token` returns, plus `CodeInvalid` and
    /// `MaxAttemptsReached`.
    pub async fn validate_code(
        &self,
        token: &str,
        code: &str,
    ) -> TrustResult<(Device, ApprovalRequest)> {
        let (device, request) = self.validate_token(token).await?;
        let Some(approval) = device.approval() else {
            return Err(TrustError::TokenInvalid);
        };

        if approval.attempts() >= self.config.max_code_attempts {
            return Err(TrustError::MaxAttemptsReached);
        }

        if approval.code_hash() == hash_code(code).as_slice() {
            return Ok((device, request));
        }

        match self
            .repo
            .increment_approval_attempts(device.user_id(), device.device_id())
            .await?
        {
            None => Err(TrustError::DeviceAlreadyResolved),
            Some(attempts) if attempts >= self.config.max_code_attempts => {
                warn!(
                    user_id = %device.user_id(),
                    device_id = %device.device_id(),
                    "approval code attempts exhausted"
                );
                Err(TrustError::MaxAttemptsReached)
            }
            Some(_) => Err(TrustError::CodeInvalid),
        }
    }

    /// PendingApproval -> Trusted, recording how the request resolved and
    /// invalidating every other live request for the device.
    ///
    /// # Errors
    /// `DeviceAlreadyResolved` when another caller transitioned the device
    /// first.
    pub async fn mark_trusted(
        &self,
        mut device: Device,
        request_id: Uuid,
        channel: ResolutionChannel,
    ) -> TrustResult<Device> {
        let now = self.clock.now();
        device.mark_trusted(now)?;

        match self
            .repo
            .update_device(&device, DeviceStatus::PendingApproval)
            .await?
        {
            DeviceUpdateOutcome::Updated => {}
            DeviceUpdateOutcome::StatusConflict => return Err(TrustError::DeviceAlreadyResolved),
        }

        self.repo
            .resolve_request(request_id, ApprovalRequestStatus::Approved, Some(channel), now)
            .await?;
        self.repo
            .supersede_pending_requests(device.user_id(), device.device_id(), Some(request_id), now)
            .await?;

        info!(
            user_id = %device.user_id(),
            device_id = %device.device_id(),
            resolved_by = channel.as_str(),
            "device trusted"
        );
        Ok(device)
    }

    /// Revoke a device (terminal), denying its live request if one exists.
    ///
    /// # Errors
    /// `DeviceAlreadyResolved` when the device is already revoked, or when a
    /// concurrent transition won the race.
    pub async fn revoke(
        &self,
        mut device: Device,
        request_id: Option<Uuid>,
    ) -> TrustResult<Device> {
        let now = self.clock.now();
        let expected = device.status();
        device.revoke(now)?;

        match self.repo.update_device(&device, expected).await? {
            DeviceUpdateOutcome::Updated => {}
            DeviceUpdateOutcome::StatusConflict => return Err(TrustError::DeviceAlreadyResolved),
        }

        if let Some(request_id) = request_id {
            self.repo
                .resolve_request(request_id, ApprovalRequestStatus::Denied, None, now)
                .await?;
        }
        self.repo
            .supersede_pending_requests(device.user_id(), device.device_id(), request_id, now)
            .await?;

        info!(
            user_id = %device.user_id(),
            device_id = %device.device_id(),
            "device revoked"
        );
        Ok(device)
    }

    /// Demote a trusted device back to pending with fresh secrets — the
    /// spoofing re-verification path. Any outstanding approval request for
    /// the device is invalidated first; one device never has two live
    /// secret pairs.
    ///
    /// # Errors
    /// `Conflict` when the device is revoked or a concurrent transition won;
    /// `SecretGenerationExhausted` when the retry budget runs out.
    pub async fn reset_to_pending(
        &self,
        mut device: Device,
        risk: &RiskScore,
    ) -> TrustResult<IssuedApproval> {
        let now = self.clock.now();
        let expected = device.status();
        let issued = self
            .issue_secrets(device.user_id(), device.device_id(), risk, now)
            .await?;

        device.reset_to_pending(issued.state, now)?;
        self.repo
            .supersede_pending_requests(
                device.user_id(),
                device.device_id(),
                Some(issued.request_id),
                now,
            )
            .await?;

        match self.repo.update_device(&device, expected).await? {
            DeviceUpdateOutcome::Updated => {}
            DeviceUpdateOutcome::StatusConflict => {
                self.abandon_request(issued.request_id, now).await;
                return Err(TrustError::Conflict);
            }
        }

        warn!(
            user_id = %device.user_id(),
            device_id = %device.device_id(),
            "trusted device demoted to pending re-verification"
        );
        Ok(IssuedApproval {
            device,
            request_id: issued.request_id,
            token: issued.token,
            code: issued.code,
            expires_at: issued.expires_at,
        })
    }

    /// Refresh metadata and `last_used_at` on a successful use of a trusted
    /// device.
    ///
    /// A metadata refresh carries no transition semantics, so losing a race
    /// is recoverable: the row is re-read and the refresh reapplied, a
    /// bounded number of times.
    ///
    /// # Errors
    /// `Conflict` when the retries are exhausted or the device left its
    /// status mid-flight.
    pub async fn touch_device(
        &self,
        device: Device,
        signals: &LoginSignals,
    ) -> TrustResult<Device> {
        let now = self.clock.now();
        let mut current = device;

        for _ in 0..MUTATION_RETRIES {
            let expected = current.status();
            current.refresh_metadata(signals, now);
            match self.repo.update_device(&current, expected).await? {
                DeviceUpdateOutcome::Updated => return Ok(current),
                DeviceUpdateOutcome::StatusConflict => {
                    match self
                        .repo
                        .find_device(current.user_id(), current.device_id())
                        .await?
                    {
                        Some(fresh) if fresh.status() == expected => current = fresh,
                        _ => return Err(TrustError::Conflict),
                    }
                }
            }
        }

        Err(TrustError::Conflict)
    }

    /// Delete long-expired pending requests. Hygiene only.
    ///
    /// # Errors
    /// Returns an error if the purge fails.
    pub async fn purge_expired(&self, older_than: Duration) -> TrustResult<u64> {
        let before = self.clock.now() - older_than;
        Ok(self.repo.purge_expired_requests(before).await?)
    }

    /// Generate secrets and persist the ledger row, retrying a bounded
    /// number of times on token-hash collision.
    async fn issue_secrets(
        &self,
        user_id: Uuid,
        device_id: &str,
        risk: &RiskScore,
        now: DateTime<Utc>,
    ) -> TrustResult<IssuedSecrets> {
        let expires_at = now + Duration::minutes(self.config.approval_ttl_minutes);

        for _ in 0..self.config.secret_retry_budget {
            let token = generate_approval_token()?;
            let code = generate_approval_code()?;
            let token_hash = hash_secret(&token);

            let request = ApprovalRequest {
                id: Uuid::new_v4(),
                user_id,
                device_id: device_id.to_string(),
                token_hash: token_hash.clone(),
                status: ApprovalRequestStatus::Pending,
                resolved_by: None,
                created_at: now,
                expires_at,
                resolved_at: None,
            };

            match self.repo.insert_request(&request).await? {
                RequestInsertOutcome::Created => {
                    let state = ApprovalState {
                        token_hash,
                        code_hash: hash_code(&code),
                        expires_at,
                        attempts: 0,
                        risk_score: risk.value(),
                        risk_factors: risk.factors().to_vec(),
                    };
                    return Ok(IssuedSecrets {
                        state,
                        request_id: request.id,
                        token: SecretString::from(token),
                        code: SecretString::from(code),
                        expires_at,
                    });
                }
                RequestInsertOutcome::DuplicateTokenHash => {
                    // 256 bits of entropy make this astronomically rare, but
                    // a duplicate must regenerate, not fail the request.
                    warn!(%user_id, %device_id, "approval token hash collision, regenerating");
                }
            }
        }

        Err(TrustError::SecretGenerationExhausted)
    }

    /// Best-effort cleanup of a request whose device write lost a race.
    async fn abandon_request(&self, request_id: Uuid, now: DateTime<Utc>) {
        if let Err(err) = self
            .repo
            .resolve_request(request_id, ApprovalRequestStatus::Superseded, None, now)
            .await
        {
            warn!(%request_id, "failed to supersede abandoned approval request: {err}");
        }
    }
}

struct IssuedSecrets {
    state: ApprovalState,
    request_id: Uuid,
    token: SecretString,
    code: SecretString,
    expires_at: DateTime<Utc>,
}
