//! The engine facade: the operation set login and approval handlers call.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::approval::{ApprovalCoordinator, ApprovalNotifier};
use crate::clock::Clock;
use crate::error::{TrustError, TrustResult};
use crate::pattern::{LoginPatternTracker, PatternRepo};
use crate::risk::{AttemptContext, RiskPolicy, RiskScore, RiskScorer};
use crate::signals::LoginSignals;
use crate::trust::{Device, DeviceRepo, DeviceTrustStore, IssuedApproval, TrustConfig};

/// What to do with one login attempt.
#[derive(Debug)]
pub enum LoginDecision {
    /// Known trusted device, nothing anomalous. Proceed.
    Trusted { device: Device },
    /// Trusted device with anomalous reuse; run [`TrustEngine::check_for_spoofing`]
    /// to demote it and issue re-verification secrets.
    Reverify { risk: RiskScore },
    /// New or still-pending device below the approval threshold; the caller
    /// may trust it directly.
    Allow { risk: RiskScore },
    /// Out-of-band approval is required before this device is trusted.
    RequireApproval { risk: RiskScore },
}

/// Outcome of re-verifying a trusted device.
#[derive(Debug)]
pub enum SpoofingOutcome {
    /// Reuse looks plausible; the device stays trusted.
    Clear,
    /// The device was demoted to pending approval. Fresh secrets went out
    /// through the notifier; the plaintexts are not retained here.
    Reverify {
        risk: RiskScore,
        request_id: Uuid,
        expires_at: DateTime<Utc>,
    },
}

/// Risk-based device trust engine.
///
/// Wires the scorer, the pattern tracker, the trust store, and the approval
/// coordinator behind one API. All operations run synchronously within the
/// caller's request; concurrent logins for one user do not block each other,
/// and races on a single device are closed at the storage layer.
#[derive(Clone)]
pub struct TrustEngine {
    store: DeviceTrustStore,
    tracker: LoginPatternTracker,
    coordinator: ApprovalCoordinator,
    scorer: RiskScorer,
    clock: Arc<dyn Clock>,
}

impl TrustEngine {
    #[must_use]
    pub fn new(
        device_repo: Arc<dyn DeviceRepo>,
        pattern_repo: Arc<dyn PatternRepo>,
        notifier: Arc<dyn ApprovalNotifier>,
        clock: Arc<dyn Clock>,
        policy: RiskPolicy,
        config: TrustConfig,
    ) -> Self {
        let store = DeviceTrustStore::new(device_repo, Arc::clone(&clock), config);
        let tracker = LoginPatternTracker::new(pattern_repo, Arc::clone(&clock));
        let coordinator = ApprovalCoordinator::new(store.clone(), notifier);
        Self {
            store,
            tracker,
            coordinator,
            scorer: RiskScorer::new(policy),
            clock,
        }
    }

    #[must_use]
    pub fn store(&self) -> &DeviceTrustStore {
        &self.store
    }

    /// Score one login attempt and decide between trusting, challenging,
    /// and re-verifying.
    ///
    /// # Errors
    /// Returns an error if device or pattern lookups fail.
    pub async fn score_login_attempt(
        &self,
        user_id: Uuid,
        signals: &LoginSignals,
    ) -> TrustResult<LoginDecision> {
        let device = self.store.find_device(user_id, &signals.device_id).await?;
        let pattern = self.tracker.load(user_id).await?;
        let now = self.clock.now();

        if let Some(device) = device.as_ref().filter(|device| device.is_trusted()) {
            let assessment = self.scorer.check_spoofing(
                pattern.as_ref(),
                device.device_type(),
                device.fingerprint(),
                &signals.location,
                &signals.device_info,
                signals.fingerprint.as_deref(),
                now,
            );
            if assessment.suspicious {
                return Ok(LoginDecision::Reverify {
                    risk: assessment.risk,
                });
            }
            return Ok(LoginDecision::Trusted {
                device: device.clone(),
            });
        }

        let ctx = AttemptContext {
            device_is_known: device.is_some(),
            pattern: pattern.as_ref(),
            location: &signals.location,
            device_info: &signals.device_info,
            at: now,
        };
        let risk = self.scorer.score_attempt(&ctx);
        if self.scorer.requires_approval(&risk) {
            Ok(LoginDecision::RequireApproval { risk })
        } else {
            Ok(LoginDecision::Allow { risk })
        }
    }

    /// Issue a pending device plus approval secrets; the secrets also go out
    /// through the notifier.
    ///
    /// # Errors
    /// `Conflict` when the device is already trusted or revoked;
    /// `SecretGenerationExhausted` on a drained retry budget.
    pub async fn create_pending_device(
        &self,
        user_id: Uuid,
        signals: &LoginSignals,
        risk: &RiskScore,
    ) -> TrustResult<IssuedApproval> {
        self.coordinator.request_approval(user_id, signals, risk).await
    }

    /// Create a device directly in trusted state, for already-verified
    /// first-time login flows.
    ///
    /// # Errors
    /// `Conflict` when the device record already exists.
    pub async fn create_trusted_device(
        &self,
        user_id: Uuid,
        signals: &LoginSignals,
    ) -> TrustResult<Device> {
        self.store.create_trusted(user_id, signals).await
    }

    /// Read-only token validation, for rendering the approval page before
    /// the user acts.
    ///
    /// # Errors
    /// `TokenInvalid`, `TokenExpired`, or `DeviceAlreadyResolved`.
    pub async fn validate_approval_token(&self, token: &str) -> TrustResult<Device> {
        let (device, _request) = self.store.validate_token(token).await?;
        Ok(device)
    }

    /// Read-only code validation. A mismatch still counts against the
    /// attempt cap.
    ///
    /// # Errors
    /// Token errors plus `CodeInvalid` / `MaxAttemptsReached`.
    pub async fn validate_approval_code(&self, token: &str, code: &str) -> TrustResult<Device> {
        let (device, _request) = self.store.validate_code(token, code).await?;
        Ok(device)
    }

    /// Email-link approval.
    ///
    /// # Errors
    /// Token validation errors or `DeviceAlreadyResolved`.
    pub async fn approve_device(&self, token: &str) -> TrustResult<Device> {
        self.coordinator.approve_by_link(token).await
    }

    /// Email-code approval.
    ///
    /// # Errors
    /// Token/code validation errors or `DeviceAlreadyResolved`.
    pub async fn approve_device_with_code(
        &self,
        token: &str,
        code: &str,
    ) -> TrustResult<Device> {
        self.coordinator.approve_by_code(token, code).await
    }

    /// Approval granted from an existing trusted session, bypassing the
    /// token and code.
    ///
    /// # Errors
    /// `DeviceNotFound`, `TokenExpired`, or `DeviceAlreadyResolved`.
    pub async fn resolve_by_session_trust(
        &self,
        user_id: Uuid,
        device_id: &str,
    ) -> TrustResult<Device> {
        self.coordinator.approve_by_session(user_id, device_id).await
    }

    /// Deny via the emailed link: the device is revoked and the request
    /// denied.
    ///
    /// # Errors
    /// Token validation errors or `DeviceAlreadyResolved`.
    pub async fn deny_device(&self, token: &str) -> TrustResult<Device> {
        self.coordinator.deny_by_token(token).await
    }

    /// Revoke a device from an account-security surface. Terminal; any live
    /// approval request is invalidated.
    ///
    /// # Errors
    /// `DeviceNotFound` or `DeviceAlreadyResolved`.
    pub async fn revoke_device(&self, user_id: Uuid, device_id: &str) -> TrustResult<Device> {
        let Some(device) = self.store.find_device(user_id, device_id).await? else {
            return Err(TrustError::DeviceNotFound);
        };
        self.store.revoke(device, None).await
    }

    /// Record a successful login: update the user's pattern and refresh the
    /// device row.
    ///
    /// # Errors
    /// Returns an error if pattern or device persistence fails.
    pub async fn record_login(&self, user_id: Uuid, signals: &LoginSignals) -> TrustResult<()> {
        self.tracker.record_login(user_id, signals).await?;
        if let Some(device) = self.store.find_device(user_id, &signals.device_id).await? {
            if device.is_trusted() {
                self.store.touch_device(device, signals).await?;
            }
        }
        Ok(())
    }

    /// Re-verify an already-trusted device against its owner's pattern. A
    /// suspicious assessment demotes it to pending approval with fresh
    /// secrets and a reset attempt counter; any prior pending request is
    /// invalidated.
    ///
    /// This branch defends the whole mechanism: a trusted device reused from
    /// an implausible location or with a drifted identity must re-verify,
    /// never silently proceed.
    ///
    /// # Errors
    /// `DeviceNotFound` when no record exists; `Conflict` when the device is
    /// not currently trusted.
    pub async fn check_for_spoofing(
        &self,
        user_id: Uuid,
        signals: &LoginSignals,
    ) -> TrustResult<SpoofingOutcome> {
        let Some(device) = self.store.find_device(user_id, &signals.device_id).await? else {
            return Err(TrustError::DeviceNotFound);
        };
        if !device.is_trusted() {
            return Err(TrustError::Conflict);
        }

        let pattern = self.tracker.load(user_id).await?;
        let assessment = self.scorer.check_spoofing(
            pattern.as_ref(),
            device.device_type(),
            device.fingerprint(),
            &signals.location,
            &signals.device_info,
            signals.fingerprint.as_deref(),
            self.clock.now(),
        );

        if !assessment.suspicious {
            return Ok(SpoofingOutcome::Clear);
        }

        info!(%user_id, device_id = %signals.device_id, "spoofing suspected, forcing re-verification");
        let issued = self
            .coordinator
            .request_reverification(device, &assessment.risk)
            .await?;
        Ok(SpoofingOutcome::Reverify {
            risk: assessment.risk,
            request_id: issued.request_id,
            expires_at: issued.expires_at,
        })
    }

    /// List a user's devices for account-security surfaces.
    ///
    /// # Errors
    /// Returns an error if the lookup fails.
    pub async fn list_devices(&self, user_id: Uuid) -> TrustResult<Vec<Device>> {
        self.store.list_devices(user_id).await
    }
}
