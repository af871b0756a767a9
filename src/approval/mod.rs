//! Approval coordination: the three resolution paths for a pending device,
//! all converging on the trust store's `mark_trusted`.

mod notify;

pub use notify::{ApprovalDelivery, ApprovalNotifier, LogNotifier};

use std::sync::Arc;
use uuid::Uuid;

use crate::error::TrustResult;
use crate::risk::RiskScore;
use crate::signals::LoginSignals;
use crate::trust::{Device, DeviceTrustStore, IssuedApproval, ResolutionChannel};

/// Orchestrates approval issuance and the three ways a request resolves:
/// email link, email code, and trust granted from an existing session.
///
/// Whichever path resolves first wins; the store invalidates every other
/// live request for the device, so a stale link or code afterwards answers
/// "already resolved" rather than acting again.
#[derive(Clone)]
pub struct ApprovalCoordinator {
    store: DeviceTrustStore,
    notifier: Arc<dyn ApprovalNotifier>,
}

impl ApprovalCoordinator {
    #[must_use]
    pub fn new(store: DeviceTrustStore, notifier: Arc<dyn ApprovalNotifier>) -> Self {
        Self { store, notifier }
    }

    /// Issue (or re-issue) a pending approval and hand the plaintext
    /// secrets to the notifier.
    ///
    /// # Errors
    /// Propagates issuance failures; a delivery failure surfaces as a
    /// retryable storage error.
    pub async fn request_approval(
        &self,
        user_id: Uuid,
        signals: &LoginSignals,
        risk: &RiskScore,
    ) -> TrustResult<IssuedApproval> {
        let issued = self.store.create_pending(user_id, signals, risk).await?;
        self.deliver(&issued)?;
        Ok(issued)
    }

    /// Demote a trusted device to pending re-verification and deliver the
    /// fresh secrets.
    ///
    /// # Errors
    /// Propagates demotion and delivery failures.
    pub async fn request_reverification(
        &self,
        device: Device,
        risk: &RiskScore,
    ) -> TrustResult<IssuedApproval> {
        let issued = self.store.reset_to_pending(device, risk).await?;
        self.deliver(&issued)?;
        Ok(issued)
    }

    /// Email-link resolution: the caller presents the plaintext token.
    ///
    /// # Errors
    /// Token validation errors, or `DeviceAlreadyResolved` on a lost race.
    pub async fn approve_by_link(&self, token: &str) -> TrustResult<Device> {
        let (device, request) = self.store.validate_token(token).await?;
        self.store
            .mark_trusted(device, request.id, ResolutionChannel::EmailLink)
            .await
    }

    /// Email-code resolution: the token identifies the request, the code
    /// proves possession of the message body.
    ///
    /// # Errors
    /// Token/code validation errors, or `DeviceAlreadyResolved` on a lost
    /// race.
    pub async fn approve_by_code(&self, token: &str, code: &str) -> TrustResult<Device> {
        let (device, request) = self.store.validate_code(token, code).await?;
        self.store
            .mark_trusted(device, request.id, ResolutionChannel::EmailCode)
            .await
    }

    /// Session-trust resolution: an already-authenticated, already-trusted
    /// session approves the pending device directly, bypassing token and
    /// code.
    ///
    /// # Errors
    /// `DeviceNotFound`, `DeviceAlreadyResolved`, or `TokenExpired` from
    /// target validation.
    pub async fn approve_by_session(
        &self,
        user_id: Uuid,
        device_id: &str,
    ) -> TrustResult<Device> {
        let (device, request) = self.store.validate_pending_device(user_id, device_id).await?;
        self.store
            .mark_trusted(device, request.id, ResolutionChannel::SessionTrust)
            .await
    }

    /// Deny via the emailed link ("this wasn't me"): revokes the device and
    /// denies its request.
    ///
    /// # Errors
    /// Token validation errors, or `DeviceAlreadyResolved` on a lost race.
    pub async fn deny_by_token(&self, token: &str) -> TrustResult<Device> {
        let (device, request) = self.store.validate_token(token).await?;
        self.store.revoke(device, Some(request.id)).await
    }

    fn deliver(&self, issued: &IssuedApproval) -> TrustResult<()> {
        let delivery = ApprovalDelivery {
            user_id: issued.device.user_id(),
            device_id: issued.device.device_id(),
            token: &issued.token,
            code: &issued.code,
            expires_at: issued.expires_at,
        };
        Ok(self.notifier.deliver(&delivery)?)
    }
}
