//! Persistence seam for devices and the approval-request ledger.
//!
//! Concurrent mutations against one device row are serialized here: status
//! transitions are guarded by the expected current status, and the attempt
//! counter increments in a single atomic operation. Callers never
//! read-modify-write those fields across calls.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::trust::models::{
    ApprovalRequest, ApprovalRequestStatus, Device, DeviceStatus, ResolutionChannel,
};

/// Outcome of inserting a device row under the `(user_id, device_id)`
/// uniqueness constraint.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DeviceInsertOutcome {
    Created,
    AlreadyExists,
}

/// Outcome of a status-guarded device update.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DeviceUpdateOutcome {
    Updated,
    /// The stored status no longer matches; another caller won the race.
    StatusConflict,
}

/// Outcome of inserting a ledger row under the token-hash uniqueness
/// constraint.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RequestInsertOutcome {
    Created,
    /// Another live or historical request already carries this token hash.
    DuplicateTokenHash,
}

#[async_trait]
pub trait DeviceRepo: Send + Sync {
    async fn find_device(&self, user_id: Uuid, device_id: &str) -> Result<Option<Device>>;

    async fn list_devices(&self, user_id: Uuid) -> Result<Vec<Device>>;

    async fn insert_device(&self, device: &Device) -> Result<DeviceInsertOutcome>;

    /// Persist the device's current state, but only if the stored status
    /// still equals `expected`.
    async fn update_device(
        &self,
        device: &Device,
        expected: DeviceStatus,
    ) -> Result<DeviceUpdateOutcome>;

    /// Atomically add one failed code attempt and return the new count.
    /// Returns `None` when the device is no longer pending approval.
    async fn increment_approval_attempts(
        &self,
        user_id: Uuid,
        device_id: &str,
    ) -> Result<Option<i32>>;

    async fn find_request_by_token_hash(
        &self,
        token_hash: &[u8],
    ) -> Result<Option<ApprovalRequest>>;

    async fn find_pending_request(
        &self,
        user_id: Uuid,
        device_id: &str,
    ) -> Result<Option<ApprovalRequest>>;

    async fn insert_request(&self, request: &ApprovalRequest) -> Result<RequestInsertOutcome>;

    /// Resolve a request if it is still pending. Returns `false` when
    /// another caller resolved it first.
    async fn resolve_request(
        &self,
        request_id: Uuid,
        status: ApprovalRequestStatus,
        resolved_by: Option<ResolutionChannel>,
        at: DateTime<Utc>,
    ) -> Result<bool>;

    /// Mark every pending request for the device superseded, except the
    /// given one. Returns the number of rows affected.
    async fn supersede_pending_requests(
        &self,
        user_id: Uuid,
        device_id: &str,
        except: Option<Uuid>,
        at: DateTime<Utc>,
    ) -> Result<u64>;

    /// Storage hygiene only; expiry correctness never depends on this.
    async fn purge_expired_requests(&self, before: DateTime<Utc>) -> Result<u64>;
}
