//! In-memory store for tests and single-process embedding.
//!
//! One mutex over all maps gives the same per-device serialization the
//! Postgres store gets from row-level atomic updates.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::pattern::{LoginPattern, PatternRepo};
use crate::trust::{
    ApprovalRequest, ApprovalRequestStatus, Device, DeviceInsertOutcome, DeviceRepo,
    DeviceStatus, DeviceUpdateOutcome, RequestInsertOutcome, ResolutionChannel,
};

#[derive(Default)]
struct Inner {
    devices: HashMap<(Uuid, String), Device>,
    requests: HashMap<Uuid, ApprovalRequest>,
    patterns: HashMap<Uuid, LoginPattern>,
}

/// Map-backed implementation of both repositories.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DeviceRepo for MemoryStore {
    async fn find_device(&self, user_id: Uuid, device_id: &str) -> Result<Option<Device>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .devices
            .get(&(user_id, device_id.to_string()))
            .cloned())
    }

    async fn list_devices(&self, user_id: Uuid) -> Result<Vec<Device>> {
        let inner = self.inner.lock().await;
        let mut devices: Vec<Device> = inner
            .devices
            .values()
            .filter(|device| device.user_id() == user_id)
            .cloned()
            .collect();
        devices.sort_by_key(|device| std::cmp::Reverse(device.created_at()));
        Ok(devices)
    }

    async fn insert_device(&self, device: &Device) -> Result<DeviceInsertOutcome> {
        let mut inner = self.inner.lock().await;
        let key = (device.user_id(), device.device_id().to_string());
        if inner.devices.contains_key(&key) {
            return Ok(DeviceInsertOutcome::AlreadyExists);
        }
        inner.devices.insert(key, device.clone());
        Ok(DeviceInsertOutcome::Created)
    }

    async fn update_device(
        &self,
        device: &Device,
        expected: DeviceStatus,
    ) -> Result<DeviceUpdateOutcome> {
        let mut inner = self.inner.lock().await;
        let key = (device.user_id(), device.device_id().to_string());
        match inner.devices.get_mut(&key) {
            Some(stored) if stored.status() == expected => {
                *stored = device.clone();
                Ok(DeviceUpdateOutcome::Updated)
            }
            _ => Ok(DeviceUpdateOutcome::StatusConflict),
        }
    }

    async fn increment_approval_attempts(
        &self,
        user_id: Uuid,
        device_id: &str,
    ) -> Result<Option<i32>> {
        let mut inner = self.inner.lock().await;
        let key = (user_id, device_id.to_string());
        let Some(device) = inner.devices.get_mut(&key) else {
            return Ok(None);
        };
        if device.status() != DeviceStatus::PendingApproval {
            return Ok(None);
        }
        let attempts = device
            .approval()
            .map_or(0, crate::trust::ApprovalState::attempts)
            + 1;
        device.set_attempts(attempts);
        Ok(Some(attempts))
    }

    async fn find_request_by_token_hash(
        &self,
        token_hash: &[u8],
    ) -> Result<Option<ApprovalRequest>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .requests
            .values()
            .find(|request| request.token_hash == token_hash)
            .cloned())
    }

    async fn find_pending_request(
        &self,
        user_id: Uuid,
        device_id: &str,
    ) -> Result<Option<ApprovalRequest>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .requests
            .values()
            .find(|request| {
                request.user_id == user_id
                    && request.device_id == device_id
                    && request.is_pending()
            })
            .cloned())
    }

    async fn insert_request(&self, request: &ApprovalRequest) -> Result<RequestInsertOutcome> {
        let mut inner = self.inner.lock().await;
        if inner
            .requests
            .values()
            .any(|existing| existing.token_hash == request.token_hash)
        {
            return Ok(RequestInsertOutcome::DuplicateTokenHash);
        }
        inner.requests.insert(request.id, request.clone());
        Ok(RequestInsertOutcome::Created)
    }

    async fn resolve_request(
        &self,
        request_id: Uuid,
        status: ApprovalRequestStatus,
        resolved_by: Option<ResolutionChannel>,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        match inner.requests.get_mut(&request_id) {
            Some(request) if request.is_pending() => {
                request.status = status;
                request.resolved_by = resolved_by;
                request.resolved_at = Some(at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn supersede_pending_requests(
        &self,
        user_id: Uuid,
        device_id: &str,
        except: Option<Uuid>,
        at: DateTime<Utc>,
    ) -> Result<u64> {
        let mut inner = self.inner.lock().await;
        let mut affected = 0;
        for request in inner.requests.values_mut() {
            if request.user_id == user_id
                && request.device_id == device_id
                && request.is_pending()
                && Some(request.id) != except
            {
                request.status = ApprovalRequestStatus::Superseded;
                request.resolved_at = Some(at);
                affected += 1;
            }
        }
        Ok(affected)
    }

    async fn purge_expired_requests(&self, before: DateTime<Utc>) -> Result<u64> {
        let mut inner = self.inner.lock().await;
        let initial = inner.requests.len();
        inner.requests.retain(|_, request| {
            !(request.expires_at < before
                && matches!(
                    request.status,
                    ApprovalRequestStatus::Pending | ApprovalRequestStatus::Superseded
                ))
        });
        Ok((initial - inner.requests.len()) as u64)
    }
}

#[async_trait]
impl PatternRepo for MemoryStore {
    async fn find_pattern(&self, user_id: Uuid) -> Result<Option<LoginPattern>> {
        let inner = self.inner.lock().await;
        Ok(inner.patterns.get(&user_id).cloned())
    }

    async fn save_pattern(&self, pattern: &LoginPattern) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.patterns.insert(pattern.user_id(), pattern.clone());
        Ok(())
    }
}
