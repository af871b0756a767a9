//! Postgres-backed store.
//!
//! Expected schema (migrations live with the deployment, not here):
//!
//! - `trusted_devices` — one row per `(user_id, device_id)` (primary key),
//!   descriptive columns, `status` text, approval columns
//!   (`approval_token_hash`/`approval_code_hash` bytea,
//!   `approval_expires_at` timestamptz, `approval_attempts` int,
//!   `risk_score` int, `risk_factors` jsonb).
//! - `device_approval_requests` — ledger of issued secret pairs; `id` uuid
//!   primary key, unique index on `token_hash`.
//! - `login_patterns` — one row per `user_id` (primary key); history lists
//!   as jsonb.
//!
//! Per-device serialization relies on single-statement updates: status
//! transitions are guarded by `WHERE status = $expected`, and the attempt
//! counter increments server-side with `RETURNING`.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::Instrument;
use uuid::Uuid;

use crate::pattern::{LoginPattern, PatternRepo, PatternSnapshot};
use crate::risk::RiskFactor;
use crate::trust::{
    ApprovalRequest, ApprovalRequestStatus, Device, DeviceInsertOutcome, DeviceRepo,
    DeviceSnapshot, DeviceStatus, DeviceUpdateOutcome, RequestInsertOutcome, ResolutionChannel,
};

/// Both repositories over one connection pool.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn query_span(operation: &str, statement: &str) -> tracing::Span {
    tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = operation,
        db.statement = statement
    )
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().is_some_and(|code| code.as_ref() == "23505"),
        _ => false,
    }
}

fn device_from_row(row: &PgRow) -> Result<Device> {
    let status: String = row.try_get("status")?;
    let status = DeviceStatus::from_str(&status)
        .with_context(|| format!("invalid trusted_devices.status value: {status}"))?;

    let risk_factors: Option<String> = row.try_get("risk_factors")?;
    let risk_factors = risk_factors
        .as_deref()
        .map(parse_factors)
        .transpose()?;

    let risk_score: Option<i32> = row.try_get("risk_score")?;

    let snapshot = DeviceSnapshot {
        user_id: row.try_get("user_id")?,
        device_id: row.try_get("device_id")?,
        fingerprint: row.try_get("fingerprint")?,
        browser: row.try_get("browser")?,
        browser_version: row.try_get("browser_version")?,
        os: row.try_get("os")?,
        os_version: row.try_get("os_version")?,
        device_type: row.try_get("device_type")?,
        user_agent: row.try_get("user_agent")?,
        ip: row.try_get("ip")?,
        country: row.try_get("country")?,
        city: row.try_get("city")?,
        latitude: row.try_get("latitude")?,
        longitude: row.try_get("longitude")?,
        status,
        created_at: row.try_get("created_at")?,
        trusted_at: row.try_get("trusted_at")?,
        revoked_at: row.try_get("revoked_at")?,
        last_used_at: row.try_get("last_used_at")?,
        approval_token_hash: row.try_get("approval_token_hash")?,
        approval_code_hash: row.try_get("approval_code_hash")?,
        approval_expires_at: row.try_get("approval_expires_at")?,
        approval_attempts: row.try_get("approval_attempts")?,
        risk_score: risk_score.map(|value| u32::try_from(value.max(0)).unwrap_or(0)),
        risk_factors,
    };
    Device::from_snapshot(snapshot)
}

fn request_from_row(row: &PgRow) -> Result<ApprovalRequest> {
    let status: String = row.try_get("status")?;
    let status = ApprovalRequestStatus::from_str(&status)
        .with_context(|| format!("invalid device_approval_requests.status value: {status}"))?;
    let resolved_by: Option<String> = row.try_get("resolved_by")?;
    let resolved_by = resolved_by.as_deref().and_then(ResolutionChannel::from_str);

    Ok(ApprovalRequest {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        device_id: row.try_get("device_id")?,
        token_hash: row.try_get("token_hash")?,
        status,
        resolved_by,
        created_at: row.try_get("created_at")?,
        expires_at: row.try_get("expires_at")?,
        resolved_at: row.try_get("resolved_at")?,
    })
}

fn parse_factors(json: &str) -> Result<Vec<RiskFactor>> {
    let names: Vec<String> =
        serde_json::from_str(json).context("failed to parse risk_factors json")?;
    Ok(names
        .iter()
        .filter_map(|name| RiskFactor::from_str(name))
        .collect())
}

fn factors_json(factors: &[RiskFactor]) -> Result<String> {
    let names: Vec<&str> = factors.iter().map(|factor| factor.as_str()).collect();
    serde_json::to_string(&names).context("failed to serialize risk_factors")
}

const DEVICE_COLUMNS: &str = r"
    user_id, device_id, fingerprint, browser, browser_version, os, os_version,
    device_type, user_agent, ip, country, city, latitude, longitude, status,
    created_at, trusted_at, revoked_at, last_used_at,
    approval_token_hash, approval_code_hash, approval_expires_at,
    approval_attempts, risk_score, risk_factors::text AS risk_factors
";

const REQUEST_COLUMNS: &str = r"
    id, user_id, device_id, token_hash, status, resolved_by,
    created_at, expires_at, resolved_at
";

#[async_trait]
impl DeviceRepo for PgStore {
    async fn find_device(&self, user_id: Uuid, device_id: &str) -> Result<Option<Device>> {
        let query = format!(
            "SELECT {DEVICE_COLUMNS} FROM trusted_devices WHERE user_id = $1 AND device_id = $2"
        );
        let row = sqlx::query(&query)
            .bind(user_id)
            .bind(device_id)
            .fetch_optional(&self.pool)
            .instrument(query_span("SELECT", &query))
            .await
            .context("failed to fetch device")?;
        row.as_ref().map(device_from_row).transpose()
    }

    async fn list_devices(&self, user_id: Uuid) -> Result<Vec<Device>> {
        let query = format!(
            "SELECT {DEVICE_COLUMNS} FROM trusted_devices WHERE user_id = $1 ORDER BY created_at DESC"
        );
        let rows = sqlx::query(&query)
            .bind(user_id)
            .fetch_all(&self.pool)
            .instrument(query_span("SELECT", &query))
            .await
            .context("failed to list devices")?;
        rows.iter().map(device_from_row).collect()
    }

    async fn insert_device(&self, device: &Device) -> Result<DeviceInsertOutcome> {
        let snapshot = device.snapshot();
        let factors = snapshot
            .risk_factors
            .as_deref()
            .map(factors_json)
            .transpose()?;
        let query = r"
            INSERT INTO trusted_devices
                (user_id, device_id, fingerprint, browser, browser_version, os,
                 os_version, device_type, user_agent, ip, country, city,
                 latitude, longitude, status, created_at, trusted_at,
                 revoked_at, last_used_at, approval_token_hash,
                 approval_code_hash, approval_expires_at, approval_attempts,
                 risk_score, risk_factors)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13,
                    $14, $15, $16, $17, $18, $19, $20, $21, $22, $23, $24,
                    $25::jsonb)
        ";
        let result = sqlx::query(query)
            .bind(snapshot.user_id)
            .bind(&snapshot.device_id)
            .bind(&snapshot.fingerprint)
            .bind(&snapshot.browser)
            .bind(&snapshot.browser_version)
            .bind(&snapshot.os)
            .bind(&snapshot.os_version)
            .bind(&snapshot.device_type)
            .bind(&snapshot.user_agent)
            .bind(&snapshot.ip)
            .bind(&snapshot.country)
            .bind(&snapshot.city)
            .bind(snapshot.latitude)
            .bind(snapshot.longitude)
            .bind(snapshot.status.as_str())
            .bind(snapshot.created_at)
            .bind(snapshot.trusted_at)
            .bind(snapshot.revoked_at)
            .bind(snapshot.last_used_at)
            .bind(&snapshot.approval_token_hash)
            .bind(&snapshot.approval_code_hash)
            .bind(snapshot.approval_expires_at)
            .bind(snapshot.approval_attempts)
            .bind(snapshot.risk_score.map(|value| i32::try_from(value).unwrap_or(i32::MAX)))
            .bind(factors)
            .execute(&self.pool)
            .instrument(query_span("INSERT", query))
            .await;

        match result {
            Ok(_) => Ok(DeviceInsertOutcome::Created),
            Err(err) if is_unique_violation(&err) => Ok(DeviceInsertOutcome::AlreadyExists),
            Err(err) => Err(err).context("failed to insert device"),
        }
    }

    async fn update_device(
        &self,
        device: &Device,
        expected: DeviceStatus,
    ) -> Result<DeviceUpdateOutcome> {
        let snapshot = device.snapshot();
        let factors = snapshot
            .risk_factors
            .as_deref()
            .map(factors_json)
            .transpose()?;
        // The status guard serializes concurrent transitions on the row.
        let query = r"
            UPDATE trusted_devices SET
                fingerprint = $3, browser = $4, browser_version = $5, os = $6,
                os_version = $7, device_type = $8, user_agent = $9, ip = $10,
                country = $11, city = $12, latitude = $13, longitude = $14,
                status = $15, trusted_at = $16, revoked_at = $17,
                last_used_at = $18, approval_token_hash = $19,
                approval_code_hash = $20, approval_expires_at = $21,
                approval_attempts = $22, risk_score = $23,
                risk_factors = $24::jsonb
            WHERE user_id = $1 AND device_id = $2 AND status = $25
        ";
        let result = sqlx::query(query)
            .bind(snapshot.user_id)
            .bind(&snapshot.device_id)
            .bind(&snapshot.fingerprint)
            .bind(&snapshot.browser)
            .bind(&snapshot.browser_version)
            .bind(&snapshot.os)
            .bind(&snapshot.os_version)
            .bind(&snapshot.device_type)
            .bind(&snapshot.user_agent)
            .bind(&snapshot.ip)
            .bind(&snapshot.country)
            .bind(&snapshot.city)
            .bind(snapshot.latitude)
            .bind(snapshot.longitude)
            .bind(snapshot.status.as_str())
            .bind(snapshot.trusted_at)
            .bind(snapshot.revoked_at)
            .bind(snapshot.last_used_at)
            .bind(&snapshot.approval_token_hash)
            .bind(&snapshot.approval_code_hash)
            .bind(snapshot.approval_expires_at)
            .bind(snapshot.approval_attempts)
            .bind(snapshot.risk_score.map(|value| i32::try_from(value).unwrap_or(i32::MAX)))
            .bind(factors)
            .bind(expected.as_str())
            .execute(&self.pool)
            .instrument(query_span("UPDATE", query))
            .await
            .context("failed to update device")?;

        if result.rows_affected() == 0 {
            Ok(DeviceUpdateOutcome::StatusConflict)
        } else {
            Ok(DeviceUpdateOutcome::Updated)
        }
    }

    async fn increment_approval_attempts(
        &self,
        user_id: Uuid,
        device_id: &str,
    ) -> Result<Option<i32>> {
        // Server-side increment; two racing failures can never read the same
        // counter value.
        let query = r"
            UPDATE trusted_devices
            SET approval_attempts = approval_attempts + 1
            WHERE user_id = $1 AND device_id = $2 AND status = 'pending_approval'
            RETURNING approval_attempts
        ";
        let row = sqlx::query(query)
            .bind(user_id)
            .bind(device_id)
            .fetch_optional(&self.pool)
            .instrument(query_span("UPDATE", query))
            .await
            .context("failed to increment approval attempts")?;
        Ok(row.map(|row| row.get("approval_attempts")))
    }

    async fn find_request_by_token_hash(
        &self,
        token_hash: &[u8],
    ) -> Result<Option<ApprovalRequest>> {
        let query =
            format!("SELECT {REQUEST_COLUMNS} FROM device_approval_requests WHERE token_hash = $1");
        let row = sqlx::query(&query)
            .bind(token_hash)
            .fetch_optional(&self.pool)
            .instrument(query_span("SELECT", &query))
            .await
            .context("failed to fetch approval request by token hash")?;
        row.as_ref().map(request_from_row).transpose()
    }

    async fn find_pending_request(
        &self,
        user_id: Uuid,
        device_id: &str,
    ) -> Result<Option<ApprovalRequest>> {
        let query = format!(
            r"
            SELECT {REQUEST_COLUMNS} FROM device_approval_requests
            WHERE user_id = $1 AND device_id = $2 AND status = 'pending'
            ORDER BY created_at DESC
            LIMIT 1
            "
        );
        let row = sqlx::query(&query)
            .bind(user_id)
            .bind(device_id)
            .fetch_optional(&self.pool)
            .instrument(query_span("SELECT", &query))
            .await
            .context("failed to fetch pending approval request")?;
        row.as_ref().map(request_from_row).transpose()
    }

    async fn insert_request(&self, request: &ApprovalRequest) -> Result<RequestInsertOutcome> {
        let query = r"
            INSERT INTO device_approval_requests
                (id, user_id, device_id, token_hash, status, resolved_by,
                 created_at, expires_at, resolved_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        ";
        let result = sqlx::query(query)
            .bind(request.id)
            .bind(request.user_id)
            .bind(&request.device_id)
            .bind(&request.token_hash)
            .bind(request.status.as_str())
            .bind(request.resolved_by.map(ResolutionChannel::as_str))
            .bind(request.created_at)
            .bind(request.expires_at)
            .bind(request.resolved_at)
            .execute(&self.pool)
            .instrument(query_span("INSERT", query))
            .await;

        match result {
            Ok(_) => Ok(RequestInsertOutcome::Created),
            Err(err) if is_unique_violation(&err) => Ok(RequestInsertOutcome::DuplicateTokenHash),
            Err(err) => Err(err).context("failed to insert approval request"),
        }
    }

    async fn resolve_request(
        &self,
        request_id: Uuid,
        status: ApprovalRequestStatus,
        resolved_by: Option<ResolutionChannel>,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let query = r"
            UPDATE device_approval_requests
            SET status = $2, resolved_by = $3, resolved_at = $4
            WHERE id = $1 AND status = 'pending'
        ";
        let result = sqlx::query(query)
            .bind(request_id)
            .bind(status.as_str())
            .bind(resolved_by.map(ResolutionChannel::as_str))
            .bind(at)
            .execute(&self.pool)
            .instrument(query_span("UPDATE", query))
            .await
            .context("failed to resolve approval request")?;
        Ok(result.rows_affected() > 0)
    }

    async fn supersede_pending_requests(
        &self,
        user_id: Uuid,
        device_id: &str,
        except: Option<Uuid>,
        at: DateTime<Utc>,
    ) -> Result<u64> {
        let query = r"
            UPDATE device_approval_requests
            SET status = 'superseded', resolved_at = $4
            WHERE user_id = $1 AND device_id = $2 AND status = 'pending'
              AND ($3::uuid IS NULL OR id != $3)
        ";
        let result = sqlx::query(query)
            .bind(user_id)
            .bind(device_id)
            .bind(except)
            .bind(at)
            .execute(&self.pool)
            .instrument(query_span("UPDATE", query))
            .await
            .context("failed to supersede pending requests")?;
        Ok(result.rows_affected())
    }

    async fn purge_expired_requests(&self, before: DateTime<Utc>) -> Result<u64> {
        let query = r"
            DELETE FROM device_approval_requests
            WHERE expires_at < $1 AND status IN ('pending', 'superseded')
        ";
        let result = sqlx::query(query)
            .bind(before)
            .execute(&self.pool)
            .instrument(query_span("DELETE", query))
            .await
            .context("failed to purge expired requests")?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl PatternRepo for PgStore {
    async fn find_pattern(&self, user_id: Uuid) -> Result<Option<LoginPattern>> {
        let query = r"
            SELECT user_id, countries::text AS countries, cities::text AS cities,
                   hours::text AS hours, device_types::text AS device_types,
                   last_login_at, last_ip, last_country, last_city,
                   last_latitude, last_longitude, updated_at
            FROM login_patterns
            WHERE user_id = $1
        ";
        let row = sqlx::query(query)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .instrument(query_span("SELECT", query))
            .await
            .context("failed to fetch login pattern")?;

        row.map(|row| pattern_from_row(&row)).transpose()
    }

    async fn save_pattern(&self, pattern: &LoginPattern) -> Result<()> {
        let snapshot = pattern.snapshot();
        let countries =
            serde_json::to_string(&snapshot.countries).context("failed to serialize countries")?;
        let cities =
            serde_json::to_string(&snapshot.cities).context("failed to serialize cities")?;
        let hours = serde_json::to_string(&snapshot.hours).context("failed to serialize hours")?;
        let device_types = serde_json::to_string(&snapshot.device_types)
            .context("failed to serialize device types")?;

        let query = r"
            INSERT INTO login_patterns
                (user_id, countries, cities, hours, device_types, last_login_at,
                 last_ip, last_country, last_city, last_latitude, last_longitude,
                 updated_at)
            VALUES ($1, $2::jsonb, $3::jsonb, $4::jsonb, $5::jsonb, $6, $7, $8,
                    $9, $10, $11, $12)
            ON CONFLICT (user_id) DO UPDATE SET
                countries = EXCLUDED.countries,
                cities = EXCLUDED.cities,
                hours = EXCLUDED.hours,
                device_types = EXCLUDED.device_types,
                last_login_at = EXCLUDED.last_login_at,
                last_ip = EXCLUDED.last_ip,
                last_country = EXCLUDED.last_country,
                last_city = EXCLUDED.last_city,
                last_latitude = EXCLUDED.last_latitude,
                last_longitude = EXCLUDED.last_longitude,
                updated_at = EXCLUDED.updated_at
        ";
        sqlx::query(query)
            .bind(snapshot.user_id)
            .bind(countries)
            .bind(cities)
            .bind(hours)
            .bind(device_types)
            .bind(snapshot.last_login_at)
            .bind(&snapshot.last_ip)
            .bind(&snapshot.last_country)
            .bind(&snapshot.last_city)
            .bind(snapshot.last_latitude)
            .bind(snapshot.last_longitude)
            .bind(snapshot.updated_at)
            .execute(&self.pool)
            .instrument(query_span("INSERT", query))
            .await
            .context("failed to upsert login pattern")?;
        Ok(())
    }
}

fn pattern_from_row(row: &PgRow) -> Result<LoginPattern> {
    let countries: String = row.try_get("countries")?;
    let cities: String = row.try_get("cities")?;
    let hours: String = row.try_get("hours")?;
    let device_types: String = row.try_get("device_types")?;

    let snapshot = PatternSnapshot {
        user_id: row.try_get("user_id")?,
        countries: serde_json::from_str(&countries).context("failed to parse countries json")?,
        cities: serde_json::from_str(&cities).context("failed to parse cities json")?,
        hours: serde_json::from_str(&hours).context("failed to parse hours json")?,
        device_types: serde_json::from_str(&device_types)
            .context("failed to parse device_types json")?,
        last_login_at: row.try_get("last_login_at")?,
        last_ip: row.try_get("last_ip")?,
        last_country: row.try_get("last_country")?,
        last_city: row.try_get("last_city")?,
        last_latitude: row.try_get("last_latitude")?,
        last_longitude: row.try_get("last_longitude")?,
        updated_at: row.try_get("updated_at")?,
    };
    Ok(LoginPattern::from_snapshot(snapshot))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn factors_json_round_trip() {
        let factors = vec![RiskFactor::NewDevice, RiskFactor::ImpossibleTravel];
        let json = factors_json(&factors).unwrap();
        assert_eq!(json, r#"["new_device","impossible_travel"]"#);
        assert_eq!(parse_factors(&json).unwrap(), factors);
    }

    #[test]
    fn parse_factors_skips_unknown_names() {
        let parsed = parse_factors(r#"["new_device","future_signal"]"#).unwrap();
        assert_eq!(parsed, vec![RiskFactor::NewDevice]);
    }

    #[test]
    fn parse_factors_rejects_non_arrays() {
        assert!(parse_factors("{}").is_err());
    }
}
