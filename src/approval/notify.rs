//! Out-of-band delivery seam for approval secrets.

use anyhow::Result;
use chrono::{DateTime, Utc};
use secrecy::SecretString;
use tracing::info;
use uuid::Uuid;

/// One token/code pair headed for out-of-band delivery (email in the
/// reference deployment). The secrets stay wrapped; implementations expose
/// them only at the transport boundary and never log them.
pub struct ApprovalDelivery<'a> {
    pub user_id: Uuid,
    pub device_id: &'a str,
    pub token: &'a SecretString,
    pub code: &'a SecretString,
    pub expires_at: DateTime<Utc>,
}

/// Delivery abstraction for approval secrets.
pub trait ApprovalNotifier: Send + Sync {
    /// Deliver a secret pair or return an error so the caller can surface a
    /// retryable failure.
    fn deliver(&self, delivery: &ApprovalDelivery<'_>) -> Result<()>;
}

/// Local dev notifier: logs that a delivery happened, never the secrets.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogNotifier;

impl ApprovalNotifier for LogNotifier {
    fn deliver(&self, delivery: &ApprovalDelivery<'_>) -> Result<()> {
        info!(
            user_id = %delivery.user_id,
            device_id = %delivery.device_id,
            expires_at = %delivery.expires_at,
            "approval delivery stub"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_notifier_accepts_delivery() {
        let delivery = ApprovalDelivery {
            user_id: Uuid::new_v4(),
            device_id: "device-1",
            token: &SecretString::from("token".to_string()),
            code: &SecretString::from("AB12-CD34".to_string()),
            expires_at: Utc::now(),
        };
        assert!(LogNotifier.deliver(&delivery).is_ok());
    }
}
