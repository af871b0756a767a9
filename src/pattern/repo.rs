//! Persistence seam for login patterns.

use anyhow::Result;
use async_trait::async_trait;
use uuid::Uuid;

use crate::pattern::models::LoginPattern;

/// Storage for the one-per-user login pattern row.
///
/// `save` is an upsert: the pattern is created lazily on the first recorded
/// login.
#[async_trait]
pub trait PatternRepo: Send + Sync {
    async fn find_pattern(&self, user_id: Uuid) -> Result<Option<LoginPattern>>;

    async fn save_pattern(&self, pattern: &LoginPattern) -> Result<()>;
}
