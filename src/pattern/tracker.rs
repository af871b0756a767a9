//! Service that folds login attempts into per-user patterns.

use chrono::Timelike;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::TrustResult;
use crate::pattern::models::{LoginObservation, LoginPattern};
use crate::pattern::repo::PatternRepo;
use crate::signals::LoginSignals;

/// Owns the rolling login history for each user.
#[derive(Clone)]
pub struct LoginPatternTracker {
    repo: Arc<dyn PatternRepo>,
    clock: Arc<dyn Clock>,
}

impl LoginPatternTracker {
    #[must_use]
    pub fn new(repo: Arc<dyn PatternRepo>, clock: Arc<dyn Clock>) -> Self {
        Self { repo, clock }
    }

    /// Load the pattern for scoring. `None` means the user has never logged
    /// in successfully.
    ///
    /// # Errors
    /// Returns an error if the pattern lookup fails.
    pub async fn load(&self, user_id: Uuid) -> TrustResult<Option<LoginPattern>> {
        Ok(self.repo.find_pattern(user_id).await?)
    }

    /// Record a successful login: fold the observation into the bounded
    /// histories and overwrite the last-login snapshot.
    ///
    /// # Errors
    /// Returns an error if the pattern read or upsert fails.
    pub async fn record_login(&self, user_id: Uuid, signals: &LoginSignals) -> TrustResult<()> {
        let now = self.clock.now();
        let mut pattern = self
            .repo
            .find_pattern(user_id)
            .await?
            .unwrap_or_else(|| LoginPattern::new(user_id));

        #[allow(clippy::cast_possible_truncation)]
        let observation = LoginObservation {
            country: signals.location.country_key().map(str::to_string),
            city: signals.location.city.clone(),
            hour: now.hour() as u8,
            device_type: signals.device_info.device_type.clone(),
            ip: signals.ip.clone(),
            latitude: signals.location.latitude,
            longitude: signals.location.longitude,
        };
        pattern.record(&observation, now);
        self.repo.save_pattern(&pattern).await?;

        debug!(%user_id, "login pattern updated");
        Ok(())
    }
}
