//! End-to-end engine scenarios: scoring, approval resolution paths, and
//! spoofing re-verification.

use anyhow::Result;
use chrono::{DateTime, Duration, TimeZone, Utc};
use secrecy::ExposeSecret;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use fidem::trust::{hash_secret, ApprovalRequestStatus, DeviceRepo, DeviceStatus};
use fidem::{
    ApprovalDelivery, ApprovalNotifier, Clock, DeviceInfo, FixedClock, GeoLocation, LoginDecision,
    LoginSignals, MemoryStore, PatternRepo, ResolutionChannel, RiskFactor, RiskPolicy,
    SpoofingOutcome, TrustConfig, TrustEngine, TrustError,
};

const BERLIN: (f64, f64) = (52.52, 13.405);
const PARIS: (f64, f64) = (48.8566, 2.3522);
const TOKYO: (f64, f64) = (35.6762, 139.6503);

fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 6, 1, 9, 0, 0).unwrap()
}

fn signals(device_id: &str, country: &str, city: &str, coords: (f64, f64)) -> LoginSignals {
    LoginSignals {
        device_id: device_id.to_string(),
        fingerprint: Some(format!("fp-{device_id}")),
        user_agent: Some("Mozilla/5.0 (X11; Linux x86_64)".to_string()),
        ip: Some("203.0.113.7".to_string()),
        location: GeoLocation {
            country: None,
            country_code: Some(country.to_string()),
            city: Some(city.to_string()),
            latitude: Some(coords.0),
            longitude: Some(coords.1),
        },
        device_info: DeviceInfo {
            browser: Some("Firefox".to_string()),
            browser_version: Some("128.0".to_string()),
            os: Some("Linux".to_string()),
            os_version: None,
            device_type: Some("desktop".to_string()),
        },
    }
}

/// Captures deliveries so tests can use the secrets of flows that only go
/// through the notifier (spoofing re-verification).
#[derive(Default)]
struct CapturingNotifier {
    sent: Mutex<Vec<(String, String, String)>>,
}

impl CapturingNotifier {
    fn last(&self) -> Option<(String, String, String)> {
        self.sent.lock().unwrap().last().cloned()
    }
}

impl ApprovalNotifier for CapturingNotifier {
    fn deliver(&self, delivery: &ApprovalDelivery<'_>) -> Result<()> {
        self.sent.lock().unwrap().push((
            delivery.device_id.to_string(),
            delivery.token.expose_secret().to_string(),
            delivery.code.expose_secret().to_string(),
        ));
        Ok(())
    }
}

struct Fixture {
    repo: Arc<MemoryStore>,
    clock: Arc<FixedClock>,
    notifier: Arc<CapturingNotifier>,
    engine: TrustEngine,
}

fn fixture() -> Fixture {
    let repo = Arc::new(MemoryStore::new());
    let clock = Arc::new(FixedClock::new(base_time()));
    let notifier = Arc::new(CapturingNotifier::default());
    let engine = TrustEngine::new(
        Arc::clone(&repo) as Arc<dyn DeviceRepo>,
        Arc::clone(&repo) as Arc<dyn PatternRepo>,
        Arc::clone(&notifier) as Arc<dyn ApprovalNotifier>,
        Arc::clone(&clock) as Arc<dyn Clock>,
        RiskPolicy::new(),
        TrustConfig::new(),
    );
    Fixture {
        repo,
        clock,
        notifier,
        engine,
    }
}

/// Enroll a user: first login from Berlin on a trusted desktop device.
async fn enroll(fx: &Fixture, user_id: Uuid) -> Result<()> {
    let first = signals("dev-a", "DE", "Berlin", BERLIN);
    match fx.engine.score_login_attempt(user_id, &first).await? {
        LoginDecision::Allow { risk } => assert_eq!(risk.value(), 0),
        other => panic!("first login should be allowed, got {other:?}"),
    }
    fx.engine.create_trusted_device(user_id, &first).await?;
    fx.engine.record_login(user_id, &first).await?;
    Ok(())
}

#[tokio::test]
async fn first_login_never_requires_approval() -> Result<()> {
    let fx = fixture();
    let user_id = Uuid::new_v4();

    // Even a brand-new device in the middle of the night scores zero when
    // there is no history at all.
    let night = Utc.with_ymd_and_hms(2025, 6, 1, 3, 0, 0).unwrap();
    fx.clock.set(night);
    let decision = fx
        .engine
        .score_login_attempt(user_id, &signals("dev-a", "FR", "Paris", PARIS))
        .await?;
    match decision {
        LoginDecision::Allow { risk } => {
            assert_eq!(risk.value(), 0);
            assert!(risk.factors().is_empty());
        }
        other => panic!("expected Allow, got {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn new_device_from_new_country_is_challenged() -> Result<()> {
    let fx = fixture();
    let user_id = Uuid::new_v4();
    enroll(&fx, user_id).await?;

    // Next day, same hour: a brand-new device from France.
    fx.clock.advance(Duration::days(1));
    let attempt = signals("dev-b", "FR", "Paris", PARIS);
    let decision = fx.engine.score_login_attempt(user_id, &attempt).await?;

    let risk = match decision {
        LoginDecision::RequireApproval { risk } => risk,
        other => panic!("expected RequireApproval, got {other:?}"),
    };
    assert!(risk.has_factor(RiskFactor::NewDevice));
    assert!(risk.has_factor(RiskFactor::NewCountry));
    assert!(risk.value() >= 55);

    // Issue the approval and resolve it through the email link.
    let issued = fx
        .engine
        .create_pending_device(user_id, &attempt, &risk)
        .await?;
    let device = fx
        .engine
        .approve_device(issued.token.expose_secret())
        .await?;
    assert_eq!(device.status(), DeviceStatus::Trusted);

    // The link is single-use.
    assert!(matches!(
        fx.engine.approve_device(issued.token.expose_secret()).await,
        Err(TrustError::DeviceAlreadyResolved)
    ));
    Ok(())
}

#[tokio::test]
async fn known_device_from_home_stays_quiet() -> Result<()> {
    let fx = fixture();
    let user_id = Uuid::new_v4();
    enroll(&fx, user_id).await?;

    fx.clock.advance(Duration::days(1));
    let decision = fx
        .engine
        .score_login_attempt(user_id, &signals("dev-a", "DE", "Berlin", BERLIN))
        .await?;
    match decision {
        LoginDecision::Trusted { device } => {
            assert_eq!(device.device_id(), "dev-a");
        }
        other => panic!("expected Trusted, got {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn email_code_approval_accepts_normalized_spelling() -> Result<()> {
    let fx = fixture();
    let user_id = Uuid::new_v4();
    enroll(&fx, user_id).await?;

    fx.clock.advance(Duration::days(1));
    let attempt = signals("dev-b", "FR", "Paris", PARIS);
    let LoginDecision::RequireApproval { risk } =
        fx.engine.score_login_attempt(user_id, &attempt).await?
    else {
        panic!("expected RequireApproval");
    };

    let issued = fx
        .engine
        .create_pending_device(user_id, &attempt, &risk)
        .await?;
    let lowercase = issued.code.expose_secret().replace('-', "").to_lowercase();
    let device = fx
        .engine
        .approve_device_with_code(issued.token.expose_secret(), &lowercase)
        .await?;
    assert_eq!(device.status(), DeviceStatus::Trusted);
    Ok(())
}

#[tokio::test]
async fn session_trust_resolution_invalidates_the_email_path() -> Result<()> {
    let fx = fixture();
    let user_id = Uuid::new_v4();
    enroll(&fx, user_id).await?;

    fx.clock.advance(Duration::days(1));
    let attempt = signals("dev-b", "FR", "Paris", PARIS);
    let LoginDecision::RequireApproval { risk } =
        fx.engine.score_login_attempt(user_id, &attempt).await?
    else {
        panic!("expected RequireApproval");
    };
    let issued = fx
        .engine
        .create_pending_device(user_id, &attempt, &risk)
        .await?;

    // The user approves from their already-trusted companion device.
    let device = fx.engine.resolve_by_session_trust(user_id, "dev-b").await?;
    assert_eq!(device.status(), DeviceStatus::Trusted);

    let request = fx
        .repo
        .find_request_by_token_hash(&hash_secret(issued.token.expose_secret()))
        .await?
        .expect("ledger row");
    assert_eq!(request.status, ApprovalRequestStatus::Approved);
    assert_eq!(request.resolved_by, Some(ResolutionChannel::SessionTrust));

    // The still-circulating email code now reports the resolution rather
    // than judging the code.
    assert!(matches!(
        fx.engine
            .approve_device_with_code(
                issued.token.expose_secret(),
                issued.code.expose_secret()
            )
            .await,
        Err(TrustError::DeviceAlreadyResolved)
    ));
    Ok(())
}

#[tokio::test]
async fn spoofed_trusted_device_is_demoted_and_reverified() -> Result<()> {
    let fx = fixture();
    let user_id = Uuid::new_v4();
    enroll(&fx, user_id).await?;

    // One hour later the same trusted device presents from Tokyo.
    fx.clock.advance(Duration::hours(1));
    let attempt = signals("dev-a", "JP", "Tokyo", TOKYO);

    let decision = fx.engine.score_login_attempt(user_id, &attempt).await?;
    let LoginDecision::Reverify { risk } = decision else {
        panic!("expected Reverify, got {decision:?}");
    };
    assert!(risk.has_factor(RiskFactor::ImpossibleTravel));

    let outcome = fx.engine.check_for_spoofing(user_id, &attempt).await?;
    let SpoofingOutcome::Reverify { risk, .. } = outcome else {
        panic!("expected demotion, got {outcome:?}");
    };
    assert!(risk.has_factor(RiskFactor::ImpossibleTravel));

    // Trusted -> PendingApproval with fresh secrets and a clean counter.
    let device = fx
        .engine
        .store()
        .find_device(user_id, "dev-a")
        .await?
        .expect("device");
    assert_eq!(device.status(), DeviceStatus::PendingApproval);
    assert_eq!(device.trusted_at(), None);
    let approval = device.approval().expect("approval state");
    assert_eq!(approval.attempts(), 0);

    // The new secrets went out through the notifier; the owner re-approves.
    let (device_id, token, _code) = fx.notifier.last().expect("delivery");
    assert_eq!(device_id, "dev-a");
    let device = fx.engine.approve_device(&token).await?;
    assert_eq!(device.status(), DeviceStatus::Trusted);
    Ok(())
}

#[tokio::test]
async fn plausible_reuse_keeps_the_device_trusted() -> Result<()> {
    let fx = fixture();
    let user_id = Uuid::new_v4();
    enroll(&fx, user_id).await?;

    // Paris is reachable from Berlin in three days.
    fx.clock.advance(Duration::days(3));
    let attempt = signals("dev-a", "FR", "Paris", PARIS);
    let outcome = fx.engine.check_for_spoofing(user_id, &attempt).await?;
    assert!(matches!(outcome, SpoofingOutcome::Clear));

    let device = fx
        .engine
        .store()
        .find_device(user_id, "dev-a")
        .await?
        .expect("device");
    assert_eq!(device.status(), DeviceStatus::Trusted);
    Ok(())
}

#[tokio::test]
async fn record_login_shapes_future_scoring() -> Result<()> {
    let fx = fixture();
    let user_id = Uuid::new_v4();
    enroll(&fx, user_id).await?;

    // A second login from Paris teaches the pattern a new country.
    fx.clock.advance(Duration::days(3));
    let paris = signals("dev-a", "FR", "Paris", PARIS);
    fx.engine.record_login(user_id, &paris).await?;

    // A new device from Paris now only carries the new-device signal.
    fx.clock.advance(Duration::days(1));
    let decision = fx
        .engine
        .score_login_attempt(user_id, &signals("dev-b", "FR", "Paris", PARIS))
        .await?;
    let LoginDecision::RequireApproval { risk } = decision else {
        panic!("expected RequireApproval, got {decision:?}");
    };
    assert_eq!(risk.factors(), &[RiskFactor::NewDevice]);
    assert_eq!(risk.value(), 30);
    Ok(())
}

#[tokio::test]
async fn revoked_device_is_terminal_for_the_engine_too() -> Result<()> {
    let fx = fixture();
    let user_id = Uuid::new_v4();
    enroll(&fx, user_id).await?;

    let device = fx.engine.revoke_device(user_id, "dev-a").await?;
    assert_eq!(device.status(), DeviceStatus::Revoked);

    assert!(matches!(
        fx.engine.revoke_device(user_id, "dev-a").await,
        Err(TrustError::DeviceAlreadyResolved)
    ));
    assert!(matches!(
        fx.engine.revoke_device(user_id, "dev-missing").await,
        Err(TrustError::DeviceNotFound)
    ));
    Ok(())
}

#[tokio::test]
async fn devices_are_listed_most_recent_first() -> Result<()> {
    let fx = fixture();
    let user_id = Uuid::new_v4();
    enroll(&fx, user_id).await?;

    fx.clock.advance(Duration::days(1));
    fx.engine
        .create_trusted_device(user_id, &signals("dev-b", "DE", "Berlin", BERLIN))
        .await?;

    let devices = fx.engine.list_devices(user_id).await?;
    let ids: Vec<&str> = devices.iter().map(fidem::Device::device_id).collect();
    assert_eq!(ids, vec!["dev-b", "dev-a"]);
    Ok(())
}
