//! Device trust: the pending/trusted/revoked state machine, approval
//! secrets, and the store that drives both.

mod models;
mod repo;
mod secrets;
mod store;

pub use models::{
    ApprovalRequest, ApprovalRequestStatus, ApprovalState, Device, DeviceStatus, ResolutionChannel,
};
pub use repo::{
    DeviceInsertOutcome, DeviceRepo, DeviceUpdateOutcome, RequestInsertOutcome,
};
pub use secrets::{hash_code, hash_secret, normalize_code, CODE_ALPHABET, CODE_LENGTH};
pub use store::{DeviceTrustStore, IssuedApproval, TrustConfig};

pub(crate) use models::DeviceSnapshot;
