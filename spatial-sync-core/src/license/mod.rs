//! Licensing
//!
//! Offline-verified entitlement that caps participant count and session length.

mod gate;
mod key;

pub use gate::{LicenseConfig, LicenseError, LicenseGate, LicenseState, Tier, TierLimits};
pub use key::{encode_vendor_key, issue_key, verify_key, LicensePayload};
