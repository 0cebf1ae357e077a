//! License Gate
//!
//! The tier is fixed once per process: either by [`LicenseGate::activate`] or,
//! if nothing activated first, by the first component that reads it (free tier).
//! Enforcement is local: an over-limit participant detaches itself and nobody else.

use std::sync::OnceLock;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::key::{decode_vendor_key, verify_key};
use crate::session::JoinFailureReason;

/// Entitlement tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Free,
    Pro,
    Enterprise,
}

impl Tier {
    pub fn limits(&self) -> TierLimits {
        match self {
            Tier::Free => TierLimits {
                max_participants: Some(2),
                max_duration: Some(Duration::from_secs(15 * 60)),
            },
            Tier::Pro => TierLimits {
                max_participants: Some(8),
                max_duration: Some(Duration::from_secs(4 * 60 * 60)),
            },
            Tier::Enterprise => TierLimits {
                max_participants: None,
                max_duration: None,
            },
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Free => "free",
            Tier::Pro => "pro",
            Tier::Enterprise => "enterprise",
        }
    }
}

/// Caps enforced for a tier; `None` means unlimited
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierLimits {
    pub max_participants: Option<usize>,
    pub max_duration: Option<Duration>,
}

#[derive(Debug, Error)]
pub enum LicenseError {
    #[error("Malformed licence key: {0}")]
    Malformed(String),

    #[error("Licence signature does not verify")]
    BadSignature,

    #[error("Licence issued for {expected}, running as {actual}")]
    BundleMismatch { expected: String, actual: String },

    #[error("Licence expired")]
    Expired,

    #[error("No vendor key configured, cannot verify licence")]
    NoVendorKey,

    #[error("Invalid vendor key: {0}")]
    InvalidVendorKey(String),

    #[error("Failed to sign licence: {0}")]
    Signing(String),
}

/// Licence settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LicenseConfig {
    /// Bundle identifier of the running app; keys are bound to it
    pub bundle_id: String,
    /// Base64 protobuf-encoded ed25519 public key of the licence issuer
    pub vendor_public_key: Option<String>,
}

/// Entitlement in effect for this process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LicenseState {
    pub tier: Tier,
    pub bundle_id: String,
    pub expires_at: Option<u64>,
    /// Whether a signed key backs this state
    pub verified: bool,
}

impl LicenseState {
    fn free(bundle_id: &str) -> Self {
        Self {
            tier: Tier::Free,
            bundle_id: bundle_id.to_string(),
            expires_at: None,
            verified: false,
        }
    }
}

/// Computes the tier once and checks session limits against it
#[derive(Debug)]
pub struct LicenseGate {
    config: LicenseConfig,
    state: OnceLock<LicenseState>,
}

impl LicenseGate {
    pub fn new(config: LicenseConfig) -> Self {
        Self {
            config,
            state: OnceLock::new(),
        }
    }

    /// Verify `key` and fix the tier. Without a key the tier is free.
    ///
    /// On verification failure the tier is fixed to free and the error returned.
    /// Once the tier is fixed, further calls only log and return it.
    pub fn activate(&self, key: Option<&str>) -> Result<Tier, LicenseError> {
        if let Some(existing) = self.state.get() {
            warn!(
                "Licence activation ignored: tier already fixed to {} (activate before creating sessions)",
                existing.tier.as_str()
            );
            return Ok(existing.tier);
        }

        let (state, result) = match key {
            None => (LicenseState::free(&self.config.bundle_id), Ok(Tier::Free)),
            Some(key) => match self.verify(key) {
                Ok(state) => {
                    let tier = state.tier;
                    (state, Ok(tier))
                }
                Err(e) => {
                    warn!("Licence verification failed, using free tier: {}", e);
                    (LicenseState::free(&self.config.bundle_id), Err(e))
                }
            },
        };

        let tier = state.tier;
        if self.state.set(state).is_err() {
            warn!("Licence state was fixed concurrently, activation ignored");
            return Ok(self.state().tier);
        }

        info!("Licence activated: tier={}", tier.as_str());
        result
    }

    fn verify(&self, key: &str) -> Result<LicenseState, LicenseError> {
        let encoded = self
            .config
            .vendor_public_key
            .as_deref()
            .ok_or(LicenseError::NoVendorKey)?;
        let vendor_key = decode_vendor_key(encoded)?;
        let payload = verify_key(key, &vendor_key)?;

        if payload.bundle_id != self.config.bundle_id {
            return Err(LicenseError::BundleMismatch {
                expected: payload.bundle_id,
                actual: self.config.bundle_id.clone(),
            });
        }

        if let Some(expires_at) = payload.expires_at {
            let now = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs();
            if now >= expires_at {
                return Err(LicenseError::Expired);
            }
        }

        Ok(LicenseState {
            tier: payload.tier,
            bundle_id: payload.bundle_id,
            expires_at: payload.expires_at,
            verified: true,
        })
    }

    /// The state in effect. Reading fixes it (free) if nothing was activated.
    pub fn state(&self) -> &LicenseState {
        self.state.get_or_init(|| {
            debug!("No licence activated before first use, fixing free tier");
            LicenseState::free(&self.config.bundle_id)
        })
    }

    pub fn tier(&self) -> Tier {
        self.state().tier
    }

    /// Whether the tier has been fixed (activation or first read)
    pub fn is_fixed(&self) -> bool {
        self.state.get().is_some()
    }

    pub fn check_participants(&self, count: usize) -> Result<(), JoinFailureReason> {
        match self.tier().limits().max_participants {
            Some(max) if count > max => Err(JoinFailureReason::ParticipantLimitExceeded),
            _ => Ok(()),
        }
    }

    pub fn check_duration(&self, elapsed: Duration) -> Result<(), JoinFailureReason> {
        match self.tier().limits().max_duration {
            Some(max) if elapsed >= max => Err(JoinFailureReason::SessionTimeLimitExceeded),
            _ => Ok(()),
        }
    }
}
