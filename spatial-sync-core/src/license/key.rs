//! Licence key codec
//!
//! A key is `base64url(payload JSON) "." base64url(ed25519 signature)`.
//! Verification is offline against the vendor public key.

use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use libp2p::identity::{Keypair, PublicKey};
use serde::{Deserialize, Serialize};

use super::gate::{LicenseError, Tier};

/// Signed contents of a licence key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LicensePayload {
    pub bundle_id: String,
    pub tier: Tier,
    /// Unix seconds; no expiry when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<u64>,
}

/// Sign a payload into a licence key
pub fn issue_key(keypair: &Keypair, payload: &LicensePayload) -> Result<String, LicenseError> {
    let bytes = serde_json::to_vec(payload).map_err(|e| LicenseError::Malformed(e.to_string()))?;
    let signature = keypair
        .sign(&bytes)
        .map_err(|e| LicenseError::Signing(e.to_string()))?;

    Ok(format!(
        "{}.{}",
        URL_SAFE_NO_PAD.encode(bytes),
        URL_SAFE_NO_PAD.encode(signature)
    ))
}

/// Check the signature and decode the payload. Bundle and expiry checks are the gate's job.
pub fn verify_key(key: &str, vendor_key: &PublicKey) -> Result<LicensePayload, LicenseError> {
    let (payload_part, signature_part) = key
        .trim()
        .split_once('.')
        .ok_or_else(|| LicenseError::Malformed("missing signature section".to_string()))?;

    let payload = URL_SAFE_NO_PAD
        .decode(payload_part)
        .map_err(|e| LicenseError::Malformed(format!("payload: {}", e)))?;
    let signature = URL_SAFE_NO_PAD
        .decode(signature_part)
        .map_err(|e| LicenseError::Malformed(format!("signature: {}", e)))?;

    if !vendor_key.verify(&payload, &signature) {
        return Err(LicenseError::BadSignature);
    }

    serde_json::from_slice(&payload).map_err(|e| LicenseError::Malformed(e.to_string()))
}

/// Encode a vendor public key for [`super::LicenseConfig::vendor_public_key`]
pub fn encode_vendor_key(key: &PublicKey) -> String {
    STANDARD.encode(key.encode_protobuf())
}

pub(crate) fn decode_vendor_key(encoded: &str) -> Result<PublicKey, LicenseError> {
    let bytes = STANDARD
        .decode(encoded.trim())
        .map_err(|e| LicenseError::InvalidVendorKey(e.to_string()))?;
    PublicKey::try_decode_protobuf(&bytes).map_err(|e| LicenseError::InvalidVendorKey(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload() -> LicensePayload {
        LicensePayload {
            bundle_id: "com.example.theater".to_string(),
            tier: Tier::Pro,
            expires_at: None,
        }
    }

    #[test]
    fn test_issued_key_verifies() {
        let vendor = Keypair::generate_ed25519();
        let key = issue_key(&vendor, &payload()).unwrap();

        let decoded = verify_key(&key, &vendor.public()).unwrap();
        assert_eq!(decoded, payload());
    }

    #[test]
    fn test_foreign_signature_rejected() {
        let vendor = Keypair::generate_ed25519();
        let forger = Keypair::generate_ed25519();
        let key = issue_key(&forger, &payload()).unwrap();

        assert!(matches!(
            verify_key(&key, &vendor.public()),
            Err(LicenseError::BadSignature)
        ));
    }

    #[test]
    fn test_tampered_payload_rejected() {
        let vendor = Keypair::generate_ed25519();
        let key = issue_key(&vendor, &payload()).unwrap();
        let (_, sig) = key.split_once('.').unwrap();

        let upgraded = LicensePayload {
            tier: Tier::Enterprise,
            ..payload()
        };
        let forged = format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(serde_json::to_vec(&upgraded).unwrap()),
            sig
        );
        assert!(matches!(
            verify_key(&forged, &vendor.public()),
            Err(LicenseError::BadSignature)
        ));
    }

    #[test]
    fn test_malformed_keys() {
        let vendor = Keypair::generate_ed25519();
        assert!(matches!(
            verify_key("not-a-key", &vendor.public()),
            Err(LicenseError::Malformed(_))
        ));
        assert!(matches!(
            verify_key("@@@.###", &vendor.public()),
            Err(LicenseError::Malformed(_))
        ));
    }

    #[test]
    fn test_vendor_key_encoding() {
        let vendor = Keypair::generate_ed25519();
        let encoded = encode_vendor_key(&vendor.public());
        assert_eq!(decode_vendor_key(&encoded).unwrap(), vendor.public());
        assert!(decode_vendor_key("!!").is_err());
    }
}
