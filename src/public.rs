//! The public-endpoint mediator (§4.10): verifies the bearer claim set the
//! control plane attaches to proxied public HTTP calls before a handler ever
//! sees the request.

use std::time::{SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crate::crypto;
use crate::error::AttestationError;

/// The claim set carried by the bearer token on an inbound public call.
/// Field order is part of the signed representation: the signature covers
/// the canonical JSON serialization of this struct with `sig` cleared, so
/// changing field order is a wire-format change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MinerClaims {
    pub uid: u64,
    pub miner_hotkey: String,
    pub job_id: String,
    pub challenge_id: String,
    pub job_type: String,
    pub issued_at: u64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    sig: Option<String>,
}

impl MinerClaims {
    fn canonical_bytes(&self) -> Vec<u8> {
        let mut unsigned = self.clone();
        unsigned.sig = None;
        // Safe: MinerClaims contains only primitives and strings, never fails.
        serde_json::to_vec(&unsigned).expect("MinerClaims always serializes")
    }

    fn signature_bytes(&self) -> Result<[u8; 64], AttestationError> {
        let sig = self
            .sig
            .as_ref()
            .ok_or_else(|| AttestationError::Rejected("missing signature".into()))?;
        let raw = BASE64
            .decode(sig)
            .map_err(|_| AttestationError::Rejected("malformed signature encoding".into()))?;
        raw.try_into()
            .map_err(|_| AttestationError::Rejected("signature is not 64 bytes".into()))
    }
}

/// Verifies bearer tokens against the Admin's long-term public key recorded
/// at handshake and rejects any older than `ttl_secs`.
pub struct PublicMediator {
    admin_public_key: [u8; 32],
    ttl_secs: u64,
}

impl PublicMediator {
    pub fn new(admin_public_key: [u8; 32], ttl_secs: u64) -> Self {
        Self {
            admin_public_key,
            ttl_secs,
        }
    }

    /// Verify a claim set: signature first, then freshness. Order matters —
    /// an attacker must not learn the TTL window before forging a signature.
    pub fn verify(&self, claims: &MinerClaims) -> Result<MinerClaims, AttestationError> {
        let signature = claims.signature_bytes()?;
        crypto::verify(&self.admin_public_key, &claims.canonical_bytes(), &signature)
            .map_err(|_| AttestationError::SignatureInvalid)?;

        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let age = now.saturating_sub(claims.issued_at);
        if age > self.ttl_secs {
            return Err(AttestationError::Expired {
                issued_at: claims.issued_at,
                max_age_secs: self.ttl_secs,
            });
        }

        Ok(claims.clone())
    }
}
