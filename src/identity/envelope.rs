//! The attestation envelope exchanged during peer-session bootstrap.

use serde::{Deserialize, Serialize};

use crate::crypto;
use crate::error::{AttestationError, CryptoError};
use crate::peers::PeerRole;

/// Hardware-attested identity proof submitted once per peer-session
/// bootstrap. The signature covers the concatenation of every other field
/// in declaration order, so a peer that mutates any field (including the
/// declared role) invalidates the signature.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttestationEnvelope {
    pub nonce: [u8; 32],
    pub ed25519_pub: [u8; 32],
    pub x25519_pub: [u8; 32],
    pub tee_quote: Vec<u8>,
    pub event_log: Vec<u8>,
    /// Declared via a signed field per §4.5; the session manager trusts this
    /// only because it is covered by `signature`.
    pub declared_role: PeerRole,
    pub signature: [u8; 64],
}

impl AttestationEnvelope {
    /// Build and sign an envelope. `ed25519_sk_seed` is the long-term
    /// identity key; `x25519_pub` is the per-session ephemeral public key.
    pub fn build(
        ed25519_sk_seed: &[u8; 32],
        x25519_pub: [u8; 32],
        nonce: [u8; 32],
        tee_quote: Vec<u8>,
        event_log: Vec<u8>,
        declared_role: PeerRole,
    ) -> Self {
        let ed25519_pub = crypto::ed25519_public(ed25519_sk_seed);
        let mut unsigned = Self {
            nonce,
            ed25519_pub,
            x25519_pub,
            tee_quote,
            event_log,
            declared_role,
            signature: [0u8; 64],
        };
        let signing_bytes = unsigned.signing_bytes();
        unsigned.signature = crypto::sign(ed25519_sk_seed, &signing_bytes);
        unsigned
    }

    /// The report_data binding expected of the accompanying TEE quote:
    /// `SHA-256(ed25519_pub || x25519_pub || nonce)`.
    pub fn expected_report_data(&self) -> [u8; 32] {
        let mut buf = Vec::with_capacity(96);
        buf.extend_from_slice(&self.ed25519_pub);
        buf.extend_from_slice(&self.x25519_pub);
        buf.extend_from_slice(&self.nonce);
        let digest = crypto::sha256_hex(&buf);
        let mut out = [0u8; 32];
        hex::decode_to_slice(digest, &mut out).expect("sha256_hex always produces 64 hex chars");
        out
    }

    fn signing_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&self.nonce);
        buf.extend_from_slice(&self.ed25519_pub);
        buf.extend_from_slice(&self.x25519_pub);
        buf.extend_from_slice(&self.tee_quote);
        buf.extend_from_slice(&self.event_log);
        buf.push(self.declared_role.wire_tag());
        buf
    }

    /// Verify the envelope's own signature. Does not check freshness or
    /// quote validity; those are the remote peer's responsibility per the
    /// "we produce, they verify" non-goal.
    pub fn verify_signature(&self) -> Result<(), CryptoError> {
        crypto::verify(&self.ed25519_pub, &self.signing_bytes(), &self.signature)
    }
}

/// The peer-side rejection outcome of submitting an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    Accepted,
    Rejected,
}

impl AttestationEnvelope {
    /// Map a peer's raw acceptance flag to a typed result, per §8 scenario
    /// S1 (nonce replay is rejected by the peer, not detected locally).
    pub fn outcome_to_result(outcome: SubmitOutcome) -> Result<(), AttestationError> {
        match outcome {
            SubmitOutcome::Accepted => Ok(()),
            SubmitOutcome::Rejected => {
                Err(AttestationError::Rejected("peer refused envelope".into()))
            }
        }
    }
}
