//! Long-term process identity and the peer-session bootstrap/attestation
//! handshake.

pub mod envelope;
pub mod quote;

pub use envelope::{AttestationEnvelope, SubmitOutcome};
pub use quote::{DevQuoteProvider, NativeQuoteProvider, Quote, QuoteProvider};

use zeroize::Zeroize;

use crate::crypto;
use crate::error::AttestationError;
use crate::peers::PeerRole;

/// Number of bootstrap attempts before an attestation failure becomes
/// terminal (process exit code 3, per §6).
pub const MAX_BOOTSTRAP_ATTEMPTS: u32 = 3;

/// The process's long-term Ed25519 signing identity. Generated once at
/// startup and held for the process lifetime; zeroized on drop.
pub struct Identity {
    seed: [u8; 32],
    public: [u8; 32],
}

impl Identity {
    /// Generate a fresh long-term identity.
    pub fn generate() -> Self {
        let seed_vec = crypto::random_bytes(32);
        let seed: [u8; 32] = seed_vec.try_into().expect("random_bytes(32) is 32 bytes");
        let public = crypto::ed25519_public(&seed);
        Self { seed, public }
    }

    /// Long-term Ed25519 public key.
    pub fn public_key(&self) -> [u8; 32] {
        self.public
    }

    /// Long-term seed, for signing and for the Ed25519→X25519 conversion
    /// used by the sealed-credentials scheme. Never logged; callers must
    /// not persist this beyond process lifetime.
    pub fn seed(&self) -> &[u8; 32] {
        &self.seed
    }

    /// Sign an arbitrary message with the long-term identity key.
    pub fn sign(&self, msg: &[u8]) -> [u8; 64] {
        crypto::sign(&self.seed, msg)
    }

    /// The X25519 secret key used to open `credentials.seal` sealed boxes,
    /// derived from the long-term Ed25519 seed via the birational map.
    /// Couples signing and encryption identities; see `DESIGN.md`.
    pub fn x25519_secret(&self) -> [u8; 32] {
        crypto::ed25519_to_x25519(&self.seed)
    }
}

impl Drop for Identity {
    fn drop(&mut self) {
        self.seed.zeroize();
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("public", &hex::encode(self.public))
            .finish_non_exhaustive()
    }
}

/// Per-session X25519 ephemeral key pair. Never reused across sessions;
/// zeroized on drop.
pub struct EphemeralKeyPair {
    secret: [u8; 32],
    public: [u8; 32],
}

impl EphemeralKeyPair {
    pub fn generate() -> Self {
        let (secret, public) = crypto::x25519_generate();
        Self { secret, public }
    }

    pub fn public(&self) -> [u8; 32] {
        self.public
    }

    pub fn secret(&self) -> &[u8; 32] {
        &self.secret
    }
}

impl Drop for EphemeralKeyPair {
    fn drop(&mut self) {
        self.secret.zeroize();
    }
}

impl std::fmt::Debug for EphemeralKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EphemeralKeyPair")
            .field("public", &hex::encode(self.public))
            .finish_non_exhaustive()
    }
}

/// Supplies the 32-byte anti-replay nonce from the peer over the
/// unauthenticated pre-handshake channel.
pub trait NonceSource: Send + Sync {
    fn fetch_nonce(&self) -> impl std::future::Future<Output = Result<[u8; 32], AttestationError>> + Send;
}

/// Submits a built envelope to the peer and reports whether it was accepted.
pub trait EnvelopeSubmitter: Send + Sync {
    fn submit(
        &self,
        envelope: &AttestationEnvelope,
    ) -> impl std::future::Future<Output = Result<SubmitOutcome, AttestationError>> + Send;
}

/// Run the bootstrap handshake once: fetch a nonce, obtain a quote bound to
/// `SHA-256(ed25519_pub || x25519_pub || nonce)`, build and sign the
/// envelope, and submit it.
pub async fn bootstrap_once(
    identity: &Identity,
    ephemeral: &EphemeralKeyPair,
    role: PeerRole,
    dev_mode: bool,
    nonce_source: &impl NonceSource,
    quote_provider: &dyn QuoteProvider,
    submitter: &impl EnvelopeSubmitter,
) -> Result<AttestationEnvelope, AttestationError> {
    let nonce = nonce_source.fetch_nonce().await?;

    let mut report_data_input = Vec::with_capacity(96);
    report_data_input.extend_from_slice(&identity.public_key());
    report_data_input.extend_from_slice(&ephemeral.public());
    report_data_input.extend_from_slice(&nonce);
    let mut report_data = [0u8; 32];
    let digest = crypto::sha256_hex(&report_data_input);
    hex::decode_to_slice(digest, &mut report_data).expect("sha256_hex is 64 hex chars");

    let quote = if dev_mode {
        DevQuoteProvider.quote(report_data)?
    } else {
        quote_provider.quote(report_data)?
    };

    let envelope = AttestationEnvelope::build(
        identity.seed(),
        ephemeral.public(),
        nonce,
        quote.quote_bytes,
        quote.event_log,
        role,
    );

    let outcome = submitter.submit(&envelope).await?;
    AttestationEnvelope::outcome_to_result(outcome)?;
    Ok(envelope)
}

/// Run the bootstrap handshake with up to [`MAX_BOOTSTRAP_ATTEMPTS`]
/// retries. Exhausting the budget is terminal to the process (exit code 3).
pub async fn bootstrap_with_retry(
    identity: &Identity,
    ephemeral: &EphemeralKeyPair,
    role: PeerRole,
    dev_mode: bool,
    nonce_source: &impl NonceSource,
    quote_provider: &dyn QuoteProvider,
    submitter: &impl EnvelopeSubmitter,
) -> Result<AttestationEnvelope, AttestationError> {
    let mut last_err = None;
    for attempt in 1..=MAX_BOOTSTRAP_ATTEMPTS {
        match bootstrap_once(
            identity,
            ephemeral,
            role,
            dev_mode,
            nonce_source,
            quote_provider,
            submitter,
        )
        .await
        {
            Ok(envelope) => return Ok(envelope),
            Err(e) => {
                tracing::warn!(attempt, error = %e, "attestation bootstrap attempt failed");
                last_err = Some(e);
                if attempt < MAX_BOOTSTRAP_ATTEMPTS {
                    let backoff = std::time::Duration::from_millis(100 * 2u64.pow(attempt - 1));
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }
    Err(last_err.expect("loop runs at least once"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FixedNonce(u8);
    impl NonceSource for FixedNonce {
        async fn fetch_nonce(&self) -> Result<[u8; 32], AttestationError> {
            Ok([self.0; 32])
        }
    }

    struct AcceptOnce {
        calls: AtomicU32,
    }
    impl EnvelopeSubmitter for AcceptOnce {
        async fn submit(
            &self,
            _envelope: &AttestationEnvelope,
        ) -> Result<SubmitOutcome, AttestationError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n == 0 {
                Ok(SubmitOutcome::Accepted)
            } else {
                Ok(SubmitOutcome::Rejected)
            }
        }
    }

    struct AlwaysReject;
    impl EnvelopeSubmitter for AlwaysReject {
        async fn submit(
            &self,
            _envelope: &AttestationEnvelope,
        ) -> Result<SubmitOutcome, AttestationError> {
            Ok(SubmitOutcome::Rejected)
        }
    }

    #[tokio::test]
    async fn dev_mode_bootstrap_succeeds_and_binds_report_data() {
        let identity = Identity::generate();
        let ephemeral = EphemeralKeyPair::generate();
        let nonce_source = FixedNonce(1);
        let submitter = AcceptOnce {
            calls: AtomicU32::new(0),
        };

        let envelope = bootstrap_once(
            &identity,
            &ephemeral,
            PeerRole::Consumer,
            true,
            &nonce_source,
            &NativeQuoteProvider,
            &submitter,
        )
        .await
        .unwrap();

        assert_eq!(envelope.ed25519_pub, identity.public_key());
        assert_eq!(envelope.x25519_pub, ephemeral.public());
        assert_eq!(envelope.expected_report_data().len(), 32);
        assert!(envelope.verify_signature().is_ok());
    }

    #[tokio::test]
    async fn repeated_rejection_is_terminal_after_retry_budget() {
        let identity = Identity::generate();
        let ephemeral = EphemeralKeyPair::generate();
        let nonce_source = FixedNonce(2);

        let err = bootstrap_with_retry(
            &identity,
            &ephemeral,
            PeerRole::Admin,
            true,
            &nonce_source,
            &NativeQuoteProvider,
            &AlwaysReject,
        )
        .await
        .unwrap_err();

        assert!(matches!(err, AttestationError::Rejected(_)));
    }

    #[tokio::test]
    async fn real_quote_provider_without_dev_mode_fails_without_driver() {
        let identity = Identity::generate();
        let ephemeral = EphemeralKeyPair::generate();
        let nonce_source = FixedNonce(3);
        let submitter = AcceptOnce {
            calls: AtomicU32::new(0),
        };

        let err = bootstrap_once(
            &identity,
            &ephemeral,
            PeerRole::Consumer,
            false,
            &nonce_source,
            &NativeQuoteProvider,
            &submitter,
        )
        .await
        .unwrap_err();

        assert!(matches!(err, AttestationError::QuoteUnavailable));
    }
}
