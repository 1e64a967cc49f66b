//! Typed wrappers over the cryptographic primitives the runtime depends on.
//!
//! Nothing in this module implements a primitive; it only gives the rest of
//! the crate a narrow, typed surface over `ed25519-zebra`, `x25519-dalek`,
//! `chacha20poly1305`, `hkdf` and `sha2` so call sites never touch raw byte
//! slices of unclear provenance. No function here logs its inputs or
//! outputs.

use chacha20poly1305::aead::generic_array::GenericArray;
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::ChaCha20Poly1305;
use ed25519_zebra::{Signature, SigningKey, VerificationKey};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey as XPublicKey, StaticSecret as XSecret};

use crate::error::CryptoError;

/// Length in bytes of an Ed25519 seed / signing key.
pub const ED25519_SEED_LEN: usize = 32;
/// Length in bytes of an X25519 key (public or secret).
pub const X25519_KEY_LEN: usize = 32;
/// Length in bytes of the AEAD nonce used for transport frames and sealed boxes.
pub const AEAD_NONCE_LEN: usize = 12;
/// Length in bytes of a derived session key.
pub const SESSION_KEY_LEN: usize = 32;

/// Fill `n` fresh bytes from the process CSPRNG.
pub fn random_bytes(n: usize) -> Vec<u8> {
    let mut buf = vec![0u8; n];
    rand::rngs::OsRng.fill_bytes(&mut buf);
    buf
}

/// Sign `msg` with a 32-byte Ed25519 seed.
pub fn sign(sk_seed: &[u8; ED25519_SEED_LEN], msg: &[u8]) -> [u8; 64] {
    let sk = SigningKey::from(*sk_seed);
    sk.sign(msg).into()
}

/// Verify an Ed25519 signature. Never panics on malformed input.
pub fn verify(pk: &[u8; 32], msg: &[u8], sig: &[u8; 64]) -> Result<(), CryptoError> {
    let vk = VerificationKey::try_from(*pk).map_err(|_| CryptoError::Verify)?;
    let signature = Signature::from(*sig);
    vk.verify(&signature, msg).map_err(|_| CryptoError::Verify)
}

/// Derive the public key for a 32-byte Ed25519 seed.
pub fn ed25519_public(sk_seed: &[u8; ED25519_SEED_LEN]) -> [u8; 32] {
    let sk = SigningKey::from(*sk_seed);
    VerificationKey::from(&sk).into()
}

/// X25519 Diffie-Hellman. Returns the raw 32-byte shared secret.
pub fn dh(x25519_sk: &[u8; X25519_KEY_LEN], x25519_pk: &[u8; X25519_KEY_LEN]) -> [u8; 32] {
    let secret = XSecret::from(*x25519_sk);
    let public = XPublicKey::from(*x25519_pk);
    secret.diffie_hellman(&public).to_bytes()
}

/// Derive the X25519 public key for a raw 32-byte secret.
pub fn x25519_public(x25519_sk: &[u8; X25519_KEY_LEN]) -> [u8; 32] {
    let secret = XSecret::from(*x25519_sk);
    XPublicKey::from(&secret).to_bytes()
}

/// Generate a fresh X25519 key pair `(secret, public)`.
pub fn x25519_generate() -> ([u8; X25519_KEY_LEN], [u8; X25519_KEY_LEN]) {
    let secret = XSecret::random_from_rng(rand::rngs::OsRng);
    let public = XPublicKey::from(&secret);
    (secret.to_bytes(), public.to_bytes())
}

/// HKDF-SHA256 over `ikm` with the given `salt` and `info`, producing `len` bytes.
pub fn hkdf(salt: &[u8], ikm: &[u8], info: &[u8], len: usize) -> Result<Vec<u8>, CryptoError> {
    let hk = Hkdf::<Sha256>::new(Some(salt), ikm);
    let mut okm = vec![0u8; len];
    hk.expand(info, &mut okm)
        .map_err(|_| CryptoError::InvalidKeyLength {
            expected: 255 * 32,
            actual: len,
        })?;
    Ok(okm)
}

/// Seal `plaintext` under `key`/`nonce` with associated data `aad`. Returns `ciphertext || tag`.
pub fn aead_seal(
    key: &[u8; SESSION_KEY_LEN],
    nonce: &[u8; AEAD_NONCE_LEN],
    aad: &[u8],
    plaintext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher =
        ChaCha20Poly1305::new_from_slice(key).map_err(|_| CryptoError::InvalidKeyLength {
            expected: SESSION_KEY_LEN,
            actual: key.len(),
        })?;
    let nonce = GenericArray::from_slice(nonce);
    cipher
        .encrypt(
            nonce,
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_| CryptoError::Decrypt)
}

/// Open a `ciphertext || tag` blob sealed by [`aead_seal`]. Fails closed on any tamper.
pub fn aead_open(
    key: &[u8; SESSION_KEY_LEN],
    nonce: &[u8; AEAD_NONCE_LEN],
    aad: &[u8],
    ct_and_tag: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher =
        ChaCha20Poly1305::new_from_slice(key).map_err(|_| CryptoError::InvalidKeyLength {
            expected: SESSION_KEY_LEN,
            actual: key.len(),
        })?;
    let nonce = GenericArray::from_slice(nonce);
    cipher
        .decrypt(
            nonce,
            Payload {
                msg: ct_and_tag,
                aad,
            },
        )
        .map_err(|_| CryptoError::Decrypt)
}

/// Convert a long-term Ed25519 seed into an X25519 secret via the standard
/// birational map used by sealed-box schemes. This couples the signing and
/// encryption identities; see `DESIGN.md` for the tradeoff this accepts.
pub fn ed25519_to_x25519(ed_sk_seed: &[u8; ED25519_SEED_LEN]) -> [u8; X25519_KEY_LEN] {
    let hash = Sha256::digest(ed_sk_seed);
    let mut out = [0u8; X25519_KEY_LEN];
    out.copy_from_slice(&hash);
    // Clamp per RFC 7748 so the scalar lands in the correct subgroup.
    out[0] &= 248;
    out[31] &= 127;
    out[31] |= 64;
    out
}

/// Anonymous public-key encryption ("sealed box"): seal `plaintext` to
/// `recipient_pk` using a fresh ephemeral X25519 key pair embedded in the
/// output. The sender does not need (and never learns) the recipient's
/// secret key.
pub fn sealed_seal(recipient_pk: &[u8; X25519_KEY_LEN], plaintext: &[u8]) -> SealedBox {
    let (eph_sk, eph_pk) = x25519_generate();
    let shared = dh(&eph_sk, recipient_pk);
    let key_material = Sha256::digest(shared);
    let mut key = [0u8; SESSION_KEY_LEN];
    key.copy_from_slice(&key_material);

    let nonce_bytes = random_bytes(AEAD_NONCE_LEN);
    let mut nonce = [0u8; AEAD_NONCE_LEN];
    nonce.copy_from_slice(&nonce_bytes);

    // aead_seal only fails on a malformed key, which `key` by construction never is.
    let ciphertext = aead_seal(&key, &nonce, &eph_pk, plaintext).expect("fixed-length key");

    SealedBox {
        ephemeral_pk: eph_pk,
        nonce,
        ciphertext,
    }
}

/// Open a [`SealedBox`] with the recipient's X25519 secret key.
pub fn sealed_open(
    recipient_sk: &[u8; X25519_KEY_LEN],
    sealed: &SealedBox,
) -> Result<Vec<u8>, CryptoError> {
    let shared = dh(recipient_sk, &sealed.ephemeral_pk);
    let key_material = Sha256::digest(shared);
    let mut key = [0u8; SESSION_KEY_LEN];
    key.copy_from_slice(&key_material);
    aead_open(&key, &sealed.nonce, &sealed.ephemeral_pk, &sealed.ciphertext)
}

/// The wire shape of a sealed-box: the sender's ephemeral public key travels
/// alongside the ciphertext since the recipient has no other way to recover it.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SealedBox {
    pub ephemeral_pk: [u8; X25519_KEY_LEN],
    pub nonce: [u8; AEAD_NONCE_LEN],
    pub ciphertext: Vec<u8>,
}

/// SHA-256 digest, hex-encoded. Used for canonical-string hashing in the
/// signed HTTP client and for `report_data` binding in attestation quotes.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_verify_round_trip() {
        let seed = random_bytes(32);
        let seed: [u8; 32] = seed.try_into().unwrap();
        let pk = ed25519_public(&seed);
        let sig = sign(&seed, b"hello");
        assert!(verify(&pk, b"hello", &sig).is_ok());
        assert!(verify(&pk, b"goodbye", &sig).is_err());
    }

    #[test]
    fn verify_fails_under_wrong_key() {
        let seed_a: [u8; 32] = random_bytes(32).try_into().unwrap();
        let seed_b: [u8; 32] = random_bytes(32).try_into().unwrap();
        let pk_b = ed25519_public(&seed_b);
        let sig = sign(&seed_a, b"msg");
        assert!(verify(&pk_b, b"msg", &sig).is_err());
    }

    #[test]
    fn dh_is_symmetric() {
        let (a_sk, a_pk) = x25519_generate();
        let (b_sk, b_pk) = x25519_generate();
        assert_eq!(dh(&a_sk, &b_pk), dh(&b_sk, &a_pk));
    }

    #[test]
    fn aead_round_trip_and_tamper_detection() {
        let key = [7u8; SESSION_KEY_LEN];
        let nonce = [3u8; AEAD_NONCE_LEN];
        let ct = aead_seal(&key, &nonce, b"aad", b"plaintext").unwrap();
        let pt = aead_open(&key, &nonce, b"aad", &ct).unwrap();
        assert_eq!(pt, b"plaintext");

        let mut tampered = ct.clone();
        *tampered.last_mut().unwrap() ^= 0xFF;
        assert!(aead_open(&key, &nonce, b"aad", &tampered).is_err());

        assert!(aead_open(&key, &nonce, b"different-aad", &ct).is_err());
    }

    #[test]
    fn sealed_box_round_trip() {
        let (recipient_sk, recipient_pk) = x25519_generate();
        let sealed = sealed_seal(&recipient_pk, b"postgres://u:p@h/db");
        let opened = sealed_open(&recipient_sk, &sealed).unwrap();
        assert_eq!(opened, b"postgres://u:p@h/db");

        let (other_sk, _) = x25519_generate();
        assert!(sealed_open(&other_sk, &sealed).is_err());
    }

    #[test]
    fn ed25519_to_x25519_is_deterministic() {
        let seed: [u8; 32] = random_bytes(32).try_into().unwrap();
        let a = ed25519_to_x25519(&seed);
        let b = ed25519_to_x25519(&seed);
        assert_eq!(a, b);
    }
}
