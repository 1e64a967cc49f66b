//! Error taxonomy for the sidecar runtime.
//!
//! Each domain gets its own `thiserror` enum; [`SidecarError`] rolls them all
//! up for the small number of call sites (`main`, the lifecycle orchestrator)
//! that need to pick a process exit code rather than handle the error locally.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Crypto primitive failures. Never carries key material in its message.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("signature verification failed")]
    Verify,
    #[error("AEAD decryption failed")]
    Decrypt,
    #[error("entropy source unavailable")]
    Entropy,
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },
}

/// Attestation handshake failures.
#[derive(Debug, Error)]
pub enum AttestationError {
    #[error("no TEE quote driver available")]
    QuoteUnavailable,
    #[error("peer rejected attestation: {0}")]
    Rejected(String),
    #[error("attestation envelope expired: issued {issued_at}s ago, max age {max_age_secs}s")]
    Expired { issued_at: u64, max_age_secs: u64 },
    #[error("attestation signature invalid")]
    SignatureInvalid,
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

/// Transport (framing/session) failures. All are session-terminal.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("replayed or out-of-order sequence number")]
    Replay,
    #[error("frame failed integrity check")]
    Integrity,
    #[error("frame exceeds maximum size")]
    Oversize,
    #[error("session idle past heartbeat deadline")]
    Idle,
    #[error("peer closed the connection")]
    Closed,
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed handshake message: {0}")]
    Handshake(String),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

/// ORM bridge failures, surfaced to handlers verbatim. Serializable so a
/// peer's structured error response maps 1:1 onto this taxonomy over the
/// wire.
#[derive(Debug, Error, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OrmError {
    #[error("column not permitted by policy: {0}")]
    Forbidden(String),
    #[error("no Admin session available")]
    NoAdmin,
    #[error("delete requires a non-empty filter set")]
    UnsafeDelete,
    #[error("no rows matched")]
    NotFound,
    #[error("constraint violation: {0}")]
    Constraint(String),
    #[error("query rejected: {0}")]
    SyntaxRejected(String),
    #[error("request timed out")]
    Timeout,
    #[error("request correlation id not found")]
    UnmatchedResponse,
}

/// Job execution failures, surfaced to the Consumer in the reply frame.
/// Never terminates the process.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum JobError {
    #[error("no handler registered for job")]
    NoHandler,
    #[error("sidecar is not in the Serving state")]
    NotReady,
    #[error("handler returned an invalid result: {0}")]
    InvalidResult(String),
    #[error("job execution timed out")]
    Timeout,
}

impl JobError {
    /// The stable wire tag for this error, used in `JobResult::error`
    /// instead of the human-readable `Display` string.
    pub fn tag(&self) -> &'static str {
        match self {
            JobError::NoHandler => "no_handler",
            JobError::NotReady => "not_ready",
            JobError::InvalidResult(_) => "invalid_result",
            JobError::Timeout => "timeout",
        }
    }
}

/// Outbound signed-HTTP failures.
#[derive(Debug, Error)]
pub enum HttpError {
    #[error("http status {code}: {body}")]
    Status { code: u16, body: String },
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("response signature rejected")]
    SignatureRejected,
}

/// Invalid or missing configuration. Terminal.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    #[error("missing required configuration value: {0}")]
    Missing(&'static str),
    #[error("db_version must be in 1..=16, got {0}")]
    DbVersion(i64),
    #[error("dev_mode with an Admin peer requires --allow-insecure-admin")]
    InsecureAdminNotAllowed,
    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Top-level error type. `main` matches on this to choose an exit code.
#[derive(Debug, Error)]
pub enum SidecarError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Attestation(#[from] AttestationError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Orm(#[from] OrmError),
    #[error(transparent)]
    Job(#[from] JobError),
    #[error(transparent)]
    Http(#[from] HttpError),
    #[error("background service failed: {0}")]
    BackgroundService(String),
}

impl SidecarError {
    /// Process exit code per the external-interfaces contract.
    pub fn exit_code(&self) -> i32 {
        match self {
            SidecarError::Config(_) => 2,
            SidecarError::Attestation(_) => 3,
            SidecarError::Transport(_) => 4,
            _ => 1,
        }
    }
}
