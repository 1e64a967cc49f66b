//! Session-key derivation, replay-safe AEAD sealing, and the duplex I/O
//! loop that carries sealed frames over an `AsyncRead + AsyncWrite` stream.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;

use crate::crypto::{self, AEAD_NONCE_LEN, SESSION_KEY_LEN};
use crate::error::{CryptoError, TransportError};
use crate::peers::PeerRole;
use crate::transport::frame::{frame_aad, Frame, FrameCodec};

/// Sentinel plaintext for heartbeat frames. Never produced by application
/// payloads, which are always a structured JSON object at minimum `{}`
/// (two bytes); a single zero byte can't collide with that.
pub const HEARTBEAT_PAYLOAD: &[u8] = &[0u8];

/// The 32-byte AEAD key agreed for one peer connection, derived via
/// HKDF-SHA256 over the X25519 shared secret.
#[derive(Clone)]
pub struct SessionKey([u8; SESSION_KEY_LEN]);

impl SessionKey {
    /// `salt` is the 32-byte random value exchanged in the handshake;
    /// `ikm` is `X25519(self_eph_sk, peer_eph_pk)`; `info` binds the peer
    /// role so the two directions of a connection (each side computing the
    /// same DH output) cannot be confused with a different session.
    pub fn derive(
        salt: &[u8; 32],
        ikm: &[u8; 32],
        peer_role: PeerRole,
    ) -> Result<Self, CryptoError> {
        let info = format!("challenge-sidecar/session/v1/role={peer_role}");
        let bytes = crypto::hkdf(salt, ikm, info.as_bytes(), SESSION_KEY_LEN)?;
        let mut key = [0u8; SESSION_KEY_LEN];
        key.copy_from_slice(&bytes);
        Ok(Self(key))
    }
}

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("SessionKey").field(&"<redacted>").finish()
    }
}

/// Per-connection sealed-frame state: the session key, the peer's declared
/// role (bound into AAD), and the monotonic sequence counters that detect
/// replay in each direction.
pub struct TransportSession {
    key: SessionKey,
    peer_role: PeerRole,
    outbound_seq: AtomicU64,
    /// -1 means "no frame accepted yet"; a receiver rejects any frame whose
    /// seq is <= this value.
    inbound_last_seq: AtomicI64,
    max_frame_bytes: usize,
    closed: AtomicBool,
    last_activity_unix: AtomicU64,
}

impl TransportSession {
    pub fn new(key: SessionKey, peer_role: PeerRole, max_frame_bytes: usize) -> Self {
        Self {
            key,
            peer_role,
            outbound_seq: AtomicU64::new(0),
            inbound_last_seq: AtomicI64::new(-1),
            max_frame_bytes,
            closed: AtomicBool::new(false),
            last_activity_unix: AtomicU64::new(now_unix()),
        }
    }

    /// Seal `plaintext` into the next outbound frame.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Frame, TransportError> {
        let seq = self.outbound_seq.fetch_add(1, Ordering::SeqCst);
        let nonce_bytes = crypto::random_bytes(AEAD_NONCE_LEN);
        let mut nonce = [0u8; AEAD_NONCE_LEN];
        nonce.copy_from_slice(&nonce_bytes);

        let aad = frame_aad(self.peer_role.wire_tag(), seq);
        let ciphertext = crypto::aead_seal(&self.key.0, &nonce, &aad, plaintext)?;
        let frame = Frame {
            seq,
            nonce,
            ciphertext,
        };
        if frame.wire_len() > self.max_frame_bytes {
            return Err(TransportError::Oversize);
        }
        Ok(frame)
    }

    /// Authenticate, decrypt, and replay-check an inbound frame.
    pub fn open(&self, frame: &Frame) -> Result<Vec<u8>, TransportError> {
        if frame.wire_len() > self.max_frame_bytes {
            return Err(TransportError::Oversize);
        }

        let last = self.inbound_last_seq.load(Ordering::SeqCst);
        if frame.seq as i64 <= last {
            return Err(TransportError::Replay);
        }

        let aad = frame_aad(self.peer_role.wire_tag(), frame.seq);
        let plaintext = crypto::aead_open(&self.key.0, &frame.nonce, &aad, &frame.ciphertext)
            .map_err(|_| TransportError::Integrity)?;

        self.inbound_last_seq.store(frame.seq as i64, Ordering::SeqCst);
        self.last_activity_unix.store(now_unix(), Ordering::SeqCst);
        Ok(plaintext)
    }

    pub fn record_outbound_activity(&self) {
        self.last_activity_unix.store(now_unix(), Ordering::SeqCst);
    }

    /// Whether no frame has arrived for `3 * heartbeat_interval_secs`.
    pub fn is_idle(&self, heartbeat_interval_secs: u64) -> bool {
        let elapsed = now_unix().saturating_sub(self.last_activity_unix.load(Ordering::SeqCst));
        elapsed > 3 * heartbeat_interval_secs
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

fn now_unix() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Handle for enqueuing outbound application payloads onto a session's
/// writer task. Enqueue suspends the caller when the bounded queue is
/// full, propagating backpressure per §5.
#[derive(Clone)]
pub struct OutboundHandle {
    tx: mpsc::Sender<Vec<u8>>,
}

impl OutboundHandle {
    pub async fn send(&self, payload: Vec<u8>) -> Result<(), TransportError> {
        self.tx
            .send(payload)
            .await
            .map_err(|_| TransportError::Closed)
    }
}

/// Drives the duplex I/O loop for one peer connection: a single writer task
/// owns the outbound stream half and drains a bounded channel (so any task
/// may enqueue frames without touching the socket directly); inbound frames
/// are decoded, authenticated and handed to the caller via `inbound_rx`.
/// A heartbeat frame is sent every `heartbeat_interval_secs`; if no frame
/// (inbound or outbound) has been observed for `3 * heartbeat_interval_secs`
/// the loop exits with [`TransportError::Idle`].
pub struct SessionIo {
    pub outbound: OutboundHandle,
    pub inbound_rx: mpsc::Receiver<Vec<u8>>,
    pub task: tokio::task::JoinHandle<Result<(), TransportError>>,
}

pub fn spawn_session_io<T>(
    stream: T,
    session: Arc<TransportSession>,
    max_frame_bytes: usize,
    outbound_queue_depth: usize,
    heartbeat_interval_secs: u64,
) -> SessionIo
where
    T: AsyncRead + AsyncWrite + Send + 'static,
{
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Vec<u8>>(outbound_queue_depth);
    let (inbound_tx, inbound_rx) = mpsc::channel::<Vec<u8>>(outbound_queue_depth);

    let task = tokio::spawn(async move {
        let mut framed = Framed::new(stream, FrameCodec::new(max_frame_bytes));
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(
            heartbeat_interval_secs.max(1),
        ));

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if session.is_idle(heartbeat_interval_secs) {
                        tracing::warn!("session idle past heartbeat deadline, closing");
                        session.close();
                        return Err(TransportError::Idle);
                    }
                    let frame = session.seal(HEARTBEAT_PAYLOAD)?;
                    session.record_outbound_activity();
                    framed.send(frame).await.map_err(|_| TransportError::Closed)?;
                }
                maybe_payload = outbound_rx.recv() => {
                    match maybe_payload {
                        Some(payload) => {
                            let frame = session.seal(&payload)?;
                            session.record_outbound_activity();
                            framed.send(frame).await.map_err(|_| TransportError::Closed)?;
                        }
                        None => {
                            tracing::debug!("outbound channel closed, ending session io loop");
                            return Ok(());
                        }
                    }
                }
                maybe_frame = framed.next() => {
                    match maybe_frame {
                        Some(Ok(frame)) => {
                            let plaintext = session.open(&frame)?;
                            if plaintext == HEARTBEAT_PAYLOAD {
                                continue;
                            }
                            if inbound_tx.send(plaintext).await.is_err() {
                                return Ok(());
                            }
                        }
                        Some(Err(e)) => {
                            session.close();
                            return Err(e);
                        }
                        None => {
                            tracing::info!("peer closed the connection");
                            return Err(TransportError::Closed);
                        }
                    }
                }
            }

            if session.is_closed() {
                return Ok(());
            }
        }
    });

    SessionIo {
        outbound: OutboundHandle { tx: outbound_tx },
        inbound_rx,
        task,
    }
}
