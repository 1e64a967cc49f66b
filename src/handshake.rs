//! Stream-level session establishment: a one-round exchange of X25519
//! ephemeral public keys and an HKDF salt over a length-delimited JSON
//! handshake, after which the same stream switches into the sealed-frame
//! transport (§4.4).
//!
//! This runs *after* [`crate::identity::bootstrap_with_retry`] has already
//! proven this process's attestation to the peer over the out-of-band
//! nonce/submission channel; only the key-agreement material crosses this
//! stream. `role` is which of the sidecar's two sessions this connection
//! is (fixed in advance by both ends, not negotiated here).

use std::sync::Arc;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use crate::crypto;
use crate::error::{SidecarError, TransportError};
use crate::identity::EphemeralKeyPair;
use crate::peers::PeerRole;
use crate::transport::{spawn_session_io, SessionIo, SessionKey, TransportSession};

/// The one message each side sends before switching to sealed frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct HandshakeHello {
    x25519_pub: [u8; 32],
    salt: [u8; 32],
}

/// Exchange ephemeral public keys and a session salt over `stream`, derive
/// the session key, and spawn the sealed-frame I/O loop.
///
/// Both ends must derive an identical key without a second round trip, so
/// the salt contributed is chosen deterministically: whichever side's
/// ephemeral public key sorts lower contributes its salt.
pub async fn establish_session<T>(
    stream: T,
    role: PeerRole,
    ephemeral: &EphemeralKeyPair,
    max_frame_bytes: usize,
    outbound_queue_depth: usize,
    heartbeat_interval_secs: u64,
) -> Result<(Arc<TransportSession>, SessionIo), SidecarError>
where
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let our_salt: [u8; 32] = crypto::random_bytes(32)
        .try_into()
        .expect("random_bytes(32) is 32 bytes");

    let mut handshake = Framed::new(stream, LengthDelimitedCodec::new());

    let outgoing = HandshakeHello {
        x25519_pub: ephemeral.public(),
        salt: our_salt,
    };
    let encoded = serde_json::to_vec(&outgoing).expect("HandshakeHello always serializes");
    handshake
        .send(Bytes::from(encoded))
        .await
        .map_err(TransportError::Io)?;

    let frame = handshake
        .next()
        .await
        .ok_or(TransportError::Closed)?
        .map_err(TransportError::Io)?;
    let incoming: HandshakeHello = serde_json::from_slice(&frame)
        .map_err(|e| TransportError::Handshake(format!("malformed handshake payload: {e}")))?;

    let ikm = crypto::dh(ephemeral.secret(), &incoming.x25519_pub);
    let salt = if ephemeral.public() < incoming.x25519_pub {
        our_salt
    } else {
        incoming.salt
    };

    let key = SessionKey::derive(&salt, &ikm, role)?;
    let session = Arc::new(TransportSession::new(key, role, max_frame_bytes));

    let parts = handshake.into_parts();
    let io = spawn_session_io(
        parts.io,
        session.clone(),
        max_frame_bytes,
        outbound_queue_depth,
        heartbeat_interval_secs,
    );

    Ok((session, io))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn both_ends_derive_a_session_that_decrypts_each_other() {
        let (client, server) = tokio::io::duplex(64 * 1024);

        let client_ephemeral = EphemeralKeyPair::generate();
        let server_ephemeral = EphemeralKeyPair::generate();

        let client_task = tokio::spawn(async move {
            establish_session(client, PeerRole::Admin, &client_ephemeral, 16 * 1024, 16, 3600).await
        });
        let server_task = tokio::spawn(async move {
            establish_session(server, PeerRole::Admin, &server_ephemeral, 16 * 1024, 16, 3600).await
        });

        let (client_session, client_io) = client_task.await.unwrap().unwrap();
        let (server_session, mut server_io) = server_task.await.unwrap().unwrap();

        client_io.outbound.send(b"ping".to_vec()).await.unwrap();
        let received = server_io.inbound_rx.recv().await.unwrap();
        assert_eq!(received, b"ping");

        let frame = client_session.seal(b"direct").unwrap();
        assert!(server_session.open(&frame).is_ok());

        drop(client_io.task);
        drop(server_io.task);
    }

    #[tokio::test]
    async fn mismatched_roles_still_derive_distinct_keys_and_fail_to_decrypt() {
        let (client, server) = tokio::io::duplex(64 * 1024);

        let client_ephemeral = EphemeralKeyPair::generate();
        let server_ephemeral = EphemeralKeyPair::generate();

        let client_task = tokio::spawn(async move {
            establish_session(client, PeerRole::Admin, &client_ephemeral, 16 * 1024, 16, 3600).await
        });
        let server_task = tokio::spawn(async move {
            establish_session(server, PeerRole::Consumer, &server_ephemeral, 16 * 1024, 16, 3600).await
        });

        let (client_session, _client_io) = client_task.await.unwrap().unwrap();
        let (server_session, _server_io) = server_task.await.unwrap().unwrap();

        let frame = client_session.seal(b"direct").unwrap();
        assert!(server_session.open(&frame).is_err());
    }
}
