//! End-to-end duplex transport tests: two [`TransportSession`]s wired
//! together over an in-memory pipe, driven through [`spawn_session_io`].

use challenge_sidecar::peers::PeerRole;
use challenge_sidecar::transport::{spawn_session_io, SessionKey, TransportSession};
use std::sync::Arc;

fn shared_session_pair(max_frame_bytes: usize) -> (TransportSession, TransportSession) {
    let salt = [5u8; 32];
    let ikm = [7u8; 32];
    let key_a = SessionKey::derive(&salt, &ikm, PeerRole::Consumer).unwrap();
    let key_b = SessionKey::derive(&salt, &ikm, PeerRole::Consumer).unwrap();
    (
        TransportSession::new(key_a, PeerRole::Consumer, max_frame_bytes),
        TransportSession::new(key_b, PeerRole::Consumer, max_frame_bytes),
    )
}

#[tokio::test]
async fn payload_round_trips_over_a_live_duplex_pipe() {
    let (client_stream, server_stream) = tokio::io::duplex(64 * 1024);
    let (client_key, server_key) = shared_session_pair(16 * 1024 * 1024);

    let client_io = spawn_session_io(client_stream, Arc::new(client_key), 16 * 1024 * 1024, 32, 3600);
    let mut server_io = spawn_session_io(server_stream, Arc::new(server_key), 16 * 1024 * 1024, 32, 3600);

    client_io
        .outbound
        .send(br#"{"job_id":"j1"}"#.to_vec())
        .await
        .unwrap();

    let received = tokio::time::timeout(std::time::Duration::from_secs(5), server_io.inbound_rx.recv())
        .await
        .expect("did not time out")
        .expect("channel not closed");

    assert_eq!(received, br#"{"job_id":"j1"}"#.to_vec());
}

#[tokio::test]
async fn idle_session_closes_with_idle_error() {
    let (client_stream, server_stream) = tokio::io::duplex(4096);
    let (client_key, server_key) = shared_session_pair(16 * 1024 * 1024);

    // Heartbeat interval of 1s means idle fires once 3s pass without any
    // frame; drop the server side immediately so the client observes a
    // dead peer and the resulting IO error tears the session down.
    let client_io = spawn_session_io(client_stream, Arc::new(client_key), 16 * 1024 * 1024, 8, 1);
    let _server_session = server_key;
    drop(server_stream);

    let outcome = tokio::time::timeout(std::time::Duration::from_secs(5), client_io.task)
        .await
        .expect("join did not time out")
        .expect("task did not panic");

    assert!(outcome.is_err());
}
