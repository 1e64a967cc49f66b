//! The encrypted duplex transport: frame codec, session-key agreement, and
//! the replay-safe AEAD sealing layer multiplexed over two peer
//! connections.

pub mod frame;
pub mod session;

pub use frame::{Frame, FrameCodec};
pub use session::{spawn_session_io, OutboundHandle, SessionIo, SessionKey, TransportSession};
