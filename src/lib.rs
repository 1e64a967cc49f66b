//! Runtime core for a confidential-computing Challenge sidecar.
//!
//! The sidecar runs inside a TEE and mediates between two privileged peers
//! over an attested, encrypted duplex transport: an Admin (full ORM
//! privileges, delivers migrations and sealed database credentials) and a
//! Consumer (read-only ORM, submits jobs for execution). A small public HTTP
//! surface lets the control plane invoke registered handlers on behalf of
//! third parties, authenticated by a proxy-issued bearer token rather than
//! the peer attestation used internally.
//!
//! # Overview
//!
//! - [`identity`] generates the process's long-term Ed25519 identity and
//!   drives the attestation bootstrap handshake with each peer.
//! - [`transport`] carries AEAD-sealed, replay-safe frames over a duplex
//!   stream once a peer session is attested.
//! - [`peers`] tracks the (at most) one Admin and one Consumer session and
//!   enforces which message kinds each role may send.
//! - [`orm`] enforces per-table, per-column capability policy and routes
//!   database operations to the appropriate peer.
//! - [`http`] signs outbound requests to the Consumer's control-plane
//!   surface.
//! - [`registry`] and [`executor`] resolve and run job and lifecycle
//!   handlers.
//! - [`lifecycle`] drives the startup → ready → serving → drain state
//!   machine.
//! - [`public`] verifies proxy-issued bearer tokens on inbound public calls.
//! - [`handshake`] runs the post-attestation key-agreement round and hands
//!   the stream off to [`transport`].
//! - [`correlation`] and [`credentials`] hold the small bits of
//!   process-lifetime state the dispatch loop needs between frames.
//! - [`wire`] is the plaintext application envelope carried inside sealed
//!   frames.
//! - [`runner`] owns every subsystem above and drives the process from
//!   bootstrap to termination.
//!
//! # Features
#![doc = document_features::document_features!()]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

pub mod config;
pub mod context;
pub mod correlation;
pub mod credentials;
pub mod crypto;
pub mod error;
pub mod executor;
pub mod handshake;
pub mod http;
pub mod identity;
pub mod lifecycle;
pub mod orm;
pub mod peers;
pub mod public;
pub mod registry;
pub mod runner;
pub mod transport;
pub mod wire;

pub use config::{SidecarConfig, SidecarConfigBuilder};
pub use context::{Context, JobRequest, JobResult};
pub use error::SidecarError;
pub use executor::JobExecutor;
pub use lifecycle::{LifecycleOrchestrator, LifecycleState};
pub use public::{MinerClaims, PublicMediator};
pub use registry::HandlerRegistry;
pub use runner::{SidecarRunner, SidecarRunnerBuilder};
