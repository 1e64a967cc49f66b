//! Peer roles and the session manager that admits, tracks and displaces
//! the two privileged peer connections.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::TransportError;
use crate::transport::{OutboundHandle, TransportSession};

/// The two distinguished peer roles. Exactly one session of each role may
/// be active at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerRole {
    Admin,
    Consumer,
}

impl PeerRole {
    /// The single-byte role tag bound into frame AAD as `"role=" || role_byte`.
    pub fn wire_tag(self) -> u8 {
        match self {
            PeerRole::Admin => b'A',
            PeerRole::Consumer => b'C',
        }
    }
}

impl std::fmt::Display for PeerRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerRole::Admin => write!(f, "admin"),
            PeerRole::Consumer => write!(f, "consumer"),
        }
    }
}

/// The kinds of inbound application messages the session manager admits or
/// rejects by role, per §4.5.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    MigrationsApply,
    OrmRead,
    OrmWrite,
    OrmDdl,
    JobExecute,
    CredentialsSeal,
}

/// Whether `role` may send a message of `kind`, per the admission table in
/// §4.5. This is a pure function so it is trivially unit-testable without
/// standing up a transport.
pub fn is_admitted(role: PeerRole, kind: MessageKind) -> bool {
    use MessageKind::*;
    use PeerRole::*;
    match (kind, role) {
        (MigrationsApply, Admin) => true,
        (MigrationsApply, Consumer) => false,
        (OrmRead, _) => true,
        (OrmWrite, Admin) | (OrmDdl, Admin) => true,
        (OrmWrite, Consumer) | (OrmDdl, Consumer) => false,
        (JobExecute, Consumer) => true,
        (JobExecute, Admin) => false,
        (CredentialsSeal, Admin) => true,
        (CredentialsSeal, Consumer) => false,
    }
}

/// Holds the single active session for a role, its outbound write handle,
/// and whether a `credentials.seal` has already been accepted for this
/// process lifetime.
struct RoleSlot {
    session: Option<Arc<TransportSession>>,
    outbound: Option<OutboundHandle>,
}

/// Tracks up to two concurrent peer sessions, one per [`PeerRole`], and
/// enforces the role-based message admission rules. A second connection of
/// an already-occupied role displaces the previous session once its
/// handshake completes successfully.
pub struct PeerSessionManager {
    slots: RwLock<HashMap<PeerRole, RoleSlot>>,
    credentials_sealed_once: std::sync::atomic::AtomicBool,
}

impl Default for PeerSessionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl PeerSessionManager {
    pub fn new() -> Self {
        let mut slots = HashMap::new();
        slots.insert(
            PeerRole::Admin,
            RoleSlot {
                session: None,
                outbound: None,
            },
        );
        slots.insert(
            PeerRole::Consumer,
            RoleSlot {
                session: None,
                outbound: None,
            },
        );
        Self {
            slots: RwLock::new(slots),
            credentials_sealed_once: std::sync::atomic::AtomicBool::new(false),
        }
    }

    /// Install a freshly attested session for `role`, displacing any
    /// previous session of the same role.
    pub async fn install(&self, role: PeerRole, session: Arc<TransportSession>, outbound: OutboundHandle) {
        let mut slots = self.slots.write().await;
        let slot = slots.entry(role).or_insert(RoleSlot {
            session: None,
            outbound: None,
        });
        if let Some(previous) = slot.session.replace(session) {
            tracing::info!(role = %role, "displacing previous session for role");
            previous.close();
        }
        slot.outbound = Some(outbound);
    }

    /// Remove the session for `role`, if present (e.g. on terminal
    /// transport error).
    pub async fn remove(&self, role: PeerRole) {
        let mut slots = self.slots.write().await;
        if let Some(slot) = slots.get_mut(&role) {
            slot.session = None;
            slot.outbound = None;
        }
    }

    /// The currently active session for `role`, if any.
    pub async fn session(&self, role: PeerRole) -> Option<Arc<TransportSession>> {
        self.slots.read().await.get(&role)?.session.clone()
    }

    /// The currently active outbound write handle for `role`, if any.
    pub async fn outbound(&self, role: PeerRole) -> Option<OutboundHandle> {
        self.slots.read().await.get(&role)?.outbound.clone()
    }

    pub async fn has_admin(&self) -> bool {
        self.session(PeerRole::Admin).await.is_some()
    }

    pub async fn has_consumer(&self) -> bool {
        self.session(PeerRole::Consumer).await.is_some()
    }

    /// Check whether an inbound message of `kind`, arriving on a session
    /// declared as `role`, is admitted. Returns `TransportError::Handshake`
    /// (mis-declared/forbidden message) when not.
    pub fn admit(&self, role: PeerRole, kind: MessageKind) -> Result<(), TransportError> {
        if is_admitted(role, kind) {
            Ok(())
        } else {
            Err(TransportError::Handshake(format!(
                "{kind:?} not admitted from role {role}"
            )))
        }
    }

    /// Whether a `credentials.seal` has already been accepted once this
    /// process lifetime. The orchestrator consults this before accepting
    /// another, per §4.5 ("only once per process unless explicitly
    /// re-requested").
    pub fn credentials_already_sealed(&self) -> bool {
        self.credentials_sealed_once
            .load(std::sync::atomic::Ordering::SeqCst)
    }

    /// Record that a `credentials.seal` has been accepted.
    pub fn mark_credentials_sealed(&self) {
        self.credentials_sealed_once
            .store(true, std::sync::atomic::Ordering::SeqCst);
    }

    /// Allow the orchestrator to explicitly request credentials again
    /// (e.g. after a rotation), resetting the once-per-process gate.
    pub fn reset_credentials_gate(&self) {
        self.credentials_sealed_once
            .store(false, std::sync::atomic::Ordering::SeqCst);
    }
}

impl std::fmt::Debug for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MessageKind::MigrationsApply => "migrations.apply",
            MessageKind::OrmRead => "orm.read",
            MessageKind::OrmWrite => "orm.write",
            MessageKind::OrmDdl => "orm.ddl",
            MessageKind::JobExecute => "job.execute",
            MessageKind::CredentialsSeal => "credentials.seal",
        };
        write!(f, "{s}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_execute_only_from_consumer() {
        assert!(is_admitted(PeerRole::Consumer, MessageKind::JobExecute));
        assert!(!is_admitted(PeerRole::Admin, MessageKind::JobExecute));
    }

    #[test]
    fn migrations_apply_only_from_admin() {
        assert!(is_admitted(PeerRole::Admin, MessageKind::MigrationsApply));
        assert!(!is_admitted(
            PeerRole::Consumer,
            MessageKind::MigrationsApply
        ));
    }

    #[test]
    fn orm_read_admitted_from_either_role() {
        assert!(is_admitted(PeerRole::Admin, MessageKind::OrmRead));
        assert!(is_admitted(PeerRole::Consumer, MessageKind::OrmRead));
    }

    #[test]
    fn orm_write_and_ddl_only_from_admin() {
        assert!(is_admitted(PeerRole::Admin, MessageKind::OrmWrite));
        assert!(!is_admitted(PeerRole::Consumer, MessageKind::OrmWrite));
        assert!(is_admitted(PeerRole::Admin, MessageKind::OrmDdl));
        assert!(!is_admitted(PeerRole::Consumer, MessageKind::OrmDdl));
    }

    #[tokio::test]
    async fn credentials_seal_gate_is_once_per_process_until_reset() {
        let manager = PeerSessionManager::new();
        assert!(!manager.credentials_already_sealed());
        manager.mark_credentials_sealed();
        assert!(manager.credentials_already_sealed());
        manager.reset_credentials_gate();
        assert!(!manager.credentials_already_sealed());
    }
}
