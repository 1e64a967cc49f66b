//! The lifecycle orchestrator: the state machine gating when jobs may run
//! and when the Admin-dependent write path is available (§4.9).

use tokio::sync::RwLock;

use crate::error::JobError;
use crate::peers::PeerSessionManager;

/// `Init → Startup → AwaitingAdmin → Migrating → Ready → Serving → Draining
/// → Terminated`, monotone except `Serving ↔ AwaitingAdmin`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Init,
    Startup,
    AwaitingAdmin,
    Migrating,
    Ready,
    Serving,
    Draining,
    Terminated,
}

/// Drives the lifecycle state machine. Threaded explicitly into the
/// executor (for the `Serving`-only gate) and the peer session manager (for
/// the Admin-presence-dependent transitions) rather than held as a global.
pub struct LifecycleOrchestrator {
    state: RwLock<LifecycleState>,
}

impl Default for LifecycleOrchestrator {
    fn default() -> Self {
        Self::new()
    }
}

impl LifecycleOrchestrator {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(LifecycleState::Init),
        }
    }

    pub async fn state(&self) -> LifecycleState {
        *self.state.read().await
    }

    async fn transition(
        &self,
        allowed_from: &[LifecycleState],
        to: LifecycleState,
    ) -> Result<(), JobError> {
        let mut guard = self.state.write().await;
        if allowed_from.contains(&*guard) {
            tracing::info!(from = ?*guard, to = ?to, "lifecycle transition");
            *guard = to;
            Ok(())
        } else {
            Err(JobError::InvalidResult(format!(
                "illegal lifecycle transition: {:?} -> {:?}",
                *guard, to
            )))
        }
    }

    /// `Init -> Startup`, on process start.
    pub async fn start(&self) -> Result<(), JobError> {
        self.transition(&[LifecycleState::Init], LifecycleState::Startup).await
    }

    /// `Startup -> AwaitingAdmin`, once `on_startup` has returned.
    pub async fn startup_complete(&self) -> Result<(), JobError> {
        self.transition(&[LifecycleState::Startup], LifecycleState::AwaitingAdmin)
            .await
    }

    /// `AwaitingAdmin -> Migrating`, once an Admin session is established and
    /// a `credentials.seal` has been accepted. Callers should check
    /// `peers.has_admin()` and `peers.credentials_already_sealed()` before
    /// calling this; it re-checks both to avoid a lost-update race.
    pub async fn admin_and_credentials_ready(
        &self,
        peers: &PeerSessionManager,
    ) -> Result<(), JobError> {
        if !peers.has_admin().await || !peers.credentials_already_sealed() {
            return Err(JobError::NotReady);
        }
        self.transition(&[LifecycleState::AwaitingAdmin], LifecycleState::Migrating)
            .await
    }

    /// `Migrating -> Ready`, once all migrations for the configured version
    /// have applied.
    pub async fn migrations_complete(&self) -> Result<(), JobError> {
        self.transition(&[LifecycleState::Migrating], LifecycleState::Ready)
            .await
    }

    /// `Ready -> Serving`, once `on_ready` has returned.
    pub async fn ready_complete(&self) -> Result<(), JobError> {
        self.transition(&[LifecycleState::Ready], LifecycleState::Serving)
            .await
    }

    /// `Serving -> AwaitingAdmin`: only fired when a handler actually
    /// attempts an Admin-gated write while the Admin session is absent.
    /// Read-only Consumer traffic keeps flowing regardless of this state.
    pub async fn admin_write_attempted_without_admin(&self) -> Result<(), JobError> {
        self.transition(&[LifecycleState::Serving], LifecycleState::AwaitingAdmin)
            .await
    }

    /// `AwaitingAdmin -> Serving`: the Admin session has returned and
    /// credentials are (still) sealed.
    pub async fn admin_recovered(&self) -> Result<(), JobError> {
        self.transition(&[LifecycleState::AwaitingAdmin], LifecycleState::Serving)
            .await
    }

    /// `Serving | AwaitingAdmin -> Draining`, on termination signal.
    pub async fn begin_draining(&self) -> Result<(), JobError> {
        self.transition(
            &[LifecycleState::Serving, LifecycleState::AwaitingAdmin],
            LifecycleState::Draining,
        )
        .await
    }

    /// `Draining -> Terminated`, once in-flight jobs have drained or the
    /// drain deadline has been reached.
    pub async fn terminate(&self) -> Result<(), JobError> {
        self.transition(&[LifecycleState::Draining], LifecycleState::Terminated)
            .await
    }

    /// Gate consulted by the executor before accepting any `job.execute`:
    /// jobs run only while `Serving`.
    pub async fn ensure_serving(&self) -> Result<(), JobError> {
        if *self.state.read().await == LifecycleState::Serving {
            Ok(())
        } else {
            Err(JobError::NotReady)
        }
    }
}
