//! The ORM bridge: policy enforcement, peer routing, and correlation-id
//! matching for proxied database operations.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Boxed future used to keep [`OrmTransport`] object-safe so the bridge can
/// hold `Arc<dyn OrmTransport>` without a generic parameter leaking into
/// every type that carries a bridge handle (notably [`crate::context::Context`]).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

use crate::error::OrmError;
use crate::lifecycle::LifecycleOrchestrator;
use crate::orm::policy::OrmPolicy;
use crate::peers::{MessageKind, PeerRole, PeerSessionManager};

/// A structured ORM operation, serialized onto the wire as an ORM request
/// frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum OrmOp {
    Select {
        table: String,
        columns: Vec<String>,
        filters: BTreeMap<String, Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        limit: Option<u64>,
    },
    Insert {
        table: String,
        values: BTreeMap<String, Value>,
    },
    Update {
        table: String,
        set: BTreeMap<String, Value>,
        filters: BTreeMap<String, Value>,
    },
    Delete {
        table: String,
        filters: BTreeMap<String, Value>,
    },
}

impl OrmOp {
    pub(crate) fn message_kind(&self) -> MessageKind {
        match self {
            OrmOp::Select { .. } => MessageKind::OrmRead,
            OrmOp::Insert { .. } | OrmOp::Update { .. } => MessageKind::OrmWrite,
            OrmOp::Delete { .. } => MessageKind::OrmWrite,
        }
    }
}

/// A request frame, tagged with a correlation id so the matching response
/// can be found regardless of arrival order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrmRequest {
    pub correlation_id: Uuid,
    pub op: OrmOp,
}

/// The row-set or structured error a peer returns for an [`OrmRequest`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrmResponse {
    pub correlation_id: Uuid,
    pub result: Result<Vec<BTreeMap<String, Value>>, OrmError>,
}

/// Sends a request to a specific peer role and returns the matching
/// response. Implementations own correlation-id bookkeeping against the
/// transport; an unmatched response is discarded with a warning rather
/// than surfaced here.
pub trait OrmTransport: Send + Sync {
    fn send(&self, role: PeerRole, request: OrmRequest) -> BoxFuture<'_, Result<OrmResponse, OrmError>>;
}

/// Client-side ORM API offered to job handlers. Enforces [`OrmPolicy`]
/// before marshalling, then routes reads and writes to the appropriate
/// peer.
#[derive(Clone)]
pub struct OrmBridge {
    policy: Arc<OrmPolicy>,
    peers: Arc<PeerSessionManager>,
    transport: Arc<dyn OrmTransport>,
    lifecycle: Arc<LifecycleOrchestrator>,
}

impl OrmBridge {
    pub fn new(
        policy: Arc<OrmPolicy>,
        peers: Arc<PeerSessionManager>,
        transport: Arc<dyn OrmTransport>,
        lifecycle: Arc<LifecycleOrchestrator>,
    ) -> Self {
        Self {
            policy,
            peers,
            transport,
            lifecycle,
        }
    }

    /// Require an active Admin session before a write. Absence is reported
    /// to the lifecycle orchestrator as a write-attempted-without-admin
    /// event (§4.9: `Serving -> AwaitingAdmin`), which is a no-op outside
    /// `Serving`.
    async fn require_admin_for_write(&self) -> Result<(), OrmError> {
        if self.peers.has_admin().await {
            return Ok(());
        }
        if let Err(e) = self.lifecycle.admin_write_attempted_without_admin().await {
            tracing::debug!(error = %e, "admin write attempted outside Serving, lifecycle unchanged");
        }
        Err(OrmError::NoAdmin)
    }

    /// Choose the read peer: Consumer preferred for load isolation when
    /// present, else Admin, else no read path at all.
    async fn read_peer(&self) -> Option<PeerRole> {
        if self.peers.has_consumer().await {
            Some(PeerRole::Consumer)
        } else if self.peers.has_admin().await {
            Some(PeerRole::Admin)
        } else {
            None
        }
    }

    async fn dispatch(&self, role: PeerRole, op: OrmOp) -> Result<Vec<BTreeMap<String, Value>>, OrmError> {
        self.peers
            .admit(role, op.message_kind())
            .map_err(|_| OrmError::NoAdmin)?;
        let request = OrmRequest {
            correlation_id: Uuid::new_v4(),
            op,
        };
        let response = self.transport.send(role, request).await?;
        response.result
    }

    pub async fn select(
        &self,
        table: &str,
        columns: &[String],
        filters: BTreeMap<String, Value>,
        limit: Option<u64>,
    ) -> Result<Vec<BTreeMap<String, Value>>, OrmError> {
        self.policy.check_read(table, columns)?;
        let Some(role) = self.read_peer().await else {
            return Err(OrmError::NoAdmin);
        };
        self.dispatch(
            role,
            OrmOp::Select {
                table: table.to_string(),
                columns: columns.to_vec(),
                filters,
                limit,
            },
        )
        .await
    }

    pub async fn insert(
        &self,
        table: &str,
        values: BTreeMap<String, Value>,
    ) -> Result<Vec<BTreeMap<String, Value>>, OrmError> {
        let columns: Vec<String> = values.keys().cloned().collect();
        self.policy.check_insert(table, &columns)?;
        self.require_admin_for_write().await?;
        self.dispatch(
            PeerRole::Admin,
            OrmOp::Insert {
                table: table.to_string(),
                values,
            },
        )
        .await
    }

    pub async fn update(
        &self,
        table: &str,
        set: BTreeMap<String, Value>,
        filters: BTreeMap<String, Value>,
    ) -> Result<Vec<BTreeMap<String, Value>>, OrmError> {
        let columns: Vec<String> = set.keys().cloned().collect();
        self.policy.check_update(table, &columns)?;
        self.require_admin_for_write().await?;
        self.dispatch(
            PeerRole::Admin,
            OrmOp::Update {
                table: table.to_string(),
                set,
                filters,
            },
        )
        .await
    }

    pub async fn delete(
        &self,
        table: &str,
        filters: BTreeMap<String, Value>,
    ) -> Result<Vec<BTreeMap<String, Value>>, OrmError> {
        if filters.is_empty() {
            return Err(OrmError::UnsafeDelete);
        }
        self.policy.check_delete_allowed(table)?;
        self.require_admin_for_write().await?;
        self.dispatch(
            PeerRole::Admin,
            OrmOp::Delete {
                table: table.to_string(),
                filters,
            },
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orm::policy::TablePolicy;
    use std::collections::BTreeSet;
    use std::sync::Mutex;

    struct StubTransport {
        responses: Mutex<Vec<(PeerRole, OrmOp)>>,
    }

    impl OrmTransport for StubTransport {
        fn send(&self, role: PeerRole, request: OrmRequest) -> BoxFuture<'_, Result<OrmResponse, OrmError>> {
            self.responses.lock().unwrap().push((role, request.op.clone()));
            Box::pin(async move {
                Ok(OrmResponse {
                    correlation_id: request.correlation_id,
                    result: Ok(vec![]),
                })
            })
        }
    }

    fn policy_with_jobs_read(columns: &[&str]) -> Arc<OrmPolicy> {
        let policy = OrmPolicy::new();
        let mut tables = BTreeMap::new();
        tables.insert(
            "jobs".to_string(),
            TablePolicy {
                read_columns: columns.iter().map(|s| s.to_string()).collect(),
                insert_columns: BTreeSet::new(),
                update_columns: BTreeSet::new(),
                delete_allowed: false,
            },
        );
        policy.apply(tables).unwrap();
        Arc::new(policy)
    }

    #[tokio::test]
    async fn select_forbidden_column_rejected_before_dispatch() {
        let policy = policy_with_jobs_read(&["id", "score"]);
        let peers = Arc::new(PeerSessionManager::new());
        let transport = Arc::new(StubTransport {
            responses: Mutex::new(Vec::new()),
        });
        let bridge = OrmBridge::new(policy, peers, transport.clone(), Arc::new(LifecycleOrchestrator::new()));

        let err = bridge
            .select("jobs", &["created_at".to_string()], BTreeMap::new(), None)
            .await
            .unwrap_err();
        assert_eq!(err, OrmError::Forbidden("created_at".into()));
        assert!(transport.responses.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn update_without_admin_fails_fast() {
        let policy = OrmPolicy::new();
        policy.apply(BTreeMap::new()).unwrap();
        let peers = Arc::new(PeerSessionManager::new());
        let transport = Arc::new(StubTransport {
            responses: Mutex::new(Vec::new()),
        });
        let bridge = OrmBridge::new(Arc::new(policy), peers, transport, Arc::new(LifecycleOrchestrator::new()));

        let err = bridge
            .update("jobs", BTreeMap::new(), BTreeMap::new())
            .await
            .unwrap_err();
        assert_eq!(err, OrmError::NoAdmin);
    }

    #[tokio::test]
    async fn write_without_admin_while_serving_demotes_to_awaiting_admin() {
        use crate::transport::{spawn_session_io, SessionKey, TransportSession};

        let policy = OrmPolicy::new();
        policy.apply(BTreeMap::new()).unwrap();
        let peers = Arc::new(PeerSessionManager::new());
        let lifecycle = Arc::new(LifecycleOrchestrator::new());

        lifecycle.start().await.unwrap();
        lifecycle.startup_complete().await.unwrap();

        let key = SessionKey::derive(&[1u8; 32], &[2u8; 32], PeerRole::Admin).unwrap();
        let session = Arc::new(TransportSession::new(key, PeerRole::Admin, 1024));
        let (stream, _peer) = tokio::io::duplex(1024);
        let io = spawn_session_io(stream, session.clone(), 1024, 4, 3600);
        peers.install(PeerRole::Admin, session, io.outbound.clone()).await;
        peers.mark_credentials_sealed();

        lifecycle.admin_and_credentials_ready(&peers).await.unwrap();
        lifecycle.migrations_complete().await.unwrap();
        lifecycle.ready_complete().await.unwrap();
        assert_eq!(lifecycle.state().await, crate::lifecycle::LifecycleState::Serving);

        // Admin drops; per §4.9 Serving survives until a write is attempted.
        peers.remove(PeerRole::Admin).await;
        assert_eq!(lifecycle.state().await, crate::lifecycle::LifecycleState::Serving);

        let transport = Arc::new(StubTransport {
            responses: Mutex::new(Vec::new()),
        });
        let bridge = OrmBridge::new(Arc::new(policy), peers.clone(), transport, lifecycle.clone());

        let err = bridge
            .update("jobs", BTreeMap::new(), BTreeMap::new())
            .await
            .unwrap_err();
        assert_eq!(err, OrmError::NoAdmin);
        assert_eq!(lifecycle.state().await, crate::lifecycle::LifecycleState::AwaitingAdmin);
    }

    #[tokio::test]
    async fn delete_with_empty_filters_always_rejected() {
        let policy = OrmPolicy::new();
        let mut tables = BTreeMap::new();
        tables.insert(
            "jobs".to_string(),
            TablePolicy {
                delete_allowed: true,
                ..Default::default()
            },
        );
        policy.apply(tables).unwrap();
        let peers = Arc::new(PeerSessionManager::new());
        let transport = Arc::new(StubTransport {
            responses: Mutex::new(Vec::new()),
        });
        let bridge = OrmBridge::new(Arc::new(policy), peers, transport, Arc::new(LifecycleOrchestrator::new()));

        let err = bridge
            .delete("jobs", BTreeMap::new())
            .await
            .unwrap_err();
        assert_eq!(err, OrmError::UnsafeDelete);
    }
}
