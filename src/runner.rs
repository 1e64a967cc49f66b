//! The top-level orchestrator: owns every shared subsystem, wires a freshly
//! established peer session into the dispatch loop, and drives the
//! lifecycle state machine from process start to termination (§4.9).

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::FuturesUnordered;
use futures::StreamExt;
use tokio::sync::{mpsc, oneshot, Mutex};
use uuid::Uuid;

use crate::config::SidecarConfig;
use crate::context::Context;
use crate::correlation::CorrelationTable;
use crate::credentials::DbCredentials;
use crate::crypto;
use crate::error::{JobError, OrmError, SidecarError};
use crate::executor::JobExecutor;
use crate::http::{CvmClient, ResultsClient, SignedHttpClient, ValuesClient};
use crate::identity::Identity;
use crate::lifecycle::LifecycleOrchestrator;
use crate::orm::bridge::BoxFuture;
use crate::orm::{OrmBridge, OrmPolicy, OrmRequest, OrmResponse, OrmTransport};
use crate::peers::{PeerRole, PeerSessionManager};
use crate::registry::HandlerRegistry;
use crate::transport::{SessionIo, TransportSession};
use crate::wire::WireMessage;

/// A long-running task the runner starts alongside the dispatch loop and
/// watches for the rest of the process lifetime. A failure is fatal: it is
/// surfaced from [`SidecarRunner::run`] as [`SidecarError::BackgroundService`].
pub trait BackgroundService: Send + Sync {
    /// Start the service and return a receiver that resolves if (and only
    /// if) the service exits before the process does; a service that only
    /// stops on shutdown never needs to resolve it.
    fn start(&self) -> BoxFuture<'_, oneshot::Receiver<Result<(), SidecarError>>>;
}

/// Periodically sweeps both peer slots for sessions that have gone idle
/// past their heartbeat deadline, closing and evicting them. Complements
/// the per-session idle check already inside the session's own I/O loop
/// (`spawn_session_io`) as a second line of defense against a connection
/// whose writer task stalled without its own ticker firing.
pub struct HeartbeatSweepService {
    peers: Arc<PeerSessionManager>,
    interval_secs: u64,
}

impl HeartbeatSweepService {
    pub fn new(peers: Arc<PeerSessionManager>, interval_secs: u64) -> Self {
        Self { peers, interval_secs }
    }
}

impl BackgroundService for HeartbeatSweepService {
    fn start(&self) -> BoxFuture<'_, oneshot::Receiver<Result<(), SidecarError>>> {
        Box::pin(async move {
            let (_tx, rx) = oneshot::channel();
            let peers = self.peers.clone();
            let interval_secs = self.interval_secs.max(1);
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
                loop {
                    ticker.tick().await;
                    for role in [PeerRole::Admin, PeerRole::Consumer] {
                        if let Some(session) = peers.session(role).await {
                            if session.is_idle(interval_secs) {
                                tracing::info!(role = %role, "heartbeat sweep evicting idle session");
                                session.close();
                                peers.remove(role).await;
                            }
                        }
                    }
                }
            });
            rx
        })
    }
}

/// Routes `OrmBridge` requests over a live peer session and matches the
/// reply by correlation id, timing out if no peer ever picks up the
/// request (the role has no session, or its session never replies).
pub struct PeerOrmTransport {
    peers: Arc<PeerSessionManager>,
    correlation: Arc<CorrelationTable>,
    request_timeout: Duration,
}

impl PeerOrmTransport {
    pub fn new(peers: Arc<PeerSessionManager>, correlation: Arc<CorrelationTable>, request_timeout: Duration) -> Self {
        Self {
            peers,
            correlation,
            request_timeout,
        }
    }
}

impl OrmTransport for PeerOrmTransport {
    fn send(&self, role: PeerRole, request: OrmRequest) -> BoxFuture<'_, Result<OrmResponse, OrmError>> {
        Box::pin(async move {
            let outbound = self.peers.outbound(role).await.ok_or(OrmError::NoAdmin)?;
            let correlation_id = request.correlation_id;
            let rx = self.correlation.register(correlation_id);

            let message = WireMessage::OrmRequest(request);
            let encoded = serde_json::to_vec(&message).map_err(|e| OrmError::SyntaxRejected(e.to_string()))?;
            if outbound.send(encoded).await.is_err() {
                self.correlation.retire(correlation_id);
                return Err(OrmError::NoAdmin);
            }

            match tokio::time::timeout(self.request_timeout, rx).await {
                Ok(Ok(response)) => Ok(response),
                Ok(Err(_)) => Err(OrmError::UnmatchedResponse),
                Err(_) => {
                    self.correlation.retire(correlation_id);
                    Err(OrmError::Timeout)
                }
            }
        })
    }
}

type ShutdownFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Builds a [`SidecarRunner`] from a validated configuration and process
/// identity, gathering handlers and background services before the
/// registry is frozen at `build()` (§4.9, §9).
pub struct SidecarRunnerBuilder {
    config: Arc<SidecarConfig>,
    identity: Arc<Identity>,
    registry: HandlerRegistry,
    background_services: Vec<Arc<dyn BackgroundService>>,
    shutdown: Option<ShutdownFuture>,
}

impl SidecarRunnerBuilder {
    pub fn register_handlers(mut self, registry: HandlerRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn background_service(mut self, service: Arc<dyn BackgroundService>) -> Self {
        self.background_services.push(service);
        self
    }

    pub fn with_shutdown_handler<F>(mut self, fut: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.shutdown = Some(Box::pin(fut));
        self
    }

    pub fn build(self) -> Result<SidecarRunner, SidecarError> {
        let signed_http = Arc::new(SignedHttpClient::new(
            self.identity.clone(),
            self.config.http_timeout_secs,
        )?);
        let cvm_client = CvmClient::new(signed_http.clone(), self.config.consumer_base_url.clone());
        let values_client = ValuesClient::new(signed_http.clone(), self.config.consumer_base_url.clone());
        let results_client = ResultsClient::new(signed_http.clone(), self.config.consumer_base_url.clone());

        let peers = Arc::new(PeerSessionManager::new());
        let correlation = Arc::new(CorrelationTable::new());
        let lifecycle = Arc::new(LifecycleOrchestrator::new());
        let orm_transport: Arc<dyn OrmTransport> = Arc::new(PeerOrmTransport::new(
            peers.clone(),
            correlation.clone(),
            Duration::from_secs(self.config.job_timeout_secs),
        ));
        let orm_policy = Arc::new(OrmPolicy::new());
        let orm_bridge = OrmBridge::new(orm_policy.clone(), peers.clone(), orm_transport, lifecycle.clone());

        let registry = Arc::new(self.registry);
        let executor = Arc::new(JobExecutor::new(
            registry.clone(),
            self.config.max_parallel_jobs,
            self.config.job_timeout_secs,
        ));

        let (inbound_tx, inbound_rx) = mpsc::channel(self.config.outbound_queue_depth.max(1));

        Ok(SidecarRunner {
            config: self.config,
            identity: self.identity,
            peers,
            lifecycle,
            registry,
            executor,
            orm_policy,
            orm_bridge,
            correlation,
            credentials: Arc::new(DbCredentials::new()),
            signed_http,
            cvm_client,
            values_client,
            results_client,
            background_services: self.background_services,
            shutdown: Mutex::new(self.shutdown),
            inbound_tx,
            inbound_rx: Mutex::new(Some(inbound_rx)),
        })
    }
}

/// Owns every shared subsystem and drives the process from bootstrap
/// through termination. One instance per process.
pub struct SidecarRunner {
    config: Arc<SidecarConfig>,
    identity: Arc<Identity>,
    peers: Arc<PeerSessionManager>,
    lifecycle: Arc<LifecycleOrchestrator>,
    registry: Arc<HandlerRegistry>,
    executor: Arc<JobExecutor>,
    orm_policy: Arc<OrmPolicy>,
    orm_bridge: OrmBridge,
    correlation: Arc<CorrelationTable>,
    credentials: Arc<DbCredentials>,
    signed_http: Arc<SignedHttpClient>,
    cvm_client: CvmClient,
    values_client: ValuesClient,
    results_client: ResultsClient,
    background_services: Vec<Arc<dyn BackgroundService>>,
    shutdown: Mutex<Option<ShutdownFuture>>,
    inbound_tx: mpsc::Sender<(PeerRole, Vec<u8>)>,
    inbound_rx: Mutex<Option<mpsc::Receiver<(PeerRole, Vec<u8>)>>>,
}

impl SidecarRunner {
    pub fn builder(config: Arc<SidecarConfig>, identity: Arc<Identity>) -> SidecarRunnerBuilder {
        SidecarRunnerBuilder {
            config,
            identity,
            registry: HandlerRegistry::new(),
            background_services: Vec::new(),
            shutdown: None,
        }
    }

    pub fn peers(&self) -> &Arc<PeerSessionManager> {
        &self.peers
    }

    pub fn lifecycle(&self) -> &Arc<LifecycleOrchestrator> {
        &self.lifecycle
    }

    pub fn identity(&self) -> &Arc<Identity> {
        &self.identity
    }

    pub fn config(&self) -> &Arc<SidecarConfig> {
        &self.config
    }

    /// The ORM capability policy, set once (typically from `on_ready`)
    /// before the dispatch loop admits any ORM traffic.
    pub fn orm_policy(&self) -> &Arc<OrmPolicy> {
        &self.orm_policy
    }

    fn lifecycle_context(&self) -> Context {
        Context::for_lifecycle(
            self.config.consumer_base_url.clone(),
            self.config.session_token.clone(),
            self.signed_http.clone(),
            self.cvm_client.clone(),
            self.values_client.clone(),
            self.results_client.clone(),
            self.orm_bridge.clone(),
        )
    }

    fn job_context(&self, request: &crate::context::JobRequest) -> Context {
        Context::for_job(
            request,
            self.config.consumer_base_url.clone(),
            self.signed_http.clone(),
            self.cvm_client.clone(),
            self.values_client.clone(),
            self.results_client.clone(),
            self.orm_bridge.clone(),
        )
    }

    /// Install a freshly established peer session: register it with the
    /// session manager, fan its inbound frames into the shared dispatch
    /// channel, and evict it from the manager once its I/O loop ends.
    pub async fn attach_session(&self, role: PeerRole, session: Arc<TransportSession>, io: SessionIo) {
        self.peers.install(role, session, io.outbound.clone()).await;

        // An Admin reconnecting after the first-ever credentials.seal has
        // already fired is a recovery from a dropped session, not the
        // initial bootstrap; drive the documented `AwaitingAdmin ->
        // Serving` back-edge (§4.9). Before that first seal this is a
        // no-op: the machine is still waiting on `admin_and_credentials_ready`.
        if role == PeerRole::Admin && self.peers.credentials_already_sealed() {
            if let Err(e) = self.lifecycle.admin_recovered().await {
                tracing::debug!(error = %e, "admin session attached outside AwaitingAdmin, lifecycle unchanged");
            }
        }

        let inbound_tx = self.inbound_tx.clone();
        let mut inbound_rx = io.inbound_rx;
        tokio::spawn(async move {
            while let Some(payload) = inbound_rx.recv().await {
                if inbound_tx.send((role, payload)).await.is_err() {
                    break;
                }
            }
        });

        let peers = self.peers.clone();
        tokio::spawn(async move {
            match io.task.await {
                Ok(Ok(())) => tracing::debug!(role = %role, "session io loop ended cleanly"),
                Ok(Err(e)) => tracing::warn!(role = %role, error = %e, "session io loop ended with error"),
                Err(e) => tracing::warn!(role = %role, error = %e, "session io task panicked"),
            }
            peers.remove(role).await;
        });
    }

    /// Decode, admit, and dispatch one inbound frame payload, returning the
    /// reply bytes (if any) to seal and send back on the same session.
    async fn handle_inbound(&self, role: PeerRole, plaintext: Vec<u8>) -> Option<Vec<u8>> {
        let message: WireMessage = match serde_json::from_slice(&plaintext) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(role = %role, error = %e, "dropping malformed wire message");
                return None;
            }
        };

        if let Some(kind) = message.message_kind() {
            if let Err(e) = self.peers.admit(role, kind) {
                tracing::warn!(role = %role, error = %e, "dropping message not admitted for role");
                return None;
            }
        }

        match message {
            WireMessage::JobExecute(request) => {
                let result = if self.lifecycle.ensure_serving().await.is_err() {
                    crate::context::JobResult::failed(
                        request.job_name.clone().unwrap_or_else(|| "unknown".to_string()),
                        JobError::NotReady.tag(),
                    )
                } else {
                    let ctx = self.job_context(&request);
                    self.executor.execute(ctx, &request).await
                };
                let reply = WireMessage::JobReply {
                    job_id: request.job_id,
                    result,
                };
                serde_json::to_vec(&reply).ok()
            }
            WireMessage::CredentialsSeal(sealed) => {
                if self.peers.credentials_already_sealed() {
                    tracing::warn!("dropping duplicate credentials.seal for this process lifetime");
                    return None;
                }
                match crypto::sealed_open(&self.identity.x25519_secret(), &sealed)
                    .ok()
                    .and_then(|bytes| String::from_utf8(bytes).ok())
                {
                    Some(dsn) => {
                        self.credentials.set(dsn);
                        self.peers.mark_credentials_sealed();
                        if let Err(e) = self.lifecycle.admin_and_credentials_ready(&self.peers).await {
                            tracing::debug!(error = %e, "not yet ready to advance past AwaitingAdmin");
                        }
                    }
                    None => tracing::warn!("credentials.seal payload failed to open or was not UTF-8"),
                }
                None
            }
            WireMessage::MigrationsApply { version } => {
                if version == self.config.db_version {
                    match self.lifecycle.migrations_complete().await {
                        Ok(()) => self.advance_to_serving().await,
                        Err(e) => tracing::warn!(error = %e, "migrations.apply arrived out of order"),
                    }
                } else {
                    tracing::warn!(
                        expected = self.config.db_version,
                        got = version,
                        "migrations.apply version mismatch, ignoring"
                    );
                }
                None
            }
            WireMessage::OrmRequest(_) => {
                tracing::warn!(role = %role, "sidecar does not accept inbound ORM requests, only originates them");
                None
            }
            WireMessage::OrmResponse(response) => {
                if !self.correlation.resolve(response) {
                    tracing::warn!(role = %role, "orm response matched no pending request");
                }
                None
            }
            WireMessage::JobReply { .. } => {
                tracing::warn!(role = %role, "sidecar does not accept inbound job replies, only originates them");
                None
            }
        }
    }

    /// Run `on_ready` and transition `Ready -> Serving`, called once
    /// migrations have applied (§4.9: `Ready -> Serving : on_ready
    /// returned`). A failing `on_ready` handler leaves the lifecycle in
    /// `Ready`, so `job.execute` keeps failing with `not_ready` instead of
    /// serving before the handler has actually finished its setup.
    async fn advance_to_serving(&self) {
        if let Some(on_ready) = self.registry.on_ready() {
            if let Err(e) = on_ready.call(self.lifecycle_context()).await {
                tracing::warn!(error = %e, "on_ready handler failed, staying in Ready");
                return;
            }
        }
        if let Err(e) = self.lifecycle.ready_complete().await {
            tracing::warn!(error = %e, "failed to transition Ready -> Serving");
        }
    }

    /// Run the full process lifecycle: startup hook, background services,
    /// the dispatch loop, then drain and cleanup. Resolves once the process
    /// should exit; `Err` is fatal and maps to a process exit code via
    /// [`SidecarError::exit_code`].
    pub async fn run(&self) -> Result<(), SidecarError> {
        self.lifecycle.start().await?;

        if let Some(on_startup) = self.registry.on_startup() {
            on_startup
                .call(self.lifecycle_context())
                .await
                .map_err(SidecarError::BackgroundService)?;
        }
        self.lifecycle.startup_complete().await?;

        let mut background = FuturesUnordered::new();
        for service in &self.background_services {
            background.push(service.start().await);
        }

        let mut inbound_rx = self
            .inbound_rx
            .lock()
            .await
            .take()
            .expect("run() called more than once");

        let mut shutdown = self
            .shutdown
            .lock()
            .await
            .take()
            .unwrap_or_else(|| Box::pin(std::future::pending::<()>()));

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("shutdown signal received");
                    break;
                }
                maybe_msg = inbound_rx.recv() => {
                    match maybe_msg {
                        Some((role, payload)) => {
                            if let Some(reply) = self.handle_inbound(role, payload).await {
                                if let Some(outbound) = self.peers.outbound(role).await {
                                    if outbound.send(reply).await.is_err() {
                                        tracing::warn!(role = %role, "failed to send reply, session gone");
                                    }
                                }
                            }
                        }
                        None => tracing::warn!("inbound channel closed unexpectedly"),
                    }
                }
                Some(outcome) = background.next(), if !background.is_empty() => {
                    match outcome {
                        Ok(Err(e)) => return Err(e),
                        Ok(Ok(())) => tracing::debug!("a background service exited cleanly"),
                        Err(_) => tracing::debug!("a background service's receiver was dropped"),
                    }
                }
            }
        }

        self.lifecycle.begin_draining().await?;

        if let Some(on_cleanup) = self.registry.on_cleanup() {
            if let Err(e) = on_cleanup.call(self.lifecycle_context()).await {
                tracing::warn!(error = %e, "on_cleanup handler failed during drain");
            }
        }

        self.credentials.clear();
        self.lifecycle.terminate().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SidecarConfig;
    use crate::context::JobRequest;
    use crate::transport::{spawn_session_io, SessionKey};

    fn test_config() -> Arc<SidecarConfig> {
        Arc::new(
            SidecarConfig::builder()
                .consumer_base_url("https://consumer.example")
                .session_token("token")
                .job_id("job")
                .challenge_id("challenge")
                .validator_hotkey("hotkey")
                .build()
                .unwrap(),
        )
    }

    fn test_runner() -> SidecarRunner {
        let identity = Arc::new(Identity::generate());
        SidecarRunner::builder(test_config(), identity).build().unwrap()
    }

    fn sample_request() -> JobRequest {
        JobRequest {
            job_id: "job-1".into(),
            challenge_id: "challenge".into(),
            validator_hotkey: "hotkey".into(),
            session_token: "token".into(),
            job_name: None,
            payload: serde_json::json!({}),
        }
    }

    #[tokio::test]
    async fn job_execute_before_serving_is_rejected_with_not_ready() {
        let runner = test_runner();

        let reply_bytes = runner
            .handle_inbound(
                PeerRole::Consumer,
                serde_json::to_vec(&WireMessage::JobExecute(sample_request())).unwrap(),
            )
            .await
            .expect("a reply is always produced for job.execute");

        let reply: WireMessage = serde_json::from_slice(&reply_bytes).unwrap();
        match reply {
            WireMessage::JobReply { result, .. } => {
                assert_eq!(result.score, 0.0);
                assert_eq!(result.error.as_deref(), Some("not_ready"));
            }
            other => panic!("unexpected reply variant: {other:?}"),
        }
    }

    #[tokio::test]
    async fn migrations_apply_drives_on_ready_and_admits_job_execute() {
        let identity = Arc::new(Identity::generate());
        let mut registry = HandlerRegistry::new();
        registry.register_ready(|_ctx| async { Ok(()) });
        registry.register_default_job(|_ctx, _payload| async {
            Ok(crate::context::JobResult {
                score: 0.95,
                metrics: Default::default(),
                job_type: "benchmark".to_string(),
                logs: None,
                allowed_log_containers: None,
                error: None,
            })
        });
        let runner = SidecarRunner::builder(test_config(), identity)
            .register_handlers(registry)
            .build()
            .unwrap();

        runner.lifecycle.start().await.unwrap();
        runner.lifecycle.startup_complete().await.unwrap();

        let key = SessionKey::derive(&[1u8; 32], &[2u8; 32], PeerRole::Admin).unwrap();
        let session = Arc::new(TransportSession::new(key, PeerRole::Admin, 1024));
        let (stream, _peer) = tokio::io::duplex(1024);
        let io = spawn_session_io(stream, session.clone(), 1024, 4, 3600);
        runner.peers.install(PeerRole::Admin, session, io.outbound.clone()).await;
        runner.peers.mark_credentials_sealed();
        runner
            .lifecycle
            .admin_and_credentials_ready(&runner.peers)
            .await
            .unwrap();

        let reply = runner
            .handle_inbound(
                PeerRole::Admin,
                serde_json::to_vec(&WireMessage::MigrationsApply {
                    version: runner.config.db_version,
                })
                .unwrap(),
            )
            .await;
        assert!(reply.is_none());
        assert_eq!(runner.lifecycle.state().await, crate::lifecycle::LifecycleState::Serving);

        let reply_bytes = runner
            .handle_inbound(
                PeerRole::Consumer,
                serde_json::to_vec(&WireMessage::JobExecute(sample_request())).unwrap(),
            )
            .await
            .expect("a reply is always produced for job.execute");
        let reply: WireMessage = serde_json::from_slice(&reply_bytes).unwrap();
        match reply {
            WireMessage::JobReply { result, .. } => {
                assert_eq!(result.score, 0.95);
                assert!(result.error.is_none());
            }
            other => panic!("unexpected reply variant: {other:?}"),
        }
    }

    #[tokio::test]
    async fn job_execute_from_admin_role_is_not_admitted() {
        let runner = test_runner();

        let reply = runner
            .handle_inbound(
                PeerRole::Admin,
                serde_json::to_vec(&WireMessage::JobExecute(sample_request())).unwrap(),
            )
            .await;
        assert!(reply.is_none());
    }

    #[tokio::test]
    async fn migrations_apply_with_mismatched_version_does_not_advance_lifecycle() {
        let runner = test_runner();
        runner.lifecycle.start().await.unwrap();
        runner.lifecycle.startup_complete().await.unwrap();

        let reply = runner
            .handle_inbound(
                PeerRole::Admin,
                serde_json::to_vec(&WireMessage::MigrationsApply { version: 999 }).unwrap(),
            )
            .await;
        assert!(reply.is_none());
        assert_eq!(runner.lifecycle.state().await, crate::lifecycle::LifecycleState::AwaitingAdmin);
    }

    #[tokio::test]
    async fn orm_response_resolves_a_pending_correlation() {
        let runner = test_runner();

        let id = Uuid::new_v4();
        let rx = runner.correlation.register(id);

        let reply = runner
            .handle_inbound(
                PeerRole::Admin,
                serde_json::to_vec(&WireMessage::OrmResponse(OrmResponse {
                    correlation_id: id,
                    result: Ok(vec![]),
                }))
                .unwrap(),
            )
            .await;
        assert!(reply.is_none());
        assert!(rx.await.is_ok());
    }

    #[tokio::test]
    async fn attach_session_installs_outbound_handle_for_the_role() {
        let runner = test_runner();
        let key = SessionKey::derive(&[1u8; 32], &[2u8; 32], PeerRole::Admin).unwrap();
        let session = Arc::new(TransportSession::new(key, PeerRole::Admin, 1024));
        let (stream, _peer) = tokio::io::duplex(1024);
        let io = spawn_session_io(stream, session.clone(), 1024, 4, 3600);

        runner.attach_session(PeerRole::Admin, session, io).await;

        assert!(runner.peers.has_admin().await);
        assert!(runner.peers.outbound(PeerRole::Admin).await.is_some());
    }

    #[tokio::test]
    async fn heartbeat_sweep_leaves_a_freshly_installed_session_alone() {
        let peers = Arc::new(PeerSessionManager::new());
        let key = SessionKey::derive(&[1u8; 32], &[2u8; 32], PeerRole::Admin).unwrap();
        let session = Arc::new(TransportSession::new(key, PeerRole::Admin, 1024));
        let (stream, _peer) = tokio::io::duplex(1024);
        let io = spawn_session_io(stream, session.clone(), 1024, 4, 3600);
        peers.install(PeerRole::Admin, session, io.outbound.clone()).await;

        let service = HeartbeatSweepService::new(peers.clone(), 3600);
        let _receiver = service.start().await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(peers.has_admin().await);
    }
}
