//! The immutable bundle passed into every job and lifecycle handler
//! invocation, and the request/result types that cross the job-execution
//! boundary.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::http::{CvmClient, ResultsClient, SignedHttpClient, ValuesClient};
use crate::orm::OrmBridge;

/// An inbound `job.execute` request, decoded from a transport frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRequest {
    pub job_id: String,
    pub challenge_id: String,
    pub validator_hotkey: String,
    pub session_token: String,
    #[serde(default)]
    pub job_name: Option<String>,
    #[serde(default)]
    pub payload: Value,
}

/// Immutable bundle handed to a job (or lifecycle) handler. Cheap to clone:
/// every client handle is an `Arc`-backed facade over shared connections.
#[derive(Clone)]
pub struct Context {
    pub consumer_base_url: String,
    pub session_token: String,
    pub job_id: String,
    pub challenge_id: String,
    pub validator_hotkey: String,
    pub signed_http: Arc<SignedHttpClient>,
    pub cvm_client: CvmClient,
    pub values_client: ValuesClient,
    pub results_client: ResultsClient,
    pub orm_client: OrmBridge,
    /// Present only for public-endpoint invocations verified by the
    /// mediator (§4.10); `None` for ordinary job and lifecycle calls.
    pub caller: Option<crate::public::MinerClaims>,
}

impl Context {
    /// Build the context for a single job invocation.
    pub fn for_job(
        request: &JobRequest,
        consumer_base_url: String,
        signed_http: Arc<SignedHttpClient>,
        cvm_client: CvmClient,
        values_client: ValuesClient,
        results_client: ResultsClient,
        orm_client: OrmBridge,
    ) -> Self {
        Self {
            consumer_base_url,
            session_token: request.session_token.clone(),
            job_id: request.job_id.clone(),
            challenge_id: request.challenge_id.clone(),
            validator_hotkey: request.validator_hotkey.clone(),
            signed_http,
            cvm_client,
            values_client,
            results_client,
            orm_client,
            caller: None,
        }
    }

    /// Build the context for a lifecycle hook (`on_startup`/`on_ready`/
    /// `on_cleanup`/`on_weights`), which runs outside any single job and so
    /// has no job-specific identifiers.
    pub fn for_lifecycle(
        consumer_base_url: String,
        session_token: String,
        signed_http: Arc<SignedHttpClient>,
        cvm_client: CvmClient,
        values_client: ValuesClient,
        results_client: ResultsClient,
        orm_client: OrmBridge,
    ) -> Self {
        Self {
            consumer_base_url,
            session_token,
            job_id: String::new(),
            challenge_id: String::new(),
            validator_hotkey: String::new(),
            signed_http,
            cvm_client,
            values_client,
            results_client,
            orm_client,
            caller: None,
        }
    }

    pub fn with_caller(mut self, caller: crate::public::MinerClaims) -> Self {
        self.caller = Some(caller);
        self
    }
}

/// The value a job handler returns. Validated and clamped by the executor
/// before being packaged into a reply frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResult {
    pub score: f64,
    #[serde(default)]
    pub metrics: BTreeMap<String, f64>,
    pub job_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logs: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_log_containers: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl JobResult {
    pub fn failed(job_type: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            score: 0.0,
            metrics: BTreeMap::new(),
            job_type: job_type.into(),
            logs: None,
            allowed_log_containers: None,
            error: Some(error.into()),
        }
    }
}
