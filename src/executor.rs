//! The job executor: resolves a handler, runs it under a timeout and a
//! concurrency bound, sanitizes its result, and fires the independent
//! results-endpoint notification alongside the reply frame (§4.8).

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;

use crate::context::{Context, JobRequest, JobResult};
use crate::error::JobError;
use crate::http::ResultSubmission;
use crate::registry::HandlerRegistry;

/// Total bytes of `logs` content kept per result; excess lines are dropped
/// from the end once the budget is exhausted.
const DEFAULT_MAX_LOG_BYTES: usize = 1024 * 1024;

pub struct JobExecutor {
    registry: Arc<HandlerRegistry>,
    semaphore: Arc<Semaphore>,
    timeout: Duration,
    max_log_bytes: usize,
}

impl JobExecutor {
    pub fn new(registry: Arc<HandlerRegistry>, max_parallel_jobs: usize, timeout_secs: u64) -> Self {
        Self {
            registry,
            semaphore: Arc::new(Semaphore::new(max_parallel_jobs.max(1))),
            timeout: Duration::from_secs(timeout_secs),
            max_log_bytes: DEFAULT_MAX_LOG_BYTES,
        }
    }

    /// Execute one `job.execute` request to completion. Never returns an
    /// `Err`: every failure mode (missing handler, timeout, panic, invalid
    /// result) is folded into a [`JobResult`] with `error` set, so the
    /// caller always has a reply to frame.
    pub async fn execute(&self, ctx: Context, request: &JobRequest) -> JobResult {
        let job_type = request
            .job_name
            .clone()
            .unwrap_or_else(|| "unknown".to_string());

        let _permit = match self.semaphore.acquire().await {
            Ok(permit) => permit,
            Err(_) => return JobResult::failed(job_type, "executor shutting down"),
        };

        let handler = match self.registry.resolve_job(request.job_name.as_deref()) {
            Ok(handler) => handler,
            Err(JobError::NoHandler) => return JobResult::failed(job_type, JobError::NoHandler.to_string()),
            Err(e) => return JobResult::failed(job_type, e.to_string()),
        };

        let call = handler.call(ctx.clone(), request.payload.clone());
        let result = match tokio::time::timeout(self.timeout, call).await {
            Ok(Ok(result)) => sanitize(result, self.max_log_bytes),
            Ok(Err(message)) => JobResult::failed(job_type.clone(), message),
            Err(_) => JobResult::failed(job_type.clone(), JobError::Timeout.tag()),
        };

        self.notify_results_endpoint(&ctx, request, &result);
        result
    }

    /// Submit the result to the Consumer's results endpoint without
    /// blocking the reply frame on it. This is the second of the two
    /// independent notification paths the executor provides.
    fn notify_results_endpoint(&self, ctx: &Context, request: &JobRequest, result: &JobResult) {
        let results_client = ctx.results_client.clone();
        let job_id = request.job_id.clone();
        let submission = ResultSubmission {
            job_id: &job_id,
            score: result.score,
            metrics: result.metrics.clone(),
            job_type: result.job_type.clone(),
            error: result.error.clone(),
        };
        tokio::spawn(async move {
            if let Err(err) = results_client.submit(&submission).await {
                tracing::warn!(job_id = %submission.job_id, error = %err, "result submission to consumer failed");
            }
        });
    }
}

/// Enforce the result invariants the executor is responsible for: score
/// clamped into `[0, 1]` with `error` set when that required clamping or the
/// value was non-finite, non-finite metric values dropped, and logs
/// truncated to the configured byte budget.
fn sanitize(mut result: JobResult, max_log_bytes: usize) -> JobResult {
    let raw = result.score;
    if !raw.is_finite() {
        result.score = 0.0;
        result.error = Some("invalid_score".to_string());
    } else if !(0.0..=1.0).contains(&raw) {
        result.score = raw.clamp(0.0, 1.0);
        result.error = Some("invalid_score".to_string());
    }

    result.metrics.retain(|_, v| v.is_finite());

    if let Some(logs) = result.logs.as_mut() {
        truncate_logs(logs, max_log_bytes);
    }

    result
}

fn truncate_logs(logs: &mut Vec<String>, max_bytes: usize) {
    let mut used = 0usize;
    let mut cutoff = logs.len();
    for (i, line) in logs.iter().enumerate() {
        used += line.len();
        if used > max_bytes {
            cutoff = i;
            break;
        }
    }
    logs.truncate(cutoff);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::HandlerRegistry;
    use std::collections::BTreeMap;

    fn make_request(job_name: Option<&str>) -> JobRequest {
        JobRequest {
            job_id: "job-1".into(),
            challenge_id: "chal-1".into(),
            validator_hotkey: "hotkey".into(),
            session_token: "token".into(),
            job_name: job_name.map(String::from),
            payload: serde_json::Value::Null,
        }
    }

    #[test]
    fn out_of_range_score_is_clamped_and_flagged() {
        let result = JobResult {
            score: 1.5,
            metrics: BTreeMap::new(),
            job_type: "eval".into(),
            logs: None,
            allowed_log_containers: None,
            error: None,
        };
        let sanitized = sanitize(result, DEFAULT_MAX_LOG_BYTES);
        assert_eq!(sanitized.score, 1.0);
        assert_eq!(sanitized.error.as_deref(), Some("invalid_score"));
    }

    #[test]
    fn non_finite_score_becomes_zero_and_flagged() {
        let result = JobResult {
            score: f64::NAN,
            metrics: BTreeMap::new(),
            job_type: "eval".into(),
            logs: None,
            allowed_log_containers: None,
            error: None,
        };
        let sanitized = sanitize(result, DEFAULT_MAX_LOG_BYTES);
        assert_eq!(sanitized.score, 0.0);
        assert_eq!(sanitized.error.as_deref(), Some("invalid_score"));
    }

    #[test]
    fn non_finite_metrics_are_dropped() {
        let mut metrics = BTreeMap::new();
        metrics.insert("good".to_string(), 1.0);
        metrics.insert("bad".to_string(), f64::INFINITY);
        let result = JobResult {
            score: 0.5,
            metrics,
            job_type: "eval".into(),
            logs: None,
            allowed_log_containers: None,
            error: None,
        };
        let sanitized = sanitize(result, DEFAULT_MAX_LOG_BYTES);
        assert_eq!(sanitized.metrics.len(), 1);
        assert!(sanitized.metrics.contains_key("good"));
    }

    #[test]
    fn logs_truncated_past_byte_budget() {
        let mut logs = Vec::new();
        for _ in 0..10 {
            logs.push("x".repeat(10));
        }
        let result = JobResult {
            score: 0.5,
            metrics: BTreeMap::new(),
            job_type: "eval".into(),
            logs: Some(logs),
            allowed_log_containers: None,
            error: None,
        };
        let sanitized = sanitize(result, 25);
        assert_eq!(sanitized.logs.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn missing_handler_yields_failed_result_not_panic() {
        let registry = Arc::new(HandlerRegistry::new());
        let executor = JobExecutor::new(registry, 1, 5);
        let request = make_request(None);
        let ctx = test_context();
        let result = executor.execute(ctx, &request).await;
        assert_eq!(result.score, 0.0);
        assert!(result.error.is_some());
    }

    fn test_context() -> Context {
        use crate::http::{CvmClient, ResultsClient, SignedHttpClient, ValuesClient};
        use crate::identity::Identity;
        use crate::orm::OrmBridge;
        use crate::orm::OrmTransport;
        use crate::peers::PeerSessionManager;
        use std::sync::Arc;

        struct NoopTransport;
        impl OrmTransport for NoopTransport {
            fn send(
                &self,
                _role: crate::peers::PeerRole,
                request: crate::orm::OrmRequest,
            ) -> crate::orm::bridge::BoxFuture<'_, Result<crate::orm::OrmResponse, crate::error::OrmError>>
            {
                Box::pin(async move {
                    Ok(crate::orm::OrmResponse {
                        correlation_id: request.correlation_id,
                        result: Ok(vec![]),
                    })
                })
            }
        }

        let identity = Arc::new(Identity::generate());
        let signed_http = Arc::new(SignedHttpClient::new(identity, 5).unwrap());
        let base = "https://consumer.example".to_string();
        Context::for_job(
            &make_request(None),
            base.clone(),
            signed_http.clone(),
            CvmClient::new(signed_http.clone(), base.clone()),
            ValuesClient::new(signed_http.clone(), base.clone()),
            ResultsClient::new(signed_http, base),
            OrmBridge::new(
                Arc::new(crate::orm::OrmPolicy::new()),
                Arc::new(PeerSessionManager::new()),
                Arc::new(NoopTransport),
                Arc::new(crate::lifecycle::LifecycleOrchestrator::new()),
            ),
        )
    }
}
