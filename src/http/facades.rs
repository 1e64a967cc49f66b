//! Thin per-purpose facades layered on [`SignedHttpClient`].
//!
//! The distilled job-handler context names `cvm_client`, `values_client`
//! and `results_client` without defining them; all three are the same
//! signed client pointed at different base paths with different payload
//! shapes.

use std::sync::Arc;

use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::HttpError;
use crate::http::signed::SignedHttpClient;

/// Registers the confidential-VM identity with the control plane's
/// registration surface.
#[derive(Clone)]
pub struct CvmClient {
    inner: Arc<SignedHttpClient>,
    base_url: String,
}

impl CvmClient {
    pub fn new(inner: Arc<SignedHttpClient>, base_url: impl Into<String>) -> Self {
        Self {
            inner,
            base_url: base_url.into(),
        }
    }

    pub async fn register(&self, payload: &Value) -> Result<Value, HttpError> {
        self.inner
            .request(Method::POST, &self.base_url, "/cvm/register", Some(payload))
            .await
    }
}

/// Posts intermediate metric values observed during a job run.
#[derive(Clone)]
pub struct ValuesClient {
    inner: Arc<SignedHttpClient>,
    base_url: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ValueReport<'a> {
    pub job_id: &'a str,
    pub name: &'a str,
    pub value: f64,
}

impl ValuesClient {
    pub fn new(inner: Arc<SignedHttpClient>, base_url: impl Into<String>) -> Self {
        Self {
            inner,
            base_url: base_url.into(),
        }
    }

    pub async fn post_value(&self, report: &ValueReport<'_>) -> Result<(), HttpError> {
        let _: Value = self
            .inner
            .request(Method::POST, &self.base_url, "/values", Some(report))
            .await?;
        Ok(())
    }
}

/// Submits job results to the Consumer, independent of the reply frame sent
/// over the transport (§4.8: two independent notification paths). Uses
/// `PUT` so the underlying client's idempotent-verb retry is safe: retried
/// submissions carry the same `job_id` and the Consumer commits at most
/// once per id.
#[derive(Clone)]
pub struct ResultsClient {
    inner: Arc<SignedHttpClient>,
    base_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultSubmission<'a> {
    pub job_id: &'a str,
    pub score: f64,
    pub metrics: std::collections::BTreeMap<String, f64>,
    pub job_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ResultsClient {
    pub fn new(inner: Arc<SignedHttpClient>, base_url: impl Into<String>) -> Self {
        Self {
            inner,
            base_url: base_url.into(),
        }
    }

    pub async fn submit(&self, submission: &ResultSubmission<'_>) -> Result<(), HttpError> {
        let path = format!("/results/{}", submission.job_id);
        let _: Value = self
            .inner
            .request(Method::PUT, &self.base_url, &path, Some(submission))
            .await?;
        Ok(())
    }
}
