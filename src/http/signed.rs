//! Outbound HTTP client with canonical-string Ed25519 request signing.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::crypto;
use crate::error::HttpError;
use crate::identity::Identity;

/// Number of attempts (including the first) made for idempotent verbs on
/// transport-level failures.
const MAX_RETRIES: u32 = 3;

/// Outbound HTTP client that signs every request with the long-term
/// Ed25519 identity and attaches anti-replay headers. Retries `GET`/`PUT`
/// up to [`MAX_RETRIES`] times with exponential backoff on transport
/// errors only; never retries an authentication failure.
pub struct SignedHttpClient {
    identity: Arc<Identity>,
    http: reqwest::Client,
    timeout: Duration,
}

impl SignedHttpClient {
    pub fn new(identity: Arc<Identity>, timeout_secs: u64) -> Result<Self, HttpError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()?;
        Ok(Self {
            identity,
            http,
            timeout: Duration::from_secs(timeout_secs),
        })
    }

    /// Build the canonical string signed for a request:
    /// `METHOD '\n' PATH '\n' hex(SHA-256(body)) '\n' timestamp '\n' nonce`.
    fn canonical_string(method: &Method, path: &str, body: &[u8], ts: u64, nonce: &str) -> String {
        format!(
            "{}\n{}\n{}\n{}\n{}",
            method.as_str(),
            path,
            crypto::sha256_hex(body),
            ts,
            nonce
        )
    }

    fn signed_headers(&self, method: &Method, path: &str, body: &[u8]) -> reqwest::header::HeaderMap {
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let nonce = hex::encode(crypto::random_bytes(16));
        let canonical = Self::canonical_string(method, path, body, ts, &nonce);
        let signature = self.identity.sign(canonical.as_bytes());

        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            "X-Signature",
            BASE64
                .encode(signature)
                .parse()
                .expect("base64 is valid header value"),
        );
        headers.insert("X-Timestamp", ts.to_string().parse().expect("decimal is valid"));
        headers.insert("X-Nonce", nonce.parse().expect("hex is valid header value"));
        headers.insert(
            "X-Public-Key",
            BASE64
                .encode(self.identity.public_key())
                .parse()
                .expect("base64 is valid header value"),
        );
        headers
    }

    /// Perform a signed request. `base_url` + `path` form the request URL.
    /// `body` is serialized to JSON if present.
    pub async fn request<B: Serialize, R: DeserializeOwned>(
        &self,
        method: Method,
        base_url: &str,
        path: &str,
        body: Option<&B>,
    ) -> Result<R, HttpError> {
        let url = format!("{}{}", base_url.trim_end_matches('/'), path);
        let body_bytes = match body {
            Some(b) => serde_json::to_vec(b).map_err(|e| HttpError::Status {
                code: 0,
                body: format!("failed to serialize request body: {e}"),
            })?,
            None => Vec::new(),
        };

        let retryable = matches!(method, Method::GET | Method::PUT);
        let attempts = if retryable { MAX_RETRIES } else { 1 };

        let mut last_err = None;
        for attempt in 0..attempts {
            let headers = self.signed_headers(&method, path, &body_bytes);
            let mut req = self
                .http
                .request(method.clone(), &url)
                .timeout(self.timeout)
                .headers(headers);
            if !body_bytes.is_empty() {
                req = req.body(body_bytes.clone()).header("Content-Type", "application/json");
            }

            match req.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
                        return Err(HttpError::SignatureRejected);
                    }
                    if status.as_u16() >= 400 {
                        let body = resp.text().await.unwrap_or_default();
                        return Err(HttpError::Status {
                            code: status.as_u16(),
                            body,
                        });
                    }
                    return resp
                        .json::<R>()
                        .await
                        .map_err(HttpError::Network);
                }
                Err(e) => {
                    last_err = Some(HttpError::Network(e));
                    if attempt + 1 < attempts {
                        let backoff = Duration::from_millis(100 * 2u64.pow(attempt));
                        tokio::time::sleep(backoff).await;
                    }
                }
            }
        }
        Err(last_err.expect("loop runs at least once"))
    }
}
