//! Environment-sourced runtime configuration, validated once at startup.
//!
//! Mirrors the validated-builder shape used throughout the source corpus:
//! fields accumulate on the builder, validation happens exactly once in
//! [`SidecarConfigBuilder::build`].

use crate::error::ConfigError;

/// Minimum accepted database schema version.
pub const MIN_DB_VERSION: i64 = 1;
/// Maximum accepted database schema version.
pub const MAX_DB_VERSION: i64 = 16;

/// Fully validated runtime configuration.
#[derive(Debug, Clone)]
pub struct SidecarConfig {
    pub consumer_base_url: String,
    pub session_token: String,
    pub job_id: String,
    pub challenge_id: String,
    pub validator_hotkey: String,
    pub run_server: bool,
    pub admin_mode: bool,
    pub dev_mode: bool,
    pub allow_insecure_admin: bool,
    pub host: String,
    pub port: u16,
    pub db_version: i64,

    /// Populated later by a `credentials.seal` message, not at construction.
    pub db_dsn: Option<String>,

    // Runtime-tuning knobs (§5/§6 of the runtime model).
    pub max_parallel_jobs: usize,
    pub job_timeout_secs: u64,
    pub heartbeat_interval_secs: u64,
    pub max_frame_bytes: usize,
    pub outbound_queue_depth: usize,
    pub public_token_ttl_secs: u64,
    pub http_timeout_secs: u64,
    pub attestation_max_age_secs: u64,
}

impl SidecarConfig {
    /// Start building a configuration from scratch.
    pub fn builder() -> SidecarConfigBuilder {
        SidecarConfigBuilder::default()
    }

    /// Build a configuration from process environment variables, using the
    /// variable names listed in the external-interfaces contract.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut builder = Self::builder();
        if let Ok(v) = std::env::var("CONSUMER_BASE_URL") {
            builder = builder.consumer_base_url(v);
        }
        if let Ok(v) = std::env::var("SESSION_TOKEN") {
            builder = builder.session_token(v);
        }
        if let Ok(v) = std::env::var("JOB_ID") {
            builder = builder.job_id(v);
        }
        if let Ok(v) = std::env::var("CHALLENGE_ID") {
            builder = builder.challenge_id(v);
        }
        if let Ok(v) = std::env::var("VALIDATOR_HOTKEY") {
            builder = builder.validator_hotkey(v);
        }
        if let Ok(v) = std::env::var("RUN_SERVER") {
            builder = builder.run_server(parse_bool(&v));
        }
        if let Ok(v) = std::env::var("ADMIN_MODE") {
            builder = builder.admin_mode(parse_bool(&v));
        }
        if let Ok(v) = std::env::var("DEV_MODE") {
            builder = builder.dev_mode(parse_bool(&v));
        }
        if let Ok(v) = std::env::var("ALLOW_INSECURE_ADMIN") {
            builder = builder.allow_insecure_admin(parse_bool(&v));
        }
        if let Ok(v) = std::env::var("HOST") {
            builder = builder.host(v);
        }
        if let Ok(v) = std::env::var("PORT") {
            if let Ok(port) = v.parse() {
                builder = builder.port(port);
            }
        }
        if let Ok(v) = std::env::var("DB_VERSION") {
            let parsed = v
                .parse::<i64>()
                .map_err(|_| ConfigError::Invalid { field: "db_version", reason: v.clone() })?;
            builder = builder.db_version(parsed);
        }
        builder.build()
    }
}

fn parse_bool(s: &str) -> bool {
    matches!(s.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

/// Fluent, validating builder for [`SidecarConfig`].
#[derive(Debug, Default, Clone)]
pub struct SidecarConfigBuilder {
    consumer_base_url: Option<String>,
    session_token: Option<String>,
    job_id: Option<String>,
    challenge_id: Option<String>,
    validator_hotkey: Option<String>,
    run_server: bool,
    admin_mode: bool,
    dev_mode: bool,
    allow_insecure_admin: bool,
    host: Option<String>,
    port: Option<u16>,
    db_version: Option<i64>,
    max_parallel_jobs: Option<usize>,
    job_timeout_secs: Option<u64>,
    heartbeat_interval_secs: Option<u64>,
    max_frame_bytes: Option<usize>,
    outbound_queue_depth: Option<usize>,
    public_token_ttl_secs: Option<u64>,
    http_timeout_secs: Option<u64>,
    attestation_max_age_secs: Option<u64>,
}

impl SidecarConfigBuilder {
    pub fn consumer_base_url(mut self, v: impl Into<String>) -> Self {
        self.consumer_base_url = Some(v.into());
        self
    }

    pub fn session_token(mut self, v: impl Into<String>) -> Self {
        self.session_token = Some(v.into());
        self
    }

    pub fn job_id(mut self, v: impl Into<String>) -> Self {
        self.job_id = Some(v.into());
        self
    }

    pub fn challenge_id(mut self, v: impl Into<String>) -> Self {
        self.challenge_id = Some(v.into());
        self
    }

    pub fn validator_hotkey(mut self, v: impl Into<String>) -> Self {
        self.validator_hotkey = Some(v.into());
        self
    }

    pub fn run_server(mut self, v: bool) -> Self {
        self.run_server = v;
        self
    }

    pub fn admin_mode(mut self, v: bool) -> Self {
        self.admin_mode = v;
        self
    }

    pub fn dev_mode(mut self, v: bool) -> Self {
        self.dev_mode = v;
        self
    }

    pub fn allow_insecure_admin(mut self, v: bool) -> Self {
        self.allow_insecure_admin = v;
        self
    }

    pub fn host(mut self, v: impl Into<String>) -> Self {
        self.host = Some(v.into());
        self
    }

    pub fn port(mut self, v: u16) -> Self {
        self.port = Some(v);
        self
    }

    pub fn db_version(mut self, v: i64) -> Self {
        self.db_version = Some(v);
        self
    }

    pub fn max_parallel_jobs(mut self, v: usize) -> Self {
        self.max_parallel_jobs = Some(v);
        self
    }

    pub fn job_timeout_secs(mut self, v: u64) -> Self {
        self.job_timeout_secs = Some(v);
        self
    }

    pub fn heartbeat_interval_secs(mut self, v: u64) -> Self {
        self.heartbeat_interval_secs = Some(v);
        self
    }

    pub fn max_frame_bytes(mut self, v: usize) -> Self {
        self.max_frame_bytes = Some(v);
        self
    }

    pub fn outbound_queue_depth(mut self, v: usize) -> Self {
        self.outbound_queue_depth = Some(v);
        self
    }

    pub fn public_token_ttl_secs(mut self, v: u64) -> Self {
        self.public_token_ttl_secs = Some(v);
        self
    }

    pub fn http_timeout_secs(mut self, v: u64) -> Self {
        self.http_timeout_secs = Some(v);
        self
    }

    pub fn attestation_max_age_secs(mut self, v: u64) -> Self {
        self.attestation_max_age_secs = Some(v);
        self
    }

    /// Validate and freeze the configuration.
    pub fn build(self) -> Result<SidecarConfig, ConfigError> {
        let db_version = self.db_version.unwrap_or(1);
        if !(MIN_DB_VERSION..=MAX_DB_VERSION).contains(&db_version) {
            return Err(ConfigError::DbVersion(db_version));
        }

        let dev_mode = self.dev_mode;
        let admin_mode = self.admin_mode;
        if dev_mode && admin_mode && !self.allow_insecure_admin {
            return Err(ConfigError::InsecureAdminNotAllowed);
        }

        Ok(SidecarConfig {
            consumer_base_url: self.consumer_base_url.unwrap_or_default(),
            session_token: self.session_token.unwrap_or_default(),
            job_id: self.job_id.unwrap_or_default(),
            challenge_id: self.challenge_id.unwrap_or_default(),
            validator_hotkey: self.validator_hotkey.unwrap_or_default(),
            run_server: self.run_server,
            admin_mode,
            dev_mode,
            allow_insecure_admin: self.allow_insecure_admin,
            host: self.host.unwrap_or_else(|| "0.0.0.0".to_string()),
            port: self.port.unwrap_or(8080),
            db_version,
            db_dsn: None,
            max_parallel_jobs: self.max_parallel_jobs.unwrap_or(1),
            job_timeout_secs: self.job_timeout_secs.unwrap_or(300),
            heartbeat_interval_secs: self.heartbeat_interval_secs.unwrap_or(15),
            max_frame_bytes: self.max_frame_bytes.unwrap_or(16 * 1024 * 1024),
            outbound_queue_depth: self.outbound_queue_depth.unwrap_or(1024),
            public_token_ttl_secs: self.public_token_ttl_secs.unwrap_or(120),
            http_timeout_secs: self.http_timeout_secs.unwrap_or(30),
            attestation_max_age_secs: self.attestation_max_age_secs.unwrap_or(300),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_build_succeeds() {
        let cfg = SidecarConfig::builder().build().unwrap();
        assert_eq!(cfg.db_version, 1);
        assert_eq!(cfg.max_parallel_jobs, 1);
        assert_eq!(cfg.job_timeout_secs, 300);
    }

    #[test]
    fn rejects_out_of_range_db_version() {
        let err = SidecarConfig::builder().db_version(17).build().unwrap_err();
        assert_eq!(err, ConfigError::DbVersion(17));

        let err = SidecarConfig::builder().db_version(0).build().unwrap_err();
        assert_eq!(err, ConfigError::DbVersion(0));
    }

    #[test]
    fn rejects_dev_mode_admin_without_explicit_flag() {
        let err = SidecarConfig::builder()
            .dev_mode(true)
            .admin_mode(true)
            .build()
            .unwrap_err();
        assert_eq!(err, ConfigError::InsecureAdminNotAllowed);
    }

    #[test]
    fn allows_dev_mode_admin_with_explicit_flag() {
        let cfg = SidecarConfig::builder()
            .dev_mode(true)
            .admin_mode(true)
            .allow_insecure_admin(true)
            .build()
            .unwrap();
        assert!(cfg.dev_mode && cfg.admin_mode);
    }
}
