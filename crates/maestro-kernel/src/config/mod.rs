//! Typed configuration loading.
//!
//! Supports TOML, YAML and JSON with auto-detection from the file
//! extension, `${VAR}` / `$VAR` environment substitution in the raw file,
//! and `MAESTRO_`-prefixed environment overrides layered on top. Invalid
//! combinations (e.g. insecure cookies in enterprise run mode) are fatal at
//! boot: the process exits non-zero with a `configuration_error`.

use config::{Config as Cfg, Environment, File, FileFormat};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Configuration loading or validation error.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config parsing error: {0}")]
    Parse(String),

    #[error("unsupported config format: {0}")]
    UnsupportedFormat(String),

    #[error("configuration error: {0}")]
    Invalid(String),
}

/// Result type for config operations.
pub type ConfigResult<T> = Result<T, ConfigError>;

// ---------------------------------------------------------------------------
// Run mode
// ---------------------------------------------------------------------------

/// Deployment posture. Enterprise implies a subject on every request and
/// secure session cookies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    Enterprise,
    #[default]
    Development,
}

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

/// Broker transport selection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessagingKind {
    Amqp,
    LogBased,
    #[default]
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AmqpSettings {
    pub url: String,
    /// Per-channel prefetch; 1 preserves per-queue ordering.
    pub prefetch: u16,
    /// TTL-based delay exchange for retry backoff, when configured.
    pub delay_exchange: Option<String>,
}

impl Default for AmqpSettings {
    fn default() -> Self {
        Self {
            url: "amqp://localhost:5672/%2f".to_string(),
            prefetch: 1,
            delay_exchange: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogBasedSettings {
    pub brokers: String,
    pub group_id: String,
    /// Tenant label attached to depth/lag gauges.
    pub tenant_label: String,
}

impl Default for LogBasedSettings {
    fn default() -> Self {
        Self {
            brokers: "localhost:9092".to_string(),
            group_id: "maestro".to_string(),
            tenant_label: "default".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MessagingSettings {
    #[serde(rename = "type")]
    pub kind: MessagingKind,
    pub amqp: AmqpSettings,
    pub log_based: LogBasedSettings,
}

/// Plan-state backend selection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStateBackend {
    #[default]
    File,
    Postgres,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlanStateSettings {
    pub backend: PlanStateBackend,
    /// File path (file backend) or connection string (postgres backend).
    pub path: String,
    /// Retention window in milliseconds; 0 disables purging.
    pub retention_ms: u64,
}

impl Default for PlanStateSettings {
    fn default() -> Self {
        Self {
            backend: PlanStateBackend::File,
            path: "maestro-state.json".to_string(),
            retention_ms: 0,
        }
    }
}

/// Backend provider for dedupe and rate-limit state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KvProvider {
    #[default]
    Memory,
    SharedKv,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupeSettings {
    pub provider: KvProvider,
    /// Reservation TTL safety net in milliseconds; 0 means no expiry.
    pub ttl_ms: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitRule {
    pub window_ms: u64,
    pub max_requests: u32,
}

impl Default for RateLimitRule {
    fn default() -> Self {
        Self {
            window_ms: 60_000,
            max_requests: 120,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitBackendSettings {
    pub provider: KvProvider,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitSettings {
    pub plan: RateLimitRule,
    pub chat: RateLimitRule,
    pub auth: RateLimitRule,
    pub remote_fs: RateLimitRule,
    pub backend: RateLimitBackendSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SseQuotaSettings {
    pub per_ip: u32,
    pub per_subject: u32,
}

impl Default for SseQuotaSettings {
    fn default() -> Self {
        Self {
            per_ip: 8,
            per_subject: 16,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CorsSettings {
    pub allowed_origins: Vec<String>,
}

impl Default for CorsSettings {
    fn default() -> Self {
        Self {
            allowed_origins: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestLimitSettings {
    pub json_bytes: usize,
    pub url_encoded_bytes: usize,
}

impl Default for RequestLimitSettings {
    fn default() -> Self {
        Self {
            json_bytes: 1_048_576,
            url_encoded_bytes: 65_536,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub bind_addr: String,
    pub sse_keep_alive_ms: u64,
    pub sse_quotas: SseQuotaSettings,
    pub rate_limits: RateLimitSettings,
    pub cors: CorsSettings,
    pub trusted_proxy_cidrs: Vec<String>,
    pub request_limits: RequestLimitSettings,
    /// Secure flag on session cookies. Mandatory in enterprise run mode.
    pub secure_cookies: bool,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8080".to_string(),
            sse_keep_alive_ms: 15_000,
            sse_quotas: SseQuotaSettings::default(),
            rate_limits: RateLimitSettings::default(),
            cors: CorsSettings::default(),
            trusted_proxy_cidrs: Vec::new(),
            request_limits: RequestLimitSettings::default(),
            secure_cookies: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    pub cookie_name: String,
    pub ttl_seconds: u64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            cookie_name: "maestro_session".to_string(),
            ttl_seconds: 8 * 3600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OidcSettings {
    pub enabled: bool,
    pub session: SessionSettings,
    pub tenant_claim: String,
}

impl Default for OidcSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            session: SessionSettings::default(),
            tenant_claim: "tenant".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthSettings {
    pub oidc: OidcSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionSettings {
    pub plan_artifacts_days: u32,
}

impl Default for RetentionSettings {
    fn default() -> Self {
        Self {
            plan_artifacts_days: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffSettings {
    pub base_ms: u64,
    pub max_ms: u64,
    pub jitter: bool,
}

impl Default for BackoffSettings {
    fn default() -> Self {
        Self {
            base_ms: 250,
            max_ms: 30_000,
            jitter: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeSettings {
    pub max_attempts: u32,
    pub backoff: BackoffSettings,
    pub event_history_limit: usize,
    pub subscriber_buffer: usize,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff: BackoffSettings::default(),
            event_history_limit: crate::bus::DEFAULT_HISTORY_LIMIT,
            subscriber_buffer: crate::bus::DEFAULT_SUBSCRIBER_BUFFER,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TracingSettings {
    /// Exporter endpoint; empty disables export (logs only).
    pub endpoint: String,
    pub service_name: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilitySettings {
    pub tracing: TracingSettings,
}

/// Root configuration document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MaestroConfig {
    pub run_mode: RunMode,
    pub messaging: MessagingSettings,
    pub plan_state: PlanStateSettings,
    pub dedupe: DedupeSettings,
    pub server: ServerSettings,
    pub auth: AuthSettings,
    pub retention: RetentionSettings,
    pub runtime: RuntimeSettings,
    pub observability: ObservabilitySettings,
}

impl MaestroConfig {
    /// Validate cross-field constraints. Called once at boot; violations
    /// are fatal.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.run_mode == RunMode::Enterprise && !self.server.secure_cookies {
            return Err(ConfigError::Invalid(
                "secure cookies must be enabled when run mode is enterprise".to_string(),
            ));
        }
        if self.server.sse_keep_alive_ms < 1 {
            return Err(ConfigError::Invalid(
                "server.sse_keep_alive_ms must be >= 1".to_string(),
            ));
        }
        if self.runtime.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "runtime.max_attempts must be >= 1".to_string(),
            ));
        }
        if self.runtime.backoff.base_ms > self.runtime.backoff.max_ms {
            return Err(ConfigError::Invalid(
                "runtime.backoff.base_ms must not exceed runtime.backoff.max_ms".to_string(),
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

/// Detect the configuration format from the file extension.
pub fn detect_format(path: &str) -> ConfigResult<FileFormat> {
    let ext = Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .ok_or_else(|| ConfigError::UnsupportedFormat("no file extension".to_string()))?;
    match ext.to_lowercase().as_str() {
        "toml" => Ok(FileFormat::Toml),
        "yaml" | "yml" => Ok(FileFormat::Yaml),
        "json" => Ok(FileFormat::Json),
        other => Err(ConfigError::UnsupportedFormat(other.to_string())),
    }
}

/// Substitute `${VAR}` and `$VAR` environment references in `content`.
/// Unset variables are replaced with the empty string.
pub fn substitute_env_vars(content: &str) -> String {
    let re_braced = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("static regex");
    let result = re_braced.replace_all(content, |caps: &regex::Captures| {
        std::env::var(&caps[1]).unwrap_or_default()
    });
    let re_bare = Regex::new(r"\$([A-Za-z_][A-Za-z0-9_]*)").expect("static regex");
    re_bare
        .replace_all(&result, |caps: &regex::Captures| {
            std::env::var(&caps[1]).unwrap_or_default()
        })
        .into_owned()
}

/// Load, substitute, layer environment overrides, deserialize, validate.
///
/// Environment overrides use the `MAESTRO_` prefix with `__` as the section
/// separator, e.g. `MAESTRO_SERVER__BIND_ADDR=0.0.0.0:9000`.
pub fn load(path: &str) -> ConfigResult<MaestroConfig> {
    let format = detect_format(path)?;
    let raw = std::fs::read_to_string(path)?;
    let substituted = substitute_env_vars(&raw);

    let cfg = Cfg::builder()
        .add_source(File::from_str(&substituted, format))
        .add_source(Environment::with_prefix("MAESTRO").separator("__"))
        .build()
        .map_err(|e| ConfigError::Parse(e.to_string()))?;

    let config: MaestroConfig = cfg
        .try_deserialize()
        .map_err(|e| ConfigError::Parse(e.to_string()))?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        MaestroConfig::default().validate().unwrap();
    }

    #[test]
    fn enterprise_without_secure_cookies_is_fatal() {
        let mut config = MaestroConfig::default();
        config.run_mode = RunMode::Enterprise;
        config.server.secure_cookies = false;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("secure cookies"));
    }

    #[test]
    fn enterprise_with_secure_cookies_is_valid() {
        let mut config = MaestroConfig::default();
        config.run_mode = RunMode::Enterprise;
        config.server.secure_cookies = true;
        config.validate().unwrap();
    }

    #[test]
    fn zero_keepalive_rejected() {
        let mut config = MaestroConfig::default();
        config.server.sse_keep_alive_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn toml_document_deserializes() {
        let doc = r#"
            run_mode = "development"

            [messaging]
            type = "memory"

            [plan_state]
            backend = "file"
            path = "/tmp/state.json"
            retention_ms = 86400000

            [server]
            sse_keep_alive_ms = 500

            [server.sse_quotas]
            per_ip = 2
            per_subject = 4

            [server.rate_limits.plan]
            window_ms = 1000
            max_requests = 10

            [auth.oidc]
            enabled = true

            [runtime.backoff]
            base_ms = 100
            max_ms = 5000
            jitter = false
        "#;
        let config: MaestroConfig = Cfg::builder()
            .add_source(File::from_str(doc, FileFormat::Toml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();
        assert_eq!(config.messaging.kind, MessagingKind::Memory);
        assert_eq!(config.server.sse_quotas.per_ip, 2);
        assert_eq!(config.server.rate_limits.plan.max_requests, 10);
        assert!(config.auth.oidc.enabled);
        assert_eq!(config.runtime.backoff.base_ms, 100);
        assert_eq!(config.plan_state.retention_ms, 86_400_000);
        config.validate().unwrap();
    }

    #[test]
    fn env_substitution_replaces_braced_and_bare() {
        std::env::set_var("MAESTRO_TEST_SUB", "replaced");
        assert_eq!(substitute_env_vars("a ${MAESTRO_TEST_SUB} b"), "a replaced b");
        assert_eq!(substitute_env_vars("a $MAESTRO_TEST_SUB b"), "a replaced b");
        std::env::remove_var("MAESTRO_TEST_SUB");
    }
}
