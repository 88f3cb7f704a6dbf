//! TOML configuration for the bridge.
//!
//! Everything the pipeline needs is read once at startup by [`load_config`]
//! and then handed to the components that need it; nothing is global.
//! See `config/xapi-bridge.example.toml` for a complete file.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

/// Environment variable consulted when `lrs.password` is absent.
pub const PASSWORD_ENV: &str = "XAPI_BRIDGE_LRS_PASSWORD";

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub debug: bool,
    pub lrs: LrsConfig,
    #[serde(default)]
    pub publish: PublishConfig,
    #[serde(default)]
    pub tailer: TailerConfig,
    #[serde(default)]
    pub filters: FilterConfig,
    #[serde(default)]
    pub statements: StatementConfig,
    #[serde(default)]
    pub status: StatusConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LrsConfig {
    pub endpoint: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_xapi_version")]
    pub version: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_xapi_version() -> String {
    "1.0.3".to_string()
}
fn default_timeout_secs() -> u64 {
    30
}

impl LrsConfig {
    /// Password from the config file, falling back to [`PASSWORD_ENV`].
    pub fn resolved_password(&self) -> String {
        self.password
            .clone()
            .or_else(|| std::env::var(PASSWORD_ENV).ok())
            .unwrap_or_default()
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Batching and retry policy of the publish queue.
#[derive(Debug, Deserialize, Clone)]
pub struct PublishConfig {
    /// Statements per batch; reaching it triggers an immediate publish.
    #[serde(default = "default_max_payload")]
    pub max_payload: usize,
    /// Longest a statement waits in a partial batch. 0 disables the timer.
    #[serde(default = "default_max_wait_ms")]
    pub max_wait_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Lifetime published count at which a milestone is logged. 0 disables.
    #[serde(default)]
    pub benchmark_statements: u64,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            max_payload: default_max_payload(),
            max_wait_ms: default_max_wait_ms(),
            max_retries: default_max_retries(),
            benchmark_statements: 0,
        }
    }
}

fn default_max_payload() -> usize {
    10
}
fn default_max_wait_ms() -> u64 {
    10_000
}
fn default_max_retries() -> u32 {
    3
}

impl PublishConfig {
    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct TailerConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for TailerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

fn default_poll_interval_ms() -> u64 {
    250
}

impl TailerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct FilterConfig {
    #[serde(default)]
    pub ignored_event_types: HashSet<String>,
}

/// Base values stamped into every statement.
#[derive(Debug, Deserialize, Clone)]
pub struct StatementConfig {
    #[serde(default = "default_lms_root_url")]
    pub lms_root_url: String,
    #[serde(default = "default_platform")]
    pub platform: String,
}

impl Default for StatementConfig {
    fn default() -> Self {
        Self {
            lms_root_url: default_lms_root_url(),
            platform: default_platform(),
        }
    }
}

fn default_lms_root_url() -> String {
    "http://localhost:8000".to_string()
}
fn default_platform() -> String {
    "Open edX".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct StatusConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_status_bind")]
    pub bind: String,
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind: default_status_bind(),
        }
    }
}

fn default_status_bind() -> String {
    "0.0.0.0:9090".to_string()
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

/// Parse and validate configuration text.
pub fn parse_config(content: &str) -> Result<Config> {
    let mut config: Config =
        toml::from_str(content).with_context(|| "Failed to parse config file")?;

    let endpoint = config.lrs.endpoint.trim().trim_end_matches('/').to_string();
    if endpoint.is_empty() {
        bail!("lrs.endpoint must not be empty");
    }
    if !(endpoint.starts_with("http://") || endpoint.starts_with("https://")) {
        bail!("lrs.endpoint must be an http(s) URL, got '{}'", endpoint);
    }
    config.lrs.endpoint = endpoint;

    if config.lrs.timeout_secs == 0 {
        bail!("lrs.timeout_secs must be > 0");
    }

    if config.publish.max_payload == 0 {
        bail!("publish.max_payload must be > 0");
    }

    if config.tailer.poll_interval_ms == 0 {
        bail!("tailer.poll_interval_ms must be > 0");
    }

    config.statements.lms_root_url = config
        .statements
        .lms_root_url
        .trim_end_matches('/')
        .to_string();

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_uses_defaults() {
        let cfg = parse_config(
            r#"
[lrs]
endpoint = "https://lrs.example.com/xapi/"
"#,
        )
        .unwrap();

        assert_eq!(cfg.lrs.endpoint, "https://lrs.example.com/xapi");
        assert_eq!(cfg.lrs.version, "1.0.3");
        assert_eq!(cfg.publish.max_payload, 10);
        assert_eq!(cfg.publish.max_wait(), Duration::from_secs(10));
        assert_eq!(cfg.publish.max_retries, 3);
        assert_eq!(cfg.tailer.poll_interval(), Duration::from_millis(250));
        assert!(cfg.filters.ignored_event_types.is_empty());
        assert!(!cfg.status.enabled);
        assert!(!cfg.debug);
    }

    #[test]
    fn full_config() {
        let cfg = parse_config(
            r#"
debug = true

[lrs]
endpoint = "http://127.0.0.1:8080"
username = "key"
password = "secret"
timeout_secs = 5

[publish]
max_payload = 25
max_wait_ms = 0
max_retries = 7
benchmark_statements = 1000

[filters]
ignored_event_types = ["load_video", "edx.video.paused"]

[statements]
lms_root_url = "https://courses.example.org/"

[status]
enabled = true
bind = "127.0.0.1:9999"
"#,
        )
        .unwrap();

        assert!(cfg.debug);
        assert_eq!(cfg.lrs.resolved_password(), "secret");
        assert_eq!(cfg.publish.max_payload, 25);
        assert!(cfg.publish.max_wait().is_zero());
        assert_eq!(cfg.publish.benchmark_statements, 1000);
        assert!(cfg.filters.ignored_event_types.contains("load_video"));
        assert_eq!(cfg.statements.lms_root_url, "https://courses.example.org");
        assert_eq!(cfg.status.bind, "127.0.0.1:9999");
    }

    #[test]
    fn rejects_zero_payload() {
        let err = parse_config(
            r#"
[lrs]
endpoint = "http://lrs"

[publish]
max_payload = 0
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("max_payload"));
    }

    #[test]
    fn rejects_non_http_endpoint() {
        let err = parse_config(
            r#"
[lrs]
endpoint = "lrs.example.com"
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("http"));
    }

    #[test]
    fn missing_lrs_section_is_an_error() {
        assert!(parse_config("debug = true\n").is_err());
    }
}
