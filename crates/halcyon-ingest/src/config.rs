//! Collector configuration
//!
//! Settings are layered, lowest precedence first:
//!
//! 1. built-in defaults
//! 2. an optional TOML file (`--config`, `HALCYON_CONFIG`)
//! 3. `HALCYON__*` environment variables, `__` separating nested keys
//!
//! ```toml
//! [api]
//! base_url = "https://api.halcyon.ai"
//! token = "..."
//! verify_tls = true
//!
//! [object_types.alerts]
//! interval_secs = 900
//!
//! [object_types.installers]
//! enabled = false
//! ```
//!
//! The same alerts override from the environment:
//! `HALCYON__OBJECT_TYPES__ALERTS__INTERVAL_SECS=900`.

use crate::error::{IngestError, Result};
use crate::object_types::{self, CursorKind, PaginationStyle};
use crate::schema::UnknownFieldPolicy;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

// ============================================================================
// Configuration Constants
// ============================================================================

/// Vendor API base URL.
pub const DEFAULT_BASE_URL: &str = "https://api.halcyon.ai";

/// Per-request timeout in seconds.
pub const DEFAULT_TIMEOUT_SECS: u64 = 60;

/// Records requested per page.
pub const DEFAULT_PAGE_SIZE: u32 = 200;

/// Upper bound on pages fetched in a single run.
pub const DEFAULT_MAX_PAGES: u32 = 2000;

/// Attempts per request before a transient failure fails the run.
pub const DEFAULT_RETRY_MAX_ATTEMPTS: u32 = 5;

/// First backoff delay; doubles on each attempt.
pub const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 1000;

/// Ceiling for a single backoff sleep.
pub const DEFAULT_RETRY_MAX_DELAY_MS: u64 = 60_000;

/// Random jitter added to each backoff sleep.
pub const DEFAULT_RETRY_JITTER_MS: u64 = 250;

/// Whole-run deadline in seconds.
pub const DEFAULT_RUN_TIMEOUT_SECS: u64 = 1800;

/// Ids remembered per object type for duplicate suppression.
pub const DEFAULT_RECENT_ID_CAPACITY: usize = 5000;

/// Index name written into every output envelope.
pub const DEFAULT_INDEX: &str = "security_halcyon";

/// Environment prefix for layered settings.
pub const ENV_PREFIX: &str = "HALCYON";

/// Root settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub api: ApiSettings,
    pub collection: CollectionSettings,
    pub output: OutputSettings,
    /// Per-object-type overrides keyed by name (`alerts`) or sourcetype
    pub object_types: BTreeMap<String, ObjectTypeOverride>,
}

/// Vendor API connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiSettings {
    pub base_url: String,
    /// Bearer token
    pub token: String,
    /// Endpoint that exchanges `refresh_token` for a new bearer token
    pub refresh_url: Option<String>,
    pub refresh_token: Option<String>,
    pub verify_tls: bool,
    pub timeout_secs: u64,
    pub user_agent: String,
    pub proxy: ProxySettings,
    pub retry: RetrySettings,
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            token: String::new(),
            refresh_url: None,
            refresh_token: None,
            verify_tls: true,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            user_agent: format!("halcyon-ingest/{}", env!("CARGO_PKG_VERSION")),
            proxy: ProxySettings::default(),
            retry: RetrySettings::default(),
        }
    }
}

impl ApiSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Outbound proxy
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxySettings {
    pub url: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl ProxySettings {
    /// Proxy URL, ignoring blank values.
    pub fn url(&self) -> Option<&str> {
        self.url.as_deref().map(str::trim).filter(|u| !u.is_empty())
    }
}

/// Retry and backoff parameters for transient failures
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_RETRY_MAX_ATTEMPTS,
            base_delay_ms: DEFAULT_RETRY_BASE_DELAY_MS,
            max_delay_ms: DEFAULT_RETRY_MAX_DELAY_MS,
            jitter_ms: DEFAULT_RETRY_JITTER_MS,
        }
    }
}

/// Scheduling and state settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectionSettings {
    /// Directory for checkpoints and the health snapshot
    pub state_dir: PathBuf,
    pub page_size: u32,
    pub max_pages: u32,
    pub run_timeout_secs: u64,
    /// Simultaneous runs across all object types; 0 means unlimited
    pub max_concurrent_runs: usize,
    pub recent_id_capacity: usize,
}

impl Default for CollectionSettings {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from("./state"),
            page_size: DEFAULT_PAGE_SIZE,
            max_pages: DEFAULT_MAX_PAGES,
            run_timeout_secs: DEFAULT_RUN_TIMEOUT_SECS,
            max_concurrent_runs: 0,
            recent_id_capacity: DEFAULT_RECENT_ID_CAPACITY,
        }
    }
}

impl CollectionSettings {
    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.run_timeout_secs)
    }

    pub fn health_snapshot_path(&self) -> PathBuf {
        self.state_dir.join("health.json")
    }
}

/// Where records go
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SinkKind {
    /// Append JSON lines to `output.path`
    #[default]
    Jsonl,
    /// JSON lines on stdout
    Stdout,
}

/// Output settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputSettings {
    pub sink: SinkKind,
    pub path: PathBuf,
    pub index: String,
    /// Write `halcyon:collector_status` / `halcyon:collector_error` events
    pub collector_events: bool,
}

impl Default for OutputSettings {
    fn default() -> Self {
        Self {
            sink: SinkKind::Jsonl,
            path: PathBuf::from("./output/halcyon.jsonl"),
            index: DEFAULT_INDEX.to_string(),
            collector_events: true,
        }
    }
}

/// Optional per-object-type overrides
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObjectTypeOverride {
    pub enabled: Option<bool>,
    pub interval_secs: Option<u64>,
    pub path: Option<String>,
    pub pagination: Option<PaginationStyle>,
    pub cursor_kind: Option<CursorKind>,
    pub cursor_field: Option<String>,
    pub cursor_param: Option<String>,
    pub unknown_fields: Option<UnknownFieldPolicy>,
}

impl Settings {
    /// Load settings from `.env`, an optional TOML file and the environment.
    pub fn load(file: Option<&Path>) -> Result<Self> {
        let settings = Self::load_unchecked(file)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Like [`Settings::load`] without [`Settings::validate`], for commands
    /// that never reach the API.
    pub fn load_unchecked(file: Option<&Path>) -> Result<Self> {
        dotenvy::dotenv().ok();

        let mut builder = config::Config::builder();
        if let Some(path) = file {
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Toml)
                    .required(true),
            );
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let settings: Settings = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| IngestError::config(e.to_string()))?;
        Ok(settings)
    }

    /// Reject settings the collector cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.api.token.trim().is_empty() {
            return Err(IngestError::config(
                "api.token is required (set HALCYON__API__TOKEN or [api] token)",
            ));
        }

        let base = self.api.base_url.trim();
        if !(base.starts_with("http://") || base.starts_with("https://")) {
            return Err(IngestError::config(format!(
                "api.base_url must start with http:// or https://, got '{base}'"
            )));
        }
        url::Url::parse(base)
            .map_err(|e| IngestError::config(format!("api.base_url is not a valid URL: {e}")))?;

        if let Some(proxy) = self.api.proxy.url() {
            url::Url::parse(proxy)
                .map_err(|e| IngestError::config(format!("api.proxy.url is invalid: {e}")))?;
        }

        if self.api.refresh_url.is_some() != self.api.refresh_token.is_some() {
            return Err(IngestError::config(
                "api.refresh_url and api.refresh_token must be set together",
            ));
        }

        if self.api.timeout_secs == 0 {
            return Err(IngestError::config("api.timeout_secs must be greater than 0"));
        }
        if self.api.retry.max_attempts == 0 {
            return Err(IngestError::config("api.retry.max_attempts must be at least 1"));
        }
        if self.collection.page_size == 0 {
            return Err(IngestError::config("collection.page_size must be greater than 0"));
        }
        if self.collection.max_pages == 0 {
            return Err(IngestError::config("collection.max_pages must be greater than 0"));
        }
        if self.collection.run_timeout_secs == 0 {
            return Err(IngestError::config(
                "collection.run_timeout_secs must be greater than 0",
            ));
        }

        for (name, o) in &self.object_types {
            if !object_types::builtin_specs()
                .iter()
                .any(|spec| spec.name == *name || spec.sourcetype == name.as_str())
            {
                return Err(IngestError::UnknownObjectType(name.clone()));
            }
            if o.interval_secs == Some(0) {
                return Err(IngestError::config(format!(
                    "object_types.{name}.interval_secs must be greater than 0"
                )));
            }
        }

        if self.api.timeout_secs >= self.collection.run_timeout_secs {
            tracing::warn!(
                request_timeout_secs = self.api.timeout_secs,
                run_timeout_secs = self.collection.run_timeout_secs,
                "Request timeout is not shorter than the run deadline"
            );
        }

        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    fn valid() -> Settings {
        let mut s = Settings::default();
        s.api.token = "secret".into();
        s
    }

    fn clear_env() {
        for (key, _) in std::env::vars() {
            if key.starts_with("HALCYON__") {
                std::env::remove_var(key);
            }
        }
    }

    #[test]
    fn test_defaults() {
        let s = Settings::default();
        assert_eq!(s.api.base_url, DEFAULT_BASE_URL);
        assert!(s.api.verify_tls);
        assert_eq!(s.collection.page_size, 200);
        assert_eq!(s.collection.max_pages, 2000);
        assert_eq!(s.output.index, "security_halcyon");
        assert_eq!(s.api.retry.max_attempts, 5);
    }

    #[test]
    fn test_validate_requires_token_and_http_url() {
        assert!(Settings::default().validate().is_err());
        assert!(valid().validate().is_ok());

        let mut s = valid();
        s.api.base_url = "ftp://api.halcyon.ai".into();
        assert!(s.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_values() {
        let mut s = valid();
        s.collection.page_size = 0;
        assert!(s.validate().is_err());

        let mut s = valid();
        s.object_types.insert(
            "alerts".into(),
            ObjectTypeOverride {
                interval_secs: Some(0),
                ..Default::default()
            },
        );
        assert!(s.validate().is_err());

        let mut s = valid();
        s.api.refresh_url = Some("https://api.halcyon.ai/v2/auth/refresh".into());
        assert!(s.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_unknown_object_type() {
        let mut s = valid();
        s.object_types
            .insert("halcyon:tag".into(), ObjectTypeOverride::default());
        assert!(s.validate().is_ok());

        s.object_types
            .insert("widgets".into(), ObjectTypeOverride::default());
        assert!(matches!(
            s.validate(),
            Err(IngestError::UnknownObjectType(ref name)) if name == "widgets"
        ));
    }

    #[test]
    #[serial]
    fn test_load_file_then_env() {
        clear_env();
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[api]
token = "from-file"
timeout_secs = 30

[collection]
page_size = 50

[object_types.alerts]
interval_secs = 900

[object_types.installers]
enabled = false
"#
        )
        .unwrap();

        std::env::set_var("HALCYON__API__TOKEN", "from-env");
        std::env::set_var("HALCYON__OBJECT_TYPES__TAGS__ENABLED", "false");

        let s = Settings::load(Some(file.path())).unwrap();
        clear_env();

        assert_eq!(s.api.token, "from-env");
        assert_eq!(s.api.timeout_secs, 30);
        assert_eq!(s.collection.page_size, 50);
        assert_eq!(s.object_types["alerts"].interval_secs, Some(900));
        assert_eq!(s.object_types["installers"].enabled, Some(false));
        assert_eq!(s.object_types["tags"].enabled, Some(false));
    }

    #[test]
    #[serial]
    fn test_load_without_token_fails() {
        clear_env();
        let err = Settings::load(None).unwrap_err();
        assert!(matches!(err, IngestError::Config(_)));
    }
}
