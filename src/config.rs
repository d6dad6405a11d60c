//! Engine configuration loading.
//!
//! Reads a YAML file and resolves `${VAR}` / `${VAR:-default}` environment
//! references before parsing. Only `endpoint` is required; every other section
//! falls back to defaults.

use std::borrow::Cow;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::{Captures, Regex};
use serde::Deserialize;
use thiserror::Error;

// ─── Errors ──────────────────────────────────────────────────────────────────

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {reason}")]
    Read { path: String, reason: String },

    #[error("failed to parse config: {reason}")]
    Parse { reason: String },
}

// ─── Public Types ────────────────────────────────────────────────────────────

/// Top-level engine configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    pub endpoint: ModelEndpoint,
    #[serde(default)]
    pub compression: CompressionConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// The chat-completion endpoint used by the main pipeline.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelEndpoint {
    pub base_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    pub model: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

/// Settings for the LLM-backed compression call.
#[derive(Debug, Clone, Deserialize)]
pub struct CompressionConfig {
    /// Low-cost model used for the compression request.
    #[serde(default = "default_compression_model")]
    pub model: String,
    /// Hard `max_tokens` ceiling on the compression reply.
    #[serde(default = "default_compression_max_tokens")]
    pub max_tokens: u32,
    /// Upper bound on how many older messages are sent for compression.
    #[serde(default = "default_compression_max_messages")]
    pub max_messages: usize,
    #[serde(default = "default_compression_temperature")]
    pub temperature: f32,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            model: default_compression_model(),
            max_tokens: default_compression_max_tokens(),
            max_messages: default_compression_max_messages(),
            temperature: default_compression_temperature(),
        }
    }
}

/// Where execution traces are persisted.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub path: Option<String>,
}

impl StoreConfig {
    /// Configured path, or `<data dir>/context-recovery/traces.db`.
    pub fn resolved_path(&self) -> PathBuf {
        match self.path {
            Some(ref p) => PathBuf::from(home_relative(p)),
            None => data_dir().join("traces.db"),
        }
    }
}

/// Log output settings consumed by [`crate::init_tracing`].
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Directory for `recovery.log`; defaults to the data dir.
    #[serde(default)]
    pub dir: Option<String>,
    /// Emit JSON lines instead of plain text.
    #[serde(default)]
    pub json: bool,
    /// Filter used when `RUST_LOG` is not set.
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            dir: None,
            json: false,
            filter: default_log_filter(),
        }
    }
}

impl LoggingConfig {
    pub fn resolved_dir(&self) -> PathBuf {
        match self.dir {
            Some(ref d) => PathBuf::from(home_relative(d)),
            None => data_dir(),
        }
    }
}

fn default_request_timeout_secs() -> u64 {
    60
}
fn default_compression_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_compression_max_tokens() -> u32 {
    2_000
}
fn default_compression_max_messages() -> usize {
    20
}
fn default_compression_temperature() -> f32 {
    0.3
}
fn default_log_filter() -> String {
    "context_recovery=info,warn".to_string()
}

// ─── Loading ─────────────────────────────────────────────────────────────────

/// Platform data directory for the engine.
///
/// Falls back to `~/.context-recovery/` when no platform directory resolves.
pub fn data_dir() -> PathBuf {
    if let Some(dir) = dirs::data_dir() {
        return dir.join("context-recovery");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".context-recovery")
}

/// Load and parse an engine configuration file.
pub fn load_config(path: &Path) -> Result<EngineConfig, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    parse_config(&raw)
}

/// Parse configuration from a YAML string (after env interpolation).
pub fn parse_config(raw: &str) -> Result<EngineConfig, ConfigError> {
    let interpolated = interpolate_env_vars(raw);
    serde_yaml::from_str(&interpolated).map_err(|e| ConfigError::Parse {
        reason: e.to_string(),
    })
}

// ─── Env-var interpolation ───────────────────────────────────────────────────

/// `${NAME}` or `${NAME:-fallback}`.
fn env_reference_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}")
            .expect("valid env reference regex")
    })
}

/// Substitute environment references in raw YAML. An unset variable without
/// a fallback becomes empty; fallbacks may start with `~`.
fn interpolate_env_vars(input: &str) -> Cow<'_, str> {
    env_reference_re().replace_all(input, |caps: &Captures<'_>| {
        match (std::env::var(&caps[1]), caps.get(2)) {
            (Ok(value), _) => value,
            (Err(_), Some(fallback)) => home_relative(fallback.as_str()),
            (Err(_), None) => String::new(),
        }
    })
}

fn home_relative(path: &str) -> String {
    match (path.strip_prefix('~'), dirs::home_dir()) {
        (Some(rest), Some(home)) => format!("{}{rest}", home.display()),
        _ => path.to_string(),
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
