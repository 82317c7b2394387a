//! Configuration models for evalmux.
//!
//! All I^R (resolvable ignorance) is parameterized here.
//! The user resolves these unknowns at runtime via config file; every section
//! has defaults, so an absent file means the built-in setup.

use crate::models::ModelDescriptor;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

/// Top-level configuration for evalmux.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Fan-out dispatch settings
    #[serde(default)]
    pub dispatch: DispatchConfig,

    /// Judge backend settings
    #[serde(default)]
    pub judge: JudgeConfig,

    /// Extra or replacement catalog entries
    #[serde(default)]
    pub models: Vec<ModelDescriptor>,

    /// Drop the built-in catalog and use only `models`
    #[serde(default)]
    pub replace_builtin_models: bool,
}

/// Dispatch configuration.
///
/// K_i: Both caps apply across all models of one dispatch call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Maximum in-flight requests per dispatch call
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Maximum in-flight requests per remote host
    #[serde(default = "default_per_host_limit")]
    pub per_host_limit: usize,

    /// Per-request timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

fn default_max_concurrency() -> usize {
    5
}

fn default_per_host_limit() -> usize {
    10
}

fn default_timeout() -> u64 {
    60
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            per_host_limit: default_per_host_limit(),
            timeout_secs: default_timeout(),
        }
    }
}

/// Judge configuration.
///
/// I^B: The judge backend rate-limits and filters; retry parameters bound it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JudgeConfig {
    /// Catalog name of the judge backend
    #[serde(default = "default_judge_model")]
    pub model: String,

    /// Attempts per judge call (at least one is always made)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Base delay for 429 backoff, doubled per attempt
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,

    /// Fixed delay before retrying other failures
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    #[serde(default = "default_temperature")]
    pub temperature: f64,

    #[serde(default = "default_top_k")]
    pub top_k: u32,

    #[serde(default = "default_top_p")]
    pub top_p: f64,

    /// Generation length cap
    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u32,

    /// Per-request timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Judge calls allowed in flight during an evaluation
    #[serde(default = "default_judge_concurrency")]
    pub concurrency: usize,

    /// Score used in synthesized judgments
    #[serde(default = "default_neutral_score")]
    pub neutral_score: i64,
}

fn default_judge_model() -> String {
    "gemini-pro".to_string()
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    1000
}

fn default_retry_delay_ms() -> u64 {
    1000
}

fn default_temperature() -> f64 {
    0.1
}

fn default_top_k() -> u32 {
    1
}

fn default_top_p() -> f64 {
    0.8
}

fn default_max_output_tokens() -> u32 {
    4096
}

fn default_judge_concurrency() -> usize {
    3
}

fn default_neutral_score() -> i64 {
    3
}

impl Default for JudgeConfig {
    fn default() -> Self {
        Self {
            model: default_judge_model(),
            max_attempts: default_max_attempts(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_delay_ms: default_retry_delay_ms(),
            temperature: default_temperature(),
            top_k: default_top_k(),
            top_p: default_top_p(),
            max_output_tokens: default_max_output_tokens(),
            timeout_secs: default_timeout(),
            concurrency: default_judge_concurrency(),
            neutral_score: default_neutral_score(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// B_i(file exists) → Result
    /// B_i(file is valid TOML) → Result
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
            path: path.to_owned(),
            source: e,
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_owned(),
            source: e,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path` if it exists, otherwise use defaults.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            Self::from_file(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Check value ranges the runtime relies on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.dispatch.max_concurrency == 0 {
            return Err(ConfigError::Invalid(
                "dispatch.max_concurrency must be at least 1".to_string(),
            ));
        }
        if self.dispatch.per_host_limit == 0 {
            return Err(ConfigError::Invalid(
                "dispatch.per_host_limit must be at least 1".to_string(),
            ));
        }
        if self.judge.concurrency == 0 {
            return Err(ConfigError::Invalid(
                "judge.concurrency must be at least 1".to_string(),
            ));
        }

        let mut seen = std::collections::HashSet::new();
        for model in &self.models {
            if !seen.insert(model.name.as_str()) {
                return Err(ConfigError::DuplicateModel(model.name.clone()));
            }
        }
        Ok(())
    }
}

static ENV_PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([^}]+)\}").expect("valid regex"));

/// Expand environment variables in a string.
///
/// Supports ${VAR_NAME} syntax.
/// If the variable is not set, the placeholder is left unchanged.
pub fn expand_env_vars(s: &str) -> String {
    let mut result = s.to_string();

    for cap in ENV_PLACEHOLDER.captures_iter(s) {
        let var_name = &cap[1];
        if let Ok(value) = std::env::var(var_name) {
            result = result.replace(&cap[0], &value);
        }
    }

    result
}

/// Expand environment variables in all headers.
pub fn expand_headers(headers: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    headers
        .iter()
        .map(|(k, v)| (k.clone(), expand_env_vars(v)))
        .collect()
}

/// Configuration errors.
///
/// Epistemic origin:
/// - B_i falsified: File not found, parse error
/// - I^B materialized: Values out of range
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Model '{0}' is defined more than once in [[models]]")]
    DuplicateModel(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ProtocolFamily;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn empty_file_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.dispatch.max_concurrency, 5);
        assert_eq!(config.dispatch.per_host_limit, 10);
        assert_eq!(config.dispatch.timeout_secs, 60);
        assert_eq!(config.judge.max_attempts, 3);
        assert_eq!(config.judge.model, "gemini-pro");
        assert!(config.models.is_empty());
    }

    #[test]
    fn loads_models_and_overrides() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[dispatch]
max_concurrency = 2

[judge]
max_attempts = 1
retry_delay_ms = 0

[[models]]
name = "local-chat"
family = "event_stream"
endpoint = "http://localhost:9000/stream"
credential_key = "LOCAL_KEY"
"#
        )
        .unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.dispatch.max_concurrency, 2);
        assert_eq!(config.dispatch.per_host_limit, 10);
        assert_eq!(config.judge.max_attempts, 1);
        assert_eq!(config.models.len(), 1);
        assert_eq!(config.models[0].family, ProtocolFamily::EventStream);
    }

    #[test]
    fn rejects_zero_concurrency() {
        let config: Config = toml::from_str("[dispatch]\nmax_concurrency = 0\n").unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn rejects_duplicate_models() {
        let config: Config = toml::from_str(
            r#"
[[models]]
name = "a"
family = "event_stream"
endpoint = "http://x/1"
credential_key = "K"

[[models]]
name = "a"
family = "event_stream"
endpoint = "http://x/2"
credential_key = "K"
"#,
        )
        .unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::DuplicateModel(name)) if name == "a"
        ));
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_or_default(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.judge.concurrency, 3);
    }

    #[test]
    fn unknown_env_placeholder_is_kept() {
        assert_eq!(
            expand_env_vars("token ${EVALMUX_SURELY_UNSET_VAR}"),
            "token ${EVALMUX_SURELY_UNSET_VAR}"
        );
    }
}
