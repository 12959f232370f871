//! Configuration file loading and management.
//!
//! Loads configuration from:
//! - Linux/macOS: `~/.config/credguard/config.toml`
//! - Windows: `%APPDATA%/credguard/config.toml`
//!
//! ## Precedence
//!
//! Settings are resolved with the following precedence (highest first):
//! 1. CLI flags
//! 2. Environment variables
//! 3. Config file
//! 4. Built-in defaults
//!
//! ## Environment Variables
//!
//! - `CREDGUARD_CONFIG`: Override config file path
//! - `CREDGUARD_VALIDATION_TIMEOUT`: Probe timeout in seconds
//! - `CREDGUARD_NOTIFY_THRESHOLD`: Errors per provider that trigger a notification
//! - `CREDGUARD_CREDENTIAL_INTERVAL`: Credential validation interval in seconds
//! - `CREDGUARD_AUTO_DESTROY`: Destroy pipelines of unrecoverable invalid keys (1, true, yes)

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::AppPaths;
use crate::cli::args::{Cli, RunArgs};
use crate::core::health::HealthSettings;
use crate::core::logging::LogLevel;
use crate::error::{GuardError, Result};

// =============================================================================
// Environment Variable Names
// =============================================================================

/// Environment variable to override config file path.
pub const ENV_CONFIG: &str = "CREDGUARD_CONFIG";
/// Environment variable for the probe timeout in seconds.
pub const ENV_VALIDATION_TIMEOUT: &str = "CREDGUARD_VALIDATION_TIMEOUT";
/// Environment variable for the notification threshold.
pub const ENV_NOTIFY_THRESHOLD: &str = "CREDGUARD_NOTIFY_THRESHOLD";
/// Environment variable for the credential validation interval in seconds.
pub const ENV_CREDENTIAL_INTERVAL: &str = "CREDGUARD_CREDENTIAL_INTERVAL";
/// Environment variable enabling automatic destroy of invalid pipelines.
pub const ENV_AUTO_DESTROY: &str = "CREDGUARD_AUTO_DESTROY";

/// Upper bound for probe and refresh timeouts.
const MAX_TIMEOUT_SECS: u64 = 300;

// =============================================================================
// Resolved Configuration
// =============================================================================

/// Configuration after merging CLI, env vars, and config file.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// Merged configuration, validated.
    pub config: Config,
    /// Config file that was consulted (it may not exist).
    pub config_path: PathBuf,
    /// Effective log level.
    pub log_level: LogLevel,
    /// Source of each setting for debugging.
    pub sources: ConfigSources,
}

/// Tracks the source of each configuration value.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ConfigSources {
    pub config_path: ConfigSource,
    pub log_level: ConfigSource,
    pub validation_timeout: ConfigSource,
    pub notification_threshold: ConfigSource,
    pub credential_interval: ConfigSource,
    pub auto_destroy_invalid: ConfigSource,
}

/// Where a configuration value came from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigSource {
    /// Value from CLI flag.
    Cli,
    /// Value from environment variable.
    Env,
    /// Value from config file.
    ConfigFile,
    /// Built-in default.
    #[default]
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cli => write!(f, "CLI flag"),
            Self::Env => write!(f, "environment variable"),
            Self::ConfigFile => write!(f, "config file"),
            Self::Default => write!(f, "default"),
        }
    }
}

impl ResolvedConfig {
    /// Resolve final configuration from CLI args, environment variables, and config file.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but is invalid, or if any
    /// resolved value fails validation.
    pub fn resolve(cli: &Cli, run_args: Option<&RunArgs>) -> Result<Self> {
        let mut sources = ConfigSources::default();

        let config_path = Self::resolve_config_path(cli, &mut sources.config_path);
        let mut config = Config::load_from(&config_path)?;
        if config_path.exists() {
            sources.validation_timeout = ConfigSource::ConfigFile;
            sources.notification_threshold = ConfigSource::ConfigFile;
            sources.credential_interval = ConfigSource::ConfigFile;
            sources.auto_destroy_invalid = ConfigSource::ConfigFile;
        }

        let log_level = Self::resolve_log_level(cli, &config, &mut sources.log_level)?;

        if let Some(timeout) =
            Self::resolve_u64(run_args.and_then(|a| a.timeout), ENV_VALIDATION_TIMEOUT, &mut sources.validation_timeout)?
        {
            config.selfcheck.validation_timeout_secs = timeout;
        }
        if let Some(interval) = Self::resolve_u64(
            run_args.and_then(|a| a.interval),
            ENV_CREDENTIAL_INTERVAL,
            &mut sources.credential_interval,
        )? {
            config.selfcheck.credential_interval_secs = interval;
        }
        if let Some(threshold) =
            Self::resolve_u64(None, ENV_NOTIFY_THRESHOLD, &mut sources.notification_threshold)?
        {
            config.oauth.notification_threshold = usize::try_from(threshold)
                .map_err(|_| GuardError::Config(format!("{ENV_NOTIFY_THRESHOLD} is out of range")))?;
        }
        if run_args.is_some_and(|a| a.auto_destroy) {
            sources.auto_destroy_invalid = ConfigSource::Cli;
            config.selfcheck.auto_destroy_invalid = true;
        } else if let Ok(value) = std::env::var(ENV_AUTO_DESTROY) {
            sources.auto_destroy_invalid = ConfigSource::Env;
            config.selfcheck.auto_destroy_invalid = is_truthy(&value);
        }

        config.validate()?;

        Ok(Self {
            config,
            config_path,
            log_level,
            sources,
        })
    }

    /// Resolve the config file path: `--config`, then `CREDGUARD_CONFIG`, then the default.
    fn resolve_config_path(cli: &Cli, source: &mut ConfigSource) -> PathBuf {
        if let Some(path) = &cli.config {
            *source = ConfigSource::Cli;
            return path.clone();
        }
        if let Ok(path) = std::env::var(ENV_CONFIG)
            && !path.trim().is_empty()
        {
            *source = ConfigSource::Env;
            return PathBuf::from(path);
        }
        *source = ConfigSource::Default;
        Config::config_path()
    }

    fn resolve_log_level(cli: &Cli, config: &Config, source: &mut ConfigSource) -> Result<LogLevel> {
        // 1. CLI flag
        if let Some(level) = cli.log_level.as_deref() {
            *source = ConfigSource::Cli;
            return parse_log_level(level);
        }

        // 2. Environment variable
        if let Some(level) = crate::core::logging::level_from_env() {
            *source = ConfigSource::Env;
            return Ok(level);
        }

        // 3. Config file
        if let Some(level) = config.general.log_level.as_deref() {
            *source = ConfigSource::ConfigFile;
            return parse_log_level(level);
        }

        // 4. Default
        *source = ConfigSource::Default;
        Ok(LogLevel::default())
    }

    /// CLI value, else a numeric env var. `None` leaves the file/default value.
    fn resolve_u64(cli: Option<u64>, env: &str, source: &mut ConfigSource) -> Result<Option<u64>> {
        if let Some(value) = cli {
            *source = ConfigSource::Cli;
            return Ok(Some(value));
        }
        if let Ok(raw) = std::env::var(env) {
            let value = raw
                .trim()
                .parse::<u64>()
                .map_err(|_| GuardError::Config(format!("{env} must be a whole number, got \"{raw}\"")))?;
            *source = ConfigSource::Env;
            return Ok(Some(value));
        }
        Ok(None)
    }
}

fn parse_log_level(s: &str) -> Result<LogLevel> {
    LogLevel::from_arg(s).ok_or_else(|| {
        GuardError::Config(format!(
            "Invalid log level \"{s}\". Valid levels: trace, debug, info, warn, error"
        ))
    })
}

fn is_truthy(value: &str) -> bool {
    matches!(value.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

// =============================================================================
// Config File
// =============================================================================

/// Application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub general: GeneralConfig,
    pub selfcheck: SelfCheckConfig,
    pub oauth: OAuthConfig,
    /// Per-provider probe and refresh settings keyed by provider name.
    pub providers: BTreeMap<String, ProviderConfig>,
    pub pipelines: Vec<PipelineConfig>,
}

/// General application settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Default log level (error, warn, info, debug, trace).
    pub log_level: Option<String>,
}

/// Self-check timers and thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SelfCheckConfig {
    pub enabled: bool,
    /// Timer 1: credential validation cycle.
    pub credential_validation: bool,
    /// Timer 2: pipeline health sweep.
    pub pipeline_health: bool,
    /// Timer 3: OAuth health aggregation.
    pub oauth_health: bool,
    pub credential_interval_secs: u64,
    pub pipeline_interval_secs: u64,
    pub oauth_interval_secs: u64,
    pub validation_timeout_secs: u64,
    pub refresh_timeout_secs: u64,
    /// How long a validation result is served from cache.
    pub cache_ttl_secs: u64,
    /// Lead time before expiry at which a refreshable credential is refreshed.
    pub expiry_margin_secs: u64,
    /// Destroy pipelines whose credentials are invalid and not refreshable.
    pub auto_destroy_invalid: bool,
}

impl Default for SelfCheckConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            credential_validation: true,
            pipeline_health: true,
            oauth_health: true,
            credential_interval_secs: 300,
            pipeline_interval_secs: 60,
            oauth_interval_secs: 180,
            validation_timeout_secs: 15,
            refresh_timeout_secs: 30,
            cache_ttl_secs: 300,
            expiry_margin_secs: 600,
            auto_destroy_invalid: false,
        }
    }
}

impl SelfCheckConfig {
    #[must_use]
    pub const fn credential_interval(&self) -> Duration {
        Duration::from_secs(self.credential_interval_secs)
    }

    #[must_use]
    pub const fn pipeline_interval(&self) -> Duration {
        Duration::from_secs(self.pipeline_interval_secs)
    }

    #[must_use]
    pub const fn oauth_interval(&self) -> Duration {
        Duration::from_secs(self.oauth_interval_secs)
    }

    #[must_use]
    pub const fn validation_timeout(&self) -> Duration {
        Duration::from_secs(self.validation_timeout_secs)
    }

    #[must_use]
    pub const fn refresh_timeout(&self) -> Duration {
        Duration::from_secs(self.refresh_timeout_secs)
    }

    #[must_use]
    pub const fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    #[must_use]
    pub const fn expiry_margin(&self) -> Duration {
        Duration::from_secs(self.expiry_margin_secs)
    }
}

/// OAuth error detection and notification settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OAuthConfig {
    pub detection_enabled: bool,
    pub notification_threshold: usize,
    pub buffer_capacity: usize,
    pub aggregation_window_secs: u64,
}

impl Default for OAuthConfig {
    fn default() -> Self {
        Self {
            detection_enabled: true,
            notification_threshold: 3,
            buffer_capacity: 10,
            aggregation_window_secs: 300,
        }
    }
}

impl OAuthConfig {
    #[must_use]
    pub fn health_settings(&self) -> HealthSettings {
        HealthSettings {
            capacity: self.buffer_capacity,
            threshold: self.notification_threshold,
            window: chrono::Duration::from_std(Duration::from_secs(self.aggregation_window_secs))
                .unwrap_or(chrono::Duration::MAX),
        }
    }
}

/// Settings for a specific provider.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Probe endpoint (chat completions URL).
    pub endpoint: Option<String>,
    /// Model used for probes.
    pub test_model: Option<String>,
    /// OAuth token endpoint; with `client_id` enables refresh-token recovery.
    pub token_endpoint: Option<String>,
    pub client_id: Option<String>,
    #[serde(skip_serializing)]
    pub client_secret: Option<String>,
}

impl ProviderConfig {
    /// Whether refresh-token recovery is configured.
    #[must_use]
    pub const fn is_refreshable(&self) -> bool {
        self.token_endpoint.is_some() && self.client_id.is_some()
    }
}

/// A pipeline served by the built-in pipeline manager.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub id: String,
    pub provider: String,
    /// Literal credential. Prefer `credential_env` or `token_file`.
    #[serde(skip_serializing)]
    pub credential: Option<String>,
    /// Environment variable holding the credential.
    pub credential_env: Option<String>,
    /// OAuth token file; supplies the credential when no other source does.
    pub token_file: Option<PathBuf>,
    pub model: Option<String>,
    pub endpoint: Option<String>,
}

impl PipelineConfig {
    /// Whether any credential source is configured.
    #[must_use]
    pub const fn has_credential_source(&self) -> bool {
        self.credential.is_some() || self.credential_env.is_some() || self.token_file.is_some()
    }
}

impl Config {
    /// Load configuration from the default config file path.
    ///
    /// # Errors
    ///
    /// Returns an error only if the file exists but is invalid.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path())
    }

    /// Load configuration from a specific path.
    ///
    /// Returns default config if the file doesn't exist.
    ///
    /// # Errors
    ///
    /// Returns an error only if the file exists but cannot be read or parsed.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!(?path, "Config file not found, using defaults");
            return Ok(Self::default());
        }

        tracing::debug!(?path, "Loading config file");
        let content = fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| GuardError::ConfigParse {
            path: path.display().to_string(),
            message: e.to_string(),
        })
    }

    /// Get the config file path.
    #[must_use]
    pub fn config_path() -> PathBuf {
        AppPaths::new().config_file()
    }

    /// Validate configuration values.
    ///
    /// # Errors
    ///
    /// Returns [`GuardError::Config`] describing the first invalid value.
    pub fn validate(&self) -> Result<()> {
        let s = &self.selfcheck;
        for (name, value) in [
            ("credential_interval_secs", s.credential_interval_secs),
            ("pipeline_interval_secs", s.pipeline_interval_secs),
            ("oauth_interval_secs", s.oauth_interval_secs),
        ] {
            if value == 0 {
                return Err(GuardError::Config(format!(
                    "selfcheck.{name} must be greater than zero"
                )));
            }
        }

        for (name, value) in [
            ("validation_timeout_secs", s.validation_timeout_secs),
            ("refresh_timeout_secs", s.refresh_timeout_secs),
        ] {
            if value == 0 || value > MAX_TIMEOUT_SECS {
                return Err(GuardError::Config(format!(
                    "selfcheck.{name} must be between 1 and {MAX_TIMEOUT_SECS} seconds"
                )));
            }
        }

        if self.oauth.notification_threshold == 0 {
            return Err(GuardError::Config(
                "oauth.notification_threshold must be at least 1".to_string(),
            ));
        }
        if self.oauth.buffer_capacity == 0 {
            return Err(GuardError::Config(
                "oauth.buffer_capacity must be at least 1".to_string(),
            ));
        }
        if self.oauth.aggregation_window_secs == 0 {
            return Err(GuardError::Config(
                "oauth.aggregation_window_secs must be greater than zero".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for pipeline in &self.pipelines {
            if pipeline.id.trim().is_empty() {
                return Err(GuardError::Config("pipeline id must not be empty".to_string()));
            }
            if pipeline.provider.trim().is_empty() {
                return Err(GuardError::Config(format!(
                    "pipeline \"{}\" has no provider",
                    pipeline.id
                )));
            }
            if !seen.insert(pipeline.id.as_str()) {
                return Err(GuardError::Config(format!(
                    "duplicate pipeline id \"{}\"",
                    pipeline.id
                )));
            }
            if !pipeline.has_credential_source() {
                return Err(GuardError::Config(format!(
                    "pipeline \"{}\" needs one of credential, credential_env, or token_file",
                    pipeline.id
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::args::{Commands, OutputFormat};
    use std::io::Write;
    use crate::test_utils::ENV_LOCK;
    use tempfile::NamedTempFile;

    /// Helper to set an environment variable in tests. Callers hold `ENV_LOCK`.
    #[allow(unsafe_code)]
    fn set_env(key: &str, value: &str) {
        // SAFETY: env-mutating tests serialize on ENV_LOCK
        unsafe { std::env::set_var(key, value) };
    }

    #[allow(unsafe_code)]
    fn remove_env(key: &str) {
        // SAFETY: env-mutating tests serialize on ENV_LOCK
        unsafe { std::env::remove_var(key) };
    }

    fn clear_env() {
        for key in [
            ENV_CONFIG,
            ENV_VALIDATION_TIMEOUT,
            ENV_NOTIFY_THRESHOLD,
            ENV_CREDENTIAL_INTERVAL,
            ENV_AUTO_DESTROY,
            "CREDGUARD_LOG",
        ] {
            remove_env(key);
        }
    }

    fn make_test_cli(config: Option<PathBuf>) -> Cli {
        Cli {
            command: Commands::Config,
            config,
            format: OutputFormat::Human,
            json: false,
            pretty: false,
            log_level: None,
            json_output: false,
            verbose: false,
        }
    }

    fn write_config(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{contents}").unwrap();
        file
    }

    const SAMPLE: &str = r#"
[general]
log_level = "debug"

[selfcheck]
credential_interval_secs = 120
validation_timeout_secs = 20
auto_destroy_invalid = true

[oauth]
notification_threshold = 5

[providers.qwen]
endpoint = "https://portal.qwen.ai/v1/chat/completions"
token_endpoint = "https://chat.qwen.ai/api/v1/oauth2/token"
client_id = "client-123"

[[pipelines]]
id = "qwen-main"
provider = "qwen"
credential_env = "QWEN_API_KEY"
token_file = "~/.qwen/oauth_creds.json"
model = "qwen3-coder-plus"

[[pipelines]]
id = "iflow-main"
provider = "iflow"
credential = "sk-aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa"
"#;

    #[test]
    fn default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.selfcheck.credential_interval(), Duration::from_secs(300));
        assert_eq!(config.selfcheck.pipeline_interval(), Duration::from_secs(60));
        assert_eq!(config.selfcheck.oauth_interval(), Duration::from_secs(180));
        assert_eq!(config.selfcheck.validation_timeout(), Duration::from_secs(15));
        assert_eq!(config.oauth.notification_threshold, 3);
        assert_eq!(config.oauth.buffer_capacity, 10);
        assert!(!config.selfcheck.auto_destroy_invalid);
    }

    #[test]
    fn load_missing_file_returns_default() {
        let config = Config::load_from(Path::new("/nonexistent/path/config.toml")).unwrap();
        assert_eq!(config.selfcheck.cache_ttl_secs, 300);
        assert!(config.pipelines.is_empty());
    }

    #[test]
    fn load_full_sample() {
        let file = write_config(SAMPLE);
        let config = Config::load_from(file.path()).unwrap();
        assert_eq!(config.general.log_level.as_deref(), Some("debug"));
        assert_eq!(config.selfcheck.credential_interval_secs, 120);
        assert!(config.selfcheck.auto_destroy_invalid);
        // Unspecified values keep their defaults.
        assert_eq!(config.selfcheck.pipeline_interval_secs, 60);
        assert_eq!(config.oauth.notification_threshold, 5);
        assert_eq!(config.oauth.buffer_capacity, 10);
        assert!(config.providers["qwen"].is_refreshable());
        assert_eq!(config.pipelines.len(), 2);
        assert_eq!(
            config.pipelines[0].token_file.as_deref(),
            Some(Path::new("~/.qwen/oauth_creds.json"))
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn load_invalid_toml_returns_parse_error() {
        let file = write_config("this is not valid toml {{");
        assert!(matches!(
            Config::load_from(file.path()),
            Err(GuardError::ConfigParse { .. })
        ));
    }

    #[test]
    fn validate_rejects_zero_interval() {
        let mut config = Config::default();
        config.selfcheck.pipeline_interval_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_boundary_timeout() {
        let mut config = Config::default();
        config.selfcheck.validation_timeout_secs = 1;
        assert!(config.validate().is_ok());
        config.selfcheck.validation_timeout_secs = 300;
        assert!(config.validate().is_ok());
        config.selfcheck.validation_timeout_secs = 301;
        assert!(config.validate().is_err());
        config.selfcheck.validation_timeout_secs = 15;
        config.selfcheck.refresh_timeout_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_zero_threshold_and_capacity() {
        let mut config = Config::default();
        config.oauth.notification_threshold = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.oauth.buffer_capacity = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_duplicate_pipeline_ids() {
        let pipeline = PipelineConfig {
            id: "p1".into(),
            provider: "iflow".into(),
            credential: Some("sk-aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa".into()),
            ..PipelineConfig::default()
        };
        let config = Config {
            pipelines: vec![pipeline.clone(), pipeline],
            ..Config::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate pipeline id"));
    }

    #[test]
    fn validate_rejects_pipeline_without_credential_source() {
        let config = Config {
            pipelines: vec![PipelineConfig {
                id: "p1".into(),
                provider: "iflow".into(),
                ..PipelineConfig::default()
            }],
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn config_source_display() {
        assert_eq!(format!("{}", ConfigSource::Cli), "CLI flag");
        assert_eq!(format!("{}", ConfigSource::Env), "environment variable");
        assert_eq!(format!("{}", ConfigSource::ConfigFile), "config file");
        assert_eq!(format!("{}", ConfigSource::Default), "default");
    }

    #[test]
    fn resolve_uses_file_values() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        clear_env();
        let file = write_config(SAMPLE);

        let cli = make_test_cli(Some(file.path().to_path_buf()));
        let resolved = ResolvedConfig::resolve(&cli, None).unwrap();

        assert_eq!(resolved.sources.config_path, ConfigSource::Cli);
        assert_eq!(resolved.log_level, LogLevel::Debug);
        assert_eq!(resolved.sources.log_level, ConfigSource::ConfigFile);
        assert_eq!(resolved.config.selfcheck.validation_timeout_secs, 20);
        assert_eq!(resolved.sources.validation_timeout, ConfigSource::ConfigFile);
    }

    #[test]
    fn env_overrides_file_and_cli_overrides_env() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        clear_env();
        let file = write_config(SAMPLE);
        set_env(ENV_VALIDATION_TIMEOUT, "45");
        set_env(ENV_NOTIFY_THRESHOLD, "7");
        set_env(ENV_CREDENTIAL_INTERVAL, "90");

        let cli = make_test_cli(Some(file.path().to_path_buf()));
        let resolved = ResolvedConfig::resolve(&cli, None).unwrap();
        assert_eq!(resolved.config.selfcheck.validation_timeout_secs, 45);
        assert_eq!(resolved.sources.validation_timeout, ConfigSource::Env);
        assert_eq!(resolved.config.oauth.notification_threshold, 7);
        assert_eq!(resolved.config.selfcheck.credential_interval_secs, 90);

        let run = RunArgs {
            timeout: Some(5),
            interval: Some(30),
            ..RunArgs::default()
        };
        let resolved = ResolvedConfig::resolve(&cli, Some(&run)).unwrap();
        assert_eq!(resolved.config.selfcheck.validation_timeout_secs, 5);
        assert_eq!(resolved.sources.validation_timeout, ConfigSource::Cli);
        assert_eq!(resolved.config.selfcheck.credential_interval_secs, 30);

        clear_env();
    }

    #[test]
    fn config_env_var_selects_file() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        clear_env();
        let file = write_config("[selfcheck]\nauto_destroy_invalid = true\n");
        set_env(ENV_CONFIG, file.path().to_str().unwrap());

        let resolved = ResolvedConfig::resolve(&make_test_cli(None), None).unwrap();
        assert_eq!(resolved.sources.config_path, ConfigSource::Env);
        assert!(resolved.config.selfcheck.auto_destroy_invalid);

        set_env(ENV_AUTO_DESTROY, "no");
        let resolved = ResolvedConfig::resolve(&make_test_cli(None), None).unwrap();
        assert!(!resolved.config.selfcheck.auto_destroy_invalid);
        assert_eq!(resolved.sources.auto_destroy_invalid, ConfigSource::Env);

        clear_env();
    }

    #[test]
    fn invalid_env_values_are_rejected() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        clear_env();
        set_env(ENV_CONFIG, "/nonexistent/credguard.toml");
        set_env(ENV_VALIDATION_TIMEOUT, "soon");
        assert!(ResolvedConfig::resolve(&make_test_cli(None), None).is_err());

        set_env(ENV_VALIDATION_TIMEOUT, "0");
        assert!(ResolvedConfig::resolve(&make_test_cli(None), None).is_err());
        clear_env();
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let file = write_config(
            r#"
[general]
future_field = "some_value"

[unknown_section]
foo = "bar"
"#,
        );
        assert!(Config::load_from(file.path()).is_ok());
    }
}
