//! services/gateway/src/config.rs
//!
//! Defines the gateway's configuration structure and loading logic.
//!
//! All configuration is loaded from environment variables at startup. The `.env`
//! file is used for local development.

use std::path::PathBuf;
use std::time::Duration;
use tracing::Level;

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for the environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub api_base_url: String,
    pub log_level: Level,
    pub request_timeout: Duration,
    pub state_dir: PathBuf,
    /// Idle time after which the session-scoped store is discarded.
    pub session_idle_timeout: Duration,
    pub eula_lang: String,
    pub max_file_size_guest_mb: f64,
    pub max_file_size_user_mb: f64,
    pub max_total_upload_mb: f64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:8000".to_string(),
            log_level: Level::INFO,
            request_timeout: Duration::from_secs(30),
            state_dir: PathBuf::from("./.gateway"),
            session_idle_timeout: Duration::from_secs(60 * 60),
            eula_lang: "en".to_string(),
            max_file_size_guest_mb: 5.0,
            max_file_size_user_mb: 7.0,
            max_total_upload_mb: 50.0,
        }
    }
}

impl Config {
    /// Loads configuration from environment variables.
    ///
    /// It will look for a `.env` file in the current directory for development,
    /// but this is skipped in test environments to ensure tests are hermetic.
    pub fn from_env() -> Result<Self, ConfigError> {
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds the configuration from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        // --- Backend ---
        let api_base_url = lookup("API_BASE_URL")
            .map(|url| url.trim_end_matches('/').to_string())
            .unwrap_or(defaults.api_base_url);
        if !(api_base_url.starts_with("http://") || api_base_url.starts_with("https://")) {
            return Err(ConfigError::InvalidValue(
                "API_BASE_URL".to_string(),
                format!("'{}' is not an http(s) URL", api_base_url),
            ));
        }

        let log_level_str = lookup("RUST_LOG").unwrap_or_else(|| "INFO".to_string());
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        let request_timeout = match lookup("REQUEST_TIMEOUT_SECS") {
            Some(raw) => {
                let secs = raw.parse::<u64>().map_err(|e| {
                    ConfigError::InvalidValue("REQUEST_TIMEOUT_SECS".to_string(), e.to_string())
                })?;
                if secs == 0 {
                    return Err(ConfigError::InvalidValue(
                        "REQUEST_TIMEOUT_SECS".to_string(),
                        "must be at least 1".to_string(),
                    ));
                }
                Duration::from_secs(secs)
            }
            None => defaults.request_timeout,
        };

        // --- Local state ---
        let state_dir = lookup("GATEWAY_STATE_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.state_dir);
        let session_idle_timeout = match lookup("SESSION_IDLE_MINUTES") {
            Some(raw) => {
                let minutes = raw.parse::<u64>().map_err(|e| {
                    ConfigError::InvalidValue("SESSION_IDLE_MINUTES".to_string(), e.to_string())
                })?;
                if minutes == 0 {
                    return Err(ConfigError::InvalidValue(
                        "SESSION_IDLE_MINUTES".to_string(),
                        "must be at least 1".to_string(),
                    ));
                }
                Duration::from_secs(minutes * 60)
            }
            None => defaults.session_idle_timeout,
        };
        let eula_lang = lookup("EULA_LANG").unwrap_or(defaults.eula_lang);

        // --- Upload limits ---
        let max_file_size_guest_mb = parse_megabytes(
            &lookup,
            "MAX_FILE_SIZE_GUEST_MB",
            defaults.max_file_size_guest_mb,
        )?;
        let max_file_size_user_mb = parse_megabytes(
            &lookup,
            "MAX_FILE_SIZE_USER_MB",
            defaults.max_file_size_user_mb,
        )?;
        let max_total_upload_mb =
            parse_megabytes(&lookup, "MAX_TOTAL_UPLOAD_MB", defaults.max_total_upload_mb)?;

        Ok(Self {
            api_base_url,
            log_level,
            request_timeout,
            state_dir,
            session_idle_timeout,
            eula_lang,
            max_file_size_guest_mb,
            max_file_size_user_mb,
            max_total_upload_mb,
        })
    }
}

fn parse_megabytes<F>(lookup: &F, name: &str, default: f64) -> Result<f64, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        Some(raw) => {
            let value = raw
                .parse::<f64>()
                .map_err(|e| ConfigError::InvalidValue(name.to_string(), e.to_string()))?;
            if !value.is_finite() || value <= 0.0 {
                return Err(ConfigError::InvalidValue(
                    name.to_string(),
                    format!("'{}' must be a positive number", raw),
                ));
            }
            Ok(value)
        }
        None => Ok(default),
    }
}
