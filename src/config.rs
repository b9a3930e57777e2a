//! Configuration types.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

/// Action types served when `INBOX_POLICY_ACTIONS` is unset.
pub const DEFAULT_ACTION_TYPES: &[&str] =
    &["archive", "label", "mark_read", "create_task", "create_event"];

/// Engine configuration, built from environment variables.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// libSQL database file.
    pub db_path: PathBuf,
    /// HTTP/WebSocket listen port.
    pub port: u16,
    /// Policies below this confidence never produce proposals.
    pub min_confidence: f64,
    /// Upper bound on a single executor dispatch.
    pub executor_timeout: Duration,
    /// Endpoint that performs approved actions. Without it every action fails
    /// with "no handler credentials configured".
    pub webhook_url: Option<String>,
    /// Action types to register executors for.
    pub action_types: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./data/inbox-policy.db"),
            port: 8080,
            min_confidence: 0.5,
            executor_timeout: Duration::from_secs(30),
            webhook_url: None,
            action_types: DEFAULT_ACTION_TYPES.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl EngineConfig {
    /// Build config from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from an arbitrary key lookup. Unset keys take defaults;
    /// set-but-invalid keys are errors.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let db_path = get("INBOX_POLICY_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or(defaults.db_path);

        let port = parse_or("INBOX_POLICY_PORT", get("INBOX_POLICY_PORT"), defaults.port)?;

        let min_confidence = parse_or(
            "INBOX_POLICY_MIN_CONFIDENCE",
            get("INBOX_POLICY_MIN_CONFIDENCE"),
            defaults.min_confidence,
        )?;
        if !(0.0..=1.0).contains(&min_confidence) {
            return Err(ConfigError::InvalidValue {
                key: "INBOX_POLICY_MIN_CONFIDENCE".into(),
                message: format!("{min_confidence} is outside 0..1"),
            });
        }

        let timeout_secs: u64 = parse_or(
            "INBOX_POLICY_EXECUTOR_TIMEOUT_SECS",
            get("INBOX_POLICY_EXECUTOR_TIMEOUT_SECS"),
            defaults.executor_timeout.as_secs(),
        )?;
        if timeout_secs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "INBOX_POLICY_EXECUTOR_TIMEOUT_SECS".into(),
                message: "must be at least 1".into(),
            });
        }

        let webhook_url = get("INBOX_POLICY_WEBHOOK_URL");
        if let Some(url) = &webhook_url
            && !(url.starts_with("http://") || url.starts_with("https://"))
        {
            return Err(ConfigError::InvalidValue {
                key: "INBOX_POLICY_WEBHOOK_URL".into(),
                message: format!("'{url}' is not an http(s) URL"),
            });
        }

        let action_types = match get("INBOX_POLICY_ACTIONS") {
            Some(raw) => raw
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            None => defaults.action_types,
        };

        Ok(Self {
            db_path,
            port,
            min_confidence,
            executor_timeout: Duration::from_secs(timeout_secs),
            webhook_url,
            action_types,
        })
    }
}

fn parse_or<T>(key: &str, raw: Option<String>, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match raw {
        Some(raw) => raw.parse().map_err(|e| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("'{raw}': {e}"),
        }),
        None => Ok(default),
    }
}
