use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing environment variable: {0}")]
    MissingEnv(String),

    #[error("invalid value for {name}: {reason}")]
    Invalid { name: String, reason: String },
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Base URL of the game backend API, e.g. `https://example.org/api`.
    pub backend_url: String,
    /// Sent as `X-Player-Token` on every backend request.
    pub player_token: String,
    /// Bearer token guarding the local API.
    pub auth_token: String,
    pub listen_addr: String,
    pub request_timeout: Duration,
    /// Fixes with a worse accuracy radius (meters) are ignored when set.
    pub max_accuracy_m: Option<f64>,
    /// Replay this NDJSON track instead of waiting for pushed fixes.
    pub track_file: Option<PathBuf>,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let backend_url = required_env("GRIDWALK_BACKEND_URL")?;
        if !(backend_url.starts_with("http://") || backend_url.starts_with("https://")) {
            return Err(ConfigError::Invalid {
                name: "GRIDWALK_BACKEND_URL".into(),
                reason: format!("{backend_url}: expected an http(s) URL"),
            });
        }
        let backend_url = backend_url.trim_end_matches('/').to_string();

        let player_token = required_env("GRIDWALK_PLAYER_TOKEN")?;
        let auth_token = required_env("GRIDWALK_AUTH_TOKEN")?;

        let listen_addr =
            std::env::var("GRIDWALK_LISTEN_ADDR").unwrap_or_else(|_| "127.0.0.1:8091".into());

        let request_timeout_s: u64 = optional_parsed("GRIDWALK_REQUEST_TIMEOUT_S")?.unwrap_or(15);
        if request_timeout_s == 0 {
            return Err(ConfigError::Invalid {
                name: "GRIDWALK_REQUEST_TIMEOUT_S".into(),
                reason: "must be at least 1".into(),
            });
        }

        let max_accuracy_m: Option<f64> = optional_parsed("GRIDWALK_MAX_ACCURACY_M")?;
        if let Some(m) = max_accuracy_m
            && !(m.is_finite() && m > 0.0)
        {
            return Err(ConfigError::Invalid {
                name: "GRIDWALK_MAX_ACCURACY_M".into(),
                reason: format!("{m}: must be a positive number"),
            });
        }

        let track_file = std::env::var("GRIDWALK_TRACK_FILE").ok().map(PathBuf::from);

        Ok(Config {
            backend_url,
            player_token,
            auth_token,
            listen_addr,
            request_timeout: Duration::from_secs(request_timeout_s),
            max_accuracy_m,
            track_file,
        })
    }
}

fn required_env(name: &str) -> Result<String, ConfigError> {
    std::env::var(name).map_err(|_| ConfigError::MissingEnv(name.into()))
}

fn optional_parsed<T>(name: &str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => parse_value(name, &raw).map(Some),
        Err(_) => Ok(None),
    }
}

fn parse_value<T>(name: &str, raw: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim().parse::<T>().map_err(|e| ConfigError::Invalid {
        name: name.into(),
        reason: format!("{raw}: {e}"),
    })
}
