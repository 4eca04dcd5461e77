//! Configuration for the control link.
//!
//! The deployment environment picks one of three fixed service hosts; an
//! explicit base URL overrides it for tests and embedders. Everything is
//! loaded from the process environment once at startup.

use crate::realtime::ReconnectPolicy;
use reqwest::Url;
use std::str::FromStr;
use std::time::Duration;

/// Ceiling for a single control request.
pub const CONTROL_TIMEOUT: Duration = Duration::from_secs(10);

/// Delay between channel reconnect attempts unless overridden.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_millis(3000);

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidVar(String, String),
    #[error("Invalid base URL {0}: {1}")]
    InvalidBaseUrl(String, String),
}

/// The three deployments the control service runs in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Environment {
    Production,
    Staging,
    Development,
}

impl Environment {
    pub fn base_url(&self) -> &'static str {
        match self {
            Environment::Production => "https://users.iviet.com",
            Environment::Staging => "https://users-staging.jenkins-x-viettel.iviet.com",
            Environment::Development => "https://users-dev.jenkins-x-viettel.iviet.com",
        }
    }
}

impl FromStr for Environment {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "production" => Ok(Environment::Production),
            "staging" => Ok(Environment::Staging),
            "development" => Ok(Environment::Development),
            _ => Err(()),
        }
    }
}

/// Holds everything the client needs to reach one deployment.
#[derive(Clone, Debug)]
pub struct Config {
    pub base_url: Url,
    pub control_timeout: Duration,
    pub reconnect: ReconnectPolicy,
}

impl Config {
    /// Loads configuration from environment variables.
    ///
    /// * `MAIKA_ENV`: `production`, `staging` or `development` (the default).
    /// * `MAIKA_BASE_URL`: overrides the environment's host outright.
    /// * `MAIKA_RECONNECT_MS`: channel reconnect delay; `0` disables
    ///   reconnection.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        let environment = match std::env::var("MAIKA_ENV") {
            Ok(name) => name.parse::<Environment>().map_err(|_| {
                ConfigError::InvalidVar(
                    "MAIKA_ENV".to_string(),
                    format!("'{}' is not a recognized environment", name),
                )
            })?,
            Err(_) => Environment::Development,
        };

        let raw_base = std::env::var("MAIKA_BASE_URL")
            .unwrap_or_else(|_| environment.base_url().to_string());
        let base_url = Url::parse(&raw_base)
            .map_err(|e| ConfigError::InvalidVar("MAIKA_BASE_URL".to_string(), e.to_string()))?;

        let reconnect = match std::env::var("MAIKA_RECONNECT_MS") {
            Ok(raw) => {
                let ms = raw.parse::<u64>().map_err(|_| {
                    ConfigError::InvalidVar(
                        "MAIKA_RECONNECT_MS".to_string(),
                        format!("'{}' is not a duration in milliseconds", raw),
                    )
                })?;
                if ms == 0 {
                    ReconnectPolicy::Never
                } else {
                    ReconnectPolicy::FixedDelay(Duration::from_millis(ms))
                }
            }
            Err(_) => ReconnectPolicy::FixedDelay(DEFAULT_RECONNECT_DELAY),
        };

        Ok(Self {
            base_url,
            control_timeout: CONTROL_TIMEOUT,
            reconnect,
        })
    }

    /// Builds a config pointed at an explicit base URL, for embedders and
    /// tests that stand in for the control service.
    pub fn for_base_url(base_url: &str) -> Result<Self, ConfigError> {
        let parsed = Url::parse(base_url)
            .map_err(|e| ConfigError::InvalidBaseUrl(base_url.to_string(), e.to_string()))?;
        Ok(Self {
            base_url: parsed,
            control_timeout: CONTROL_TIMEOUT,
            reconnect: ReconnectPolicy::FixedDelay(DEFAULT_RECONNECT_DELAY),
        })
    }

    /// The realtime event endpoint: same host, websocket scheme.
    pub fn channel_url(&self) -> Url {
        let mut url = self.base_url.clone();
        let scheme = match url.scheme() {
            "https" => "wss",
            _ => "ws",
        };
        // http(s) -> ws(s) stays within the same scheme class, so this cannot
        // fail for any base URL `from_env`/`for_base_url` accepts.
        let _ = url.set_scheme(scheme);
        url.set_path("/v1/user-device/events");
        url
    }
}
