//! Configuration loading from `APP_`-prefixed environment variables.
//!
//! An optional `.env` file is read first, then every section builds itself
//! with `from_env()`. Every variable has a default; a variable that is set
//! but unparsable is an error, and the process exits rather than run with
//! half-applied configuration.

use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid value for {var}: {value}")]
    InvalidValue { var: String, value: String },
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Full service configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub event_bus: EventBusConfig,
    pub node_api: NodeApiConfig,
    pub prediction: PredictionSettings,
}

impl AppConfig {
    /// Loads `.env` (if present) and then the environment.
    pub fn load() -> Result<Self> {
        let _ = dotenv::dotenv();
        Self::from_env()
    }

    pub fn from_env() -> Result<Self> {
        Ok(Self {
            server: ServerConfig::from_env()?,
            event_bus: EventBusConfig::from_env()?,
            node_api: NodeApiConfig::from_env()?,
            prediction: PredictionSettings::from_env()?,
        })
    }
}

/// Operational HTTP surface.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
}

impl ServerConfig {
    /// Variables: `APP_SERVER_PORT` (default 8081).
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            port: parse_optional_var("APP_SERVER_PORT", 8081)?,
        })
    }
}

/// Event bus connection.
#[derive(Debug, Clone)]
pub struct EventBusConfig {
    pub url: String,
    pub user: Option<String>,
    pub password: Option<String>,
}

impl EventBusConfig {
    /// Variables: `APP_EVENT_BUS_URL` (default `nats://localhost:4222`),
    /// `APP_EVENT_BUS_USER`, `APP_EVENT_BUS_PASSWORD`.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            url: string_var("APP_EVENT_BUS_URL", "nats://localhost:4222"),
            user: optional_var("APP_EVENT_BUS_USER"),
            password: optional_var("APP_EVENT_BUS_PASSWORD"),
        })
    }
}

/// Outbound node lifecycle API.
#[derive(Debug, Clone)]
pub struct NodeApiConfig {
    pub base_url: String,
    pub timeout: Duration,
}

impl NodeApiConfig {
    /// Variables: `APP_NODE_API_BASE_URL` (default `http://localhost:8080`),
    /// `APP_NODE_API_TIMEOUT_SECS` (default 10).
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            base_url: string_var("APP_NODE_API_BASE_URL", "http://localhost:8080"),
            timeout: secs_var("APP_NODE_API_TIMEOUT_SECS", 10)?,
        })
    }
}

/// Prediction policy knobs, as raw values; the binary maps them onto the
/// domain's `PredictionConfig`.
#[derive(Debug, Clone)]
pub struct PredictionSettings {
    pub activity_window: Duration,
    pub activity_threshold: u32,
    pub min_ready_nodes: usize,
    pub max_ready_nodes: usize,
    pub idle_termination_timeout: Duration,
    pub booting_node_timeout: Duration,
    pub scaling_check_interval: Duration,
    pub activity_retention: Duration,
}

impl PredictionSettings {
    /// Variables (defaults in parentheses): `APP_ACTIVITY_WINDOW_SECS` (120),
    /// `APP_ACTIVITY_THRESHOLD` (3), `APP_MIN_READY_NODES` (1),
    /// `APP_MAX_READY_NODES` (5), `APP_IDLE_TERMINATION_TIMEOUT_SECS` (300),
    /// `APP_BOOTING_NODE_TIMEOUT_SECS` (120),
    /// `APP_SCALING_CHECK_INTERVAL_SECS` (10),
    /// `APP_ACTIVITY_RETENTION_SECS` (1800).
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            activity_window: secs_var("APP_ACTIVITY_WINDOW_SECS", 120)?,
            activity_threshold: parse_optional_var("APP_ACTIVITY_THRESHOLD", 3)?,
            min_ready_nodes: parse_optional_var("APP_MIN_READY_NODES", 1)?,
            max_ready_nodes: parse_optional_var("APP_MAX_READY_NODES", 5)?,
            idle_termination_timeout: secs_var("APP_IDLE_TERMINATION_TIMEOUT_SECS", 300)?,
            booting_node_timeout: secs_var("APP_BOOTING_NODE_TIMEOUT_SECS", 120)?,
            scaling_check_interval: secs_var("APP_SCALING_CHECK_INTERVAL_SECS", 10)?,
            activity_retention: secs_var("APP_ACTIVITY_RETENTION_SECS", 1800)?,
        })
    }
}

fn string_var(var: &str, default: &str) -> String {
    std::env::var(var).unwrap_or_else(|_| default.to_string())
}

fn optional_var(var: &str) -> Option<String> {
    std::env::var(var).ok().filter(|v| !v.is_empty())
}

fn parse_optional_var<T: FromStr>(var: &str, default: T) -> Result<T> {
    match std::env::var(var) {
        Ok(value) => value.parse().map_err(|_| ConfigError::InvalidValue {
            var: var.to_string(),
            value,
        }),
        Err(_) => Ok(default),
    }
}

fn secs_var(var: &str, default_secs: u64) -> Result<Duration> {
    Ok(Duration::from_secs(parse_optional_var(var, default_secs)?))
}
