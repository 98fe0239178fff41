use anyhow::{anyhow, Context, Result};
use std::env;
use std::time::Duration;

const REQUIRED_VARS: [&str; 4] = [
    "FLUME_CLIENT_ID",
    "FLUME_CLIENT_SECRET",
    "FLUME_USERNAME",
    "FLUME_PASSWORD",
];

const DEFAULT_API_BASE: &str = "https://api.flumewater.com";

#[derive(Debug, Clone)]
pub struct Config {
    pub client_id: String,
    pub client_secret: String,
    pub username: String,
    pub password: String,

    pub port: u16,
    pub api_base: String,
    pub poll_interval: Duration,
    pub device_cache_ttl: Duration,
    pub request_timeout: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let missing = missing_required(|key| env::var(key).ok());
        if !missing.is_empty() {
            return Err(anyhow!(
                "missing required environment variables: {}",
                missing.join(", ")
            ));
        }

        let port = env_u16("EXPORTER_PORT", Some(8001))?;
        let api_base = env_string("FLUME_API_BASE", Some(DEFAULT_API_BASE.to_string()))?
            .trim_end_matches('/')
            .to_string();
        let poll_interval = Duration::from_secs(env_u64("FLUME_POLL_INTERVAL_SECONDS", Some(60))?);
        let device_cache_ttl =
            Duration::from_secs(env_u64("FLUME_DEVICE_CACHE_TTL_SECONDS", Some(3600))?);
        let request_timeout =
            Duration::from_secs(env_u64("FLUME_REQUEST_TIMEOUT_SECONDS", Some(10))?);

        Ok(Self {
            client_id: env_string("FLUME_CLIENT_ID", None)?,
            client_secret: env_string("FLUME_CLIENT_SECRET", None)?,
            username: env_string("FLUME_USERNAME", None)?,
            password: env_string("FLUME_PASSWORD", None)?,
            port,
            api_base,
            poll_interval,
            device_cache_ttl,
            request_timeout,
        })
    }
}

/// Names of required variables the given lookup cannot resolve, in declaration
/// order. All missing names are reported together so one startup failure lists
/// everything the operator still has to set.
pub fn missing_required(lookup: impl Fn(&str) -> Option<String>) -> Vec<&'static str> {
    REQUIRED_VARS
        .iter()
        .copied()
        .filter(|key| {
            lookup(key)
                .map(|value| value.trim().is_empty())
                .unwrap_or(true)
        })
        .collect()
}

fn env_string(key: &str, default: Option<String>) -> Result<String> {
    match env::var(key) {
        Ok(value) => Ok(value.trim().to_string()),
        Err(_) => default.ok_or_else(|| anyhow!("missing env var {key}")),
    }
}

fn env_u16(key: &str, default: Option<u16>) -> Result<u16> {
    match env::var(key) {
        Ok(value) => value
            .trim()
            .parse::<u16>()
            .with_context(|| format!("invalid {key}")),
        Err(_) => default.ok_or_else(|| anyhow!("missing env var {key}")),
    }
}

fn env_u64(key: &str, default: Option<u64>) -> Result<u64> {
    match env::var(key) {
        Ok(value) => value
            .trim()
            .parse::<u64>()
            .with_context(|| format!("invalid {key}")),
        Err(_) => default.ok_or_else(|| anyhow!("missing env var {key}")),
    }
}
