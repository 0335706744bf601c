use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};

/// Placeholder JWT secrets that MUST NOT be used.
const PLACEHOLDER_SECRETS: &[&str] = &[
    "change-me",
    "change-me-to-a-random-string",
    "dev-secret-change-me",
    "secret",
];

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub db_path: PathBuf,
    pub jwt_secret: String,
    pub ping_interval: Duration,
    pub ping_timeout: Duration,
    pub server_push: bool,
    pub cors_origin: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Unset keys fall back to defaults; set but
    /// unparsable keys are an error.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        let jwt_secret = lookup("HUDDLE_JWT_SECRET").unwrap_or_default();
        if jwt_secret.trim().is_empty() || PLACEHOLDER_SECRETS.contains(&jwt_secret.as_str()) {
            bail!("HUDDLE_JWT_SECRET is unset or still a placeholder; it must match the auth service's secret");
        }

        let port: u16 = get("HUDDLE_PORT", "7000")
            .parse()
            .context("HUDDLE_PORT is not a valid port")?;

        let ping_interval = secs(&get("HUDDLE_PING_INTERVAL_SECS", "30"), "HUDDLE_PING_INTERVAL_SECS")?;
        let ping_timeout = secs(&get("HUDDLE_PING_TIMEOUT_SECS", "60"), "HUDDLE_PING_TIMEOUT_SECS")?;
        if ping_interval.is_zero() {
            bail!("HUDDLE_PING_INTERVAL_SECS must be greater than zero");
        }
        if ping_timeout < ping_interval {
            bail!("HUDDLE_PING_TIMEOUT_SECS must not be shorter than the ping interval");
        }

        let server_push = match get("HUDDLE_SERVER_PUSH", "false").to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" | "" => false,
            other => bail!("HUDDLE_SERVER_PUSH must be a boolean, got '{}'", other),
        };

        Ok(Self {
            host: get("HUDDLE_HOST", "0.0.0.0"),
            port,
            db_path: get("HUDDLE_DB_PATH", "huddle.db").into(),
            jwt_secret,
            ping_interval,
            ping_timeout,
            server_push,
            cors_origin: get("HUDDLE_CORS_ORIGIN", "http://localhost:3000"),
        })
    }
}

fn secs(raw: &str, key: &str) -> Result<Duration> {
    let n: u64 = raw
        .trim()
        .parse()
        .with_context(|| format!("{} must be a whole number of seconds", key))?;
    Ok(Duration::from_secs(n))
}
