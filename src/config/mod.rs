//! Typed configuration from environment variables.
//!
//! Loads once at startup, fails fast if required vars are missing or
//! malformed. Sensitive values wrapped in secrecy::SecretString to prevent
//! log leaks.

pub mod secrets;

use crate::error::{Error, Result};
use crate::queue::ReceiveOptions;
use secrecy::SecretString;

pub const DEFAULT_QUEUE_NAME: &str = "request_events";
pub const DEFAULT_ADMIN_TOKEN: &str = "dev-admin-token";
pub const DEFAULT_PUBLIC_BASE_URL: &str = "http://localhost:8080";
pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8080";

#[derive(Debug)]
pub struct Config {
    /// Postgres backing both the request store and the pgmq queue.
    pub database_url: SecretString,
    pub queue_name: String,
    pub admin_token: SecretString,
    /// Base of tracking URLs, without a trailing slash.
    pub public_base_url: String,
    pub listen_addr: String,
    pub receive: ReceiveOptions,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Outside production, call [`load_dotenv`] before this.
    pub fn from_env() -> Result<Self> {
        let defaults = ReceiveOptions::default();
        Ok(Self {
            database_url: SecretString::from(required_var("DATABASE_URL")?),
            queue_name: optional_var("QUEUE_NAME").unwrap_or_else(|| DEFAULT_QUEUE_NAME.to_string()),
            admin_token: SecretString::from(
                optional_var("ADMIN_TOKEN").unwrap_or_else(|| DEFAULT_ADMIN_TOKEN.to_string()),
            ),
            public_base_url: normalize_base_url(
                &optional_var("APP_PUBLIC_BASE_URL")
                    .unwrap_or_else(|| DEFAULT_PUBLIC_BASE_URL.to_string()),
            ),
            listen_addr: optional_var("LISTEN_ADDR")
                .unwrap_or_else(|| DEFAULT_LISTEN_ADDR.to_string()),
            receive: ReceiveOptions {
                max_messages: int_var("WORKER_BATCH_SIZE", defaults.max_messages, 1)?,
                wait_seconds: int_var("WORKER_WAIT_SECONDS", defaults.wait_seconds, 0)?,
                visibility_timeout: int_var(
                    "WORKER_VISIBILITY_TIMEOUT",
                    defaults.visibility_timeout,
                    0,
                )?,
            },
            otel_endpoint: optional_var("OTEL_ENDPOINT"),
            log_level: optional_var("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
        })
    }
}

/// Load `.env` unless `APP_ENV=production`.
pub fn load_dotenv() {
    if std::env::var("APP_ENV").as_deref() != Ok("production") {
        dotenvy::dotenv().ok();
    }
}

/// Strip trailing slashes so tracking URLs join cleanly.
pub fn normalize_base_url(base: &str) -> String {
    base.trim_end_matches('/').to_string()
}

fn required_var(name: &str) -> Result<String> {
    optional_var(name)
        .ok_or_else(|| Error::Config(format!("required environment variable {name} is not set")))
}

/// Unset and empty are treated alike.
fn optional_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

/// An integer no smaller than `min`, or `default` when unset.
fn int_var(name: &str, default: i32, min: i32) -> Result<i32> {
    let Some(raw) = optional_var(name) else {
        return Ok(default);
    };
    match raw.trim().parse::<i32>() {
        Ok(n) if n >= min => Ok(n),
        _ => Err(Error::Config(format!(
            "{name} must be an integer >= {min}, got {raw:?}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_loses_trailing_slashes() {
        assert_eq!(
            normalize_base_url("https://track.example.com//"),
            "https://track.example.com"
        );
        assert_eq!(normalize_base_url(DEFAULT_PUBLIC_BASE_URL), DEFAULT_PUBLIC_BASE_URL);
    }
}
