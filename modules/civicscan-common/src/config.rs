use std::env;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::info;

use crate::types::OverlapPolicy;

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    // Postgres
    pub database_url: String,

    // Message broker (optional; absent means the durable-store fallback)
    pub broker_url: Option<String>,
    pub broker_queue: String,
    pub broker_probe_timeout: Duration,

    // Research collaborator
    pub research_service_url: String,
    pub research_timeout: Duration,

    // Orchestration
    pub schedule_poll_interval: Duration,
    pub overlap_policy: OverlapPolicy,
    pub max_jurisdictions_per_submission: usize,
    pub worker_concurrency: usize,

    // Web server
    pub api_host: String,
    pub api_port: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: String::new(),
            broker_url: None,
            broker_queue: "research".to_string(),
            broker_probe_timeout: Duration::from_secs(3),
            research_service_url: String::new(),
            research_timeout: Duration::from_secs(120),
            schedule_poll_interval: Duration::from_secs(60),
            overlap_policy: OverlapPolicy::Exact,
            max_jurisdictions_per_submission: 60,
            worker_concurrency: 4,
            api_host: "0.0.0.0".to_string(),
            api_port: 3000,
        }
    }
}

impl Config {
    /// Load configuration from environment variables (and `.env` if present).
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        let defaults = Self::default();

        Ok(Self {
            database_url: required_env("DATABASE_URL")?,
            broker_url: optional_env("BROKER_URL"),
            broker_queue: optional_env("BROKER_QUEUE").unwrap_or(defaults.broker_queue),
            broker_probe_timeout: Duration::from_secs(
                parse_env("BROKER_PROBE_TIMEOUT_SECS", 3u64)?.clamp(1, 5),
            ),
            research_service_url: required_env("RESEARCH_SERVICE_URL")?,
            research_timeout: Duration::from_secs(parse_env("RESEARCH_TIMEOUT_SECS", 120u64)?),
            schedule_poll_interval: Duration::from_secs(
                parse_env("SCHEDULE_POLL_SECS", 60u64)?.max(1),
            ),
            overlap_policy: optional_env("CIVICSCAN_OVERLAP_POLICY")
                .map(|raw| raw.parse::<OverlapPolicy>())
                .transpose()
                .map_err(anyhow::Error::msg)
                .context("CIVICSCAN_OVERLAP_POLICY must be `exact` or `intersect`")?
                .unwrap_or_default(),
            max_jurisdictions_per_submission: parse_env("MAX_JURISDICTIONS_PER_SUBMISSION", 60usize)?,
            worker_concurrency: parse_env("WORKER_CONCURRENCY", 4usize)?.max(1),
            api_host: optional_env("API_HOST").unwrap_or(defaults.api_host),
            api_port: parse_env("API_PORT", 3000u16)?,
        })
    }

    /// Log the effective configuration with credentials masked.
    pub fn log_redacted(&self) {
        info!("Config loaded:");
        info!("  DATABASE_URL: {}", redact_url(&self.database_url));
        info!(
            "  BROKER_URL: {}",
            self.broker_url
                .as_deref()
                .map(redact_url)
                .unwrap_or_else(|| "<not set, durable-store queue>".to_string())
        );
        info!("  BROKER_QUEUE: {}", self.broker_queue);
        info!("  BROKER_PROBE_TIMEOUT: {:?}", self.broker_probe_timeout);
        info!("  RESEARCH_SERVICE_URL: {}", redact_url(&self.research_service_url));
        info!("  RESEARCH_TIMEOUT: {:?}", self.research_timeout);
        info!("  SCHEDULE_POLL_INTERVAL: {:?}", self.schedule_poll_interval);
        info!("  OVERLAP_POLICY: {:?}", self.overlap_policy);
        info!("  WORKER_CONCURRENCY: {}", self.worker_concurrency);
    }
}

fn required_env(key: &str) -> Result<String> {
    env::var(key).with_context(|| format!("{key} environment variable is required"))
}

fn optional_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parse_env<T>(key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match optional_env(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("{key} is invalid ({raw:?}): {e}")),
        None => Ok(default),
    }
}

/// Mask the password component of a URL. Unparseable input is shown by length only.
pub fn redact_url(raw: &str) -> String {
    match url::Url::parse(raw) {
        Ok(mut parsed) => {
            if parsed.password().is_some() {
                let _ = parsed.set_password(Some("****"));
            }
            parsed.to_string()
        }
        Err(_) if raw.is_empty() => "<not set>".to_string(),
        Err(_) => format!("<unparseable, {} chars>", raw.len()),
    }
}
