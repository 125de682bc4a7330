use anyhow::{bail, Context, Result};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

const DEVICES_BIND_DEFAULT: &str = ":1883";
const CONTROL_BIND_DEFAULT: &str = ":1884";
const LIBERATOR_BASE_URL_DEFAULT: &str = "https://api.superscale.io";
const IDLE_CONNECTION_TIMEOUT_DEFAULT: &str = "30s";
const OUI_DB_PATH_DEFAULT: &str = "oui.txt";

/// Runtime configuration, sourced from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Release stage reported to the crash reporter (`ENV`, default `prod`).
    pub environment: String,
    /// Device-facing listen address (`DEVICES_BIND`, default `:1883`).
    pub devices_bind: String,
    /// Control-facing listen address (`CONTROL_BIND`, default `:1884`).
    pub control_bind: String,
    /// Idle deadline applied to every socket operation
    /// (`IDLE_CONNECTION_TIMEOUT`, default `30s`).
    pub idle_connection_timeout: Duration,
    /// Device-metadata service base URL (`LIBERATOR_BASE_URL`).
    pub liberator_base_url: String,
    /// Bearer token for the metadata service (`LIBERATOR_JWT_TOKEN`, required).
    pub liberator_jwt_token: String,
    /// Crash reporting is enabled when set (`BUGSNAG_KEY`).
    pub bugsnag_key: Option<String>,
    /// Audit table name (`SENTRY_DYNAMODB_TABLE`, required).
    pub sentry_dynamodb_table: String,
    /// HTTP endpoint that accepts audit rows (`AUDIT_SINK_URL`). When unset,
    /// rows are logged instead of shipped.
    pub audit_sink_url: Option<String>,
    /// Normalize topics to a leading slash on subscribe and publish
    /// (`SLASH_PREFIX_TOPICS`, default true).
    pub slash_prefix_topics: bool,
    /// MAC-prefix to vendor database for the stations handler
    /// (`OUI_DB_PATH`, default `oui.txt`).
    pub oui_db_path: PathBuf,
    /// Tracing filter directive (`LOG_LEVEL`, default `info`).
    pub log_level: Option<String>,
}

impl Config {
    /// Read configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        let idle = env_or("IDLE_CONNECTION_TIMEOUT", IDLE_CONNECTION_TIMEOUT_DEFAULT);
        Ok(Self {
            environment: env_or("ENV", "prod"),
            devices_bind: env_or("DEVICES_BIND", DEVICES_BIND_DEFAULT),
            control_bind: env_or("CONTROL_BIND", CONTROL_BIND_DEFAULT),
            idle_connection_timeout: parse_duration(&idle)
                .context("invalid IDLE_CONNECTION_TIMEOUT")?,
            liberator_base_url: env_or("LIBERATOR_BASE_URL", LIBERATOR_BASE_URL_DEFAULT),
            liberator_jwt_token: require_env("LIBERATOR_JWT_TOKEN")?,
            bugsnag_key: env_opt("BUGSNAG_KEY"),
            sentry_dynamodb_table: require_env("SENTRY_DYNAMODB_TABLE")?,
            audit_sink_url: env_opt("AUDIT_SINK_URL"),
            slash_prefix_topics: parse_bool(&env_or("SLASH_PREFIX_TOPICS", "true"))
                .context("invalid SLASH_PREFIX_TOPICS")?,
            oui_db_path: PathBuf::from(env_or("OUI_DB_PATH", OUI_DB_PATH_DEFAULT)),
            log_level: env_opt("LOG_LEVEL"),
        })
    }

    /// Schema-level invariants checked before startup.
    pub fn validate(&self) -> Result<()> {
        if self.devices_bind.is_empty() {
            bail!("DEVICES_BIND must be non-empty");
        }
        if self.control_bind.is_empty() {
            bail!("CONTROL_BIND must be non-empty");
        }
        if self.devices_bind == self.control_bind {
            bail!("DEVICES_BIND must differ from CONTROL_BIND");
        }
        if self.idle_connection_timeout.is_zero() {
            bail!("IDLE_CONNECTION_TIMEOUT must be > 0");
        }
        Ok(())
    }
}

fn env_or(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_opt(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.is_empty())
}

fn require_env(name: &str) -> Result<String> {
    match env::var(name) {
        Ok(v) if !v.is_empty() => Ok(v),
        _ => bail!("required environment variable {} is not set", name),
    }
}

fn parse_bool(s: &str) -> Result<bool> {
    match s.to_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        other => bail!("expected a boolean, got {}", other),
    }
}

/// Parse `30s` / `500ms` / `5m` / `1h` style durations; bare numbers are seconds.
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        bail!("empty duration");
    }
    let (value, unit) = match s.find(|c: char| !c.is_ascii_digit()) {
        Some(idx) => s.split_at(idx),
        None => (s, "s"),
    };
    let value: u64 = value
        .parse()
        .with_context(|| format!("invalid duration value in {}", s))?;
    match unit {
        "ms" => Ok(Duration::from_millis(value)),
        "s" => Ok(Duration::from_secs(value)),
        "m" => Ok(Duration::from_secs(value * 60)),
        "h" => Ok(Duration::from_secs(value * 3600)),
        other => bail!("unsupported duration unit {}", other),
    }
}
