//! Typed application configuration.
//!
//! [`AppConfig::from_cli`] validates the raw [`Cli`] strings.  Any malformed
//! value is a [`ConfigError`], which is fatal at startup.

use std::net::IpAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use lodestore_broker::BrokerOptions;
use lodestore_broker::kv::validate_bucket;
use lodestore_store::{BucketSettings, WritePolicy};
use lodestore_web::WebConfig;

use crate::cli::Cli;

/// A setting could not be turned into a usable value.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid duration for {field}: {value:?} ({reason})")]
    Duration {
        field: &'static str,
        value: String,
        reason: String,
    },

    #[error("invalid address for {field}: {value:?}")]
    Address { field: &'static str, value: String },

    #[error("invalid port for {field}: {value:?}")]
    Port { field: &'static str, value: String },

    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// How log lines are rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

/// Settings of one adapter's bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketSection {
    pub bucket: BucketSettings,
    pub prefix: String,
    pub policy: WritePolicy,
}

/// Fully validated configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub http: WebConfig,
    pub broker: BrokerOptions,
    pub sessions: BucketSection,
    pub cache: BucketSection,
    pub cache_repopulate: bool,
    pub database_path: PathBuf,
    pub shutdown_timeout: Duration,
    pub log_format: LogFormat,
}

impl AppConfig {
    pub fn from_cli(cli: &Cli) -> Result<Self, ConfigError> {
        let http = WebConfig {
            bind_addr: parse_addr("http-address", &cli.http_address)?,
            port: parse_port("http-port", &cli.http_port)?,
            ..WebConfig::default()
        };

        let broker = BrokerOptions {
            host: parse_addr("broker-address", &cli.broker_address)?,
            port: parse_port("broker-port", &cli.broker_port)?,
            storage_dir: non_empty_path("broker-store-dir", &cli.broker_store_dir)?,
            ready_timeout: duration("broker-ready-timeout", &cli.broker_ready_timeout)?,
            ..BrokerOptions::default()
        };

        let sessions = BucketSection {
            bucket: BucketSettings::new(
                bucket_name("sessions-bucket-name", &cli.sessions_bucket_name)?,
                duration("sessions-ttl", &cli.sessions_ttl)?,
            )
            .with_compression(parse_bool(
                "sessions-compression",
                &cli.sessions_compression,
            )?),
            prefix: cli.sessions_prefix.clone(),
            policy: policy("sessions-policy", &cli.sessions_policy)?,
        };

        let cache = BucketSection {
            bucket: BucketSettings::new(
                bucket_name("cache-bucket-name", &cli.cache_bucket_name)?,
                duration("cache-ttl", &cli.cache_ttl)?,
            )
            .with_compression(parse_bool("cache-compression", &cli.cache_compression)?),
            prefix: cli.cache_prefix.clone(),
            policy: policy("cache-policy", &cli.cache_policy)?,
        };

        check_shared_bucket(&sessions, &cache)?;

        Ok(Self {
            http,
            broker,
            sessions,
            cache,
            cache_repopulate: parse_bool("cache-repopulate", &cli.cache_repopulate)?,
            database_path: non_empty_path("database-path", &cli.database_path)?,
            shutdown_timeout: duration("shutdown-timeout", &cli.shutdown_timeout)?,
            log_format: log_format(&cli.log_format)?,
        })
    }
}

/// Sessions and cache may share a bucket only with distinct prefixes and
/// identical TTL and compression.
fn check_shared_bucket(
    sessions: &BucketSection,
    cache: &BucketSection,
) -> Result<(), ConfigError> {
    if sessions.bucket.name != cache.bucket.name {
        return Ok(());
    }
    if sessions.prefix == cache.prefix {
        return Err(ConfigError::Invalid {
            field: "cache-prefix",
            reason: "sessions and cache share a bucket and key prefix".into(),
        });
    }
    if sessions.bucket.ttl != cache.bucket.ttl {
        return Err(ConfigError::Invalid {
            field: "cache-ttl",
            reason: "sessions and cache share a bucket but their TTLs differ".into(),
        });
    }
    if sessions.bucket.compression != cache.bucket.compression {
        return Err(ConfigError::Invalid {
            field: "cache-compression",
            reason: "sessions and cache share a bucket but their compression differs".into(),
        });
    }
    Ok(())
}

// ── field parsers ────────────────────────────────────────────────────

fn parse_addr(field: &'static str, value: &str) -> Result<IpAddr, ConfigError> {
    IpAddr::from_str(value.trim()).map_err(|_| ConfigError::Address {
        field,
        value: value.to_owned(),
    })
}

fn parse_port(field: &'static str, value: &str) -> Result<u16, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Port {
        field,
        value: value.to_owned(),
    })
}

fn non_empty_path(field: &'static str, value: &str) -> Result<PathBuf, ConfigError> {
    if value.trim().is_empty() {
        return Err(ConfigError::Invalid {
            field,
            reason: "path is empty".into(),
        });
    }
    Ok(PathBuf::from(value))
}

fn bucket_name(field: &'static str, value: &str) -> Result<String, ConfigError> {
    validate_bucket(value).map_err(|e| ConfigError::Invalid {
        field,
        reason: e.to_string(),
    })?;
    Ok(value.to_owned())
}

fn policy(field: &'static str, value: &str) -> Result<WritePolicy, ConfigError> {
    value
        .parse()
        .map_err(|reason| ConfigError::Invalid { field, reason })
}

fn parse_bool(field: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        other => Err(ConfigError::Invalid {
            field,
            reason: format!("expected a boolean, got {other:?}"),
        }),
    }
}

fn log_format(value: &str) -> Result<LogFormat, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "compact" | "text" => Ok(LogFormat::Compact),
        "json" => Ok(LogFormat::Json),
        other => Err(ConfigError::Invalid {
            field: "log-format",
            reason: format!("expected \"compact\" or \"json\", got {other:?}"),
        }),
    }
}

fn duration(field: &'static str, value: &str) -> Result<Duration, ConfigError> {
    parse_duration(value).map_err(|reason| ConfigError::Duration {
        field,
        value: value.to_owned(),
        reason,
    })
}

// ── durations ────────────────────────────────────────────────────────

/// Parse a duration such as `300ms`, `1.5h` or `2h45m`.
///
/// Units: `ns`, `us` (or `µs`), `ms`, `s`, `m`, `h`.  A bare `0` is
/// accepted; any other number needs a unit.  Negative durations are
/// rejected.
pub fn parse_duration(input: &str) -> Result<Duration, String> {
    let s = input.trim();
    let s = s.strip_prefix('+').unwrap_or(s);
    if s.is_empty() {
        return Err("empty duration".into());
    }
    if s.starts_with('-') {
        return Err("negative durations are not allowed".into());
    }
    if s == "0" {
        return Ok(Duration::ZERO);
    }

    let mut total_ns: f64 = 0.0;
    let mut rest = s;
    while !rest.is_empty() {
        let number_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        if number_len == 0 {
            return Err(format!("expected a number at {rest:?}"));
        }
        let (number, after) = rest.split_at(number_len);
        let value: f64 = number
            .parse()
            .map_err(|_| format!("bad number {number:?}"))?;

        let unit_len = after
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(after.len());
        let (unit, next) = after.split_at(unit_len);
        let scale = match unit {
            "ns" => 1.0,
            "us" | "µs" | "μs" => 1e3,
            "ms" => 1e6,
            "s" => 1e9,
            "m" => 60.0 * 1e9,
            "h" => 3600.0 * 1e9,
            "" => return Err(format!("missing unit after {number:?}")),
            other => return Err(format!("unknown unit {other:?}")),
        };
        total_ns += value * scale;
        rest = next;
    }

    if !total_ns.is_finite() || total_ns > u64::MAX as f64 {
        return Err("duration out of range".into());
    }
    Ok(Duration::from_nanos(total_ns.round() as u64))
}
