//! CLI argument definitions for Lodestore.
//!
//! Every setting can come from a flag, an `APP_*` environment variable
//! (also read from `.env`), or its default, in that order of precedence.
//! Values stay as raw strings here; [`crate::config`] validates them.

use clap::Parser;

/// Lodestore -- session and cache service on an embedded key-value broker.
#[derive(Debug, Parser)]
#[command(
    name = "lodestore",
    version,
    about = "Lodestore -- session and cache service on an embedded key-value broker",
    long_about = "Starts an embedded durable key-value broker, provisions the session and \
                  cache buckets, and serves the item API over HTTP until interrupted."
)]
pub struct Cli {
    /// Address the HTTP listener binds to.
    #[arg(long, env = "APP_LISTEN_ADDR", default_value = "0.0.0.0")]
    pub http_address: String,

    /// Port the HTTP listener binds to.
    #[arg(long, env = "APP_HTTP_PORT", default_value = "8080")]
    pub http_port: String,

    /// Address the embedded broker listens on.
    #[arg(long, env = "APP_BROKER_ADDR", default_value = "0.0.0.0")]
    pub broker_address: String,

    /// Port the embedded broker listens on.
    #[arg(long, env = "APP_BROKER_PORT", default_value = "4222")]
    pub broker_port: String,

    /// Directory holding the broker's durable store.
    #[arg(long, env = "APP_BROKER_STORAGE_DIR", default_value = "./data")]
    pub broker_store_dir: String,

    /// How long to wait for the broker to accept connections.
    #[arg(long, env = "APP_BROKER_READY_TIMEOUT", default_value = "5s")]
    pub broker_ready_timeout: String,

    /// Bucket holding sessions.
    #[arg(long, env = "APP_SESSION_BUCKET_NAME", default_value = "sessions")]
    pub sessions_bucket_name: String,

    /// Key prefix for session tokens.
    #[arg(long, env = "APP_SESSION_PREFIX", default_value = "scs")]
    pub sessions_prefix: String,

    /// Lifetime of a session from its last commit.
    #[arg(long, env = "APP_SESSION_TTL", default_value = "24h")]
    pub sessions_ttl: String,

    /// Session write policy: `upsert` or `create-only`.
    #[arg(long, env = "APP_SESSION_POLICY", default_value = "upsert")]
    pub sessions_policy: String,

    /// Compress stored session values.
    #[arg(long, env = "APP_SESSION_COMPRESSION", default_value = "true")]
    pub sessions_compression: String,

    /// Bucket caching items.
    #[arg(long, env = "APP_CACHE_BUCKET_NAME", default_value = "cache")]
    pub cache_bucket_name: String,

    /// Key prefix for cached items.
    #[arg(long, env = "APP_CACHE_PREFIX", default_value = "")]
    pub cache_prefix: String,

    /// Lifetime of a cached item from its last write.
    #[arg(long, env = "APP_CACHE_TTL", default_value = "24h")]
    pub cache_ttl: String,

    /// Cache write policy on create: `upsert` or `create-only`.
    #[arg(long, env = "APP_CACHE_POLICY", default_value = "create-only")]
    pub cache_policy: String,

    /// Compress cached item values.
    #[arg(long, env = "APP_CACHE_COMPRESSION", default_value = "true")]
    pub cache_compression: String,

    /// Write items found in the database back into the cache after a miss.
    #[arg(long, env = "APP_CACHE_REPOPULATE", default_value = "false")]
    pub cache_repopulate: String,

    /// SQLite file holding the item records.
    #[arg(long, env = "APP_DATABASE_PATH", default_value = "./data/app.db")]
    pub database_path: String,

    /// Upper bound on the whole shutdown sequence.
    #[arg(long, env = "APP_SHUTDOWN_TIMEOUT", default_value = "30s")]
    pub shutdown_timeout: String,

    /// Log output format: `compact` or `json`.
    #[arg(long, env = "APP_LOG_FORMAT", default_value = "compact")]
    pub log_format: String,
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn flags_override_defaults() {
        let cli = Cli::try_parse_from([
            "lodestore",
            "--http-port",
            "9090",
            "--sessions-prefix",
            "web.",
        ])
        .unwrap();
        assert_eq!(cli.http_port, "9090");
        assert_eq!(cli.sessions_prefix, "web.");
    }
}
