//! Application wiring: startup sequence and teardown plan.

use std::sync::Arc;

use anyhow::{Context, Result};
use futures::FutureExt;
use lodestore_broker::{BrokerHandle, start_embedded};
use lodestore_store::{
    CachedItemStore, Database, KvSessionStore, SqliteItemRepository, ensure_bucket,
};
use lodestore_web::{AppState, HttpHandle, HttpServer};
use tracing::{info, warn};

use crate::config::AppConfig;
use crate::shutdown::ShutdownOrchestrator;

/// Everything started by [`AppContext::start`].
pub struct AppContext {
    pub config: AppConfig,
    pub broker: BrokerHandle,
    pub sessions: Arc<KvSessionStore>,
    pub state: Arc<AppState>,
    pub http: HttpHandle,
}

impl AppContext {
    /// Start the broker, provision buckets, open the database and serve
    /// HTTP.  A failure after the broker is up stops the broker again.
    pub async fn start(config: AppConfig) -> Result<Self> {
        let broker = start_embedded(config.broker.clone())
            .await
            .context("failed to start embedded broker")?;

        match Self::start_services(&config, &broker).await {
            Ok((sessions, state, http)) => {
                let ctx = Self {
                    config,
                    broker,
                    sessions,
                    state,
                    http,
                };
                ctx.state.set_ready(true);
                info!(
                    http = %ctx.http.local_addr(),
                    session_prefix = ctx.sessions.prefix(),
                    "lodestore ready"
                );
                Ok(ctx)
            }
            Err(e) => {
                if let Err(stop) = broker.shutdown(config.shutdown_timeout).await {
                    warn!(error = %stop, "broker teardown after failed startup");
                }
                Err(e)
            }
        }
    }

    async fn start_services(
        config: &AppConfig,
        broker: &BrokerHandle,
    ) -> Result<(Arc<KvSessionStore>, Arc<AppState>, HttpHandle)> {
        let conn = broker.client().as_ref();

        let sessions_kv = ensure_bucket(conn, &config.sessions.bucket)
            .await
            .context("failed to provision session bucket")?;
        let cache_kv = ensure_bucket(conn, &config.cache.bucket)
            .await
            .context("failed to provision cache bucket")?;

        let db = Database::open_and_migrate(config.database_path.clone())
            .await
            .with_context(|| {
                format!(
                    "failed to open database at {}",
                    config.database_path.display()
                )
            })?;
        info!(path = %config.database_path.display(), "database ready");

        let sessions = Arc::new(
            KvSessionStore::new(sessions_kv)
                .with_prefix(config.sessions.prefix.clone())
                .with_policy(config.sessions.policy),
        );
        let items = CachedItemStore::new(Arc::new(SqliteItemRepository::new(db)), cache_kv)
            .with_prefix(config.cache.prefix.clone())
            .with_policy(config.cache.policy)
            .with_repopulate_on_miss(config.cache_repopulate);

        let state = Arc::new(AppState::new(items));
        let server = HttpServer::bind(&config.http, Arc::clone(&state))
            .await
            .context("failed to bind http listener")?;

        Ok((sessions, state, server.start()))
    }

    /// Teardown plan: close the broker client, shut down the broker, then
    /// shut down the HTTP listener.
    pub fn into_shutdown(self) -> ShutdownOrchestrator {
        let mut orchestrator = ShutdownOrchestrator::new(self.config.shutdown_timeout);
        let state = self.state;
        let client = Arc::clone(self.broker.client());
        let broker = Arc::clone(self.broker.broker());
        let http = self.http;

        orchestrator.add_step("close broker client", move |_| {
            async move {
                state.set_ready(false);
                client.close().await;
                Ok(())
            }
            .boxed()
        });
        orchestrator.add_step("shut down broker", move |remaining| {
            async move { broker.shutdown(remaining).await.map_err(|e| e.to_string()) }.boxed()
        });
        orchestrator.add_step("shut down http listener", move |remaining| {
            async move { http.shutdown(remaining).await.map_err(|e| e.to_string()) }.boxed()
        });
        orchestrator
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;
    use lodestore_broker::BrokerState;
    use lodestore_store::SessionStore;
    use serde_json::Value;

    use super::*;
    use crate::cli::Cli;

    fn config(dir: &std::path::Path) -> AppConfig {
        let store_dir = dir.join("broker");
        let db_path = dir.join("app.db");
        let cli = Cli::try_parse_from([
            "lodestore",
            "--http-address",
            "127.0.0.1",
            "--http-port",
            "0",
            "--broker-address",
            "127.0.0.1",
            "--broker-port",
            "0",
            "--broker-store-dir",
            store_dir.to_str().unwrap(),
            "--database-path",
            db_path.to_str().unwrap(),
            "--shutdown-timeout",
            "5s",
        ])
        .unwrap();
        AppConfig::from_cli(&cli).unwrap()
    }

    #[tokio::test]
    async fn starts_serves_and_stops() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = AppContext::start(config(dir.path())).await.unwrap();
        let base = format!("http://{}", ctx.http.local_addr());
        let broker = Arc::clone(ctx.broker.broker());

        let client = reqwest::Client::new();
        let health: Value = client
            .get(format!("{base}/healthz"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(health["ready"], true);

        let resp = client
            .post(format!("{base}/items"))
            .json(&serde_json::json!({ "name": "Widget" }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 201);

        let expiry = chrono::Utc::now() + chrono::Duration::hours(1);
        ctx.sessions.commit("tok", b"blob", expiry).await.unwrap();
        assert_eq!(
            ctx.sessions.find("tok").await.unwrap().as_deref(),
            Some(&b"blob"[..])
        );

        let orchestrator = ctx.into_shutdown();
        let report = orchestrator.run().await.unwrap();
        let steps: Vec<_> = report.outcomes.iter().map(|o| o.step).collect();
        assert_eq!(
            steps,
            vec![
                "close broker client",
                "shut down broker",
                "shut down http listener"
            ]
        );
        assert_eq!(broker.state(), BrokerState::Stopped);

        assert!(orchestrator.run().await.unwrap().outcomes.is_empty());
    }

    #[tokio::test]
    async fn failed_http_bind_stops_the_broker() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut cfg = config(dir.path());
        cfg.http.port = blocker.local_addr().unwrap().port();

        let err = AppContext::start(cfg).await.err().unwrap();
        assert!(format!("{err:#}").contains("failed to bind http listener"));

        // The broker's storage is released, so a second start succeeds.
        let ctx = AppContext::start(config(dir.path())).await.unwrap();
        ctx.into_shutdown().run().await.unwrap();
    }

    #[tokio::test]
    async fn state_persists_across_restarts() {
        let dir = tempfile::tempdir().unwrap();

        let ctx = AppContext::start(config(dir.path())).await.unwrap();
        let expiry = chrono::Utc::now() + chrono::Duration::hours(1);
        ctx.sessions.commit("tok", b"kept", expiry).await.unwrap();
        let created = ctx.state.items.create("Widget").await.unwrap();
        ctx.into_shutdown().run().await.unwrap();

        let ctx = AppContext::start(config(dir.path())).await.unwrap();
        assert_eq!(
            ctx.sessions.find("tok").await.unwrap().as_deref(),
            Some(&b"kept"[..])
        );
        assert_eq!(ctx.state.items.get(&created.id).await.unwrap(), created);
        ctx.into_shutdown().run().await.unwrap();
    }
}
