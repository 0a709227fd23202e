//! Coordinator server implementation
//!
//! Wires the stores, the lock manager, the control plane and the ingestion
//! pipeline into one [`AppState`], serves the HTTP routes and runs the
//! background loops (orphan sweep, status listener, stale-worker monitor,
//! stats broadcast) until shutdown.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::{AuthConfig, Config};
use crate::control::{ControlError, ControlPlane};
use crate::coordination::SharedCoordination;
use crate::events::EventPublisher;
use crate::ingest::IngestionPipeline;
use crate::lock::TaskLockManager;
use crate::storage::SharedStateStore;

use super::api::create_router;
use super::config::CoordinatorConfig;
use super::health::create_health_router;

// ============================================================================
// App State
// ============================================================================

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    /// Durable task/worker/result store
    pub store: SharedStateStore,

    /// Leases and pub/sub
    pub coordination: SharedCoordination,

    /// Exclusive task assignment
    pub lock: Arc<TaskLockManager>,

    /// Worker registration and commands
    pub control: Arc<ControlPlane>,

    /// Result ingestion
    pub pipeline: Arc<IngestionPipeline>,

    /// Live-update fan-out
    pub events: EventPublisher,

    /// HTTP settings
    pub config: CoordinatorConfig,

    /// Bearer secret
    pub auth: AuthConfig,

    /// Server start time
    pub start_time: Instant,
}

impl AppState {
    pub fn new(config: &Config, store: SharedStateStore, coordination: SharedCoordination) -> Self {
        let events = EventPublisher::new(coordination.clone());
        let lock = Arc::new(TaskLockManager::new(
            store.clone(),
            coordination.clone(),
            events.clone(),
            config.lease.clone(),
        ));
        let control = Arc::new(ControlPlane::new(
            store.clone(),
            coordination.clone(),
            events.clone(),
        ));
        let pipeline = Arc::new(IngestionPipeline::new(
            store.clone(),
            events.clone(),
            config.ingest.clone(),
        ));

        Self {
            store,
            coordination,
            lock,
            control,
            pipeline,
            events,
            config: config.server.clone(),
            auth: config.auth.clone(),
            start_time: Instant::now(),
        }
    }

    /// Workers with no activity since this instant are stale
    pub fn stale_before(&self) -> DateTime<Utc> {
        let window = chrono::Duration::from_std(self.config.stale_after())
            .unwrap_or_else(|_| chrono::Duration::zero());
        Utc::now() - window
    }
}

// ============================================================================
// Coordinator Server
// ============================================================================

/// Main coordinator server
pub struct CoordinatorServer {
    config: CoordinatorConfig,
    state: AppState,
}

impl CoordinatorServer {
    /// Validate configuration and build the shared state
    pub fn new(
        config: &Config,
        store: SharedStateStore,
        coordination: SharedCoordination,
    ) -> Result<Self, ServerError> {
        config
            .validate()
            .map_err(|e| ServerError::Config(e.to_string()))?;

        Ok(Self {
            config: config.server.clone(),
            state: AppState::new(config, store, coordination),
        })
    }

    /// Get the application state
    pub fn state(&self) -> AppState {
        self.state.clone()
    }

    /// Build the router with all routes
    pub fn build_router(&self) -> Router {
        let mut router =
            create_router(self.state.clone()).merge(create_health_router(self.state.clone()));

        if self.config.enable_cors {
            router = router.layer(
                CorsLayer::new()
                    .allow_origin(Any)
                    .allow_methods(Any)
                    .allow_headers(Any),
            );
        }

        if self.config.enable_request_logging {
            router = router.layer(TraceLayer::new_for_http());
        }

        router
    }

    /// Serve until `shutdown_signal` resolves, then stop the background loops
    pub async fn start_with_shutdown(
        &self,
        shutdown_signal: impl std::future::Future<Output = ()> + Send + 'static,
    ) -> Result<(), ServerError> {
        let router = self.build_router();
        let addr = self.config.bind_address;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let tasks = self.start_background_tasks(shutdown_rx).await?;

        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::Bind { addr, source: e })?;

        tracing::info!(%addr, "Coordinator listening");

        let served = axum::serve(listener, router)
            .with_graceful_shutdown(shutdown_signal)
            .await;

        let _ = shutdown_tx.send(true);
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Background task ended abnormally");
            }
        }

        served.map_err(ServerError::Serve)?;
        tracing::info!("Coordinator shutdown complete");
        Ok(())
    }

    /// Spawn the sweeper, status listener, stale monitor and stats broadcast
    pub async fn start_background_tasks(
        &self,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Vec<JoinHandle<()>>, ServerError> {
        let mut tasks = vec![self.state.lock.clone().spawn_sweeper(shutdown.clone())];

        tasks.push(
            self.state
                .control
                .clone()
                .spawn_status_listener(shutdown.clone())
                .await?,
        );

        tasks.push(self.state.control.clone().spawn_stale_monitor(
            self.config.stale_after(),
            self.config.heartbeat_interval(),
            shutdown.clone(),
        ));

        tasks.push(spawn_stats_broadcast(self.state.clone(), shutdown));

        tracing::info!(count = tasks.len(), "Background tasks started");
        Ok(tasks)
    }

    /// Get server info
    pub fn info(&self) -> ServerInfo {
        ServerInfo {
            bind_address: self.config.bind_address,
            heartbeat_interval_secs: self.config.heartbeat_interval_secs,
            stale_after_secs: self.config.stale_after().as_secs(),
            auth_enabled: self.state.auth.api_secret.is_some(),
            cors_enabled: self.config.enable_cors,
            request_logging_enabled: self.config.enable_request_logging,
        }
    }
}

/// Publish aggregate stats on the stats channel at a fixed rate
fn spawn_stats_broadcast(state: AppState, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(state.config.stats_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match state.store.stats(state.stale_before()).await {
                        Ok(stats) => state.events.stats(&stats).await,
                        Err(e) => tracing::warn!(error = %e, "Stats broadcast skipped"),
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    })
}

/// Server information
#[derive(Debug, Clone)]
pub struct ServerInfo {
    pub bind_address: SocketAddr,
    pub heartbeat_interval_secs: u64,
    pub stale_after_secs: u64,
    pub auth_enabled: bool,
    pub cors_enabled: bool,
    pub request_logging_enabled: bool,
}

impl ServerInfo {
    /// Format as display string
    pub fn display(&self) -> String {
        let toggle = |on: bool| if on { "enabled" } else { "disabled" };
        format!(
            "Coordinator Server\n\
             {:-<40}\n\
             Bind Address: {}\n\
             Heartbeat Interval: {}s\n\
             Stale After: {}s\n\
             Auth: {}\n\
             CORS: {}\n\
             Request Logging: {}",
            "",
            self.bind_address,
            self.heartbeat_interval_secs,
            self.stale_after_secs,
            toggle(self.auth_enabled),
            toggle(self.cors_enabled),
            toggle(self.request_logging_enabled)
        )
    }
}

// ============================================================================
// Server Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("server error: {0}")]
    Serve(#[source] std::io::Error),

    #[error("failed to start background task: {0}")]
    Background(#[from] ControlError),
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::MemoryCoordination;
    use crate::storage::MemoryStore;

    fn server(config: &Config) -> Result<CoordinatorServer, ServerError> {
        CoordinatorServer::new(
            config,
            Arc::new(MemoryStore::new()),
            Arc::new(MemoryCoordination::new()),
        )
    }

    #[test]
    fn test_server_info() {
        let mut config = Config::default();
        config.auth.api_secret = Some("s3cret".into());
        let info = server(&config).unwrap().info();

        assert_eq!(info.heartbeat_interval_secs, 30);
        assert_eq!(info.stale_after_secs, 90);
        assert!(info.auth_enabled);
        assert!(info.display().contains("Auth: enabled"));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = Config::default();
        config.lease.ttl_secs = 0;
        assert!(matches!(server(&config), Err(ServerError::Config(_))));
    }

    #[tokio::test]
    async fn test_background_tasks_stop_on_shutdown() {
        let server = server(&Config::default()).unwrap();
        let (tx, rx) = watch::channel(false);
        let tasks = server.start_background_tasks(rx).await.unwrap();
        assert_eq!(tasks.len(), 4);

        tx.send(true).unwrap();
        for task in tasks {
            tokio::time::timeout(std::time::Duration::from_secs(2), task)
                .await
                .expect("task did not stop")
                .unwrap();
        }
    }
}
