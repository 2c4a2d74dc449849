//! # sharedfs: shared filesystem agent
//!
//! `sharedfs` hands out short-lived SSH access to a shared filesystem on behalf of a
//! storage-service broker. For each service the broker orders, the agent creates an isolated OS
//! account with a generated keypair, returns the private key as the service's credential, and
//! later destroys the account again.
//!
//! ## Architecture
//!
//! ```text
//! HTTP (axum) -> api::handlers -> provisioner::UserProvisioner -> exec::CommandRunner -> OS
//!                                          |
//!                                          +-> db::ServiceStore (SQLite or memory)
//! ```
//!
//! - [`exec`] runs external programs with a deadline, kills and reaps them when it elapses, and
//!   retries under a fixed-delay policy. Commands either block their thread or suspend their
//!   task, as configured.
//! - [`provisioner`] owns the account lifecycle and turns every failure into a flag and message.
//! - [`reconcile`] runs once at startup and recreates accounts that the OS lost while their
//!   records survived, such as after a VM rebuild.
//! - [`db`] persists one record per service.
//!
//! ## Running
//!
//! ```no_run
//! use sharedfs::{Application, Config};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::default();
//!     Application::new(config)
//!         .await?
//!         .serve(async {
//!             tokio::signal::ctrl_c().await.ok();
//!         })
//!         .await
//! }
//! ```
//!
//! ## Database
//!
//! With `database.type: sqlite` the database file is created if needed and migrated on startup:
//!
//! ```ignore
//! sharedfs::migrator().run(&pool).await?;
//! ```

pub mod api;
pub mod config;
pub mod db;
pub mod errors;
pub mod exec;
pub mod provisioner;
pub mod reconcile;
pub mod telemetry;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

use axum::{Json, Router, routing::get};
use bon::Builder;
use sqlx::SqlitePool;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{Level, debug, info, warn};
use utoipa::OpenApi;
use utoipa_scalar::{Scalar, Servable};

pub use config::Config;

use crate::api::ApiDoc;
use crate::config::DatabaseConfig;
use crate::db::{InMemoryServiceStore, ServiceStore, SqliteServiceStore};
use crate::exec::CommandRunner;
use crate::provisioner::UserProvisioner;

/// Application state shared across all request handlers.
///
/// ```ignore
/// let state = AppState::builder()
///     .config(config)
///     .provisioner(provisioner)
///     .build();
/// ```
#[derive(Clone, Builder)]
pub struct AppState {
    pub config: Arc<Config>,
    pub provisioner: UserProvisioner,
}

/// Get the sharedfs database migrator
pub fn migrator() -> sqlx::migrate::Migrator {
    sqlx::migrate!("./migrations")
}

/// Build the HTTP router with all routes and middleware.
pub fn build_router(state: AppState) -> Router {
    let router = Router::new()
        .route("/", get(api::handlers::system::root))
        .route("/healthz", get(api::handlers::system::healthz))
        .route("/discover", get(api::handlers::system::discover))
        .route(
            "/provision/{service_id}/{plan_id}/{size}",
            get(api::handlers::services::provision),
        )
        .route("/unprovision/{service_id}", get(api::handlers::services::unprovision))
        .route("/credentials/{service_id}", get(api::handlers::services::credentials))
        .route("/api-docs/openapi.json", get(|| async { Json(ApiDoc::openapi()) }))
        .with_state(state)
        .merge(Scalar::with_url("/docs", ApiDoc::openapi()));

    router.layer(
        TraceLayer::new_for_http()
            .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
            .on_request(DefaultOnRequest::new().level(Level::INFO))
            .on_response(DefaultOnResponse::new().level(Level::INFO)),
    )
}

/// Open the configured store. The pool is returned separately so it can be closed on shutdown.
async fn open_store(database: &DatabaseConfig) -> anyhow::Result<(Arc<dyn ServiceStore>, Option<SqlitePool>)> {
    match database {
        DatabaseConfig::Sqlite { url } => {
            info!(url, "opening service database");
            let store = SqliteServiceStore::connect(url).await?;
            let pool = store.pool().clone();
            Ok((Arc::new(store), Some(pool)))
        }
        DatabaseConfig::Memory => {
            warn!("Using in-memory service store: records will be lost on restart");
            Ok((Arc::new(InMemoryServiceStore::new()), None))
        }
    }
}

pub struct Application {
    router: Router,
    config: Arc<Config>,
    pool: Option<SqlitePool>,
}

impl Application {
    /// Create a new application, running commands with the executor for the configured mode.
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        let runner = exec::executor_for(config.commands.mode);
        Self::new_with_runner(config, runner).await
    }

    /// Create a new application around an explicit command runner.
    pub async fn new_with_runner(config: Config, runner: Arc<dyn CommandRunner>) -> anyhow::Result<Self> {
        debug!("Starting agent with configuration: {:#?}", config);
        let config = Arc::new(config);

        let (store, pool) = open_store(&config.database).await?;
        let provisioner = UserProvisioner::new(runner, store, config.clone());

        if config.reconcile_on_startup {
            info!("Verifying that every recorded account exists...");
            let report = provisioner.verify_users_exist().await?;
            if !report.failed.is_empty() {
                warn!(failed = ?report.failed, "some accounts could not be recreated");
            }
        }

        let state = AppState::builder().config(config.clone()).provisioner(provisioner).build();
        let router = build_router(state);

        Ok(Self { router, config, pool })
    }

    /// Convert application into a test server (for tests)
    #[cfg(test)]
    pub fn into_test_server(self) -> axum_test::TestServer {
        axum_test::TestServer::new(self.router).expect("Failed to create test server")
    }

    /// Start serving the application
    pub async fn serve<F>(self, shutdown: F) -> anyhow::Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let bind_addr = self.config.bind_address();
        let listener = TcpListener::bind(&bind_addr).await?;
        info!("sharedfs agent listening on http://{}", bind_addr);

        axum::serve(listener, self.router.into_make_service())
            .with_graceful_shutdown(shutdown)
            .await?;

        if let Some(pool) = self.pool {
            info!("Closing database connections...");
            pool.close().await;
        }
        Ok(())
    }
}
