//! `api` crate — the HTTP surface.
//!
//! Admin routes, all under `/api/v1`:
//!   GET    /integrations
//!   POST   /integrations
//!   GET    /integrations/:id
//!   DELETE /integrations/:id
//!   POST   /integrations/:id/start
//!   POST   /integrations/:id/stop
//!   POST   /integrations/:id/execute
//!   POST   /integrations/:id/probe
//!   GET    /integrations/:id/transactions
//!   GET    /transactions/:id
//!   POST   /transactions/:id/resume
//!   GET    /applications
//!
//! Every other path goes to the application that mounted it.

pub mod error;
pub mod handlers;

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use bindings::{ApplicationDirectory, HttpRoutes};
use db::DbPool;
use engine::{IntegrationRegistry, MemorySnapshotStore, Services, SnapshotStore};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;

pub use error::ApiError;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub integrations: IntegrationRegistry,
    pub applications: ApplicationDirectory,
    pub routes: HttpRoutes,
    /// Services given to integrations installed over HTTP.
    pub services: Services,
    pub snapshots: Arc<dyn SnapshotStore>,
    /// Integration documents are persisted when set.
    pub pool: Option<DbPool>,
}

impl AppState {
    /// State over `services`, falling back to an in-memory snapshot store
    /// when `services` has none.
    pub fn new(
        integrations: IntegrationRegistry,
        applications: ApplicationDirectory,
        routes: HttpRoutes,
        services: Services,
    ) -> Self {
        let snapshots: Arc<dyn SnapshotStore> = match services.snapshots.clone() {
            Some(store) => store,
            None => Arc::new(MemorySnapshotStore::new()),
        };
        let services = services.with_snapshots(snapshots.clone());
        Self {
            integrations,
            applications,
            routes,
            services,
            snapshots,
            pool: None,
        }
    }

    pub fn with_pool(mut self, pool: DbPool) -> Self {
        self.pool = Some(pool);
        self
    }
}

pub fn router(state: AppState) -> Router {
    use handlers::{applications, integrations, transactions};

    Router::new()
        .route("/api/v1/integrations", get(integrations::list).post(integrations::install))
        .route(
            "/api/v1/integrations/:id",
            get(integrations::get).delete(integrations::remove),
        )
        .route("/api/v1/integrations/:id/start", post(integrations::start))
        .route("/api/v1/integrations/:id/stop", post(integrations::stop))
        .route("/api/v1/integrations/:id/execute", post(integrations::execute))
        .route("/api/v1/integrations/:id/probe", post(integrations::probe))
        .route("/api/v1/integrations/:id/transactions", get(transactions::list))
        .route("/api/v1/transactions/:id", get(transactions::get))
        .route("/api/v1/transactions/:id/resume", post(transactions::resume))
        .route("/api/v1/applications", get(applications::list))
        .fallback(applications::inbound)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve `state` on `bind` until ctrl-c.
pub async fn serve(bind: &str, state: AppState) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!(addr = %listener.local_addr()?, "HTTP server listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("shutdown signal received");
    }
}
