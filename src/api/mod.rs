//! Management HTTP API (§6), grounded in the teacher's
//! `nexus-api-server` axum router: nested routes, a `ServiceBuilder` stack of
//! tracing + CORS + API-key auth, and graceful shutdown shared with main.rs.

mod auth;
mod error;
mod handlers;

pub use handlers::compute_recommendations;

use crate::balancer::BalancerLoop;
use crate::hypervisor::HypervisorClient;
use crate::state::AppState;
use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Everything a handler needs: shared balancer state, the hypervisor
/// collaborator, and a handle to trigger an out-of-band tick.
#[derive(Clone)]
pub struct ApiContext {
    pub state: AppState,
    pub client: Arc<dyn HypervisorClient>,
    pub balancer: Arc<BalancerLoop>,
}

pub fn router(ctx: ApiContext) -> Router {
    let protected = Router::new()
        .route("/health", get(handlers::get_health))
        .route("/status", get(handlers::get_status))
        .route("/recommendations", get(handlers::get_recommendations))
        .route("/nodes", get(handlers::get_nodes))
        .route("/vms", get(handlers::get_vms))
        .route("/migrate", post(handlers::post_migrate))
        .route("/balance", post(handlers::post_balance))
        .route("/config", get(handlers::get_config).put(handlers::put_config))
        .route("/vm_groups", get(handlers::get_vm_groups))
        .route("/vm_groups/update", post(handlers::post_vm_groups_update))
        .route("/critical_vms/update", post(handlers::post_critical_vms_update))
        .route("/anomalies", get(handlers::get_anomalies))
        .route("/migrations/history", get(handlers::get_migrations_history))
        .route_layer(axum::middleware::from_fn_with_state(ctx.clone(), auth::require_api_key));

    Router::new()
        .nest("/api", protected)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(ctx)
}
