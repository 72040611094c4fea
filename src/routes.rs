use crate::handlers::{
    add_bucket, add_namespace, allow, bucket_stats, delete_bucket, delete_namespace, get_config,
    get_config_history, health_check, top_hits, top_misses, update_bucket, update_config,
    update_namespace, SharedState,
};
use crate::middleware::logging_middleware;
use axum::routing::{get, post, put};
use axum::{middleware, Router};
use std::future::Future;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::signal;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub fn create_app(state: SharedState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/v1/allow/:namespace/:bucket", post(allow))
        .route("/api/v1/config", get(get_config).put(update_config))
        .route("/api/v1/config/history", get(get_config_history))
        .route("/api/v1/namespaces", post(add_namespace))
        .route(
            "/api/v1/namespaces/:namespace",
            put(update_namespace).delete(delete_namespace),
        )
        .route("/api/v1/namespaces/:namespace/buckets", post(add_bucket))
        .route(
            "/api/v1/namespaces/:namespace/buckets/:bucket",
            put(update_bucket).delete(delete_bucket),
        )
        .route("/api/v1/namespaces/:namespace/stats/hits", get(top_hits))
        .route("/api/v1/namespaces/:namespace/stats/misses", get(top_misses))
        .route("/api/v1/namespaces/:namespace/stats/:bucket", get(bucket_stats))
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive())
                .layer(middleware::from_fn(logging_middleware)),
        )
}

/// Serves `app` until `shutdown` resolves.
pub async fn serve(
    listener: TcpListener,
    app: Router,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    if let Ok(address) = listener.local_addr() {
        tracing::info!("Quota service listening on {}", address);
    }
    tracing::info!("Health check available at /health");

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown)
        .await
}

pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install terminate handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("Received terminate signal, initiating graceful shutdown");
        },
    }
}
