//! REST API module
//!
//! Route table plus the middleware stack: request ids, tracing, and a
//! body limit sized for chunk batches.

mod error;
mod ingest;
mod releases;
mod repos;

use crate::api::AppState;
use axum::extract::DefaultBodyLimit;
use axum::http::header;
use axum::routing::{get, post};
use axum::Router;
use std::net::SocketAddr;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::Level;

pub async fn serve(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    // Chunk batches dominate request sizes; 1 GiB leaves headroom for
    // jumbo chunk configurations.
    let body_limit = DefaultBodyLimit::max(1024 * 1024 * 1024);

    let x_request_id = header::HeaderName::from_static("x-request-id");
    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
        .on_response(DefaultOnResponse::new().level(Level::INFO));

    let app = Router::new()
        .route("/api/server/info", get(repos::server_info))
        .route("/api/repos", post(repos::create_repo).get(repos::list_repos))
        .route("/api/repos/:id", get(repos::get_repo))
        .route("/api/repos/:id/releases", get(releases::list_releases))
        .route("/api/releases/:id", get(releases::get_release))
        .route("/api/releases/:id/download", get(releases::download_release))
        .route("/api/ingest/sessions", post(ingest::create_session))
        .route("/api/ingest/sessions/:id", get(ingest::get_session))
        .route(
            "/api/ingest/sessions/:id/chunks/missing",
            post(ingest::missing_chunks),
        )
        .route(
            "/api/ingest/sessions/:id/files/missing",
            post(ingest::missing_files),
        )
        .route(
            "/api/ingest/sessions/:id/chunks/batch",
            post(ingest::upload_chunk_batch),
        )
        .route(
            "/api/ingest/sessions/:id/files/batch",
            post(ingest::upload_file_batch),
        )
        .route(
            "/api/ingest/sessions/:id/finalize",
            post(ingest::finalize_session),
        )
        .route("/api/ingest/sessions/:id/abort", post(ingest::abort_session))
        .layer(body_limit)
        .layer(PropagateRequestIdLayer::new(x_request_id.clone()))
        .layer(SetRequestIdLayer::new(x_request_id, MakeRequestUuid))
        .layer(trace_layer)
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "REST API listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

/// Wait for SIGTERM or SIGINT.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("received SIGINT, shutting down");
        },
        _ = terminate => {
            tracing::info!("received SIGTERM, shutting down");
        },
    }
}
