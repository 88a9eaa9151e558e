use std::net::{IpAddr, SocketAddr};

use axum::extract::DefaultBodyLimit;
use axum::routing::{any, get, post};
use axum::Router;
use tokio::task;
use tower_http::cors::CorsLayer;
use tracing::info;

use super::config::ServiceConfig;
use super::handlers::{
    compare_proposals, health, inbound_email, parse_rfp, proposal_attachments, send_to_vendors,
};
use super::state::{AppState, Collaborators};
use super::BoxError;

pub fn build_router(state: AppState) -> Router {
    let body_limit = state.inbound_body_max_bytes;
    Router::new()
        .route("/", get(health))
        .route("/health", get(health))
        .route("/api/email/inbound", any(inbound_email))
        .route("/api/email/send-multiple", post(send_to_vendors))
        .route("/api/rfps/parse", post(parse_rfp))
        .route("/api/proposals/compare/:rfp_id", get(compare_proposals))
        .route(
            "/api/proposals/:proposal_id/attachments",
            get(proposal_attachments),
        )
        .with_state(state)
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(CorsLayer::permissive())
}

pub async fn run_server(
    config: ServiceConfig,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<(), BoxError> {
    let blocking_config = config.clone();
    let collaborators = task::spawn_blocking(move || Collaborators::from_config(&blocking_config))
        .await
        .map_err(|err| -> BoxError { err.into() })??;
    if config.inbound_token.is_none() {
        info!("INBOUND_WEBHOOK_TOKEN not set; inbound webhook will reject every request");
    }
    let state = AppState::new(&config, collaborators);

    let host: IpAddr = config
        .host
        .parse()
        .map_err(|_| format!("invalid host: {}", config.host))?;
    let addr = SocketAddr::new(host, config.port);
    info!(
        "procurement service listening on {} store={:?} enrichment={:?}",
        addr, config.store_backend, config.enrichment_mode
    );

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}
