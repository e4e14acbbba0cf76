//! HTTP server implementation using Axum.

use crate::session::{self, Admitted};
use crate::state::AppState;
use axum::{
    extract::{ws::WebSocketUpgrade, ConnectInfo, Path, Request, State},
    http::{header, HeaderMap, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tower::ServiceExt;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

const SUBPROTOCOL: &str = "gotty";

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("close already requested, not starting listener")]
    Closing,
    #[error("failed to bind {endpoint}: {source}")]
    Bind {
        endpoint: String,
        #[source]
        source: std::io::Error,
    },
    #[error("server error: {0}")]
    Serve(#[source] std::io::Error),
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/:mount/:id/ws", get(ws_handler))
        .route("/:mount/:id/auth_token.js", get(auth_token))
        .route("/:mount/:id/", get(static_files))
        .route("/:mount/:id/*path", get(static_files))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind the configured endpoint and serve until close is requested and every
/// session has drained.
pub async fn run_server(state: AppState) -> Result<(), ServerError> {
    let endpoint = state.options.endpoint();
    let listener = tokio::net::TcpListener::bind(&endpoint)
        .await
        .map_err(|source| ServerError::Bind {
            endpoint: endpoint.clone(),
            source,
        })?;
    info!("Server is starting at {}", endpoint);
    serve(listener, state).await
}

pub async fn serve(listener: tokio::net::TcpListener, state: AppState) -> Result<(), ServerError> {
    if state.shutdown.is_closing() {
        return Err(ServerError::Closing);
    }
    let shutdown = Arc::clone(&state.shutdown);
    let app = router(state).into_make_service_with_connect_info::<SocketAddr>();
    axum::serve(listener, app)
        .with_graceful_shutdown(Arc::clone(&shutdown).closed())
        .await
        .map_err(ServerError::Serve)?;

    info!(in_flight = shutdown.in_flight(), "Listener closed, draining sessions");
    shutdown.wait_drained().await;
    info!("Exiting...");
    Ok(())
}

async fn health() -> &'static str {
    "OK"
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path((_mount, id)): Path<(String, String)>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Result<Response, (StatusCode, String)> {
    if state.shutdown.is_closing() {
        return Err((StatusCode::SERVICE_UNAVAILABLE, "Server is shutting down".to_string()));
    }

    if let Some(allowed) = state.options.ws_origin.as_deref() {
        let origin = headers.get(header::ORIGIN).and_then(|v| v.to_str().ok());
        if origin != Some(allowed) {
            warn!(%remote, ?origin, "Rejected websocket origin");
            return Err((StatusCode::FORBIDDEN, "Origin not allowed".to_string()));
        }
    }

    let command = match state.resolver.resolve(&id).await {
        Ok(Some(command)) => command,
        Ok(None) => return Err((StatusCode::NOT_FOUND, "Session not found".to_string())),
        Err(e) => {
            error!(error = %e, url = state.resolver.url(), "Command lookup failed");
            return Err((StatusCode::BAD_GATEWAY, "Command lookup failed".to_string()));
        }
    };

    // Over-limit requests are refused with a bare 503 before the upgrade
    // instead of being dropped silently; the slot releases on drop.
    let slot = state.gate.claim();
    if !slot.admitted() {
        return Err((StatusCode::SERVICE_UNAVAILABLE, String::new()));
    }

    let admitted = Admitted {
        id: uuid::Uuid::new_v4(),
        remote,
        command,
        slot,
    };
    Ok(ws
        .protocols([SUBPROTOCOL])
        .on_failed_upgrade(move |e| warn!(%remote, error = %e, "Failed to upgrade connection"))
        .on_upgrade(move |socket| session::serve(socket, state, admitted)))
}

async fn auth_token(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "application/javascript")],
        format!("var gotty_auth_token = '{}';", state.options.credential),
    )
}

async fn static_files(
    State(state): State<AppState>,
    Path(params): Path<HashMap<String, String>>,
    mut req: Request,
) -> Result<Response, StatusCode> {
    let dir = state.options.index_dir.as_ref().ok_or(StatusCode::NOT_FOUND)?;
    let rest = params.get("path").map(String::as_str).unwrap_or_default();
    *req.uri_mut() = format!("/{rest}")
        .parse::<Uri>()
        .map_err(|_| StatusCode::BAD_REQUEST)?;
    match ServeDir::new(dir).oneshot(req).await {
        Ok(resp) => Ok(resp.into_response()),
        Err(never) => match never {},
    }
}
