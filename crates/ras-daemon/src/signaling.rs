//! Signaling server
//!
//! Answers signed `POST /v1/signal` requests from clients on the LAN or the
//! overlay network with the transport port, signing the response with the
//! same key so the client can tell it came from the paired daemon.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::{ConnectInfo, State},
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
    Router,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use ras_core::signaling::{sign, verify};
use ras_core::time::current_time_secs;
use ras_protocol::signaling::{HEADER_SESSION, HEADER_SIGNATURE, HEADER_TIMESTAMP, SIGNAL_PATH};
use ras_protocol::{SignalRequest, SignalResponse};

use crate::state::DaemonState;

/// Router with the signaling endpoint
pub fn router(state: Arc<DaemonState>) -> Router {
    Router::new()
        .route(SIGNAL_PATH, post(handle_signal))
        .with_state(state)
}

/// Serve signaling on `listener` until cancelled
pub async fn serve(
    listener: TcpListener,
    state: Arc<DaemonState>,
    cancel: CancellationToken,
) -> Result<()> {
    info!("Signaling server listening on {}", listener.local_addr()?);

    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { cancel.cancelled().await })
    .await
    .context("Signaling server failed")?;

    info!("Signaling server shutting down");
    Ok(())
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

async fn handle_signal(
    State(state): State<Arc<DaemonState>>,
    connect: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let observed = connect.map(|ConnectInfo(addr)| addr);

    let Some(session_id) = header(&headers, HEADER_SESSION) else {
        return StatusCode::UNAUTHORIZED.into_response();
    };
    if session_id != state.session_id() {
        debug!("Signal for unknown session {} from {:?}", session_id, observed);
        return StatusCode::NOT_FOUND.into_response();
    }

    let (Some(timestamp), Some(signature)) = (
        header(&headers, HEADER_TIMESTAMP).and_then(|t| t.parse::<u64>().ok()),
        header(&headers, HEADER_SIGNATURE),
    ) else {
        return StatusCode::UNAUTHORIZED.into_response();
    };

    if let Err(e) = verify(
        &state.keys.auth,
        session_id,
        timestamp,
        &body,
        signature,
        current_time_secs(),
        state.config.timestamp_tolerance_secs,
    ) {
        warn!("Refused signal from {:?}: {}", observed, e);
        return StatusCode::UNAUTHORIZED.into_response();
    }

    let request: SignalRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => {
            debug!("Malformed signal body: {}", e);
            return StatusCode::BAD_REQUEST.into_response();
        }
    };

    let answer = SignalResponse {
        request_nonce: request.request_nonce,
        transport_port: state.transport_port,
        observed_addr: observed,
    };
    signed_response(&state, &answer)
}

fn signed_response(state: &DaemonState, answer: &SignalResponse) -> Response {
    let body = match serde_json::to_vec(answer) {
        Ok(body) => body,
        Err(_) => return StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    };
    let timestamp = current_time_secs();
    let signature = sign(&state.keys.auth, state.session_id(), timestamp, &body);

    let mut response = (
        StatusCode::OK,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body,
    )
        .into_response();
    let headers = response.headers_mut();
    headers.insert(HEADER_TIMESTAMP, HeaderValue::from(timestamp));
    if let Ok(value) = HeaderValue::from_str(&signature) {
        headers.insert(HEADER_SIGNATURE, value);
    }
    response
}
