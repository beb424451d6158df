//! Push endpoints: WebSocket upgrade and server-sent events.
//!
//! Both check the subscription before any protocol switch, so a wrong id,
//! transport or an inactive subscription gets a plain JSON error.

use axum::extract::rejection::PathRejection;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, Path, State};
use axum::http::{header, HeaderMap};
use axum::response::sse::{KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use super::owner::MaybeCaller;
use super::subscriptions::subscription_id;
use super::AppState;
use crate::domain::{ApiResult, ClientInfo, TransportType};

fn client_info(headers: &HeaderMap, peer: Option<SocketAddr>) -> ClientInfo {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string());
    ClientInfo {
        remote_addr: forwarded.or_else(|| peer.map(|p| p.ip().to_string())),
        user_agent: headers
            .get(header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
    }
}

pub async fn websocket(
    State(state): State<AppState>,
    MaybeCaller(owner): MaybeCaller,
    path: Result<Path<Uuid>, PathRejection>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    upgrade: WebSocketUpgrade,
) -> ApiResult<Response> {
    let id = subscription_id(path)?;
    let subscription = state
        .pipeline
        .authorize_push(owner.as_ref(), id, TransportType::WebSocket)
        .await?;
    let client = client_info(&headers, connect_info.map(|ConnectInfo(addr)| addr));

    let sockets = Arc::clone(&state.pipeline.sinks().socket);
    let max_message_size = sockets.config().max_message_size;
    debug!(subscription_id = %id, "upgrading to websocket");

    Ok(upgrade
        .max_message_size(max_message_size)
        .on_upgrade(move |socket| sockets.serve(socket, subscription, client))
        .into_response())
}

pub async fn sse(
    State(state): State<AppState>,
    MaybeCaller(owner): MaybeCaller,
    path: Result<Path<Uuid>, PathRejection>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let id = subscription_id(path)?;
    let subscription = state
        .pipeline
        .authorize_push(owner.as_ref(), id, TransportType::Sse)
        .await?;
    let client = client_info(&headers, connect_info.map(|ConnectInfo(addr)| addr));

    let streams = &state.pipeline.sinks().stream;
    let keep_alive = streams.config().keep_alive;
    let body = streams.open(&subscription, client).await;

    Ok(Sse::new(body)
        .keep_alive(KeepAlive::new().interval(keep_alive))
        .into_response())
}
