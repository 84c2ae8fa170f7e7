//! HTTP and WebSocket transport.
//!
//! `GET /` serves the chat page, `GET /ws` upgrades to a WebSocket session
//! and `GET /health` reports the current member count.

use std::{future::Future, io};

use anyhow::Result;
use axum::{
    Json, Router,
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::get,
};
use bytes::Bytes;
use futures::{SinkExt, Stream, StreamExt, future};
use serde::Serialize;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};

use crate::{hub::HubHandle, session::run_session};

const INDEX_HTML: &str = include_str!("../assets/index.html");

#[derive(Clone)]
pub struct AppState {
    hub: HubHandle,
}

#[derive(Debug, Serialize)]
struct Health {
    status: &'static str,
    members: usize,
}

pub fn router(hub: HubHandle) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/ws", get(ws_handler))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(AppState { hub })
}

/// Serves the router on `listener` until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, hub: HubHandle, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(listener, router(hub))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

async fn index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

async fn health(State(state): State<AppState>) -> Response {
    match state.hub.member_count().await {
        Ok(members) => Json(Health {
            status: "ok",
            members,
        })
        .into_response(),
        Err(_) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(Health {
                status: "closed",
                members: 0,
            }),
        )
            .into_response(),
    }
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state.hub))
}

async fn handle_socket(socket: WebSocket, hub: HubHandle) {
    let (sender, receiver) = socket.split();
    let outbound =
        sender.with(|payload: Bytes| future::ready(Ok::<_, axum::Error>(to_ws_message(payload))));

    match run_session(&hub, inbound_payloads(receiver), outbound).await {
        Ok(end) => debug!(?end, "websocket session closed"),
        Err(err) => warn!(error = ?err, "websocket session rejected"),
    }
}

/// Text and binary frames are payloads; a close frame ends the stream and
/// control frames are skipped.
fn inbound_payloads<S>(receiver: S) -> impl Stream<Item = io::Result<Bytes>> + Unpin
where
    S: Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    receiver
        .take_while(|message| future::ready(!matches!(message, Ok(Message::Close(_)))))
        .filter_map(|message| {
            future::ready(match message {
                Ok(Message::Text(text)) => Some(Ok(Bytes::from(text))),
                Ok(Message::Binary(data)) => Some(Ok(Bytes::from(data))),
                Ok(_) => None,
                Err(err) => Some(Err(io::Error::other(err))),
            })
        })
}

fn to_ws_message(payload: Bytes) -> Message {
    match std::str::from_utf8(&payload) {
        Ok(text) => Message::Text(text.to_owned()),
        Err(_) => Message::Binary(payload.to_vec()),
    }
}
