use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::Response;
use chrono::Utc;
use futures_util::{SinkExt, StreamExt, future};
use tracing::debug;

use crate::engine::session::{ClientSession, Identity};
use crate::engine::transport::{Frame, TransportError};

use super::app_state::AppState;

/// GET /ws: upgrade to a chat session.
pub async fn ws_upgrade(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    let identity = state
        .identity
        .resolve(&headers, &query)
        .unwrap_or_else(|| Identity::anonymous(Utc::now()));
    debug!(user = %identity.display_name, "WebSocket upgrade");
    ws.on_upgrade(move |socket| handle_socket(socket, state, identity))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>, identity: Identity) {
    let (sink, stream) = socket.split();

    let reader = stream.map(|result| {
        result
            .map(frame_from_ws)
            .map_err(|e| TransportError::Io(e.to_string()))
    });
    let writer = sink
        .sink_map_err(|e| TransportError::Io(e.to_string()))
        .with(|frame: Frame| future::ready(Ok::<_, TransportError>(frame_to_ws(frame))));

    ClientSession::new(
        identity,
        state.hub.clone(),
        Arc::clone(&state.store),
        state.session.clone(),
    )
    .run(reader, writer)
    .await;
}

fn frame_from_ws(msg: Message) -> Frame {
    match msg {
        Message::Text(text) => Frame::Text(text.as_str().to_owned()),
        // Binary payloads are treated as UTF-8 text.
        Message::Binary(data) => Frame::Text(String::from_utf8_lossy(&data).into_owned()),
        Message::Ping(data) => Frame::Ping(data.to_vec()),
        Message::Pong(data) => Frame::Pong(data.to_vec()),
        Message::Close(frame) => Frame::Close(frame.map(|f| f.code)),
    }
}

fn frame_to_ws(frame: Frame) -> Message {
    match frame {
        Frame::Text(text) => Message::Text(text.into()),
        Frame::Ping(data) => Message::Ping(data.into()),
        Frame::Pong(data) => Message::Pong(data.into()),
        Frame::Close(code) => Message::Close(code.map(|code| CloseFrame {
            code,
            reason: String::new().into(),
        })),
    }
}
