//! `/ws/state`: a JSON WebSocket feed of the session list, so a browser can
//! render the session switcher without polling. Keep-alive cadence mirrors
//! this codebase's SSE streams (`sse_broadcast.rs`): a periodic ping tick
//! plus a silence timeout that drops a client who never reads.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tracing::debug;

use crate::session::{Session, SessionManager};

const PING_INTERVAL: Duration = Duration::from_secs(30);
const SILENCE_TIMEOUT: Duration = Duration::from_secs(90);

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StateMessage<'a> {
    Snapshot { sessions: &'a [Session] },
    Ping,
}

/// Drives one `/ws/state` client until it disconnects or goes silent.
pub async fn run(socket: WebSocket, manager: Arc<SessionManager>) {
    let (mut sink, mut stream) = socket.split();
    let mut ping_tick = tokio::time::interval(PING_INTERVAL);

    if send_snapshot(&mut sink, &manager).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            _ = ping_tick.tick() => {
                if sink.send(Message::Text(serde_json::to_string(&StateMessage::Ping).unwrap())).await.is_err() {
                    return;
                }
            }
            message = tokio::time::timeout(SILENCE_TIMEOUT, stream.next()) => {
                match message {
                    Ok(Some(Ok(Message::Close(_)))) | Ok(None) => return,
                    Ok(Some(Ok(_))) => {
                        // Any client traffic resets the silence clock implicitly
                        // by virtue of this branch completing; nothing to act on.
                    }
                    Ok(Some(Err(_))) => return,
                    Err(_) => {
                        debug!("state channel client went silent, closing");
                        return;
                    }
                }
            }
        }
    }
}

async fn send_snapshot(
    sink: &mut futures::stream::SplitSink<WebSocket, Message>,
    manager: &Arc<SessionManager>,
) -> Result<(), axum::Error> {
    let sessions = manager.list();
    let payload = StateMessage::Snapshot {
        sessions: &sessions,
    };
    sink.send(Message::Text(serde_json::to_string(&payload).unwrap()))
        .await
}
