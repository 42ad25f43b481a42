//! Per-client mux WebSocket state: one `MuxConnection` per attached browser
//! tab, fanning session events out to the socket and client frames back
//! into the `SessionManager`.
//!
//! The bounded-queue-per-session design mirrors this codebase's
//! `StreamEventBroadcaster` (`sse_broadcast.rs`) pattern of a broadcast
//! channel per stream with slow-receiver lag handled at the channel layer;
//! here we add an explicit policy on top of that lag because background
//! (non-foreground) sessions should lose data silently instead of stalling
//! the whole socket.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::extract::ws::Message;
use dashmap::DashMap;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::Write as _;
use tokio::sync::mpsc;
use tracing::warn;

use crate::error::MtResult;
use crate::ids::SessionId;
use crate::session::{SessionEvent, SessionManager};

use super::dimension::DimensionAuthority;
use super::frame::MuxFrame;

/// Frames above this size are gzip-compressed before being sent as
/// COMPRESSED_OUTPUT instead of OUTPUT.
const COMPRESS_THRESHOLD: usize = 2048;
/// Per-session outbound queue depth before an inactive session starts
/// coalescing (dropping) output instead of blocking the socket.
const QUEUE_CAPACITY: usize = 256;

struct Attachment {
    producer: tokio::task::JoinHandle<()>,
    consumer: tokio::task::JoinHandle<()>,
}

impl Drop for Attachment {
    fn drop(&mut self) {
        self.producer.abort();
        self.consumer.abort();
    }
}

pub struct MuxConnection {
    client_id: String,
    manager: Arc<SessionManager>,
    dims: Arc<DimensionAuthority>,
    /// All attachments share one outbound sink feed so frame ordering
    /// across sessions is whatever ordering the socket write task imposes,
    /// never interleaved mid-frame.
    ws_tx: mpsc::Sender<Message>,
    attachments: DashMap<SessionId, Attachment>,
    active_sessions: Arc<parking_lot::Mutex<HashSet<SessionId>>>,
}

impl MuxConnection {
    pub fn new(
        client_id: String,
        manager: Arc<SessionManager>,
        dims: Arc<DimensionAuthority>,
        ws_tx: mpsc::Sender<Message>,
    ) -> Self {
        Self {
            client_id,
            manager,
            dims,
            ws_tx,
            attachments: DashMap::new(),
            active_sessions: Arc::new(parking_lot::Mutex::new(HashSet::new())),
        }
    }

    pub async fn send_init(&self) -> MtResult<()> {
        let frame = MuxFrame::Init {
            client_id: self.client_id.clone(),
        };
        self.send_raw(frame.encode()).await
    }

    /// Subscribe to a session's events and start forwarding them to this
    /// client. A RESYNC is sent first with the session's current tail
    /// position, followed by a full snapshot as an OUTPUT frame, so the
    /// client always starts from a known-good baseline instead of whatever
    /// happened to already be mid-flight on the broadcast channel.
    pub async fn attach(&self, session_id: &str) -> MtResult<()> {
        if self.attachments.contains_key(session_id) {
            return Ok(());
        }
        let mut rx = self.manager.subscribe(session_id)?;
        let snapshot = self.manager.snapshot_scrollback(session_id)?;
        let session = self.manager.get(session_id)?;

        self.send_raw(
            MuxFrame::Resync {
                session_id: session_id.to_string(),
                position: 0,
            }
            .encode(),
        )
        .await?;
        if !snapshot.is_empty() {
            self.send_output(session_id, session.cols, session.rows, snapshot.to_vec())
                .await?;
        }

        let (local_tx, mut local_rx) = mpsc::channel::<MuxFrame>(QUEUE_CAPACITY);
        let ws_tx = self.ws_tx.clone();
        let consumer = tokio::spawn(async move {
            while let Some(frame) = local_rx.recv().await {
                if ws_tx.send(Message::Binary(frame.encode())).await.is_err() {
                    return;
                }
            }
        });

        let active_sessions = self.active_sessions.clone();
        let session_id_owned = session_id.to_string();
        let producer_tx = local_tx.clone();
        let manager = self.manager.clone();
        let producer = tokio::spawn(async move {
            loop {
                let event = match rx.recv().await {
                    Ok(e) => e,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {
                        let _ = producer_tx
                            .try_send(MuxFrame::DataLoss {
                                session_id: session_id_owned.clone(),
                            });
                        continue;
                    }
                };
                forward_event(&producer_tx, &session_id_owned, &active_sessions, &manager, event).await;
            }
        });

        self.attachments.insert(
            session_id.to_string(),
            Attachment { producer, consumer },
        );
        Ok(())
    }

    pub fn detach(&self, session_id: &str) {
        self.attachments.remove(session_id);
        self.active_sessions.lock().remove(session_id);
        self.dims.remove_session(session_id);
    }

    pub async fn handle_client_frame(&self, raw: &[u8]) -> MtResult<()> {
        let frame = MuxFrame::decode(raw)?;
        match frame {
            MuxFrame::Input { session_id, bytes } => {
                self.manager.write_input(&session_id, bytes).await?;
            }
            MuxFrame::Resize {
                session_id,
                cols,
                rows,
            } => {
                let caller_is_active = self.active_sessions.lock().contains(&session_id);
                if self
                    .dims
                    .apply(&session_id, &self.client_id, cols, rows, caller_is_active)
                {
                    self.manager.resize(&session_id, cols, rows).await?;
                }
            }
            MuxFrame::BufferRequest { session_id } => {
                self.manager.request_buffer(&session_id, 0).await?;
            }
            MuxFrame::ActiveHint { session_ids } => {
                let mut active = self.active_sessions.lock();
                active.clear();
                active.extend(session_ids);
            }
            MuxFrame::Ping { session_id, timestamp } => {
                self.send_raw(MuxFrame::Pong { session_id, timestamp }.encode())
                    .await?;
            }
            other => {
                warn!(?other, "client sent a server-only mux frame");
            }
        }
        Ok(())
    }

    async fn send_output(
        &self,
        session_id: &str,
        cols: u16,
        rows: u16,
        bytes: Vec<u8>,
    ) -> MtResult<()> {
        if bytes.len() > COMPRESS_THRESHOLD {
            if let Some(compressed) = gzip(&bytes) {
                return self
                    .send_raw(
                        MuxFrame::CompressedOutput {
                            session_id: session_id.to_string(),
                            cols,
                            rows,
                            compressed,
                        }
                        .encode(),
                    )
                    .await;
            }
        }
        self.send_raw(
            MuxFrame::Output {
                session_id: session_id.to_string(),
                cols,
                rows,
                bytes,
            }
            .encode(),
        )
        .await
    }

    async fn send_raw(&self, bytes: Vec<u8>) -> MtResult<()> {
        self.ws_tx
            .send(Message::Binary(bytes))
            .await
            .map_err(|_| crate::error::MtError::ProtocolError("client socket closed".into()))
    }
}

async fn forward_event(
    tx: &mpsc::Sender<MuxFrame>,
    session_id: &str,
    active_sessions: &Arc<parking_lot::Mutex<HashSet<SessionId>>>,
    manager: &Arc<SessionManager>,
    event: SessionEvent,
) {
    let frame = match event {
        SessionEvent::Output { cols, rows, bytes } => {
            if bytes.len() > COMPRESS_THRESHOLD {
                match gzip(&bytes) {
                    Some(compressed) => MuxFrame::CompressedOutput {
                        session_id: session_id.to_string(),
                        cols,
                        rows,
                        compressed,
                    },
                    None => MuxFrame::Output {
                        session_id: session_id.to_string(),
                        cols,
                        rows,
                        bytes: bytes.to_vec(),
                    },
                }
            } else {
                MuxFrame::Output {
                    session_id: session_id.to_string(),
                    cols,
                    rows,
                    bytes: bytes.to_vec(),
                }
            }
        }
        // Shell exit is a state-channel concern (the session's state flips
        // to Exited there); DATA_LOSS means "issue a BUFFER_REQUEST", which
        // is pointless once the host is gone, so this is dropped like the
        // other non-byte-stream events below.
        SessionEvent::Exit { .. } => return,
        SessionEvent::TitleChanged(_) | SessionEvent::ForegroundChanged(_) => return,
        SessionEvent::BufferChunk { position: _, bytes } => {
            let (cols, rows) = manager
                .get(session_id)
                .map(|s| (s.cols, s.rows))
                .unwrap_or((0, 0));
            MuxFrame::Output {
                session_id: session_id.to_string(),
                cols,
                rows,
                bytes: bytes.to_vec(),
            }
        }
        SessionEvent::BufferEnd { .. } => return,
    };

    let is_active = active_sessions.lock().contains(session_id);
    if is_active {
        // True backpressure: block rather than drop for foreground sessions.
        if tx.send(frame).await.is_err() {
            // connection torn down underneath us; nothing more to do.
        }
    } else {
        use tokio::sync::mpsc::error::TrySendError;
        match tx.try_send(frame) {
            Ok(_) => {}
            Err(TrySendError::Full(_)) => {
                let _ = tx.try_send(MuxFrame::DataLoss {
                    session_id: session_id.to_string(),
                });
            }
            Err(TrySendError::Closed(_)) => {}
        }
    }
}

fn gzip(bytes: &[u8]) -> Option<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::fast());
    encoder.write_all(bytes).ok()?;
    encoder.finish().ok()
}
