//! The mux WebSocket wire format: `[type:u8][session_id:8][payload...]`.
//!
//! Bit-exact per SPEC_FULL.md §4.5 / §6: the 9-byte header is fixed width so
//! parsing never needs to look ahead, and the frame type values are pinned
//! to the table in the spec so any client implementation stays compatible.

use crate::error::{MtError, MtResult};
use crate::ids::SESSION_ID_LEN;

pub const HEADER_LEN: usize = 1 + SESSION_ID_LEN;

pub const OUTPUT: u8 = 0x01;
pub const INPUT: u8 = 0x02;
pub const RESIZE: u8 = 0x03;
pub const RESYNC: u8 = 0x05;
pub const BUFFER_REQUEST: u8 = 0x06;
pub const COMPRESSED_OUTPUT: u8 = 0x07;
pub const ACTIVE_HINT: u8 = 0x08;
pub const PING: u8 = 0x09;
pub const FOREGROUND_CHANGE: u8 = 0x0A;
pub const DATA_LOSS: u8 = 0x0B;
pub const PONG: u8 = 0x0C;
pub const INIT: u8 = 0xFF;

pub const CLOSE_PROTOCOL_ERROR: u16 = 4400;
pub const CLOSE_AUTH_FAILED: u16 = 4401;
pub const CLOSE_SERVER_SHUTDOWN: u16 = 4503;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MuxFrame {
    /// S→C: terminal bytes produced at `(cols, rows)`.
    Output {
        session_id: String,
        cols: u16,
        rows: u16,
        bytes: Vec<u8>,
    },
    /// C→S: raw bytes to inject into the shell.
    Input { session_id: String, bytes: Vec<u8> },
    /// C→S: requested new geometry.
    Resize {
        session_id: String,
        cols: u16,
        rows: u16,
    },
    /// S→C: client must resync from this absolute position.
    Resync { session_id: String, position: u64 },
    /// C→S: request a full refresh.
    BufferRequest { session_id: String },
    /// S→C: gzip-deflated OUTPUT payload (cols/rows header + bytes).
    CompressedOutput {
        session_id: String,
        cols: u16,
        rows: u16,
        compressed: Vec<u8>,
    },
    /// C→S: sessions the client currently considers foreground.
    ActiveHint { session_ids: Vec<String> },
    Ping { session_id: String, timestamp: u64 },
    Pong { session_id: String, timestamp: u64 },
    ForegroundChange { session_id: String, json: Vec<u8> },
    /// S→C: background data for this session was coalesced/dropped.
    DataLoss { session_id: String },
    /// S→C: stable client id for this socket's lifetime.
    Init { client_id: String },
}

fn pack_session_id(id: &str) -> [u8; SESSION_ID_LEN] {
    let mut out = [0u8; SESSION_ID_LEN];
    let bytes = id.as_bytes();
    let n = bytes.len().min(SESSION_ID_LEN);
    out[..n].copy_from_slice(&bytes[..n]);
    out
}

fn unpack_session_id(bytes: &[u8]) -> String {
    // Zero-padded ASCII; trim trailing NULs introduced by short ids.
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

impl MuxFrame {
    pub fn encode(&self) -> Vec<u8> {
        match self {
            MuxFrame::Output {
                session_id,
                cols,
                rows,
                bytes,
            } => {
                let mut out = Vec::with_capacity(HEADER_LEN + 4 + bytes.len());
                out.push(OUTPUT);
                out.extend_from_slice(&pack_session_id(session_id));
                out.extend_from_slice(&cols.to_le_bytes());
                out.extend_from_slice(&rows.to_le_bytes());
                out.extend_from_slice(bytes);
                out
            }
            MuxFrame::Input { session_id, bytes } => {
                let mut out = Vec::with_capacity(HEADER_LEN + bytes.len());
                out.push(INPUT);
                out.extend_from_slice(&pack_session_id(session_id));
                out.extend_from_slice(bytes);
                out
            }
            MuxFrame::Resize {
                session_id,
                cols,
                rows,
            } => {
                let mut out = Vec::with_capacity(HEADER_LEN + 4);
                out.push(RESIZE);
                out.extend_from_slice(&pack_session_id(session_id));
                out.extend_from_slice(&cols.to_le_bytes());
                out.extend_from_slice(&rows.to_le_bytes());
                out
            }
            MuxFrame::Resync {
                session_id,
                position,
            } => {
                let mut out = Vec::with_capacity(HEADER_LEN + 8);
                out.push(RESYNC);
                out.extend_from_slice(&pack_session_id(session_id));
                out.extend_from_slice(&position.to_le_bytes());
                out
            }
            MuxFrame::BufferRequest { session_id } => {
                let mut out = Vec::with_capacity(HEADER_LEN);
                out.push(BUFFER_REQUEST);
                out.extend_from_slice(&pack_session_id(session_id));
                out
            }
            MuxFrame::CompressedOutput {
                session_id,
                cols,
                rows,
                compressed,
            } => {
                let mut out = Vec::with_capacity(HEADER_LEN + 4 + compressed.len());
                out.push(COMPRESSED_OUTPUT);
                out.extend_from_slice(&pack_session_id(session_id));
                out.extend_from_slice(&cols.to_le_bytes());
                out.extend_from_slice(&rows.to_le_bytes());
                out.extend_from_slice(compressed);
                out
            }
            MuxFrame::ActiveHint { session_ids } => {
                let mut out = Vec::new();
                out.push(ACTIVE_HINT);
                out.extend_from_slice(&pack_session_id("")); // no single session target
                for id in session_ids {
                    out.extend_from_slice(&pack_session_id(id));
                }
                out
            }
            MuxFrame::Ping {
                session_id,
                timestamp,
            } => {
                let mut out = Vec::with_capacity(HEADER_LEN + 8);
                out.push(PING);
                out.extend_from_slice(&pack_session_id(session_id));
                out.extend_from_slice(&timestamp.to_le_bytes());
                out
            }
            MuxFrame::Pong {
                session_id,
                timestamp,
            } => {
                let mut out = Vec::with_capacity(HEADER_LEN + 8);
                out.push(PONG);
                out.extend_from_slice(&pack_session_id(session_id));
                out.extend_from_slice(&timestamp.to_le_bytes());
                out
            }
            MuxFrame::ForegroundChange { session_id, json } => {
                let mut out = Vec::with_capacity(HEADER_LEN + json.len());
                out.push(FOREGROUND_CHANGE);
                out.extend_from_slice(&pack_session_id(session_id));
                out.extend_from_slice(json);
                out
            }
            MuxFrame::DataLoss { session_id } => {
                let mut out = Vec::with_capacity(HEADER_LEN);
                out.push(DATA_LOSS);
                out.extend_from_slice(&pack_session_id(session_id));
                out
            }
            MuxFrame::Init { client_id } => {
                let mut out = Vec::new();
                out.push(INIT);
                out.extend_from_slice(&pack_session_id(""));
                out.extend_from_slice(client_id.as_bytes());
                out
            }
        }
    }

    pub fn decode(raw: &[u8]) -> MtResult<Self> {
        if raw.len() < HEADER_LEN {
            return Err(MtError::ProtocolError(format!(
                "frame shorter than header: {} bytes",
                raw.len()
            )));
        }
        let type_byte = raw[0];
        let session_id = unpack_session_id(&raw[1..HEADER_LEN]);
        let payload = &raw[HEADER_LEN..];

        match type_byte {
            INPUT => Ok(MuxFrame::Input {
                session_id,
                bytes: payload.to_vec(),
            }),
            RESIZE => {
                if payload.len() < 4 {
                    return Err(MtError::ProtocolError("short RESIZE payload".into()));
                }
                Ok(MuxFrame::Resize {
                    session_id,
                    cols: u16::from_le_bytes([payload[0], payload[1]]),
                    rows: u16::from_le_bytes([payload[2], payload[3]]),
                })
            }
            BUFFER_REQUEST => Ok(MuxFrame::BufferRequest { session_id }),
            ACTIVE_HINT => {
                let mut session_ids = Vec::new();
                for chunk in payload.chunks(SESSION_ID_LEN) {
                    if chunk.len() == SESSION_ID_LEN {
                        session_ids.push(unpack_session_id(chunk));
                    }
                }
                Ok(MuxFrame::ActiveHint { session_ids })
            }
            PING => {
                if payload.len() < 8 {
                    return Err(MtError::ProtocolError("short PING payload".into()));
                }
                Ok(MuxFrame::Ping {
                    session_id,
                    timestamp: u64::from_le_bytes(payload[..8].try_into().unwrap()),
                })
            }
            OUTPUT => {
                if payload.len() < 4 {
                    return Err(MtError::ProtocolError("short OUTPUT payload".into()));
                }
                Ok(MuxFrame::Output {
                    session_id,
                    cols: u16::from_le_bytes([payload[0], payload[1]]),
                    rows: u16::from_le_bytes([payload[2], payload[3]]),
                    bytes: payload[4..].to_vec(),
                })
            }
            other => Err(MtError::ProtocolError(format!(
                "unexpected or server-only frame type from client: 0x{other:02X}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_is_nine_bytes() {
        assert_eq!(HEADER_LEN, 9);
    }

    #[test]
    fn output_frame_roundtrips() {
        let frame = MuxFrame::Output {
            session_id: "AbCdEfGh".to_string(),
            cols: 80,
            rows: 24,
            bytes: b"hello\r\n".to_vec(),
        };
        let encoded = frame.encode();
        assert_eq!(encoded[0], OUTPUT);
        assert_eq!(&encoded[1..9], b"AbCdEfGh");
        let decoded = MuxFrame::decode(&encoded).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn input_frame_roundtrips_client_to_server() {
        let frame = MuxFrame::Input {
            session_id: "ZzYyXxWw".to_string(),
            bytes: b"echo hi\n".to_vec(),
        };
        let encoded = frame.encode();
        let decoded = MuxFrame::decode(&encoded).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn resize_frame_roundtrips() {
        let frame = MuxFrame::Resize {
            session_id: "12345678".to_string(),
            cols: 120,
            rows: 40,
        };
        let decoded = MuxFrame::decode(&frame.encode()).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn short_frame_is_protocol_error() {
        let result = MuxFrame::decode(&[OUTPUT, b'a', b'b']);
        assert!(matches!(result, Err(MtError::ProtocolError(_))));
    }

    #[test]
    fn server_only_frame_type_from_client_is_rejected() {
        let mut raw = vec![RESYNC];
        raw.extend_from_slice(&[0u8; SESSION_ID_LEN]);
        raw.extend_from_slice(&0u64.to_le_bytes());
        let result = MuxFrame::decode(&raw);
        assert!(matches!(result, Err(MtError::ProtocolError(_))));
    }

    #[test]
    fn session_id_short_of_eight_bytes_is_zero_padded() {
        let frame = MuxFrame::BufferRequest {
            session_id: "ab".to_string(),
        };
        let encoded = frame.encode();
        assert_eq!(&encoded[1..9], b"ab\0\0\0\0\0\0");
    }
}
