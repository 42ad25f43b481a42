//! Length-prefixed control-channel protocol exchanged between the parent
//! (`SessionManager`) and one `mthost` child over a per-session socket.
//!
//! Wire shape per frame: `[type:u8][len:u32 LE][payload: len bytes]`. This is
//! a private, process-local protocol (distinct from the public mux wire
//! format in `mux::frame`), so it is free to use a simpler, length-prefixed
//! encoding rather than the fixed 9-byte mux header.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{MtError, MtResult};

const T_INPUT: u8 = 1;
const T_RESIZE: u8 = 2;
const T_BUFFER_REQUEST: u8 = 3;
const T_CLOSE: u8 = 4;
const T_OUTPUT: u8 = 5;
const T_EXIT: u8 = 6;
const T_TITLE: u8 = 7;
const T_FG_CHANGED: u8 = 8;
const T_BUFFER_CHUNK: u8 = 9;
const T_BUFFER_END: u8 = 10;

/// A foreground-process observation, reported best-effort. Absent fields are
/// empty strings — `ProcessMonitor` never fails its consumer on missing data.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ForegroundInfo {
    pub pid: u32,
    pub name: String,
    pub cmdline: String,
    pub cwd: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlFrame {
    // Parent -> child
    Input(Vec<u8>),
    Resize { cols: u16, rows: u16 },
    BufferRequest { since_position: u64 },
    Close,

    // Child -> parent
    Output { cols: u16, rows: u16, bytes: Vec<u8> },
    Exit { exit_code: i32 },
    Title(String),
    FgChanged(ForegroundInfo),
    BufferChunk { position: u64, bytes: Vec<u8> },
    BufferEnd { position: u64 },
}

impl ControlFrame {
    fn encode(&self) -> (u8, Vec<u8>) {
        match self {
            ControlFrame::Input(bytes) => (T_INPUT, bytes.clone()),
            ControlFrame::Resize { cols, rows } => {
                let mut p = Vec::with_capacity(4);
                p.extend_from_slice(&cols.to_le_bytes());
                p.extend_from_slice(&rows.to_le_bytes());
                (T_RESIZE, p)
            }
            ControlFrame::BufferRequest { since_position } => {
                (T_BUFFER_REQUEST, since_position.to_le_bytes().to_vec())
            }
            ControlFrame::Close => (T_CLOSE, Vec::new()),
            ControlFrame::Output { cols, rows, bytes } => {
                let mut p = Vec::with_capacity(4 + bytes.len());
                p.extend_from_slice(&cols.to_le_bytes());
                p.extend_from_slice(&rows.to_le_bytes());
                p.extend_from_slice(bytes);
                (T_OUTPUT, p)
            }
            ControlFrame::Exit { exit_code } => (T_EXIT, exit_code.to_le_bytes().to_vec()),
            ControlFrame::Title(title) => (T_TITLE, title.clone().into_bytes()),
            ControlFrame::FgChanged(info) => {
                let json = serde_json::json!({
                    "pid": info.pid,
                    "name": info.name,
                    "cmdline": info.cmdline,
                    "cwd": info.cwd,
                });
                (T_FG_CHANGED, serde_json::to_vec(&json).unwrap_or_default())
            }
            ControlFrame::BufferChunk { position, bytes } => {
                let mut p = Vec::with_capacity(8 + bytes.len());
                p.extend_from_slice(&position.to_le_bytes());
                p.extend_from_slice(bytes);
                (T_BUFFER_CHUNK, p)
            }
            ControlFrame::BufferEnd { position } => {
                (T_BUFFER_END, position.to_le_bytes().to_vec())
            }
        }
    }

    fn decode(type_byte: u8, payload: Vec<u8>) -> MtResult<Self> {
        match type_byte {
            T_INPUT => Ok(ControlFrame::Input(payload)),
            T_RESIZE => {
                if payload.len() < 4 {
                    return Err(MtError::ProtocolError("short RESIZE payload".into()));
                }
                let cols = u16::from_le_bytes([payload[0], payload[1]]);
                let rows = u16::from_le_bytes([payload[2], payload[3]]);
                Ok(ControlFrame::Resize { cols, rows })
            }
            T_BUFFER_REQUEST => {
                if payload.len() < 8 {
                    return Err(MtError::ProtocolError("short BUFFER_REQUEST payload".into()));
                }
                let since_position = u64::from_le_bytes(payload[..8].try_into().unwrap());
                Ok(ControlFrame::BufferRequest { since_position })
            }
            T_CLOSE => Ok(ControlFrame::Close),
            T_OUTPUT => {
                if payload.len() < 4 {
                    return Err(MtError::ProtocolError("short OUTPUT payload".into()));
                }
                let cols = u16::from_le_bytes([payload[0], payload[1]]);
                let rows = u16::from_le_bytes([payload[2], payload[3]]);
                Ok(ControlFrame::Output {
                    cols,
                    rows,
                    bytes: payload[4..].to_vec(),
                })
            }
            T_EXIT => {
                if payload.len() < 4 {
                    return Err(MtError::ProtocolError("short EXIT payload".into()));
                }
                let exit_code = i32::from_le_bytes(payload[..4].try_into().unwrap());
                Ok(ControlFrame::Exit { exit_code })
            }
            T_TITLE => Ok(ControlFrame::Title(
                String::from_utf8_lossy(&payload).into_owned(),
            )),
            T_FG_CHANGED => {
                let v: serde_json::Value = serde_json::from_slice(&payload)?;
                Ok(ControlFrame::FgChanged(ForegroundInfo {
                    pid: v.get("pid").and_then(|x| x.as_u64()).unwrap_or(0) as u32,
                    name: v
                        .get("name")
                        .and_then(|x| x.as_str())
                        .unwrap_or_default()
                        .to_string(),
                    cmdline: v
                        .get("cmdline")
                        .and_then(|x| x.as_str())
                        .unwrap_or_default()
                        .to_string(),
                    cwd: v
                        .get("cwd")
                        .and_then(|x| x.as_str())
                        .unwrap_or_default()
                        .to_string(),
                }))
            }
            T_BUFFER_CHUNK => {
                if payload.len() < 8 {
                    return Err(MtError::ProtocolError("short BUFFER_CHUNK payload".into()));
                }
                let position = u64::from_le_bytes(payload[..8].try_into().unwrap());
                Ok(ControlFrame::BufferChunk {
                    position,
                    bytes: payload[8..].to_vec(),
                })
            }
            T_BUFFER_END => {
                if payload.len() < 8 {
                    return Err(MtError::ProtocolError("short BUFFER_END payload".into()));
                }
                let position = u64::from_le_bytes(payload[..8].try_into().unwrap());
                Ok(ControlFrame::BufferEnd { position })
            }
            other => Err(MtError::ProtocolError(format!(
                "unknown control frame type {other}"
            ))),
        }
    }
}

pub async fn write_frame<W: AsyncWrite + Unpin>(w: &mut W, frame: &ControlFrame) -> MtResult<()> {
    let (type_byte, payload) = frame.encode();
    w.write_u8(type_byte).await?;
    w.write_u32_le(payload.len() as u32).await?;
    w.write_all(&payload).await?;
    w.flush().await?;
    Ok(())
}

/// Maximum single-frame payload, guarding against a malformed length prefix
/// causing an unbounded allocation.
const MAX_FRAME_PAYLOAD: u32 = 16 * 1024 * 1024;

pub async fn read_frame<R: AsyncRead + Unpin>(r: &mut R) -> MtResult<ControlFrame> {
    let type_byte = r.read_u8().await?;
    let len = r.read_u32_le().await?;
    if len > MAX_FRAME_PAYLOAD {
        return Err(MtError::ProtocolError(format!(
            "control frame payload too large: {len} bytes"
        )));
    }
    let mut payload = vec![0u8; len as usize];
    r.read_exact(&mut payload).await?;
    ControlFrame::decode(type_byte, payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn roundtrip_every_variant() {
        let frames = vec![
            ControlFrame::Input(b"ls -la\n".to_vec()),
            ControlFrame::Resize { cols: 120, rows: 40 },
            ControlFrame::BufferRequest { since_position: 42 },
            ControlFrame::Close,
            ControlFrame::Output {
                cols: 80,
                rows: 24,
                bytes: b"hello\r\n".to_vec(),
            },
            ControlFrame::Exit { exit_code: 0 },
            ControlFrame::Title("my-shell".to_string()),
            ControlFrame::FgChanged(ForegroundInfo {
                pid: 123,
                name: "vim".to_string(),
                cmdline: "vim file.rs".to_string(),
                cwd: "/home/user".to_string(),
            }),
            ControlFrame::BufferChunk {
                position: 7,
                bytes: b"chunk".to_vec(),
            },
            ControlFrame::BufferEnd { position: 100 },
        ];

        for frame in frames {
            let mut buf = Vec::new();
            write_frame(&mut buf, &frame).await.unwrap();
            let mut cursor = std::io::Cursor::new(buf);
            let decoded = read_frame(&mut cursor).await.unwrap();
            assert_eq!(decoded, frame);
        }
    }

    #[tokio::test]
    async fn unknown_type_byte_is_a_protocol_error() {
        let mut buf = Vec::new();
        buf.push(0xEE); // not a valid type
        buf.extend_from_slice(&0u32.to_le_bytes());
        let mut cursor = std::io::Cursor::new(buf);
        let result = read_frame(&mut cursor).await;
        assert!(matches!(result, Err(MtError::ProtocolError(_))));
    }

    #[tokio::test]
    async fn oversized_length_prefix_is_rejected_without_allocating() {
        let mut buf = Vec::new();
        buf.push(T_INPUT);
        buf.extend_from_slice(&(MAX_FRAME_PAYLOAD + 1).to_le_bytes());
        let mut cursor = std::io::Cursor::new(buf);
        let result = read_frame(&mut cursor).await;
        assert!(matches!(result, Err(MtError::ProtocolError(_))));
    }
}
