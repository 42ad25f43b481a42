//! The `mthost` child process: owns exactly one `PtyDevice` and speaks the
//! control-channel protocol (`control_proto`) to the parent over a named
//! Unix-domain socket (SPEC_FULL.md §4.3). This mirrors the shape of
//! `server.rs`'s `handle_terminal_socket` loop — a read side and a write
//! side driven off channels — except the "client" here is the parent
//! process instead of a browser WebSocket.

pub mod process_monitor;
pub mod title;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[cfg(unix)]
use tokio::net::{UnixListener, UnixStream};

use tokio::io::{split, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::control_proto::{read_frame, write_frame, ControlFrame};
use crate::error::{MtError, MtResult};
use crate::pty::{PtyDevice, PtyStartOptions};
use crate::scrollback::ScrollbackRing;

use process_monitor::ProcessMonitor;
use title::TitleExtractor;

pub struct TtyHostOptions {
    pub session_id: String,
    pub shell_path: String,
    pub args: Vec<String>,
    pub cwd: Option<String>,
    pub cols: u16,
    pub rows: u16,
    pub env: Vec<(String, String)>,
    pub socket_path: PathBuf,
    pub ring_capacity: usize,
}

/// Runs until the shell exits or the control channel reports `Close`.
/// Prints `READY <pid> <cols> <rows>` to stderr once the pty and listener
/// are both up, per the handshake the parent's adoption logic waits on.
pub async fn run(opts: TtyHostOptions) -> MtResult<()> {
    if Path::new(&opts.socket_path).exists() {
        let _ = std::fs::remove_file(&opts.socket_path);
    }
    let listener = UnixListener::bind(&opts.socket_path).map_err(MtError::Io)?;

    let device = Arc::new(PtyDevice::start(PtyStartOptions {
        shell_path: opts.shell_path,
        args: opts.args,
        cwd: opts.cwd,
        cols: opts.cols,
        rows: opts.rows,
        env: opts.env,
    })?);

    let pid = device.pid().unwrap_or(0);
    eprintln!("READY {pid} {} {}", opts.cols, opts.rows);
    info!(session_id = %opts.session_id, pid, "mthost ready");

    let (stream, _addr) = listener.accept().await.map_err(MtError::Io)?;
    let (read_half, write_half) = split(stream);

    let ring = Arc::new(parking_lot::Mutex::new(ScrollbackRing::new(opts.ring_capacity)));
    let (out_tx, out_rx) = mpsc::channel::<ControlFrame>(256);
    let dims = Arc::new(CurrentDims {
        cols: AtomicU16::new(opts.cols),
        rows: AtomicU16::new(opts.rows),
    });

    let reader_handle = spawn_pty_reader(device.clone(), ring.clone(), out_tx.clone(), dims.clone());
    let monitor_handle = spawn_process_monitor(device.clone(), out_tx.clone());
    let writer_handle = tokio::spawn(drain_to_control_channel(write_half, out_rx));

    let result = control_loop(read_half, device.clone(), ring.clone(), out_tx.clone(), dims).await;

    device.dispose();
    reader_handle.abort();
    monitor_handle.abort();
    drop(out_tx);
    let _ = writer_handle.await;

    let _ = std::fs::remove_file(&opts.socket_path);
    result
}

/// Shared last-known geometry, updated by `control_loop` on RESIZE and read
/// by the reader thread so it can stamp each OUTPUT frame with the
/// dimensions that produced it.
struct CurrentDims {
    cols: AtomicU16,
    rows: AtomicU16,
}

/// Blocking PTY reads happen on a dedicated thread (the master fd has no
/// async-friendly API); each chunk is appended to the ring then forwarded
/// to the control channel as an `Output` frame.
fn spawn_pty_reader(
    device: Arc<PtyDevice>,
    ring: Arc<parking_lot::Mutex<ScrollbackRing>>,
    out_tx: mpsc::Sender<ControlFrame>,
    dims: Arc<CurrentDims>,
) -> tokio::task::JoinHandle<()> {
    tokio::task::spawn_blocking(move || {
        let mut reader = match device.try_clone_reader() {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "failed to clone pty reader");
                return;
            }
        };
        let mut title_extractor = TitleExtractor::new();
        let mut buf = [0u8; 8192];
        loop {
            use std::io::Read;
            match reader.read(&mut buf) {
                Ok(0) => {
                    let exit_code = device.wait_for_exit(Duration::from_millis(500)).unwrap_or(-1);
                    let _ = out_tx.blocking_send(ControlFrame::Exit { exit_code });
                    return;
                }
                Ok(n) => {
                    let chunk = &buf[..n];
                    ring.lock().write(chunk);
                    if let Some(title) = title_extractor.feed(chunk) {
                        let _ = out_tx.blocking_send(ControlFrame::Title(title));
                    }
                    let cols = dims.cols.load(Ordering::Relaxed);
                    let rows = dims.rows.load(Ordering::Relaxed);
                    if out_tx
                        .blocking_send(ControlFrame::Output {
                            cols,
                            rows,
                            bytes: chunk.to_vec(),
                        })
                        .is_err()
                    {
                        return;
                    }
                }
                Err(_) => {
                    let exit_code = device.wait_for_exit(Duration::from_millis(500)).unwrap_or(-1);
                    let _ = out_tx.blocking_send(ControlFrame::Exit { exit_code });
                    return;
                }
            }
        }
    })
}

fn spawn_process_monitor(
    device: Arc<PtyDevice>,
    out_tx: mpsc::Sender<ControlFrame>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let Some(pid) = device.pid() else { return };
        let mut monitor = ProcessMonitor::new(pid);
        let mut interval = tokio::time::interval(Duration::from_millis(750));
        loop {
            interval.tick().await;
            if !device.is_running() {
                return;
            }
            if let Some(info) = monitor.poll() {
                if out_tx.send(ControlFrame::FgChanged(info)).await.is_err() {
                    return;
                }
            }
        }
    })
}

async fn drain_to_control_channel(
    mut write_half: WriteHalf<UnixStream>,
    mut out_rx: mpsc::Receiver<ControlFrame>,
) {
    while let Some(frame) = out_rx.recv().await {
        if write_frame(&mut write_half, &frame).await.is_err() {
            break;
        }
    }
    let _ = write_half.shutdown().await;
}

async fn control_loop(
    mut read_half: ReadHalf<UnixStream>,
    device: Arc<PtyDevice>,
    ring: Arc<parking_lot::Mutex<ScrollbackRing>>,
    out_tx: mpsc::Sender<ControlFrame>,
    dims: Arc<CurrentDims>,
) -> MtResult<()> {
    loop {
        let frame = match read_frame(&mut read_half).await {
            Ok(f) => f,
            Err(_) => return Ok(()), // parent closed the socket
        };
        match frame {
            ControlFrame::Input(bytes) => {
                let _ = device.write_input(&bytes);
            }
            ControlFrame::Resize { cols, rows } => {
                device.resize(cols, rows);
                dims.cols.store(cols, Ordering::Relaxed);
                dims.rows.store(rows, Ordering::Relaxed);
                // The new geometry must reach the parent in-order with an
                // OUTPUT frame even if the shell prints nothing in response,
                // so a client never misses a resize because the pty stayed
                // quiet.
                let _ = out_tx
                    .send(ControlFrame::Output {
                        cols,
                        rows,
                        bytes: Vec::new(),
                    })
                    .await;
            }
            ControlFrame::BufferRequest { since_position } => {
                send_buffer(&ring, since_position, &out_tx).await;
            }
            ControlFrame::Close => {
                return Ok(());
            }
            // Everything else is child->parent only; the parent should
            // never send it, but being tolerant here costs nothing.
            _ => {}
        }
    }
}

async fn send_buffer(
    ring: &Arc<parking_lot::Mutex<ScrollbackRing>>,
    since_position: u64,
    out_tx: &mpsc::Sender<ControlFrame>,
) {
    const CHUNK_SIZE: usize = 32 * 1024;
    let data = {
        let guard = ring.lock();
        guard
            .copy_since(since_position)
            .unwrap_or_else(|| guard.snapshot())
    };
    let start_position = {
        let guard = ring.lock();
        if guard.copy_since(since_position).is_some() {
            since_position
        } else {
            guard.tail_position()
        }
    };
    let mut position = start_position;
    for chunk in data.chunks(CHUNK_SIZE) {
        let _ = out_tx
            .send(ControlFrame::BufferChunk {
                position,
                bytes: chunk.to_vec(),
            })
            .await;
        position += chunk.len() as u64;
    }
    let _ = out_tx.send(ControlFrame::BufferEnd { position }).await;
}
