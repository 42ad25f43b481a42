//! Parent-side session registry: `Session` metadata plus `SessionManager`,
//! which owns one `mthost` child per session and fans its control-channel
//! traffic out to whatever is subscribed (the mux layer, the state channel).
//!
//! The registry itself is a `DashMap`, the same lock-free-read structure
//! this codebase already reaches for on its hot paths (see
//! `ServerState`'s connection tracking in `server.rs`); each entry's mutable
//! parts are behind their own fine-grained locks so one session's I/O never
//! blocks a lookup of another.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::io::{split, ReadHalf, WriteHalf};
use tokio::net::UnixStream;
use tokio::process::{Child, Command};
use tokio::sync::{broadcast, Mutex as AsyncMutex};
use tracing::{info, warn};

use crate::config::MtConfig;
use crate::control_proto::{read_frame, write_frame, ControlFrame, ForegroundInfo};
use crate::error::{MtError, MtResult};
use crate::ids::{self, SessionId};
use crate::scrollback::ScrollbackRing;

const EVENT_CHANNEL_CAPACITY: usize = 1024;
const BEACON_STALE_AFTER: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Spawning,
    Running,
    Closing,
    Exited,
}

/// Public, cloneable snapshot of one session's metadata.
#[derive(Debug, Clone, Serialize)]
pub struct Session {
    pub id: SessionId,
    pub pid: Option<u32>,
    pub shell_type: String,
    pub shell_path: String,
    pub initial_cwd: Option<String>,
    pub cols: u16,
    pub rows: u16,
    pub user_title: Option<String>,
    pub terminal_title: Option<String>,
    pub manually_named: bool,
    pub order: u64,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub state: SessionState,
}

/// Broadcast to every subscriber of one session (mux connections, the state
/// channel). Cheap to clone: the payload variants hold `Bytes`.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Output { cols: u16, rows: u16, bytes: Bytes },
    Exit { exit_code: i32 },
    TitleChanged(String),
    ForegroundChanged(ForegroundInfo),
    BufferChunk { position: u64, bytes: Bytes },
    BufferEnd { position: u64 },
}

pub struct CreateOptions {
    pub shell_path: String,
    pub shell_type: String,
    pub args: Vec<String>,
    pub cwd: Option<String>,
    pub cols: u16,
    pub rows: u16,
    pub env: Vec<(String, String)>,
}

struct SessionHandle {
    metadata: parking_lot::RwLock<Session>,
    scrollback: parking_lot::RwLock<ScrollbackRing>,
    write_half: AsyncMutex<WriteHalf<UnixStream>>,
    events: broadcast::Sender<SessionEvent>,
    socket_path: PathBuf,
    /// `None` for a session adopted from a beacon left by a prior `mt`
    /// process: we never spawned that `mthost`, so we have no `Child` to
    /// wait on and fall back to pid-based liveness checks on close.
    child: AsyncMutex<Option<Child>>,
}

pub struct SessionManager {
    config: MtConfig,
    sessions: DashMap<SessionId, Arc<SessionHandle>>,
    order_counter: AtomicU64,
    mthost_exe: PathBuf,
}

impl SessionManager {
    pub fn new(config: MtConfig, mthost_exe: PathBuf) -> Self {
        Self {
            config,
            sessions: DashMap::new(),
            order_counter: AtomicU64::new(0),
            mthost_exe,
        }
    }

    fn socket_path_for(&self, id: &str) -> PathBuf {
        self.config.sessions_dir().join(format!("{id}.sock"))
    }

    fn beacon_path_for(&self, id: &str) -> PathBuf {
        self.config.sessions_dir().join(format!("{id}.json"))
    }

    pub async fn create(&self, opts: CreateOptions) -> MtResult<Session> {
        let id = ids::generate_unique(|candidate| self.sessions.contains_key(candidate));
        let socket_path = self.socket_path_for(&id);

        let mut child = Command::new(&self.mthost_exe)
            .arg("--session-id")
            .arg(&id)
            .arg("--shell")
            .arg(&opts.shell_path)
            .arg("--cols")
            .arg(opts.cols.to_string())
            .arg("--rows")
            .arg(opts.rows.to_string())
            .arg("--socket")
            .arg(&socket_path)
            .args(opts.cwd.iter().flat_map(|c| ["--cwd".to_string(), c.clone()]))
            .args(opts.args.iter().flat_map(|a| ["--arg".to_string(), a.clone()]))
            .stderr(std::process::Stdio::piped())
            .stdout(std::process::Stdio::null())
            .kill_on_drop(false)
            .spawn()
            .map_err(|e| MtError::SpawnError {
                reason: format!("failed to spawn mthost: {e}"),
            })?;

        let pid = read_ready_line(&mut child).await?;
        let stream = connect_with_retry(&socket_path, Duration::from_secs(2)).await?;
        let (read_half, write_half) = split(stream);

        let now = Utc::now();
        let order = self.order_counter.fetch_add(1, Ordering::Relaxed);
        let session = Session {
            id: id.clone(),
            pid: Some(pid),
            shell_type: opts.shell_type,
            shell_path: opts.shell_path,
            initial_cwd: opts.cwd,
            cols: opts.cols,
            rows: opts.rows,
            user_title: None,
            terminal_title: None,
            manually_named: false,
            order,
            created_at: now,
            last_activity_at: now,
            state: SessionState::Running,
        };

        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let handle = Arc::new(SessionHandle {
            metadata: parking_lot::RwLock::new(session.clone()),
            scrollback: parking_lot::RwLock::new(ScrollbackRing::new(self.config.ring_capacity)),
            write_half: AsyncMutex::new(write_half),
            events: events_tx,
            socket_path: socket_path.clone(),
            child: AsyncMutex::new(Some(child)),
        });

        write_beacon(
            &self.beacon_path_for(&id),
            &id,
            pid,
            opts.cols,
            opts.rows,
            &socket_path,
            &session.shell_path,
        )?;

        self.sessions.insert(id.clone(), handle.clone());
        tokio::spawn(reader_task(id.clone(), handle, read_half));

        info!(session_id = %session.id, pid, "session created");
        Ok(session)
    }

    pub fn get(&self, id: &str) -> MtResult<Session> {
        self.sessions
            .get(id)
            .map(|h| h.metadata.read().clone())
            .ok_or_else(|| MtError::UnknownSession(id.to_string()))
    }

    pub fn list(&self) -> Vec<Session> {
        let mut sessions: Vec<Session> = self
            .sessions
            .iter()
            .map(|e| e.value().metadata.read().clone())
            .collect();
        sessions.sort_by_key(|s| s.order);
        sessions
    }

    pub fn subscribe(&self, id: &str) -> MtResult<broadcast::Receiver<SessionEvent>> {
        self.sessions
            .get(id)
            .map(|h| h.events.subscribe())
            .ok_or_else(|| MtError::UnknownSession(id.to_string()))
    }

    pub fn snapshot_scrollback(&self, id: &str) -> MtResult<Bytes> {
        self.sessions
            .get(id)
            .map(|h| h.scrollback.read().snapshot())
            .ok_or_else(|| MtError::UnknownSession(id.to_string()))
    }

    pub fn copy_since(&self, id: &str, position: u64) -> MtResult<Option<Bytes>> {
        self.sessions
            .get(id)
            .map(|h| h.scrollback.read().copy_since(position))
            .ok_or_else(|| MtError::UnknownSession(id.to_string()))
    }

    pub async fn write_input(&self, id: &str, bytes: Vec<u8>) -> MtResult<()> {
        let handle = self.handle(id)?;
        handle.metadata.write().last_activity_at = Utc::now();
        send_frame(&handle, ControlFrame::Input(bytes)).await
    }

    pub async fn resize(&self, id: &str, cols: u16, rows: u16) -> MtResult<()> {
        let cols = crate::config::clamp_dim(cols);
        let rows = crate::config::clamp_dim(rows);
        let handle = self.handle(id)?;
        {
            let mut meta = handle.metadata.write();
            meta.cols = cols;
            meta.rows = rows;
        }
        send_frame(&handle, ControlFrame::Resize { cols, rows }).await
    }

    pub async fn request_buffer(&self, id: &str, since_position: u64) -> MtResult<()> {
        let handle = self.handle(id)?;
        send_frame(&handle, ControlFrame::BufferRequest { since_position }).await
    }

    /// Renaming is an explicit, user-driven override: once a session has
    /// been manually named, an `auto` rename (one driven by an OSC
    /// terminal-title update rather than the user) is a no-op, so it never
    /// clobbers a name the user chose on purpose. A non-auto rename always
    /// takes effect.
    pub fn rename(&self, id: &str, name: String, auto: bool) -> MtResult<Session> {
        let handle = self.handle(id)?;
        let mut meta = handle.metadata.write();
        if auto && meta.manually_named {
            return Ok(meta.clone());
        }
        meta.user_title = Some(name);
        if !auto {
            meta.manually_named = true;
        }
        Ok(meta.clone())
    }

    /// Sends CLOSE, waits up to 3s for the `mthost` child to exit on its
    /// own, then force-kills it and reaps it before releasing the
    /// session's registry entry and on-disk state.
    pub async fn close(&self, id: &str) -> MtResult<()> {
        let handle = self.handle(id)?;
        handle.metadata.write().state = SessionState::Closing;
        let _ = send_frame(&handle, ControlFrame::Close).await;

        let pid = handle.metadata.read().pid;
        let mut child_slot = handle.child.lock().await;
        match child_slot.as_mut() {
            Some(child) => {
                if tokio::time::timeout(Duration::from_secs(3), child.wait())
                    .await
                    .is_err()
                {
                    if let Some(pid) = pid {
                        force_kill(pid);
                    }
                    let _ = child.wait().await;
                }
            }
            None => {
                // Adopted session: we hold no `Child`, only its pid. Give
                // it the same grace period, then fall back to a signal.
                tokio::time::sleep(Duration::from_secs(3)).await;
                if let Some(pid) = pid {
                    if process_alive(pid) {
                        force_kill(pid);
                    }
                }
            }
        }
        drop(child_slot);

        self.sessions.remove(id);
        let _ = std::fs::remove_file(&handle.socket_path);
        let _ = std::fs::remove_file(self.beacon_path_for(id));
        Ok(())
    }

    pub async fn shutdown(&self) {
        let ids: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            let _ = self.close(&id).await;
        }
    }

    /// Enumerate beacon files left behind by a previous parent process and
    /// re-adopt the sessions still alive behind them, registering each one
    /// as `Running`. Beacons whose socket no longer exists or whose pid is
    /// dead are treated as orphaned and pruned by `beacon::scan` instead.
    pub async fn discover_existing_sessions(&self) -> Vec<Session> {
        let beacons = crate::beacon::scan(&self.config.sessions_dir(), BEACON_STALE_AFTER);
        let mut adopted = Vec::with_capacity(beacons.len());
        for beacon in beacons {
            let id = beacon.id.clone();
            match self.adopt_session(beacon).await {
                Some(session) => adopted.push(session),
                None => {
                    warn!(session_id = %id, "failed to adopt session from beacon, dropping it");
                    let _ = std::fs::remove_file(self.beacon_path_for(&id));
                }
            }
        }
        adopted
    }

    /// Reconnects to a beacon's control socket and performs the handshake
    /// that restores `Running` state: re-asserting the last-known geometry
    /// (the host always answers a RESIZE with an OUTPUT frame carrying the
    /// dims it actually applied, which is how we learn the authoritative
    /// current size without a dedicated query frame) and replaying the
    /// host's scrollback into a fresh ring.
    async fn adopt_session(&self, beacon: crate::beacon::Beacon) -> Option<Session> {
        let id = beacon.id.clone();
        let socket_path = PathBuf::from(&beacon.control_pipe_path);
        let stream = UnixStream::connect(&socket_path).await.ok()?;
        let (mut read_half, mut write_half) = split(stream);

        write_frame(
            &mut write_half,
            &ControlFrame::Resize {
                cols: beacon.cols,
                rows: beacon.rows,
            },
        )
        .await
        .ok()?;
        write_frame(
            &mut write_half,
            &ControlFrame::BufferRequest { since_position: 0 },
        )
        .await
        .ok()?;

        let mut cols = beacon.cols;
        let mut rows = beacon.rows;
        let mut ring = ScrollbackRing::new(self.config.ring_capacity);
        let handshake_deadline = Duration::from_secs(2);
        loop {
            match tokio::time::timeout(handshake_deadline, read_frame(&mut read_half)).await {
                Ok(Ok(ControlFrame::Output {
                    cols: c,
                    rows: r,
                    bytes,
                })) => {
                    cols = c;
                    rows = r;
                    if !bytes.is_empty() {
                        ring.write(&bytes);
                    }
                }
                Ok(Ok(ControlFrame::BufferChunk { bytes, .. })) => ring.write(&bytes),
                Ok(Ok(ControlFrame::BufferEnd { .. })) => break,
                Ok(Ok(_)) => continue,
                _ => break,
            }
        }

        let now = Utc::now();
        let order = self.order_counter.fetch_add(1, Ordering::Relaxed);
        let shell_type = Path::new(&beacon.shell)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| beacon.shell.clone());
        let session = Session {
            id: id.clone(),
            pid: Some(beacon.pid),
            shell_type,
            shell_path: beacon.shell.clone(),
            initial_cwd: None,
            cols,
            rows,
            user_title: None,
            terminal_title: None,
            manually_named: false,
            order,
            created_at: now,
            last_activity_at: now,
            state: SessionState::Running,
        };

        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let handle = Arc::new(SessionHandle {
            metadata: parking_lot::RwLock::new(session.clone()),
            scrollback: parking_lot::RwLock::new(ring),
            write_half: AsyncMutex::new(write_half),
            events: events_tx,
            socket_path,
            child: AsyncMutex::new(None),
        });

        self.sessions.insert(id.clone(), handle.clone());
        tokio::spawn(reader_task(id.clone(), handle, read_half));
        info!(session_id = %id, pid = beacon.pid, "adopted session from prior run");
        Some(session)
    }

    fn handle(&self, id: &str) -> MtResult<Arc<SessionHandle>> {
        self.sessions
            .get(id)
            .map(|e| e.value().clone())
            .ok_or_else(|| MtError::UnknownSession(id.to_string()))
    }
}

async fn send_frame(handle: &Arc<SessionHandle>, frame: ControlFrame) -> MtResult<()> {
    let mut w = handle.write_half.lock().await;
    write_frame(&mut *w, &frame).await
}

async fn reader_task(id: SessionId, handle: Arc<SessionHandle>, mut read_half: ReadHalf<UnixStream>) {
    loop {
        let frame = match read_frame(&mut read_half).await {
            Ok(f) => f,
            Err(e) => {
                warn!(session_id = %id, error = %e, "control channel closed unexpectedly");
                handle.metadata.write().state = SessionState::Exited;
                let _ = handle.events.send(SessionEvent::Exit { exit_code: -1 });
                return;
            }
        };

        match frame {
            ControlFrame::Output { cols, rows, bytes } => {
                // Append before fan-out: any client that attaches after this
                // point sees these bytes in its initial snapshot instead of
                // only in the live stream.
                handle.scrollback.write().write(&bytes);
                handle.metadata.write().last_activity_at = Utc::now();
                let _ = handle.events.send(SessionEvent::Output {
                    cols,
                    rows,
                    bytes: Bytes::from(bytes),
                });
            }
            ControlFrame::Exit { exit_code } => {
                handle.metadata.write().state = SessionState::Exited;
                let _ = handle.events.send(SessionEvent::Exit { exit_code });
                return;
            }
            ControlFrame::Title(title) => {
                let mut meta = handle.metadata.write();
                meta.terminal_title = Some(title.clone());
                drop(meta);
                let _ = handle.events.send(SessionEvent::TitleChanged(title));
            }
            ControlFrame::FgChanged(info) => {
                let _ = handle.events.send(SessionEvent::ForegroundChanged(info));
            }
            ControlFrame::BufferChunk { position, bytes } => {
                let _ = handle.events.send(SessionEvent::BufferChunk {
                    position,
                    bytes: Bytes::from(bytes),
                });
            }
            ControlFrame::BufferEnd { position } => {
                let _ = handle.events.send(SessionEvent::BufferEnd { position });
            }
            // Parent->child frames should never arrive here.
            ControlFrame::Input(_) | ControlFrame::Resize { .. } | ControlFrame::BufferRequest { .. } | ControlFrame::Close => {}
        }
    }
}

/// Read stderr lines until the `READY <pid> <cols> <rows>` handshake, or the
/// child exits first.
async fn read_ready_line(child: &mut tokio::process::Child) -> MtResult<u32> {
    use tokio::io::{AsyncBufReadExt, BufReader};
    let stderr = child.stderr.take().ok_or_else(|| MtError::SpawnError {
        reason: "mthost child had no stderr pipe".to_string(),
    })?;
    let mut lines = BufReader::new(stderr).lines();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);

    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            return Err(MtError::Timeout("mthost did not become ready in time".into()));
        }
        let line = tokio::time::timeout(remaining, lines.next_line())
            .await
            .map_err(|_| MtError::Timeout("mthost did not become ready in time".into()))?
            .map_err(MtError::Io)?;
        match line {
            None => {
                return Err(MtError::SpawnError {
                    reason: "mthost exited before signaling readiness".to_string(),
                })
            }
            Some(line) => {
                if let Some(rest) = line.strip_prefix("READY ") {
                    let pid = rest
                        .split_whitespace()
                        .next()
                        .and_then(|s| s.parse::<u32>().ok())
                        .ok_or_else(|| MtError::SpawnError {
                            reason: format!("malformed READY line: {line}"),
                        })?;
                    return Ok(pid);
                }
            }
        }
    }
}

async fn connect_with_retry(path: &PathBuf, timeout: Duration) -> MtResult<UnixStream> {
    let deadline = std::time::Instant::now() + timeout;
    loop {
        match UnixStream::connect(path).await {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                if std::time::Instant::now() >= deadline {
                    return Err(MtError::Io(e));
                }
                tokio::time::sleep(Duration::from_millis(25)).await;
            }
        }
    }
}

fn write_beacon(
    path: &PathBuf,
    id: &str,
    pid: u32,
    cols: u16,
    rows: u16,
    socket_path: &PathBuf,
    shell: &str,
) -> MtResult<()> {
    let beacon = crate::beacon::Beacon {
        id: id.to_string(),
        pid,
        cols,
        rows,
        shell: shell.to_string(),
        created_at: SystemTime::now(),
        control_pipe_path: socket_path.to_string_lossy().into_owned(),
    };
    crate::beacon::write(path, &beacon)
}

#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), None).is_ok()
}

#[cfg(not(unix))]
fn process_alive(pid: u32) -> bool {
    let mut system = sysinfo::System::new();
    system.refresh_processes();
    system.process(sysinfo::Pid::from_u32(pid)).is_some()
}

#[cfg(unix)]
fn force_kill(pid: u32) {
    let _ = nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), nix::sys::signal::Signal::SIGKILL);
}

#[cfg(not(unix))]
fn force_kill(pid: u32) {
    let mut system = sysinfo::System::new();
    system.refresh_processes();
    if let Some(process) = system.process(sysinfo::Pid::from_u32(pid)) {
        process.kill();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_is_monotonic_across_counter_increments() {
        let counter = AtomicU64::new(0);
        let a = counter.fetch_add(1, Ordering::Relaxed);
        let b = counter.fetch_add(1, Ordering::Relaxed);
        assert!(b > a);
    }
}
