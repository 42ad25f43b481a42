//! Liveness beacons: one JSON file per session under `<state-dir>/sessions/`,
//! written alongside the control socket so a freshly started parent process
//! can discover and re-adopt sessions left running by a previous parent
//! (`SessionManager::discover_existing_sessions`).

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};

use crate::error::{MtError, MtResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Beacon {
    pub id: String,
    pub pid: u32,
    pub cols: u16,
    pub rows: u16,
    pub shell: String,
    #[serde(with = "system_time_secs")]
    pub created_at: SystemTime,
    pub control_pipe_path: String,
}

mod system_time_secs {
    use std::time::{Duration, SystemTime, UNIX_EPOCH};

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &SystemTime, s: S) -> Result<S::Ok, S::Error> {
        let secs = value
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        s.serialize_u64(secs)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<SystemTime, D::Error> {
        let secs = u64::deserialize(d)?;
        Ok(UNIX_EPOCH + Duration::from_secs(secs))
    }
}

pub fn write(path: &Path, beacon: &Beacon) -> MtResult<()> {
    let json = serde_json::to_vec_pretty(beacon)?;
    std::fs::write(path, json).map_err(MtError::Io)
}

fn read(path: &Path) -> MtResult<Beacon> {
    let bytes = std::fs::read(path).map_err(MtError::Io)?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// List every beacon under `sessions_dir`, dropping (and deleting) entries
/// whose backing socket is gone or whose age exceeds `stale_after` with no
/// live process — a beacon surviving past that point means the owning
/// `mthost` crashed without cleaning up after itself.
pub fn scan(sessions_dir: &Path, stale_after: Duration) -> Vec<Beacon> {
    let mut found = Vec::new();
    let Ok(entries) = std::fs::read_dir(sessions_dir) else {
        return found;
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let Ok(beacon) = read(&path) else { continue };

        let socket_path = PathBuf::from(&beacon.control_pipe_path);
        let age = beacon
            .created_at
            .elapsed()
            .unwrap_or(Duration::ZERO);

        if !socket_path.exists() || (age > stale_after && !process_alive(beacon.pid)) {
            let _ = std::fs::remove_file(&path);
            continue;
        }
        found.push(beacon);
    }
    found
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn beacon_roundtrips_through_json() {
        let beacon = Beacon {
            id: "abc".to_string(),
            pid: 1234,
            cols: 80,
            rows: 24,
            shell: "/bin/bash".to_string(),
            created_at: SystemTime::now(),
            control_pipe_path: "/tmp/sessions/abc.sock".to_string(),
        };
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("abc.json");
        write(&path, &beacon).unwrap();
        let read_back = read(&path).unwrap();
        assert_eq!(read_back.pid, beacon.pid);
        assert_eq!(read_back.control_pipe_path, beacon.control_pipe_path);
    }

    #[test]
    fn scan_removes_beacon_with_missing_socket() {
        let dir = tempfile::tempdir().unwrap();
        let beacon = Beacon {
            id: "s1".to_string(),
            pid: std::process::id(),
            cols: 80,
            rows: 24,
            shell: String::new(),
            created_at: SystemTime::now(),
            control_pipe_path: dir.path().join("does-not-exist.sock").to_string_lossy().into_owned(),
        };
        let beacon_path = dir.path().join("s1.json");
        write(&beacon_path, &beacon).unwrap();

        let found = scan(dir.path(), Duration::from_secs(0));
        assert!(found.is_empty());
        assert!(!beacon_path.exists());
    }

    #[test]
    fn scan_keeps_beacon_with_live_socket() {
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("live.sock");
        std::fs::write(&socket_path, b"").unwrap();
        let beacon = Beacon {
            id: "s2".to_string(),
            pid: std::process::id(),
            cols: 80,
            rows: 24,
            shell: String::new(),
            created_at: SystemTime::now(),
            control_pipe_path: socket_path.to_string_lossy().into_owned(),
        };
        write(&dir.path().join("s2.json"), &beacon).unwrap();

        let found = scan(dir.path(), Duration::from_secs(10));
        assert_eq!(found.len(), 1);
    }
}
