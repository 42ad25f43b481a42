//! Viewport dimension authority: last-writer-wins, no averaging, no
//! separate geometry negotiation channel — with one refinement. A client
//! is considered "active" for a session if it sent an ACTIVE_HINT for it
//! (tracked by the mux connection, not here); within `ACTIVE_QUIESCE` of
//! the last RESIZE from an active client, a RESIZE from a different,
//! non-active client is rejected rather than clobbering the active
//! client's geometry. Once that window elapses, or once the caller is
//! itself active, last-writer-wins applies as normal.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::ids::SessionId;

const ACTIVE_QUIESCE: Duration = Duration::from_millis(250);

struct Authority {
    client_id: String,
    cols: u16,
    rows: u16,
    last_write: Instant,
}

/// Tracks, per session, which client last set the viewport size and when.
pub struct DimensionAuthority {
    sessions: Mutex<HashMap<SessionId, Authority>>,
}

impl Default for DimensionAuthority {
    fn default() -> Self {
        Self::new()
    }
}

impl DimensionAuthority {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Record a RESIZE request from `client_id`, who is currently flagged
    /// active (`caller_is_active`) or not by the mux connection. Rejected
    /// (returns `false`, no state change) if a *different* client holds
    /// active authority within the quiesce window and the caller isn't
    /// itself active; otherwise accepted, last-writer-wins. The `bool`
    /// returned on acceptance reports whether the recorded geometry
    /// actually changed (the caller should only then forward a RESIZE to
    /// the host process).
    pub fn apply(
        &self,
        session_id: &str,
        client_id: &str,
        cols: u16,
        rows: u16,
        caller_is_active: bool,
    ) -> bool {
        let mut sessions = self.sessions.lock();
        if let Some(existing) = sessions.get(session_id) {
            let holder_is_active = existing.last_write.elapsed() < ACTIVE_QUIESCE;
            let holder_is_other = existing.client_id != client_id;
            if holder_is_active && holder_is_other && !caller_is_active {
                return false;
            }
        }
        let changed = match sessions.get(session_id) {
            Some(existing) => existing.cols != cols || existing.rows != rows,
            None => true,
        };
        sessions.insert(
            session_id.to_string(),
            Authority {
                client_id: client_id.to_string(),
                cols,
                rows,
                last_write: Instant::now(),
            },
        );
        changed
    }

    /// Whether `client_id` currently holds active authority over
    /// `session_id` (wrote within the quiesce window). A session with no
    /// recorded authority, or whose last writer has gone quiet, has no
    /// active holder and is open to any client.
    pub fn is_active_holder(&self, session_id: &str, client_id: &str) -> bool {
        let sessions = self.sessions.lock();
        match sessions.get(session_id) {
            Some(a) => a.client_id == client_id && a.last_write.elapsed() < ACTIVE_QUIESCE,
            None => false,
        }
    }

    pub fn current(&self, session_id: &str) -> Option<(u16, u16)> {
        self.sessions.lock().get(session_id).map(|a| (a.cols, a.rows))
    }

    pub fn remove_session(&self, session_id: &str) {
        self.sessions.lock().remove(session_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_writer_establishes_authority() {
        let authority = DimensionAuthority::new();
        assert!(authority.apply("s1", "client-a", 80, 24, false));
        assert_eq!(authority.current("s1"), Some((80, 24)));
    }

    #[test]
    fn later_active_writer_overrides_earlier_one() {
        let authority = DimensionAuthority::new();
        authority.apply("s1", "client-a", 80, 24, true);
        assert!(authority.apply("s1", "client-b", 120, 40, true));
        assert_eq!(authority.current("s1"), Some((120, 40)));
    }

    #[test]
    fn unchanged_geometry_from_same_client_reports_no_change() {
        let authority = DimensionAuthority::new();
        authority.apply("s1", "client-a", 80, 24, false);
        assert!(!authority.apply("s1", "client-a", 80, 24, false));
    }

    #[test]
    fn quiesced_holder_is_no_longer_considered_active() {
        let authority = DimensionAuthority::new();
        authority.apply("s1", "client-a", 80, 24, false);
        assert!(authority.is_active_holder("s1", "client-a"));
        std::thread::sleep(Duration::from_millis(300));
        assert!(!authority.is_active_holder("s1", "client-a"));
    }

    #[test]
    fn non_active_client_cannot_steal_authority_from_active_holder() {
        let authority = DimensionAuthority::new();
        authority.apply("s1", "client-a", 80, 24, true);
        assert!(!authority.apply("s1", "client-b", 120, 40, false));
        assert_eq!(authority.current("s1"), Some((80, 24)));
    }

    #[test]
    fn non_active_client_can_still_write_once_quiesce_elapses() {
        let authority = DimensionAuthority::new();
        authority.apply("s1", "client-a", 80, 24, true);
        std::thread::sleep(Duration::from_millis(300));
        assert!(authority.apply("s1", "client-b", 120, 40, false));
        assert_eq!(authority.current("s1"), Some((120, 40)));
    }
}
