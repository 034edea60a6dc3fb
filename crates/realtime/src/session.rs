use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex, MutexGuard, PoisonError,
    },
};

use shared::{domain::UserId, protocol::ServerFrame};
use tokio::sync::mpsc;

/// Identity of one live transport connection, unique for the process
/// lifetime. Survives as the tie-breaker when a stale close event races a
/// newer session for the same user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnId(u64);

/// Handle to one live connection: its identity plus the sender half of the
/// connection's outbound frame queue. Cloning is cheap; all clones address
/// the same writer task.
#[derive(Debug, Clone)]
pub struct ClientHandle {
    conn_id: ConnId,
    outbound: mpsc::UnboundedSender<ServerFrame>,
}

impl ClientHandle {
    pub fn new(conn_id: ConnId, outbound: mpsc::UnboundedSender<ServerFrame>) -> Self {
        Self { conn_id, outbound }
    }

    pub fn conn_id(&self) -> ConnId {
        self.conn_id
    }

    /// Queues a frame for the connection's writer task. Returns false when
    /// the writer is gone, which callers treat as not-connected.
    pub fn send(&self, frame: ServerFrame) -> bool {
        self.outbound.send(frame).is_ok()
    }
}

/// Live user -> connection map. At most one session per user at any instant;
/// a fresh `register` for a user silently supersedes the previous handle,
/// which is left to drain until its own close event fires.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<UserId, ClientHandle>>,
    next_conn_id: AtomicU64,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn issue_conn_id(&self) -> ConnId {
        ConnId(self.next_conn_id.fetch_add(1, Ordering::Relaxed))
    }

    pub fn register(&self, user_id: UserId, handle: ClientHandle) {
        self.sessions().insert(user_id, handle);
    }

    pub fn lookup(&self, user_id: UserId) -> Option<ClientHandle> {
        self.sessions().get(&user_id).cloned()
    }

    /// Reverse lookup by linear scan over live sessions. O(n), which is fine
    /// at direct-message scale; switch to a secondary index before pointing
    /// a broadcast workload at this.
    pub fn resolve_sender(&self, conn_id: ConnId) -> Option<UserId> {
        self.sessions()
            .iter()
            .find(|(_, handle)| handle.conn_id == conn_id)
            .map(|(user_id, _)| *user_id)
    }

    /// Removes the entry owned by `conn_id` and returns its user. A close
    /// event from a handle that was already superseded no-ops, so a slow
    /// zombie connection can never evict the session that replaced it.
    pub fn unregister(&self, conn_id: ConnId) -> Option<UserId> {
        let mut sessions = self.sessions();
        let user_id = sessions
            .iter()
            .find(|(_, handle)| handle.conn_id == conn_id)
            .map(|(user_id, _)| *user_id)?;
        sessions.remove(&user_id);
        Some(user_id)
    }

    // All registry operations are total; a poisoned lock just means another
    // thread panicked mid-mutation, and the map is still usable.
    fn sessions(&self) -> MutexGuard<'_, HashMap<UserId, ClientHandle>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
