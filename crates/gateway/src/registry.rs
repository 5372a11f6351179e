use std::collections::{HashMap, VecDeque};
use std::sync::RwLock;
use std::time::SystemTime;

use protocol::{format_duration, format_timestamp, ConnectionHistoryEntry, ConnectionInfo};

/// A live session owned by the registry from `add` until `remove`.
#[derive(Debug, Clone)]
struct SessionRecord {
    id: String,
    remote_addr: String,
    connected_at: SystemTime,
    session_name: Option<String>,
    arguments: Option<String>,
}

impl SessionRecord {
    fn to_info(&self) -> ConnectionInfo {
        ConnectionInfo {
            id: self.id.clone(),
            remote_addr: self.remote_addr.clone(),
            connected_at: format_timestamp(self.connected_at),
            session_name: self.session_name.clone(),
            arguments: self.arguments.clone(),
        }
    }
}

#[derive(Debug, Default)]
struct RegistryInner {
    live: HashMap<String, SessionRecord>,
    /// Newest-first ring, bounded by `max_history`.
    history: VecDeque<ConnectionHistoryEntry>,
}

/// Race-free bookkeeping of live and historical sessions. One lock guards
/// both the live map and the history ring; no operation holds it across an
/// await point.
#[derive(Debug)]
pub(crate) struct SessionRegistry {
    inner: RwLock<RegistryInner>,
    max_history: usize,
}

impl SessionRegistry {
    pub(crate) fn new(max_history: usize) -> Self {
        Self {
            inner: RwLock::new(RegistryInner::default()),
            max_history,
        }
    }

    /// Inserts a live record stamped with the current time. An existing
    /// record under the same id is overwritten; callers keep ids unique by
    /// combining the remote address with a nanosecond timestamp.
    pub(crate) fn add(
        &self,
        id: &str,
        remote_addr: &str,
        session_name: Option<String>,
        arguments: Option<String>,
    ) {
        let record = SessionRecord {
            id: id.to_string(),
            remote_addr: remote_addr.to_string(),
            connected_at: SystemTime::now(),
            session_name,
            arguments,
        };
        let mut inner = self.write();
        inner.live.insert(id.to_string(), record);
    }

    /// Folds the live record into the history ring and deletes it, as one
    /// atomic unit. Removing an unknown id is a no-op.
    pub(crate) fn remove(&self, id: &str) {
        let mut inner = self.write();
        let Some(record) = inner.live.remove(id) else {
            return;
        };
        let disconnected_at = SystemTime::now();
        let elapsed = disconnected_at
            .duration_since(record.connected_at)
            .unwrap_or_default();
        inner.history.push_front(ConnectionHistoryEntry {
            remote_addr: record.remote_addr,
            connected_at: format_timestamp(record.connected_at),
            disconnected_at: Some(format_timestamp(disconnected_at)),
            duration: format_duration(elapsed),
            session_name: record.session_name,
            arguments: record.arguments,
        });
        inner.history.truncate(self.max_history);
    }

    /// Snapshot of all live records, unordered.
    pub(crate) fn list(&self) -> Vec<ConnectionInfo> {
        let inner = self.read();
        inner.live.values().map(SessionRecord::to_info).collect()
    }

    pub(crate) fn count(&self) -> usize {
        self.read().live.len()
    }

    /// Combined snapshot: live sessions first (still-open marker), then the
    /// ring newest-first.
    pub(crate) fn history(&self) -> Vec<ConnectionHistoryEntry> {
        let inner = self.read();
        let mut combined = Vec::with_capacity(inner.live.len() + inner.history.len());
        for record in inner.live.values() {
            combined.push(ConnectionHistoryEntry {
                remote_addr: record.remote_addr.clone(),
                connected_at: format_timestamp(record.connected_at),
                disconnected_at: None,
                duration: format_duration(record.connected_at.elapsed().unwrap_or_default()),
                session_name: record.session_name.clone(),
                arguments: record.arguments.clone(),
            });
        }
        combined.extend(inner.history.iter().cloned());
        combined
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, RegistryInner> {
        self.inner.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, RegistryInner> {
        self.inner.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
