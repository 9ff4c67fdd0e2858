//! Connection Registry
//!
//! The authoritative set of live connection handles. Every operation is a
//! single critical section on one mutex, so a snapshot never observes a
//! half-applied register or removal. The lock is never held across an
//! await point: delivery works on a snapshot copy.
//!
//! Once closed (at hub shutdown) the registry rejects new members, so no
//! handle can slip in after the final drain.
//!
//! Every member carries an eviction token. Removing the member, by any path,
//! cancels it, so the reader that registered the handle stops as soon as the
//! hub lets go of it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio_util::sync::CancellationToken;

use super::error::{HubError, HubResult};
use super::handle::{ConnectionHandle, HandleId};

struct Entry {
    handle: Arc<dyn ConnectionHandle>,
    evicted: CancellationToken,
}

#[derive(Default)]
struct Members {
    handles: HashMap<HandleId, Entry>,
    closed: bool,
}

/// Concurrency-safe set of registered handles
pub struct Registry {
    members: Mutex<Members>,
    max_connections: Option<usize>,
}

impl Registry {
    /// Create a registry, optionally bounded to `max_connections` members
    pub fn new(max_connections: Option<usize>) -> Self {
        Self {
            members: Mutex::new(Members::default()),
            max_connections,
        }
    }

    // Critical sections are single map operations, so the map is consistent
    // even if a holder panicked.
    fn lock(&self) -> MutexGuard<'_, Members> {
        self.members.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a handle and return the token cancelled when it is removed.
    ///
    /// Registering an id that is already present is a no-op and returns the
    /// existing token.
    pub fn register(&self, handle: Arc<dyn ConnectionHandle>) -> HubResult<CancellationToken> {
        let id = handle.id();
        let mut members = self.lock();

        if members.closed {
            return Err(HubError::Closed);
        }
        if let Some(entry) = members.handles.get(&id) {
            return Ok(entry.evicted.clone());
        }
        if let Some(max) = self.max_connections {
            if members.handles.len() >= max {
                return Err(HubError::CapacityExceeded("connection registry"));
            }
        }

        let evicted = CancellationToken::new();
        members.handles.insert(
            id,
            Entry {
                handle,
                evicted: evicted.clone(),
            },
        );
        Ok(evicted)
    }

    /// Remove a handle, returning it if it was present
    pub fn remove(&self, id: HandleId) -> Option<Arc<dyn ConnectionHandle>> {
        let entry = self.lock().handles.remove(&id)?;
        entry.evicted.cancel();
        Some(entry.handle)
    }

    /// Point-in-time copy of the registered handles
    pub fn snapshot(&self) -> Vec<Arc<dyn ConnectionHandle>> {
        self.lock()
            .handles
            .values()
            .map(|entry| Arc::clone(&entry.handle))
            .collect()
    }

    /// Stop accepting registrations and remove every handle, returning what
    /// was registered
    pub fn close(&self) -> Vec<Arc<dyn ConnectionHandle>> {
        let entries: Vec<Entry> = {
            let mut members = self.lock();
            members.closed = true;
            members.handles.drain().map(|(_, entry)| entry).collect()
        };

        entries
            .into_iter()
            .map(|entry| {
                entry.evicted.cancel();
                entry.handle
            })
            .collect()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn contains(&self, id: HandleId) -> bool {
        self.lock().handles.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.lock().handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().handles.is_empty()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new(None)
    }
}
