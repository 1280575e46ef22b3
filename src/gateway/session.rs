// Connection-to-identity registry

use crate::gateway::error::StoreError;
use crate::gateway::model::{ConnectionId, Identity, UserId};
use crate::gateway::storage::Directory;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

/// An authenticated connection
#[derive(Debug, Clone)]
pub struct Session {
    pub identity: Identity,
    pub connected_at: DateTime<Utc>,
}

/// Result of removing a connection
#[derive(Debug, Clone, PartialEq)]
pub struct Departure {
    pub identity: Identity,
    /// No other connection of this identity remains
    pub last_session: bool,
}

/// Process-local registry of authenticated connections.
///
/// Both maps are sharded, so unrelated connections never contend on one lock.
/// Durable flag writes for one identity are serialized by `flag_writes`, and each
/// write carries the presence observed while holding that lock.
pub struct SessionRegistry {
    sessions: DashMap<ConnectionId, Session>,
    by_user: DashMap<UserId, HashSet<ConnectionId>>,
    flag_writes: DashMap<UserId, Arc<Mutex<()>>>,
    directory: Arc<dyn Directory>,
}

impl SessionRegistry {
    pub fn new(directory: Arc<dyn Directory>) -> Self {
        Self {
            sessions: DashMap::new(),
            by_user: DashMap::new(),
            flag_writes: DashMap::new(),
            directory,
        }
    }

    /// Bind `identity` to `connection` and set the durable online flag.
    ///
    /// Re-registering the same pair is a no-op apart from the flag write. The map
    /// entry is kept even when the flag write fails.
    pub fn register_online(
        &self,
        connection: &ConnectionId,
        identity: &Identity,
    ) -> Result<(), StoreError> {
        let previous = self.sessions.insert(
            connection.clone(),
            Session {
                identity: identity.clone(),
                connected_at: Utc::now(),
            },
        );

        // A connection carries at most one identity
        if let Some(previous) = previous {
            if previous.identity.id != identity.id && self.forget(&previous.identity.id, connection) {
                if let Err(e) = self.sync_flag(previous.identity.id) {
                    tracing::error!(
                        connection_id = %connection,
                        user_id = %previous.identity.id,
                        "Failed to clear online flag: {}",
                        e
                    );
                }
            }
        }

        self.by_user
            .entry(identity.id)
            .or_default()
            .insert(connection.clone());

        tracing::info!(
            connection_id = %connection,
            user_id = %identity.id,
            "Session registered"
        );

        self.sync_flag(identity.id)
    }

    /// Identity bound to `connection`; in-memory only
    pub fn lookup_identity(&self, connection: &ConnectionId) -> Option<Identity> {
        self.sessions
            .get(connection)
            .map(|session| session.identity.clone())
    }

    /// Remove `connection`. `None` when it was never registered.
    ///
    /// The durable flag is cleared once the identity has no connection left.
    pub fn remove_online(&self, connection: &ConnectionId) -> Option<Departure> {
        let (_, session) = self.sessions.remove(connection)?;
        let identity = session.identity;
        let last_session = self.forget(&identity.id, connection);

        if last_session {
            if let Err(e) = self.sync_flag(identity.id) {
                tracing::error!(
                    connection_id = %connection,
                    user_id = %identity.id,
                    "Failed to clear online flag: {}",
                    e
                );
            }
        }

        tracing::info!(
            connection_id = %connection,
            user_id = %identity.id,
            last_session,
            "Session removed"
        );

        Some(Departure {
            identity,
            last_session,
        })
    }

    /// Whether `user` has at least one registered connection
    pub fn is_present(&self, user: UserId) -> bool {
        self.by_user
            .get(&user)
            .map(|c| !c.is_empty())
            .unwrap_or(false)
    }

    pub fn connections_of(&self, user: UserId) -> Vec<ConnectionId> {
        self.by_user
            .get(&user)
            .map(|c| c.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Drop `connection` from the reverse map; true when it was the last one
    fn forget(&self, user: &UserId, connection: &ConnectionId) -> bool {
        match self.by_user.entry(*user) {
            Entry::Occupied(mut entry) => {
                entry.get_mut().remove(connection);
                if entry.get().is_empty() {
                    entry.remove();
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(_) => true,
        }
    }

    /// Write the durable flag of `user` from the registry's current state.
    ///
    /// The last writer for a user always observes the last membership change.
    fn sync_flag(&self, user: UserId) -> Result<(), StoreError> {
        let lock = self.flag_writes.entry(user).or_default().clone();
        let _serialized = lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        self.directory.set_online(user, self.is_present(user))
    }
}
