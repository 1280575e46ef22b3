// Presence notices on connect and disconnect

use crate::gateway::address;
use crate::gateway::fanout::{Payload, Publisher};
use crate::gateway::model::{ConnectionId, Identity};
use crate::gateway::session::SessionRegistry;
use std::sync::Arc;

pub struct PresenceBroadcaster {
    sessions: Arc<SessionRegistry>,
    publisher: Arc<dyn Publisher>,
}

impl PresenceBroadcaster {
    pub fn new(sessions: Arc<SessionRegistry>, publisher: Arc<dyn Publisher>) -> Self {
        Self {
            sessions,
            publisher,
        }
    }

    /// Register an authenticated connection and announce it.
    ///
    /// A failed online-flag write is logged; the connection stays up.
    pub fn on_connected(&self, connection: &ConnectionId, identity: &Identity) {
        if let Err(e) = self.sessions.register_online(connection, identity) {
            tracing::warn!(
                connection_id = %connection,
                user_id = %identity.id,
                "Failed to record online flag: {}",
                e
            );
        }

        self.publisher.publish(
            address::STATUS,
            Payload::text(format!("{} is online", identity.username)),
        );
    }

    /// Forget a connection; announce offline once the identity's last session is gone
    pub fn on_disconnected(&self, connection: &ConnectionId) {
        match self.sessions.remove_online(connection) {
            Some(departure) if departure.last_session => {
                self.publisher.publish(
                    address::STATUS,
                    Payload::text(format!("{} is offline", departure.identity.username)),
                );
            }
            Some(departure) => {
                tracing::debug!(
                    connection_id = %connection,
                    user_id = %departure.identity.id,
                    "Identity still has other sessions"
                );
            }
            None => {
                tracing::warn!(
                    connection_id = %connection,
                    "Disconnect for connection with no registered identity"
                );
            }
        }
    }
}
