// Domain types shared by the gateway components

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Content stored for messages whose payload is an attachment
pub const FILE_MARKER: &str = "---FILE---";

/// Account identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub i64);

/// Group identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupId(pub i64);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Transport-level connection identifier, assigned after upgrade
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionId(String);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for ConnectionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Authenticated principal resolved from a credential
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub id: UserId,
    pub username: String,
}

impl Identity {
    pub fn new(id: i64, username: impl Into<String>) -> Self {
        Self {
            id: UserId(id),
            username: username.into(),
        }
    }
}

/// Client-chosen token echoed back in acknowledgments.
///
/// Opaque: numbers stay numbers and strings stay strings on the way back.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationToken(pub serde_json::Value);

impl fmt::Display for CorrelationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            serde_json::Value::String(s) => f.write_str(s),
            other => write!(f, "{}", other),
        }
    }
}

impl From<i64> for CorrelationToken {
    fn from(value: i64) -> Self {
        Self(serde_json::Value::from(value))
    }
}

impl From<&str> for CorrelationToken {
    fn from(value: &str) -> Self {
        Self(serde_json::Value::from(value))
    }
}

/// Where a persisted message was addressed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recipient {
    User(UserId),
    Group(GroupId),
}

/// A message before persistence
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub content: String,
    pub sender_id: UserId,
    pub recipient: Recipient,
    pub attachment_id: Option<i64>,
}

/// A persisted, immutable message
#[derive(Debug, Clone, PartialEq)]
pub struct StoredMessage {
    pub id: i64,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub sender_id: UserId,
    pub recipient: Recipient,
    pub attachment_id: Option<i64>,
}

/// Attachment metadata before persistence
#[derive(Debug, Clone)]
pub struct NewAttachment {
    pub stored_name: String,
    pub declared_name: String,
    pub mime_type: String,
    pub byte_size: u64,
    pub storage_location: String,
}

/// Persisted attachment metadata; messages reference it by id
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentRecord {
    pub id: i64,
    pub stored_name: String,
    pub declared_name: String,
    pub mime_type: String,
    pub byte_size: u64,
    pub storage_location: String,
    pub created_at: DateTime<Utc>,
}

/// Group record as known to the store
#[derive(Debug, Clone, PartialEq)]
pub struct Group {
    pub id: GroupId,
    pub name: String,
    pub created_by: UserId,
}

/// Inclusive timestamp range for history queries
#[derive(Debug, Clone, Copy)]
pub struct TimeRange {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

impl TimeRange {
    /// Range ending now and reaching back `hours`
    pub fn last_hours(hours: i64) -> Self {
        let to = Utc::now();
        Self {
            from: to - chrono::Duration::hours(hours),
            to,
        }
    }
}
