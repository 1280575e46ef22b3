// Persistent state using SQLite
//
// The gateway core only sees the `Repository` and `Directory` traits; `SqliteStore`
// is the default collaborator behind both.

use crate::gateway::error::StoreError;
use crate::gateway::model::{
    AttachmentRecord, Group, GroupId, Identity, NewAttachment, NewMessage, Recipient,
    StoredMessage, TimeRange, UserId,
};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Durable storage for messages, attachments and groups
pub trait Repository: Send + Sync {
    /// Persist a message in a single-row transaction
    fn save_message(&self, message: NewMessage) -> Result<StoredMessage, StoreError>;

    /// Persist attachment metadata
    fn save_attachment(&self, attachment: NewAttachment) -> Result<AttachmentRecord, StoreError>;

    fn find_group(&self, id: GroupId) -> Result<Option<Group>, StoreError>;

    /// Direct messages exchanged between two users, oldest first
    fn messages_between(
        &self,
        a: UserId,
        b: UserId,
        range: TimeRange,
    ) -> Result<Vec<StoredMessage>, StoreError>;

    /// Messages posted to a group, oldest first
    fn group_messages(&self, id: GroupId, range: TimeRange)
        -> Result<Vec<StoredMessage>, StoreError>;
}

/// Account lookups and the durable online flag
pub trait Directory: Send + Sync {
    fn display_name(&self, id: UserId) -> Result<Option<String>, StoreError>;

    fn set_online(&self, id: UserId, online: bool) -> Result<(), StoreError>;
}

/// SQLite-backed store
pub struct SqliteStore {
    db_path: PathBuf,
}

impl SqliteStore {
    /// Open (or create) the store under `base_dir`
    pub fn new(base_dir: &Path) -> Result<Self, StoreError> {
        std::fs::create_dir_all(base_dir)?;

        let store = Self {
            db_path: base_dir.join("hermes.db"),
        };

        store.initialize_db()?;

        Ok(store)
    }

    /// Get database connection
    fn connection(&self) -> Result<Connection, StoreError> {
        let conn = Connection::open(&self.db_path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Ok(conn)
    }

    /// Initialize database schema
    fn initialize_db(&self) -> Result<(), StoreError> {
        let conn = self.connection()?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                username TEXT UNIQUE NOT NULL,
                online INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS groups (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                created_by INTEGER NOT NULL REFERENCES users(id)
            );

            CREATE TABLE IF NOT EXISTS group_members (
                group_id INTEGER NOT NULL REFERENCES groups(id) ON DELETE CASCADE,
                user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                PRIMARY KEY (group_id, user_id)
            );

            CREATE TABLE IF NOT EXISTS attachments (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                stored_name TEXT UNIQUE NOT NULL,
                declared_name TEXT NOT NULL,
                mime_type TEXT NOT NULL,
                byte_size INTEGER NOT NULL,
                storage_location TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                content TEXT NOT NULL,
                timestamp INTEGER NOT NULL,
                sender_id INTEGER NOT NULL,
                receiver_id INTEGER NOT NULL,
                attachment_id INTEGER REFERENCES attachments(id)
            );

            CREATE TABLE IF NOT EXISTS group_messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                content TEXT NOT NULL,
                timestamp INTEGER NOT NULL,
                sender_id INTEGER NOT NULL,
                group_id INTEGER NOT NULL REFERENCES groups(id),
                attachment_id INTEGER REFERENCES attachments(id)
            );

            CREATE INDEX IF NOT EXISTS idx_messages_pair
                ON messages(sender_id, receiver_id, timestamp);
            CREATE INDEX IF NOT EXISTS idx_group_messages_group
                ON group_messages(group_id, timestamp);",
        )?;

        Ok(())
    }

    // ========== Accounts ==========

    /// Create an account record
    pub fn create_user(&self, username: &str) -> Result<Identity, StoreError> {
        let conn = self.connection()?;

        conn.execute(
            "INSERT INTO users (username, online) VALUES (?1, 0)",
            params![username],
        )?;

        Ok(Identity::new(conn.last_insert_rowid(), username))
    }

    pub fn find_user_by_username(&self, username: &str) -> Result<Option<Identity>, StoreError> {
        let conn = self.connection()?;

        let identity = conn
            .query_row(
                "SELECT id, username FROM users WHERE username = ?1",
                params![username],
                |row| Ok(Identity::new(row.get(0)?, row.get::<_, String>(1)?)),
            )
            .optional()?;

        Ok(identity)
    }

    pub fn is_online(&self, id: UserId) -> Result<bool, StoreError> {
        let conn = self.connection()?;

        let online: Option<i64> = conn
            .query_row(
                "SELECT online FROM users WHERE id = ?1",
                params![id.0],
                |row| row.get(0),
            )
            .optional()?;

        online.map(|v| v != 0).ok_or(StoreError::Missing("user"))
    }

    // ========== Groups ==========

    /// Create a group; the creator is always a member
    pub fn create_group(
        &self,
        name: &str,
        created_by: UserId,
        members: &[UserId],
    ) -> Result<Group, StoreError> {
        let mut conn = self.connection()?;
        let tx = conn.transaction()?;

        tx.execute(
            "INSERT INTO groups (name, created_by) VALUES (?1, ?2)",
            params![name, created_by.0],
        )?;
        let group_id = tx.last_insert_rowid();

        for member in std::iter::once(&created_by).chain(members.iter()) {
            tx.execute(
                "INSERT OR IGNORE INTO group_members (group_id, user_id) VALUES (?1, ?2)",
                params![group_id, member.0],
            )?;
        }

        tx.commit()?;

        Ok(Group {
            id: GroupId(group_id),
            name: name.to_string(),
            created_by,
        })
    }

    pub fn group_members(&self, id: GroupId) -> Result<Vec<UserId>, StoreError> {
        let conn = self.connection()?;

        let mut stmt = conn.prepare(
            "SELECT user_id FROM group_members WHERE group_id = ?1 ORDER BY user_id",
        )?;

        let members = stmt
            .query_map(params![id.0], |row| Ok(UserId(row.get(0)?)))?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(members)
    }

    // ========== Attachments ==========

    pub fn get_attachment(&self, id: i64) -> Result<Option<AttachmentRecord>, StoreError> {
        let conn = self.connection()?;

        let record = conn
            .query_row(
                "SELECT id, stored_name, declared_name, mime_type, byte_size, storage_location, created_at
                 FROM attachments WHERE id = ?1",
                params![id],
                attachment_from_row,
            )
            .optional()?;

        Ok(record)
    }

    /// Attachments sent in either direction between two users, oldest first
    pub fn attachments_between(
        &self,
        a: UserId,
        b: UserId,
        range: TimeRange,
    ) -> Result<Vec<AttachmentRecord>, StoreError> {
        let conn = self.connection()?;

        let mut stmt = conn.prepare(
            "SELECT f.id, f.stored_name, f.declared_name, f.mime_type, f.byte_size, f.storage_location, f.created_at
             FROM attachments f
             JOIN messages m ON m.attachment_id = f.id
             WHERE ((m.sender_id = ?1 AND m.receiver_id = ?2) OR (m.sender_id = ?2 AND m.receiver_id = ?1))
               AND m.timestamp BETWEEN ?3 AND ?4
             ORDER BY m.timestamp, m.id",
        )?;

        let records = stmt
            .query_map(
                params![a.0, b.0, range.from.timestamp_millis(), range.to.timestamp_millis()],
                attachment_from_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(records)
    }

    fn query_messages(
        &self,
        sql: &str,
        args: &[&dyn rusqlite::ToSql],
        group: bool,
    ) -> Result<Vec<StoredMessage>, StoreError> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare(sql)?;

        let messages = stmt
            .query_map(args, |row| message_from_row(row, group))?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(messages)
    }
}

impl Repository for SqliteStore {
    fn save_message(&self, message: NewMessage) -> Result<StoredMessage, StoreError> {
        let conn = self.connection()?;
        let timestamp = Utc::now();

        match message.recipient {
            Recipient::User(receiver) => conn.execute(
                "INSERT INTO messages (content, timestamp, sender_id, receiver_id, attachment_id)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    message.content,
                    timestamp.timestamp_millis(),
                    message.sender_id.0,
                    receiver.0,
                    message.attachment_id,
                ],
            )?,
            Recipient::Group(group) => conn.execute(
                "INSERT INTO group_messages (content, timestamp, sender_id, group_id, attachment_id)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    message.content,
                    timestamp.timestamp_millis(),
                    message.sender_id.0,
                    group.0,
                    message.attachment_id,
                ],
            )?,
        };

        Ok(StoredMessage {
            id: conn.last_insert_rowid(),
            content: message.content,
            timestamp: from_millis(timestamp.timestamp_millis()),
            sender_id: message.sender_id,
            recipient: message.recipient,
            attachment_id: message.attachment_id,
        })
    }

    fn save_attachment(&self, attachment: NewAttachment) -> Result<AttachmentRecord, StoreError> {
        let conn = self.connection()?;
        let created_at = from_millis(Utc::now().timestamp_millis());

        conn.execute(
            "INSERT INTO attachments (stored_name, declared_name, mime_type, byte_size, storage_location, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                attachment.stored_name,
                attachment.declared_name,
                attachment.mime_type,
                attachment.byte_size as i64,
                attachment.storage_location,
                created_at.timestamp_millis(),
            ],
        )?;

        Ok(AttachmentRecord {
            id: conn.last_insert_rowid(),
            stored_name: attachment.stored_name,
            declared_name: attachment.declared_name,
            mime_type: attachment.mime_type,
            byte_size: attachment.byte_size,
            storage_location: attachment.storage_location,
            created_at,
        })
    }

    fn find_group(&self, id: GroupId) -> Result<Option<Group>, StoreError> {
        let conn = self.connection()?;

        let group = conn
            .query_row(
                "SELECT id, name, created_by FROM groups WHERE id = ?1",
                params![id.0],
                |row| {
                    Ok(Group {
                        id: GroupId(row.get(0)?),
                        name: row.get(1)?,
                        created_by: UserId(row.get(2)?),
                    })
                },
            )
            .optional()?;

        Ok(group)
    }

    fn messages_between(
        &self,
        a: UserId,
        b: UserId,
        range: TimeRange,
    ) -> Result<Vec<StoredMessage>, StoreError> {
        self.query_messages(
            "SELECT id, content, timestamp, sender_id, receiver_id, attachment_id
             FROM messages
             WHERE ((sender_id = ?1 AND receiver_id = ?2) OR (sender_id = ?2 AND receiver_id = ?1))
               AND timestamp BETWEEN ?3 AND ?4
             ORDER BY timestamp, id",
            &[
                &a.0,
                &b.0,
                &range.from.timestamp_millis(),
                &range.to.timestamp_millis(),
            ],
            false,
        )
    }

    fn group_messages(
        &self,
        id: GroupId,
        range: TimeRange,
    ) -> Result<Vec<StoredMessage>, StoreError> {
        self.query_messages(
            "SELECT id, content, timestamp, sender_id, group_id, attachment_id
             FROM group_messages
             WHERE group_id = ?1 AND timestamp BETWEEN ?2 AND ?3
             ORDER BY timestamp, id",
            &[
                &id.0,
                &range.from.timestamp_millis(),
                &range.to.timestamp_millis(),
            ],
            true,
        )
    }
}

impl Directory for SqliteStore {
    fn display_name(&self, id: UserId) -> Result<Option<String>, StoreError> {
        let conn = self.connection()?;

        let name = conn
            .query_row(
                "SELECT username FROM users WHERE id = ?1",
                params![id.0],
                |row| row.get(0),
            )
            .optional()?;

        Ok(name)
    }

    fn set_online(&self, id: UserId, online: bool) -> Result<(), StoreError> {
        let conn = self.connection()?;

        let updated = conn.execute(
            "UPDATE users SET online = ?1 WHERE id = ?2",
            params![online as i64, id.0],
        )?;

        if updated == 0 {
            return Err(StoreError::Missing("user"));
        }

        Ok(())
    }
}

fn from_millis(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or_default()
}

fn message_from_row(row: &Row<'_>, group: bool) -> rusqlite::Result<StoredMessage> {
    let target: i64 = row.get(4)?;
    let recipient = if group {
        Recipient::Group(GroupId(target))
    } else {
        Recipient::User(UserId(target))
    };

    Ok(StoredMessage {
        id: row.get(0)?,
        content: row.get(1)?,
        timestamp: from_millis(row.get(2)?),
        sender_id: UserId(row.get(3)?),
        recipient,
        attachment_id: row.get(5)?,
    })
}

fn attachment_from_row(row: &Row<'_>) -> rusqlite::Result<AttachmentRecord> {
    Ok(AttachmentRecord {
        id: row.get(0)?,
        stored_name: row.get(1)?,
        declared_name: row.get(2)?,
        mime_type: row.get(3)?,
        byte_size: row.get::<_, i64>(4)? as u64,
        storage_location: row.get(5)?,
        created_at: from_millis(row.get(6)?),
    })
}
