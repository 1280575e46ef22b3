// JSON bodies of inbound requests and outbound message views

use crate::gateway::model::{CorrelationToken, GroupId, StoredMessage, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// Body of `/app/send/message`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectRequest {
    #[serde(default)]
    pub content: String,
    pub sender_id: Option<UserId>,
    pub receiver_id: Option<UserId>,
    #[serde(default, alias = "tempId")]
    pub correlation_token: CorrelationToken,
}

/// Body of `/app/group/message`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupRequest {
    #[serde(default)]
    pub content: String,
    pub sender_id: Option<UserId>,
    pub group_id: Option<GroupId>,
    #[serde(default, alias = "tempId")]
    pub correlation_token: CorrelationToken,
}

/// Body of `/app/send/image`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentRequest {
    /// Base64 bytes, optionally as a `data:` URL
    #[serde(default)]
    pub file: String,
    #[serde(default)]
    pub file_name: String,
    #[serde(default)]
    pub file_type: String,
    pub file_size: Option<u64>,
    #[serde(alias = "userId")]
    pub sender_id: Option<UserId>,
    /// A user id, or the group id when `is_group` is set
    pub receiver_id: Option<i64>,
    #[serde(default, alias = "tempId")]
    pub correlation_token: CorrelationToken,
    #[serde(default, deserialize_with = "flexible_bool")]
    pub is_group: bool,
}

/// Accepts `true`, `"true"` and `"TRUE"` alike
fn flexible_bool<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Flexible {
        Bool(bool),
        Text(String),
        Null(()),
    }

    Ok(match Flexible::deserialize(deserializer)? {
        Flexible::Bool(b) => b,
        Flexible::Text(s) => s.trim().eq_ignore_ascii_case("true"),
        Flexible::Null(()) => false,
    })
}

/// Addressing half of a message view
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ViewTarget {
    Direct {
        #[serde(rename = "receiverId")]
        receiver_id: UserId,
    },
    Group {
        #[serde(rename = "groupId")]
        group_id: GroupId,
        #[serde(rename = "senderName")]
        sender_name: String,
    },
}

/// Message as delivered to recipients
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageView {
    pub id: i64,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub sender_id: UserId,
    pub correlation_token: CorrelationToken,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(flatten)]
    pub target: ViewTarget,
}

impl MessageView {
    /// Project a persisted message plus delivery metadata
    pub fn project(
        message: &StoredMessage,
        target: ViewTarget,
        correlation_token: &CorrelationToken,
        file_name: Option<&str>,
    ) -> Self {
        Self {
            id: message.id,
            content: message.content.clone(),
            timestamp: message.timestamp,
            sender_id: message.sender_id,
            correlation_token: correlation_token.clone(),
            file_name: file_name.map(str::to_string),
            target,
        }
    }
}
