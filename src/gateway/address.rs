// Inbound and outbound addresses

use crate::gateway::model::{GroupId, UserId};

pub const SEND_DIRECT: &str = "/app/send/message";
pub const SEND_IMAGE: &str = "/app/send/image";
pub const SEND_GROUP: &str = "/app/group/message";

/// Shared presence topic
pub const STATUS: &str = "/topic/status";

const USER_PREFIX: &str = "/topic/user/";
const GROUP_PREFIX: &str = "/topic/group/";

/// Per-identity private message queue
pub fn private_queue(user: UserId) -> String {
    format!("{}{}/queue/private", USER_PREFIX, user)
}

/// Acknowledgments for direct sends
pub fn direct_ack(user: UserId) -> String {
    format!("{}{}/queue/ack", USER_PREFIX, user)
}

/// Broadcast topic for a group
pub fn group_topic(group: GroupId) -> String {
    format!("{}{}", GROUP_PREFIX, group)
}

/// Acknowledgments for group sends
pub fn group_ack(user: UserId) -> String {
    format!("{}{}/ack", GROUP_PREFIX, user)
}

/// Owner of a per-identity address, if the address is one.
///
/// Covers `/topic/user/{id}/...` and the group ack `/topic/group/{id}/ack`.
pub fn owner_of(destination: &str) -> Option<UserId> {
    if let Some(id) = destination
        .strip_prefix(GROUP_PREFIX)
        .and_then(|rest| rest.strip_suffix("/ack"))
    {
        return id.parse().ok().map(UserId);
    }

    let rest = destination.strip_prefix(USER_PREFIX)?;
    let (id, _) = rest.split_once('/').unwrap_or((rest, ""));
    id.parse().ok().map(UserId)
}
