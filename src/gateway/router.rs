// Message routing: validate, persist, fan out, acknowledge

use crate::gateway::ack::{AckScope, Acknowledger, AttachmentReceipt, PendingAck};
use crate::gateway::address;
use crate::gateway::attachments::AttachmentPipeline;
use crate::gateway::error::GatewayError;
use crate::gateway::fanout::{Payload, Publisher};
use crate::gateway::model::{
    AttachmentRecord, CorrelationToken, GroupId, NewMessage, Recipient, StoredMessage, UserId,
    FILE_MARKER,
};
use crate::gateway::storage::{Directory, Repository};
use crate::gateway::wire::{AttachmentRequest, DirectRequest, GroupRequest, MessageView, ViewTarget};
use std::sync::Arc;

/// Routes inbound sends to their recipients.
///
/// Every call runs to completion on the caller's task.
pub struct MessageRouter {
    repository: Arc<dyn Repository>,
    directory: Arc<dyn Directory>,
    attachments: Arc<AttachmentPipeline>,
    publisher: Arc<dyn Publisher>,
    acks: Acknowledger,
}

impl MessageRouter {
    pub fn new(
        repository: Arc<dyn Repository>,
        directory: Arc<dyn Directory>,
        attachments: Arc<AttachmentPipeline>,
        publisher: Arc<dyn Publisher>,
    ) -> Self {
        Self {
            repository,
            directory,
            attachments,
            acks: Acknowledger::new(publisher.clone()),
            publisher,
        }
    }

    /// Send a direct message
    pub fn route_direct(
        &self,
        sender_id: Option<UserId>,
        receiver_id: Option<UserId>,
        content: &str,
        correlation_token: CorrelationToken,
        attachment: Option<&AttachmentRecord>,
    ) -> Result<StoredMessage, GatewayError> {
        validate_content(content, attachment)?;
        let sender = sender_id.ok_or_else(|| GatewayError::validation("senderId is required"))?;
        let receiver = receiver_id.ok_or_else(|| GatewayError::validation("receiverId is required"))?;

        let mut pending = self.acks.begin(sender, AckScope::Direct, correlation_token);
        if let Some(record) = attachment {
            pending.set_attachment(receipt(record, sender, receiver.0, false));
        }

        self.deliver_direct(pending, sender, receiver, content, attachment)
    }

    /// Send a message to a group
    pub fn route_group(
        &self,
        sender_id: Option<UserId>,
        group_id: Option<GroupId>,
        content: &str,
        correlation_token: CorrelationToken,
        attachment: Option<&AttachmentRecord>,
    ) -> Result<StoredMessage, GatewayError> {
        validate_content(content, attachment)?;
        let sender = sender_id.ok_or_else(|| GatewayError::validation("senderId is required"))?;
        let group = group_id.ok_or_else(|| GatewayError::validation("groupId is required"))?;

        let sender_name = match self.resolve_group_sender(sender, group) {
            Ok(name) => name,
            Err(GatewayError::Persistence(e)) => {
                self.acks.begin(sender, AckScope::Group, correlation_token).failed();
                return Err(e.into());
            }
            Err(e) => return Err(e),
        };

        let mut pending = self.acks.begin(sender, AckScope::Group, correlation_token);
        if let Some(record) = attachment {
            pending.set_attachment(receipt(record, sender, group.0, true));
        }

        self.deliver_group(pending, sender, group, sender_name, content, attachment)
    }

    /// Store an inline attachment once, then deliver it as a direct or group message
    pub fn route_attachment(&self, request: AttachmentRequest) -> Result<StoredMessage, GatewayError> {
        let sender = request
            .sender_id
            .ok_or_else(|| GatewayError::validation("userId is required"))?;
        let target = request
            .receiver_id
            .ok_or_else(|| GatewayError::validation("receiverId is required"))?;
        if request.file.trim().is_empty() {
            return Err(GatewayError::validation("file is required"));
        }
        let bytes = AttachmentPipeline::decode(&request.file)?;
        if let Some(declared) = request.file_size {
            if declared != bytes.len() as u64 {
                tracing::warn!(
                    user_id = %sender,
                    correlation_token = %request.correlation_token,
                    declared,
                    decoded = bytes.len(),
                    "Attachment size differs from fileSize; recording the decoded size"
                );
            }
        }

        let (scope, sender_name) = if request.is_group {
            match self.resolve_group_sender(sender, GroupId(target)) {
                Ok(name) => (AckScope::Group, Some(name)),
                Err(GatewayError::Persistence(e)) => {
                    self.acks
                        .begin(sender, AckScope::Group, request.correlation_token)
                        .failed();
                    return Err(e.into());
                }
                Err(e) => return Err(e),
            }
        } else {
            (AckScope::Direct, None)
        };

        let declared_name = if request.file_name.trim().is_empty() {
            "attachment"
        } else {
            request.file_name.as_str()
        };

        let token = request.correlation_token.clone();
        let mut pending = self.acks.begin(sender, scope, request.correlation_token);

        let record = match self.attachments.store_bytes(&bytes, declared_name, &request.file_type) {
            Ok(record) => record,
            Err(e) => {
                tracing::error!(
                    user_id = %sender,
                    correlation_token = %token,
                    "Failed to store attachment: {}",
                    e
                );
                pending.failed();
                return Err(e);
            }
        };

        pending.set_attachment(receipt(&record, sender, target, request.is_group));

        match sender_name {
            Some(name) => self.deliver_group(pending, sender, GroupId(target), name, FILE_MARKER, Some(&record)),
            None => self.deliver_direct(pending, sender, UserId(target), FILE_MARKER, Some(&record)),
        }
    }

    /// Dispatch a decoded `/app/send/message` body
    pub fn handle_direct(&self, request: DirectRequest) -> Result<StoredMessage, GatewayError> {
        self.route_direct(
            request.sender_id,
            request.receiver_id,
            &request.content,
            request.correlation_token,
            None,
        )
    }

    /// Dispatch a decoded `/app/group/message` body
    pub fn handle_group(&self, request: GroupRequest) -> Result<StoredMessage, GatewayError> {
        self.route_group(
            request.sender_id,
            request.group_id,
            &request.content,
            request.correlation_token,
            None,
        )
    }

    fn resolve_group_sender(&self, sender: UserId, group: GroupId) -> Result<String, GatewayError> {
        self.repository
            .find_group(group)?
            .ok_or(GatewayError::NotFound { kind: "group", id: group.0 })?;

        self.directory
            .display_name(sender)?
            .ok_or(GatewayError::NotFound { kind: "user", id: sender.0 })
    }

    fn deliver_direct(
        &self,
        mut pending: PendingAck,
        sender: UserId,
        receiver: UserId,
        content: &str,
        attachment: Option<&AttachmentRecord>,
    ) -> Result<StoredMessage, GatewayError> {
        let stored = self.persist(&pending, sender, Recipient::User(receiver), content, attachment)?;

        // Self-sends skip the echo
        if sender != receiver {
            let view = MessageView::project(
                &stored,
                ViewTarget::Direct { receiver_id: receiver },
                pending.correlation_token(),
                attachment.map(|a| a.stored_name.as_str()),
            );
            let destination = address::private_queue(receiver);
            self.publisher.publish(&destination, Payload::json(&view));
        }

        tracing::info!(
            user_id = %sender,
            correlation_token = %pending.correlation_token(),
            message_id = stored.id,
            receiver_id = %receiver,
            "Direct message routed"
        );

        pending.set_message_id(stored.id);
        pending.sent();
        Ok(stored)
    }

    fn deliver_group(
        &self,
        mut pending: PendingAck,
        sender: UserId,
        group: GroupId,
        sender_name: String,
        content: &str,
        attachment: Option<&AttachmentRecord>,
    ) -> Result<StoredMessage, GatewayError> {
        let stored = self.persist(&pending, sender, Recipient::Group(group), content, attachment)?;

        let view = MessageView::project(
            &stored,
            ViewTarget::Group {
                group_id: group,
                sender_name,
            },
            pending.correlation_token(),
            attachment.map(|a| a.stored_name.as_str()),
        );
        let destination = address::group_topic(group);
        self.publisher.publish(&destination, Payload::json(&view));

        tracing::info!(
            user_id = %sender,
            correlation_token = %pending.correlation_token(),
            message_id = stored.id,
            group_id = %group,
            "Group message routed"
        );

        pending.set_message_id(stored.id);
        pending.sent();
        Ok(stored)
    }

    /// Persist once. The pending ack reports `failed` when dropped on error.
    fn persist(
        &self,
        pending: &PendingAck,
        sender: UserId,
        recipient: Recipient,
        content: &str,
        attachment: Option<&AttachmentRecord>,
    ) -> Result<StoredMessage, GatewayError> {
        self.repository
            .save_message(NewMessage {
                content: content.to_string(),
                sender_id: sender,
                recipient,
                attachment_id: attachment.map(|a| a.id),
            })
            .map_err(|e| {
                tracing::error!(
                    user_id = %sender,
                    correlation_token = %pending.correlation_token(),
                    "Failed to persist message: {}",
                    e
                );
                GatewayError::from(e)
            })
    }
}

fn validate_content(content: &str, attachment: Option<&AttachmentRecord>) -> Result<(), GatewayError> {
    if content.trim().is_empty() && attachment.is_none() {
        return Err(GatewayError::validation("content cannot be empty"));
    }
    Ok(())
}

fn receipt(record: &AttachmentRecord, sender: UserId, receiver_id: i64, is_group: bool) -> AttachmentReceipt {
    AttachmentReceipt {
        message_id: None,
        file_name: record.stored_name.clone(),
        sender_id: sender,
        receiver_id,
        is_group,
    }
}
