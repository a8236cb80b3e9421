//! Write path. Every operation performs the remote call first and folds only
//! what the server confirmed; a failed call leaves local state untouched.

use std::{collections::BTreeSet, sync::Arc};

use shared::{
    domain::{ConversationId, MessageId, NotificationId, ParticipantDetails, UserId},
    protocol::{CreateNotificationRequest, MarkMessagesReadRequest, SendMessageRequest},
};
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::{
    error::{SyncError, SyncResult},
    events::SyncEvent,
    protocol_client::BackendApi,
    store::{
        ConversationStore, ConversationTransition, NotificationStore, NotificationTransition,
        SharedStore,
    },
    types::{Conversation, Message, Notification, NotificationDraft},
};

pub struct MutationGateway {
    identity: UserId,
    api: Arc<dyn BackendApi>,
    conversations: SharedStore<ConversationStore>,
    notifications: SharedStore<NotificationStore>,
    events: broadcast::Sender<SyncEvent>,
}

impl MutationGateway {
    pub fn new(
        identity: UserId,
        api: Arc<dyn BackendApi>,
        conversations: SharedStore<ConversationStore>,
        notifications: SharedStore<NotificationStore>,
        events: broadcast::Sender<SyncEvent>,
    ) -> Self {
        Self {
            identity,
            api,
            conversations,
            notifications,
            events,
        }
    }

    pub async fn send_message(&self, receiver_id: &UserId, content: &str) -> SyncResult<Message> {
        let content = content.trim();
        if content.is_empty() {
            return Err(SyncError::Validation(
                "message content must not be empty".to_string(),
            ));
        }
        let request = SendMessageRequest {
            sender_id: self.identity.clone(),
            receiver_id: receiver_id.clone(),
            content: content.to_string(),
        };
        let record = match self.api.send_message(&request).await {
            Ok(record) => record,
            Err(err) => return Err(self.fail("send message", err)),
        };
        let message = match Message::try_from(record) {
            Ok(message) => message,
            Err(err) => return Err(self.fail("send message", err)),
        };
        info!(message_id = %message.id, conversation_id = %message.conversation_id, "message sent");
        self.conversations
            .apply(ConversationTransition::AppendNew(message.clone()))
            .await;
        Ok(message)
    }

    /// Marks one message, or the whole conversation when `message_id` is
    /// `None`, as read on the server and then locally.
    pub async fn mark_conversation_read(
        &self,
        conversation_id: &ConversationId,
        message_id: Option<MessageId>,
    ) -> SyncResult<()> {
        let request = MarkMessagesReadRequest {
            conversation_id: conversation_id.clone(),
            message_id: message_id.clone(),
            user_id: self.identity.clone(),
        };
        if let Err(err) = self.api.mark_messages_read(&request).await {
            return Err(self.fail("mark conversation read", err));
        }
        self.conversations
            .apply(ConversationTransition::MarkRead {
                conversation_id: conversation_id.clone(),
                message_id,
            })
            .await;
        Ok(())
    }

    /// Returns the conversation already grouping exactly this pair, or
    /// registers a new one under a locally generated id.
    pub async fn start_conversation(&self, counterpart: ParticipantDetails) -> ConversationId {
        let participants: BTreeSet<UserId> = [self.identity.clone(), counterpart.id.clone()]
            .into_iter()
            .collect();
        let existing = self
            .conversations
            .read(|store| {
                store
                    .find_by_participants(&participants)
                    .map(|conversation| conversation.id.clone())
            })
            .await;
        if let Some(conversation_id) = existing {
            return conversation_id;
        }

        let mut conversation = Conversation::new(ConversationId::generate(), participants);
        conversation.participant_details.push(counterpart);
        let conversation_id = conversation.id.clone();
        self.conversations
            .apply(ConversationTransition::StartConversation(conversation))
            .await;
        conversation_id
    }

    pub async fn create_notification(&self, draft: NotificationDraft) -> SyncResult<Notification> {
        let request = CreateNotificationRequest {
            id: NotificationId::generate(),
            user_id: self.identity.clone(),
            title: draft.title,
            message: draft.body,
            kind: draft.kind,
            related_entity: draft.related_entity,
        };
        let record = match self.api.create_notification(&request).await {
            Ok(record) => record,
            Err(err) => return Err(self.fail("create notification", err)),
        };
        let notification = match Notification::try_from(record) {
            Ok(notification) => notification,
            Err(err) => return Err(self.fail("create notification", err)),
        };
        self.notifications
            .apply(NotificationTransition::AppendNew(notification.clone()))
            .await;
        Ok(notification)
    }

    pub async fn remove_notification(&self, notification_id: &NotificationId) -> SyncResult<()> {
        if let Err(err) = self.api.remove_notification(notification_id).await {
            return Err(self.fail("remove notification", err));
        }
        self.notifications
            .apply(NotificationTransition::Remove(notification_id.clone()))
            .await;
        Ok(())
    }

    pub async fn mark_notification_read(&self, notification_id: &NotificationId) -> SyncResult<()> {
        if let Err(err) = self.api.mark_notification_read(notification_id).await {
            return Err(self.fail("mark notification read", err));
        }
        self.notifications
            .apply(NotificationTransition::MarkRead {
                owner: self.identity.clone(),
                notification_id: Some(notification_id.clone()),
            })
            .await;
        Ok(())
    }

    pub async fn mark_all_notifications_read(&self) -> SyncResult<()> {
        if let Err(err) = self.api.mark_all_notifications_read(&self.identity).await {
            return Err(self.fail("mark all notifications read", err));
        }
        self.notifications
            .apply(NotificationTransition::MarkRead {
                owner: self.identity.clone(),
                notification_id: None,
            })
            .await;
        Ok(())
    }

    fn fail(&self, operation: &str, err: SyncError) -> SyncError {
        warn!(identity = %self.identity, operation, %err, "mutation failed; local state unchanged");
        let _ = self
            .events
            .send(SyncEvent::Error(format!("{operation} failed: {err}")));
        err
    }
}

#[cfg(test)]
#[path = "tests/gateway_tests.rs"]
mod tests;
