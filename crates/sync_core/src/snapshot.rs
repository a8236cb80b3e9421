use std::{collections::HashMap, sync::Arc};

use shared::{
    domain::{ConversationId, UserId},
    protocol::{ConversationRecord, MessageRecord, NotificationRecord},
};
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use crate::{
    error::SyncResult,
    events::SyncEvent,
    protocol_client::BackendApi,
    store::MessagingSnapshot,
    types::{Conversation, Message, Notification},
};

/// One-shot fetch of the authoritative state for an identity.
///
/// The `load_*` methods fail open: a failed fetch yields an empty snapshot
/// and is reported on the event bus instead of being returned.
pub struct SnapshotLoader {
    api: Arc<dyn BackendApi>,
    events: broadcast::Sender<SyncEvent>,
}

impl SnapshotLoader {
    pub fn new(api: Arc<dyn BackendApi>, events: broadcast::Sender<SyncEvent>) -> Self {
        Self { api, events }
    }

    pub async fn fetch_messaging(&self, identity: &UserId) -> SyncResult<MessagingSnapshot> {
        let conversations = self.api.list_conversations(identity).await?;
        let messages = self.api.list_messages(identity).await?;
        Ok(build_messaging_snapshot(conversations, messages))
    }

    pub async fn load_messaging(&self, identity: &UserId) -> MessagingSnapshot {
        match self.fetch_messaging(identity).await {
            Ok(snapshot) => {
                info!(
                    %identity,
                    conversations = snapshot.conversations.len(),
                    "messaging snapshot loaded"
                );
                snapshot
            }
            Err(err) => {
                self.report(identity, "messaging", &err.to_string());
                MessagingSnapshot::default()
            }
        }
    }

    pub async fn fetch_notifications(&self, identity: &UserId) -> SyncResult<Vec<Notification>> {
        let records = self.api.list_notifications(identity).await?;
        Ok(normalize_notifications(records))
    }

    pub async fn load_notifications(&self, identity: &UserId) -> Vec<Notification> {
        match self.fetch_notifications(identity).await {
            Ok(notifications) => {
                info!(%identity, count = notifications.len(), "notification snapshot loaded");
                notifications
            }
            Err(err) => {
                self.report(identity, "notifications", &err.to_string());
                Vec::new()
            }
        }
    }

    /// Messages of a single conversation, for a key-scoped refresh.
    pub async fn fetch_conversation_page(
        &self,
        conversation_id: &ConversationId,
    ) -> SyncResult<Vec<Message>> {
        let records = self.api.list_conversation_messages(conversation_id).await?;
        let mut grouped = group_messages(records);
        Ok(grouped.remove(conversation_id).unwrap_or_default())
    }

    fn report(&self, identity: &UserId, scope: &str, message: &str) {
        error!(%identity, scope, error = message, "snapshot fetch failed; continuing with empty state");
        let _ = self.events.send(SyncEvent::Error(format!(
            "failed to load {scope} for {identity}: {message}"
        )));
    }
}

pub fn build_messaging_snapshot(
    conversations: Vec<ConversationRecord>,
    messages: Vec<MessageRecord>,
) -> MessagingSnapshot {
    MessagingSnapshot {
        conversations: conversations.into_iter().map(Conversation::from).collect(),
        messages: group_messages(messages),
    }
}

/// Normalizes flat message records and groups them by owning conversation,
/// oldest first within each group.
pub fn group_messages(records: Vec<MessageRecord>) -> HashMap<ConversationId, Vec<Message>> {
    let mut grouped: HashMap<ConversationId, Vec<Message>> = HashMap::new();
    for record in records {
        let message_id = record.id.clone();
        match Message::try_from(record) {
            Ok(message) => grouped
                .entry(message.conversation_id.clone())
                .or_default()
                .push(message),
            Err(err) => warn!(%message_id, %err, "skipping malformed message record"),
        }
    }
    for messages in grouped.values_mut() {
        messages.sort_by_key(|message| message.created_at);
    }
    grouped
}

pub fn normalize_notifications(records: Vec<NotificationRecord>) -> Vec<Notification> {
    records
        .into_iter()
        .filter_map(|record| {
            let notification_id = record.id.clone();
            match Notification::try_from(record) {
                Ok(notification) => Some(notification),
                Err(err) => {
                    warn!(%notification_id, %err, "skipping malformed notification record");
                    None
                }
            }
        })
        .collect()
}

#[cfg(test)]
#[path = "tests/snapshot_tests.rs"]
mod tests;
