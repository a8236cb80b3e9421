use std::sync::Arc;

use shared::domain::{ConversationId, MessageId, NotificationId, ParticipantDetails, UserId};
use tokio::{
    sync::{broadcast, mpsc, watch, Mutex},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    error::SyncResult,
    events::SyncEvent,
    gateway::MutationGateway,
    live::{decode_message, decode_notification, ChannelState, LiveChannel, ReconnectPolicy, StreamKind},
    protocol_client::BackendApi,
    snapshot::SnapshotLoader,
    store::{
        ConversationStore, ConversationTransition, NotificationStore, NotificationTransition,
        Projection, SharedStore,
    },
    transport::PushConnector,
    types::{Conversation, Message, Notification, NotificationDraft},
};

/// Collaborators a session is built from.
#[derive(Clone)]
pub struct SessionDeps {
    pub api: Arc<dyn BackendApi>,
    pub connector: Arc<dyn PushConnector>,
    pub live_base_url: String,
    pub reconnect_policy: ReconnectPolicy,
    pub fold_buffer: usize,
    pub events: broadcast::Sender<SyncEvent>,
}

/// Everything synchronized for one signed-in identity. Dropped state is never
/// persisted; a new identity gets a new session.
pub struct SyncSession {
    identity: UserId,
    conversations: SharedStore<ConversationStore>,
    notifications: SharedStore<NotificationStore>,
    loader: SnapshotLoader,
    gateway: MutationGateway,
    message_channel: Mutex<LiveChannel<Message>>,
    notification_channel: Mutex<LiveChannel<Notification>>,
    fold_tasks: Mutex<Vec<JoinHandle<()>>>,
    events: broadcast::Sender<SyncEvent>,
}

impl SyncSession {
    /// Loads the snapshot into fresh stores, then opens both live channels.
    pub async fn start(identity: UserId, deps: SessionDeps) -> SyncResult<Self> {
        let events = deps.events.clone();
        let conversations = SharedStore::new(ConversationStore::new(identity.clone()), events.clone());
        let notifications = SharedStore::new(NotificationStore::new(identity.clone()), events.clone());
        let loader = SnapshotLoader::new(Arc::clone(&deps.api), events.clone());
        let gateway = MutationGateway::new(
            identity.clone(),
            Arc::clone(&deps.api),
            conversations.clone(),
            notifications.clone(),
            events.clone(),
        );

        let (messaging, notification_list) = tokio::join!(
            loader.load_messaging(&identity),
            loader.load_notifications(&identity)
        );
        conversations
            .apply(ConversationTransition::ReplaceAll(messaging))
            .await;
        notifications
            .apply(NotificationTransition::ReplaceAll(notification_list))
            .await;

        let session = Self {
            message_channel: Mutex::new(LiveChannel::new(
                StreamKind::Messages,
                deps.live_base_url.clone(),
                Arc::clone(&deps.connector),
                deps.reconnect_policy,
                decode_message,
                events.clone(),
            )),
            notification_channel: Mutex::new(LiveChannel::new(
                StreamKind::Notifications,
                deps.live_base_url.clone(),
                Arc::clone(&deps.connector),
                deps.reconnect_policy,
                decode_notification,
                events.clone(),
            )),
            identity,
            conversations,
            notifications,
            loader,
            gateway,
            fold_tasks: Mutex::new(Vec::new()),
            events,
        };
        session.open_channels(deps.fold_buffer.max(1)).await?;
        let _ = session.events.send(SyncEvent::SessionStarted {
            identity: session.identity.clone(),
        });
        info!(identity = %session.identity, "sync session started");
        Ok(session)
    }

    async fn open_channels(&self, fold_buffer: usize) -> SyncResult<()> {
        let (message_tx, message_rx) = mpsc::channel(fold_buffer);
        let (notification_tx, notification_rx) = mpsc::channel(fold_buffer);

        let mut fold_tasks = self.fold_tasks.lock().await;
        fold_tasks.push(spawn_fold(
            self.conversations.clone(),
            message_rx,
            ConversationTransition::AppendNew,
        ));
        fold_tasks.push(spawn_fold(
            self.notifications.clone(),
            notification_rx,
            NotificationTransition::AppendNew,
        ));
        drop(fold_tasks);

        self.message_channel
            .lock()
            .await
            .open(self.identity.clone(), message_tx)
            .await?;
        self.notification_channel
            .lock()
            .await
            .open(self.identity.clone(), notification_tx)
            .await?;
        Ok(())
    }

    /// Closes both channels, cancelling pending reconnects, then waits for
    /// already delivered events to finish folding.
    pub async fn shutdown(&self) {
        self.message_channel.lock().await.close().await;
        self.notification_channel.lock().await.close().await;
        let tasks: Vec<JoinHandle<()>> = self.fold_tasks.lock().await.drain(..).collect();
        for task in tasks {
            if let Err(err) = task.await {
                warn!(identity = %self.identity, %err, "fold task ended abnormally");
            }
        }
        let _ = self.events.send(SyncEvent::SessionEnded {
            identity: self.identity.clone(),
        });
        info!(identity = %self.identity, "sync session ended");
    }

    pub fn identity(&self) -> &UserId {
        &self.identity
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub async fn conversations(&self) -> Vec<Conversation> {
        self.conversations.read(ConversationStore::conversations).await
    }

    pub async fn conversation(&self, conversation_id: &ConversationId) -> Option<Conversation> {
        self.conversations
            .read(|store| store.conversation(conversation_id).cloned())
            .await
    }

    pub async fn messages(&self, conversation_id: &ConversationId) -> Vec<Message> {
        self.conversations
            .read(|store| store.messages(conversation_id).to_vec())
            .await
    }

    pub async fn conversation_unread(&self, conversation_id: &ConversationId) -> u32 {
        self.conversations
            .read(|store| store.unread_count(conversation_id))
            .await
    }

    pub async fn total_unread_messages(&self) -> u32 {
        self.conversations.read(ConversationStore::total_unread).await
    }

    pub async fn notifications(&self) -> Vec<Notification> {
        self.notifications
            .read(|store| store.notifications().to_vec())
            .await
    }

    pub async fn unread_notifications(&self) -> u32 {
        self.notifications.read(NotificationStore::unread_count).await
    }

    pub async fn channel_state(&self, kind: StreamKind) -> ChannelState {
        match kind {
            StreamKind::Messages => self.message_channel.lock().await.state(),
            StreamKind::Notifications => self.notification_channel.lock().await.state(),
        }
    }

    pub async fn watch_channel_state(&self, kind: StreamKind) -> watch::Receiver<ChannelState> {
        match kind {
            StreamKind::Messages => self.message_channel.lock().await.subscribe_state(),
            StreamKind::Notifications => self.notification_channel.lock().await.subscribe_state(),
        }
    }

    pub async fn send_message(&self, receiver_id: &UserId, content: &str) -> SyncResult<Message> {
        self.gateway.send_message(receiver_id, content).await
    }

    pub async fn mark_conversation_read(
        &self,
        conversation_id: &ConversationId,
        message_id: Option<MessageId>,
    ) -> SyncResult<()> {
        self.gateway
            .mark_conversation_read(conversation_id, message_id)
            .await
    }

    pub async fn start_conversation(&self, counterpart: ParticipantDetails) -> ConversationId {
        self.gateway.start_conversation(counterpart).await
    }

    /// Re-fetches one conversation and replaces only its message sequence.
    pub async fn refresh_conversation(&self, conversation_id: &ConversationId) -> SyncResult<()> {
        let page = match self.loader.fetch_conversation_page(conversation_id).await {
            Ok(page) => page,
            Err(err) => {
                warn!(%conversation_id, %err, "conversation refresh failed; keeping current state");
                let _ = self
                    .events
                    .send(SyncEvent::Error(format!("refresh {conversation_id} failed: {err}")));
                return Err(err);
            }
        };
        self.conversations
            .apply(ConversationTransition::MergePage {
                conversation_id: conversation_id.clone(),
                messages: page,
            })
            .await;
        Ok(())
    }

    pub async fn create_notification(&self, draft: NotificationDraft) -> SyncResult<Notification> {
        self.gateway.create_notification(draft).await
    }

    pub async fn remove_notification(&self, notification_id: &NotificationId) -> SyncResult<()> {
        self.gateway.remove_notification(notification_id).await
    }

    pub async fn mark_notification_read(&self, notification_id: &NotificationId) -> SyncResult<()> {
        self.gateway.mark_notification_read(notification_id).await
    }

    pub async fn mark_all_notifications_read(&self) -> SyncResult<()> {
        self.gateway.mark_all_notifications_read().await
    }
}

/// Drains live deliveries into the store, one transition at a time.
fn spawn_fold<P, E>(
    store: SharedStore<P>,
    mut deliveries: mpsc::Receiver<E>,
    to_transition: fn(E) -> P::Transition,
) -> JoinHandle<()>
where
    P: Projection,
    E: Send + 'static,
{
    tokio::spawn(async move {
        while let Some(entity) = deliveries.recv().await {
            store.apply(to_transition(entity)).await;
        }
        debug!("live deliveries exhausted; fold task stopping");
    })
}

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod tests;
