//! Fakes shared by the unit tests: an in-memory backend and a push connector
//! that plays scripted connections.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use futures::{stream, StreamExt};
use shared::{
    domain::{
        ConversationId, MessageId, NotificationId, NotificationKind, ParticipantDetails, Role,
        UserId,
    },
    protocol::{
        ConversationRecord, CreateNotificationRequest, MarkMessagesReadRequest, MessageRecord,
        NotificationRecord, SendMessageRequest,
    },
};
use tokio::{sync::mpsc, time::Instant};
use url::Url;

use crate::{
    error::{SyncError, SyncResult},
    live::StreamKind,
    protocol_client::BackendApi,
    transport::{PushConnector, PushFrame, PushStream},
    types::{Message, Notification},
};

pub fn user(id: &str) -> UserId {
    UserId::from(id)
}

pub fn conv(id: &str) -> ConversationId {
    ConversationId::from(id)
}

pub fn at(minute: u32) -> String {
    format!("2024-03-01T10:{minute:02}:00Z")
}

pub fn message_record(
    id: &str,
    conversation_id: &str,
    sender: &str,
    receiver: &str,
    minute: u32,
    read: bool,
) -> MessageRecord {
    MessageRecord {
        id: MessageId::from(id),
        conversation_id: conv(conversation_id),
        sender_id: user(sender),
        sender_name: format!("name-{sender}"),
        sender_role: Role::Doctor,
        receiver_id: user(receiver),
        receiver_name: format!("name-{receiver}"),
        receiver_role: Role::Patient,
        content: format!("content of {id}"),
        created_at: at(minute),
        read,
    }
}

pub fn message(
    id: &str,
    conversation_id: &str,
    sender: &str,
    receiver: &str,
    minute: u32,
    read: bool,
) -> Message {
    Message::try_from(message_record(
        id,
        conversation_id,
        sender,
        receiver,
        minute,
        read,
    ))
    .expect("valid message record")
}

pub fn conversation_record(id: &str, participants: &[&str], unread: u32) -> ConversationRecord {
    ConversationRecord {
        id: conv(id),
        participants: participants.iter().map(|p| user(p)).collect(),
        participant_details: participants
            .iter()
            .map(|p| ParticipantDetails {
                id: user(p),
                name: format!("name-{p}"),
                role: Role::Unknown,
            })
            .collect(),
        last_message: None,
        last_message_time: None,
        unread_count: unread,
    }
}

pub fn notification_record(id: &str, owner: &str, minute: u32, read: bool) -> NotificationRecord {
    NotificationRecord {
        id: NotificationId::from(id),
        user_id: user(owner),
        title: format!("title {id}"),
        message: format!("body {id}"),
        kind: NotificationKind::Info,
        created_at: at(minute),
        read,
        related_entity: None,
    }
}

pub fn notification(id: &str, owner: &str, minute: u32, read: bool) -> Notification {
    Notification::try_from(notification_record(id, owner, minute, read))
        .expect("valid notification record")
}

pub fn message_frame(record: &MessageRecord) -> SyncResult<PushFrame> {
    Ok(PushFrame::Text(
        serde_json::to_string(record).expect("encode message record"),
    ))
}

#[derive(Default)]
pub struct FakeBackendState {
    pub conversations: Vec<ConversationRecord>,
    pub messages: Vec<MessageRecord>,
    pub notifications: Vec<NotificationRecord>,
    pub fail_fetch: bool,
    pub fail_mutations: bool,
    pub next_id: u32,
    pub sent: Vec<SendMessageRequest>,
    pub read_requests: Vec<MarkMessagesReadRequest>,
    pub created: Vec<CreateNotificationRequest>,
    pub removed: Vec<NotificationId>,
    pub notification_reads: Vec<Option<NotificationId>>,
}

#[derive(Default)]
pub struct FakeBackend {
    pub state: Mutex<FakeBackendState>,
}

impl FakeBackend {
    pub fn with_state(state: FakeBackendState) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(state),
        })
    }

    pub fn set_fail_mutations(&self, fail: bool) {
        self.state.lock().expect("fake state").fail_mutations = fail;
    }

    fn check_fetch(&self, endpoint: &str) -> SyncResult<()> {
        if self.state.lock().expect("fake state").fail_fetch {
            return Err(SyncError::request(endpoint, "503 Service Unavailable"));
        }
        Ok(())
    }

    fn check_mutation(&self, endpoint: &str) -> SyncResult<()> {
        if self.state.lock().expect("fake state").fail_mutations {
            return Err(SyncError::request(endpoint, "500 Internal Server Error"));
        }
        Ok(())
    }
}

#[async_trait]
impl BackendApi for FakeBackend {
    async fn list_conversations(&self, _identity: &UserId) -> SyncResult<Vec<ConversationRecord>> {
        self.check_fetch("/messages/conversations")?;
        Ok(self.state.lock().expect("fake state").conversations.clone())
    }

    async fn list_messages(&self, _identity: &UserId) -> SyncResult<Vec<MessageRecord>> {
        self.check_fetch("/messages/user")?;
        Ok(self.state.lock().expect("fake state").messages.clone())
    }

    async fn list_conversation_messages(
        &self,
        conversation_id: &ConversationId,
    ) -> SyncResult<Vec<MessageRecord>> {
        self.check_fetch("/messages/conversation")?;
        Ok(self
            .state
            .lock()
            .expect("fake state")
            .messages
            .iter()
            .filter(|record| &record.conversation_id == conversation_id)
            .cloned()
            .collect())
    }

    async fn list_notifications(&self, _identity: &UserId) -> SyncResult<Vec<NotificationRecord>> {
        self.check_fetch("/notifications")?;
        Ok(self.state.lock().expect("fake state").notifications.clone())
    }

    async fn send_message(&self, request: &SendMessageRequest) -> SyncResult<MessageRecord> {
        self.check_mutation("/messages")?;
        let mut state = self.state.lock().expect("fake state");
        state.next_id += 1;
        let conversation_id = state
            .conversations
            .iter()
            .find(|record| {
                record.participants.contains(&request.sender_id)
                    && record.participants.contains(&request.receiver_id)
            })
            .map(|record| record.id.clone())
            .unwrap_or_else(|| conv(&format!("srv-c-{}", state.next_id)));
        let record = MessageRecord {
            id: MessageId::new(format!("srv-m-{}", state.next_id)),
            conversation_id,
            sender_id: request.sender_id.clone(),
            sender_name: format!("name-{}", request.sender_id),
            sender_role: Role::Patient,
            receiver_id: request.receiver_id.clone(),
            receiver_name: format!("name-{}", request.receiver_id),
            receiver_role: Role::Doctor,
            content: request.content.clone(),
            created_at: at(59),
            read: false,
        };
        state.sent.push(request.clone());
        state.messages.push(record.clone());
        Ok(record)
    }

    async fn mark_messages_read(&self, request: &MarkMessagesReadRequest) -> SyncResult<()> {
        self.check_mutation("/messages/read")?;
        self.state
            .lock()
            .expect("fake state")
            .read_requests
            .push(request.clone());
        Ok(())
    }

    async fn create_notification(
        &self,
        request: &CreateNotificationRequest,
    ) -> SyncResult<NotificationRecord> {
        self.check_mutation("/notifications")?;
        let mut state = self.state.lock().expect("fake state");
        state.created.push(request.clone());
        let record = NotificationRecord {
            id: request.id.clone(),
            user_id: request.user_id.clone(),
            title: request.title.clone(),
            message: request.message.clone(),
            kind: request.kind,
            created_at: at(58),
            read: false,
            related_entity: request.related_entity.clone(),
        };
        state.notifications.push(record.clone());
        Ok(record)
    }

    async fn mark_notification_read(&self, notification_id: &NotificationId) -> SyncResult<()> {
        self.check_mutation("/notifications/read")?;
        self.state
            .lock()
            .expect("fake state")
            .notification_reads
            .push(Some(notification_id.clone()));
        Ok(())
    }

    async fn mark_all_notifications_read(&self, _identity: &UserId) -> SyncResult<()> {
        self.check_mutation("/notifications/read-all")?;
        self.state
            .lock()
            .expect("fake state")
            .notification_reads
            .push(None);
        Ok(())
    }

    async fn remove_notification(&self, notification_id: &NotificationId) -> SyncResult<()> {
        self.check_mutation("/notifications/delete")?;
        self.state
            .lock()
            .expect("fake state")
            .removed
            .push(notification_id.clone());
        Ok(())
    }
}

pub enum Script {
    /// Connect attempt fails.
    Refuse,
    /// Deliver these frames, then end the stream as a server close would.
    Frames(Vec<SyncResult<PushFrame>>),
    /// Deliver whatever the test sends; ends when the sender is dropped.
    Live(mpsc::UnboundedReceiver<SyncResult<PushFrame>>),
}

#[derive(Debug, Clone)]
pub struct Attempt {
    pub kind: StreamKind,
    pub url: Url,
    pub at: Instant,
}

#[derive(Default)]
struct ConnectionCounts {
    open: HashMap<StreamKind, usize>,
    max_open: HashMap<StreamKind, usize>,
}

struct OpenGuard {
    kind: StreamKind,
    counts: Arc<Mutex<ConnectionCounts>>,
}

impl Drop for OpenGuard {
    fn drop(&mut self) {
        if let Ok(mut counts) = self.counts.lock() {
            if let Some(open) = counts.open.get_mut(&self.kind) {
                *open = open.saturating_sub(1);
            }
        }
    }
}

/// Plays queued scripts per stream kind. With no script queued, a connection
/// is accepted and stays open without delivering anything.
#[derive(Default)]
pub struct ScriptedConnector {
    scripts: Mutex<HashMap<StreamKind, VecDeque<Script>>>,
    attempts: Mutex<Vec<Attempt>>,
    counts: Arc<Mutex<ConnectionCounts>>,
}

impl ScriptedConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push(&self, kind: StreamKind, script: Script) {
        self.scripts
            .lock()
            .expect("scripts")
            .entry(kind)
            .or_default()
            .push_back(script);
    }

    /// Queues a live connection and returns the handle that feeds it.
    pub fn push_live(&self, kind: StreamKind) -> mpsc::UnboundedSender<SyncResult<PushFrame>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.push(kind, Script::Live(rx));
        tx
    }

    pub fn attempts(&self, kind: StreamKind) -> Vec<Attempt> {
        self.attempts
            .lock()
            .expect("attempts")
            .iter()
            .filter(|attempt| attempt.kind == kind)
            .cloned()
            .collect()
    }

    pub fn open_connections(&self, kind: StreamKind) -> usize {
        self.counts
            .lock()
            .expect("counts")
            .open
            .get(&kind)
            .copied()
            .unwrap_or(0)
    }

    pub fn max_concurrent(&self, kind: StreamKind) -> usize {
        self.counts
            .lock()
            .expect("counts")
            .max_open
            .get(&kind)
            .copied()
            .unwrap_or(0)
    }
}

fn kind_of(url: &Url) -> StreamKind {
    if url.path().contains("/notifications/connect/") {
        StreamKind::Notifications
    } else {
        StreamKind::Messages
    }
}

#[async_trait]
impl PushConnector for ScriptedConnector {
    async fn connect(&self, url: &Url) -> SyncResult<PushStream> {
        let kind = kind_of(url);
        self.attempts.lock().expect("attempts").push(Attempt {
            kind,
            url: url.clone(),
            at: Instant::now(),
        });
        let script = self
            .scripts
            .lock()
            .expect("scripts")
            .get_mut(&kind)
            .and_then(VecDeque::pop_front);

        let frames: PushStream = match script {
            Some(Script::Refuse) => {
                return Err(SyncError::Transport(format!("connection refused: {url}")));
            }
            Some(Script::Frames(frames)) => stream::iter(frames).boxed(),
            Some(Script::Live(rx)) => {
                stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|frame| (frame, rx)) })
                    .boxed()
            }
            None => stream::pending().boxed(),
        };

        {
            let mut counts = self.counts.lock().expect("counts");
            let open = {
                let open = counts.open.entry(kind).or_insert(0);
                *open += 1;
                *open
            };
            let max_open = counts.max_open.entry(kind).or_insert(0);
            *max_open = (*max_open).max(open);
        }
        let guard = OpenGuard {
            kind,
            counts: Arc::clone(&self.counts),
        };
        Ok(frames
            .map(move |frame| {
                let _held = &guard;
                frame
            })
            .boxed())
    }
}
