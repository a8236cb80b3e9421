//! Normalized domain types held by the state stores.
//!
//! Wire records from `shared::protocol` carry textual timestamps; conversion
//! into these types parses them into `DateTime<Utc>` so ordering and
//! last-message comparisons work on real instants.

use std::collections::BTreeSet;

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use shared::{
    domain::{
        ConversationId, MessageId, NotificationId, NotificationKind, ParticipantDetails,
        RelatedEntity, Role, UserId,
    },
    protocol::{ConversationRecord, MessageRecord, NotificationRecord},
};
use tracing::debug;

use crate::error::SyncError;

const NAIVE_TIMESTAMP_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S",
];

/// Parses a server timestamp. Offset-less forms are taken as UTC; a bare
/// integer is epoch milliseconds.
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, SyncError> {
    let raw = raw.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Ok(parsed.with_timezone(&Utc));
    }
    for format in NAIVE_TIMESTAMP_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Ok(Utc.from_utc_datetime(&naive));
        }
    }
    if let Ok(millis) = raw.parse::<i64>() {
        if let Some(parsed) = DateTime::<Utc>::from_timestamp_millis(millis) {
            return Ok(parsed);
        }
    }
    Err(SyncError::MalformedPayload(format!(
        "unrecognized timestamp '{raw}'"
    )))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conversation {
    pub id: ConversationId,
    pub participants: BTreeSet<UserId>,
    pub participant_details: Vec<ParticipantDetails>,
    pub last_message: Option<String>,
    pub last_message_at: Option<DateTime<Utc>>,
    pub unread_count: u32,
}

impl Conversation {
    pub fn new(id: ConversationId, participants: impl IntoIterator<Item = UserId>) -> Self {
        Self {
            id,
            participants: participants.into_iter().collect(),
            participant_details: Vec::new(),
            last_message: None,
            last_message_at: None,
            unread_count: 0,
        }
    }

    /// Builds the grouping for a message whose conversation has not been
    /// seen yet, using the display metadata the message carries.
    pub fn from_message(message: &Message) -> Self {
        let mut conversation = Self::new(
            message.conversation_id.clone(),
            [message.sender_id.clone(), message.receiver_id.clone()],
        );
        conversation.participant_details.push(ParticipantDetails {
            id: message.sender_id.clone(),
            name: message.sender_name.clone(),
            role: message.sender_role,
        });
        if !message.is_self_sent() {
            conversation.participant_details.push(ParticipantDetails {
                id: message.receiver_id.clone(),
                name: message.receiver_name.clone(),
                role: message.receiver_role,
            });
        }
        conversation
    }

    /// Display metadata for the first participant other than `local`.
    pub fn counterpart(&self, local: &UserId) -> Option<&ParticipantDetails> {
        self.participant_details
            .iter()
            .find(|details| &details.id != local)
    }

    pub(crate) fn observe_message(&mut self, message: &Message) {
        let is_newer = self
            .last_message_at
            .map_or(true, |current| message.created_at >= current);
        if is_newer {
            self.last_message = Some(message.content.clone());
            self.last_message_at = Some(message.created_at);
        }
    }
}

impl From<ConversationRecord> for Conversation {
    fn from(record: ConversationRecord) -> Self {
        let last_message_at = record
            .last_message_time
            .as_deref()
            .and_then(|raw| match parse_timestamp(raw) {
                Ok(parsed) => Some(parsed),
                Err(err) => {
                    debug!(conversation_id = %record.id, %err, "dropping unparseable last message time");
                    None
                }
            });
        let mut participants: BTreeSet<UserId> = record.participants.into_iter().collect();
        participants.extend(
            record
                .participant_details
                .iter()
                .map(|details| details.id.clone()),
        );
        Self {
            id: record.id,
            participants,
            participant_details: record.participant_details,
            last_message: record.last_message,
            last_message_at,
            unread_count: record.unread_count,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub sender_name: String,
    pub sender_role: Role,
    pub receiver_id: UserId,
    pub receiver_name: String,
    pub receiver_role: Role,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub read: bool,
}

impl Message {
    pub fn is_self_sent(&self) -> bool {
        self.sender_id == self.receiver_id
    }

    /// Whether this message contributes to `local`'s unread counter.
    pub fn is_unread_for(&self, local: &UserId) -> bool {
        !self.read && &self.receiver_id == local && !self.is_self_sent()
    }
}

impl TryFrom<MessageRecord> for Message {
    type Error = SyncError;

    fn try_from(record: MessageRecord) -> Result<Self, Self::Error> {
        let created_at = parse_timestamp(&record.created_at)?;
        if record.content.trim().is_empty() {
            return Err(SyncError::MalformedPayload(format!(
                "message {} has empty content",
                record.id
            )));
        }
        Ok(Self {
            id: record.id,
            conversation_id: record.conversation_id,
            sender_id: record.sender_id,
            sender_name: record.sender_name,
            sender_role: record.sender_role,
            receiver_id: record.receiver_id,
            receiver_name: record.receiver_name,
            receiver_role: record.receiver_role,
            content: record.content,
            created_at,
            read: record.read,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub id: NotificationId,
    pub owner: UserId,
    pub title: String,
    pub body: String,
    pub kind: NotificationKind,
    pub created_at: DateTime<Utc>,
    pub read: bool,
    pub related_entity: Option<RelatedEntity>,
}

impl TryFrom<NotificationRecord> for Notification {
    type Error = SyncError;

    fn try_from(record: NotificationRecord) -> Result<Self, Self::Error> {
        let created_at = parse_timestamp(&record.created_at)?;
        Ok(Self {
            id: record.id,
            owner: record.user_id,
            title: record.title,
            body: record.message,
            kind: record.kind,
            created_at,
            read: record.read,
            related_entity: record.related_entity,
        })
    }
}

/// Caller-supplied fields for a notification created on this client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationDraft {
    pub title: String,
    pub body: String,
    pub kind: NotificationKind,
    pub related_entity: Option<RelatedEntity>,
}

impl NotificationDraft {
    pub fn new(title: impl Into<String>, body: impl Into<String>, kind: NotificationKind) -> Self {
        Self {
            title: title.into(),
            body: body.into(),
            kind,
            related_entity: None,
        }
    }

    pub fn with_related_entity(mut self, related_entity: RelatedEntity) -> Self {
        self.related_entity = Some(related_entity);
        self
    }
}
