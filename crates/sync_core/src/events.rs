use shared::domain::{ConversationId, UserId};

use crate::live::{ChannelState, StreamKind};

/// Announcements broadcast to subscribers; state itself is read through the
/// session accessors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    SessionStarted { identity: UserId },
    SessionEnded { identity: UserId },
    ConversationsReplaced,
    ConversationUpdated { conversation_id: ConversationId },
    NotificationsUpdated,
    ChannelStateChanged { kind: StreamKind, state: ChannelState },
    /// Non-blocking failure report (snapshot fetch, failed mutation).
    Error(String),
}
