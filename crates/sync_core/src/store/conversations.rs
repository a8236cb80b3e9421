use std::collections::{BTreeSet, HashMap, HashSet};

use shared::domain::{ConversationId, MessageId, UserId};
use tracing::{debug, warn};

use super::{Change, Projection};
use crate::{
    events::SyncEvent,
    types::{Conversation, Message},
};

/// Full messaging state for one identity, messages already grouped by their
/// owning conversation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessagingSnapshot {
    pub conversations: Vec<Conversation>,
    pub messages: HashMap<ConversationId, Vec<Message>>,
}

impl MessagingSnapshot {
    pub fn is_empty(&self) -> bool {
        self.conversations.is_empty() && self.messages.is_empty()
    }
}

#[derive(Debug, Clone)]
pub enum ConversationTransition {
    ReplaceAll(MessagingSnapshot),
    MergePage {
        conversation_id: ConversationId,
        messages: Vec<Message>,
    },
    AppendNew(Message),
    MarkRead {
        conversation_id: ConversationId,
        message_id: Option<MessageId>,
    },
    StartConversation(Conversation),
}

/// Conversations and their messages as seen by `local`.
///
/// Every conversation's `unread_count` equals the number of its known
/// messages for which [`Message::is_unread_for`] holds; the counter is
/// recomputed from the message set after each transition rather than
/// adjusted incrementally.
#[derive(Debug)]
pub struct ConversationStore {
    local: UserId,
    conversations: HashMap<ConversationId, Conversation>,
    messages: HashMap<ConversationId, Vec<Message>>,
    message_owner: HashMap<MessageId, ConversationId>,
}

impl ConversationStore {
    pub fn new(local: UserId) -> Self {
        Self {
            local,
            conversations: HashMap::new(),
            messages: HashMap::new(),
            message_owner: HashMap::new(),
        }
    }

    pub fn local(&self) -> &UserId {
        &self.local
    }

    /// Conversations ordered by most recent activity; conversations without
    /// any message sort last.
    pub fn conversations(&self) -> Vec<Conversation> {
        let mut list: Vec<Conversation> = self.conversations.values().cloned().collect();
        list.sort_by(|a, b| {
            b.last_message_at
                .cmp(&a.last_message_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        list
    }

    pub fn conversation(&self, conversation_id: &ConversationId) -> Option<&Conversation> {
        self.conversations.get(conversation_id)
    }

    pub fn messages(&self, conversation_id: &ConversationId) -> &[Message] {
        self.messages
            .get(conversation_id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn message(&self, message_id: &MessageId) -> Option<&Message> {
        let owner = self.message_owner.get(message_id)?;
        self.messages
            .get(owner)?
            .iter()
            .find(|message| &message.id == message_id)
    }

    pub fn unread_count(&self, conversation_id: &ConversationId) -> u32 {
        self.conversations
            .get(conversation_id)
            .map_or(0, |conversation| conversation.unread_count)
    }

    pub fn total_unread(&self) -> u32 {
        self.conversations
            .values()
            .map(|conversation| conversation.unread_count)
            .sum()
    }

    pub fn find_by_participants(&self, participants: &BTreeSet<UserId>) -> Option<&Conversation> {
        self.conversations
            .values()
            .filter(|conversation| &conversation.participants == participants)
            .min_by(|a, b| a.id.cmp(&b.id))
    }

    fn replace_all(&mut self, snapshot: MessagingSnapshot) -> Change<ConversationId> {
        self.conversations.clear();
        self.messages.clear();
        self.message_owner.clear();

        for conversation in snapshot.conversations {
            self.conversations
                .insert(conversation.id.clone(), conversation);
        }
        for (conversation_id, messages) in snapshot.messages {
            self.install_sequence(&conversation_id, messages, &HashSet::new());
        }
        let ids: Vec<ConversationId> = self.conversations.keys().cloned().collect();
        for conversation_id in &ids {
            self.recompute_unread(conversation_id);
        }
        Change::All
    }

    fn merge_page(
        &mut self,
        conversation_id: ConversationId,
        page: Vec<Message>,
    ) -> Change<ConversationId> {
        let before = self.conversations.get(&conversation_id).cloned();
        let previous = self.messages.remove(&conversation_id).unwrap_or_default();
        let already_read: HashSet<MessageId> = previous
            .iter()
            .filter(|message| message.read)
            .map(|message| message.id.clone())
            .collect();
        for message in &previous {
            self.message_owner.remove(&message.id);
        }

        self.install_sequence(&conversation_id, page, &already_read);
        if !self.conversations.contains_key(&conversation_id) {
            return Change::None;
        }
        self.refresh_preview(&conversation_id);
        self.recompute_unread(&conversation_id);
        if self.conversations.get(&conversation_id) == before.as_ref()
            && self.messages(&conversation_id) == previous.as_slice()
        {
            return Change::None;
        }
        Change::Owner(conversation_id)
    }

    /// Resets the preview to the newest message held for the conversation.
    /// Leaves it alone when no messages are held.
    fn refresh_preview(&mut self, conversation_id: &ConversationId) {
        let Some(sequence) = self.messages.get(conversation_id) else {
            return;
        };
        let Some(conversation) = self.conversations.get_mut(conversation_id) else {
            return;
        };
        conversation.last_message = None;
        conversation.last_message_at = None;
        for message in sequence {
            conversation.observe_message(message);
        }
    }

    /// Moves a locally started conversation with no messages yet under the
    /// id the server assigned to the first message between its participants.
    fn adopt_pending(&mut self, message: &Message) -> bool {
        let participants: BTreeSet<UserId> =
            [message.sender_id.clone(), message.receiver_id.clone()]
                .into_iter()
                .collect();
        let pending_id = self
            .conversations
            .values()
            .filter(|conversation| {
                conversation.participants == participants
                    && self
                        .messages
                        .get(&conversation.id)
                        .map_or(true, Vec::is_empty)
            })
            .map(|conversation| conversation.id.clone())
            .min();
        let Some(pending_id) = pending_id else {
            return false;
        };
        let Some(mut conversation) = self.conversations.remove(&pending_id) else {
            return false;
        };
        self.messages.remove(&pending_id);
        debug!(
            pending = %pending_id,
            conversation_id = %message.conversation_id,
            "local conversation adopted server id"
        );

        conversation.id = message.conversation_id.clone();
        for details in Conversation::from_message(message).participant_details {
            if !conversation
                .participant_details
                .iter()
                .any(|known| known.id == details.id)
            {
                conversation.participant_details.push(details);
            }
        }
        self.conversations
            .insert(conversation.id.clone(), conversation);
        true
    }

    /// Writes `messages` as the sequence for `conversation_id`, dropping
    /// duplicates and entries that name a different owner.
    fn install_sequence(
        &mut self,
        conversation_id: &ConversationId,
        messages: Vec<Message>,
        already_read: &HashSet<MessageId>,
    ) {
        let mut sequence: Vec<Message> = Vec::with_capacity(messages.len());
        for mut message in messages {
            if &message.conversation_id != conversation_id {
                warn!(
                    message_id = %message.id,
                    expected = %conversation_id,
                    actual = %message.conversation_id,
                    "skipping message filed under the wrong conversation"
                );
                continue;
            }
            if already_read.contains(&message.id) {
                message.read = true;
            }
            if let Some(existing) = sequence.iter_mut().find(|known| known.id == message.id) {
                existing.read |= message.read;
                continue;
            }
            sequence.push(message);
        }
        if sequence.is_empty() {
            return;
        }

        let conversation = self
            .conversations
            .entry(conversation_id.clone())
            .or_insert_with(|| Conversation::from_message(&sequence[0]));
        for message in &sequence {
            conversation.observe_message(message);
            self.message_owner
                .insert(message.id.clone(), conversation_id.clone());
        }
        self.messages.insert(conversation_id.clone(), sequence);
    }

    fn append_new(&mut self, message: Message) -> Change<ConversationId> {
        if let Some(owner) = self.message_owner.get(&message.id).cloned() {
            let mut changed = false;
            if let Some(existing) = self
                .messages
                .get_mut(&owner)
                .and_then(|sequence| sequence.iter_mut().find(|known| known.id == message.id))
            {
                if message.read && !existing.read {
                    existing.read = true;
                    changed = true;
                }
            }
            debug!(message_id = %message.id, conversation_id = %owner, "duplicate message delivery merged");
            if !changed {
                return Change::None;
            }
            self.recompute_unread(&owner);
            return Change::Owner(owner);
        }

        let conversation_id = message.conversation_id.clone();
        let adopted =
            !self.conversations.contains_key(&conversation_id) && self.adopt_pending(&message);
        let conversation = self
            .conversations
            .entry(conversation_id.clone())
            .or_insert_with(|| Conversation::from_message(&message));
        conversation.participants.insert(message.sender_id.clone());
        conversation.participants.insert(message.receiver_id.clone());
        conversation.observe_message(&message);

        self.message_owner
            .insert(message.id.clone(), conversation_id.clone());
        self.messages
            .entry(conversation_id.clone())
            .or_default()
            .push(message);
        self.recompute_unread(&conversation_id);
        if adopted {
            return Change::All;
        }
        Change::Owner(conversation_id)
    }

    fn mark_read(
        &mut self,
        conversation_id: ConversationId,
        message_id: Option<MessageId>,
    ) -> Change<ConversationId> {
        if !self.conversations.contains_key(&conversation_id) {
            return Change::None;
        }
        let mut changed = false;
        if let Some(sequence) = self.messages.get_mut(&conversation_id) {
            for message in sequence.iter_mut() {
                let targeted = message_id.as_ref().map_or(true, |id| &message.id == id);
                if targeted && !message.read {
                    message.read = true;
                    changed = true;
                }
            }
        }
        let before = self.unread_count(&conversation_id);
        self.recompute_unread(&conversation_id);
        if !changed && before == self.unread_count(&conversation_id) {
            return Change::None;
        }
        Change::Owner(conversation_id)
    }

    fn start_conversation(&mut self, conversation: Conversation) -> Change<ConversationId> {
        if self.conversations.contains_key(&conversation.id) {
            return Change::None;
        }
        let conversation_id = conversation.id.clone();
        self.conversations
            .insert(conversation_id.clone(), conversation);
        self.recompute_unread(&conversation_id);
        Change::Owner(conversation_id)
    }

    fn recompute_unread(&mut self, conversation_id: &ConversationId) {
        let unread = self
            .messages
            .get(conversation_id)
            .map_or(0, |sequence| {
                sequence
                    .iter()
                    .filter(|message| message.is_unread_for(&self.local))
                    .count()
            });
        if let Some(conversation) = self.conversations.get_mut(conversation_id) {
            conversation.unread_count = u32::try_from(unread).unwrap_or(u32::MAX);
        }
    }
}

impl Projection for ConversationStore {
    type Transition = ConversationTransition;
    type Key = ConversationId;

    fn apply(&mut self, transition: ConversationTransition) -> Change<ConversationId> {
        match transition {
            ConversationTransition::ReplaceAll(snapshot) => self.replace_all(snapshot),
            ConversationTransition::MergePage {
                conversation_id,
                messages,
            } => self.merge_page(conversation_id, messages),
            ConversationTransition::AppendNew(message) => self.append_new(message),
            ConversationTransition::MarkRead {
                conversation_id,
                message_id,
            } => self.mark_read(conversation_id, message_id),
            ConversationTransition::StartConversation(conversation) => {
                self.start_conversation(conversation)
            }
        }
    }

    fn change_event(change: &Change<ConversationId>) -> Option<SyncEvent> {
        match change {
            Change::None => None,
            Change::All => Some(SyncEvent::ConversationsReplaced),
            Change::Owner(conversation_id) => Some(SyncEvent::ConversationUpdated {
                conversation_id: conversation_id.clone(),
            }),
        }
    }
}

#[cfg(test)]
#[path = "../tests/conversation_store_tests.rs"]
mod tests;
