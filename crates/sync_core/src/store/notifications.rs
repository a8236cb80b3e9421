use std::collections::HashSet;

use shared::domain::{NotificationId, UserId};
use tracing::{debug, warn};

use super::{Change, Projection};
use crate::{events::SyncEvent, types::Notification};

#[derive(Debug, Clone)]
pub enum NotificationTransition {
    ReplaceAll(Vec<Notification>),
    MergePage {
        owner: UserId,
        notifications: Vec<Notification>,
    },
    AppendNew(Notification),
    MarkRead {
        owner: UserId,
        notification_id: Option<NotificationId>,
    },
    Remove(NotificationId),
}

/// Notifications owned by a single identity, newest first. The unread
/// counter is the number of held notifications with `read == false`.
#[derive(Debug)]
pub struct NotificationStore {
    owner: UserId,
    entries: Vec<Notification>,
    unread: u32,
}

impl NotificationStore {
    pub fn new(owner: UserId) -> Self {
        Self {
            owner,
            entries: Vec::new(),
            unread: 0,
        }
    }

    pub fn notifications(&self) -> &[Notification] {
        &self.entries
    }

    pub fn get(&self, notification_id: &NotificationId) -> Option<&Notification> {
        self.entries.iter().find(|entry| &entry.id == notification_id)
    }

    pub fn unread_count(&self) -> u32 {
        self.unread
    }

    fn accepts(&self, notification: &Notification) -> bool {
        if notification.owner == self.owner {
            return true;
        }
        warn!(
            notification_id = %notification.id,
            owner = %notification.owner,
            session_owner = %self.owner,
            "dropping notification addressed to another identity"
        );
        false
    }

    fn install(&mut self, notifications: Vec<Notification>, already_read: &HashSet<NotificationId>) {
        let mut entries: Vec<Notification> = Vec::with_capacity(notifications.len());
        for mut notification in notifications {
            if !self.accepts(&notification) {
                continue;
            }
            if already_read.contains(&notification.id) {
                notification.read = true;
            }
            if let Some(existing) = entries.iter_mut().find(|known| known.id == notification.id) {
                existing.read |= notification.read;
                continue;
            }
            entries.push(notification);
        }
        entries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        self.entries = entries;
    }

    fn append_new(&mut self, notification: Notification) -> Change<UserId> {
        if !self.accepts(&notification) {
            return Change::None;
        }
        if let Some(existing) = self
            .entries
            .iter_mut()
            .find(|known| known.id == notification.id)
        {
            debug!(notification_id = %notification.id, "duplicate notification delivery merged");
            if notification.read && !existing.read {
                existing.read = true;
                return Change::Owner(self.owner.clone());
            }
            return Change::None;
        }
        let position = self
            .entries
            .iter()
            .position(|known| known.created_at <= notification.created_at)
            .unwrap_or(self.entries.len());
        self.entries.insert(position, notification);
        Change::Owner(self.owner.clone())
    }

    fn mark_read(
        &mut self,
        owner: UserId,
        notification_id: Option<NotificationId>,
    ) -> Change<UserId> {
        if owner != self.owner {
            return Change::None;
        }
        let mut changed = false;
        for entry in self.entries.iter_mut() {
            let targeted = notification_id.as_ref().map_or(true, |id| &entry.id == id);
            if targeted && !entry.read {
                entry.read = true;
                changed = true;
            }
        }
        if changed {
            Change::Owner(owner)
        } else {
            Change::None
        }
    }

    fn remove(&mut self, notification_id: NotificationId) -> Change<UserId> {
        let before = self.entries.len();
        self.entries.retain(|entry| entry.id != notification_id);
        if self.entries.len() == before {
            return Change::None;
        }
        Change::Owner(self.owner.clone())
    }

    fn recompute_unread(&mut self) {
        let unread = self.entries.iter().filter(|entry| !entry.read).count();
        self.unread = u32::try_from(unread).unwrap_or(u32::MAX);
    }
}

impl Projection for NotificationStore {
    type Transition = NotificationTransition;
    type Key = UserId;

    fn apply(&mut self, transition: NotificationTransition) -> Change<UserId> {
        let change = match transition {
            NotificationTransition::ReplaceAll(notifications) => {
                self.install(notifications, &HashSet::new());
                Change::All
            }
            NotificationTransition::MergePage {
                owner,
                notifications,
            } => {
                if owner != self.owner {
                    return Change::None;
                }
                let already_read: HashSet<NotificationId> = self
                    .entries
                    .iter()
                    .filter(|entry| entry.read)
                    .map(|entry| entry.id.clone())
                    .collect();
                let before = self.entries.clone();
                self.install(notifications, &already_read);
                if self.entries == before {
                    Change::None
                } else {
                    Change::Owner(owner)
                }
            }
            NotificationTransition::AppendNew(notification) => self.append_new(notification),
            NotificationTransition::MarkRead {
                owner,
                notification_id,
            } => self.mark_read(owner, notification_id),
            NotificationTransition::Remove(notification_id) => self.remove(notification_id),
        };
        self.recompute_unread();
        change
    }

    fn change_event(change: &Change<UserId>) -> Option<SyncEvent> {
        if change.is_none() {
            None
        } else {
            Some(SyncEvent::NotificationsUpdated)
        }
    }
}

#[cfg(test)]
#[path = "../tests/notification_store_tests.rs"]
mod tests;
