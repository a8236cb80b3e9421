//! Identity-scoped in-memory projections.
//!
//! Each projection is mutated only through its closed transition enum. The
//! [`SharedStore`] wrapper is the single mutation point a session hands to
//! both the live channel fold task and the mutation gateway: the lock is held
//! for exactly one synchronous transition, so transitions apply one at a time
//! in the order they are observed.

use std::sync::Arc;

use tokio::sync::{broadcast, Mutex};

use crate::events::SyncEvent;

mod conversations;
mod notifications;

pub use conversations::{ConversationStore, ConversationTransition, MessagingSnapshot};
pub use notifications::{NotificationStore, NotificationTransition};

/// What a transition touched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change<K> {
    None,
    All,
    Owner(K),
}

impl<K> Change<K> {
    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }
}

pub trait Projection: Send + 'static {
    type Transition: Send;
    type Key: Clone + Send;

    fn apply(&mut self, transition: Self::Transition) -> Change<Self::Key>;

    /// Event announced to subscribers after a transition changed something.
    fn change_event(change: &Change<Self::Key>) -> Option<SyncEvent>;
}

pub struct SharedStore<P: Projection> {
    inner: Arc<Mutex<P>>,
    events: broadcast::Sender<SyncEvent>,
}

impl<P: Projection> Clone for SharedStore<P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            events: self.events.clone(),
        }
    }
}

impl<P: Projection> SharedStore<P> {
    pub fn new(projection: P, events: broadcast::Sender<SyncEvent>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(projection)),
            events,
        }
    }

    pub async fn apply(&self, transition: P::Transition) -> Change<P::Key> {
        let change = {
            let mut guard = self.inner.lock().await;
            guard.apply(transition)
        };
        if let Some(event) = P::change_event(&change) {
            let _ = self.events.send(event);
        }
        change
    }

    pub async fn read<R>(&self, f: impl FnOnce(&P) -> R) -> R {
        let guard = self.inner.lock().await;
        f(&guard)
    }
}
