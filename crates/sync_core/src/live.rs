//! Push channel lifecycle.
//!
//! One task owns one push connection and walks
//! `Disconnected -> Connecting -> Streaming -> (Erroring -> Connecting) ->
//! Disconnected`. Parsed entities leave the task over an `mpsc` channel;
//! shutdown is a `watch` signal that also cancels a pending reconnect sleep.

use std::{sync::Arc, time::Duration};

use futures::StreamExt;
use shared::{
    domain::UserId,
    protocol::{MessageRecord, NotificationRecord},
};
use tokio::{
    sync::{broadcast, mpsc, watch},
    task::JoinHandle,
};
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    error::{SyncError, SyncResult},
    events::SyncEvent,
    transport::{websocket_base, PushConnector, PushFrame},
    types::{Message, Notification},
};

pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Messages,
    Notifications,
}

impl StreamKind {
    pub fn path_segment(self) -> &'static str {
        match self {
            Self::Messages => "messages",
            Self::Notifications => "notifications",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Streaming,
    Erroring,
}

/// Delay before the next connection attempt. Retries never stop while the
/// channel is open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectPolicy {
    Fixed(Duration),
    Exponential { initial: Duration, max: Duration },
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::Fixed(DEFAULT_RECONNECT_DELAY)
    }
}

impl ReconnectPolicy {
    /// `attempt` counts failures since the last successful connect, from 0.
    pub fn delay(&self, attempt: u32) -> Duration {
        match *self {
            Self::Fixed(delay) => delay,
            Self::Exponential { initial, max } => {
                let factor = 2u32.saturating_pow(attempt.min(16));
                initial.saturating_mul(factor).min(max)
            }
        }
    }
}

pub fn live_url(base: &str, kind: StreamKind, identity: &UserId) -> SyncResult<Url> {
    let base = websocket_base(base)?;
    let raw = format!("{base}/{}/connect/{identity}", kind.path_segment());
    Url::parse(&raw).map_err(|err| SyncError::Config(format!("invalid live url {raw}: {err}")))
}

pub fn decode_message(text: &str) -> SyncResult<Message> {
    let record: MessageRecord = serde_json::from_str(text)?;
    Message::try_from(record)
}

pub fn decode_notification(text: &str) -> SyncResult<Notification> {
    let record: NotificationRecord = serde_json::from_str(text)?;
    Notification::try_from(record)
}

struct ActiveChannel {
    identity: UserId,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

pub struct LiveChannel<E> {
    kind: StreamKind,
    base_url: String,
    connector: Arc<dyn PushConnector>,
    policy: ReconnectPolicy,
    decode: fn(&str) -> SyncResult<E>,
    state: Arc<watch::Sender<ChannelState>>,
    events: broadcast::Sender<SyncEvent>,
    active: Option<ActiveChannel>,
}

impl<E: Send + 'static> LiveChannel<E> {
    pub fn new(
        kind: StreamKind,
        base_url: impl Into<String>,
        connector: Arc<dyn PushConnector>,
        policy: ReconnectPolicy,
        decode: fn(&str) -> SyncResult<E>,
        events: broadcast::Sender<SyncEvent>,
    ) -> Self {
        let (state, _) = watch::channel(ChannelState::Disconnected);
        Self {
            kind,
            base_url: base_url.into(),
            connector,
            policy,
            decode,
            state: Arc::new(state),
            events,
            active: None,
        }
    }

    pub fn state(&self) -> ChannelState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ChannelState> {
        self.state.subscribe()
    }

    pub fn identity(&self) -> Option<&UserId> {
        self.active.as_ref().map(|active| &active.identity)
    }

    /// Starts streaming for `identity` into `sink`. A channel already open
    /// for another identity is closed first; reopening for the same identity
    /// is a no-op while its task is alive.
    pub async fn open(&mut self, identity: UserId, sink: mpsc::Sender<E>) -> SyncResult<()> {
        if let Some(active) = &self.active {
            if active.identity == identity && !active.task.is_finished() {
                return Ok(());
            }
        }
        self.close().await;

        let url = live_url(&self.base_url, self.kind, &identity)?;
        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = ChannelTask {
            kind: self.kind,
            url,
            connector: Arc::clone(&self.connector),
            policy: self.policy,
            decode: self.decode,
            sink,
            state: Arc::clone(&self.state),
            events: self.events.clone(),
            shutdown: shutdown_rx,
        };
        let task = tokio::spawn(task.run());
        self.active = Some(ActiveChannel {
            identity,
            shutdown,
            task,
        });
        Ok(())
    }

    /// Stops the channel and waits for its task. No reconnect fires after
    /// this returns.
    pub async fn close(&mut self) {
        let Some(active) = self.active.take() else {
            return;
        };
        let _ = active.shutdown.send(true);
        if let Err(err) = active.task.await {
            warn!(kind = ?self.kind, identity = %active.identity, %err, "live channel task ended abnormally");
        }
        publish_state(&self.state, &self.events, self.kind, ChannelState::Disconnected);
    }
}

impl<E> Drop for LiveChannel<E> {
    fn drop(&mut self) {
        if let Some(active) = self.active.take() {
            let _ = active.shutdown.send(true);
            active.task.abort();
        }
    }
}

fn publish_state(
    state: &watch::Sender<ChannelState>,
    events: &broadcast::Sender<SyncEvent>,
    kind: StreamKind,
    next: ChannelState,
) {
    let previous = state.send_replace(next);
    if previous != next {
        let _ = events.send(SyncEvent::ChannelStateChanged { kind, state: next });
    }
}

async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

struct ChannelTask<E> {
    kind: StreamKind,
    url: Url,
    connector: Arc<dyn PushConnector>,
    policy: ReconnectPolicy,
    decode: fn(&str) -> SyncResult<E>,
    sink: mpsc::Sender<E>,
    state: Arc<watch::Sender<ChannelState>>,
    events: broadcast::Sender<SyncEvent>,
    shutdown: watch::Receiver<bool>,
}

impl<E: Send + 'static> ChannelTask<E> {
    fn set_state(&self, next: ChannelState) {
        publish_state(&self.state, &self.events, self.kind, next);
    }

    async fn run(mut self) {
        let mut attempt: u32 = 0;
        'session: loop {
            self.set_state(ChannelState::Connecting);
            let connected = tokio::select! {
                biased;
                _ = shutdown_requested(&mut self.shutdown) => break 'session,
                result = self.connector.connect(&self.url) => result,
            };

            match connected {
                Ok(mut stream) => {
                    attempt = 0;
                    self.set_state(ChannelState::Streaming);
                    info!(kind = ?self.kind, url = %self.url, "live channel streaming");
                    loop {
                        let frame = tokio::select! {
                            biased;
                            _ = shutdown_requested(&mut self.shutdown) => break 'session,
                            frame = stream.next() => frame,
                        };
                        match frame {
                            Some(Ok(PushFrame::Text(text))) => match (self.decode)(&text) {
                                Ok(entity) => {
                                    if self.sink.send(entity).await.is_err() {
                                        debug!(kind = ?self.kind, "live channel sink dropped; stopping");
                                        break 'session;
                                    }
                                }
                                Err(err) => {
                                    warn!(kind = ?self.kind, %err, "dropping malformed live event");
                                }
                            },
                            Some(Ok(PushFrame::Other)) => {}
                            Some(Ok(PushFrame::Close)) | None => {
                                warn!(kind = ?self.kind, "live channel closed by server");
                                break;
                            }
                            Some(Err(err)) => {
                                warn!(kind = ?self.kind, %err, "live channel transport error");
                                break;
                            }
                        }
                    }
                }
                Err(err) => {
                    warn!(kind = ?self.kind, url = %self.url, %err, "live channel connect failed");
                }
            }

            self.set_state(ChannelState::Erroring);
            let delay = self.policy.delay(attempt);
            attempt = attempt.saturating_add(1);
            info!(
                kind = ?self.kind,
                delay_ms = delay.as_millis() as u64,
                attempt,
                "scheduling live channel reconnect"
            );
            tokio::select! {
                biased;
                _ = shutdown_requested(&mut self.shutdown) => break 'session,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        self.set_state(ChannelState::Disconnected);
    }
}

#[cfg(test)]
#[path = "tests/live_tests.rs"]
mod tests;
