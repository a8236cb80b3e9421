use std::sync::Arc;

use shared::domain::UserId;
use tokio::sync::{broadcast, Mutex};
use tracing::info;

pub mod config;
pub mod error;
pub mod events;
pub mod gateway;
pub mod live;
pub mod protocol_client;
pub mod session;
pub mod snapshot;
pub mod store;
pub mod transport;
pub mod types;

pub use config::{load_settings, SyncSettings};
pub use error::{SyncError, SyncResult};
pub use events::SyncEvent;
pub use live::{ChannelState, ReconnectPolicy, StreamKind};
pub use protocol_client::{BackendApi, HttpBackend};
pub use session::{SessionDeps, SyncSession};
pub use transport::{PushConnector, WsConnector};
pub use types::{Conversation, Message, Notification, NotificationDraft};

/// Owns at most one [`SyncSession`] and swaps it as the signed-in identity
/// changes. Switching identity always tears the previous session down before
/// the next one loads.
pub struct SyncClient {
    settings: SyncSettings,
    api: Arc<dyn BackendApi>,
    connector: Arc<dyn PushConnector>,
    events: broadcast::Sender<SyncEvent>,
    active: Mutex<Option<Arc<SyncSession>>>,
}

impl SyncClient {
    pub fn new(settings: SyncSettings) -> SyncResult<Self> {
        settings.validate()?;
        let api = HttpBackend::new(settings.api_base_url.clone(), settings.request_timeout())?;
        Ok(Self::new_with_dependencies(
            settings,
            Arc::new(api),
            Arc::new(WsConnector),
        ))
    }

    pub fn new_with_dependencies(
        settings: SyncSettings,
        api: Arc<dyn BackendApi>,
        connector: Arc<dyn PushConnector>,
    ) -> Self {
        let (events, _) = broadcast::channel(settings.event_buffer.max(1));
        Self {
            settings,
            api,
            connector,
            events,
            active: Mutex::new(None),
        }
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub async fn session(&self) -> Option<Arc<SyncSession>> {
        self.active.lock().await.clone()
    }

    /// `Some` starts (or keeps) the session for that identity; `None` ends
    /// the current one.
    pub async fn set_identity(
        &self,
        identity: Option<UserId>,
    ) -> SyncResult<Option<Arc<SyncSession>>> {
        let mut active = self.active.lock().await;
        if let (Some(current), Some(next)) = (active.as_ref(), identity.as_ref()) {
            if current.identity() == next {
                return Ok(Some(Arc::clone(current)));
            }
        }

        if let Some(previous) = active.take() {
            info!(identity = %previous.identity(), "tearing down sync session");
            previous.shutdown().await;
        }

        let Some(identity) = identity else {
            return Ok(None);
        };
        let session = Arc::new(SyncSession::start(identity, self.session_deps()).await?);
        *active = Some(Arc::clone(&session));
        Ok(Some(session))
    }

    pub async fn sign_out(&self) {
        let _ = self.set_identity(None).await;
    }

    fn session_deps(&self) -> SessionDeps {
        SessionDeps {
            api: Arc::clone(&self.api),
            connector: Arc::clone(&self.connector),
            live_base_url: self.settings.live_base().to_string(),
            reconnect_policy: self.settings.reconnect_policy(),
            fold_buffer: self.settings.event_buffer,
            events: self.events.clone(),
        }
    }
}

#[cfg(test)]
#[path = "tests/support.rs"]
pub(crate) mod test_support;

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
