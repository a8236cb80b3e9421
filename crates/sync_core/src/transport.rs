use async_trait::async_trait;
use futures::{stream::BoxStream, StreamExt};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use url::Url;

use crate::error::{SyncError, SyncResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushFrame {
    Text(String),
    Close,
    /// Ping, pong and binary frames; carry no entity.
    Other,
}

/// Inbound frames of one open push connection. Dropping the stream closes
/// the connection.
pub type PushStream = BoxStream<'static, SyncResult<PushFrame>>;

#[async_trait]
pub trait PushConnector: Send + Sync {
    async fn connect(&self, url: &Url) -> SyncResult<PushStream>;
}

pub struct WsConnector;

#[async_trait]
impl PushConnector for WsConnector {
    async fn connect(&self, url: &Url) -> SyncResult<PushStream> {
        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|err| SyncError::Transport(format!("failed to connect websocket {url}: {err}")))?;
        let frames = ws_stream.map(|message| match message {
            Ok(Message::Text(text)) => Ok(PushFrame::Text(text)),
            Ok(Message::Close(_)) => Ok(PushFrame::Close),
            Ok(_) => Ok(PushFrame::Other),
            Err(err) => Err(SyncError::Transport(format!("websocket receive failed: {err}"))),
        });
        Ok(frames.boxed())
    }
}

/// Rewrites an `http(s)` base into the matching `ws(s)` scheme.
pub fn websocket_base(http_base: &str) -> SyncResult<String> {
    let trimmed = http_base.trim_end_matches('/');
    if let Some(rest) = trimmed.strip_prefix("https://") {
        Ok(format!("wss://{rest}"))
    } else if let Some(rest) = trimmed.strip_prefix("http://") {
        Ok(format!("ws://{rest}"))
    } else if trimmed.starts_with("ws://") || trimmed.starts_with("wss://") {
        Ok(trimmed.to_string())
    } else {
        Err(SyncError::Config(format!(
            "base url must start with http://, https://, ws:// or wss://: {http_base}"
        )))
    }
}
