//! Request/response calls against the portal backend.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use shared::{
    domain::{ConversationId, NotificationId, UserId},
    error::{ApiError, ApiException},
    protocol::{
        ConversationRecord, CreateNotificationRequest, MarkMessagesReadRequest, MessageRecord,
        NotificationRecord, SendMessageRequest,
    },
};
use tracing::debug;

use crate::error::{SyncError, SyncResult};

#[async_trait]
pub trait BackendApi: Send + Sync {
    async fn list_conversations(&self, identity: &UserId) -> SyncResult<Vec<ConversationRecord>>;
    async fn list_messages(&self, identity: &UserId) -> SyncResult<Vec<MessageRecord>>;
    async fn list_conversation_messages(
        &self,
        conversation_id: &ConversationId,
    ) -> SyncResult<Vec<MessageRecord>>;
    async fn list_notifications(&self, identity: &UserId) -> SyncResult<Vec<NotificationRecord>>;
    async fn send_message(&self, request: &SendMessageRequest) -> SyncResult<MessageRecord>;
    async fn mark_messages_read(&self, request: &MarkMessagesReadRequest) -> SyncResult<()>;
    async fn create_notification(
        &self,
        request: &CreateNotificationRequest,
    ) -> SyncResult<NotificationRecord>;
    async fn mark_notification_read(&self, notification_id: &NotificationId) -> SyncResult<()>;
    async fn mark_all_notifications_read(&self, identity: &UserId) -> SyncResult<()>;
    async fn remove_notification(&self, notification_id: &NotificationId) -> SyncResult<()>;
}

pub struct HttpBackend {
    http: Client,
    base_url: String,
}

impl HttpBackend {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> SyncResult<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| SyncError::Config(format!("failed to build http client: {err}")))?;
        Ok(Self::with_client(http, base_url))
    }

    pub fn with_client(http: Client, base_url: impl Into<String>) -> Self {
        let base_url: String = base_url.into();
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    async fn execute(&self, endpoint: &str, request: RequestBuilder) -> SyncResult<Response> {
        let response = request
            .send()
            .await
            .map_err(|err| SyncError::request(endpoint, err))?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        let message = match serde_json::from_str::<ApiError>(&body) {
            Ok(api_error) => ApiException::from(api_error).to_string(),
            Err(_) if body.is_empty() => status.to_string(),
            Err(_) => format!("{status}: {body}"),
        };
        Err(SyncError::request(endpoint, message))
    }

    async fn fetch_json<T: DeserializeOwned>(&self, path: String) -> SyncResult<T> {
        debug!(%path, "fetching");
        let response = self.execute(&path, self.http.get(self.url(&path))).await?;
        response
            .json()
            .await
            .map_err(|err| SyncError::request(path, err))
    }
}

#[async_trait]
impl BackendApi for HttpBackend {
    async fn list_conversations(&self, identity: &UserId) -> SyncResult<Vec<ConversationRecord>> {
        self.fetch_json(format!("/messages/conversations/{identity}"))
            .await
    }

    async fn list_messages(&self, identity: &UserId) -> SyncResult<Vec<MessageRecord>> {
        self.fetch_json(format!("/messages/user/{identity}")).await
    }

    async fn list_conversation_messages(
        &self,
        conversation_id: &ConversationId,
    ) -> SyncResult<Vec<MessageRecord>> {
        self.fetch_json(format!("/messages/conversation/{conversation_id}"))
            .await
    }

    async fn list_notifications(&self, identity: &UserId) -> SyncResult<Vec<NotificationRecord>> {
        self.fetch_json(format!("/notifications/{identity}")).await
    }

    async fn send_message(&self, request: &SendMessageRequest) -> SyncResult<MessageRecord> {
        let path = "/messages";
        let response = self
            .execute(path, self.http.post(self.url(path)).json(request))
            .await?;
        response
            .json()
            .await
            .map_err(|err| SyncError::request(path, err))
    }

    async fn mark_messages_read(&self, request: &MarkMessagesReadRequest) -> SyncResult<()> {
        let path = "/messages/read";
        self.execute(path, self.http.patch(self.url(path)).json(request))
            .await?;
        Ok(())
    }

    async fn create_notification(
        &self,
        request: &CreateNotificationRequest,
    ) -> SyncResult<NotificationRecord> {
        let path = "/notifications";
        let response = self
            .execute(path, self.http.post(self.url(path)).json(request))
            .await?;
        response
            .json()
            .await
            .map_err(|err| SyncError::request(path, err))
    }

    async fn mark_notification_read(&self, notification_id: &NotificationId) -> SyncResult<()> {
        let path = format!("/notifications/{notification_id}/read");
        self.execute(&path, self.http.patch(self.url(&path))).await?;
        Ok(())
    }

    async fn mark_all_notifications_read(&self, identity: &UserId) -> SyncResult<()> {
        let path = format!("/notifications/read-all/{identity}");
        self.execute(&path, self.http.patch(self.url(&path))).await?;
        Ok(())
    }

    async fn remove_notification(&self, notification_id: &NotificationId) -> SyncResult<()> {
        let path = format!("/notifications/{notification_id}");
        self.execute(&path, self.http.delete(self.url(&path))).await?;
        Ok(())
    }
}

#[cfg(test)]
#[path = "tests/protocol_client_tests.rs"]
mod tests;
