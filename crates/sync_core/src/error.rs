use thiserror::Error;

pub type SyncResult<T> = std::result::Result<T, SyncError>;

#[derive(Debug, Error)]
pub enum SyncError {
    /// Push connection dropped or could not be opened. Recovered by the
    /// channel's reconnect loop.
    #[error("live channel transport failure: {0}")]
    Transport(String),
    /// A request/response call to the backend failed.
    #[error("request to {endpoint} failed: {message}")]
    Request { endpoint: String, message: String },
    #[error("malformed payload: {0}")]
    MalformedPayload(String),
    #[error("invalid input: {0}")]
    Validation(String),
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl SyncError {
    pub fn request(endpoint: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Self::Request {
            endpoint: endpoint.into(),
            message: err.to_string(),
        }
    }

    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(value: serde_json::Error) -> Self {
        Self::MalformedPayload(value.to_string())
    }
}
