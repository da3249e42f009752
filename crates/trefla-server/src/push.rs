//! Device push notifications.
//!
//! Delivery is best effort: callers log failures and carry on.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PushMessage {
    pub title: String,
    pub body: String,
}

impl PushMessage {
    pub fn new(title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            body: body.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum PushError {
    #[error("Push request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Push gateway rejected the message (status={status}): {body}")]
    Rejected { status: u16, body: String },
}

#[async_trait]
pub trait PushSender: Send + Sync {
    async fn send(&self, device_token: &str, message: &PushMessage) -> Result<(), PushError>;
}

#[derive(Debug, Serialize)]
struct PushBody<'a> {
    to: &'a str,
    notification: &'a PushMessage,
}

/// Posts messages to an FCM-style HTTP gateway.
pub struct HttpPush {
    client: reqwest::Client,
    endpoint: String,
    server_key: Option<String>,
}

impl HttpPush {
    pub fn new(
        endpoint: impl Into<String>,
        server_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, PushError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("trefla-server/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            server_key,
        })
    }
}

#[async_trait]
impl PushSender for HttpPush {
    async fn send(&self, device_token: &str, message: &PushMessage) -> Result<(), PushError> {
        let mut request = self.client.post(&self.endpoint).json(&PushBody {
            to: device_token,
            notification: message,
        });
        if let Some(key) = &self.server_key {
            request = request.header("Authorization", format!("key={key}"));
        }

        let resp = request.send().await?;
        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }

        let body = resp.text().await.unwrap_or_default();
        Err(PushError::Rejected {
            status: status.as_u16(),
            body,
        })
    }
}

/// Used when no push gateway is configured.
pub struct LogPush;

#[async_trait]
impl PushSender for LogPush {
    async fn send(&self, device_token: &str, message: &PushMessage) -> Result<(), PushError> {
        info!(
            token_len = device_token.len(),
            title = %message.title,
            "Push gateway not configured, message not sent"
        );
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn body_uses_gateway_shape() {
        let message = PushMessage::new("Card verified", "Your card XYZ was verified");
        let json = serde_json::to_value(PushBody {
            to: "device-1",
            notification: &message,
        })
        .unwrap();

        assert_eq!(json["to"], "device-1");
        assert_eq!(json["notification"]["title"], "Card verified");
    }

    #[tokio::test]
    async fn log_push_never_fails() {
        let message = PushMessage::new("t", "b");
        assert!(LogPush.send("token", &message).await.is_ok());
    }
}
