//! Push delivery to device tokens.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Tokens per gateway request.
pub const MAX_MULTICAST_TOKENS: usize = 500;

#[derive(Debug, thiserror::Error)]
pub enum PushError {
    #[error("push gateway request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("push gateway rejected request with status {status}: {body}")]
    Rejected { status: u16, body: String },
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PushMessage {
    pub tokens: Vec<String>,
    pub title: String,
    pub body: String,
    pub data: BTreeMap<String, String>,
}

/// Per-token delivery failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushFailure {
    /// Token is no longer registered and should be forgotten
    Unregistered,
    Other(String),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MulticastResult {
    pub success_count: usize,
    pub failures: Vec<(String, PushFailure)>,
}

impl MulticastResult {
    pub fn unregistered_tokens(&self) -> impl Iterator<Item = &str> {
        self.failures
            .iter()
            .filter(|(_, failure)| *failure == PushFailure::Unregistered)
            .map(|(token, _)| token.as_str())
    }
}

#[async_trait]
pub trait PushSender: Send + Sync {
    async fn send_multicast(&self, message: &PushMessage) -> Result<MulticastResult, PushError>;
}

/// Sender used when no gateway is configured: logs and reports success.
pub struct LogPushSender;

#[async_trait]
impl PushSender for LogPushSender {
    async fn send_multicast(&self, message: &PushMessage) -> Result<MulticastResult, PushError> {
        tracing::info!(
            tokens = message.tokens.len(),
            title = %message.title,
            "push delivery skipped, no gateway configured"
        );
        Ok(MulticastResult {
            success_count: message.tokens.len(),
            failures: Vec::new(),
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GatewayResponse {
    #[serde(default)]
    responses: Vec<GatewayTokenResult>,
}

#[derive(Debug, Deserialize)]
struct GatewayTokenResult {
    token: String,
    success: bool,
    #[serde(default)]
    error: Option<String>,
}

/// JSON gateway client: `POST {url}` with a [`PushMessage`] body.
pub struct HttpPushSender {
    client: reqwest::Client,
    url: String,
}

impl HttpPushSender {
    pub fn new(url: &str, timeout: Duration) -> Result<Self, PushError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.to_string(),
        })
    }
}

#[async_trait]
impl PushSender for HttpPushSender {
    async fn send_multicast(&self, message: &PushMessage) -> Result<MulticastResult, PushError> {
        let mut result = MulticastResult::default();
        for tokens in message.tokens.chunks(MAX_MULTICAST_TOKENS) {
            let chunk = PushMessage {
                tokens: tokens.to_vec(),
                ..message.clone()
            };
            let response = self.client.post(&self.url).json(&chunk).send().await?;
            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(PushError::Rejected {
                    status: status.as_u16(),
                    body,
                });
            }
            let parsed: GatewayResponse = response.json().await?;
            for entry in parsed.responses {
                if entry.success {
                    result.success_count += 1;
                    continue;
                }
                let failure = match entry.error.as_deref() {
                    Some("unregistered") | Some("registration-token-not-registered") => {
                        PushFailure::Unregistered
                    }
                    other => PushFailure::Other(other.unwrap_or("unknown").to_string()),
                };
                result.failures.push((entry.token, failure));
            }
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unregistered_tokens_are_singled_out() {
        let result = MulticastResult {
            success_count: 1,
            failures: vec![
                ("t1".to_string(), PushFailure::Unregistered),
                ("t2".to_string(), PushFailure::Other("quota".to_string())),
            ],
        };
        assert_eq!(result.unregistered_tokens().collect::<Vec<_>>(), vec!["t1"]);
    }

    #[test]
    fn test_gateway_response_decodes() {
        let parsed: GatewayResponse = serde_json::from_str(
            r#"{"responses":[{"token":"a","success":true},{"token":"b","success":false,"error":"unregistered"}]}"#,
        )
        .unwrap();
        assert_eq!(parsed.responses.len(), 2);
        assert_eq!(parsed.responses[1].error.as_deref(), Some("unregistered"));
    }

    #[tokio::test]
    async fn test_log_sender_reports_success() {
        let message = PushMessage {
            tokens: vec!["a".to_string(), "b".to_string()],
            title: "t".to_string(),
            body: "b".to_string(),
            data: BTreeMap::new(),
        };
        let result = LogPushSender.send_multicast(&message).await.unwrap();
        assert_eq!(result.success_count, 2);
    }
}
