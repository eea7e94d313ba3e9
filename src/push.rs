//! Expo push service client.

use async_trait::async_trait;
use regex::Regex;
use reqwest::header::ACCEPT;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;
use std::time::Duration;
use tracing::debug;

pub const EXPO_PUSH_ENDPOINT: &str = "https://exp.host/--/api/v2/push/send";

/// Expo accepts at most this many messages per request.
pub const EXPO_MAX_BATCH: usize = 100;

static EXPO_TOKEN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^Expo(nent)?PushToken\[.+\]$").unwrap());
static UUID_TOKEN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^[a-z\d]{8}-[a-z\d]{4}-[a-z\d]{4}-[a-z\d]{4}-[a-z\d]{12}$").unwrap()
});

/// Syntactic check for an Expo push token. Says nothing about whether the
/// device is still registered.
pub fn is_expo_push_token(token: &str) -> bool {
    EXPO_TOKEN_RE.is_match(token) || UUID_TOKEN_RE.is_match(token)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PushMessage {
    pub to: String,
    pub sound: String,
    pub title: String,
    pub body: String,
    pub data: PushData,
    pub priority: String,
}

/// Event payload delivered to the app alongside the notification.
///
/// Values are strings; `tags` is the JSON-encoded tag array.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PushData {
    pub id: String,
    pub kind: String,
    pub pubkey: String,
    pub content: String,
    pub created_at: String,
    pub tags: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum PushTicket {
    Ok {
        #[serde(default)]
        id: Option<String>,
    },
    Error {
        #[serde(default)]
        message: String,
        #[serde(default)]
        details: Option<TicketDetails>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TicketDetails {
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PushResponse {
    #[serde(default)]
    data: Vec<PushTicket>,
}

#[derive(Debug, thiserror::Error)]
pub enum PushError {
    #[error("push request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("push service returned {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error("unexpected push service response: {0}")]
    Decode(String),
    #[error("push service returned {got} tickets for {sent} messages")]
    MissingTickets { sent: usize, got: usize },
}

/// Sends one batch of push messages and returns one ticket per message.
#[async_trait]
pub trait PushSender: Send + Sync {
    fn max_batch_size(&self) -> usize {
        EXPO_MAX_BATCH
    }

    async fn send_batch(&self, messages: &[PushMessage]) -> Result<Vec<PushTicket>, PushError>;
}

#[derive(Debug, Clone)]
pub struct ExpoClient {
    client: Client,
    endpoint: String,
    access_token: String,
}

impl ExpoClient {
    pub fn new(
        endpoint: impl Into<String>,
        access_token: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, PushError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            access_token: access_token.into(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl PushSender for ExpoClient {
    async fn send_batch(&self, messages: &[PushMessage]) -> Result<Vec<PushTicket>, PushError> {
        debug!("Sending {} push messages to {}", messages.len(), self.endpoint);

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.access_token)
            .header(ACCEPT, "application/json")
            .json(messages)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(PushError::Status { status, body });
        }

        let parsed: PushResponse =
            serde_json::from_str(&body).map_err(|e| PushError::Decode(format!("{e}: {body}")))?;
        Ok(parsed.data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn message(to: &str) -> PushMessage {
        PushMessage {
            to: to.into(),
            sound: "default".into(),
            title: "New note in plus code 8FVC".into(),
            body: "hello".into(),
            data: PushData {
                id: "ev".into(),
                kind: "1".into(),
                pubkey: "pk".into(),
                content: "hello".into(),
                created_at: "1700000000".into(),
                tags: "[]".into(),
            },
            priority: "default".into(),
        }
    }

    #[test]
    fn recognises_expo_token_shapes() {
        assert!(is_expo_push_token("ExponentPushToken[xxxxxxxxxxxxxxxxxxxxxx]"));
        assert!(is_expo_push_token("ExpoPushToken[abc]"));
        assert!(is_expo_push_token("F5741A13-BCDA-434B-A316-5DC0E6FFA94F"));
        assert!(!is_expo_push_token("ExponentPushToken[]"));
        assert!(!is_expo_push_token("tok1"));
        assert!(!is_expo_push_token(""));
        assert!(!is_expo_push_token("ExponentPushToken[abc"));
    }

    #[test]
    fn message_serializes_to_expo_shape() {
        let json = serde_json::to_value(message("ExpoPushToken[a]")).unwrap();
        assert_eq!(json["to"], "ExpoPushToken[a]");
        assert_eq!(json["sound"], "default");
        assert_eq!(json["priority"], "default");
        assert_eq!(json["data"]["createdAt"], "1700000000");
        assert_eq!(json["data"]["kind"], "1");
    }

    #[test]
    fn tickets_deserialize_both_statuses() {
        let tickets: Vec<PushTicket> = serde_json::from_str(
            r#"[{"status":"ok","id":"abc"},
                {"status":"error","message":"not registered","details":{"error":"DeviceNotRegistered"}}]"#,
        )
        .unwrap();
        assert_eq!(tickets[0], PushTicket::Ok { id: Some("abc".into()) });
        match &tickets[1] {
            PushTicket::Error { message, details } => {
                assert_eq!(message, "not registered");
                assert_eq!(
                    details.as_ref().and_then(|d| d.error.as_deref()),
                    Some("DeviceNotRegistered")
                );
            }
            other => panic!("unexpected ticket {other:?}"),
        }
    }

    #[tokio::test]
    async fn sends_batch_with_bearer_auth() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/--/api/v2/push/send"))
            .and(header("authorization", "Bearer secret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": [{"status": "ok", "id": "t1"}, {"status": "ok", "id": "t2"}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = ExpoClient::new(
            format!("{}/--/api/v2/push/send", server.uri()),
            "secret",
            Duration::from_secs(5),
        )
        .unwrap();
        let tickets = client
            .send_batch(&[message("ExpoPushToken[a]"), message("ExpoPushToken[b]")])
            .await
            .unwrap();
        assert_eq!(tickets.len(), 2);
    }

    #[tokio::test]
    async fn non_success_status_is_batch_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).set_body_string("slow down"))
            .mount(&server)
            .await;

        let client = ExpoClient::new(server.uri(), "secret", Duration::from_secs(5)).unwrap();
        let err = client.send_batch(&[message("ExpoPushToken[a]")]).await.unwrap_err();
        match err {
            PushError::Status { status, body } => {
                assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
                assert_eq!(body, "slow down");
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[tokio::test]
    async fn garbage_body_is_decode_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>"))
            .mount(&server)
            .await;

        let client = ExpoClient::new(server.uri(), "secret", Duration::from_secs(5)).unwrap();
        let err = client.send_batch(&[message("ExpoPushToken[a]")]).await.unwrap_err();
        assert!(matches!(err, PushError::Decode(_)));
    }
}
