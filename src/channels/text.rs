//! HTTP text sender: posts Text messages to a JSON gateway.
//!
//! Provider parameters: `url` and `api_key`. The request body is
//! `{from, to, body, reference}` with bearer auth; any non-2xx status is a
//! failed attempt.

use std::time::Duration;

use async_trait::async_trait;
use secrecy::ExposeSecret;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::channels::{MessageSender, SendFailure, SendReceipt};
use crate::model::{DecryptedParameters, Message, MessageContent};

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);
/// Longest gateway error body kept in a diagnostic.
const MAX_DIAGNOSTIC_BODY: usize = 512;

#[derive(Debug, Serialize)]
struct TextRequest<'a> {
    from: &'a str,
    to: &'a str,
    body: &'a str,
    reference: &'a str,
}

/// Delivers Text messages through an HTTP gateway.
pub struct HttpTextSender {
    client: reqwest::Client,
}

impl HttpTextSender {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .unwrap_or_else(|e| {
                warn!(error = %e, "Failed to build HTTP client with timeout, using defaults");
                reqwest::Client::new()
            });
        Self { client }
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl Default for HttpTextSender {
    fn default() -> Self {
        Self::new()
    }
}

/// Pull a provider reference out of a gateway response body, if it has one.
fn reference_from_body(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    ["id", "reference", "message_id"]
        .iter()
        .find_map(|k| value.get(k))
        .and_then(|v| match v {
            serde_json::Value::String(s) => Some(s.clone()),
            serde_json::Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
}

fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[async_trait]
impl MessageSender for HttpTextSender {
    fn name(&self) -> &str {
        "http-text"
    }

    async fn send(
        &self,
        message: &Message,
        params: &DecryptedParameters,
    ) -> Result<SendReceipt, SendFailure> {
        let MessageContent::Text(text) = &message.content else {
            return Err(SendFailure::new(format!(
                "HTTP text sender cannot deliver {} messages",
                message.message_type()
            )));
        };

        let url = params
            .get_str("url")
            .ok_or_else(|| SendFailure::missing_parameter("url"))?;
        let api_key = params
            .get("api_key")
            .filter(|k| !k.expose_secret().is_empty())
            .ok_or_else(|| SendFailure::missing_parameter("api_key"))?;

        let request = TextRequest {
            from: &text.from,
            to: &text.to,
            body: &text.body,
            reference: &message.message_key,
        };

        debug!(message_key = %message.message_key, url, "Posting text message");

        let resp = self
            .client
            .post(url)
            .bearer_auth(api_key.expose_secret())
            .json(&request)
            .send()
            .await
            .map_err(|e| SendFailure::new(format!("text gateway request failed: {e}")))?;

        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();

        if !status.is_success() {
            return Err(SendFailure::new(format!(
                "text gateway returned {status}: {}",
                truncate(&body, MAX_DIAGNOSTIC_BODY)
            )));
        }

        info!(message_key = %message.message_key, %status, "Text accepted by gateway");
        Ok(SendReceipt {
            reference: reference_from_body(&body),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use axum::Router;
    use axum::extract::State;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::post;
    use secrecy::SecretString;
    use tokio::net::TcpListener;

    use super::*;
    use crate::model::{MailContent, TextContent};

    type Captured = Arc<Mutex<Vec<(Option<String>, serde_json::Value)>>>;

    /// Start a fake gateway on a random port that answers with `status`.
    async fn start_gateway(status: StatusCode, reply: &'static str) -> (String, Captured) {
        let captured: Captured = Arc::new(Mutex::new(Vec::new()));
        let app = Router::new()
            .route(
                "/send",
                post(
                    move |State(seen): State<Captured>,
                          headers: HeaderMap,
                          axum::Json(body): axum::Json<serde_json::Value>| async move {
                        let auth = headers
                            .get("authorization")
                            .and_then(|v| v.to_str().ok())
                            .map(str::to_string);
                        seen.lock().unwrap().push((auth, body));
                        (status, reply)
                    },
                ),
            )
            .with_state(Arc::clone(&captured));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        (format!("http://127.0.0.1:{port}/send"), captured)
    }

    fn params(url: &str) -> DecryptedParameters {
        DecryptedParameters::new(vec![
            ("url".into(), SecretString::from(url.to_string())),
            ("api_key".into(), SecretString::from("secret-key".to_string())),
        ])
    }

    fn text_message() -> Message {
        Message::new(
            "sms-1",
            MessageContent::Text(TextContent {
                from: "+15550001".into(),
                to: "+15550002".into(),
                body: "Your code is 1234".into(),
            }),
        )
    }

    #[tokio::test]
    async fn posts_json_with_bearer_auth() {
        let (url, captured) = start_gateway(StatusCode::OK, r#"{"id":"gw-77"}"#).await;

        let receipt = HttpTextSender::new()
            .send(&text_message(), &params(&url))
            .await
            .unwrap();
        assert_eq!(receipt.reference.as_deref(), Some("gw-77"));

        let seen = captured.lock().unwrap();
        assert_eq!(seen.len(), 1);
        let (auth, body) = &seen[0];
        assert_eq!(auth.as_deref(), Some("Bearer secret-key"));
        assert_eq!(body["to"], "+15550002");
        assert_eq!(body["body"], "Your code is 1234");
        assert_eq!(body["reference"], "SMS-1");
    }

    #[tokio::test]
    async fn non_success_status_is_a_failure() {
        let (url, _captured) =
            start_gateway(StatusCode::SERVICE_UNAVAILABLE, "gateway overloaded").await;

        let err = HttpTextSender::new()
            .send(&text_message(), &params(&url))
            .await
            .unwrap_err();
        assert!(err.diagnostic.contains("503"));
        assert!(err.diagnostic.contains("gateway overloaded"));
    }

    #[tokio::test]
    async fn unreachable_gateway_is_a_failure() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = HttpTextSender::new()
            .send(&text_message(), &params(&format!("http://127.0.0.1:{port}/send")))
            .await
            .unwrap_err();
        assert!(err.diagnostic.contains("request failed"));
    }

    #[tokio::test]
    async fn missing_parameters_fail_fast() {
        let sender = HttpTextSender::new();
        let err = sender
            .send(&text_message(), &DecryptedParameters::default())
            .await
            .unwrap_err();
        assert_eq!(err, SendFailure::missing_parameter("url"));

        let only_url = DecryptedParameters::new(vec![(
            "url".into(),
            SecretString::from("http://localhost/".to_string()),
        )]);
        let err = sender.send(&text_message(), &only_url).await.unwrap_err();
        assert_eq!(err, SendFailure::missing_parameter("api_key"));
    }

    #[tokio::test]
    async fn refuses_mail_messages() {
        let msg = Message::new(
            "m",
            MessageContent::Mail(MailContent {
                from: "a@example.com".into(),
                to: vec!["b@example.com".into()],
                cc: vec![],
                bcc: vec![],
                subject: "s".into(),
                body: "b".into(),
                is_html: false,
            }),
        );
        let err = HttpTextSender::new()
            .send(&msg, &params("http://localhost/"))
            .await
            .unwrap_err();
        assert!(err.diagnostic.contains("mail"));
    }

    #[test]
    fn reference_extraction() {
        assert_eq!(reference_from_body(r#"{"id": 42}"#).as_deref(), Some("42"));
        assert_eq!(
            reference_from_body(r#"{"reference": "abc"}"#).as_deref(),
            Some("abc")
        );
        assert_eq!(reference_from_body("accepted"), None);
    }
}
