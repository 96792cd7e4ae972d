//! HTTP-backed collaborators: the OCR model server and the mail relay.

use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};

use courier_infra::{CapabilityError, MailError, Mailer, Recognizer};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

fn blocking_client() -> anyhow::Result<reqwest::blocking::Client> {
    Ok(reqwest::blocking::Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .connect_timeout(CONNECT_TIMEOUT)
        .build()?)
}

#[derive(Serialize)]
struct RecognizeRequest {
    image: String,
}

#[derive(Deserialize)]
struct RecognizeResponse {
    text: String,
}

/// Posts `{"image": "<base64>"}` and expects `{"text": "..."}` back.
#[derive(Debug, Clone)]
pub struct HttpRecognizer {
    endpoint: String,
    client: reqwest::blocking::Client,
}

impl HttpRecognizer {
    pub fn new(endpoint: impl Into<String>) -> anyhow::Result<Self> {
        Ok(Self {
            endpoint: endpoint.into(),
            client: blocking_client()?,
        })
    }
}

impl Recognizer for HttpRecognizer {
    fn recognize(&self, image: &[u8]) -> Result<String, CapabilityError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&RecognizeRequest {
                image: BASE64.encode(image),
            })
            .send()
            .map_err(|e| CapabilityError::failed(format!("HTTP request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().unwrap_or_default();
            return Err(CapabilityError::failed(format!("HTTP error {status}: {body}")));
        }

        response
            .json::<RecognizeResponse>()
            .map(|r| r.text)
            .map_err(|e| CapabilityError::failed(format!("invalid OCR response: {e}")))
    }
}

#[derive(Serialize)]
struct SendMailRequest<'a> {
    recipient: &'a str,
    subject: &'a str,
    body: &'a str,
}

/// Posts `{recipient, subject, body}` to a mail relay.
#[derive(Debug, Clone)]
pub struct HttpMailer {
    endpoint: String,
    client: reqwest::blocking::Client,
}

impl HttpMailer {
    pub fn new(endpoint: impl Into<String>) -> anyhow::Result<Self> {
        Ok(Self {
            endpoint: endpoint.into(),
            client: blocking_client()?,
        })
    }
}

impl Mailer for HttpMailer {
    fn send(&self, recipient: &str, subject: &str, body: &str) -> Result<(), MailError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&SendMailRequest {
                recipient,
                subject,
                body,
            })
            .send()
            .map_err(|e| MailError::Transport(e.to_string()))?;

        let status = response.status();
        if status.is_client_error() {
            let detail = response.text().unwrap_or_default();
            return Err(MailError::Rejected(format!("{status}: {detail}")));
        }
        if !status.is_success() {
            return Err(MailError::Transport(format!("HTTP error {status}")));
        }
        Ok(())
    }
}

/// Development mailer: logs instead of sending.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogMailer;

impl Mailer for LogMailer {
    fn send(&self, recipient: &str, subject: &str, _body: &str) -> Result<(), MailError> {
        tracing::info!(%recipient, %subject, "notification (not sent: no mail endpoint)");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    use axum::http::StatusCode;
    use axum::routing::post;
    use axum::{Json, Router};
    use serde_json::{Value, json};

    /// Upstream stand-in on an ephemeral port. The blocking clients under test must
    /// not run inside the server's runtime, so it gets its own.
    struct StubUpstream {
        url: String,
        received: Arc<Mutex<Vec<Value>>>,
        _runtime: tokio::runtime::Runtime,
    }

    impl StubUpstream {
        fn answering(status: StatusCode, reply: Value) -> Self {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .worker_threads(1)
                .enable_all()
                .build()
                .unwrap();

            let received = Arc::new(Mutex::new(Vec::new()));
            let seen = received.clone();
            let app = Router::new().route(
                "/",
                post(move |Json(body): Json<Value>| {
                    seen.lock().unwrap().push(body);
                    let reply = reply.clone();
                    async move { (status, Json(reply)) }
                }),
            );

            let listener = runtime
                .block_on(tokio::net::TcpListener::bind("127.0.0.1:0"))
                .expect("failed to bind ephemeral port");
            let url = format!("http://{}/", listener.local_addr().unwrap());
            runtime.spawn(async move {
                axum::serve(listener, app).await.unwrap();
            });

            Self {
                url,
                received,
                _runtime: runtime,
            }
        }

        fn requests(&self) -> Vec<Value> {
            self.received.lock().unwrap().clone()
        }
    }

    #[test]
    fn recognizer_posts_base64_image() {
        let upstream = StubUpstream::answering(StatusCode::OK, json!({ "text": "HELLO" }));
        let recognizer = HttpRecognizer::new(&upstream.url).unwrap();

        assert_eq!(recognizer.recognize(b"img-123").unwrap(), "HELLO");

        let sent = upstream.requests();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0]["image"], BASE64.encode(b"img-123"));
    }

    #[test]
    fn recognizer_reports_http_errors() {
        let upstream = StubUpstream::answering(
            StatusCode::INTERNAL_SERVER_ERROR,
            json!({ "detail": "model down" }),
        );
        let recognizer = HttpRecognizer::new(&upstream.url).unwrap();

        let err = recognizer.recognize(b"x").unwrap_err();
        assert!(matches!(err, CapabilityError::Failed(msg) if msg.contains("500")));
    }

    #[test]
    fn recognizer_rejects_reply_without_text() {
        let upstream = StubUpstream::answering(StatusCode::OK, json!({ "words": [] }));
        let err = HttpRecognizer::new(&upstream.url).unwrap().recognize(b"x").unwrap_err();
        assert!(matches!(err, CapabilityError::Failed(msg) if msg.contains("invalid OCR response")));
    }

    #[test]
    fn mailer_distinguishes_rejection_from_transport_failure() {
        let upstream = StubUpstream::answering(StatusCode::ACCEPTED, json!({}));
        HttpMailer::new(&upstream.url).unwrap().send("a@example.com", "s", "b").unwrap();
        let sent = upstream.requests();
        assert_eq!(sent[0], json!({ "recipient": "a@example.com", "subject": "s", "body": "b" }));

        let upstream = StubUpstream::answering(
            StatusCode::UNPROCESSABLE_ENTITY,
            json!({ "detail": "bad address" }),
        );
        let err = HttpMailer::new(&upstream.url).unwrap().send("nope", "s", "b").unwrap_err();
        assert!(matches!(err, MailError::Rejected(msg) if msg.contains("bad address")));

        let upstream = StubUpstream::answering(StatusCode::SERVICE_UNAVAILABLE, json!({}));
        let err = HttpMailer::new(&upstream.url).unwrap().send("a@example.com", "s", "b").unwrap_err();
        assert!(matches!(err, MailError::Transport(_)));
    }
}
