use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use crate::config::WebhookConfig;
use crate::error::{AppError, AppResult};

/// Result of one webhook delivery attempt.
///
/// Retry bookkeeping pattern-matches on this value; delivery failures are
/// data, not errors that unwind through the dispatch loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Sent,
    /// Worth retrying on a later run: rate limits, 5xx, network trouble.
    Transient(String),
    /// Retrying cannot help: bad URL, rejected payload.
    Permanent(String),
}

/// Outbound chat-webhook delivery, behind a trait so dry runs and tests can
/// swap the transport.
#[async_trait]
pub trait WebhookSender: Send + Sync {
    async fn post(&self, url: &str, text: &str, mentions: &[String]) -> DispatchOutcome;
}

#[derive(Deserialize)]
struct WebhookResponse {
    #[serde(default)]
    errcode: i64,
    #[serde(default)]
    errmsg: String,
}

/// Enterprise-chat group webhook client using the `msgtype=text` envelope.
pub struct ChatWebhookClient {
    http: reqwest::Client,
}

impl ChatWebhookClient {
    pub fn new(config: &WebhookConfig) -> AppResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .map_err(AppError::Request)?;
        Ok(Self { http })
    }
}

#[async_trait]
impl WebhookSender for ChatWebhookClient {
    async fn post(&self, url: &str, text: &str, mentions: &[String]) -> DispatchOutcome {
        let payload = serde_json::json!({
            "msgtype": "text",
            "text": {
                "content": text,
                "mentioned_list": mentions,
            },
        });

        let response = match self.http.post(url).json(&payload).send().await {
            Ok(response) => response,
            Err(e) => {
                // Timeouts and connection failures may heal by the next run.
                return DispatchOutcome::Transient(format!("request failed: {}", e));
            }
        };

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            return DispatchOutcome::Transient(format!("http status {}", status));
        }
        if !status.is_success() {
            return DispatchOutcome::Permanent(format!("http status {}", status));
        }

        // The chat service reports application-level failures with a 200
        // response and a nonzero errcode. 45009 is its rate limit.
        match response.json::<WebhookResponse>().await {
            Ok(body) if body.errcode == 0 => DispatchOutcome::Sent,
            Ok(body) if body.errcode == 45009 => {
                DispatchOutcome::Transient(format!("rate limited: {}", body.errmsg))
            }
            Ok(body) => {
                DispatchOutcome::Permanent(format!("errcode {}: {}", body.errcode, body.errmsg))
            }
            Err(_) => {
                // Non-JSON 2xx body; assume the generic webhook accepted it.
                DispatchOutcome::Sent
            }
        }
    }
}

/// Dry-run transport: reports success without any I/O so evaluation and
/// task-creation paths stay identical to a real run.
pub struct NoopWebhook;

#[async_trait]
impl WebhookSender for NoopWebhook {
    async fn post(&self, url: &str, text: &str, _mentions: &[String]) -> DispatchOutcome {
        tracing::info!(
            "Dry run: suppressed webhook call to {} ({} chars)",
            url,
            text.len()
        );
        DispatchOutcome::Sent
    }
}

/// Recording webhook for tests: captures every call and replays scripted
/// outcomes (the last script entry repeats once the script is exhausted).
#[cfg(test)]
pub struct MockWebhook {
    pub calls: std::sync::Mutex<Vec<RecordedCall>>,
    script: std::sync::Mutex<Vec<DispatchOutcome>>,
}

#[cfg(test)]
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub url: String,
    pub text: String,
    pub mentions: Vec<String>,
}

#[cfg(test)]
impl MockWebhook {
    pub fn always(outcome: DispatchOutcome) -> Self {
        Self {
            calls: std::sync::Mutex::new(Vec::new()),
            script: std::sync::Mutex::new(vec![outcome]),
        }
    }

    pub fn sending() -> Self {
        Self::always(DispatchOutcome::Sent)
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn last_call(&self) -> Option<RecordedCall> {
        self.calls.lock().unwrap().last().cloned()
    }
}

#[cfg(test)]
#[async_trait]
impl WebhookSender for MockWebhook {
    async fn post(&self, url: &str, text: &str, mentions: &[String]) -> DispatchOutcome {
        self.calls.lock().unwrap().push(RecordedCall {
            url: url.to_string(),
            text: text.to_string(),
            mentions: mentions.to_vec(),
        });
        let script = self.script.lock().unwrap();
        let index = (self.calls.lock().unwrap().len() - 1).min(script.len() - 1);
        script[index].clone()
    }
}
