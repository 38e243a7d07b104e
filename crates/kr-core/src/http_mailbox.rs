#![cfg(feature = "http-mailbox")]

//! HTTP mailbox transport.
//!
//! Each pairing owns two queues on the mailbox service, addressed as
//! `{base}/v1/mailbox/{queue}`:
//! - `PUT` creates the queue
//! - `POST` appends one base64 envelope
//! - `GET ?wait_ms=N` long-polls and deletes what it returns: `200` with
//!   newline-separated base64 envelopes, or `204` when nothing arrived
//!
//! Pushes go to an optional push relay as JSON; they are fire-and-forget.

use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use reqwest::StatusCode;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::errors::TransportError;
use crate::notify::{red, Notifier};
use crate::pairing::PairingSecret;
use crate::transport::{Transport, CLOCK_SKEW_NOTICE};

pub const DEFAULT_WAIT_MS: u64 = 3000;

/// Slack on top of the long-poll wait before a read counts as stalled.
const POLL_MARGIN: Duration = Duration::from_secs(10);
/// Timeout for queue creation, posts and pushes.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

const CLOCK_SKEW_MARKER: &str = "Signature expired";

#[derive(Clone)]
pub struct HttpMailboxTransport {
    base_url: String,
    push_url: Option<String>,
    wait_ms: u64,
    client: reqwest::Client,
}

impl HttpMailboxTransport {
    pub fn new(base_url: impl Into<String>) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .use_rustls_tls()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| TransportError::Network(e.to_string()))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            push_url: None,
            wait_ms: DEFAULT_WAIT_MS,
            client,
        })
    }

    pub fn with_push_url(mut self, push_url: impl Into<String>) -> Self {
        self.push_url = Some(push_url.into());
        self
    }

    pub fn with_wait_ms(mut self, wait_ms: u64) -> Self {
        self.wait_ms = wait_ms;
        self
    }

    /// HTTP timeout for one long-poll read.
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_ms) + POLL_MARGIN
    }

    fn queue_url(&self, queue: &str) -> String {
        format!("{}/v1/mailbox/{}", self.base_url, queue)
    }

    async fn create_queue(&self, queue: &str) -> Result<(), TransportError> {
        let resp = self
            .client
            .put(self.queue_url(queue))
            .send()
            .await
            .map_err(network)?;
        check_status(resp).await.map(|_| ())
    }

    async fn post(&self, queue: &str, envelope_b64: String) -> Result<(), TransportError> {
        let resp = self
            .client
            .post(self.queue_url(queue))
            .body(envelope_b64)
            .send()
            .await
            .map_err(network)?;
        check_status(resp).await.map(|_| ())
    }

    /// Spawn a push to the relay if the phone registered an endpoint.
    fn spawn_push(&self, ps: &PairingSecret, alert_text: Option<&str>, envelope_b64: &str) {
        let (Some(push_url), Some(endpoint)) = (self.push_url.clone(), ps.sns_endpoint_arn()) else {
            return;
        };
        let payload = push_payload(&endpoint, alert_text, envelope_b64, &ps.send_queue_name());
        let client = self.client.clone();
        tokio::spawn(async move {
            let result = client.post(push_url).json(&payload).send().await;
            match result {
                Ok(resp) if resp.status().is_success() => debug!("push delivered"),
                Ok(resp) => warn!(status = %resp.status(), "push rejected"),
                Err(e) => warn!(error = %e, "push error"),
            }
        });
    }
}

fn network(e: reqwest::Error) -> TransportError {
    TransportError::Network(e.to_string())
}

async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, TransportError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(classify_failure(status.as_u16(), body))
}

fn classify_failure(status: u16, body: String) -> TransportError {
    if status == StatusCode::FORBIDDEN.as_u16() && body.contains(CLOCK_SKEW_MARKER) {
        TransportError::ClockSkew
    } else {
        TransportError::Provider { status, body }
    }
}

/// APNs-style payload plus a data-only variant for other push services.
/// Silent pushes omit the alert.
pub fn push_payload(endpoint: &str, alert_text: Option<&str>, envelope_b64: &str, queue: &str) -> Value {
    let mut aps = json!({
        "sound": "",
        "content-available": 1,
        "queue": queue,
        "c": envelope_b64,
    });
    if let Some(text) = alert_text {
        aps["alert"] = json!(text);
        aps["mutable-content"] = json!(1);
        aps["session_uuid"] = json!(queue);
        aps["category"] = json!("authorize_identifier");
    }
    json!({
        "endpoint": endpoint,
        "aps": aps,
        "data": { "message": envelope_b64, "queue": queue },
    })
}

/// Split a poll body into envelopes, skipping lines that are not base64.
pub fn decode_frames(body: &str) -> Vec<Vec<u8>> {
    body.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .filter_map(|l| match STANDARD.decode(l) {
            Ok(b) => Some(b),
            Err(e) => {
                warn!(error = %e, "base64 envelope decoding error");
                None
            }
        })
        .collect()
}

#[async_trait]
impl Transport for HttpMailboxTransport {
    async fn setup(&self, ps: &PairingSecret) -> Result<(), TransportError> {
        self.create_queue(&ps.send_queue_name()).await?;
        self.create_queue(&ps.recv_queue_name()).await
    }

    async fn push_alert(
        &self,
        ps: &PairingSecret,
        alert_text: &str,
        message: &[u8],
    ) -> Result<(), TransportError> {
        let envelope = STANDARD.encode(ps.encrypt_message(message)?);
        self.spawn_push(ps, Some(alert_text), &envelope);
        self.post(&ps.send_queue_name(), envelope).await
    }

    async fn send_message(&self, ps: &PairingSecret, message: &[u8]) -> Result<(), TransportError> {
        let envelope = STANDARD.encode(ps.encrypt_message(message)?);
        self.spawn_push(ps, None, &envelope);
        self.post(&ps.send_queue_name(), envelope).await
    }

    async fn read(
        &self,
        notifier: &Notifier,
        ps: &PairingSecret,
    ) -> Result<Vec<Vec<u8>>, TransportError> {
        let url = format!("{}?wait_ms={}", self.queue_url(&ps.recv_queue_name()), self.wait_ms);
        let resp = self
            .client
            .get(url)
            .timeout(self.poll_timeout())
            .send()
            .await
            .map_err(network)?;

        match resp.status() {
            StatusCode::NO_CONTENT => Ok(Vec::new()),
            StatusCode::OK => {
                let body = resp.text().await.map_err(network)?;
                Ok(decode_frames(&body))
            }
            status => {
                let body = resp.text().await.unwrap_or_default();
                let err = classify_failure(status.as_u16(), body);
                if err == TransportError::ClockSkew {
                    notifier.notify(&red(CLOCK_SKEW_NOTICE));
                }
                Err(err)
            }
        }
    }
}
