//! HTTP client abstraction for performing the one-POST-per-attempt that the
//! dispatcher drives. Mirrors the teacher's `HttpClient` trait split between
//! a `reqwest`-backed production client and a mock for tests.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::{Result, WebhookError};

/// A built HTTP request ready to POST.
#[derive(Debug, Clone)]
pub struct WebhookHttpRequest {
    pub url: String,
    pub body: String,
    pub headers: Vec<(String, String)>,
}

/// Outcome of a POST attempt.
#[derive(Debug, Clone, Copy)]
pub struct HttpResponse {
    pub status_code: u16,
}

impl HttpResponse {
    /// A response is a success iff its status is in the 2xx range (see
    /// SPEC_FULL §9 for the widening from the distilled spec's literal 200).
    pub fn is_success(self) -> bool {
        (200..300).contains(&self.status_code)
    }
}

/// Abstraction over performing one HTTP POST attempt against a webhook
/// destination. Implementations may fail with a transport error; a non-2xx
/// response is *not* an error at this layer, it's a successful `post` call
/// whose `HttpResponse::is_success` is `false`.
#[async_trait]
pub trait WebhookHttpClient: Send + Sync {
    async fn post(&self, request: WebhookHttpRequest) -> Result<HttpResponse>;
}

/// Production HTTP client backed by `reqwest`.
///
/// If constructed with a signing secret (`with_signing`), every POST carries
/// a Standard Webhooks `webhook-id`/`webhook-timestamp`/`webhook-signature`
/// header triple over the dispatch body (see [`crate::signing`]). Signing is
/// a convenience on top of the client, not a dispatch engine invariant: the
/// dispatcher only ever constructs a `{ url, body, headers }` request.
pub struct ReqwestWebhookHttpClient {
    client: reqwest::Client,
    signing_secret: Option<String>,
}

impl ReqwestWebhookHttpClient {
    pub fn new(timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("failed to build webhook http client");
        Self { client, signing_secret: None }
    }

    /// Enable Standard Webhooks signing for every POST made by this client.
    pub fn with_signing(mut self, secret: String) -> Self {
        self.signing_secret = Some(secret);
        self
    }
}

#[async_trait]
impl WebhookHttpClient for ReqwestWebhookHttpClient {
    #[tracing::instrument(skip(self, request), fields(url = %request.url))]
    async fn post(&self, request: WebhookHttpRequest) -> Result<HttpResponse> {
        let mut builder = self.client.post(&request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }

        if let Some(secret) = &self.signing_secret {
            let msg_id = uuid::Uuid::new_v4().to_string();
            let timestamp = chrono::Utc::now().timestamp();
            if let Some(headers) = crate::signing::signing_headers(&msg_id, timestamp, &request.body, secret) {
                for (name, value) in headers {
                    builder = builder.header(name, value);
                }
            } else {
                tracing::warn!("webhook signing secret is malformed, sending request unsigned");
            }
        }

        let response = builder
            .body(request.body)
            .send()
            .await
            .map_err(|e| WebhookError::HttpClient(e.to_string()))?;

        let status_code = response.status().as_u16();
        tracing::debug!(status_code, "webhook POST completed");
        Ok(HttpResponse { status_code })
    }
}

/// Mock HTTP client for tests: returns queued responses per URL, FIFO, and
/// records every call made to it.
#[derive(Clone, Default)]
pub struct MockWebhookHttpClient {
    responses: Arc<Mutex<HashMap<String, Vec<Result<HttpResponse>>>>>,
    calls: Arc<Mutex<Vec<WebhookHttpRequest>>>,
}

impl MockWebhookHttpClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a response (or error) to be returned for the next call against `url`.
    pub fn queue_response(&self, url: &str, response: Result<HttpResponse>) {
        self.responses.lock().entry(url.to_string()).or_default().push(response);
    }

    pub fn calls(&self) -> Vec<WebhookHttpRequest> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

#[async_trait]
impl WebhookHttpClient for MockWebhookHttpClient {
    async fn post(&self, request: WebhookHttpRequest) -> Result<HttpResponse> {
        self.calls.lock().push(request.clone());

        let mut responses = self.responses.lock();
        if let Some(queue) = responses.get_mut(&request.url) {
            if !queue.is_empty() {
                return queue.remove(0);
            }
        }

        Err(WebhookError::HttpClient(format!("no mock response queued for {}", request.url)))
    }
}
