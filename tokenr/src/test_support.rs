use std::{
    sync::{
        Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use serde_json::Value;
use wiremock::{
    Mock, MockServer, ResponseTemplate,
    matchers::{method, path},
};

use crate::{intercept::LlmEndpoint, usage::Vendor};

pub const TRACK_PATH: &str = "/api/v1/track";

/// Starts a tracking endpoint that prices every record at `cost`.
pub async fn tracking_server(cost: f64) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(TRACK_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({ "cost": cost })))
        .mount(&server)
        .await;
    server
}

pub fn track_url(server: &MockServer) -> String {
    format!("{}{}", server.uri(), TRACK_PATH)
}

/// Polls until `expected` requests arrived or roughly two seconds passed.
pub async fn wait_for_requests(server: &MockServer, expected: usize) -> Vec<wiremock::Request> {
    for _ in 0..100 {
        let received = server.received_requests().await.unwrap_or_default();
        if received.len() >= expected {
            return received;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    server.received_requests().await.unwrap_or_default()
}

/// Gives detached tasks time to run, then returns everything received.
pub async fn settle(server: &MockServer) -> Vec<wiremock::Request> {
    tokio::time::sleep(Duration::from_millis(150)).await;
    server.received_requests().await.unwrap_or_default()
}

/// A vendor endpoint that records what it was sent and replies with a fixed
/// body or error.
pub struct FakeEndpoint {
    vendor: Vendor,
    base_url: Option<String>,
    reply: Result<Value, String>,
    delay: Duration,
    calls: AtomicUsize,
    requests: Mutex<Vec<Value>>,
}

impl FakeEndpoint {
    pub fn new(vendor: Vendor, reply: Value) -> Self {
        Self {
            vendor,
            base_url: None,
            reply: Ok(reply),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(vendor: Vendor, error: &str) -> Self {
        Self {
            reply: Err(error.to_string()),
            ..Self::new(vendor, Value::Null)
        }
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = Some(base_url.to_string());
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<Value> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl LlmEndpoint for FakeEndpoint {
    type Error = String;

    fn vendor(&self) -> Vendor {
        self.vendor
    }

    fn base_url(&self) -> Option<&str> {
        self.base_url.as_deref()
    }

    async fn create(&self, request: Value) -> Result<Value, String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.reply.clone()
    }
}

pub fn openai_response() -> Value {
    serde_json::json!({
        "id": "chatcmpl-abc",
        "object": "chat.completion",
        "model": "gpt-4o",
        "choices": [{"index": 0, "message": {"role": "assistant", "content": "hi"}}],
        "usage": {
            "prompt_tokens": 100,
            "completion_tokens": 20,
            "total_tokens": 120,
            "prompt_tokens_details": {"cached_tokens": 30}
        }
    })
}

pub fn anthropic_response() -> Value {
    serde_json::json!({
        "id": "msg_01",
        "type": "message",
        "model": "claude-sonnet-4-5",
        "content": [{"type": "text", "text": "hi"}],
        "usage": {
            "input_tokens": 40,
            "output_tokens": 12,
            "cache_read_input_tokens": 200,
            "cache_creation_input_tokens": 50
        }
    })
}
