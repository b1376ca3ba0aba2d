//! Record dispatch.
//!
//! Every tracked call produces at most one delivery attempt. The attempt
//! runs in a detached Tokio task so the caller never waits on the tracking
//! endpoint, and a failure there never reaches the caller.
//!
//! Callers outside any Tokio runtime get a small background runtime owned by
//! the dispatcher, built on first use.

use std::sync::{Arc, Mutex, OnceLock};

use log::{info, warn};
use reqwest::Client;
use tokenr_common::{TrackAck, UsageRecord};
use tokio::{
    runtime::{Builder, Handle, Runtime},
    sync::Semaphore,
};

use crate::{
    error::{Result, TrackerError},
    settings::{Settings, SharedSettings, snapshot},
};

pub struct Dispatcher {
    settings: SharedSettings,
    client: Option<Client>,
    runtime: OnceLock<Handle>,
    background: OnceLock<Runtime>,
    in_flight: Arc<Semaphore>,
    // Permits the semaphore currently stands for, in use or not.
    capacity: Mutex<usize>,
}

impl Dispatcher {
    pub fn new(settings: SharedSettings) -> Self {
        let permits = snapshot(&settings).max_in_flight.max(1);
        Self {
            settings,
            client: Client::builder().build().ok(),
            runtime: OnceLock::new(),
            background: OnceLock::new(),
            in_flight: Arc::new(Semaphore::new(permits)),
            capacity: Mutex::new(permits),
        }
    }

    /// Remembers the current Tokio runtime, if any, for submissions made
    /// later from outside it. Returns whether records can be delivered,
    /// which only fails when no HTTP client could be built.
    pub fn bind_runtime(&self) -> bool {
        if let Ok(handle) = Handle::try_current() {
            let _ = self.runtime.set(handle);
        }
        self.client.is_some()
    }

    /// The caller's runtime, else the one seen at init, else the
    /// dispatcher's own.
    fn runtime(&self) -> Option<Handle> {
        if let Ok(handle) = Handle::try_current() {
            return Some(handle);
        }
        if let Some(handle) = self.runtime.get() {
            return Some(handle.clone());
        }
        if self.background.get().is_none() {
            let runtime = Builder::new_multi_thread()
                .worker_threads(1)
                .thread_name("tokenr-dispatch")
                .enable_all()
                .build()
                .ok()?;
            // A concurrent caller may have won; the loser is dropped here,
            // outside any runtime.
            let _ = self.background.set(runtime);
        }
        self.background.get().map(|runtime| runtime.handle().clone())
    }

    /// Grow or shrink the semaphore to match `max_in_flight`. Permits held
    /// by running tasks are only forgotten once they come back.
    fn resize(&self, wanted: usize) {
        let wanted = wanted.max(1);
        let mut capacity = self.capacity.lock().unwrap_or_else(|e| e.into_inner());
        if wanted > *capacity {
            self.in_flight.add_permits(wanted - *capacity);
            *capacity = wanted;
        } else if wanted < *capacity {
            *capacity -= self.in_flight.forget_permits(*capacity - wanted);
        }
    }

    /// Fill in default attribution and send in the background.
    ///
    /// Returns immediately without doing anything when tracking is disabled
    /// or no token is configured.
    pub fn track(&self, record: UsageRecord) {
        let settings = {
            let guard = self.settings.read().unwrap_or_else(|e| e.into_inner());
            if !guard.is_active() {
                return;
            }
            guard.clone()
        };

        let record = apply_defaults(record, &settings);
        self.spawn_delivery(record, settings);
    }

    /// Send a record as-is in a detached task. Never blocks, never fails.
    pub fn send(&self, record: UsageRecord) {
        let settings = snapshot(&self.settings);
        self.spawn_delivery(record, settings);
    }

    /// One awaited delivery attempt.
    pub async fn submit(&self, record: &UsageRecord) -> Result<TrackAck> {
        let settings = snapshot(&self.settings);
        let client = self.client.as_ref().ok_or(TrackerError::Unavailable)?;
        post_record(client, &settings, record).await
    }

    fn spawn_delivery(&self, record: UsageRecord, settings: Settings) {
        let (Some(client), Some(runtime)) = (self.client.clone(), self.runtime()) else {
            if settings.debug {
                warn!(
                    "[tokenr] No runtime or HTTP client available, dropping usage for {}",
                    record.model
                );
            }
            return;
        };

        self.resize(settings.max_in_flight);
        let Ok(permit) = Arc::clone(&self.in_flight).try_acquire_owned() else {
            if settings.debug {
                warn!(
                    "[tokenr] {} submissions already in flight, dropping usage for {}",
                    settings.max_in_flight, record.model
                );
            }
            return;
        };

        // The JoinHandle is dropped on purpose: nothing observes the outcome.
        runtime.spawn(async move {
            let _permit = permit;
            match post_record(&client, &settings, &record).await {
                Ok(ack) => {
                    if settings.debug {
                        info!(
                            "[tokenr] Tracked: {} - ${}",
                            record.model,
                            ack.cost.unwrap_or(0.0)
                        );
                    }
                }
                Err(e) => {
                    if settings.debug {
                        warn!("[tokenr] Failed to track: {}", e);
                    }
                }
            }
        });
    }
}

impl Drop for Dispatcher {
    // Dropping a runtime blocks, which panics inside async code. In-flight
    // submissions are abandoned instead.
    fn drop(&mut self) {
        if let Some(runtime) = self.background.take() {
            runtime.shutdown_background();
        }
    }
}

/// Merge default tags under the record's own (the record's keys win) and
/// fall back to the default agent id.
pub fn apply_defaults(mut record: UsageRecord, settings: &Settings) -> UsageRecord {
    if !settings.default_tags.is_empty() {
        let mut tags = settings.default_tags.clone();
        tags.append(&mut record.tags);
        record.tags = tags;
    }

    if record.agent_id.as_deref().is_none_or(str::is_empty) {
        record.agent_id = settings.default_agent_id.clone();
    }

    record
}

async fn post_record(
    client: &Client,
    settings: &Settings,
    record: &UsageRecord,
) -> Result<TrackAck> {
    let token = settings
        .token
        .as_deref()
        .filter(|t| !t.is_empty())
        .ok_or(TrackerError::MissingToken)?;

    let response = client
        .post(&settings.url)
        .bearer_auth(token)
        .timeout(settings.timeout())
        .json(record)
        .send()
        .await?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(TrackerError::Rejected {
            status: status.as_u16(),
            body,
        });
    }

    Ok(response.json::<TrackAck>().await?)
}

#[cfg(test)]
mod tests {
    use std::{sync::RwLock, time::Duration};

    use serde_json::{Value, json};
    use tokenr_common::TagValue;
    use wiremock::{
        Mock, MockServer, ResponseTemplate,
        matchers::{header, method, path},
    };

    use super::*;
    use crate::test_support::{
        TRACK_PATH, settle, track_url, tracking_server, wait_for_requests,
    };

    fn active_settings(url: String) -> Settings {
        Settings {
            token: Some("test-token".to_string()),
            url,
            ..Settings::default()
        }
    }

    fn dispatcher(settings: Settings) -> Dispatcher {
        Dispatcher::new(Arc::new(RwLock::new(settings)))
    }

    #[test]
    fn test_merges_default_tags() {
        let mut settings = Settings::default();
        settings.default_tags.insert("env".to_string(), "prod".into());

        let record = apply_defaults(
            UsageRecord::new("openai", "gpt-4", 10, 5).with_tag("feature", "chat"),
            &settings,
        );

        assert_eq!(record.tags.len(), 2);
        assert_eq!(record.tags["env"], TagValue::from("prod"));
        assert_eq!(record.tags["feature"], TagValue::from("chat"));
    }

    #[test]
    fn test_call_tags_win_on_collision() {
        let mut settings = Settings::default();
        settings.default_tags.insert("env".to_string(), "prod".into());
        settings.default_tags.insert("region".to_string(), "eu".into());

        let record = apply_defaults(
            UsageRecord::new("openai", "gpt-4", 10, 5).with_tag("env", "staging"),
            &settings,
        );

        assert_eq!(record.tags["env"], TagValue::from("staging"));
        assert_eq!(record.tags["region"], TagValue::from("eu"));
    }

    #[test]
    fn test_agent_id_resolution() {
        let settings = Settings {
            default_agent_id: Some("default-agent".to_string()),
            ..Settings::default()
        };

        let record = apply_defaults(UsageRecord::new("openai", "gpt-4", 10, 5), &settings);
        assert_eq!(record.agent_id.as_deref(), Some("default-agent"));

        let record = apply_defaults(
            UsageRecord {
                agent_id: Some("override-agent".to_string()),
                ..UsageRecord::new("openai", "gpt-4", 10, 5)
            },
            &settings,
        );
        assert_eq!(record.agent_id.as_deref(), Some("override-agent"));
    }

    #[test]
    fn test_absent_attribution_is_stripped() {
        let record =
            apply_defaults(UsageRecord::new("openai", "gpt-4", 10, 5), &Settings::default());
        let value = serde_json::to_value(&record).unwrap();

        for key in ["agent_id", "feature_name", "team_id", "tags", "latency_ms"] {
            assert!(value.get(key).is_none(), "{} should be omitted", key);
        }
    }

    #[tokio::test]
    async fn test_send_posts_with_bearer_auth() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(TRACK_PATH))
            .and(header("authorization", "Bearer test-token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"cost": 0.002})))
            .expect(1)
            .mount(&server)
            .await;

        let dispatcher = dispatcher(active_settings(track_url(&server)));
        dispatcher.send(UsageRecord::new("openai", "gpt-4", 100, 50));

        let received = wait_for_requests(&server, 1).await;
        assert_eq!(received.len(), 1);

        let content_type = received[0]
            .headers
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        assert!(content_type.starts_with("application/json"));

        let body: Value = received[0].body_json().unwrap();
        assert_eq!(body["provider"], "openai");
        assert_eq!(body["model"], "gpt-4");
        assert_eq!(body["input_tokens"], 100);
        assert_eq!(body["output_tokens"], 50);
    }

    #[tokio::test]
    async fn test_track_applies_defaults_before_sending() {
        let server = tracking_server(0.01).await;
        let mut settings = active_settings(track_url(&server));
        settings.default_agent_id = Some("support-bot".to_string());
        settings.default_tags.insert("env".to_string(), "prod".into());

        dispatcher(settings).track(UsageRecord::new("anthropic", "claude-sonnet-4-5", 7, 3));

        let received = wait_for_requests(&server, 1).await;
        let body: Value = received[0].body_json().unwrap();
        assert_eq!(body["agent_id"], "support-bot");
        assert_eq!(body["tags"], json!({"env": "prod"}));
    }

    #[tokio::test]
    async fn test_disabled_tracking_sends_nothing() {
        let server = tracking_server(0.0).await;
        let settings = Settings {
            enabled: false,
            ..active_settings(track_url(&server))
        };

        let dispatcher = dispatcher(settings);
        for _ in 0..5 {
            dispatcher.track(UsageRecord::new("openai", "gpt-4", 10, 5));
        }

        assert!(settle(&server).await.is_empty());
    }

    #[tokio::test]
    async fn test_missing_token_sends_nothing() {
        let server = tracking_server(0.0).await;
        let settings = Settings {
            token: None,
            ..active_settings(track_url(&server))
        };

        let dispatcher = dispatcher(settings);
        for _ in 0..5 {
            dispatcher.track(UsageRecord::new("openai", "gpt-4", 10, 5));
        }

        assert!(settle(&server).await.is_empty());
    }

    #[tokio::test]
    async fn test_submit_returns_cost() {
        let server = tracking_server(0.002).await;
        let dispatcher = dispatcher(active_settings(track_url(&server)));

        let ack = dispatcher
            .submit(&UsageRecord::new("openai", "gpt-4", 10, 5))
            .await
            .unwrap();
        assert_eq!(ack.cost, Some(0.002));
    }

    #[tokio::test]
    async fn test_submit_reports_rejection() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401).set_body_string("invalid token"))
            .mount(&server)
            .await;

        let dispatcher = dispatcher(active_settings(track_url(&server)));
        let err = dispatcher
            .submit(&UsageRecord::new("openai", "gpt-4", 10, 5))
            .await
            .unwrap_err();

        match err {
            TrackerError::Rejected { status, body } => {
                assert_eq!(status, 401);
                assert_eq!(body, "invalid token");
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn test_delivery_failure_is_swallowed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .expect(1)
            .mount(&server)
            .await;

        let failing = dispatcher(Settings {
            debug: true,
            ..active_settings(track_url(&server))
        });
        failing.send(UsageRecord::new("openai", "gpt-4", 10, 5));
        assert_eq!(wait_for_requests(&server, 1).await.len(), 1);

        // Nothing listens on the discard port.
        let unreachable = dispatcher(Settings {
            timeout_secs: 1,
            ..active_settings("http://127.0.0.1:9/track".to_string())
        });
        unreachable.send(UsageRecord::new("openai", "gpt-4", 10, 5));
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    #[tokio::test]
    async fn test_in_flight_limit_drops_excess() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"cost": 0.0}))
                    .set_delay(Duration::from_millis(300)),
            )
            .mount(&server)
            .await;

        let dispatcher = dispatcher(Settings {
            max_in_flight: 1,
            ..active_settings(track_url(&server))
        });
        for _ in 0..3 {
            dispatcher.send(UsageRecord::new("openai", "gpt-4", 10, 5));
        }

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(server.received_requests().await.unwrap_or_default().len(), 1);
    }

    #[tokio::test]
    async fn test_in_flight_limit_follows_settings() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"cost": 0.0}))
                    .set_delay(Duration::from_millis(300)),
            )
            .mount(&server)
            .await;

        let settings = Arc::new(RwLock::new(Settings {
            max_in_flight: 1,
            ..active_settings(track_url(&server))
        }));
        let dispatcher = Dispatcher::new(Arc::clone(&settings));

        dispatcher.send(UsageRecord::new("openai", "gpt-4", 10, 5));
        settings.write().unwrap().max_in_flight = 3;
        dispatcher.send(UsageRecord::new("openai", "gpt-4", 10, 5));
        dispatcher.send(UsageRecord::new("openai", "gpt-4", 10, 5));

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(server.received_requests().await.unwrap_or_default().len(), 3);

        settings.write().unwrap().max_in_flight = 1;
        for _ in 0..3 {
            dispatcher.send(UsageRecord::new("openai", "gpt-4", 10, 5));
        }

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(server.received_requests().await.unwrap_or_default().len(), 4);
    }

    #[tokio::test]
    async fn test_send_from_thread_without_runtime() {
        let server = tracking_server(0.0).await;
        let dispatcher = dispatcher(active_settings(track_url(&server)));

        std::thread::scope(|s| {
            s.spawn(|| {
                assert!(Handle::try_current().is_err());
                assert!(dispatcher.bind_runtime());
                dispatcher.send(UsageRecord::new("openai", "gpt-4", 10, 5));
            });
        });

        assert_eq!(wait_for_requests(&server, 1).await.len(), 1);
    }
}
