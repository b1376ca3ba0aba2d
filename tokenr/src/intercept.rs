//! Explicit interception of vendor client calls.
//!
//! Callers adapt their vendor client to [`LlmEndpoint`] and wrap it with
//! [`Intercepted`]. The wrapper forwards every call untouched apart from
//! removing the `tokenr_*` attribution keys, and reports each successful
//! response to a [`CallObserver`].

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokenr_common::{TagValue, Tags};

use crate::usage::Vendor;

pub const AGENT_ID_KEY: &str = "tokenr_agent_id";
pub const FEATURE_KEY: &str = "tokenr_feature";
pub const TEAM_ID_KEY: &str = "tokenr_team_id";
pub const TAGS_KEY: &str = "tokenr_tags";

/// Per-call attribution supplied next to the vendor request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Attribution {
    pub agent_id: Option<String>,
    pub feature_name: Option<String>,
    pub team_id: Option<String>,
    pub tags: Tags,
}

impl Attribution {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn agent_id(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    pub fn feature(mut self, feature_name: impl Into<String>) -> Self {
        self.feature_name = Some(feature_name.into());
        self
    }

    pub fn team_id(mut self, team_id: impl Into<String>) -> Self {
        self.team_id = Some(team_id.into());
        self
    }

    pub fn tag(mut self, key: impl Into<String>, value: impl Into<TagValue>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    /// Removes the attribution keys from a request object and collects them.
    ///
    /// Keys holding a value of the wrong type are still removed, but ignored.
    pub fn extract(request: &mut Value) -> Self {
        let Some(fields) = request.as_object_mut() else {
            return Self::default();
        };

        let text = |value: Option<Value>| match value {
            Some(Value::String(s)) => Some(s),
            _ => None,
        };

        Self {
            agent_id: text(fields.remove(AGENT_ID_KEY)),
            feature_name: text(fields.remove(FEATURE_KEY)),
            team_id: text(fields.remove(TEAM_ID_KEY)),
            tags: match fields.remove(TAGS_KEY) {
                Some(Value::Object(tags)) => parse_tags(tags),
                _ => Tags::new(),
            },
        }
    }

    /// Writes the attribution back as request keys, for an inner layer to
    /// extract.
    fn insert_into(self, request: &mut Value) {
        let Some(fields) = request.as_object_mut() else {
            return;
        };

        for (key, value) in [
            (AGENT_ID_KEY, self.agent_id),
            (FEATURE_KEY, self.feature_name),
            (TEAM_ID_KEY, self.team_id),
        ] {
            if let Some(value) = value {
                fields.insert(key.to_string(), Value::String(value));
            }
        }

        if !self.tags.is_empty() {
            if let Ok(tags) = serde_json::to_value(&self.tags) {
                fields.insert(TAGS_KEY.to_string(), tags);
            }
        }
    }

    /// Fields set in `other` win; tags are merged with `other`'s keys winning.
    fn overridden_by(mut self, other: Attribution) -> Self {
        self.agent_id = other.agent_id.or(self.agent_id);
        self.feature_name = other.feature_name.or(self.feature_name);
        self.team_id = other.team_id.or(self.team_id);
        self.tags.extend(other.tags);
        self
    }
}

fn parse_tags(tags: Map<String, Value>) -> Tags {
    tags.into_iter()
        .filter_map(|(key, value)| {
            serde_json::from_value::<TagValue>(value)
                .ok()
                .map(|value| (key, value))
        })
        .collect()
}

/// A vendor's request-issuing entry point.
#[async_trait]
pub trait LlmEndpoint: Send + Sync {
    type Error: Send;

    fn vendor(&self) -> Vendor;

    /// Base URL the client is pointed at, if it exposes one.
    fn base_url(&self) -> Option<&str> {
        None
    }

    async fn create(&self, request: Value) -> Result<Value, Self::Error>;

    /// True when calls already pass through an observing wrapper.
    fn is_intercepted(&self) -> bool {
        false
    }
}

/// What an observer learns about a successful call.
#[derive(Debug)]
pub struct ObservedCall<'a> {
    pub vendor: Vendor,
    pub base_url: Option<&'a str>,
    pub response: &'a Value,
    pub elapsed: Duration,
    pub attribution: Attribution,
}

pub trait CallObserver: Send + Sync {
    /// Runs before the request is forwarded. Whatever is left in `request`
    /// reaches the vendor.
    fn before_call(&self, request: &mut Value) -> Attribution {
        Attribution::extract(request)
    }

    /// Runs after the vendor returned successfully. Must not block.
    fn after_success(&self, call: ObservedCall<'_>);
}

/// An endpoint whose calls are reported to an observer.
pub struct Intercepted<E> {
    inner: E,
    // None when `inner` is already observed.
    observer: Option<Arc<dyn CallObserver>>,
}

impl<E: LlmEndpoint> Intercepted<E> {
    pub fn new(inner: E, observer: Arc<dyn CallObserver>) -> Self {
        let observer = (!inner.is_intercepted()).then_some(observer);
        Self { inner, observer }
    }

    pub fn inner(&self) -> &E {
        &self.inner
    }

    pub fn into_inner(self) -> E {
        self.inner
    }

    /// Like [`LlmEndpoint::create`], with attribution passed alongside the
    /// request. Values here win over `tokenr_*` keys in the request.
    pub async fn create_with(
        &self,
        mut request: Value,
        attribution: Attribution,
    ) -> Result<Value, E::Error> {
        let Some(observer) = &self.observer else {
            attribution.insert_into(&mut request);
            return self.inner.create(request).await;
        };

        let attribution = observer.before_call(&mut request).overridden_by(attribution);

        let started = Instant::now();
        let response = self.inner.create(request).await?;
        let elapsed = started.elapsed();

        observer.after_success(ObservedCall {
            vendor: self.inner.vendor(),
            base_url: self.inner.base_url(),
            response: &response,
            elapsed,
            attribution,
        });

        Ok(response)
    }
}

#[async_trait]
impl<E: LlmEndpoint> LlmEndpoint for Intercepted<E> {
    type Error = E::Error;

    fn vendor(&self) -> Vendor {
        self.inner.vendor()
    }

    fn base_url(&self) -> Option<&str> {
        self.inner.base_url()
    }

    async fn create(&self, request: Value) -> Result<Value, Self::Error> {
        self.create_with(request, Attribution::default()).await
    }

    fn is_intercepted(&self) -> bool {
        true
    }
}
