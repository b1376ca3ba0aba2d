use std::{
    sync::{Arc, RwLock},
    time::Duration,
};

use config::{Config, ConfigError, Environment};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokenr_common::{TagValue, Tags};

pub const DEFAULT_TRACK_URL: &str = "https://tokenr.co/api/v1/track";
const DEFAULT_TIMEOUT_SECONDS: u64 = 2;
const DEFAULT_MAX_IN_FLIGHT: usize = 64;

/// Override keys accepted under another name, and the field they set.
const OVERRIDE_ALIASES: &[(&str, &str)] = &[("timeout", "timeout_secs")];

/// Fallbacks read from `TOKENR_*` environment variables (and `.env`).
#[derive(Debug, Deserialize, Clone, Default)]
pub struct EnvSettings {
    pub token: Option<String>,
    pub url: Option<String>,
}

impl EnvSettings {
    pub fn new() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let s = Config::builder()
            .add_source(Environment::with_prefix("TOKENR"))
            .build()?;

        s.try_deserialize()
    }
}

/// Options accepted by [`Tracker::initialize`](crate::Tracker::initialize).
#[derive(Debug, Clone)]
pub struct InitOptions {
    pub token: Option<String>,
    pub url: Option<String>,
    pub agent_id: Option<String>,
    pub tags: Tags,
    pub enabled: bool,
    pub debug: bool,
}

impl Default for InitOptions {
    fn default() -> Self {
        Self {
            token: None,
            url: None,
            agent_id: None,
            tags: Tags::new(),
            enabled: true,
            debug: false,
        }
    }
}

impl InitOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn agent_id(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    pub fn tag(mut self, key: impl Into<String>, value: impl Into<TagValue>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }
}

/// Live tracker configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub token: Option<String>,
    pub url: String,
    pub enabled: bool,
    pub timeout_secs: u64,
    pub debug: bool,
    pub default_agent_id: Option<String>,
    pub default_tags: Tags,
    /// Upper bound on submissions in flight at once. Changes apply to the
    /// next submission.
    pub max_in_flight: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            token: None,
            url: DEFAULT_TRACK_URL.to_string(),
            enabled: true,
            timeout_secs: DEFAULT_TIMEOUT_SECONDS,
            debug: false,
            default_agent_id: None,
            default_tags: Tags::new(),
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

impl Settings {
    /// Replaces everything `init` owns. Timeout and in-flight limit carry over.
    pub fn apply_init(&mut self, options: InitOptions, env: EnvSettings) {
        self.token = non_empty(options.token).or_else(|| non_empty(env.token));
        self.url = non_empty(options.url)
            .or_else(|| non_empty(env.url))
            .unwrap_or_else(|| DEFAULT_TRACK_URL.to_string());
        self.enabled = options.enabled;
        self.debug = options.debug;
        self.default_agent_id = options.agent_id;
        self.default_tags = options.tags;
    }

    /// Merges arbitrary overrides. Unknown keys are ignored; a value of the
    /// wrong type rejects the whole update and leaves `self` untouched.
    /// `timeout` is accepted for `timeout_secs`.
    pub fn merge_overrides(
        &mut self,
        mut overrides: Map<String, Value>,
    ) -> Result<(), serde_json::Error> {
        for &(alias, field) in OVERRIDE_ALIASES {
            if let Some(value) = overrides.remove(alias) {
                overrides.insert(field.to_string(), value);
            }
        }

        let mut current = serde_json::to_value(&*self)?;
        if let Value::Object(fields) = &mut current {
            fields.extend(overrides);
        }
        *self = serde_json::from_value(current)?;
        Ok(())
    }

    /// Enabled and holding a credential.
    pub fn is_active(&self) -> bool {
        self.enabled && self.token.as_deref().is_some_and(|t| !t.is_empty())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

pub type SharedSettings = Arc<RwLock<Settings>>;

/// Copies the current settings out, ignoring lock poisoning.
pub fn snapshot(settings: &SharedSettings) -> Settings {
    settings.read().unwrap_or_else(|e| e.into_inner()).clone()
}
