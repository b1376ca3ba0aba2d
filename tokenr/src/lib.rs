pub mod detect;
pub mod dispatch;
pub mod error;
pub mod intercept;
pub mod settings;
pub mod usage;

#[cfg(test)]
mod test_support;

use std::{
    collections::HashSet,
    sync::{Arc, Mutex, RwLock},
};

use log::{debug, info, warn};
use serde_json::{Map, Value};

pub use tokenr_common::{Status, TagValue, Tags, TrackAck, UsageRecord};

pub use crate::{
    error::{Result, TrackerError},
    intercept::{Attribution, CallObserver, Intercepted, LlmEndpoint, ObservedCall},
    settings::{InitOptions, Settings},
    usage::Vendor,
};
use crate::{
    detect::ProviderDetector,
    dispatch::{Dispatcher, apply_defaults},
    settings::{EnvSettings, SharedSettings, snapshot},
    usage::normalize,
};

/// Tracking context: configuration, vendor interceptors and the dispatcher.
///
/// ```no_run
/// # async fn run() {
/// use tokenr::{InitOptions, Tracker};
///
/// let tracker = Tracker::init(InitOptions::new().agent_id("support-bot").tag("env", "prod"));
/// # let _ = tracker;
/// # }
/// ```
pub struct Tracker {
    settings: SharedSettings,
    dispatcher: Dispatcher,
    detector: ProviderDetector,
    installed: Mutex<HashSet<Vendor>>,
}

impl Default for Tracker {
    fn default() -> Self {
        Self::new()
    }
}

impl Tracker {
    /// An uninitialized tracker. Nothing is tracked until
    /// [`initialize`](Self::initialize) succeeds.
    pub fn new() -> Self {
        Self::with_settings(Settings::default())
    }

    pub fn with_settings(settings: Settings) -> Self {
        let settings = Arc::new(RwLock::new(settings));
        Self {
            dispatcher: Dispatcher::new(Arc::clone(&settings)),
            settings,
            detector: ProviderDetector::default(),
            installed: Mutex::new(HashSet::new()),
        }
    }

    /// Create and initialize a shared tracker.
    pub fn init(options: InitOptions) -> Arc<Self> {
        let tracker = Arc::new(Self::new());
        tracker.initialize(options);
        tracker
    }

    /// Apply init options and install interception for every vendor that is
    /// compiled in. Never fails: a missing token or an HTTP client that
    /// cannot be built leaves tracking inert. Works outside a Tokio runtime.
    pub fn initialize(&self, options: InitOptions) {
        let debug_enabled = options.debug;
        let env = EnvSettings::new().unwrap_or_else(|e| {
            if debug_enabled {
                warn!("[tokenr] Could not read environment: {}", e);
            }
            EnvSettings::default()
        });

        let settings = {
            let mut guard = self.settings.write().unwrap_or_else(|e| e.into_inner());
            guard.apply_init(options, env);
            guard.clone()
        };

        let Some(token) = settings.token.as_deref() else {
            if settings.debug {
                warn!("[tokenr] No API token provided. Set TOKENR_TOKEN or pass a token to init.");
            }
            return;
        };

        if !self.dispatcher.bind_runtime() {
            if settings.debug {
                warn!("[tokenr] HTTP client unavailable. Tracking disabled.");
            }
            return;
        }

        for vendor in Vendor::supported() {
            self.install(vendor, settings.debug);
        }

        if settings.debug {
            let prefix: String = token.chars().take(8).collect();
            info!("[tokenr] Initialized with token {}...", prefix);
        }
    }

    fn install(&self, vendor: Vendor, debug_enabled: bool) {
        let mut installed = self.installed.lock().unwrap_or_else(|e| e.into_inner());
        if installed.insert(vendor) && debug_enabled {
            debug!("[tokenr] Intercepting {}", vendor.entry_point());
        }
    }

    pub fn is_installed(&self, vendor: Vendor) -> bool {
        self.installed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&vendor)
    }

    pub fn installed(&self) -> Vec<Vendor> {
        Vendor::supported()
            .into_iter()
            .filter(|&vendor| self.is_installed(vendor))
            .collect()
    }

    /// Merge overrides into the live settings, e.g. `{"debug": true}`.
    pub fn configure(&self, overrides: Map<String, Value>) -> Result<()> {
        self.settings
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .merge_overrides(overrides)?;
        Ok(())
    }

    pub fn settings(&self) -> Settings {
        snapshot(&self.settings)
    }

    /// Track usage from a call made without an intercepted client.
    /// Returns immediately; delivery happens in the background.
    pub fn track(&self, record: UsageRecord) {
        self.dispatcher.track(record);
    }

    /// Like [`track`](Self::track), but waits for the single delivery
    /// attempt and reports its outcome.
    pub async fn track_now(&self, record: UsageRecord) -> Result<TrackAck> {
        let settings = self.settings();
        if !settings.enabled {
            return Err(TrackerError::Disabled);
        }
        if !settings.is_active() {
            return Err(TrackerError::MissingToken);
        }

        let record = apply_defaults(record, &settings);
        self.dispatcher.submit(&record).await
    }

    /// Wrap a vendor endpoint so its calls are tracked by this tracker.
    pub fn intercept<E: LlmEndpoint>(self: &Arc<Self>, endpoint: E) -> Intercepted<E> {
        Intercepted::new(endpoint, Arc::clone(self) as Arc<dyn CallObserver>)
    }

    fn provider_for(&self, vendor: Vendor, base_url: Option<&str>) -> &'static str {
        match vendor {
            Vendor::OpenAi => self.detector.detect(base_url),
            Vendor::Anthropic => "anthropic",
        }
    }
}

impl CallObserver for Tracker {
    fn after_success(&self, call: ObservedCall<'_>) {
        if !self.is_installed(call.vendor) {
            return;
        }

        let Some(usage) = normalize(call.response, call.vendor) else {
            return;
        };

        let attribution = call.attribution;
        let record = UsageRecord {
            provider: self.provider_for(call.vendor, call.base_url).to_string(),
            model: usage.model,
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            cache_read_tokens: usage.cache_read_tokens,
            cache_write_tokens: usage.cache_write_tokens,
            agent_id: attribution.agent_id,
            feature_name: attribution.feature_name,
            team_id: attribution.team_id,
            latency_ms: Some(u64::try_from(call.elapsed.as_millis()).unwrap_or(u64::MAX)),
            tags: attribution.tags,
            ..UsageRecord::default()
        };

        self.dispatcher.track(record);
    }
}
