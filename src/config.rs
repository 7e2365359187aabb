use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tracing::warn;

use crate::error::{RenderError, Result};

/// Generation settings supplied by the host's settings store.
///
/// Read once per render and never written back. Missing keys fall back to
/// the defaults below, so a partial settings file is fine.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Settings {
    #[serde(alias = "comfy_url")]
    pub service_base_url: String,
    pub steps: u32,
    pub cfg_scale: f64,
    pub denoise: f64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            service_base_url: "http://127.0.0.1:8000".to_string(),
            steps: 20,
            cfg_scale: 7.0,
            denoise: 0.75,
        }
    }
}

impl Settings {
    /// Settings pointing at `service_base_url`, defaults otherwise.
    pub fn new(service_base_url: impl Into<String>) -> Self {
        Self {
            service_base_url: service_base_url.into(),
            ..Self::default()
        }
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| RenderError::InvalidSettings(e.to_string()))
    }

    /// Read a settings file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            RenderError::InvalidSettings(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_json_str(&raw)
    }

    /// Read a settings file, falling back to defaults if it is missing or
    /// unreadable.
    pub fn load_or_default(path: &Path) -> Self {
        if !path.exists() {
            return Self::default();
        }
        match Self::load(path) {
            Ok(s) => s,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Falling back to default settings");
                Self::default()
            }
        }
    }

    /// The validated service URL with trailing slashes removed.
    pub fn base_url(&self) -> Result<String> {
        let trimmed = self.service_base_url.trim().trim_end_matches('/');
        if trimmed.is_empty() {
            return Err(RenderError::InvalidSettings("URL cannot be empty".into()));
        }
        let url = reqwest::Url::parse(trimmed)
            .map_err(|e| RenderError::InvalidSettings(format!("bad URL '{}': {}", trimmed, e)))?;
        match url.scheme() {
            "http" | "https" => Ok(trimmed.to_string()),
            other => Err(RenderError::InvalidSettings(format!(
                "unsupported URL scheme '{}'",
                other
            ))),
        }
    }
}

/// Per-call HTTP timeouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceTimeouts {
    pub health: Duration,
    pub submit: Duration,
    pub poll: Duration,
    pub download: Duration,
    pub interrupt: Duration,
}

impl Default for ServiceTimeouts {
    fn default() -> Self {
        Self {
            health: Duration::from_secs(5),
            submit: Duration::from_secs(60),
            poll: Duration::from_secs(30),
            download: Duration::from_secs(120),
            interrupt: Duration::from_secs(5),
        }
    }
}

/// Orchestrator tuning.
///
/// Use [`OrchestratorConfig::builder()`] for ergonomic construction, or
/// [`OrchestratorConfig::default()`] for the stock 5 s x 120 poll ceiling.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Sleep between history polls.
    pub poll_interval: Duration,

    /// Polls before giving up with a timeout.
    pub max_poll_attempts: u32,

    /// Downloads at or below this size are treated as error pages.
    pub min_artifact_bytes: usize,

    /// Buffered status updates per subscriber before the oldest are dropped.
    pub status_capacity: usize,

    pub timeouts: ServiceTimeouts,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            max_poll_attempts: 120,
            min_artifact_bytes: 1000,
            status_capacity: 64,
            timeouts: ServiceTimeouts::default(),
        }
    }
}

impl OrchestratorConfig {
    /// Start building a config with the builder pattern.
    pub fn builder() -> OrchestratorConfigBuilder {
        OrchestratorConfigBuilder::default()
    }
}

/// Builder for [`OrchestratorConfig`].
#[derive(Default)]
pub struct OrchestratorConfigBuilder {
    config: OrchestratorConfig,
}

impl OrchestratorConfigBuilder {
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.config.poll_interval = interval;
        self
    }

    pub fn with_max_poll_attempts(mut self, attempts: u32) -> Self {
        self.config.max_poll_attempts = attempts;
        self
    }

    pub fn with_min_artifact_bytes(mut self, bytes: usize) -> Self {
        self.config.min_artifact_bytes = bytes;
        self
    }

    /// Clamped to at least 1, since a zero-capacity broadcast channel panics.
    pub fn with_status_capacity(mut self, capacity: usize) -> Self {
        self.config.status_capacity = capacity.max(1);
        self
    }

    pub fn with_timeouts(mut self, timeouts: ServiceTimeouts) -> Self {
        self.config.timeouts = timeouts;
        self
    }

    /// Build the final [`OrchestratorConfig`].
    pub fn build(self) -> OrchestratorConfig {
        self.config
    }
}
