use bytes::Bytes;
use reqwest::Client;
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::ServiceTimeouts;
use crate::error::{RenderError, Result};
use crate::types::{HistoryEntry, ImageRef, JobHandle, StorageClass};
use crate::workflow::JobGraph;

fn normalize(endpoint: String) -> String {
    endpoint.trim_end_matches('/').to_string()
}

/// Thin HTTP façade over the five ComfyUI endpoints a render needs.
///
/// Holds no job state and never retries; retry and fallback policy belongs
/// to the caller. Cheap to clone (the inner `reqwest::Client` is pooled).
///
/// # Example
/// ```no_run
/// use comfy_render::ServiceClient;
///
/// # async fn example() {
/// let client = ServiceClient::new("http://127.0.0.1:8188");
/// let (ok, message) = client.health_check().await;
/// println!("{}: {}", ok, message);
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct ServiceClient {
    http: Client,
    endpoint: String,
    timeouts: ServiceTimeouts,
    min_artifact_bytes: usize,
}

impl ServiceClient {
    /// Create a new client pointing at the given ComfyUI endpoint.
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            endpoint: normalize(endpoint.into()),
            timeouts: ServiceTimeouts::default(),
            min_artifact_bytes: 1000,
        }
    }

    /// Use a custom `reqwest::Client` (for connection pooling, proxies, TLS).
    pub fn with_http_client(mut self, client: Client) -> Self {
        self.http = client;
        self
    }

    pub fn with_timeouts(mut self, timeouts: ServiceTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Downloads of this many bytes or fewer are treated as error pages.
    pub fn with_min_artifact_bytes(mut self, bytes: usize) -> Self {
        self.min_artifact_bytes = bytes;
        self
    }

    /// Returns the configured endpoint URL.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn connect_error(&self, e: reqwest::Error) -> RenderError {
        RenderError::Connect {
            endpoint: self.endpoint.clone(),
            message: format!("Cannot reach {}\n{}", self.endpoint, e),
        }
    }

    // ── Health ──────────────────────────────────────────────────────

    /// Probe `/system_stats`. Never fails; returns `(ok, diagnostic)`.
    pub async fn health_check(&self) -> (bool, String) {
        let url = format!("{}/system_stats", self.endpoint);
        let resp = self
            .http
            .get(&url)
            .timeout(self.timeouts.health)
            .send()
            .await;
        match resp {
            Ok(r) if r.status().is_success() => {
                // Drain the body so the connection can be reused.
                let _ = r.bytes().await;
                (true, "Connected".to_string())
            }
            Ok(r) => (
                false,
                format!("Cannot reach {}\nHTTP {}", self.endpoint, r.status().as_u16()),
            ),
            Err(e) => (false, format!("Cannot reach {}\n{}", self.endpoint, e)),
        }
    }

    // ── Submit ──────────────────────────────────────────────────────

    /// Queue a job graph under `client_id`. Returns the job handle.
    pub async fn submit(&self, graph: &JobGraph, client_id: &str) -> Result<JobHandle> {
        let url = format!("{}/prompt", self.endpoint);
        let body = serde_json::json!({
            "prompt": graph,
            "client_id": client_id,
        });

        let resp = self
            .http
            .post(&url)
            .timeout(self.timeouts.submit)
            .json(&body)
            .send()
            .await
            .map_err(|e| self.connect_error(e))?;

        let status = resp.status();
        let text = resp.text().await.map_err(|e| self.connect_error(e))?;

        if !status.is_success() {
            return Err(RenderError::protocol(
                format!("HTTP {} from {}", status.as_u16(), url),
                &text,
            ));
        }

        let json: Value = serde_json::from_str(&text)
            .map_err(|_| RenderError::protocol("Malformed /prompt response", &text))?;

        if let Some(errors) = json.get("node_errors").and_then(|e| e.as_object()) {
            if !errors.is_empty() {
                return Err(RenderError::protocol("Workflow node errors", &text));
            }
        }

        json.get("prompt_id")
            .and_then(|v| v.as_str())
            .map(|id| JobHandle {
                job_id: id.to_string(),
            })
            .ok_or_else(|| RenderError::protocol("No prompt_id. Got", &text))
    }

    // ── History ─────────────────────────────────────────────────────

    /// Fetch the history entry for a job.
    ///
    /// Returns `None` while the job is not in history yet, and also on any
    /// transport or parse failure: a flaky poll is "not yet", not fatal.
    pub async fn poll(&self, job_id: &str) -> Option<HistoryEntry> {
        let url = format!("{}/history/{}", self.endpoint, job_id);
        let resp = match self
            .http
            .get(&url)
            .timeout(self.timeouts.poll)
            .send()
            .await
        {
            Ok(r) if r.status().is_success() => r,
            Ok(r) => {
                debug!(job_id, status = r.status().as_u16(), "History not available");
                return None;
            }
            Err(e) => {
                warn!(job_id, error = %e, "History poll failed");
                return None;
            }
        };

        let json: Value = match resp.json().await {
            Ok(j) => j,
            Err(e) => {
                warn!(job_id, error = %e, "History response was not JSON");
                return None;
            }
        };

        parse_history(&json, job_id)
    }

    // ── Artifact download ───────────────────────────────────────────

    /// Download a named artifact, probing each storage class in
    /// [`StorageClass::RETRIEVAL_ORDER`]. The first plausible body wins.
    pub async fn fetch_artifact(&self, filename: &str) -> Result<Bytes> {
        let mut tried = Vec::with_capacity(StorageClass::RETRIEVAL_ORDER.len());
        for class in StorageClass::RETRIEVAL_ORDER {
            tried.push(class);
            match self.fetch_from(filename, class).await {
                Ok(bytes) if self.is_plausible(&bytes) => {
                    debug!(filename, class = %class, len = bytes.len(), "Artifact retrieved");
                    return Ok(bytes);
                }
                Ok(bytes) => {
                    debug!(filename, class = %class, len = bytes.len(), "Artifact body too small");
                }
                Err(e) => {
                    debug!(filename, class = %class, error = %e, "Artifact probe failed");
                }
            }
        }
        Err(RenderError::NotFound {
            filename: filename.to_string(),
            tried,
        })
    }

    /// Bodies at or below the threshold are error pages served as 200.
    fn is_plausible(&self, bytes: &[u8]) -> bool {
        bytes.len() > self.min_artifact_bytes
    }

    async fn fetch_from(&self, filename: &str, class: StorageClass) -> Result<Bytes> {
        let url = reqwest::Url::parse_with_params(
            &format!("{}/view", self.endpoint),
            &[("filename", filename), ("type", class.as_str())],
        )
        .map_err(|e| RenderError::protocol("Bad image URL", &e.to_string()))?;

        let resp = self
            .http
            .get(url)
            .timeout(self.timeouts.download)
            .send()
            .await
            .map_err(|e| self.connect_error(e))?;

        if !resp.status().is_success() {
            return Err(RenderError::protocol(
                format!("HTTP {} downloading {}", resp.status().as_u16(), filename),
                "",
            ));
        }

        resp.bytes().await.map_err(|e| self.connect_error(e))
    }

    // ── Control ─────────────────────────────────────────────────────

    /// Ask ComfyUI to interrupt the running job. Best effort: failures are
    /// logged and dropped.
    pub async fn interrupt(&self) {
        let url = format!("{}/interrupt", self.endpoint);
        match self
            .http
            .post(&url)
            .timeout(self.timeouts.interrupt)
            .json(&serde_json::json!({}))
            .send()
            .await
        {
            Ok(r) if r.status().is_success() => debug!("Interrupt sent"),
            Ok(r) => warn!(status = r.status().as_u16(), "Interrupt rejected"),
            Err(e) => warn!(error = %e, "Interrupt failed"),
        }
    }
}

/// Pull `job_id`'s entry out of a `/history` response.
fn parse_history(json: &Value, job_id: &str) -> Option<HistoryEntry> {
    let entry = json.get(job_id)?;

    let status = entry
        .pointer("/status/status_str")
        .and_then(|v| v.as_str())
        .unwrap_or("unknown")
        .to_string();

    let completed = entry
        .pointer("/status/completed")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);

    let mut images = Vec::new();
    if let Some(outputs) = entry.get("outputs").and_then(|o| o.as_object()) {
        for node_output in outputs.values() {
            let Some(imgs) = node_output.get("images").and_then(|i| i.as_array()) else {
                continue;
            };
            for img in imgs {
                match serde_json::from_value::<ImageRef>(img.clone()) {
                    Ok(image) => images.push(image),
                    Err(e) => debug!(job_id, error = %e, "Skipping malformed image entry"),
                }
            }
        }
    }

    Some(HistoryEntry {
        status,
        completed,
        images,
    })
}
