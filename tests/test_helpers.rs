#![allow(dead_code)]

use comfy_render::*;
use httpmock::MockServer;
use std::io::Write;
use std::time::Duration;
use tempfile::NamedTempFile;
use tokio::sync::broadcast;

/// A fake captured snapshot on disk.
pub fn snapshot() -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(&[0x89, b'P', b'N', b'G', 1, 2, 3, 4]).unwrap();
    file
}

/// A snapshot of `len` bytes.
pub fn snapshot_of_size(len: usize) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(&vec![0xAB; len]).unwrap();
    file
}

/// Fast polling so ceilings are reached in well under a second.
pub fn fast_config(poll_interval_ms: u64) -> OrchestratorConfig {
    OrchestratorConfig::builder()
        .with_poll_interval(Duration::from_millis(poll_interval_ms))
        .build()
}

pub fn settings_for(server: &MockServer) -> Settings {
    Settings::new(server.base_url())
}

/// Everything published so far, without waiting.
pub fn drain(rx: &mut broadcast::Receiver<StatusUpdate>) -> Vec<StatusUpdate> {
    let mut updates = Vec::new();
    while let Ok(update) = rx.try_recv() {
        updates.push(update);
    }
    updates
}

pub fn states(updates: &[StatusUpdate]) -> Vec<RenderState> {
    updates.iter().map(|u| u.state).collect()
}

/// Mock a healthy `/system_stats`.
pub fn mock_health(server: &MockServer) -> httpmock::Mock<'_> {
    server.mock(|when, then| {
        when.method("GET").path("/system_stats");
        then.status(200)
            .header("content-type", "application/json")
            .body(r#"{"system": {"os": "posix"}}"#);
    })
}

pub fn mock_submit<'a>(server: &'a MockServer, job_id: &str) -> httpmock::Mock<'a> {
    let body = serde_json::json!({"prompt_id": job_id, "number": 1, "node_errors": {}});
    server.mock(|when, then| {
        when.method("POST").path("/prompt");
        then.status(200).json_body(body);
    })
}
