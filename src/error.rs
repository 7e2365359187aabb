use std::path::PathBuf;

use thiserror::Error;

use crate::types::StorageClass;

/// Errors produced while orchestrating a render.
#[derive(Error, Debug)]
pub enum RenderError {
    /// The service could not be reached at all. `message` already names the
    /// endpoint.
    #[error("{message}")]
    Connect { endpoint: String, message: String },

    /// The service answered, but not in the shape we expect.
    #[error("{context}: {excerpt}")]
    Protocol { context: String, excerpt: String },

    /// The artifact was absent under every storage class.
    #[error(
        "Could not download image '{filename}' from ComfyUI (tried types: {})",
        StorageClass::join(.tried)
    )]
    NotFound {
        filename: String,
        tried: Vec<StorageClass>,
    },

    /// The poll ceiling was reached without a finished job.
    #[error("Timed out after {attempts} polls ({waited_secs}s)")]
    Timeout { attempts: u32, waited_secs: u64 },

    /// The user stopped the render. Not a failure.
    #[error("Render stopped by user")]
    Cancelled,

    /// A render is already in flight on this orchestrator.
    #[error("A render is already in progress")]
    AlreadyRunning,

    /// ComfyUI reported an execution error for the job.
    #[error("Generation failed: {0}")]
    JobFailed(String),

    /// The captured snapshot could not be read.
    #[error("Cannot read snapshot {}: {source}", .path.display())]
    Image {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid settings: {0}")]
    InvalidSettings(String),

    #[error("Invalid workflow template: {0}")]
    InvalidTemplate(String),

    /// The background task died before producing an outcome.
    #[error("Render task aborted: {0}")]
    Task(String),
}

impl RenderError {
    /// `true` for the user-requested stop, which is a terminal outcome
    /// rather than a failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, RenderError::Cancelled)
    }

    pub(crate) fn protocol(context: impl Into<String>, raw: &str) -> Self {
        RenderError::Protocol {
            context: context.into(),
            excerpt: excerpt(raw, MAX_EXCERPT_CHARS),
        }
    }
}

/// Convenience alias.
pub type Result<T> = std::result::Result<T, RenderError>;

pub(crate) const MAX_EXCERPT_CHARS: usize = 300;

/// Truncate `raw` to at most `max` characters, never splitting a char.
pub(crate) fn excerpt(raw: &str, max: usize) -> String {
    match raw.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &raw[..idx]),
        None => raw.to_string(),
    }
}
