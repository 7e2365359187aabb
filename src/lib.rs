//! # comfy-render
//!
//! Snapshot-to-render orchestration for [ComfyUI](https://github.com/comfyanonymous/ComfyUI).
//!
//! Takes a captured image and a text prompt, fills them into a job-graph
//! template, queues the job, polls until ComfyUI produces an image, and
//! downloads it. The work runs on a background task; the caller keeps a
//! status stream and can stop the render at any time.
//!
//! ## Pieces
//!
//! - [`WorkflowBuilder`]: fills image, prompt and seed into a copy of a
//!   fixed template graph. Pure, no I/O.
//! - [`ServiceClient`]: health check, submit, poll, artifact download
//!   (probing `output`, `temp`, `input` in that order) and interrupt.
//! - [`JobOrchestrator`]: the single-flight state machine
//!   `Connecting → Encoding → Submitting → Polling → Downloading` ending in
//!   `Succeeded`, `Failed` or `Cancelled`.
//! - [`CancellationToken`]: the shared stop flag, checked between steps.
//!
//! ## Quick Start
//!
//! ```no_run
//! use comfy_render::{JobOrchestrator, OrchestratorConfig, RenderOutcome, RenderRequest, Settings};
//!
//! # async fn example() -> comfy_render::Result<()> {
//! let settings = Settings::new("http://127.0.0.1:8188");
//! let orchestrator = JobOrchestrator::new(OrchestratorConfig::default());
//!
//! let handle = orchestrator.start(
//!     RenderRequest::new("snapshot.png", "modern house, overcast daylight"),
//!     &settings,
//! )?;
//!
//! match handle.outcome().await {
//!     RenderOutcome::Succeeded { image, seed, .. } => {
//!         println!("{} bytes (seed {})", image.len(), seed);
//!     }
//!     RenderOutcome::Failed(e) => eprintln!("Render failed: {}", e),
//!     RenderOutcome::Cancelled => eprintln!("Render stopped"),
//! }
//! # Ok(())
//! # }
//! ```

pub mod cancel;
pub mod client;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod types;
pub mod workflow;

pub use cancel::CancellationToken;
pub use client::ServiceClient;
pub use config::{OrchestratorConfig, OrchestratorConfigBuilder, ServiceTimeouts, Settings};
pub use error::{RenderError, Result};
pub use orchestrator::{JobOrchestrator, RenderHandle};
pub use types::{
    select_artifact, ArtifactRef, HistoryEntry, ImageRef, JobHandle, JobStatus, RenderOutcome,
    RenderRequest, RenderState, StatusPayload, StatusUpdate, StorageClass,
};
pub use workflow::{JobGraph, LeafBinding, TemplateBindings, WorkflowBuilder, WorkflowTemplate};
