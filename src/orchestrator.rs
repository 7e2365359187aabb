use bytes::Bytes;
use reqwest::Client;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::runtime::Handle;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::cancel::CancellationToken;
use crate::client::ServiceClient;
use crate::config::{OrchestratorConfig, Settings};
use crate::error::{excerpt, RenderError, Result};
use crate::types::{
    ArtifactRef, JobHandle, JobStatus, RenderOutcome, RenderRequest, RenderState,
    StatusPayload, StatusUpdate,
};
use crate::workflow::WorkflowBuilder;

const PROMPT_PREVIEW_CHARS: usize = 50;

/// Drives one render at a time against a ComfyUI service.
///
/// `start` hands the work to a background task and returns immediately, so
/// the caller's thread never blocks on the network. Progress is published
/// on a broadcast channel ([`subscribe`](Self::subscribe)); the final
/// result comes from [`RenderHandle::outcome`].
///
/// # Example
/// ```no_run
/// use comfy_render::{JobOrchestrator, OrchestratorConfig, RenderRequest, Settings};
///
/// # async fn example() -> comfy_render::Result<()> {
/// let orchestrator = JobOrchestrator::new(OrchestratorConfig::default());
/// let mut status = orchestrator.subscribe();
///
/// let handle = orchestrator.start(
///     RenderRequest::new("snapshot.png", "photorealistic, golden hour"),
///     &Settings::new("http://127.0.0.1:8188"),
/// )?;
///
/// tokio::spawn(async move {
///     while let Ok(update) = status.recv().await {
///         println!("{}", update.message);
///     }
/// });
///
/// let outcome = handle.outcome().await;
/// if let Some(png) = outcome.image() {
///     std::fs::write("render.png", png).unwrap();
/// }
/// # Ok(())
/// # }
/// ```
pub struct JobOrchestrator {
    config: OrchestratorConfig,
    builder: WorkflowBuilder,
    http: Client,
    runtime: Option<Handle>,
    cancel: CancellationToken,
    running: Arc<Mutex<bool>>,
    publisher: StatusPublisher,
}

impl std::fmt::Debug for JobOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobOrchestrator")
            .field("config", &self.config)
            .field("running", &self.is_running())
            .field("cancel_requested", &self.cancel.is_requested())
            .finish()
    }
}

impl Default for JobOrchestrator {
    fn default() -> Self {
        Self::new(OrchestratorConfig::default())
    }
}

impl JobOrchestrator {
    pub fn new(config: OrchestratorConfig) -> Self {
        let publisher = StatusPublisher::new(config.status_capacity);
        Self {
            config,
            builder: WorkflowBuilder::new(),
            http: Client::new(),
            runtime: None,
            cancel: CancellationToken::new(),
            running: Arc::new(Mutex::new(false)),
            publisher,
        }
    }

    /// Render with a custom workflow template instead of the built-in one.
    pub fn with_workflow(mut self, builder: WorkflowBuilder) -> Self {
        self.builder = builder;
        self
    }

    /// Use a custom `reqwest::Client` for all service calls.
    pub fn with_http_client(mut self, client: Client) -> Self {
        self.http = client;
        self
    }

    /// Spawn runs on this runtime. Without it, [`start`](Self::start) must
    /// be called from inside a Tokio runtime.
    pub fn with_runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Begin a render.
    ///
    /// Fails with [`RenderError::AlreadyRunning`] while a previous run has
    /// not reached a terminal state; the in-flight run is left untouched.
    /// A subscriber that has seen the terminal update can start again.
    ///
    /// Fails with [`RenderError::Task`] when called outside a Tokio runtime
    /// and no [`with_runtime`](Self::with_runtime) handle was given.
    pub fn start(&self, request: RenderRequest, settings: &Settings) -> Result<RenderHandle> {
        let runtime = match &self.runtime {
            Some(rt) => rt.clone(),
            None => Handle::try_current()
                .map_err(|e| RenderError::Task(format!("No Tokio runtime to run on: {}", e)))?,
        };

        {
            let mut running = lock_slot(&self.running);
            if *running {
                return Err(RenderError::AlreadyRunning);
            }
            *running = true;
            self.cancel.clear();
        }
        let mut guard = RunGuard {
            running: Arc::clone(&self.running),
            cancel: self.cancel.clone(),
            publisher: self.publisher.clone(),
            terminal: None,
        };

        let span = info_span!("render", client_id = %request.client_id);
        let run = RenderRun {
            config: self.config.clone(),
            builder: self.builder.clone(),
            http: self.http.clone(),
            cancel: self.cancel.clone(),
            publisher: self.publisher.clone(),
            request,
            settings: settings.clone(),
        };

        let task = async move {
            let outcome = run.execute().await;
            guard.terminal = Some(terminal_update(&outcome));
            drop(guard);
            outcome
        }
        .instrument(span);

        Ok(RenderHandle {
            join: runtime.spawn(task),
        })
    }

    /// Ask the current run to stop at its next checkpoint. Never blocks.
    pub fn request_stop(&self) {
        if self.is_running() {
            info!("Stop requested");
        }
        self.cancel.request();
    }

    /// A handle to this orchestrator's stop flag, for other threads.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_running(&self) -> bool {
        *lock_slot(&self.running)
    }

    /// Receive every status update from now on, in transition order.
    ///
    /// A receiver that falls more than `status_capacity` updates behind
    /// skips the oldest ones; the terminal update is always the last sent.
    pub fn subscribe(&self) -> broadcast::Receiver<StatusUpdate> {
        self.publisher.updates.subscribe()
    }

    /// The most recently published update.
    pub fn status(&self) -> StatusUpdate {
        self.publisher.latest.borrow().clone()
    }
}

/// The background half of one `start` call.
pub struct RenderHandle {
    join: JoinHandle<RenderOutcome>,
}

impl RenderHandle {
    /// Wait for the run to reach a terminal state. Once this returns the
    /// orchestrator accepts a new `start`.
    pub async fn outcome(self) -> RenderOutcome {
        match self.join.await {
            Ok(outcome) => outcome,
            Err(e) => RenderOutcome::Failed(RenderError::Task(e.to_string())),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }
}

fn lock_slot(slot: &Mutex<bool>) -> MutexGuard<'_, bool> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Ends a run: publishes its terminal update, clears the stop flag and
/// releases the single-flight slot, all under the slot lock so `start`
/// never observes the update without the slot being free.
///
/// A run dropped before recording a terminal update (panic, runtime
/// shutdown) still publishes a `Failed` one.
struct RunGuard {
    running: Arc<Mutex<bool>>,
    cancel: CancellationToken,
    publisher: StatusPublisher,
    terminal: Option<StatusUpdate>,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        let update = self.terminal.take().unwrap_or_else(|| {
            warn!("Render task ended without a result");
            terminal_update(&RenderOutcome::Failed(RenderError::Task(
                "render task ended without a result".to_string(),
            )))
        });
        let mut running = lock_slot(&self.running);
        self.publisher.publish(update);
        self.cancel.clear();
        *running = false;
    }
}

#[derive(Clone)]
struct StatusPublisher {
    updates: broadcast::Sender<StatusUpdate>,
    latest: Arc<watch::Sender<StatusUpdate>>,
}

impl StatusPublisher {
    fn new(capacity: usize) -> Self {
        let (updates, _) = broadcast::channel(capacity.max(1));
        let (latest, _) = watch::channel(StatusUpdate::idle());
        Self {
            updates,
            latest: Arc::new(latest),
        }
    }

    fn publish(&self, update: StatusUpdate) {
        debug!(state = update.state.as_str(), message = %update.message, "Status");
        self.latest.send_replace(update.clone());
        // No subscribers is fine.
        let _ = self.updates.send(update);
    }
}

fn terminal_update(outcome: &RenderOutcome) -> StatusUpdate {
    match outcome {
        RenderOutcome::Succeeded { image, .. } => StatusUpdate {
            state: RenderState::Succeeded,
            message: "Done!".to_string(),
            payload: StatusPayload::Image(image.clone()),
        },
        RenderOutcome::Failed(e) => StatusUpdate {
            state: RenderState::Failed,
            message: e.to_string(),
            payload: StatusPayload::Error(e.to_string()),
        },
        RenderOutcome::Cancelled => StatusUpdate::new(RenderState::Cancelled, "Render stopped."),
    }
}

struct Completed {
    image: Bytes,
    artifact: ArtifactRef,
    job_id: String,
    seed: i64,
}

struct RenderRun {
    config: OrchestratorConfig,
    builder: WorkflowBuilder,
    http: Client,
    cancel: CancellationToken,
    publisher: StatusPublisher,
    request: RenderRequest,
    settings: Settings,
}

impl RenderRun {
    async fn execute(&self) -> RenderOutcome {
        match self.drive().await {
            Ok(done) => {
                info!(
                    job_id = %done.job_id,
                    filename = %done.artifact.filename,
                    bytes = done.image.len(),
                    "Render succeeded"
                );
                RenderOutcome::Succeeded {
                    image: done.image,
                    artifact: done.artifact,
                    job_id: done.job_id,
                    seed: done.seed,
                }
            }
            Err(RenderError::Cancelled) => {
                info!("Render cancelled");
                RenderOutcome::Cancelled
            }
            Err(e) => {
                warn!(error = %e, "Render failed");
                RenderOutcome::Failed(e)
            }
        }
    }

    fn enter(&self, state: RenderState, message: impl Into<String>) {
        self.publisher.publish(StatusUpdate::new(state, message));
    }

    async fn drive(&self) -> Result<Completed> {
        self.enter(RenderState::Connecting, "Connecting...");
        let client = ServiceClient::new(self.settings.base_url()?)
            .with_http_client(self.http.clone())
            .with_timeouts(self.config.timeouts)
            .with_min_artifact_bytes(self.config.min_artifact_bytes);
        info!(
            endpoint = client.endpoint(),
            steps = self.settings.steps,
            cfg_scale = self.settings.cfg_scale,
            denoise = self.settings.denoise,
            "Starting render"
        );

        let (ok, message) = client.health_check().await;
        if !ok {
            return Err(RenderError::Connect {
                endpoint: client.endpoint().to_string(),
                message,
            });
        }

        self.cancel.check()?;
        self.enter(RenderState::Encoding, "Encoding snapshot...");
        let image_b64 = encode_snapshot(&self.request.image_path).await?;
        let (graph, seed) = self
            .builder
            .build(&image_b64, &self.request.prompt, self.request.seed);
        debug!(seed, nodes = graph.len(), "Workflow built");

        self.cancel.check()?;
        self.enter(
            RenderState::Submitting,
            format!(
                "Sending: {}",
                excerpt(&self.request.prompt, PROMPT_PREVIEW_CHARS)
            ),
        );
        let handle = client.submit(&graph, &self.request.client_id).await?;
        info!(job_id = %handle.job_id, "Job queued");
        self.enter(RenderState::Polling, format!("Queued as {}", handle.job_id));

        let artifact = match self.wait_for_artifact(&client, &handle).await {
            Err(RenderError::Cancelled) => {
                interrupt_detached(&client);
                return Err(RenderError::Cancelled);
            }
            other => other?,
        };

        if self.cancel.is_requested() {
            interrupt_detached(&client);
            return Err(RenderError::Cancelled);
        }
        self.enter(RenderState::Downloading, "Downloading...");
        let image = client.fetch_artifact(&artifact.filename).await?;

        Ok(Completed {
            image,
            artifact,
            job_id: handle.job_id,
            seed,
        })
    }

    /// Poll history on a fixed cadence until the job produces an image,
    /// fails, is cancelled, or the attempt ceiling is hit.
    async fn wait_for_artifact(
        &self,
        client: &ServiceClient,
        handle: &JobHandle,
    ) -> Result<ArtifactRef> {
        let interval = self.config.poll_interval;
        let max_attempts = self.config.max_poll_attempts;

        for attempt in 1..=max_attempts {
            self.cancel.check()?;
            tokio::time::sleep(interval).await;
            self.cancel.check()?;

            let elapsed = interval * attempt;
            self.enter(
                RenderState::Polling,
                format!("Rendering... ({}s)", elapsed.as_secs()),
            );

            let entry = client.poll(&handle.job_id).await;
            match JobStatus::from_history(entry.as_ref(), elapsed) {
                JobStatus::Succeeded(artifact) => return Ok(artifact),
                JobStatus::Failed(reason) => return Err(RenderError::JobFailed(reason)),
                status => debug!(attempt, ?status, "Job not finished"),
            }
        }

        Err(RenderError::Timeout {
            attempts: max_attempts,
            waited_secs: (interval * max_attempts).as_secs(),
        })
    }
}

/// Fire-and-forget remote interrupt; the local run doesn't wait on it.
fn interrupt_detached(client: &ServiceClient) {
    let client = client.clone();
    tokio::spawn(async move { client.interrupt().await }.in_current_span());
}

async fn encode_snapshot(path: &Path) -> Result<String> {
    let data = tokio::fs::read(path)
        .await
        .map_err(|source| RenderError::Image {
            path: path.to_path_buf(),
            source,
        })?;
    Ok(base64::Engine::encode(
        &base64::engine::general_purpose::STANDARD,
        data,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_terminal_update_success_carries_bytes() {
        let outcome = RenderOutcome::Succeeded {
            image: Bytes::from_static(b"png"),
            artifact: ArtifactRef {
                filename: "out.png".into(),
            },
            job_id: "abc".into(),
            seed: 1,
        };
        let update = terminal_update(&outcome);
        assert_eq!(update.state, RenderState::Succeeded);
        assert_eq!(update.payload, StatusPayload::Image(Bytes::from_static(b"png")));
    }

    #[test]
    fn test_terminal_update_failure_carries_message() {
        let update = terminal_update(&RenderOutcome::Failed(RenderError::Timeout {
            attempts: 120,
            waited_secs: 600,
        }));
        assert_eq!(update.state, RenderState::Failed);
        assert!(update.message.contains("Timed out"));
        assert!(matches!(update.payload, StatusPayload::Error(_)));
    }

    #[test]
    fn test_terminal_update_cancelled_is_empty() {
        let update = terminal_update(&RenderOutcome::Cancelled);
        assert_eq!(update.state, RenderState::Cancelled);
        assert_eq!(update.payload, StatusPayload::None);
    }

    #[tokio::test]
    async fn test_encode_snapshot() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"hello").unwrap();
        assert_eq!(encode_snapshot(file.path()).await.unwrap(), "aGVsbG8=");
    }

    #[tokio::test]
    async fn test_encode_missing_snapshot() {
        let err = encode_snapshot(Path::new("/definitely/not/here.png"))
            .await
            .unwrap_err();
        assert!(matches!(err, RenderError::Image { .. }));
    }

    #[test]
    fn test_new_orchestrator_is_idle() {
        let orchestrator = JobOrchestrator::default();
        assert!(!orchestrator.is_running());
        assert_eq!(orchestrator.status().state, RenderState::Idle);
    }

    #[test]
    fn test_request_stop_sets_shared_token() {
        let orchestrator = JobOrchestrator::default();
        let token = orchestrator.cancellation_token();
        orchestrator.request_stop();
        assert!(token.is_requested());
    }

    #[tokio::test]
    async fn test_invalid_settings_fail_the_run() {
        let orchestrator = JobOrchestrator::default();
        let handle = orchestrator
            .start(RenderRequest::new("x.png", "p"), &Settings::new(""))
            .unwrap();
        let outcome = handle.outcome().await;
        assert!(matches!(
            outcome,
            RenderOutcome::Failed(RenderError::InvalidSettings(_))
        ));
        assert!(!orchestrator.is_running());
        assert_eq!(orchestrator.status().state, RenderState::Failed);
    }

    #[tokio::test]
    async fn test_run_end_clears_stop_flag() {
        let orchestrator = JobOrchestrator::default();
        let handle = orchestrator
            .start(RenderRequest::new("x.png", "p"), &Settings::new("ftp://nope"))
            .unwrap();
        orchestrator.request_stop();
        let _ = handle.outcome().await;
        assert!(!orchestrator.cancellation_token().is_requested());
    }

    #[test]
    fn test_start_outside_runtime_is_an_error() {
        let orchestrator = JobOrchestrator::default();
        let err = orchestrator
            .start(RenderRequest::new("x.png", "p"), &Settings::default())
            .err()
            .expect("start should fail without a runtime");
        assert!(matches!(err, RenderError::Task(_)));
        assert!(!orchestrator.is_running());
    }

    #[test]
    fn test_start_on_given_runtime() {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let orchestrator = JobOrchestrator::default().with_runtime(rt.handle().clone());
        let handle = orchestrator
            .start(RenderRequest::new("x.png", "p"), &Settings::new(""))
            .unwrap();
        let outcome = rt.block_on(handle.outcome());
        assert_eq!(outcome.state(), RenderState::Failed);
        assert!(!orchestrator.is_running());
    }

    #[test]
    fn test_abandoned_run_still_publishes_failure() {
        let orchestrator = JobOrchestrator::default();
        let mut rx = orchestrator.subscribe();
        *lock_slot(&orchestrator.running) = true;
        orchestrator.cancel.request();

        drop(RunGuard {
            running: Arc::clone(&orchestrator.running),
            cancel: orchestrator.cancel.clone(),
            publisher: orchestrator.publisher.clone(),
            terminal: None,
        });

        let update = rx.try_recv().unwrap();
        assert_eq!(update.state, RenderState::Failed);
        assert!(update.message.contains("without a result"));
        assert!(matches!(update.payload, StatusPayload::Error(_)));
        assert!(!orchestrator.is_running());
        assert!(!orchestrator.cancellation_token().is_requested());
        assert_eq!(orchestrator.status().state, RenderState::Failed);
    }

    #[test]
    fn test_finished_run_publishes_its_own_update() {
        let orchestrator = JobOrchestrator::default();
        let mut rx = orchestrator.subscribe();
        *lock_slot(&orchestrator.running) = true;

        drop(RunGuard {
            running: Arc::clone(&orchestrator.running),
            cancel: orchestrator.cancel.clone(),
            publisher: orchestrator.publisher.clone(),
            terminal: Some(terminal_update(&RenderOutcome::Cancelled)),
        });

        assert_eq!(rx.try_recv().unwrap().state, RenderState::Cancelled);
        assert!(rx.try_recv().is_err());
        assert!(!orchestrator.is_running());
    }
}
