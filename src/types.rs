use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Where ComfyUI may have written an artifact.
///
/// Save nodes write to `output`, preview nodes to `temp`, and some loaders
/// echo their input under `input`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageClass {
    Output,
    Temp,
    Input,
}

impl StorageClass {
    /// Order in which `/view` is probed for an artifact.
    pub const RETRIEVAL_ORDER: [StorageClass; 3] =
        [StorageClass::Output, StorageClass::Temp, StorageClass::Input];

    /// Value of the `type` query parameter / history annotation.
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageClass::Output => "output",
            StorageClass::Temp => "temp",
            StorageClass::Input => "input",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "output" => Some(StorageClass::Output),
            "temp" => Some(StorageClass::Temp),
            "input" => Some(StorageClass::Input),
            _ => None,
        }
    }

    /// Comma-separated names, used in error messages.
    pub fn join(classes: &[StorageClass]) -> String {
        classes
            .iter()
            .map(|c| c.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

impl fmt::Display for StorageClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One render invocation: a captured snapshot and the prompt to apply.
#[derive(Debug, Clone)]
pub struct RenderRequest {
    pub image_path: PathBuf,
    pub prompt: String,
    /// Fresh per submission so ComfyUI can tell runs apart.
    pub client_id: String,
    /// Pin the noise seed. `None` or negative draws a random one.
    pub seed: Option<i64>,
}

impl RenderRequest {
    /// Create a request with a newly generated client id and a random seed.
    pub fn new(image_path: impl Into<PathBuf>, prompt: impl Into<String>) -> Self {
        Self {
            image_path: image_path.into(),
            prompt: prompt.into(),
            client_id: uuid::Uuid::new_v4().simple().to_string(),
            seed: None,
        }
    }

    /// Pin the seed (builder pattern).
    pub fn with_seed(mut self, seed: i64) -> Self {
        self.seed = Some(seed);
        self
    }
}

/// Returned by a successful submit; the key for polling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobHandle {
    pub job_id: String,
}

/// A produced image, as reported by `/history`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRef {
    pub filename: String,
    #[serde(default)]
    pub subfolder: String,
    /// The storage-class annotation, kept raw since ComfyUI does not
    /// promise a closed set.
    #[serde(rename = "type", default)]
    pub img_type: String,
}

/// Identifies the artifact to download. Carries no storage class on
/// purpose: retrieval probes every class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactRef {
    pub filename: String,
}

/// Parsed `/history/{job_id}` entry.
#[derive(Debug, Clone, Default)]
pub struct HistoryEntry {
    pub status: String,
    pub completed: bool,
    pub images: Vec<ImageRef>,
}

/// Pick the image to download from a finished job.
///
/// Prefers the first image annotated as primary output; otherwise the
/// first image in service order.
pub fn select_artifact(images: &[ImageRef]) -> Option<ArtifactRef> {
    images
        .iter()
        .find(|img| StorageClass::parse(&img.img_type) == Some(StorageClass::Output))
        .or_else(|| images.first())
        .map(|img| ArtifactRef {
            filename: img.filename.clone(),
        })
}

/// Remote job status as seen by one poll tick.
#[derive(Debug, Clone, PartialEq)]
pub enum JobStatus {
    Pending,
    Running(Duration),
    Succeeded(ArtifactRef),
    Failed(String),
    Cancelled,
}

impl JobStatus {
    /// Interpret a poll result. `None` means the job is not in history yet.
    pub fn from_history(entry: Option<&HistoryEntry>, elapsed: Duration) -> Self {
        let Some(entry) = entry else {
            return if elapsed.is_zero() {
                JobStatus::Pending
            } else {
                JobStatus::Running(elapsed)
            };
        };
        if let Some(artifact) = select_artifact(&entry.images) {
            return JobStatus::Succeeded(artifact);
        }
        if entry.status == "error" {
            return JobStatus::Failed(format!(
                "ComfyUI reported status '{}' with no images",
                entry.status
            ));
        }
        JobStatus::Running(elapsed)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded(_) | JobStatus::Failed(_) | JobStatus::Cancelled
        )
    }
}

/// Orchestrator state machine.
///
/// `Idle → Connecting → Encoding → Submitting → Polling → Downloading →
/// {Succeeded | Failed | Cancelled}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RenderState {
    Idle,
    Connecting,
    Encoding,
    Submitting,
    Polling,
    Downloading,
    Succeeded,
    Failed,
    Cancelled,
}

impl RenderState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RenderState::Succeeded | RenderState::Failed | RenderState::Cancelled
        )
    }

    /// Position in the pipeline. Terminal states share the last rank, so a
    /// run's published states never decrease.
    pub fn rank(&self) -> u8 {
        match self {
            RenderState::Idle => 0,
            RenderState::Connecting => 1,
            RenderState::Encoding => 2,
            RenderState::Submitting => 3,
            RenderState::Polling => 4,
            RenderState::Downloading => 5,
            RenderState::Succeeded | RenderState::Failed | RenderState::Cancelled => 6,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RenderState::Idle => "idle",
            RenderState::Connecting => "connecting",
            RenderState::Encoding => "encoding",
            RenderState::Submitting => "submitting",
            RenderState::Polling => "polling",
            RenderState::Downloading => "downloading",
            RenderState::Succeeded => "succeeded",
            RenderState::Failed => "failed",
            RenderState::Cancelled => "cancelled",
        }
    }
}

/// Extra data attached to a terminal status update.
#[derive(Debug, Clone, PartialEq)]
pub enum StatusPayload {
    None,
    Image(Bytes),
    Error(String),
}

/// One message on the status channel.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusUpdate {
    pub state: RenderState,
    pub message: String,
    pub payload: StatusPayload,
}

impl StatusUpdate {
    pub fn new(state: RenderState, message: impl Into<String>) -> Self {
        Self {
            state,
            message: message.into(),
            payload: StatusPayload::None,
        }
    }

    pub fn idle() -> Self {
        Self::new(RenderState::Idle, "Ready.")
    }
}

/// Final result of one orchestration run.
#[derive(Debug)]
pub enum RenderOutcome {
    Succeeded {
        image: Bytes,
        artifact: ArtifactRef,
        job_id: String,
        seed: i64,
    },
    Failed(crate::RenderError),
    Cancelled,
}

impl RenderOutcome {
    pub fn state(&self) -> RenderState {
        match self {
            RenderOutcome::Succeeded { .. } => RenderState::Succeeded,
            RenderOutcome::Failed(_) => RenderState::Failed,
            RenderOutcome::Cancelled => RenderState::Cancelled,
        }
    }

    /// The image bytes, if the run succeeded.
    pub fn image(&self) -> Option<&Bytes> {
        match self {
            RenderOutcome::Succeeded { image, .. } => Some(image),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&crate::RenderError> {
        match self {
            RenderOutcome::Failed(e) => Some(e),
            _ => None,
        }
    }
}
