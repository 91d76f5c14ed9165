use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::Instant;

/// Extensions the upload form accepts. Advisory only; the controller never rejects a file.
pub const SUPPORTED_EXTENSIONS: &[&str] = &[".png", ".jpg", ".jpeg", ".zip", ".nii", ".nii.gz", ".dcm"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControllerConfig {
    pub base_url: String,
    pub api_prefix: String,
    /// Floor before the first status poll, measured from job creation.
    #[serde(with = "humantime_serde")]
    pub min_processing: Duration,
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub progress_tick: Duration,
    pub max_poll_attempts: u32,
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    pub user_agent: String,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000".into(),
            api_prefix: "/api/v1".into(),
            min_processing: Duration::from_secs(16),
            poll_interval: Duration::from_secs(5),
            progress_tick: Duration::from_millis(300),
            max_poll_attempts: 60,
            request_timeout: Duration::from_secs(30),
            user_agent: format!("neuronav-scan/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// A file chosen for analysis, loaded into memory.
#[derive(Debug, Clone)]
pub struct Submission {
    pub path: PathBuf,
    pub file_name: String,
    pub size_bytes: u64,
    pub mime_type: String,
    pub selected_at_utc: String,
    pub data: Bytes,
}

impl Submission {
    /// Build a submission from in-memory bytes.
    pub fn from_bytes(path: impl Into<PathBuf>, data: impl Into<Bytes>) -> Self {
        let path = path.into();
        let data = data.into();
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "scan".to_string());
        Self {
            mime_type: guess_mime_type(&file_name).to_string(),
            size_bytes: data.len() as u64,
            file_name,
            path,
            selected_at_utc: now_rfc3339(),
            data,
        }
    }

    pub async fn from_path(path: &Path) -> anyhow::Result<Self> {
        let data = tokio::fs::read(path).await;
        Self::from_read(path, data)
    }

    /// Blocking variant of `from_path` for callers outside the runtime.
    pub fn read(path: &Path) -> anyhow::Result<Self> {
        Self::from_read(path, std::fs::read(path))
    }

    fn from_read(path: &Path, data: std::io::Result<Vec<u8>>) -> anyhow::Result<Self> {
        use anyhow::Context;
        let data = data.with_context(|| format!("failed to read scan file {}", path.display()))?;
        Ok(Self::from_bytes(path, data))
    }

    pub fn is_supported_extension(&self) -> bool {
        let lower = self.file_name.to_ascii_lowercase();
        SUPPORTED_EXTENSIONS.iter().any(|ext| lower.ends_with(ext))
    }
}

fn guess_mime_type(file_name: &str) -> &'static str {
    let lower = file_name.to_ascii_lowercase();
    if lower.ends_with(".png") {
        "image/png"
    } else if lower.ends_with(".jpg") || lower.ends_with(".jpeg") {
        "image/jpeg"
    } else if lower.ends_with(".zip") {
        "application/zip"
    } else {
        // .nii, .nii.gz, .dcm and anything unknown
        "application/octet-stream"
    }
}

pub fn now_rfc3339() -> String {
    time::OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_else(|_| "now".into())
}

/// Backend-assigned identifier for an accepted upload.
#[derive(Debug, Clone)]
pub struct JobHandle {
    pub id: String,
    pub created_at_utc: String,
    pub created_at: Instant,
}

impl JobHandle {
    pub fn new(id: String) -> Self {
        Self {
            id,
            created_at_utc: now_rfc3339(),
            created_at: Instant::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Uploading,
    Processing,
    Completed,
    Failed { reason: String },
    TimedOut,
}

impl Phase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Completed | Phase::Failed { .. } | Phase::TimedOut)
    }

    pub fn label(&self) -> &'static str {
        match self {
            Phase::Idle => "Idle",
            Phase::Uploading => "Uploading",
            Phase::Processing => "Processing",
            Phase::Completed => "Completed",
            Phase::Failed { .. } => "Failed",
            Phase::TimedOut => "Timed out",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressEstimate {
    pub percent: u8,
    pub stage_label: String,
}

impl ProgressEstimate {
    pub fn new(percent: u8, stage_label: impl Into<String>) -> Self {
        Self {
            percent: percent.min(100),
            stage_label: stage_label.into(),
        }
    }

    pub fn initial() -> Self {
        Self::new(0, "Initializing")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionResult {
    pub predicted_class: String,
    pub confidence: f64,
    pub all_probabilities: BTreeMap<String, f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heatmap_url: Option<String>,
}

impl PredictionResult {
    /// Class probabilities sorted from most to least likely.
    pub fn ranked(&self) -> Vec<(&str, f64)> {
        let mut out: Vec<(&str, f64)> = self
            .all_probabilities
            .iter()
            .map(|(k, v)| (k.as_str(), *v))
            .collect();
        out.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(b.0)));
        out
    }
}

/// Read-only view of the controller published after every state change.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub phase: Phase,
    pub progress: ProgressEstimate,
    pub error: Option<String>,
    pub result: Option<PredictionResult>,
    pub submission: Option<Submission>,
    pub job: Option<JobHandle>,
    pub poll_attempts: u32,
    /// Last status string reported by the backend.
    pub backend_status: Option<String>,
}

impl Default for Snapshot {
    fn default() -> Self {
        Self {
            phase: Phase::Idle,
            progress: ProgressEstimate::initial(),
            error: None,
            result: None,
            submission: None,
            job: None,
            poll_attempts: 0,
            backend_status: None,
        }
    }
}

/// A completed analysis as saved to history and exported.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanRecord {
    pub saved_at_utc: String,
    pub job_id: String,
    pub file_name: String,
    #[serde(default)]
    pub file_size: Option<u64>,
    #[serde(default)]
    pub selected_at_utc: Option<String>,
    #[serde(default)]
    pub job_created_at_utc: Option<String>,
    pub poll_attempts: u32,
    /// Settings the scan ran under. Older records without it load with defaults.
    #[serde(default)]
    pub config: ControllerConfig,
    pub result: PredictionResult,
}

impl ScanRecord {
    /// Build a record from a `Completed` snapshot. `None` for any other phase.
    pub fn from_snapshot(snapshot: &Snapshot, cfg: &ControllerConfig) -> Option<Self> {
        if snapshot.phase != Phase::Completed {
            return None;
        }
        let job = snapshot.job.as_ref()?;
        let result = snapshot.result.clone()?;
        let submission = snapshot.submission.as_ref();
        Some(Self {
            saved_at_utc: now_rfc3339(),
            job_id: job.id.clone(),
            file_name: submission
                .map(|s| s.file_name.clone())
                .unwrap_or_else(|| "-".into()),
            file_size: submission.map(|s| s.size_bytes),
            selected_at_utc: submission.map(|s| s.selected_at_utc.clone()),
            job_created_at_utc: Some(job.created_at_utc.clone()),
            poll_attempts: snapshot.poll_attempts,
            config: cfg.clone(),
            result,
        })
    }
}

#[derive(Debug, Clone)]
pub enum ControllerEvent {
    PhaseChanged { phase: Phase },
    Progress(ProgressEstimate),
    PollAttempt { attempt: u32, max: u32, status: String },
    Info(String),
}

// ── Wire types ──

/// Response body of the upload endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct UploadResponse {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Processing,
    Completed,
    Error,
    #[serde(other)]
    Unknown,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Error => "error",
            JobStatus::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StatusResults {
    #[serde(default)]
    pub prediction: Option<PredictionResult>,
}

/// Response body of the results endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct StatusResponse {
    pub status: JobStatus,
    #[serde(default)]
    pub progress: Option<f64>,
    #[serde(default)]
    pub results: Option<StatusResults>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
}

impl StatusResponse {
    pub fn prediction(&self) -> Option<&PredictionResult> {
        self.results.as_ref().and_then(|r| r.prediction.as_ref())
    }
}
