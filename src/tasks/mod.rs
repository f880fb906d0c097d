//! Face matching jobs: what a caller submits and what a poller sees.
//!
//! A job is described by a [`JobSpec`], executed by the [`JobRunner`] as a
//! detached task, and observed through its [`ProgressRecord`]. Records only
//! move forward: counters never shrink, matches are append-only and status
//! never returns to an earlier state.

pub mod manager;
pub mod retry;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::JobError;
use crate::scanner::ImageRef;

pub use manager::{JobHandle, JobRunner, Services};
pub use retry::RetryPolicy;

pub const DEFAULT_SIMILARITY_THRESHOLD: f32 = 80.0;

/// Which strategy processes the candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobMode {
    /// Compare the probe against each candidate image.
    PairwiseScan,
    /// Register candidate faces in a collection.
    Index,
    /// Search a collection with the probe.
    CollectionSearch,
}

impl JobMode {
    pub fn display_name(&self) -> &'static str {
        match self {
            JobMode::PairwiseScan => "Pairwise Scan",
            JobMode::Index => "Collection Index",
            JobMode::CollectionSearch => "Collection Search",
        }
    }

    pub fn needs_probe(&self) -> bool {
        !matches!(self, JobMode::Index)
    }
}

/// A provider-side face collection for one folder of one event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionRef {
    pub event_id: String,
    pub folder_name: String,
}

impl CollectionRef {
    pub fn new(event_id: impl Into<String>, folder_name: impl Into<String>) -> Self {
        Self {
            event_id: event_id.into(),
            folder_name: folder_name.into(),
        }
    }

    /// Deterministic provider collection key, `{eventId}_{folderName}`.
    pub fn collection_id(&self) -> String {
        crate::faces::sanitize_identifier(
            &format!("{}_{}", self.event_id, self.folder_name),
            crate::faces::MAX_IDENTIFIER_LEN,
        )
    }
}

/// Where candidates come from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CandidateScope {
    /// Storage prefixes to enumerate.
    Prefixes { prefixes: Vec<String> },
    /// A face collection, with the storage prefixes that feed it.
    Collection {
        collection: CollectionRef,
        #[serde(default)]
        prefixes: Vec<String>,
    },
}

impl CandidateScope {
    pub fn prefixes(&self) -> &[String] {
        match self {
            CandidateScope::Prefixes { prefixes } => prefixes,
            CandidateScope::Collection { prefixes, .. } => prefixes,
        }
    }

    pub fn collection(&self) -> Option<&CollectionRef> {
        match self {
            CandidateScope::Prefixes { .. } => None,
            CandidateScope::Collection { collection, .. } => Some(collection),
        }
    }
}

fn default_similarity_threshold() -> f32 {
    DEFAULT_SIMILARITY_THRESHOLD
}

/// Input to a run. Immutable once the run starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSpec {
    /// Caller-assigned key of the progress record.
    pub job_id: String,
    pub mode: JobMode,
    #[serde(default)]
    pub probe_image_ref: Option<ImageRef>,
    pub candidate_scope: CandidateScope,
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f32,
    /// Index mode only: recompute faces for images that already have them.
    #[serde(default)]
    pub reprocess: bool,
}

impl JobSpec {
    pub fn pairwise(job_id: &str, probe: ImageRef, prefixes: Vec<String>) -> Self {
        Self {
            job_id: job_id.to_string(),
            mode: JobMode::PairwiseScan,
            probe_image_ref: Some(probe),
            candidate_scope: CandidateScope::Prefixes { prefixes },
            similarity_threshold: DEFAULT_SIMILARITY_THRESHOLD,
            reprocess: false,
        }
    }

    pub fn index(job_id: &str, collection: CollectionRef, prefixes: Vec<String>) -> Self {
        Self {
            job_id: job_id.to_string(),
            mode: JobMode::Index,
            probe_image_ref: None,
            candidate_scope: CandidateScope::Collection { collection, prefixes },
            similarity_threshold: DEFAULT_SIMILARITY_THRESHOLD,
            reprocess: false,
        }
    }

    pub fn collection_search(job_id: &str, probe: ImageRef, collection: CollectionRef) -> Self {
        Self {
            job_id: job_id.to_string(),
            mode: JobMode::CollectionSearch,
            probe_image_ref: Some(probe),
            candidate_scope: CandidateScope::Collection {
                collection,
                prefixes: Vec::new(),
            },
            similarity_threshold: DEFAULT_SIMILARITY_THRESHOLD,
            reprocess: false,
        }
    }

    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.similarity_threshold = threshold;
        self
    }

    pub fn with_reprocess(mut self, reprocess: bool) -> Self {
        self.reprocess = reprocess;
        self
    }

    /// Reject malformed input before any background work starts.
    pub fn validate(&self) -> Result<(), JobError> {
        let invalid = |msg: &str| Err(JobError::InvalidSpec(msg.to_string()));

        if self.job_id.trim().is_empty() {
            return invalid("jobId is required");
        }
        if !self.similarity_threshold.is_finite()
            || !(0.0..=100.0).contains(&self.similarity_threshold)
        {
            return invalid("similarityThreshold must be between 0 and 100");
        }
        if self.mode.needs_probe() && self.probe_image_ref.as_ref().map_or(true, |p| p.is_empty()) {
            return invalid("probeImageRef is required");
        }
        if self
            .candidate_scope
            .prefixes()
            .iter()
            .any(|p| p.trim().is_empty())
        {
            return invalid("candidateScope contains an empty prefix");
        }

        match (&self.mode, &self.candidate_scope) {
            (JobMode::PairwiseScan, scope) if scope.prefixes().is_empty() => {
                invalid("candidateScope must list at least one prefix")
            }
            (JobMode::Index, CandidateScope::Prefixes { .. }) => {
                invalid("index jobs need a collection scope")
            }
            (JobMode::Index, scope) if scope.prefixes().is_empty() => {
                invalid("candidateScope must list at least one prefix")
            }
            (JobMode::CollectionSearch, CandidateScope::Prefixes { .. }) => {
                invalid("collection search needs a collection scope")
            }
            (_, CandidateScope::Collection { collection, .. })
                if collection.event_id.trim().is_empty()
                    || collection.folder_name.trim().is_empty() =>
            {
                invalid("collection needs an eventId and folderName")
            }
            _ => Ok(()),
        }
    }
}

/// Lifecycle of a job. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Error,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Error | JobStatus::Cancelled)
    }

    pub fn can_advance_to(&self, next: JobStatus) -> bool {
        match (self, next) {
            (current, next) if *current == next => true,
            (JobStatus::Pending, JobStatus::Processing | JobStatus::Error | JobStatus::Cancelled) => {
                true
            }
            (JobStatus::Processing, next) => next.is_terminal(),
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Error => "error",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(JobStatus::Pending),
            "processing" => Some(JobStatus::Processing),
            "completed" => Some(JobStatus::Completed),
            "error" => Some(JobStatus::Error),
            "cancelled" => Some(JobStatus::Cancelled),
            _ => None,
        }
    }
}

/// A candidate that contained a matching face. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchResult {
    pub source_image_ref: String,
    pub similarity: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub face_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub folder_name: Option<String>,
}

impl MatchResult {
    pub fn new(source_image_ref: impl Into<String>, similarity: f32, confidence: Option<f32>) -> Self {
        Self {
            source_image_ref: source_image_ref.into(),
            similarity,
            confidence,
            face_id: None,
            file_path: None,
            event_id: None,
            folder_name: None,
        }
    }
}

/// Job status as seen by pollers. Owned by the runner while the job runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressRecord {
    pub job_id: String,
    pub status: JobStatus,
    pub total_files: u64,
    pub scanned_files: u64,
    pub matches_found: u64,
    #[serde(default)]
    pub faces_indexed: u64,
    #[serde(default)]
    pub matches: Vec<MatchResult>,
    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Set by a caller to stop the job before its next batch.
    #[serde(default)]
    pub cancelled: bool,
    /// Set when a run checkpointed before finishing.
    #[serde(default)]
    pub resumable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec: Option<JobSpec>,
}

impl ProgressRecord {
    pub fn pending(spec: &JobSpec, now: DateTime<Utc>) -> Self {
        Self {
            job_id: spec.job_id.clone(),
            status: JobStatus::Pending,
            total_files: 0,
            scanned_files: 0,
            matches_found: 0,
            faces_indexed: 0,
            matches: Vec::new(),
            created_at: now,
            last_updated: now,
            error: None,
            cancelled: false,
            resumable: false,
            spec: Some(spec.clone()),
        }
    }

    /// Fold a partial update into the record, enforcing forward-only rules.
    pub fn apply(&mut self, patch: ProgressPatch, now: DateTime<Utc>) {
        if let Some(status) = patch.status {
            if self.status.can_advance_to(status) {
                self.status = status;
            } else {
                tracing::debug!(
                    job_id = %self.job_id,
                    from = self.status.as_str(),
                    to = status.as_str(),
                    "Ignoring backward status transition"
                );
            }
        }

        if let Some(total) = patch.total_files {
            self.total_files = total.max(self.scanned_files);
        }

        self.scanned_files = (self.scanned_files + patch.scanned_delta).min(self.total_files);
        self.faces_indexed += patch.faces_indexed_delta;
        self.matches.extend(patch.new_matches);
        self.matches_found = self.matches.len() as u64;

        if self.status == JobStatus::Error {
            if let Some(error) = patch.error {
                self.error = Some(error);
            }
        }
        if let Some(cancelled) = patch.cancelled {
            self.cancelled = self.cancelled || cancelled;
        }
        if let Some(resumable) = patch.resumable {
            self.resumable = resumable;
        }

        self.last_updated = now;
    }

    pub fn percent(&self) -> u8 {
        if self.total_files == 0 {
            0
        } else {
            ((self.scanned_files as f64 / self.total_files as f64) * 100.0).min(100.0) as u8
        }
    }
}

/// Partial update merged into a [`ProgressRecord`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProgressPatch {
    pub status: Option<JobStatus>,
    pub total_files: Option<u64>,
    pub scanned_delta: u64,
    pub faces_indexed_delta: u64,
    pub new_matches: Vec<MatchResult>,
    pub error: Option<String>,
    pub cancelled: Option<bool>,
    pub resumable: Option<bool>,
}

impl ProgressPatch {
    pub fn status(status: JobStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: Some(JobStatus::Error),
            error: Some(message.into()),
            ..Default::default()
        }
    }
}
