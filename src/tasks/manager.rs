//! Job runner: starts, supervises, cancels and resumes face matching jobs.

use futures::future::join_all;
use futures::FutureExt;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, info_span, warn, Instrument};

use super::{JobMode, JobSpec, JobStatus, ProgressPatch, ProgressRecord, RetryPolicy};
use crate::config::JobsConfig;
use crate::db::{MetadataStore, ProgressStore};
use crate::error::{JobError, Result};
use crate::faces::{
    CandidateProcessor, CollectionIndexer, CollectionMatcher, ItemOutcome, MatchScanner,
};
use crate::recognition::FaceProvider;
use crate::scanner::{enumerate_candidates, ObjectEntry, ObjectSource, UrlFetcher};

/// External capabilities a job needs, passed in rather than reached globally.
#[derive(Clone)]
pub struct Services {
    pub source: Arc<dyn ObjectSource>,
    pub fetcher: Arc<dyn UrlFetcher>,
    pub provider: Arc<dyn FaceProvider>,
    pub progress: Arc<dyn ProgressStore>,
    pub metadata: Arc<dyn MetadataStore>,
}

/// Handle to a job running in the background.
pub struct JobHandle {
    job_id: String,
    cancel_flag: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl JobHandle {
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Ask the job to stop before its next batch.
    pub fn cancel(&self) {
        self.cancel_flag.store(true, Ordering::SeqCst);
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait until the job has written its final status.
    pub async fn wait(self) {
        if let Err(e) = self.task.await {
            error!(job_id = %self.job_id, error = %e, "Job task did not finish cleanly");
        }
    }
}

struct RunningJob {
    mode: JobMode,
    cancel_flag: Arc<AtomicBool>,
    started_at: Instant,
}

/// How a run ended, when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunEnd {
    Completed,
    Cancelled,
    Checkpointed,
}

/// Everything one background run owns.
struct JobContext {
    spec: JobSpec,
    probe: Option<Arc<Vec<u8>>>,
    services: Services,
    jobs: JobsConfig,
    retry: RetryPolicy,
    cancel_flag: Arc<AtomicBool>,
    resume_from: u64,
}

/// Runs jobs as detached tasks reporting into the progress store.
pub struct JobRunner {
    services: Services,
    jobs: JobsConfig,
    retry: RetryPolicy,
    running: Arc<Mutex<HashMap<String, RunningJob>>>,
}

impl JobRunner {
    pub fn new(services: Services, jobs: JobsConfig, retry: RetryPolicy) -> Self {
        Self {
            services,
            jobs,
            retry,
            running: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn running(&self) -> MutexGuard<'_, HashMap<String, RunningJob>> {
        self.running.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Validate `spec`, create its progress record and start it in the
    /// background. Returns once the record exists.
    pub async fn start(&self, spec: JobSpec) -> Result<JobHandle> {
        spec.validate()?;
        if self.is_running(&spec.job_id) {
            return Err(JobError::InvalidSpec(format!(
                "job {} is already running",
                spec.job_id
            )));
        }

        let probe = self.resolve_probe(&spec).await?;

        let record = ProgressRecord::pending(&spec, chrono::Utc::now());
        if !self.services.progress.create(&record).await? {
            return Err(JobError::InvalidSpec(format!(
                "job {} already exists",
                spec.job_id
            )));
        }

        info!(job_id = %spec.job_id, mode = spec.mode.display_name(), "Job accepted");
        Ok(self.spawn(spec, probe, 0))
    }

    /// Continue an unfinished job after the candidates it already scanned.
    pub async fn resume(&self, job_id: &str) -> Result<JobHandle> {
        let record = self.poll(job_id).await?;
        if record.status.is_terminal() {
            return Err(JobError::InvalidSpec(format!(
                "job {} already finished with status {}",
                job_id,
                record.status.as_str()
            )));
        }
        if self.is_running(job_id) {
            return Err(JobError::InvalidSpec(format!("job {} is already running", job_id)));
        }
        let spec = record.spec.ok_or_else(|| {
            JobError::InvalidSpec(format!("job {} has no stored spec to resume from", job_id))
        })?;

        let probe = self.resolve_probe(&spec).await?;
        self.services
            .progress
            .merge(
                job_id,
                ProgressPatch {
                    resumable: Some(false),
                    ..Default::default()
                },
            )
            .await?;

        info!(job_id, resume_from = record.scanned_files, "Job resumed");
        Ok(self.spawn(spec, probe, record.scanned_files))
    }

    /// Current progress of a job.
    pub async fn poll(&self, job_id: &str) -> Result<ProgressRecord> {
        self.services
            .progress
            .get(job_id)
            .await?
            .ok_or_else(|| JobError::NotFound(job_id.to_string()))
    }

    /// Request cancellation. Returns `false` if the job had already finished.
    ///
    /// A job running in this process stops before its next batch. A job with
    /// no live run here (e.g. left behind by a crash) is cancelled at once.
    pub async fn cancel(&self, job_id: &str) -> Result<bool> {
        let record = self.poll(job_id).await?;
        if record.status.is_terminal() {
            return Ok(false);
        }

        let live = match self.running().get(job_id) {
            Some(job) => {
                job.cancel_flag.store(true, Ordering::SeqCst);
                true
            }
            None => false,
        };
        self.services
            .progress
            .merge(
                job_id,
                ProgressPatch {
                    status: (!live).then_some(JobStatus::Cancelled),
                    cancelled: Some(true),
                    ..Default::default()
                },
            )
            .await?;

        info!(job_id, live, "Cancellation requested");
        Ok(true)
    }

    pub fn is_running(&self, job_id: &str) -> bool {
        self.running().contains_key(job_id)
    }

    /// Ids and modes of jobs running in this process, oldest first.
    pub fn running_jobs(&self) -> Vec<(String, JobMode)> {
        let running = self.running();
        let mut jobs: Vec<_> = running
            .iter()
            .map(|(id, job)| (job.started_at, id.clone(), job.mode))
            .collect();
        jobs.sort_by_key(|(started_at, _, _)| *started_at);
        jobs.into_iter().map(|(_, id, mode)| (id, mode)).collect()
    }

    async fn resolve_probe(&self, spec: &JobSpec) -> Result<Option<Arc<Vec<u8>>>> {
        if !spec.mode.needs_probe() {
            return Ok(None);
        }
        let Some(reference) = spec.probe_image_ref.as_ref() else {
            return Err(JobError::InvalidSpec("probeImageRef is required".to_string()));
        };

        let bytes = reference
            .fetch(self.services.source.as_ref(), self.services.fetcher.as_ref())
            .await
            .map_err(|e| JobError::InvalidSpec(format!("probe image unreachable: {}", e)))?;
        if bytes.is_empty() {
            return Err(JobError::InvalidSpec(format!(
                "probe image {} is empty",
                reference
            )));
        }
        Ok(Some(Arc::new(bytes)))
    }

    fn spawn(&self, spec: JobSpec, probe: Option<Arc<Vec<u8>>>, resume_from: u64) -> JobHandle {
        let job_id = spec.job_id.clone();
        let cancel_flag = Arc::new(AtomicBool::new(false));
        self.running().insert(
            job_id.clone(),
            RunningJob {
                mode: spec.mode,
                cancel_flag: cancel_flag.clone(),
                started_at: Instant::now(),
            },
        );

        let span = info_span!(
            "job",
            job_id = %job_id,
            mode = spec.mode.display_name(),
            provider = self.services.provider.provider_name()
        );
        let ctx = JobContext {
            spec,
            probe,
            services: self.services.clone(),
            jobs: self.jobs.clone(),
            retry: self.retry,
            cancel_flag: cancel_flag.clone(),
            resume_from,
        };
        let running = self.running.clone();
        let task_job_id = job_id.clone();

        let task = tokio::spawn(
            async move {
                let progress = ctx.services.progress.clone();
                let outcome = AssertUnwindSafe(execute(ctx)).catch_unwind().await;

                let failure = match outcome {
                    Ok(Ok(end)) => {
                        info!(outcome = ?end, "Job run finished");
                        None
                    }
                    Ok(Err(err)) => Some(err.to_string()),
                    Err(panic) => Some(panic_message(panic.as_ref())),
                };

                if let Some(message) = failure {
                    error!(error = %message, "Job failed");
                    if let Err(e) = progress
                        .merge(&task_job_id, ProgressPatch::failed(message))
                        .await
                    {
                        error!(error = %e, "Could not record job failure");
                    }
                }

                running
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(&task_job_id);
            }
            .instrument(span),
        );

        JobHandle {
            job_id,
            cancel_flag,
            task,
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("job panicked: {}", s)
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("job panicked: {}", s)
    } else {
        "job panicked".to_string()
    }
}

fn build_processor(ctx: &JobContext) -> Result<Box<dyn CandidateProcessor>> {
    let services = &ctx.services;
    let probe = || {
        ctx.probe
            .clone()
            .ok_or_else(|| JobError::Fatal("probe image was not resolved".to_string()))
    };
    let collection = || {
        ctx.spec
            .candidate_scope
            .collection()
            .cloned()
            .ok_or_else(|| JobError::Fatal("job has no collection scope".to_string()))
    };

    Ok(match ctx.spec.mode {
        JobMode::PairwiseScan => Box::new(MatchScanner::new(
            services.source.clone(),
            services.provider.clone(),
            probe()?,
            ctx.spec.similarity_threshold,
            ctx.retry,
        )),
        JobMode::Index => Box::new(CollectionIndexer::new(
            services.source.clone(),
            services.provider.clone(),
            services.metadata.clone(),
            collection()?,
            ctx.jobs.max_faces_per_image,
            ctx.spec.reprocess,
            ctx.retry,
        )),
        JobMode::CollectionSearch => Box::new(CollectionMatcher::new(
            services.provider.clone(),
            services.metadata.clone(),
            probe()?,
            &collection()?,
            ctx.jobs.search_max_faces,
            ctx.spec.similarity_threshold,
            ctx.retry,
        )),
    })
}

async fn resolve_candidates(ctx: &JobContext) -> Result<Vec<ObjectEntry>> {
    match &ctx.spec.mode {
        JobMode::CollectionSearch => {
            let collection = ctx
                .spec
                .candidate_scope
                .collection()
                .ok_or_else(|| JobError::Fatal("job has no collection scope".to_string()))?;
            Ok(vec![ObjectEntry::new(collection.collection_id())])
        }
        _ => enumerate_candidates(
            ctx.services.source.as_ref(),
            ctx.spec.candidate_scope.prefixes(),
            &ctx.jobs.image_extensions,
        )
        .await
        .map_err(|e| JobError::Fatal(format!("listing candidates failed: {}", e))),
    }
}

async fn cancel_requested(ctx: &JobContext) -> Result<bool> {
    if ctx.cancel_flag.load(Ordering::SeqCst) {
        return Ok(true);
    }
    let record = ctx.services.progress.get(&ctx.spec.job_id).await?;
    Ok(record.is_some_and(|r| r.cancelled))
}

/// The job body. Per-item failures are logged and counted; only errors that
/// escape this function end the job with status `error`.
async fn execute(ctx: JobContext) -> Result<RunEnd> {
    let job_id = ctx.spec.job_id.as_str();
    let progress = ctx.services.progress.clone();
    let started = Instant::now();
    let deadline = ctx.jobs.deadline();

    let candidates = resolve_candidates(&ctx).await?;
    let total = candidates.len() as u64;
    progress
        .merge(
            job_id,
            ProgressPatch {
                status: Some(JobStatus::Processing),
                total_files: Some(total),
                ..Default::default()
            },
        )
        .await?;
    info!(total_files = total, resume_from = ctx.resume_from, "Candidates enumerated");

    let processor = build_processor(&ctx)?;
    let skip = ctx.resume_from.min(total) as usize;
    let batch_size = ctx.jobs.batch_size.max(1);
    let mut batches_run = 0usize;

    for batch in candidates[skip..].chunks(batch_size) {
        if cancel_requested(&ctx).await? {
            progress
                .merge(job_id, ProgressPatch::status(JobStatus::Cancelled))
                .await?;
            info!("Job cancelled");
            return Ok(RunEnd::Cancelled);
        }

        if let Some(limit) = deadline {
            if batches_run > 0 && started.elapsed() >= limit {
                progress
                    .merge(
                        job_id,
                        ProgressPatch {
                            resumable: Some(true),
                            ..Default::default()
                        },
                    )
                    .await?;
                warn!(elapsed_secs = started.elapsed().as_secs(), "Deadline reached, checkpointing");
                return Ok(RunEnd::Checkpointed);
            }
        }

        let outcomes = join_all(batch.iter().map(|candidate| processor.process(candidate))).await;

        let mut patch = ProgressPatch {
            scanned_delta: batch.len() as u64,
            ..Default::default()
        };
        for (candidate, outcome) in batch.iter().zip(outcomes) {
            match outcome {
                Ok(ItemOutcome::Matched(matches)) => {
                    for m in &matches {
                        info!(
                            item = %m.source_image_ref,
                            similarity = m.similarity,
                            outcome = "matched",
                            "Match found"
                        );
                    }
                    patch.new_matches.extend(matches);
                }
                Ok(ItemOutcome::Indexed(descriptors)) => {
                    debug!(
                        item = %candidate.full_path,
                        faces = descriptors.faces.len(),
                        outcome = "indexed",
                        "Faces indexed"
                    );
                    patch.faces_indexed_delta += descriptors.faces.len() as u64;
                }
                Ok(other) => {
                    debug!(item = %candidate.full_path, outcome = other.label(), "Candidate processed");
                }
                Err(err) => {
                    warn!(
                        item = %candidate.full_path,
                        processor = processor.name(),
                        outcome = "skipped",
                        error = %err,
                        "Skipping candidate"
                    );
                }
            }
        }

        let record = progress.merge(job_id, patch).await?;
        batches_run += 1;
        debug!(
            scanned_files = record.scanned_files,
            total_files = record.total_files,
            matches_found = record.matches_found,
            "Batch complete"
        );
    }

    let record = progress
        .merge(
            job_id,
            ProgressPatch {
                status: Some(JobStatus::Completed),
                resumable: Some(false),
                ..Default::default()
            },
        )
        .await?;
    info!(
        scanned_files = record.scanned_files,
        matches_found = record.matches_found,
        faces_indexed = record.faces_indexed,
        "Job completed"
    );
    Ok(RunEnd::Completed)
}
