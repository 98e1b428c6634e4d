//! Runs a batch of jobs through one engine session.
//!
//! Jobs go smallest first, in chunks of [`CHUNK_SIZE`], strictly one at a time.
//! The engine is cleared before every chunk. A failing job is recorded as
//! errored and the batch moves on; nothing a single job does can end the run.

use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use serde::Serialize;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::convert::Converter;
use crate::engine::Engine;
use crate::error::{ConvertError, QueueError};
use crate::job::{Failure, JobDescriptor, JobId, JobStatus};
use crate::limits::CHUNK_SIZE;
use crate::output::OutputHandle;

/// Emitted once per job, right after its terminal state is recorded.
#[derive(Clone, Debug, Serialize)]
pub struct ProgressEvent {
    pub job_id: JobId,
    pub name: String,
    /// Position of the job in the slice handed to the runner. A solo
    /// [`retry`](BatchRunner::retry) reports itself as index 0 of a batch of one.
    pub index: usize,
    pub completed: usize,
    pub total: usize,
    pub outcome: Result<OutputHandle, String>,
}

pub type ProgressSender = UnboundedSender<ProgressEvent>;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    pub total: usize,
    pub converted: usize,
    pub errored: usize,
    /// Jobs that were not pending when the batch started.
    pub skipped: usize,
}

impl BatchSummary {
    pub fn of(jobs: &[JobDescriptor]) -> Self {
        let mut summary = Self {
            total: jobs.len(),
            ..Self::default()
        };
        for job in jobs {
            match job.status() {
                JobStatus::Converted(_) => summary.converted += 1,
                JobStatus::Errored(_) => summary.errored += 1,
                _ => summary.skipped += 1,
            }
        }
        summary
    }

    pub fn all_failed(&self) -> bool {
        self.total > 0 && self.converted == 0
    }

    /// Single message shown instead of per-file results when nothing converted.
    pub fn advisory(&self) -> Option<String> {
        self.all_failed().then(|| {
            format!(
                "none of the {} file(s) could be converted; check the formats and try again",
                self.total
            )
        })
    }
}

/// Pending jobs, smallest first, split into chunks. Values are indices into `jobs`.
pub fn schedule(jobs: &[JobDescriptor]) -> Vec<Vec<usize>> {
    chunked(jobs, |status| matches!(status, JobStatus::Pending))
}

/// Errored jobs worth another attempt, ordered and chunked like [`schedule`].
/// Precondition rejections are left out; they fail the same way until the job changes.
pub fn retry_schedule(jobs: &[JobDescriptor]) -> Vec<Vec<usize>> {
    chunked(jobs, JobStatus::is_retryable)
}

fn chunked(jobs: &[JobDescriptor], select: impl Fn(&JobStatus) -> bool) -> Vec<Vec<usize>> {
    let mut order: Vec<usize> = (0..jobs.len())
        .filter(|&i| select(jobs[i].status()))
        .collect();
    order.sort_by_key(|&i| jobs[i].byte_size());
    order.chunks(CHUNK_SIZE).map(<[usize]>::to_vec).collect()
}

pub struct BatchRunner<E> {
    converter: Converter<E>,
}

impl<E: Engine> BatchRunner<E> {
    pub fn new(converter: Converter<E>) -> Self {
        Self { converter }
    }

    pub fn converter(&self) -> &Converter<E> {
        &self.converter
    }

    /// Converts every pending job. Never fails as a whole; inspect the summary.
    pub async fn run(&self, jobs: &mut [JobDescriptor], progress: &ProgressSender) -> BatchSummary {
        let chunks = schedule(jobs);
        info!(
            total = chunks.iter().map(Vec::len).sum::<usize>(),
            chunks = chunks.len(),
            "starting batch"
        );
        self.run_chunks(jobs, chunks, progress).await
    }

    /// Gives every retryable failure one more attempt, chunked like [`run`](Self::run).
    pub async fn retry_failed(
        &self,
        jobs: &mut [JobDescriptor],
        progress: &ProgressSender,
    ) -> BatchSummary {
        let chunks = retry_schedule(jobs);
        let retries: usize = chunks.iter().map(Vec::len).sum();
        let rejected = jobs
            .iter()
            .filter(|job| matches!(job.status(), JobStatus::Errored(_)))
            .count()
            - retries;
        info!(retries, rejected, "retrying failed jobs");
        self.run_chunks(jobs, chunks, progress).await
    }

    async fn run_chunks(
        &self,
        jobs: &mut [JobDescriptor],
        chunks: Vec<Vec<usize>>,
        progress: &ProgressSender,
    ) -> BatchSummary {
        let total: usize = chunks.iter().map(Vec::len).sum();

        let mut completed = 0;
        for (n, chunk) in chunks.iter().enumerate() {
            let span = info_span!("chunk", n, size = chunk.len());
            async {
                if let Err(error) = self.converter.session().clear().await {
                    warn!(%error, "engine clear failed, continuing");
                }
                self.converter.reclaim();

                for &index in chunk {
                    completed += 1;
                    let job = &mut jobs[index];
                    let outcome = self.attempt(job).await;
                    emit(progress, job, index, completed, total, outcome);
                }
            }
            .instrument(span)
            .await;
        }

        let summary = BatchSummary::of(jobs);
        match summary.advisory() {
            Some(advisory) => error!(?summary, "{advisory}"),
            None => info!(?summary, "batch finished"),
        }
        summary
    }

    /// Re-runs one errored job on its own, outside any batch.
    pub async fn retry<'j>(
        &self,
        job: &'j mut JobDescriptor,
        progress: &ProgressSender,
    ) -> Result<&'j JobStatus, QueueError> {
        if !matches!(job.status(), JobStatus::Errored(_)) {
            return Err(QueueError::NotRetryable {
                name: job.name().to_string(),
                status: job.status().clone(),
            });
        }
        info!(job = %job.id(), name = job.name(), "retrying");
        let outcome = self.attempt(job).await;
        emit(progress, job, 0, 1, 1, outcome);
        Ok(job.status())
    }

    /// Moves one job to a terminal state. Panics inside the conversion count as failures.
    async fn attempt(&self, job: &mut JobDescriptor) -> Result<OutputHandle, String> {
        job.status = JobStatus::Converting;
        let result = AssertUnwindSafe(self.converter.convert(job))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(ConvertError::Aborted(panic_message(panic))));

        match result {
            Ok(handle) => {
                job.status = JobStatus::Converted(handle.clone());
                job.release_source();
                Ok(handle)
            }
            Err(error) => {
                if error.is_precondition() {
                    warn!(job = %job.id(), name = job.name(), %error, "rejected");
                } else {
                    error!(job = %job.id(), name = job.name(), %error, "conversion failed");
                }
                let failure = Failure::from(&error);
                let reason = failure.reason.clone();
                job.status = JobStatus::Errored(failure);
                Err(reason)
            }
        }
    }
}

fn emit(
    progress: &ProgressSender,
    job: &JobDescriptor,
    index: usize,
    completed: usize,
    total: usize,
    outcome: Result<OutputHandle, String>,
) {
    let event = ProgressEvent {
        job_id: job.id(),
        name: job.name().to_string(),
        index,
        completed,
        total,
        outcome,
    };
    if progress.send(event).is_err() {
        debug!("progress receiver dropped");
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    match panic.downcast::<String>() {
        Ok(message) => *message,
        Err(panic) => match panic.downcast::<&'static str>() {
            Ok(message) => message.to_string(),
            Err(_) => "conversion panicked".to_string(),
        },
    }
}
