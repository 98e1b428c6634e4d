//! The session's list of jobs, in the order they were added.

use tracing::{debug, info};

use crate::batch::BatchSummary;
use crate::error::QueueError;
use crate::job::{normalize_extension, JobDescriptor, JobId};
use crate::output::OutputRegistry;

#[derive(Debug, Default)]
pub struct JobQueue {
    jobs: Vec<JobDescriptor>,
    outputs: OutputRegistry,
}

impl JobQueue {
    pub fn new(outputs: OutputRegistry) -> Self {
        Self {
            jobs: Vec::new(),
            outputs,
        }
    }

    pub fn outputs(&self) -> &OutputRegistry {
        &self.outputs
    }

    pub fn add(&mut self, job: JobDescriptor) -> JobId {
        let id = job.id();
        debug!(job = %id, name = job.name(), mime = job.mime_type(), "queued");
        self.jobs.push(job);
        id
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn jobs(&self) -> &[JobDescriptor] {
        &self.jobs
    }

    pub fn jobs_mut(&mut self) -> &mut [JobDescriptor] {
        &mut self.jobs
    }

    pub fn get(&self, id: JobId) -> Option<&JobDescriptor> {
        self.jobs.iter().find(|job| job.id() == id)
    }

    pub fn get_mut(&mut self, id: JobId) -> Option<&mut JobDescriptor> {
        self.jobs.iter_mut().find(|job| job.id() == id)
    }

    pub fn set_target(&mut self, id: JobId, extension: &str) -> Result<(), QueueError> {
        self.get_mut(id)
            .ok_or(QueueError::UnknownJob(id.as_uuid()))?
            .set_target(extension)
    }

    /// Picks `extension` for every job that has no target yet. Returns how many changed.
    pub fn set_target_all(&mut self, extension: &str) -> usize {
        let mut changed = 0;
        for job in self.jobs.iter_mut().filter(|job| !job.is_ready()) {
            if job.set_target(extension).is_ok() {
                changed += 1;
            }
        }
        changed
    }

    /// Picks `target` for every job whose source has extension `source`.
    pub fn set_target_for_extension(&mut self, source: &str, target: &str) -> usize {
        let source = normalize_extension(source);
        let mut changed = 0;
        for job in self
            .jobs
            .iter_mut()
            .filter(|job| job.source_extension() == source)
        {
            if job.set_target(target).is_ok() {
                changed += 1;
            }
        }
        changed
    }

    /// Drops a job and releases its output, if it had one.
    pub fn remove(&mut self, id: JobId) -> Result<JobDescriptor, QueueError> {
        let position = self
            .jobs
            .iter()
            .position(|job| job.id() == id)
            .ok_or(QueueError::UnknownJob(id.as_uuid()))?;
        let mut job = self.jobs.remove(position);
        if let Some(handle) = job.take_output() {
            self.outputs.release(&handle.url);
        }
        debug!(job = %id, name = job.name(), "removed");
        Ok(job)
    }

    /// Empties the list and releases every output still held.
    pub fn reset(&mut self) {
        let mut released = 0;
        for mut job in self.jobs.drain(..) {
            if let Some(handle) = job.take_output() {
                released += usize::from(self.outputs.release(&handle.url));
            }
        }
        info!(released, "session reset");
    }

    pub fn summary(&self) -> BatchSummary {
        BatchSummary::of(&self.jobs)
    }
}
