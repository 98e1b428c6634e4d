//! Local batch media conversion on top of a single, non-reentrant engine.
//!
//! Callers build [`JobDescriptor`]s, pick a target format for each, and hand
//! them to a [`BatchRunner`] holding a loaded [`EngineSession`]. Outputs come
//! back as ephemeral handles in an [`OutputRegistry`].

pub mod batch;
pub mod budget;
pub mod convert;
pub mod engine;
pub mod error;
pub mod job;
pub mod limits;
pub mod output;
pub mod queue;
pub mod recipe;
pub mod reencode;

pub use batch::{BatchRunner, BatchSummary, ProgressEvent, ProgressSender};
pub use convert::Converter;
pub use engine::{Engine, EngineAssets, EngineSession, FfmpegEngine, ReclaimHint};
pub use error::{ConvertError, EngineError, QueueError};
pub use job::{Failure, JobDescriptor, JobId, JobStatus, MediaCategory, Source};
pub use output::{OutputHandle, OutputRegistry};
pub use queue::JobQueue;
