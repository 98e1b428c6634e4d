use std::fmt;
use std::io;
use std::path::PathBuf;
use std::time::SystemTime;

use bytes::Bytes;
use educe::Educe;
use serde::Serialize;
use strum::{AsRefStr, Display, EnumString};
use uuid::Uuid;

use crate::error::{ConvertError, QueueError};
use crate::limits::{human, MAX_FILE_SIZE};
use crate::output::OutputHandle;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }

    /// Short form used in virtual file names.
    pub fn simple(&self) -> String {
        self.0.simple().to_string()
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Top level of a MIME type, the only thing recipes are keyed on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display, EnumString, AsRefStr, Serialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum MediaCategory {
    Image,
    Video,
    Audio,
}

impl MediaCategory {
    pub fn from_mime(mime: &str) -> Option<Self> {
        let (top, _) = mime.split_once('/')?;
        top.trim().to_ascii_lowercase().parse().ok()
    }
}

/// Conversion state of one job.
///
/// ```mermaid
/// stateDiagram-v2
///     [*] --> Pending
///     Pending --> Converting
///     Converting --> Converted
///     Converting --> Errored
///     Errored --> Converting: retry
/// ```
#[cfg_attr(doc, aquamarine::aquamarine)]
#[derive(Clone, Debug, Default, Display, Serialize)]
#[strum(serialize_all = "lowercase")]
#[serde(tag = "state", content = "detail", rename_all = "lowercase")]
pub enum JobStatus {
    #[default]
    Pending,
    Converting,
    Converted(OutputHandle),
    Errored(Failure),
}

/// Why a job ended up errored.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Failure {
    pub reason: String,
    /// False for rejections that fail the same way until the job itself changes.
    pub retryable: bool,
}

impl Failure {
    pub fn new(reason: impl Into<String>, retryable: bool) -> Self {
        Self {
            reason: reason.into(),
            retryable,
        }
    }
}

impl From<&ConvertError> for Failure {
    fn from(error: &ConvertError) -> Self {
        Self::new(error.to_string(), !error.is_precondition())
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.reason)
    }
}

impl JobStatus {
    pub fn output(&self) -> Option<&OutputHandle> {
        match self {
            JobStatus::Converted(handle) => Some(handle),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            JobStatus::Errored(failure) => Some(&failure.reason),
            _ => None,
        }
    }

    /// Errored by something other than a precondition rejection.
    pub fn is_retryable(&self) -> bool {
        matches!(self, JobStatus::Errored(failure) if failure.retryable)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Converted(_) | JobStatus::Errored(_))
    }
}

/// Where a job's bytes live. File sources are read only when the job runs.
#[derive(Clone, Debug)]
pub enum Source {
    Memory(Bytes),
    File(PathBuf),
}

impl Source {
    pub async fn load(&self) -> io::Result<Bytes> {
        match self {
            Source::Memory(data) => Ok(data.clone()),
            Source::File(path) => tokio::fs::read(path).await.map(Bytes::from),
        }
    }
}

/// One file pending or going through conversion.
#[derive(Educe)]
#[educe(Debug)]
pub struct JobDescriptor {
    id: JobId,
    #[educe(Debug(ignore))]
    source: Option<Source>,
    name: String,
    byte_size: u64,
    mime_type: String,
    last_modified: SystemTime,
    source_extension: String,
    target_extension: String,
    pub(crate) status: JobStatus,
}

impl JobDescriptor {
    /// Builds a descriptor without the acceptance checks; `accept` is the upload path.
    pub fn new(
        name: impl Into<String>,
        mime_type: impl Into<String>,
        source: Option<Bytes>,
        last_modified: SystemTime,
    ) -> Self {
        let byte_size = source.as_ref().map_or(0, |data| data.len() as u64);
        Self::with_source(name, mime_type, source.map(Source::Memory), byte_size, last_modified)
    }

    fn with_source(
        name: impl Into<String>,
        mime_type: impl Into<String>,
        source: Option<Source>,
        byte_size: u64,
        last_modified: SystemTime,
    ) -> Self {
        let name = name.into();
        let source_extension = extension_of(&name);
        Self {
            id: JobId::new(),
            source,
            name,
            byte_size,
            mime_type: mime_type.into(),
            last_modified,
            source_extension,
            target_extension: String::new(),
            status: JobStatus::Pending,
        }
    }

    /// Acceptance filter for freshly captured files: audio, video or image under the size ceiling.
    pub fn accept(
        name: impl Into<String>,
        mime_type: impl Into<String>,
        source: Bytes,
        last_modified: SystemTime,
    ) -> Result<Self, QueueError> {
        let name = name.into();
        let mime_type = mime_type.into();
        admit(&name, &mime_type, source.len() as u64)?;
        Ok(Self::new(name, mime_type, Some(source), last_modified))
    }

    /// Same filter as [`accept`](Self::accept) for a file on disk. Its bytes are not
    /// read here; the converter loads them when the job runs.
    pub fn accept_file(
        name: impl Into<String>,
        mime_type: impl Into<String>,
        path: impl Into<PathBuf>,
        byte_size: u64,
        last_modified: SystemTime,
    ) -> Result<Self, QueueError> {
        let name = name.into();
        let mime_type = mime_type.into();
        admit(&name, &mime_type, byte_size)?;
        let source = Some(Source::File(path.into()));
        Ok(Self::with_source(name, mime_type, source, byte_size, last_modified))
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn byte_size(&self) -> u64 {
        self.byte_size
    }

    pub fn mime_type(&self) -> &str {
        &self.mime_type
    }

    pub fn last_modified(&self) -> SystemTime {
        self.last_modified
    }

    pub fn source(&self) -> Option<&Source> {
        self.source.as_ref()
    }

    pub fn category(&self) -> Option<MediaCategory> {
        MediaCategory::from_mime(&self.mime_type)
    }

    pub fn source_extension(&self) -> &str {
        &self.source_extension
    }

    pub fn target_extension(&self) -> &str {
        &self.target_extension
    }

    pub fn status(&self) -> &JobStatus {
        &self.status
    }

    pub fn is_ready(&self) -> bool {
        !self.target_extension.is_empty()
    }

    /// Format-picker entry point. Only the target changes; status and output are untouched.
    pub fn set_target(&mut self, extension: &str) -> Result<(), QueueError> {
        if matches!(self.status, JobStatus::Converting) {
            return Err(QueueError::Busy {
                name: self.name.clone(),
                status: self.status.clone(),
            });
        }
        self.target_extension = normalize_extension(extension);
        Ok(())
    }

    /// `name` with its last extension swapped for the target.
    pub fn output_file_name(&self) -> String {
        let stem = match self.name.rsplit_once('.') {
            Some((stem, _)) if !stem.is_empty() => stem,
            _ => self.name.as_str(),
        };
        format!("{stem}.{}", self.target_extension)
    }

    #[cfg(test)]
    pub(crate) fn with_byte_size(mut self, byte_size: u64) -> Self {
        self.byte_size = byte_size;
        self
    }

    /// Converted jobs never run again, so their source can go.
    pub(crate) fn release_source(&mut self) {
        self.source = None;
    }

    pub(crate) fn take_output(&mut self) -> Option<OutputHandle> {
        match std::mem::take(&mut self.status) {
            JobStatus::Converted(handle) => Some(handle),
            other => {
                self.status = other;
                None
            }
        }
    }
}

fn admit(name: &str, mime_type: &str, size: u64) -> Result<(), QueueError> {
    if MediaCategory::from_mime(mime_type).is_none() {
        return Err(QueueError::UnsupportedMedia {
            name: name.to_string(),
            mime: mime_type.to_string(),
        });
    }
    if size > MAX_FILE_SIZE {
        return Err(QueueError::TooLarge {
            name: name.to_string(),
            size: human(size),
            limit: human(MAX_FILE_SIZE),
        });
    }
    Ok(())
}

/// Text after the last `.`, lowercased; empty when there is none.
pub fn extension_of(name: &str) -> String {
    match name.rsplit_once('.') {
        Some((_, ext)) => ext.to_ascii_lowercase(),
        None => String::new(),
    }
}

pub fn normalize_extension(extension: &str) -> String {
    extension.trim().trim_start_matches('.').to_ascii_lowercase()
}
