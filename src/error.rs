use bytesize::ByteSize;

use crate::job::JobStatus;

/// Failures raised by an [`Engine`](crate::engine::Engine) implementation.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("conversion engine is unavailable: {0}")]
    Unavailable(String),
    #[error("engine exited with {}: {stderr}", exit_label(.code))]
    Exit { code: Option<i32>, stderr: String },
    #[error("virtual file '{0}' does not exist")]
    MissingFile(String),
    #[error("'{0}' is not a valid virtual file name")]
    InvalidName(String),
    #[error("engine produced an empty output for '{0}'")]
    EmptyOutput(String),
    #[error("engine I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

fn exit_label(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("status {code}"),
        None => "a signal".to_string(),
    }
}

/// Terminal error of a single conversion.
#[derive(Debug, thiserror::Error)]
pub enum ConvertError {
    #[error("no target format selected for '{name}'")]
    MissingTarget { name: String },
    #[error("'{name}' has no source data")]
    MissingSource { name: String },
    #[error("could not read '{name}': {source}")]
    SourceRead {
        name: String,
        #[source]
        source: std::io::Error,
    },
    #[error("'{name}' is {size}, above the {limit} per-file limit")]
    TooLarge {
        name: String,
        size: ByteSize,
        limit: ByteSize,
    },
    #[error("unsupported media type '{mime}'")]
    UnsupportedMedia { mime: String },
    #[error("direct conversion from an image to {target} is not supported")]
    UnsupportedVector { target: String },
    #[error("image re-encode failed: {0}")]
    Image(#[from] image::ImageError),
    #[error("conversion task aborted: {0}")]
    Aborted(String),
    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl ConvertError {
    /// Precondition errors are detected before any engine interaction.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            ConvertError::MissingTarget { .. }
                | ConvertError::MissingSource { .. }
                | ConvertError::TooLarge { .. }
                | ConvertError::UnsupportedMedia { .. }
                | ConvertError::UnsupportedVector { .. }
        )
    }
}

/// Errors from the session's job list and its retry entry point.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("'{name}' has unsupported media type '{mime}'")]
    UnsupportedMedia { name: String, mime: String },
    #[error("'{name}' is {size}, above the {limit} per-file limit")]
    TooLarge {
        name: String,
        size: ByteSize,
        limit: ByteSize,
    },
    #[error("no job with id {0}")]
    UnknownJob(uuid::Uuid),
    #[error("'{name}' cannot change while it is {status}")]
    Busy { name: String, status: JobStatus },
    #[error("'{name}' is {status}; only errored jobs can be retried")]
    NotRetryable { name: String, status: JobStatus },
}
