//! Ephemeral storage for converted outputs, addressed by `blob:` URLs.
//!
//! A handle stays valid until it is released. Every handle the registry hands
//! out must eventually be released, either by the download side after the bytes
//! are written out or by the job list when the job is removed.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use serde::Serialize;
use tracing::{debug, trace};
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct OutputHandle {
    pub url: String,
    pub file_name: String,
    pub byte_size: u64,
    pub mime_type: String,
}

#[derive(Clone, Debug, Default)]
pub struct OutputRegistry {
    blobs: Arc<Mutex<HashMap<String, Bytes>>>,
}

impl OutputRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn blobs(&self) -> MutexGuard<'_, HashMap<String, Bytes>> {
        self.blobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn register(&self, data: Bytes, file_name: impl Into<String>) -> OutputHandle {
        let file_name = file_name.into();
        let url = format!("blob:{}", Uuid::new_v4());
        let mime_type = mime_guess::from_path(&file_name)
            .first_or_octet_stream()
            .to_string();
        let handle = OutputHandle {
            url: url.clone(),
            file_name,
            byte_size: data.len() as u64,
            mime_type,
        };
        debug!(url = %handle.url, file = %handle.file_name, "registered output");
        self.blobs().insert(url, data);
        handle
    }

    pub fn fetch(&self, url: &str) -> Option<Bytes> {
        self.blobs().get(url).cloned()
    }

    /// Returns whether the URL was live. Releasing twice is harmless.
    pub fn release(&self, url: &str) -> bool {
        let released = self.blobs().remove(url).is_some();
        trace!(url, released, "release output");
        released
    }

    pub fn live(&self) -> usize {
        self.blobs().len()
    }
}
