//! The embedded conversion engine and the session handle that guards it.
//!
//! An engine is stateful and not reentrant: it owns a flat namespace of
//! virtual files and runs one command at a time. [`EngineSession`] is the only
//! way the rest of the crate talks to it. A session exists only once the engine
//! has loaded, and every call goes through one lock, so a second `execute` can
//! never start while another is in flight.

pub mod ffmpeg;
#[cfg(test)]
pub(crate) mod testing;

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info, trace};

use crate::error::EngineError;
use crate::recipe::{self, Dimensions};

pub use ffmpeg::FfmpegEngine;

/// Where an engine finds its program and where its virtual filesystem lives.
#[derive(Clone, Debug, Default)]
pub struct EngineAssets {
    pub binary: Option<PathBuf>,
    pub scratch: Option<PathBuf>,
}

/// Best-effort request to give memory back. Never needed for correctness.
pub type ReclaimHint = Arc<dyn Fn() + Send + Sync>;

#[allow(async_fn_in_trait)]
pub trait Engine {
    async fn load(&mut self, assets: &EngineAssets) -> Result<(), EngineError>;

    /// Runs one command. A nonzero exit is an error.
    async fn execute(&mut self, argv: &[String]) -> Result<(), EngineError>;

    async fn write_file(&mut self, name: &str, data: &[u8]) -> Result<(), EngineError>;

    async fn read_file(&mut self, name: &str) -> Result<Vec<u8>, EngineError>;

    /// Fails with [`EngineError::MissingFile`] when there is nothing to delete.
    async fn delete_file(&mut self, name: &str) -> Result<(), EngineError>;

    /// Pixel size of a staged image, for engines that can tell.
    async fn probe_dimensions(&mut self, _name: &str) -> Option<Dimensions> {
        None
    }
}

pub struct EngineSession<E> {
    engine: Mutex<E>,
    commands: AtomicU64,
}

impl<E: Engine> EngineSession<E> {
    #[tracing::instrument(skip_all)]
    pub async fn load(mut engine: E, assets: &EngineAssets) -> Result<Self, EngineError> {
        engine.load(assets).await?;
        info!("conversion engine loaded");
        Ok(Self {
            engine: Mutex::new(engine),
            commands: AtomicU64::new(0),
        })
    }

    pub async fn execute(&self, argv: &[String]) -> Result<(), EngineError> {
        let mut engine = self.engine.lock().await;
        let seq = self.commands.fetch_add(1, Ordering::Relaxed);
        debug!(seq, argv = %argv.join(" "), "engine command");
        engine.execute(argv).await
    }

    /// No-op command issued between chunks so the engine can drop working memory.
    pub async fn clear(&self) -> Result<(), EngineError> {
        self.execute(&recipe::clear()).await
    }

    pub async fn write_file(&self, name: &str, data: &[u8]) -> Result<(), EngineError> {
        trace!(name, len = data.len(), "stage virtual file");
        self.engine.lock().await.write_file(name, data).await
    }

    pub async fn read_file(&self, name: &str) -> Result<Vec<u8>, EngineError> {
        self.engine.lock().await.read_file(name).await
    }

    pub async fn delete_file(&self, name: &str) -> Result<(), EngineError> {
        self.engine.lock().await.delete_file(name).await
    }

    /// Deletes without reporting. Missing files are the common case here.
    pub async fn discard(&self, name: &str) {
        if let Err(error) = self.delete_file(name).await {
            trace!(name, %error, "discard virtual file");
        }
    }

    pub async fn probe_dimensions(&self, name: &str) -> Option<Dimensions> {
        self.engine.lock().await.probe_dimensions(name).await
    }

    /// Commands issued so far, including clears.
    pub fn commands_issued(&self) -> u64 {
        self.commands.load(Ordering::Relaxed)
    }

    pub fn into_inner(self) -> E {
        self.engine.into_inner()
    }
}
