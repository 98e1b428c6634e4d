use std::path::{Path, PathBuf};

use educe::Educe;
use tempfile::TempDir;
use tokio::process::Command;
use tokio::task::spawn_blocking;
use tracing::{debug, info, warn};

use super::{Engine, EngineAssets};
use crate::error::EngineError;
use crate::recipe::Dimensions;

/// Keep only the tail of stderr; ffmpeg prints the actual failure last.
const STDERR_TAIL: usize = 2048;

/// An ffmpeg binary driven against a private scratch directory.
///
/// The scratch directory is the engine's virtual filesystem. It is removed
/// when the engine is dropped.
#[derive(Educe, Default)]
#[educe(Debug)]
pub struct FfmpegEngine {
    binary: Option<PathBuf>,
    #[educe(Debug(method(fmt_scratch)))]
    scratch: Option<TempDir>,
}

fn fmt_scratch(scratch: &Option<TempDir>, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match scratch {
        Some(dir) => write!(f, "{}", dir.path().display()),
        None => f.write_str("<unloaded>"),
    }
}

impl FfmpegEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn binary(&self) -> Result<&Path, EngineError> {
        self.binary
            .as_deref()
            .ok_or_else(|| EngineError::Unavailable("engine not loaded".into()))
    }

    fn scratch(&self) -> Result<&Path, EngineError> {
        self.scratch
            .as_ref()
            .map(TempDir::path)
            .ok_or_else(|| EngineError::Unavailable("engine not loaded".into()))
    }

    fn path_of(&self, name: &str) -> Result<PathBuf, EngineError> {
        let scratch = self.scratch()?;
        if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\\']) {
            return Err(EngineError::InvalidName(name.to_string()));
        }
        Ok(scratch.join(name))
    }
}

fn stderr_tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let text = text.trim_end();
    let mut start = text.len().saturating_sub(STDERR_TAIL);
    while !text.is_char_boundary(start) {
        start += 1;
    }
    text[start..].to_string()
}

fn not_found_as_missing(name: &str, error: std::io::Error) -> EngineError {
    if error.kind() == std::io::ErrorKind::NotFound {
        EngineError::MissingFile(name.to_string())
    } else {
        EngineError::Io(error)
    }
}

impl Engine for FfmpegEngine {
    async fn load(&mut self, assets: &EngineAssets) -> Result<(), EngineError> {
        let binary = assets
            .binary
            .clone()
            .unwrap_or_else(ffmpeg_sidecar::paths::ffmpeg_path);

        let output = Command::new(&binary)
            .args(["-hide_banner", "-version"])
            .output()
            .await
            .map_err(|e| EngineError::Unavailable(format!("{}: {e}", binary.display())))?;
        if !output.status.success() {
            return Err(EngineError::Unavailable(format!(
                "{} -version failed: {}",
                binary.display(),
                stderr_tail(&output.stderr)
            )));
        }
        let version = String::from_utf8_lossy(&output.stdout);
        let version = version.lines().next().unwrap_or_default();

        let mut builder = tempfile::Builder::new();
        builder.prefix("batch-convert-");
        let scratch = match &assets.scratch {
            Some(dir) => {
                tokio::fs::create_dir_all(dir).await?;
                builder.tempdir_in(dir)?
            }
            None => builder.tempdir()?,
        };
        info!(
            binary = %binary.display(),
            scratch = %scratch.path().display(),
            version,
            "ffmpeg ready"
        );

        self.binary = Some(binary);
        self.scratch = Some(scratch);
        Ok(())
    }

    async fn execute(&mut self, argv: &[String]) -> Result<(), EngineError> {
        let output = Command::new(self.binary()?)
            .current_dir(self.scratch()?)
            .args(argv)
            .kill_on_drop(true)
            .output()
            .await?;
        if !output.status.success() {
            let stderr = stderr_tail(&output.stderr);
            warn!(code = ?output.status.code(), "ffmpeg failed");
            return Err(EngineError::Exit {
                code: output.status.code(),
                stderr,
            });
        }
        Ok(())
    }

    async fn write_file(&mut self, name: &str, data: &[u8]) -> Result<(), EngineError> {
        let path = self.path_of(name)?;
        tokio::fs::write(&path, data).await?;
        Ok(())
    }

    async fn read_file(&mut self, name: &str) -> Result<Vec<u8>, EngineError> {
        let path = self.path_of(name)?;
        tokio::fs::read(&path)
            .await
            .map_err(|e| not_found_as_missing(name, e))
    }

    async fn delete_file(&mut self, name: &str) -> Result<(), EngineError> {
        let path = self.path_of(name)?;
        tokio::fs::remove_file(&path)
            .await
            .map_err(|e| not_found_as_missing(name, e))
    }

    async fn probe_dimensions(&mut self, name: &str) -> Option<Dimensions> {
        let path = self.path_of(name).ok()?;
        let probed = spawn_blocking(move || ffprobe::ffprobe(&path)).await.ok()?;
        let info = match probed {
            Ok(info) => info,
            Err(error) => {
                debug!(name, ?error, "ffprobe failed");
                return None;
            }
        };
        info.streams
            .iter()
            .filter(|stream| stream.codec_type.as_deref() == Some("video"))
            .find_map(|stream| {
                Some(Dimensions {
                    width: u32::try_from(stream.width?).ok()?,
                    height: u32::try_from(stream.height?).ok()?,
                })
            })
    }
}
