//! Converts one job, either natively (web images) or through the engine.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::task::spawn_blocking;
use tracing::{debug, info};

use crate::budget;
use crate::engine::{Engine, EngineSession, ReclaimHint};
use crate::error::{ConvertError, EngineError};
use crate::job::{JobDescriptor, MediaCategory, Source};
use crate::limits::{human, MAX_FILE_SIZE};
use crate::output::{OutputHandle, OutputRegistry};
use crate::recipe::{self, Route, WebImage};
use crate::reencode::reencode;

pub struct Converter<E> {
    session: Arc<EngineSession<E>>,
    outputs: OutputRegistry,
    reclaim: Option<ReclaimHint>,
    memory_ceiling: Option<u64>,
}

impl<E: Engine> Converter<E> {
    pub fn new(session: Arc<EngineSession<E>>, outputs: OutputRegistry) -> Self {
        Self {
            session,
            outputs,
            reclaim: None,
            memory_ceiling: budget::host_memory_ceiling(),
        }
    }

    pub fn with_reclaim_hint(mut self, hint: ReclaimHint) -> Self {
        self.reclaim = Some(hint);
        self
    }

    /// Overrides the detected host memory ceiling.
    pub fn with_memory_ceiling(mut self, ceiling: Option<u64>) -> Self {
        self.memory_ceiling = ceiling;
        self
    }

    pub fn session(&self) -> &EngineSession<E> {
        &self.session
    }

    pub fn outputs(&self) -> &OutputRegistry {
        &self.outputs
    }

    pub(crate) fn reclaim(&self) {
        if let Some(hint) = &self.reclaim {
            hint();
        }
    }

    /// The source bytes are loaded here and dropped before returning, so only the
    /// job being converted holds its input in memory.
    #[tracing::instrument(
        skip_all,
        fields(job = %job.id(), name = job.name(), target = job.target_extension())
    )]
    pub async fn convert(&self, job: &JobDescriptor) -> Result<OutputHandle, ConvertError> {
        let started = Instant::now();
        let (source, plan) = preconditions(job)?;
        let source = source
            .load()
            .await
            .map_err(|source| ConvertError::SourceRead {
                name: job.name().to_string(),
                source,
            })?;
        if source.is_empty() {
            return Err(ConvertError::MissingSource {
                name: job.name().to_string(),
            });
        }

        let data = match plan {
            Plan::Native(format) => {
                debug!(?format, "native image re-encode");
                spawn_blocking(move || reencode(&source, format))
                    .await
                    .map_err(|e| ConvertError::Aborted(e.to_string()))??
            }
            Plan::Engine(category) => self.through_engine(job, category, &source).await?,
        };

        let handle = self
            .outputs
            .register(Bytes::from(data), job.output_file_name());
        self.reclaim();

        let elapsed = Duration::from_millis(started.elapsed().as_millis() as u64);
        info!(
            output = %handle.file_name,
            size = %human(handle.byte_size),
            elapsed = %humantime::format_duration(elapsed),
            "converted"
        );
        Ok(handle)
    }

    /// Stages, runs and reads back; the virtual files are removed on every exit path.
    async fn through_engine(
        &self,
        job: &JobDescriptor,
        category: MediaCategory,
        source: &Bytes,
    ) -> Result<Vec<u8>, ConvertError> {
        let source_ext = match job.source_extension() {
            "" => "bin",
            ext => ext,
        };
        let input = format!("{}-in.{source_ext}", job.id().simple());
        let output = format!("{}-out.{}", job.id().simple(), job.target_extension());

        // leftovers from an interrupted attempt on the same job
        self.session.discard(&input).await;
        self.session.discard(&output).await;

        let result = self
            .run_recipe(job, category, source, &input, &output)
            .await;

        self.session.discard(&input).await;
        self.session.discard(&output).await;
        result
    }

    async fn run_recipe(
        &self,
        job: &JobDescriptor,
        category: MediaCategory,
        source: &Bytes,
        input: &str,
        output: &str,
    ) -> Result<Vec<u8>, ConvertError> {
        self.session.write_file(input, source).await?;

        let target = job.target_extension();
        let dimensions = if recipe::needs_dimensions(category, target) {
            self.session.probe_dimensions(input).await
        } else {
            None
        };
        let recipe = recipe::build_with_dimensions(category, target, dimensions);
        let budget = budget::estimate(job.byte_size(), self.memory_ceiling);
        let argv = recipe.command(input, output, &budget);
        self.session.execute(&argv).await?;

        let data = self.session.read_file(output).await?;
        if data.is_empty() {
            return Err(EngineError::EmptyOutput(job.name().to_string()).into());
        }
        Ok(data)
    }
}

enum Plan {
    Native(WebImage),
    Engine(MediaCategory),
}

/// Checks that need no engine.
fn preconditions(job: &JobDescriptor) -> Result<(&Source, Plan), ConvertError> {
    if !job.is_ready() {
        return Err(ConvertError::MissingTarget {
            name: job.name().to_string(),
        });
    }
    let source = match job.source() {
        Some(Source::Memory(data)) if data.is_empty() => None,
        Some(Source::File(_)) if job.byte_size() == 0 => None,
        source => source,
    };
    let source = match source {
        Some(source) => source,
        _ => {
            return Err(ConvertError::MissingSource {
                name: job.name().to_string(),
            })
        }
    };
    if job.byte_size() > MAX_FILE_SIZE {
        return Err(ConvertError::TooLarge {
            name: job.name().to_string(),
            size: human(job.byte_size()),
            limit: human(MAX_FILE_SIZE),
        });
    }
    let category = job.category().ok_or_else(|| ConvertError::UnsupportedMedia {
        mime: job.mime_type().to_string(),
    })?;
    let plan = match recipe::route(category, job.target_extension()) {
        Route::Native(format) => Plan::Native(format),
        Route::Engine => Plan::Engine(category),
        Route::Unsupported(vector) => {
            return Err(ConvertError::UnsupportedVector {
                target: vector.as_ref().to_string(),
            })
        }
    };
    Ok((source, plan))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::SystemTime;

    use super::*;
    use crate::engine::testing::{Op, RecordingEngine, Shared, CORRUPT};
    use crate::engine::EngineAssets;
    use crate::limits::{GIB, MIB};
    use crate::reencode::tests::sample_png;

    async fn converter(engine: RecordingEngine) -> (Converter<RecordingEngine>, Shared) {
        let state = engine.state();
        let session = EngineSession::load(engine, &EngineAssets::default())
            .await
            .unwrap();
        let converter = Converter::new(Arc::new(session), OutputRegistry::new())
            .with_memory_ceiling(Some(2 * GIB));
        (converter, state)
    }

    fn job(name: &str, mime: &str, data: impl Into<Bytes>, target: &str) -> JobDescriptor {
        let mut job = JobDescriptor::new(name, mime, Some(data.into()), SystemTime::UNIX_EPOCH);
        job.set_target(target).unwrap();
        job
    }

    #[tokio::test]
    async fn missing_target_never_reaches_the_engine() {
        let (converter, state) = converter(RecordingEngine::new()).await;
        let job = job("a.wav", "audio/wav", &b"RIFF"[..], "");
        let err = converter.convert(&job).await.unwrap_err();
        assert!(matches!(err, ConvertError::MissingTarget { .. }));
        assert!(err.is_precondition());
        assert!(!state.touched());
    }

    #[tokio::test]
    async fn missing_source_is_rejected() {
        let (converter, state) = converter(RecordingEngine::new()).await;
        let mut job = JobDescriptor::new("a.wav", "audio/wav", None, SystemTime::UNIX_EPOCH);
        job.set_target("mp3").unwrap();
        let err = converter.convert(&job).await.unwrap_err();
        assert!(matches!(err, ConvertError::MissingSource { .. }));
        assert!(!state.touched());
    }

    #[tokio::test]
    async fn oversize_file_fails_before_staging() {
        let (converter, state) = converter(RecordingEngine::new()).await;
        let job = job("big.mp4", "video/mp4", &b"data"[..], "webm").with_byte_size(2 * GIB + 1);
        let err = converter.convert(&job).await.unwrap_err();
        assert!(matches!(err, ConvertError::TooLarge { .. }));
        assert!(!state.touched());
    }

    #[tokio::test]
    async fn web_images_bypass_the_engine() {
        let (converter, state) = converter(RecordingEngine::new()).await;
        for target in ["jpg", "jpeg", "png", "webp"] {
            let job = job("pic.png", "image/png", sample_png(), target);
            let handle = converter.convert(&job).await.unwrap();
            assert_eq!(handle.file_name, format!("pic.{target}"));
            assert!(converter.outputs().fetch(&handle.url).is_some());
        }
        assert!(state.ops().is_empty());
    }

    #[tokio::test]
    async fn vector_targets_are_unsupported() {
        let (converter, state) = converter(RecordingEngine::new()).await;
        for target in ["svg", "eps", "ai"] {
            let job = job("pic.png", "image/png", sample_png(), target);
            let err = converter.convert(&job).await.unwrap_err();
            assert!(
                matches!(&err, ConvertError::UnsupportedVector { target: t } if t == target),
                "{err}"
            );
        }
        assert!(!state.touched());
    }

    #[tokio::test]
    async fn engine_path_stages_runs_and_cleans_up() {
        let (converter, state) = converter(RecordingEngine::new()).await;
        let job = job("clip.mov", "video/quicktime", &b"frames"[..], "webm");
        let handle = converter.convert(&job).await.unwrap();

        assert_eq!(handle.file_name, "clip.webm");
        assert_eq!(
            converter.outputs().fetch(&handle.url).as_deref(),
            Some(&b"converted:frames"[..])
        );
        assert!(state.files().is_empty());

        let argv = &state.executions()[0];
        assert!(argv.contains(&"libvpx".to_string()));
        assert_eq!(argv[argv.len() - 2], "0", "small file on a 2 GiB host runs threaded");
        assert!(argv.last().unwrap().ends_with("-out.webm"));
    }

    #[tokio::test]
    async fn engine_failure_still_cleans_up() {
        let (converter, state) = converter(RecordingEngine::new()).await;
        let mut data = CORRUPT.to_vec();
        data.extend_from_slice(b" payload");
        let job = job("bad.mp3", "audio/mpeg", data, "ogg");
        let err = converter.convert(&job).await.unwrap_err();

        assert!(matches!(err, ConvertError::Engine(EngineError::Exit { .. })));
        assert!(!err.is_precondition());
        assert!(err.to_string().contains("Invalid data"));
        assert!(state.files().is_empty());
        assert_eq!(converter.outputs().live(), 0);
    }

    #[tokio::test]
    async fn retry_is_idempotent_and_leaves_nothing_behind() {
        let (converter, state) = converter(RecordingEngine::new()).await;
        let job = job("song.wav", "audio/wav", &b"pcm"[..], "mp3");

        let first = converter.convert(&job).await.unwrap();
        assert!(state.files().is_empty());
        let second = converter.convert(&job).await.unwrap();
        assert!(state.files().is_empty());

        assert_ne!(first.url, second.url);
        assert_eq!(first.file_name, second.file_name);
    }

    #[tokio::test]
    async fn stale_entries_are_cleared_before_staging() {
        let (converter, state) = converter(RecordingEngine::new()).await;
        let job = job("song.wav", "audio/wav", &b"pcm"[..], "flac");
        let stale = format!("{}-out.flac", job.id().simple());
        state.plant(&stale, b"old output");

        converter.convert(&job).await.unwrap();
        let ops = state.ops();
        let first_delete = ops.iter().position(|op| *op == Op::Delete(stale.clone()));
        let first_write = ops.iter().position(|op| matches!(op, Op::Write(_)));
        assert!(first_delete.is_some());
        assert!(first_delete < first_write);
        assert!(state.files().is_empty());
    }

    #[tokio::test]
    async fn raw_export_uses_probed_size() {
        let (converter, state) = converter(RecordingEngine::new().with_dimensions(640, 480)).await;
        let job = job("scan.tiff", "image/tiff", &b"II*"[..], "raw");
        converter.convert(&job).await.unwrap();
        assert!(state.executions()[0].contains(&"640x480".to_string()));
    }

    #[tokio::test]
    async fn large_files_run_serial() {
        let (converter, state) = converter(RecordingEngine::new()).await;
        let job =
            job("long.mkv", "video/x-matroska", &b"frames"[..], "mp4").with_byte_size(100 * MIB);
        converter.convert(&job).await.unwrap();
        let argv = &state.executions()[0];
        assert_eq!(argv[argv.len() - 2], "1");
    }

    #[tokio::test]
    async fn file_source_is_read_when_the_job_runs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("song.wav");
        tokio::fs::write(&path, b"early").await.unwrap();
        let mut job =
            JobDescriptor::accept_file("song.wav", "audio/wav", &path, 5, SystemTime::UNIX_EPOCH)
                .unwrap();
        job.set_target("mp3").unwrap();
        tokio::fs::write(&path, b"later").await.unwrap();

        let (converter, state) = converter(RecordingEngine::new()).await;
        let handle = converter.convert(&job).await.unwrap();
        assert_eq!(
            converter.outputs().fetch(&handle.url).as_deref(),
            Some(&b"converted:later"[..])
        );
        assert!(state.files().is_empty());
    }

    #[tokio::test]
    async fn vanished_file_is_a_read_failure() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gone.wav");
        let mut job =
            JobDescriptor::accept_file("gone.wav", "audio/wav", &path, 10, SystemTime::UNIX_EPOCH)
                .unwrap();
        job.set_target("mp3").unwrap();

        let (converter, state) = converter(RecordingEngine::new()).await;
        let err = converter.convert(&job).await.unwrap_err();
        assert!(matches!(err, ConvertError::SourceRead { .. }), "{err}");
        assert!(!err.is_precondition());
        assert!(!state.touched());
    }

    #[tokio::test]
    async fn short_hd_clip_gets_no_allocation_cap() {
        let (converter, state) = converter(RecordingEngine::new()).await;
        let converter = converter.with_memory_ceiling(Some(16 * GIB));
        let job = job("intro.mp4", "video/mp4", vec![0u8; 400 * 1024], "webm");
        converter.convert(&job).await.unwrap();

        let argv = &state.executions()[0];
        assert!(!argv.iter().any(|t| t == "-max_alloc"));
        // one 1920x1080 yuv420p frame
        let frame = 1920 * 1080 * 3 / 2;
        let probe = argv.iter().position(|t| t == "-probesize").unwrap();
        assert!(argv[probe + 1].parse::<u64>().unwrap() >= frame);
    }

    #[tokio::test]
    async fn reclaim_hint_fires_on_success_only() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let (converter, _) = converter(RecordingEngine::new()).await;
        let converter = converter.with_reclaim_hint(Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        converter
            .convert(&job("a.wav", "audio/wav", &b"pcm"[..], "mp3"))
            .await
            .unwrap();
        converter
            .convert(&job("b.wav", "audio/wav", &b"pcm"[..], ""))
            .await
            .unwrap_err();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
