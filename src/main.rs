use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use batch_convert::batch::{retry_schedule, schedule};
use batch_convert::limits::human;
use batch_convert::recipe::{self, Route};
use batch_convert::{
    BatchRunner, Converter, EngineAssets, EngineSession, FfmpegEngine, JobDescriptor, JobQueue,
    JobStatus, MediaCategory, ProgressEvent,
};
use clap::Parser;
use indicatif::ProgressStyle;
use serde::Serialize;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
use tokio::task::spawn_blocking;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::StreamExt;
use tracing::{debug, info, info_span, warn, Span};
use tracing_indicatif::{span_ext::IndicatifSpanExt, IndicatifLayer};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;
use walkdir::WalkDir;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

#[derive(Parser)]
#[command(version, about = "Convert audio, video and image files locally")]
struct Args {
    /// Print the schedule and recipes without converting anything.
    #[arg(long)]
    dry_run: bool,
    /// Target format for every file without a more specific rule.
    #[arg(long)]
    to: Option<String>,
    /// Per-extension target, e.g. `--rule wav=flac`.
    #[arg(long = "rule", value_name = "SRC=DST", value_parser = parse_rule)]
    rules: Vec<(String, String)>,
    #[arg(long, default_value = ".")]
    out_dir: PathBuf,
    #[arg(long, env = "FFMPEG_PATH")]
    ffmpeg: Option<PathBuf>,
    #[arg(long, env = "BATCH_CONVERT_SCRATCH")]
    scratch_dir: Option<PathBuf>,
    /// Write a JSON report of every job here.
    #[arg(long)]
    report: Option<PathBuf>,
    /// Give each failed job one more attempt after the batch.
    #[arg(long)]
    retry_failed: bool,
    #[arg(required = true)]
    media: Vec<PathBuf>,
}

fn parse_rule(rule: &str) -> Result<(String, String), String> {
    match rule.split_once('=') {
        Some((src, dst)) if !src.trim().is_empty() && !dst.trim().is_empty() => {
            Ok((src.trim().to_string(), dst.trim().to_string()))
        }
        _ => Err(format!("expected SRC=DST, got '{rule}'")),
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    human_panic::setup_panic!();

    let indicatif_layer = IndicatifLayer::new();
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_writer(indicatif_layer.get_stderr_writer()))
        .with(indicatif_layer)
        .init();

    let args = Args::parse();

    info!("Discovering media files...");
    let files = discover(args.media.clone()).await?;
    info!("Found {} candidate files", files.len());

    let mut queue = JobQueue::default();
    for path in files {
        match load(&path).await {
            Ok(job) => {
                queue.add(job);
            }
            Err(e) => warn!(path = %path.display(), "skipping: {e:#}"),
        }
    }
    if queue.is_empty() {
        anyhow::bail!("no convertible media found");
    }

    for (src, dst) in &args.rules {
        let n = queue.set_target_for_extension(src, dst);
        debug!(src, dst, n, "applied rule");
    }
    if let Some(to) = &args.to {
        queue.set_target_all(to);
    }

    if args.dry_run {
        print_plan(queue.jobs());
        return Ok(());
    }

    let assets = EngineAssets {
        binary: args.ffmpeg.clone(),
        scratch: args.scratch_dir.clone(),
    };
    let session = EngineSession::load(FfmpegEngine::new(), &assets)
        .await
        .context("load conversion engine")?;
    let runner = BatchRunner::new(Converter::new(Arc::new(session), queue.outputs().clone()));

    let header_span = info_span!("header");
    header_span.pb_set_style(&ProgressStyle::default_bar());
    header_span.pb_set_length(queue.len() as u64);
    let header_span_enter = header_span.enter();

    let (tx, rx) = unbounded_channel();
    let reporter = tokio::spawn(report_progress(rx, header_span.clone()));

    let mut summary = runner.run(queue.jobs_mut(), &tx).await;
    if args.retry_failed {
        let retries: usize = retry_schedule(queue.jobs()).iter().map(Vec::len).sum();
        if retries > 0 {
            header_span.pb_set_length((queue.len() + retries) as u64);
            summary = runner.retry_failed(queue.jobs_mut(), &tx).await;
        }
    }
    drop(tx);
    reporter.await.context("progress reporter")?;

    std::mem::drop(header_span_enter);
    std::mem::drop(header_span);

    let saved = save_outputs(&mut queue, &args.out_dir).await?;
    info!(
        converted = summary.converted,
        errored = summary.errored,
        out_dir = %args.out_dir.display(),
        "Saved {} file(s)",
        saved.len()
    );

    if let Some(path) = &args.report {
        write_report(path, &queue, &saved).await?;
    }

    if let Some(advisory) = summary.advisory() {
        anyhow::bail!(advisory);
    }
    Ok(())
}

async fn discover(roots: Vec<PathBuf>) -> Result<Vec<PathBuf>> {
    spawn_blocking(move || {
        let mut files = Vec::new();
        let walker = roots
            .into_iter()
            .map(|p| shellexpand::path::tilde(&p).into_owned())
            .flat_map(|p| WalkDir::new(p).into_iter());
        for entry in walker {
            let Ok(entry) = entry else {
                warn!("skipping entry: {entry:?}");
                continue;
            };
            let path = entry.path();
            if entry.path_is_symlink() {
                debug!("skipping symlink: '{}'", path.display());
                continue;
            }
            if path.is_dir() {
                continue;
            }
            let mime = mime_guess::from_path(path).first_or_octet_stream();
            if MediaCategory::from_mime(mime.essence_str()).is_none() {
                debug!(%mime, "skipping non-media file '{}'", path.display());
                continue;
            }
            files.push(path.to_path_buf());
        }
        anyhow::Ok(files)
    })
    .await?
}

/// Queues a file without reading it; its bytes are loaded when its chunk runs.
async fn load(path: &Path) -> Result<JobDescriptor> {
    let metadata = tokio::fs::metadata(path).await.context("stat")?;
    let name = path
        .file_name()
        .context("file has no name")?
        .to_string_lossy()
        .into_owned();
    let mime = mime_guess::from_path(path).first_or_octet_stream();
    let modified = metadata.modified().unwrap_or(std::time::SystemTime::UNIX_EPOCH);
    Ok(JobDescriptor::accept_file(
        name,
        mime.essence_str(),
        path,
        metadata.len(),
        modified,
    )?)
}

fn print_plan(jobs: &[JobDescriptor]) {
    for (n, chunk) in schedule(jobs).iter().enumerate() {
        info!("chunk {n}");
        for &i in chunk {
            let job = &jobs[i];
            let target = job.target_extension();
            let plan = match job.category() {
                _ if target.is_empty() => "no target selected".to_string(),
                Some(category) => match recipe::route(category, target) {
                    Route::Native(_) => "native image re-encode".to_string(),
                    Route::Unsupported(_) => "unsupported".to_string(),
                    Route::Engine => recipe::build(category, target).to_string(),
                },
                None => "unsupported media".to_string(),
            };
            info!(size = %human(job.byte_size()), "  {} -> {target}: {plan}", job.name());
        }
    }
}

async fn report_progress(rx: UnboundedReceiver<ProgressEvent>, header: Span) {
    let mut events = UnboundedReceiverStream::new(rx);
    while let Some(event) = events.next().await {
        match &event.outcome {
            Ok(handle) => info!(
                "[{}/{}] '{}' -> '{}'",
                event.completed, event.total, event.name, handle.file_name
            ),
            Err(reason) => warn!(
                "[{}/{}] '{}' failed: {reason}",
                event.completed, event.total, event.name
            ),
        }
        header.pb_inc(1);
    }
}

/// Writes every converted output into `dir` and releases its handle.
async fn save_outputs(queue: &mut JobQueue, dir: &Path) -> Result<Vec<(String, PathBuf)>> {
    let dir = shellexpand::path::tilde(dir).into_owned();
    tokio::fs::create_dir_all(&dir)
        .await
        .with_context(|| format!("create '{}'", dir.display()))?;

    let outputs = queue.outputs().clone();
    let mut saved = Vec::new();
    for job in queue.jobs() {
        let Some(handle) = job.status().output() else {
            continue;
        };
        let Some(data) = outputs.fetch(&handle.url) else {
            warn!(url = %handle.url, "output already released");
            continue;
        };
        let path = unique_path(&dir, &handle.file_name).await;
        tokio::fs::write(&path, &data)
            .await
            .with_context(|| format!("write '{}'", path.display()))?;
        outputs.release(&handle.url);
        saved.push((job.id().to_string(), path));
    }
    Ok(saved)
}

/// `dir/name`, or `dir/stem-N.ext` when that is taken.
async fn unique_path(dir: &Path, name: &str) -> PathBuf {
    let candidate = dir.join(name);
    if !tokio::fs::try_exists(&candidate).await.unwrap_or(false) {
        return candidate;
    }
    let (stem, ext) = name.rsplit_once('.').unwrap_or((name, ""));
    let mut n = 1;
    loop {
        let candidate = match ext {
            "" => dir.join(format!("{stem}-{n}")),
            ext => dir.join(format!("{stem}-{n}.{ext}")),
        };
        if !tokio::fs::try_exists(&candidate).await.unwrap_or(false) {
            return candidate;
        }
        n += 1;
    }
}

#[derive(Serialize)]
struct Report<'a> {
    summary: batch_convert::BatchSummary,
    jobs: Vec<JobReport<'a>>,
}

#[derive(Serialize)]
struct JobReport<'a> {
    id: String,
    name: &'a str,
    bytes: u64,
    target: &'a str,
    status: &'a JobStatus,
    saved_to: Option<&'a Path>,
}

async fn write_report(path: &Path, queue: &JobQueue, saved: &[(String, PathBuf)]) -> Result<()> {
    let jobs = queue
        .jobs()
        .iter()
        .map(|job| {
            let id = job.id().to_string();
            let saved_to = saved
                .iter()
                .find(|(saved_id, _)| *saved_id == id)
                .map(|(_, path)| path.as_path());
            JobReport {
                id,
                name: job.name(),
                bytes: job.byte_size(),
                target: job.target_extension(),
                status: job.status(),
                saved_to,
            }
        })
        .collect();
    let report = Report {
        summary: queue.summary(),
        jobs,
    };
    let json = serde_json::to_vec_pretty(&report).context("serialize report")?;
    tokio::fs::write(path, json)
        .await
        .with_context(|| format!("write report '{}'", path.display()))?;
    info!(path = %path.display(), "Wrote report");
    Ok(())
}
