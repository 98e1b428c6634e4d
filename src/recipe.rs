//! Engine directives per (source category, target format).
//!
//! Codec choice is driven by the target format alone. The only thing ever
//! probed from the source is the pixel size for raw image export.

use std::fmt;

use serde::Serialize;
use strum::{AsRefStr, EnumString};

use crate::budget::MemoryBudget;
use crate::job::MediaCategory;
use crate::limits::MIN_PROBE_SIZE;

/// Image targets re-encoded natively, without the engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, EnumString, AsRefStr)]
#[strum(serialize_all = "lowercase")]
pub enum WebImage {
    Jpg,
    Jpeg,
    Png,
    Webp,
}

/// Vector targets an image cannot be converted to directly.
#[derive(Clone, Copy, Debug, PartialEq, Eq, EnumString, AsRefStr)]
#[strum(serialize_all = "lowercase")]
pub enum VectorImage {
    Svg,
    Eps,
    Ai,
}

/// Where a conversion runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Route {
    Native(WebImage),
    Unsupported(VectorImage),
    Engine,
}

pub fn route(category: MediaCategory, target: &str) -> Route {
    if category != MediaCategory::Image {
        return Route::Engine;
    }
    if let Ok(web) = target.parse() {
        return Route::Native(web);
    }
    if let Ok(vector) = target.parse() {
        return Route::Unsupported(vector);
    }
    Route::Engine
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

impl fmt::Display for Dimensions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Ordered engine directive tokens, without input, output or global flags.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Recipe(Vec<String>);

impl Recipe {
    fn push<I, S>(&mut self, tokens: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.0.extend(tokens.into_iter().map(Into::into));
    }

    pub fn tokens(&self) -> &[String] {
        &self.0
    }

    pub fn contains(&self, token: &str) -> bool {
        self.0.iter().any(|t| t == token)
    }

    /// Full argv for one invocation.
    ///
    /// The buffer hint only sizes input probing. It never caps allocations,
    /// so a small file with large frames still decodes.
    pub fn command(&self, input: &str, output: &str, budget: &MemoryBudget) -> Vec<String> {
        let mut argv: Vec<String> = Vec::with_capacity(self.0.len() + 10);
        let probe_size = budget.buffer_size.max(MIN_PROBE_SIZE);
        #[rustfmt::skip]
        argv.extend([
            "-hide_banner".to_string(),
            "-y".to_string(),
            "-probesize".to_string(), probe_size.to_string(),
            "-i".to_string(), input.to_string(),
        ]);
        argv.extend(self.0.iter().cloned());
        argv.push("-threads".into());
        argv.push(budget.parallelism.threads_flag().into());
        argv.push(output.into());
        argv
    }
}

impl fmt::Display for Recipe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join(" "))
    }
}

/// Directive that makes the engine do nothing and exit cleanly.
pub fn clear() -> Vec<String> {
    vec!["-hide_banner".into(), "-version".into()]
}

/// Whether the recipe wants the source's pixel size probed first.
pub fn needs_dimensions(category: MediaCategory, target: &str) -> bool {
    category == MediaCategory::Image && matches!(target, "raw" | "rgb")
}

pub fn build(category: MediaCategory, target: &str) -> Recipe {
    build_with_dimensions(category, target, None)
}

/// `dimensions` is only consulted for raw image export.
pub fn build_with_dimensions(
    category: MediaCategory,
    target: &str,
    dimensions: Option<Dimensions>,
) -> Recipe {
    let target = target.trim().trim_start_matches('.').to_ascii_lowercase();
    let mut recipe = Recipe::default();
    match category {
        MediaCategory::Image => image(&mut recipe, &target, dimensions),
        MediaCategory::Video if is_audio_target(&target) => {
            recipe.push(["-vn"]);
            audio(&mut recipe, &target);
        }
        MediaCategory::Video => {
            video(&mut recipe, &target);
            paired_audio(&mut recipe, &target);
        }
        MediaCategory::Audio => {
            recipe.push(["-vn"]);
            audio(&mut recipe, &target);
        }
    }
    recipe
}

const AUDIO_TARGETS: &[&str] = &[
    "mp3", "aac", "m4a", "ogg", "oga", "opus", "wma", "flac", "wav", "aiff", "aif", "ac3", "alac",
];

fn is_audio_target(target: &str) -> bool {
    AUDIO_TARGETS.contains(&target)
}

const PALETTE_GRAPH: &str = "split[s0][s1];[s0]palettegen[p];[s1][p]paletteuse";

fn image(recipe: &mut Recipe, target: &str, dimensions: Option<Dimensions>) {
    match target {
        "tif" | "tiff" => recipe.push(["-c:v", "tiff", "-compression_algo", "lzw"]),
        "bmp" => recipe.push(["-c:v", "bmp", "-pix_fmt", "bgr24"]),
        "gif" => {
            recipe.push(["-vf", PALETTE_GRAPH]);
            return;
        }
        "raw" | "rgb" => {
            recipe.push(["-f", "rawvideo", "-pix_fmt", "rgb24"]);
            if let Some(dimensions) = dimensions {
                recipe.push(["-s".to_string(), dimensions.to_string()]);
            }
        }
        "tga" => recipe.push(["-c:v", "targa"]),
        "ico" => recipe.push([
            "-vf",
            "scale=256:256:force_original_aspect_ratio=decrease",
            "-c:v",
            "bmp",
        ]),
        "avif" => recipe.push(["-c:v", "libaom-av1", "-still-picture", "1", "-crf", "30"]),
        "jp2" => recipe.push(["-c:v", "jpeg2000"]),
        _ => {}
    }
    recipe.push(["-frames:v", "1"]);
}

fn video(recipe: &mut Recipe, target: &str) {
    match target {
        "webm" => recipe.push([
            "-c:v", "libvpx", "-quality", "good", "-cpu-used", "4", "-crf", "10", "-b:v", "1M",
        ]),
        "gif" => recipe.push([
            "-vf",
            "fps=10,scale=480:-1:flags=lanczos,split[s0][s1];[s0]palettegen[p];[s1][p]paletteuse",
            "-loop",
            "0",
        ]),
        "3gp" | "3g2" => recipe.push([
            "-c:v", "libx264", "-profile:v", "baseline", "-level", "3.0", "-pix_fmt", "yuv420p",
            "-s", "352x288", "-r", "15", "-b:v", "192k", "-maxrate", "256k", "-bufsize", "512k",
        ]),
        "hevc" | "h265" => recipe.push([
            "-c:v", "libx265", "-crf", "28", "-preset", "medium", "-pix_fmt", "yuv420p", "-f",
            "hevc",
        ]),
        "h264" | "264" => recipe.push([
            "-c:v", "libx264", "-crf", "23", "-preset", "medium", "-pix_fmt", "yuv420p", "-f",
            "h264",
        ]),
        "mp4" | "m4v" => recipe.push([
            "-c:v", "libx264", "-crf", "23", "-preset", "medium", "-profile:v", "high", "-level",
            "4.0", "-pix_fmt", "yuv420p", "-movflags", "+faststart",
        ]),
        "mov" => recipe.push([
            "-c:v", "libx264", "-crf", "23", "-preset", "medium", "-pix_fmt", "yuv420p",
            "-movflags", "+faststart",
        ]),
        "flv" => recipe.push([
            "-c:v", "libx264", "-crf", "23", "-preset", "veryfast", "-pix_fmt", "yuv420p", "-f",
            "flv",
        ]),
        "ogv" => recipe.push(["-c:v", "libtheora", "-q:v", "7"]),
        "wmv" => recipe.push(["-c:v", "wmv2", "-b:v", "2M"]),
        "mpg" | "mpeg" => recipe.push(["-c:v", "mpeg2video", "-q:v", "3"]),
        "avi" => recipe.push([
            "-c:v", "libx264", "-crf", "23", "-preset", "medium", "-pix_fmt", "yuv420p",
        ]),
        _ => recipe.push(["-c:v", "libx264", "-crf", "23", "-preset", "medium"]),
    }
}

/// Audio stream that travels with a video target.
fn paired_audio(recipe: &mut Recipe, target: &str) {
    match target {
        "gif" => recipe.push(["-an"]),
        "webm" | "ogv" => recipe.push(["-c:a", "libvorbis", "-b:a", "128k"]),
        "3gp" | "3g2" => recipe.push(["-c:a", "aac", "-b:a", "64k", "-ac", "1", "-ar", "22050"]),
        "wmv" => recipe.push(["-c:a", "wmav2", "-b:a", "192k"]),
        "mpg" | "mpeg" => recipe.push(["-c:a", "mp2", "-b:a", "192k"]),
        "flv" => recipe.push(["-c:a", "aac", "-b:a", "128k", "-ar", "44100"]),
        "hevc" | "h265" | "h264" | "264" => recipe.push(["-an"]),
        _ => recipe.push(["-c:a", "aac", "-b:a", "128k"]),
    }
}

fn audio(recipe: &mut Recipe, target: &str) {
    match target {
        "mp3" => recipe.push(["-c:a", "libmp3lame", "-b:a", "192k"]),
        "ogg" | "oga" => recipe.push(["-c:a", "libvorbis", "-q:a", "5"]),
        "opus" => recipe.push(["-c:a", "libopus", "-b:a", "128k"]),
        "wma" => recipe.push(["-c:a", "wmav2", "-b:a", "192k"]),
        "flac" => recipe.push(["-c:a", "flac", "-compression_level", "5"]),
        "wav" => recipe.push(["-c:a", "pcm_s16le"]),
        "aiff" | "aif" => recipe.push(["-c:a", "pcm_s16be"]),
        "ac3" => recipe.push(["-c:a", "ac3", "-b:a", "192k"]),
        "alac" => recipe.push(["-c:a", "alac", "-f", "ipod"]),
        "m4a" => recipe.push(["-c:a", "aac", "-b:a", "192k", "-movflags", "+faststart"]),
        _ => recipe.push(["-c:a", "aac", "-b:a", "192k"]),
    }
}
