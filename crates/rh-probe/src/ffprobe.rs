//! FFprobe-backed [`Extractor`].
//!
//! Shells out to `ffprobe -v quiet -print_format json -show_format -show_streams`
//! and maps the JSON output into [`MediaMetadata`].

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use rh_core::{mime_for_container, Error, MediaMetadata};
use serde::Deserialize;

use crate::command::ToolCommand;
use crate::extractor::{ExtractionOutcome, Extractor};

const PROBE_TIMEOUT: Duration = Duration::from_secs(30);

/// An extractor backed by the `ffprobe` CLI.
#[derive(Debug, Clone)]
pub struct FfprobeExtractor {
    ffprobe_path: PathBuf,
    timeout: Duration,
}

impl FfprobeExtractor {
    pub fn new(ffprobe_path: PathBuf) -> Self {
        Self {
            ffprobe_path,
            timeout: PROBE_TIMEOUT,
        }
    }

    /// Find ffprobe on `PATH`.
    pub fn from_path() -> Option<Self> {
        which::which("ffprobe").ok().map(Self::new)
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl Extractor for FfprobeExtractor {
    fn name(&self) -> &'static str {
        "ffprobe"
    }

    fn supports(&self, path: &Path) -> bool {
        path.extension().is_some()
    }

    async fn extract(&self, path: &Path) -> ExtractionOutcome {
        let mut cmd = ToolCommand::new(self.ffprobe_path.clone());
        cmd.args([
            "-v",
            "quiet",
            "-print_format",
            "json",
            "-show_format",
            "-show_streams",
        ])
        .arg(path.to_string_lossy().as_ref())
        .timeout(self.timeout);

        let output = match cmd.execute().await {
            Ok(o) => o,
            // ffprobe ran and rejected the file.
            Err(Error::Tool { message, .. }) if message.starts_with("exited") => {
                return ExtractionOutcome::Unsupported(format!("ffprobe: {message}"))
            }
            Err(e) => return ExtractionOutcome::Deferred(e.to_string()),
        };

        match serde_json::from_str::<FfprobeOutput>(&output.stdout) {
            Ok(ff) => map_output(ff),
            Err(e) => ExtractionOutcome::Unsupported(format!("ffprobe JSON parse error: {e}")),
        }
    }
}

// ---------------------------------------------------------------------------
// JSON structures
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    format: Option<FfprobeFormat>,
    #[serde(default)]
    streams: Vec<FfprobeStream>,
}

#[derive(Debug, Deserialize)]
struct FfprobeFormat {
    format_name: Option<String>,
    duration: Option<String>,
    bit_rate: Option<String>,
    #[serde(default)]
    tags: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    codec_type: Option<String>,
    codec_name: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
}

// ---------------------------------------------------------------------------
// Mapping
// ---------------------------------------------------------------------------

fn map_output(output: FfprobeOutput) -> ExtractionOutcome {
    let Some(format) = output.format else {
        return ExtractionOutcome::Unsupported("ffprobe reported no format".into());
    };
    if output.streams.is_empty() {
        return ExtractionOutcome::Unsupported("ffprobe found no streams".into());
    }

    let video = output
        .streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("video"));
    let audio = output
        .streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("audio"));

    let container = map_container(format.format_name.as_deref().unwrap_or(""), video.is_some());

    let mut tags = BTreeMap::new();
    let mut title = None;
    for (key, value) in format.tags {
        let key = key.to_lowercase();
        if key == "title" {
            title = Some(value);
        } else {
            tags.insert(key, value);
        }
    }

    ExtractionOutcome::Extracted(MediaMetadata {
        mime_type: mime_for_container(&container).to_string(),
        container,
        title,
        duration_secs: format.duration.and_then(|s| s.parse::<f64>().ok()),
        video_codec: video.and_then(|s| s.codec_name.clone()),
        audio_codec: audio.and_then(|s| s.codec_name.clone()),
        width: video.and_then(|s| s.width),
        height: video.and_then(|s| s.height),
        bit_rate: format.bit_rate.and_then(|s| s.parse::<u64>().ok()),
        extractor: "ffprobe".into(),
        tags,
        ..Default::default()
    })
}

/// Reduce ffprobe's comma-separated demuxer list to one container name.
fn map_container(format_name: &str, has_video: bool) -> String {
    let lower = format_name.to_lowercase();
    let first = lower.split(',').next().unwrap_or("");
    let name = if lower.contains("matroska") {
        if has_video {
            "mkv"
        } else {
            "mka"
        }
    } else if lower.starts_with("mov,mp4") {
        if has_video {
            "mp4"
        } else {
            "m4a"
        }
    } else {
        match first {
            "mpegts" => "ts",
            "ogg" => "ogg",
            "flac" => "flac",
            "wav" => "wav",
            "mp3" => "mp3",
            "avi" => "avi",
            "aac" => "aac",
            other => return other.to_string(),
        }
    };
    name.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(json: &str) -> ExtractionOutcome {
        map_output(serde_json::from_str(json).unwrap())
    }

    #[test]
    fn container_mapping() {
        assert_eq!(map_container("matroska,webm", true), "mkv");
        assert_eq!(map_container("mov,mp4,m4a,3gp,3g2,mj2", true), "mp4");
        assert_eq!(map_container("mov,mp4,m4a,3gp,3g2,mj2", false), "m4a");
        assert_eq!(map_container("mpegts", true), "ts");
        assert_eq!(map_container("mp3", false), "mp3");
    }

    #[test]
    fn maps_video_file() {
        let json = r#"{
            "streams": [
                {"codec_type": "video", "codec_name": "h264", "width": 1920, "height": 1080},
                {"codec_type": "audio", "codec_name": "aac"}
            ],
            "format": {
                "format_name": "mov,mp4,m4a,3gp,3g2,mj2",
                "duration": "12.500000",
                "bit_rate": "800000",
                "tags": {"TITLE": "Clip", "encoder": "x"}
            }
        }"#;
        let ExtractionOutcome::Extracted(meta) = parse(json) else {
            panic!("expected metadata");
        };
        assert_eq!(meta.container, "mp4");
        assert_eq!(meta.mime_type, "video/mp4");
        assert_eq!(meta.title.as_deref(), Some("Clip"));
        assert_eq!(meta.duration_secs, Some(12.5));
        assert_eq!(meta.video_codec.as_deref(), Some("h264"));
        assert_eq!(meta.audio_codec.as_deref(), Some("aac"));
        assert_eq!(meta.width, Some(1920));
        assert_eq!(meta.bit_rate, Some(800_000));
        assert_eq!(meta.tags.get("encoder").map(String::as_str), Some("x"));
    }

    #[test]
    fn no_streams_is_unsupported() {
        let json = r#"{"streams": [], "format": {"format_name": "tty"}}"#;
        assert!(matches!(parse(json), ExtractionOutcome::Unsupported(_)));
    }

    #[test]
    fn missing_format_is_unsupported() {
        assert!(matches!(parse("{}"), ExtractionOutcome::Unsupported(_)));
    }

    #[tokio::test]
    async fn missing_binary_defers() {
        let ex = FfprobeExtractor::new(PathBuf::from("/nonexistent/ffprobe"));
        let out = ex.extract(Path::new("/tmp/a.mp3")).await;
        assert!(matches!(out, ExtractionOutcome::Deferred(_)));
    }
}
