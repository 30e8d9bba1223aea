//! ffprobe/ffmpeg subprocess wrappers, the single source of truth for media
//! probing and external tool invocation.

use serde::Deserialize;
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;

use crate::error::StageError;

/// Parsed ffprobe output, limited to the fields the pipeline reads.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Probe {
    #[serde(default)]
    pub format: ProbeFormat,
    #[serde(default)]
    pub streams: Vec<ProbeStream>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProbeFormat {
    #[serde(default)]
    pub duration: Option<String>,
    #[serde(default)]
    pub tags: ProbeTags,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProbeTags {
    #[serde(default)]
    pub creation_time: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProbeStream {
    #[serde(default)]
    pub codec_type: Option<String>,
    #[serde(default)]
    pub channels: Option<u32>,
    #[serde(default)]
    pub sample_rate: Option<String>,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
    #[serde(default)]
    pub duration: Option<String>,
}

impl Probe {
    pub fn duration_seconds(&self) -> f64 {
        self.format
            .duration
            .as_deref()
            .and_then(|d| d.parse::<f64>().ok())
            .unwrap_or(0.0)
    }

    pub fn creation_time(&self) -> String {
        self.format.tags.creation_time.clone().unwrap_or_default()
    }

    pub fn audio_stream(&self) -> Option<&ProbeStream> {
        self.streams
            .iter()
            .find(|s| s.codec_type.as_deref() == Some("audio"))
    }

    pub fn has_audio(&self) -> bool {
        self.audio_stream().is_some()
    }

    pub fn video_dimensions(&self) -> Option<(u32, u32)> {
        self.streams
            .iter()
            .find(|s| s.codec_type.as_deref() == Some("video"))
            .and_then(|s| Some((s.width?, s.height?)))
    }

    /// Duration of the video track itself, which can differ from the container
    /// duration after a stream-copy concat.
    pub fn video_duration_seconds(&self) -> Option<f64> {
        self.streams
            .iter()
            .find(|s| s.codec_type.as_deref() == Some("video"))
            .and_then(|s| s.duration.as_deref())
            .and_then(|d| d.parse::<f64>().ok())
    }
}

/// Run ffprobe and return parsed format + stream info.
pub async fn probe(path: &Path) -> Result<Probe, StageError> {
    let output = Command::new("ffprobe")
        .args(["-v", "quiet", "-print_format", "json", "-show_format", "-show_streams"])
        .arg(path)
        .stdin(Stdio::null())
        .output()
        .await?;

    if !output.status.success() {
        return Err(StageError::Tool {
            tool: "ffprobe".to_string(),
            detail: format!(
                "exit {:?} probing {:?}: {}",
                output.status.code(),
                path,
                tail(&String::from_utf8_lossy(&output.stderr))
            ),
        });
    }

    let probe: Probe = serde_json::from_slice(&output.stdout)?;
    Ok(probe)
}

/// Run ffmpeg with `-y` prepended; non-zero exit surfaces the stderr tail.
pub async fn run_ffmpeg<I, S>(args: I) -> Result<(), StageError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<std::ffi::OsStr>,
{
    let mut cmd = Command::new("ffmpeg");
    cmd.arg("-y");
    cmd.args(args);
    run_tool("ffmpeg", cmd).await
}

/// Run an external tool to completion, capturing output.
pub async fn run_tool(tool: &str, mut cmd: Command) -> Result<(), StageError> {
    cmd.stdin(Stdio::null());
    let output = cmd.output().await?;
    if !output.status.success() {
        return Err(StageError::Tool {
            tool: tool.to_string(),
            detail: format!(
                "exit {:?}: {}",
                output.status.code(),
                tail(&String::from_utf8_lossy(&output.stderr))
            ),
        });
    }
    Ok(())
}

/// Keep error messages bounded: the last few hundred bytes of tool stderr.
fn tail(s: &str) -> String {
    const MAX: usize = 500;
    if s.len() <= MAX {
        return s.trim().to_string();
    }
    let cut = s.len() - MAX;
    let start = (cut..s.len()).find(|&i| s.is_char_boundary(i)).unwrap_or(cut);
    s[start..].trim().to_string()
}

/// Escape a path for use inside an ffmpeg filter string, where backslashes,
/// colons, and single quotes all have meaning.
pub fn escape_filter_path(path: &Path) -> String {
    path.to_string_lossy()
        .replace('\\', "\\\\")
        .replace(':', "\\:")
        .replace('\'', "\\'")
}

/// Read a mono WAV file into float samples (as written by the ffmpeg
/// channelsplit extraction).
pub fn read_wav_samples(path: &Path) -> Result<(Vec<f32>, u32), StageError> {
    let mut reader = hound::WavReader::open(path)?;
    let spec = reader.spec();
    let samples: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Int => reader
            .samples::<i16>()
            .collect::<Result<Vec<i16>, _>>()?
            .into_iter()
            .map(|s| s as f32)
            .collect(),
        hound::SampleFormat::Float => reader.samples::<f32>().collect::<Result<Vec<f32>, _>>()?,
    };
    Ok((samples, spec.sample_rate))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_parses_ffprobe_json() {
        let raw = r#"{
            "format": {"duration": "123.456", "tags": {"creation_time": "2026-08-25T10:00:00Z"}},
            "streams": [
                {"codec_type": "video", "width": 3840, "height": 2160},
                {"codec_type": "audio", "channels": 2, "sample_rate": "48000"}
            ]
        }"#;
        let probe: Probe = serde_json::from_str(raw).unwrap();
        assert_eq!(probe.duration_seconds(), 123.456);
        assert_eq!(probe.creation_time(), "2026-08-25T10:00:00Z");
        assert!(probe.has_audio());
        assert_eq!(probe.audio_stream().unwrap().channels, Some(2));
        assert_eq!(probe.video_dimensions(), Some((3840, 2160)));
    }

    #[test]
    fn test_probe_tolerates_missing_fields() {
        let probe: Probe = serde_json::from_str("{}").unwrap();
        assert_eq!(probe.duration_seconds(), 0.0);
        assert!(!probe.has_audio());
        assert_eq!(probe.video_dimensions(), None);
    }

    #[test]
    fn test_video_duration_reads_stream_not_container() {
        let raw = r#"{
            "format": {"duration": "61.0"},
            "streams": [{"codec_type": "video", "duration": "60.5"}]
        }"#;
        let probe: Probe = serde_json::from_str(raw).unwrap();
        assert_eq!(probe.video_duration_seconds(), Some(60.5));
    }

    #[test]
    fn test_escape_filter_path() {
        let escaped = escape_filter_path(Path::new("/tmp/it's:here"));
        assert_eq!(escaped, "/tmp/it\\'s\\:here");
    }

    #[test]
    fn test_tail_bounds_long_output() {
        let long = "x".repeat(2000);
        assert_eq!(tail(&long).len(), 500);
        assert_eq!(tail("short"), "short");
    }
}
