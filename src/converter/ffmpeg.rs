use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info};

use crate::media::HardwareEncoder;
use crate::{CasterError, Result};

/// Produces a cast-compatible MP4 from a source file.
#[async_trait]
pub trait Transcoder: Send + Sync {
    /// Whether the backend can run at all.
    async fn is_available(&self) -> bool;

    /// Stream copy into an MP4 container with the index moved to the front.
    async fn remux(&self, input: &Path, output: &Path) -> Result<()>;

    /// Full H.264/AAC re-encode on a hardware encoder.
    async fn reencode(&self, input: &Path, output: &Path, encoder: HardwareEncoder) -> Result<()>;
}

pub struct FfmpegTranscoder {
    binary: PathBuf,
    vaapi_device: PathBuf,
}

impl FfmpegTranscoder {
    pub fn new(vaapi_device: impl Into<PathBuf>) -> Self {
        Self {
            binary: PathBuf::from("ffmpeg"),
            vaapi_device: vaapi_device.into(),
        }
    }

    pub fn with_binary(mut self, binary: impl Into<PathBuf>) -> Self {
        self.binary = binary.into();
        self
    }

    async fn run(&self, args: Vec<String>) -> Result<()> {
        debug!("Running {} {}", self.binary.display(), args.join(" "));

        let output = Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| CasterError::Conversion(format!("Failed to start ffmpeg: {}", e)))?;

        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(CasterError::Conversion(format!(
            "ffmpeg exited with {}: {}",
            output.status,
            tail(&stderr, 500)
        )))
    }
}

impl Default for FfmpegTranscoder {
    fn default() -> Self {
        Self::new("/dev/dri/renderD128")
    }
}

#[async_trait]
impl Transcoder for FfmpegTranscoder {
    async fn is_available(&self) -> bool {
        Command::new(&self.binary)
            .arg("-version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|s| s.success())
            .unwrap_or(false)
    }

    async fn remux(&self, input: &Path, output: &Path) -> Result<()> {
        info!("Remuxing {} to MP4", input.display());
        self.run(remux_args(input, output)).await
    }

    async fn reencode(&self, input: &Path, output: &Path, encoder: HardwareEncoder) -> Result<()> {
        info!("Re-encoding {} with {}", input.display(), encoder.ffmpeg_name());
        self.run(reencode_args(input, output, encoder, &self.vaapi_device)).await
    }
}

pub fn remux_args(input: &Path, output: &Path) -> Vec<String> {
    let mut args = vec!["-i".to_string(), path_arg(input)];
    args.extend(["-c", "copy", "-movflags", "+faststart", "-y"].map(String::from));
    args.push(path_arg(output));
    args
}

pub fn reencode_args(input: &Path, output: &Path, encoder: HardwareEncoder, vaapi_device: &Path) -> Vec<String> {
    let mut args: Vec<String> = Vec::new();

    match encoder {
        HardwareEncoder::Nvenc => {
            args.extend(["-i".to_string(), path_arg(input)]);
            args.extend(
                [
                    "-c:v", "h264_nvenc", "-preset", "p4", "-profile:v", "high", "-level", "4.1",
                    "-b:v", "5M", "-maxrate", "8M", "-bufsize", "10M",
                ]
                .map(String::from),
            );
        }
        HardwareEncoder::Vaapi => {
            args.extend(["-vaapi_device".to_string(), path_arg(vaapi_device)]);
            args.extend(["-i".to_string(), path_arg(input)]);
            args.extend(
                [
                    "-vf", "format=nv12,hwupload", "-c:v", "h264_vaapi", "-profile:v", "high",
                    "-level", "4.1", "-qp", "23",
                ]
                .map(String::from),
            );
        }
    }

    args.extend(
        [
            "-c:a", "aac", "-b:a", "192k", "-ar", "48000", "-ac", "2", "-movflags", "+faststart",
            "-f", "mp4", "-y",
        ]
        .map(String::from),
    );
    args.push(path_arg(output));
    args
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn tail(text: &str, max_chars: usize) -> &str {
    let trimmed = text.trim_end();
    match trimmed.char_indices().rev().nth(max_chars.saturating_sub(1)) {
        Some((idx, _)) if idx > 0 => &trimmed[idx..],
        _ => trimmed,
    }
}
