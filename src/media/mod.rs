//! GPU and encoder detection.
//!
//! Detection runs once at startup and the resulting [`HardwareCapabilities`]
//! value is handed to whoever needs it. Nothing here touches process-wide
//! state such as environment variables.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info};

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_RENDER_NODE: &str = "/dev/dri/renderD128";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum GpuVendor {
    Nvidia,
    Amd,
    Unknown,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HardwareEncoder {
    /// NVIDIA NVENC
    Nvenc,
    /// VA-API (AMD and Intel)
    Vaapi,
}

impl HardwareEncoder {
    pub fn ffmpeg_name(&self) -> &'static str {
        match self {
            HardwareEncoder::Nvenc => "h264_nvenc",
            HardwareEncoder::Vaapi => "h264_vaapi",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HardwareCapabilities {
    pub gpu: GpuVendor,
    pub ffmpeg_available: bool,
    pub encoders: Vec<HardwareEncoder>,
    pub vaapi_device: PathBuf,
}

impl Default for HardwareCapabilities {
    fn default() -> Self {
        Self::none()
    }
}

impl HardwareCapabilities {
    /// No GPU, no ffmpeg.
    pub fn none() -> Self {
        Self {
            gpu: GpuVendor::Unknown,
            ffmpeg_available: false,
            encoders: Vec::new(),
            vaapi_device: PathBuf::from(DEFAULT_RENDER_NODE),
        }
    }

    pub async fn detect() -> Self {
        let gpu = detect_gpu().await;
        let ffmpeg_available = probe("ffmpeg", &["-version"]).await.is_some();

        let encoders = if ffmpeg_available {
            probe("ffmpeg", &["-hide_banner", "-encoders"])
                .await
                .map(|out| usable_encoders(gpu, &parse_encoders(&out)))
                .unwrap_or_default()
        } else {
            Vec::new()
        };

        let caps = Self {
            gpu,
            ffmpeg_available,
            encoders,
            vaapi_device: PathBuf::from(DEFAULT_RENDER_NODE),
        };
        info!("Hardware capabilities: gpu={:?} ffmpeg={} encoders={:?}", caps.gpu, caps.ffmpeg_available, caps.encoders);
        caps
    }

    /// Encoder to use for a re-encode, if any.
    pub fn preferred_encoder(&self) -> Option<HardwareEncoder> {
        let preference = match self.gpu {
            GpuVendor::Nvidia => [HardwareEncoder::Nvenc, HardwareEncoder::Vaapi],
            _ => [HardwareEncoder::Vaapi, HardwareEncoder::Nvenc],
        };
        preference.into_iter().find(|e| self.encoders.contains(e))
    }
}

async fn detect_gpu() -> GpuVendor {
    if let Some(out) = probe("nvidia-smi", &["-L"]).await {
        if out.contains("GPU") {
            return GpuVendor::Nvidia;
        }
    }
    if let Some(out) = probe("lspci", &[]).await {
        if out.contains("AMD") || out.contains("Radeon") {
            return GpuVendor::Amd;
        }
    }
    GpuVendor::Unknown
}

/// Stdout of a successful command run, `None` if missing, failing or slow.
async fn probe(program: &str, args: &[&str]) -> Option<String> {
    let output = tokio::time::timeout(PROBE_TIMEOUT, Command::new(program).args(args).kill_on_drop(true).output())
        .await
        .ok()?
        .ok()?;

    if !output.status.success() {
        debug!("{} exited with {}", program, output.status);
        return None;
    }
    Some(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Hardware H.264 encoders listed by `ffmpeg -encoders`.
pub fn parse_encoders(output: &str) -> Vec<HardwareEncoder> {
    let mut found = Vec::new();
    for line in output.lines() {
        let mut fields = line.split_whitespace();
        let (Some(_flags), Some(name)) = (fields.next(), fields.next()) else {
            continue;
        };
        let encoder = match name {
            "h264_nvenc" => HardwareEncoder::Nvenc,
            "h264_vaapi" => HardwareEncoder::Vaapi,
            _ => continue,
        };
        if !found.contains(&encoder) {
            found.push(encoder);
        }
    }
    found
}

/// An ffmpeg build lists encoders it was compiled with, not ones the
/// machine can run. NVENC needs an NVIDIA card; VA-API is skipped on NVIDIA.
fn usable_encoders(gpu: GpuVendor, listed: &[HardwareEncoder]) -> Vec<HardwareEncoder> {
    listed
        .iter()
        .copied()
        .filter(|e| match e {
            HardwareEncoder::Nvenc => gpu == GpuVendor::Nvidia,
            HardwareEncoder::Vaapi => gpu != GpuVendor::Nvidia,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const ENCODERS: &str = "Encoders:
 V..... = Video
 ------
 V....D libx264              libx264 H.264 / AVC / MPEG-4 AVC (codec h264)
 V....D h264_nvenc           NVIDIA NVENC H.264 encoder (codec h264)
 V....D h264_vaapi           H.264/AVC (VAAPI) (codec h264)
 A....D aac                  AAC (Advanced Audio Coding)
";

    #[test]
    fn test_parse_encoders() {
        assert_eq!(parse_encoders(ENCODERS), vec![HardwareEncoder::Nvenc, HardwareEncoder::Vaapi]);
        assert!(parse_encoders("").is_empty());
    }

    #[test]
    fn test_usable_encoders_follow_gpu() {
        let listed = parse_encoders(ENCODERS);
        assert_eq!(usable_encoders(GpuVendor::Nvidia, &listed), vec![HardwareEncoder::Nvenc]);
        assert_eq!(usable_encoders(GpuVendor::Amd, &listed), vec![HardwareEncoder::Vaapi]);
    }

    #[test]
    fn test_preferred_encoder() {
        assert_eq!(HardwareCapabilities::none().preferred_encoder(), None);

        let caps = HardwareCapabilities {
            gpu: GpuVendor::Amd,
            ffmpeg_available: true,
            encoders: vec![HardwareEncoder::Vaapi],
            ..HardwareCapabilities::none()
        };
        assert_eq!(caps.preferred_encoder(), Some(HardwareEncoder::Vaapi));
        assert_eq!(caps.preferred_encoder().map(|e| e.ffmpeg_name()), Some("h264_vaapi"));
    }
}
