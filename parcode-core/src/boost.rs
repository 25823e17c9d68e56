use std::{
    path::Path,
    process::{Command, Stdio},
    sync::LazyLock,
};

use anyhow::{bail, ensure, Context};
use regex::Regex;
use serde::{Deserialize, Serialize};

static YAVG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"lavfi\.signalstats\.YAVG=(\d+(?:\.\d+)?)").expect("valid regex")
});

/// Lowers the quantizer of dark chunks, which otherwise lose more detail
/// than bright ones at the same quantizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Boost {
    /// Largest quantizer reduction, given to a completely black chunk.
    pub range: u32,
    /// The quantizer is never boosted below this.
    pub limit: u32,
}

impl Default for Boost {
    #[inline]
    fn default() -> Self {
        Self {
            range: 15,
            limit: 10,
        }
    }
}

impl Boost {
    /// Brightness at and above which a chunk is left alone.
    pub const NEUTRAL_BRIGHTNESS: f64 = 128.0;

    /// The quantizer for a chunk of average `brightness` (8 bit luma) that
    /// would otherwise be encoded at `cq`.
    #[inline]
    pub fn adjust(&self, cq: u32, brightness: f64) -> u32 {
        if brightness.is_nan() || brightness >= Self::NEUTRAL_BRIGHTNESS {
            return cq;
        }
        let darkness = (Self::NEUTRAL_BRIGHTNESS - brightness.max(0.0)) / Self::NEUTRAL_BRIGHTNESS;
        let reduction = (darkness * f64::from(self.range)).round() as u32;
        cq.saturating_sub(reduction).max(self.limit.min(cq))
    }
}

/// Measures the average brightness of a video file.
pub trait BrightnessProber: Sync {
    /// Average luma over all frames, on an 8 bit scale.
    fn brightness(&self, path: &Path) -> anyhow::Result<f64>;
}

impl<F> BrightnessProber for F
where
    F: Fn(&Path) -> anyhow::Result<f64> + Sync,
{
    #[inline]
    fn brightness(&self, path: &Path) -> anyhow::Result<f64> {
        self(path)
    }
}

/// Reads the per frame average luma from ffmpeg's `signalstats` filter.
#[derive(Debug, Clone, Copy, Default)]
pub struct FfmpegBrightness;

impl BrightnessProber for FfmpegBrightness {
    #[tracing::instrument(level = "debug", skip(self))]
    #[inline]
    fn brightness(&self, path: &Path) -> anyhow::Result<f64> {
        let output = Command::new("ffmpeg")
            .args(["-hide_banner", "-loglevel", "error", "-nostdin", "-i"])
            .arg(path)
            .args([
                "-map",
                "0:v:0",
                "-vf",
                "format=gray,signalstats,metadata=mode=print:key=lavfi.signalstats.YAVG:file=-",
                "-f",
                "null",
                "-",
            ])
            .stdin(Stdio::null())
            .output()
            .context("Failed to run ffmpeg. Is ffmpeg installed?")?;
        ensure!(
            output.status.success(),
            "ffmpeg could not measure the brightness of {path:?}: {}",
            String::from_utf8_lossy(&output.stderr)
        );

        average_luma(&String::from_utf8_lossy(&output.stdout))
            .with_context(|| format!("Failed to measure the brightness of {path:?}"))
    }
}

fn average_luma(metadata: &str) -> anyhow::Result<f64> {
    let (sum, frames) = YAVG
        .captures_iter(metadata)
        .filter_map(|caps| caps[1].parse::<f64>().ok())
        .fold((0.0, 0_usize), |(sum, frames), luma| (sum + luma, frames + 1));
    if frames == 0 {
        bail!("signalstats reported no frames");
    }
    Ok(sum / frames as f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bright_chunks_keep_their_quantizer() {
        let boost = Boost::default();
        assert_eq!(boost.adjust(30, 128.0), 30);
        assert_eq!(boost.adjust(30, 200.0), 30);
        assert_eq!(boost.adjust(30, f64::NAN), 30);
    }

    #[test]
    fn darker_chunks_get_lower_quantizers() {
        let boost = Boost::default();
        // half as bright as neutral, half the range
        assert_eq!(boost.adjust(30, 64.0), 22);
        assert_eq!(boost.adjust(30, 0.0), 15);
        assert!(boost.adjust(30, 32.0) < boost.adjust(30, 96.0));
    }

    #[test]
    fn boost_stops_at_the_limit() {
        let boost = Boost {
            range: 30,
            limit: 20,
        };
        assert_eq!(boost.adjust(35, 0.0), 20);
        // a quantizer already below the limit is never raised
        assert_eq!(boost.adjust(12, 0.0), 12);
    }

    #[test]
    fn luma_is_averaged_over_frames() {
        let metadata = "frame:0    pts:0       pts_time:0\n\
                        lavfi.signalstats.YAVG=40.5\n\
                        frame:1    pts:1       pts_time:0.04\n\
                        lavfi.signalstats.YAVG=59.5\n";
        assert!((average_luma(metadata).unwrap() - 50.0).abs() < f64::EPSILON);
        assert!(average_luma("").is_err());
    }
}
