use std::{
    ffi::OsString,
    fs,
    path::{Path, PathBuf},
    process::{Command, Stdio},
    sync::LazyLock,
};

use anyhow::{bail, ensure, Context};
use itertools::Itertools;
use regex::Regex;
use tracing::{debug, warn};

use crate::{into_vec, split::Segmenter};

static FFMPEG_FRAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"frame=\s*(\d+)").expect("valid regex"));

/// Counts the frames of a video file.
pub trait FrameProber: Sync {
    fn probe(&self, path: &Path) -> anyhow::Result<usize>;
}

/// Counts frames with ffprobe, falling back to decoding with ffmpeg when the
/// container has no usable packet count.
#[derive(Debug, Clone, Copy, Default)]
pub struct FfmpegProber;

impl FrameProber for FfmpegProber {
    #[inline]
    fn probe(&self, path: &Path) -> anyhow::Result<usize> {
        match count_packets(path) {
            Ok(frames) if frames > 0 => Ok(frames),
            Ok(_) => count_decoded_frames(path),
            Err(e) => {
                debug!("ffprobe could not count frames of {path:?}, decoding instead: {e:#}");
                count_decoded_frames(path)
            },
        }
    }
}

fn count_packets(path: &Path) -> anyhow::Result<usize> {
    let output = Command::new("ffprobe")
        .args([
            "-v",
            "error",
            "-select_streams",
            "v:0",
            "-count_packets",
            "-show_entries",
            "stream=nb_read_packets",
            "-of",
            "csv=p=0",
        ])
        .arg(path)
        .output()
        .context("Failed to run ffprobe. Is ffmpeg installed?")?;
    ensure!(
        output.status.success(),
        "ffprobe exited with {}: {}",
        output.status,
        String::from_utf8_lossy(&output.stderr)
    );

    let stdout = String::from_utf8_lossy(&output.stdout);
    stdout
        .trim()
        .trim_end_matches(',')
        .parse()
        .with_context(|| format!("ffprobe printed an unexpected packet count {stdout:?}"))
}

fn count_decoded_frames(path: &Path) -> anyhow::Result<usize> {
    let output = Command::new("ffmpeg")
        .args(["-hide_banner", "-nostdin", "-i"])
        .arg(path)
        .args(["-map", "0:v:0", "-c", "copy", "-f", "null", "-"])
        .output()
        .context("Failed to run ffmpeg. Is ffmpeg installed?")?;
    ensure!(
        output.status.success(),
        "ffmpeg could not read {path:?}: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    // progress lines are \r separated, the last one holds the final count
    let stderr = String::from_utf8_lossy(&output.stderr);
    match FFMPEG_FRAME.captures_iter(&stderr).last() {
        Some(caps) => Ok(caps[1].parse()?),
        None => bail!("ffmpeg reported no frame count for {path:?}"),
    }
}

/// Width and height of the first video stream.
#[inline]
pub fn probe_resolution(path: &Path) -> anyhow::Result<(u32, u32)> {
    let output = Command::new("ffprobe")
        .args([
            "-v",
            "error",
            "-select_streams",
            "v:0",
            "-show_entries",
            "stream=width,height",
            "-of",
            "csv=s=x:p=0",
        ])
        .arg(path)
        .output()
        .context("Failed to run ffprobe. Is ffmpeg installed?")?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    let Some((width, height)) = stdout.trim().split_once('x') else {
        bail!("ffprobe printed an unexpected resolution {stdout:?}");
    };
    Ok((width.parse()?, height.parse()?))
}

/// Stage 1 of every encoder pass: decodes a chunk, applies the user's
/// filters and writes y4m to stdout.
#[inline]
pub fn compose_source_pipe(source: &Path, filter_args: &[String], pix_format: &str) -> Vec<OsString> {
    let mut cmd: Vec<OsString> =
        into_vec!["ffmpeg", "-y", "-hide_banner", "-loglevel", "error", "-nostdin", "-i", source];
    cmd.extend(filter_args.iter().map(OsString::from));
    cmd.extend(into_vec![
        "-strict",
        "-1",
        "-pix_fmt",
        pix_format,
        "-f",
        "yuv4mpegpipe",
        "-"
    ]);
    cmd
}

/// Splits a source losslessly with ffmpeg's segment muxer.
#[derive(Debug, Clone, Copy, Default)]
pub struct FfmpegSegmenter;

impl Segmenter for FfmpegSegmenter {
    #[tracing::instrument(level = "debug", skip(self))]
    #[inline]
    fn segment(
        &self,
        source: &Path,
        split_points: &[usize],
        dir: &Path,
    ) -> anyhow::Result<Vec<PathBuf>> {
        fs::create_dir_all(dir)?;

        let mut cmd = Command::new("ffmpeg");
        cmd.args(["-hide_banner", "-y", "-nostdin", "-loglevel", "error", "-i"])
            .arg(source)
            .args(["-map", "0:v:0", "-an", "-c", "copy", "-avoid_negative_ts", "1", "-vsync", "0"]);

        if split_points.is_empty() {
            cmd.arg(dir.join("00000.mkv"));
        } else {
            cmd.args(["-f", "segment", "-segment_frames"])
                .arg(split_points.iter().join(","))
                .arg(dir.join("%05d.mkv"));
        }

        let output = cmd.output().context("Failed to run ffmpeg. Is ffmpeg installed?")?;
        ensure!(
            output.status.success(),
            "ffmpeg failed to split {source:?}: {}",
            String::from_utf8_lossy(&output.stderr)
        );

        let mut files = fs::read_dir(dir)?
            .map(|entry| entry.map(|e| e.path()))
            .collect::<Result<Vec<_>, _>>()?;
        files.retain(|file| file.extension().is_some_and(|ext| ext == "mkv"));
        files.sort();

        if files.len() != split_points.len() + 1 {
            warn!(
                "requested {} chunks but ffmpeg produced {}; split points that are not on a \
                 keyframe are merged into the previous chunk",
                split_points.len() + 1,
                files.len()
            );
        }

        Ok(files)
    }
}

/// Extracts the audio of the source into the session directory.
pub trait AudioExtractor: Sync {
    /// Returns the extracted file, or `None` if the source has no audio.
    fn extract(&self, input: &Path, temp: &Path) -> anyhow::Result<Option<PathBuf>>;
}

#[derive(Debug, Clone, Default)]
pub struct FfmpegAudio {
    pub audio_params: Vec<String>,
}

impl FfmpegAudio {
    pub const FILE_NAME: &'static str = "audio.mkv";
}

impl AudioExtractor for FfmpegAudio {
    #[tracing::instrument(level = "debug", skip(self))]
    #[inline]
    fn extract(&self, input: &Path, temp: &Path) -> anyhow::Result<Option<PathBuf>> {
        let audio_file = temp.join(Self::FILE_NAME);
        if audio_file.exists() {
            debug!("reusing extracted audio {audio_file:?}");
            return Ok(Some(audio_file));
        }

        let output = Command::new("ffmpeg")
            .args(["-y", "-hide_banner", "-loglevel", "error", "-nostdin", "-i"])
            .arg(input)
            .args(["-map_metadata", "-1", "-dn", "-vn", "-sn", "-map", "0:a?"])
            .args(&self.audio_params)
            .arg(&audio_file)
            .stdin(Stdio::null())
            .output()
            .context("Failed to run ffmpeg. Is ffmpeg installed?")?;
        ensure!(
            output.status.success(),
            "ffmpeg failed to extract audio: {}",
            String::from_utf8_lossy(&output.stderr)
        );

        // an input without audio produces an empty container or none at all
        let has_audio = fs::metadata(&audio_file).is_ok_and(|m| m.len() > 1000);
        if !has_audio {
            let _ = fs::remove_file(&audio_file);
            debug!("{input:?} has no audio");
            return Ok(None);
        }

        Ok(Some(audio_file))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_pipe_ends_in_y4m_on_stdout() {
        let cmd = compose_source_pipe(
            Path::new("split/00001.mkv"),
            &["-vf".to_owned(), "scale=1280:-2".to_owned()],
            "yuv420p10le",
        );
        let cmd: Vec<_> = cmd.iter().map(|arg| arg.to_string_lossy().into_owned()).collect();

        assert_eq!(cmd[0], "ffmpeg");
        assert!(cmd.windows(2).any(|w| w == ["-i", "split/00001.mkv"]));
        assert!(cmd.windows(2).any(|w| w == ["-vf", "scale=1280:-2"]));
        assert!(cmd.windows(2).any(|w| w == ["-pix_fmt", "yuv420p10le"]));
        assert_eq!(cmd[cmd.len() - 3..], ["-f", "yuv4mpegpipe", "-"]);
    }

    #[test]
    fn frame_count_is_read_from_last_progress_line() {
        let stderr = "frame=   12 fps=0.0 q=-1.0 size=N/A\rframe=  240 fps=0.0 q=-1.0 Lsize=N/A";
        let last = FFMPEG_FRAME.captures_iter(stderr).last().unwrap();
        assert_eq!(&last[1], "240");
    }
}
