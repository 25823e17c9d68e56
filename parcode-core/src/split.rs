use std::{
    fs,
    path::{Path, PathBuf},
    process::{Command, Stdio},
};

use anyhow::{bail, ensure, Context};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Produces the frame offsets a source is cut at.
pub trait Splitter: Sync {
    /// Ordered frame offsets where a new chunk starts. Offset 0 is implied.
    fn split(&self, source: &Path, total_frames: usize) -> anyhow::Result<Vec<usize>>;
}

/// Materializes one file per split interval.
pub trait Segmenter: Sync {
    /// Writes the pieces of `source` into `dir` and returns them in source
    /// order.
    fn segment(
        &self,
        source: &Path,
        split_points: &[usize],
        dir: &Path,
    ) -> anyhow::Result<Vec<PathBuf>>;
}

/// Split points as stored in `scenes.json`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScenesRecord {
    pub frames:       usize,
    pub split_points: Vec<usize>,
}

pub struct NoSplit;

impl Splitter for NoSplit {
    #[inline]
    fn split(&self, _source: &Path, _total_frames: usize) -> anyhow::Result<Vec<usize>> {
        Ok(Vec::new())
    }
}

pub struct FixedInterval {
    pub interval: usize,
}

impl Splitter for FixedInterval {
    #[inline]
    fn split(&self, _source: &Path, total_frames: usize) -> anyhow::Result<Vec<usize>> {
        ensure!(self.interval > 0, "split interval must be greater than 0");
        Ok((self.interval..total_frames).step_by(self.interval).collect())
    }
}

/// Split points read from a scenes JSON file written by an earlier run or by
/// an external scene detector.
pub struct ScenesFile {
    pub path: PathBuf,
}

impl Splitter for ScenesFile {
    #[inline]
    fn split(&self, _source: &Path, total_frames: usize) -> anyhow::Result<Vec<usize>> {
        let scenes = read_scenes(&self.path)?;
        if scenes.frames != 0 && scenes.frames != total_frames {
            bail!(
                "scenes file {:?} describes {} frames but the source has {total_frames}",
                self.path,
                scenes.frames
            );
        }
        Ok(scenes.split_points)
    }
}

/// Runs an external scene detector with the source path appended and reads
/// whitespace or comma separated frame offsets from its stdout.
pub struct SplitCommand {
    pub command: Vec<String>,
}

impl Splitter for SplitCommand {
    #[inline]
    fn split(&self, source: &Path, _total_frames: usize) -> anyhow::Result<Vec<usize>> {
        let [program, args @ ..] = self.command.as_slice() else {
            bail!("split command is empty");
        };
        let output = Command::new(program)
            .args(args)
            .arg(source)
            .stdin(Stdio::null())
            .output()
            .with_context(|| format!("Failed to run split command {program:?}"))?;
        ensure!(
            output.status.success(),
            "split command {program:?} exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr)
        );

        let stdout = simdutf8::basic::from_utf8(&output.stdout)
            .map_err(|_| anyhow::anyhow!("split command {program:?} printed invalid UTF-8"))?;
        stdout
            .split(|c: char| c.is_whitespace() || c == ',')
            .filter(|s| !s.is_empty())
            .map(|s| {
                s.parse::<usize>()
                    .with_context(|| format!("split command printed a non-integer offset {s:?}"))
            })
            .collect()
    }
}

/// Sorts and deduplicates split points, dropping any outside `(0, total)`.
#[inline]
pub fn normalize(mut split_points: Vec<usize>, total_frames: usize) -> Vec<usize> {
    split_points.retain(|&frame| frame > 0 && frame < total_frames);
    split_points.sort_unstable();
    split_points.dedup();
    split_points
}

/// Adds split points so no chunk is longer than `max_len` frames. Long
/// scenes are cut into equal parts.
#[inline]
pub fn extra_splits(split_points: &[usize], total_frames: usize, max_len: usize) -> Vec<usize> {
    if max_len == 0 {
        return split_points.to_vec();
    }

    let mut result = Vec::with_capacity(split_points.len());
    let bounds = std::iter::once(0).chain(split_points.iter().copied());
    let ends = split_points.iter().copied().chain(std::iter::once(total_frames));
    for (start, end) in bounds.zip(ends) {
        if start != 0 {
            result.push(start);
        }
        let len = end.saturating_sub(start);
        if len > max_len {
            let parts = len.div_ceil(max_len);
            result.extend((1..parts).map(|i| start + len * i / parts));
        }
    }

    let added = result.len().saturating_sub(split_points.len());
    if added > 0 {
        info!("added {added} extra split points");
    }
    result
}

#[inline]
pub fn read_scenes(path: &Path) -> anyhow::Result<ScenesRecord> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("Failed to read scenes file {path:?}"))?;
    serde_json::from_str(&contents).with_context(|| format!("Failed to parse scenes file {path:?}"))
}

#[inline]
pub fn write_scenes(path: &Path, scenes: &ScenesRecord) -> anyhow::Result<()> {
    let mut buffer = vec![];
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut serializer = serde_json::Serializer::with_formatter(&mut buffer, formatter);
    scenes.serialize(&mut serializer)?;
    fs::write(path, buffer).with_context(|| format!("Failed to write scenes file {path:?}"))?;
    debug!("saved {} split points to {path:?}", scenes.split_points.len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interval_splits() {
        let points = FixedInterval {
            interval: 100,
        }
        .split(Path::new("in.mkv"), 350)
        .unwrap();
        assert_eq!(points, [100, 200, 300]);
    }

    #[test]
    fn normalize_drops_out_of_range_and_duplicates() {
        assert_eq!(normalize(vec![50, 0, 10, 50, 200, 120], 120), [10, 50]);
    }

    #[test]
    fn long_scenes_are_subdivided() {
        assert_eq!(extra_splits(&[100], 130, 40), [33, 66, 100]);
        assert_eq!(extra_splits(&[], 90, 30), [30, 60]);
        assert_eq!(extra_splits(&[10, 20], 30, 40), [10, 20]);
    }

    #[test]
    fn scenes_file_must_match_source() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scenes.json");
        write_scenes(
            &path,
            &ScenesRecord {
                frames:       240,
                split_points: vec![48, 120],
            },
        )
        .unwrap();

        let splitter = ScenesFile {
            path,
        };
        assert_eq!(splitter.split(Path::new("in.mkv"), 240).unwrap(), [48, 120]);
        assert!(splitter.split(Path::new("in.mkv"), 241).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn split_command_output_is_parsed() {
        let splitter = SplitCommand {
            command: vec!["sh".to_owned(), "-c".to_owned(), "printf '24, 48\\n96\\n'".to_owned()],
        };
        assert_eq!(splitter.split(Path::new("in.mkv"), 120).unwrap(), [24, 48, 96]);
    }
}
