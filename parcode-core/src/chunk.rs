use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{ensure, Context};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    checkpoint::CheckpointStore,
    encoder::EncodeStages,
    ffmpeg::FrameProber,
    split::Segmenter,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ChunkState {
    #[default]
    Pending,
    Running,
    Committed,
    Unresolved,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkJob {
    pub id:               String,
    pub index:            usize,
    pub source_path:      PathBuf,
    pub output_path:      PathBuf,
    /// Composed right before scheduling, never persisted.
    #[serde(skip)]
    pub encode_stages:    EncodeStages,
    #[serde(skip)]
    pub state:            ChunkState,
    pub frames_total:     usize,
    #[serde(skip)]
    pub frames_completed: usize,
    /// Size of the split file in bytes, used to order the queue.
    pub size:             u64,
    /// Quantizer picked by target quality, kept so a resumed run does not
    /// probe again.
    #[serde(default)]
    pub quality_param:    Option<u32>,
}

impl ChunkJob {
    #[inline]
    pub fn new(
        index: usize,
        source_path: PathBuf,
        encode_dir: &Path,
        extension: &str,
        frames: usize,
        size: u64,
    ) -> Self {
        let id = Self::name(index);
        Self {
            output_path: encode_dir.join(format!("{id}.{extension}")),
            id,
            index,
            source_path,
            encode_stages: EncodeStages::default(),
            state: ChunkState::Pending,
            frames_total: frames,
            frames_completed: 0,
            size,
            quality_param: None,
        }
    }

    /// Stable id of the chunk at `index`.
    #[inline]
    pub fn name(index: usize) -> String {
        format!("{index:05}")
    }

    #[inline]
    pub fn passes(&self) -> usize {
        self.encode_stages.passes.len()
    }
}

/// Turns split points into the ordered chunk queue.
pub struct ChunkSetBuilder<'a> {
    pub segmenter:  &'a dyn Segmenter,
    pub prober:     &'a dyn FrameProber,
    /// Where the split source files are written.
    pub split_dir:  PathBuf,
    pub encode_dir: PathBuf,
    pub extension:  &'a str,
}

impl ChunkSetBuilder<'_> {
    /// Splits `source` at `split_points` and returns one job per piece,
    /// largest file first.
    #[tracing::instrument(level = "debug", skip(self))]
    #[inline]
    pub fn build(&self, split_points: &[usize], source: &Path) -> anyhow::Result<Vec<ChunkJob>> {
        let files = self
            .segmenter
            .segment(source, split_points, &self.split_dir)
            .with_context(|| format!("Failed to split {source:?}"))?;
        ensure!(!files.is_empty(), "splitting {source:?} produced no chunks");

        let mut jobs = files
            .into_iter()
            .enumerate()
            .map(|(index, file)| -> anyhow::Result<ChunkJob> {
                let size = fs::metadata(&file)
                    .with_context(|| format!("Failed to read metadata of chunk {file:?}"))?
                    .len();
                let frames = self
                    .prober
                    .probe(&file)
                    .with_context(|| format!("Failed to count frames of chunk {file:?}"))?;
                Ok(ChunkJob::new(
                    index,
                    file,
                    &self.encode_dir,
                    self.extension,
                    frames,
                    size,
                ))
            })
            .collect::<anyhow::Result<Vec<_>>>()?;

        order_largest_first(&mut jobs);
        debug!("built {} chunks", jobs.len());

        Ok(jobs)
    }
}

/// Orders by descending file size, ties by index so the order is the same
/// every time for the same split.
#[inline]
pub fn order_largest_first(jobs: &mut [ChunkJob]) {
    jobs.sort_by(|a, b| b.size.cmp(&a.size).then(a.index.cmp(&b.index)));
}

/// The chunks of `queue` not yet committed in `checkpoint`.
#[inline]
pub fn pending(queue: &[ChunkJob], checkpoint: &CheckpointStore) -> Vec<ChunkJob> {
    queue.iter().filter(|job| !checkpoint.is_done(&job.id)).cloned().collect()
}

#[inline]
pub fn save_chunk_queue(temp: &Path, chunks: &[ChunkJob]) -> anyhow::Result<()> {
    let mut buffer = vec![];
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut serializer = serde_json::Serializer::with_formatter(&mut buffer, formatter);
    chunks.serialize(&mut serializer)?;
    fs::write(temp.join("chunks.json"), buffer)
        .with_context(|| format!("Failed to write chunks.json in {temp:?}"))
}

#[inline]
pub fn read_chunk_queue(temp: &Path) -> anyhow::Result<Vec<ChunkJob>> {
    let file = temp.join("chunks.json");
    let contents =
        fs::read_to_string(&file).with_context(|| format!("Failed to read chunk queue {file:?}"))?;
    serde_json::from_str(&contents).with_context(|| format!("Failed to parse chunk queue {file:?}"))
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::HashMap;

    use super::*;

    /// Writes one file per size, ignoring the source.
    pub struct FakeSegmenter {
        pub sizes: Vec<usize>,
    }

    impl Segmenter for FakeSegmenter {
        fn segment(
            &self,
            _source: &Path,
            _split_points: &[usize],
            dir: &Path,
        ) -> anyhow::Result<Vec<PathBuf>> {
            fs::create_dir_all(dir)?;
            self.sizes
                .iter()
                .enumerate()
                .map(|(i, size)| -> anyhow::Result<PathBuf> {
                    let path = dir.join(format!("{i:05}.mkv"));
                    fs::write(&path, vec![0_u8; *size])?;
                    Ok(path)
                })
                .collect()
        }
    }

    /// Frame counts by file name; unknown files have as many frames as bytes.
    #[derive(Default)]
    pub struct FakeProber {
        pub frames: HashMap<String, usize>,
    }

    impl FrameProber for FakeProber {
        fn probe(&self, path: &Path) -> anyhow::Result<usize> {
            let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
            match self.frames.get(name) {
                Some(frames) => Ok(*frames),
                None => Ok(fs::metadata(path)?.len() as usize),
            }
        }
    }

    #[test]
    fn largest_chunk_comes_first() {
        let dir = tempfile::tempdir().unwrap();
        let builder = ChunkSetBuilder {
            segmenter:  &FakeSegmenter {
                sizes: vec![1, 1, 1, 1, 10, 1, 1, 1, 1, 1],
            },
            prober:     &FakeProber::default(),
            split_dir:  dir.path().join("split"),
            encode_dir: dir.path().join("encode"),
            extension:  "ivf",
        };
        let jobs = builder.build(&[], Path::new("source.mkv")).unwrap();

        assert_eq!(jobs.len(), 10);
        assert_eq!(jobs[0].id, "00004");
        assert_eq!(jobs[0].frames_total, 10);
        assert_eq!(jobs[0].output_path, dir.path().join("encode").join("00004.ivf"));
        let rest: Vec<_> = jobs[1..].iter().map(|job| job.index).collect();
        assert_eq!(rest, [0, 1, 2, 3, 5, 6, 7, 8, 9]);
    }

    #[test]
    fn done_chunks_are_not_pending() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::init(dir.path(), 100).unwrap();
        store.commit("00001", 10).unwrap();

        let queue: Vec<_> = (0..3)
            .map(|i| ChunkJob::new(i, PathBuf::from("x.mkv"), dir.path(), "ivf", 10, 10))
            .collect();
        let ids: Vec<_> = pending(&queue, &store).into_iter().map(|job| job.id).collect();
        assert_eq!(ids, ["00000", "00002"]);
    }

    #[test]
    fn queue_survives_a_round_trip_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let mut job = ChunkJob::new(7, PathBuf::from("split/00007.mkv"), dir.path(), "ivf", 48, 900);
        job.quality_param = Some(31);
        job.state = ChunkState::Committed;

        save_chunk_queue(dir.path(), std::slice::from_ref(&job)).unwrap();
        let read = read_chunk_queue(dir.path()).unwrap();

        assert_eq!(read[0].quality_param, Some(31));
        assert_eq!(read[0].state, ChunkState::Pending);
        assert_eq!(read[0].output_path, job.output_path);
    }
}
