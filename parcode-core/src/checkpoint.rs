use std::{
    collections::BTreeMap,
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
    sync::{Mutex, MutexGuard, PoisonError},
};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::PipelineError;

/// Record of every chunk verified complete, keyed by chunk id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub total_frames: usize,
    pub done:         BTreeMap<String, usize>,
    #[serde(default)]
    pub audio_done:   bool,
}

impl CheckpointRecord {
    #[inline]
    pub fn committed_frames(&self) -> usize {
        self.done.values().sum()
    }
}

/// Durable, append-only store of committed chunks.
///
/// Every mutation rewrites the whole record to a temporary file and renames
/// it over `done.json`, so the file on disk is always a complete record.
#[derive(Debug)]
pub struct CheckpointStore {
    path:   PathBuf,
    record: Mutex<CheckpointRecord>,
}

impl CheckpointStore {
    pub const FILE_NAME: &'static str = "done.json";

    /// Reads the checkpoint of the session in `dir`.
    ///
    /// Returns `Ok(None)` when there is no checkpoint, and an error when one
    /// exists but cannot be read or parsed.
    #[inline]
    pub fn load(dir: &Path) -> Result<Option<Self>, PipelineError> {
        let path = dir.join(Self::FILE_NAME);
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(PipelineError::persistence(path, e)),
        };
        let record: CheckpointRecord = serde_json::from_str(&contents)
            .map_err(|e| PipelineError::persistence(&path, e))?;

        let committed = record.committed_frames();
        if committed > record.total_frames {
            return Err(PipelineError::persistence(
                path,
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!(
                        "{committed} committed frames exceed the session total of {total}",
                        total = record.total_frames
                    ),
                ),
            ));
        }

        debug!(
            "loaded checkpoint with {chunks} chunks ({committed}/{total} frames) done",
            chunks = record.done.len(),
            total = record.total_frames
        );

        Ok(Some(Self {
            path,
            record: Mutex::new(record),
        }))
    }

    /// Starts a fresh checkpoint for a session of `total_frames`, replacing
    /// any existing one.
    #[inline]
    pub fn init(dir: &Path, total_frames: usize) -> Result<Self, PipelineError> {
        let record = CheckpointRecord {
            total_frames,
            ..CheckpointRecord::default()
        };
        let path = dir.join(Self::FILE_NAME);
        save_record(&path, &record)?;

        Ok(Self {
            path,
            record: Mutex::new(record),
        })
    }

    /// Records `id` as done with `frames` frames.
    ///
    /// Returns `false` without touching anything if `id` is already done; the
    /// first committed value always wins.
    #[inline]
    pub fn commit(&self, id: &str, frames: usize) -> Result<bool, PipelineError> {
        let mut record = self.lock();
        if record.done.contains_key(id) {
            debug!("chunk {id} already committed, ignoring repeated commit");
            return Ok(false);
        }

        let committed = record.committed_frames();
        if committed + frames > record.total_frames {
            return Err(PipelineError::FrameTotalExceeded {
                chunk: id.to_owned(),
                frames,
                committed,
                total: record.total_frames,
            });
        }

        record.done.insert(id.to_owned(), frames);
        if let Err(e) = save_record(&self.path, &record) {
            record.done.remove(id);
            return Err(e);
        }

        Ok(true)
    }

    #[inline]
    pub fn is_done(&self, id: &str) -> bool {
        self.lock().done.contains_key(id)
    }

    #[inline]
    pub fn committed_frames(&self) -> usize {
        self.lock().committed_frames()
    }

    #[inline]
    pub fn total_frames(&self) -> usize {
        self.lock().total_frames
    }

    #[inline]
    pub fn audio_done(&self) -> bool {
        self.lock().audio_done
    }

    #[inline]
    pub fn mark_audio_done(&self) -> Result<(), PipelineError> {
        let mut record = self.lock();
        if record.audio_done {
            return Ok(());
        }
        record.audio_done = true;
        if let Err(e) = save_record(&self.path, &record) {
            record.audio_done = false;
            return Err(e);
        }
        Ok(())
    }

    #[inline]
    pub fn snapshot(&self) -> CheckpointRecord {
        self.lock().clone()
    }

    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> MutexGuard<'_, CheckpointRecord> {
        self.record.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn save_record(path: &Path, record: &CheckpointRecord) -> Result<(), PipelineError> {
    let mut buffer = Vec::with_capacity(256);
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut serializer = serde_json::Serializer::with_formatter(&mut buffer, formatter);
    record.serialize(&mut serializer).map_err(|e| PipelineError::persistence(path, e))?;

    let temp_path = path.with_extension("json.tmp");
    let write = || -> io::Result<()> {
        let mut file = fs::File::create(&temp_path)?;
        file.write_all(&buffer)?;
        file.sync_all()?;
        fs::rename(&temp_path, path)
    };
    write().map_err(|e| PipelineError::persistence(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_without_checkpoint_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(CheckpointStore::load(dir.path()).unwrap().is_none());
    }

    #[test]
    fn commit_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::init(dir.path(), 500).unwrap();

        assert!(store.commit("00003", 120).unwrap());
        assert!(!store.commit("00003", 80).unwrap());
        assert!(store.is_done("00003"));
        assert!(!store.is_done("00004"));
        assert_eq!(store.committed_frames(), 120);

        let reloaded = CheckpointStore::load(dir.path()).unwrap().unwrap();
        assert_eq!(reloaded.snapshot().done.get("00003"), Some(&120));
    }

    #[test]
    fn commit_cannot_exceed_total() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::init(dir.path(), 100).unwrap();
        store.commit("00000", 60).unwrap();

        assert!(matches!(
            store.commit("00001", 41),
            Err(PipelineError::FrameTotalExceeded { .. })
        ));
        assert!(!store.is_done("00001"));
        assert!(store.commit("00001", 40).unwrap());
    }

    #[test]
    fn file_is_replaced_whole() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::init(dir.path(), 300).unwrap();
        for (i, frames) in [100, 50, 150].into_iter().enumerate() {
            store.commit(&format!("{i:05}"), frames).unwrap();
        }
        store.mark_audio_done().unwrap();

        let on_disk: CheckpointRecord =
            serde_json::from_str(&fs::read_to_string(store.path()).unwrap()).unwrap();
        assert_eq!(on_disk, store.snapshot());
        assert!(on_disk.audio_done);
        assert!(!dir.path().join("done.json.tmp").exists());
    }

    #[test]
    fn corrupt_checkpoint_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(CheckpointStore::FILE_NAME), b"{\"total_frames\": 10, \"do").unwrap();

        assert!(matches!(
            CheckpointStore::load(dir.path()),
            Err(PipelineError::Persistence { .. })
        ));
    }

    #[test]
    fn overcommitted_checkpoint_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join(CheckpointStore::FILE_NAME),
            r#"{"total_frames": 10, "done": {"00000": 11}}"#,
        )
        .unwrap();

        assert!(matches!(
            CheckpointStore::load(dir.path()),
            Err(PipelineError::Persistence { .. })
        ));
    }
}
