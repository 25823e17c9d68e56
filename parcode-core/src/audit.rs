use tracing::{debug, warn};

use crate::{
    broker::CompletionSink,
    checkpoint::CheckpointStore,
    chunk::{ChunkJob, ChunkState},
    error::PipelineError,
    ffmpeg::FrameProber,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuditOutcome {
    Committed { frames: usize },
    Unresolved { reason: String },
}

/// Verifies finished chunks and commits them to the checkpoint.
pub struct Auditor<'a> {
    pub store:         &'a CheckpointStore,
    pub prober:        &'a dyn FrameProber,
    /// Commit the expected frame count without probing the output.
    pub trust_encoder: bool,
}

impl Auditor<'_> {
    /// Compares the frame count of the encoded output with the split source.
    /// A chunk is committed only when both are equal; anything else leaves
    /// it unresolved and does not stop the run.
    #[inline]
    pub fn audit(&self, job: &mut ChunkJob) -> AuditOutcome {
        let outcome = match self.verified_frames(job) {
            Ok(frames) => match self.store.commit(&job.id, frames) {
                Ok(true) => AuditOutcome::Committed {
                    frames,
                },
                Ok(false) => {
                    // an earlier commit of the same id wins
                    let frames = self.store.snapshot().done.get(&job.id).copied().unwrap_or(frames);
                    AuditOutcome::Committed {
                        frames,
                    }
                },
                Err(e) => AuditOutcome::Unresolved {
                    reason: e.to_string(),
                },
            },
            Err(reason) => AuditOutcome::Unresolved {
                reason,
            },
        };

        match &outcome {
            AuditOutcome::Committed {
                frames,
            } => {
                job.state = ChunkState::Committed;
                job.frames_completed = *frames;
            },
            AuditOutcome::Unresolved {
                reason,
            } => {
                warn!("chunk {id} failed verification: {reason}", id = job.id);
                job.state = ChunkState::Unresolved;
                job.frames_completed = 0;
            },
        }

        outcome
    }

    fn verified_frames(&self, job: &ChunkJob) -> Result<usize, String> {
        if self.trust_encoder {
            return Ok(job.frames_total);
        }

        let expected = self
            .prober
            .probe(&job.source_path)
            .map_err(|e| format!("could not count frames of {:?}: {e:#}", job.source_path))?;
        let actual = self
            .prober
            .probe(&job.output_path)
            .map_err(|e| format!("could not count frames of {:?}: {e:#}", job.output_path))?;
        debug!("chunk {id}: {actual}/{expected} frames", id = job.id);

        if actual == expected {
            Ok(actual)
        } else {
            Err(PipelineError::ProbeMismatch {
                chunk: job.id.clone(),
                expected,
                actual,
            }
            .to_string())
        }
    }
}

impl CompletionSink for Auditor<'_> {
    #[inline]
    fn complete(&self, job: &mut ChunkJob) -> AuditOutcome {
        self.audit(job)
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashMap, path::PathBuf};

    use super::*;
    use crate::chunk::tests::FakeProber;

    fn job(dir: &std::path::Path) -> ChunkJob {
        ChunkJob::new(
            0,
            PathBuf::from("split/00000.mkv"),
            &dir.join("encode"),
            "ivf",
            100,
            1000,
        )
    }

    #[test]
    fn matching_frame_counts_commit() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::init(dir.path(), 100).unwrap();
        let prober = FakeProber {
            frames: HashMap::from([("00000.mkv".to_owned(), 100), ("00000.ivf".to_owned(), 100)]),
        };
        let auditor = Auditor {
            store:         &store,
            prober:        &prober,
            trust_encoder: false,
        };
        let mut job = job(dir.path());

        assert_eq!(auditor.audit(&mut job), AuditOutcome::Committed {
            frames: 100
        });
        assert_eq!(job.state, ChunkState::Committed);
        assert!(store.is_done("00000"));
    }

    #[test]
    fn short_output_is_not_committed() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::init(dir.path(), 100).unwrap();
        let prober = FakeProber {
            frames: HashMap::from([("00000.mkv".to_owned(), 100), ("00000.ivf".to_owned(), 99)]),
        };
        let auditor = Auditor {
            store:         &store,
            prober:        &prober,
            trust_encoder: false,
        };
        let mut job = job(dir.path());

        let AuditOutcome::Unresolved {
            reason,
        } = auditor.audit(&mut job)
        else {
            panic!("expected an unresolved chunk");
        };
        assert!(reason.contains("99/100"));
        assert_eq!(job.state, ChunkState::Unresolved);
        assert!(!store.is_done("00000"));
        assert_eq!(store.committed_frames(), 0);
    }

    #[test]
    fn trusted_encoder_skips_probing() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::init(dir.path(), 100).unwrap();
        // neither file exists, so any probe would fail
        let auditor = Auditor {
            store:         &store,
            prober:        &FakeProber::default(),
            trust_encoder: true,
        };

        assert_eq!(auditor.audit(&mut job(dir.path())), AuditOutcome::Committed {
            frames: 100
        });
    }

    #[test]
    fn commit_over_total_is_unresolved() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::init(dir.path(), 50).unwrap();
        let auditor = Auditor {
            store:         &store,
            prober:        &FakeProber::default(),
            trust_encoder: true,
        };

        assert!(matches!(
            auditor.audit(&mut job(dir.path())),
            AuditOutcome::Unresolved { .. }
        ));
    }
}
