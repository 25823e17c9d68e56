use std::{
    fmt::{self, Debug, Display},
    process::ExitStatus,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Mutex,
        PoisonError,
    },
    thread,
};

use crossbeam_channel::{Receiver, Sender};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::{
    audit::AuditOutcome,
    chunk::{ChunkJob, ChunkState},
    error::PipelineError,
    progress::ProgressEvent,
};

#[derive(Clone)]
pub enum StringOrBytes {
    String(String),
    Bytes(Vec<u8>),
}

impl Debug for StringOrBytes {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String(s) => {
                if f.alternate() {
                    for line in s.lines() {
                        writeln!(f, "        {line}")?;
                    }
                } else {
                    f.write_str(s)?;
                }
            },
            Self::Bytes(b) => write!(f, "raw bytes: {b:?}")?,
        }

        Ok(())
    }
}

impl From<Vec<u8>> for StringOrBytes {
    #[inline]
    fn from(bytes: Vec<u8>) -> Self {
        match simdutf8::basic::from_utf8(&bytes) {
            Ok(res) => Self::String(res.to_owned()),
            Err(_) => Self::Bytes(bytes),
        }
    }
}

impl From<String> for StringOrBytes {
    #[inline]
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

/// An encoder pipeline that exited unsuccessfully or could not be started.
#[derive(Debug, Clone)]
pub struct EncoderCrash {
    pub exit_status:   Option<ExitStatus>,
    /// Set when the source pipe exited unsuccessfully.
    pub source_status: Option<ExitStatus>,
    pub source_stderr: StringOrBytes,
    pub stderr:        StringOrBytes,
    pub stdout:        StringOrBytes,
}

impl EncoderCrash {
    /// The exit status that made the attempt fail.
    #[inline]
    pub fn exit_summary(&self) -> String {
        match (self.exit_status, self.source_status) {
            (Some(status), _) if !status.success() => status.to_string(),
            (_, Some(status)) => format!("source pipe {status}"),
            (Some(status), None) => status.to_string(),
            (None, None) => "not started".to_owned(),
        }
    }
}

impl Display for EncoderCrash {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.exit_status, self.source_status) {
            (Some(status), _) if !status.success() => write!(f, "encoder crashed: {status}")?,
            (_, Some(status)) => write!(f, "source pipe crashed: {status}")?,
            (Some(status), None) => write!(f, "encoder exited with {status}")?,
            (None, None) => write!(f, "encoder could not be run")?,
        }
        write!(
            f,
            "\nstdout:\n{:#?}\nstderr:\n{:#?}\nsource pipe stderr:\n{:#?}",
            self.stdout, self.stderr, self.source_stderr
        )
    }
}

impl std::error::Error for EncoderCrash {}

/// Why one attempt at a chunk did not produce an output. `frames` is what
/// the attempt had reported to the progress aggregator.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("{crash}")]
    Crashed {
        crash:  Box<EncoderCrash>,
        frames: usize,
    },
    #[error("interrupted")]
    Interrupted { frames: usize },
}

impl RunError {
    #[inline]
    pub const fn frames(&self) -> usize {
        match self {
            Self::Crashed {
                frames, ..
            }
            | Self::Interrupted {
                frames,
            } => *frames,
        }
    }
}

/// Runs the external pipeline of one chunk.
pub trait ChunkRunner: Sync {
    /// Encodes `job`, sending frame deltas to `progress`, and returns the
    /// number of frames reported. Must stop soon after `cancel` is set.
    fn run(
        &self,
        job: &ChunkJob,
        progress: &Sender<ProgressEvent>,
        cancel: &AtomicBool,
    ) -> Result<usize, RunError>;
}

/// Receives every chunk whose pipeline finished successfully, in completion
/// order.
pub trait CompletionSink: Sync {
    fn complete(&self, job: &mut ChunkJob) -> AuditOutcome;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobResult {
    pub id:       String,
    pub index:    usize,
    pub state:    ChunkState,
    pub frames:   usize,
    pub attempts: usize,
    /// Set for unresolved chunks.
    pub reason:   Option<String>,
}

/// Bounded worker pool dispatching chunks in queue order.
pub struct Broker<'a> {
    pub runner:       &'a dyn ChunkRunner,
    pub sink:         &'a dyn CompletionSink,
    pub max_tries:    usize,
    pub max_failures: Option<usize>,
    pub cancel:       &'a AtomicBool,
}

struct Shared {
    queue:    Receiver<ChunkJob>,
    results:  Mutex<Vec<JobResult>>,
    failures: AtomicUsize,
    halted:   AtomicBool,
}

enum ChunkFailure {
    Exhausted(String),
    Interrupted,
}

impl Broker<'_> {
    /// Runs `jobs` on at most `worker_count` workers. Each worker takes the
    /// next job from the front of the queue as soon as it is free, so the
    /// queue order is the dispatch order.
    ///
    /// Failed chunks are retried up to `max_tries` times and then left
    /// unresolved without affecting other chunks.
    #[tracing::instrument(level = "debug", skip(self, jobs, progress), fields(jobs = jobs.len()))]
    #[inline]
    pub fn run(
        &self,
        jobs: Vec<ChunkJob>,
        worker_count: usize,
        progress: &Sender<ProgressEvent>,
    ) -> Result<Vec<JobResult>, PipelineError> {
        if self.max_tries == 0 {
            return Err(PipelineError::Configuration("max tries must be at least 1".into()));
        }
        if jobs.is_empty() {
            return Ok(Vec::new());
        }

        let attempted = jobs.len();
        let workers = worker_count.clamp(1, attempted);
        let (queue_tx, queue_rx) = crossbeam_channel::bounded(attempted);
        for job in jobs {
            // cannot fail, the receiver is alive and there is room for every job
            let _ = queue_tx.send(job);
        }
        drop(queue_tx);
        let shared = Shared {
            queue:    queue_rx,
            results:  Mutex::new(Vec::with_capacity(attempted)),
            failures: AtomicUsize::new(0),
            halted:   AtomicBool::new(false),
        };
        debug!("starting {workers} workers for {attempted} chunks");

        thread::scope(|s| {
            for worker_id in 0..workers {
                let shared = &shared;
                s.spawn(move || self.worker_loop(worker_id, shared, progress));
            }
        });

        let results = shared.results.into_inner().unwrap_or_else(PoisonError::into_inner);

        if shared.halted.load(Ordering::SeqCst) {
            return Err(PipelineError::FailureThresholdExceeded {
                failures:  shared.failures.load(Ordering::SeqCst),
                threshold: self.max_failures.unwrap_or_default(),
            });
        }
        if self.cancel.load(Ordering::SeqCst) {
            return Err(PipelineError::Interrupted);
        }
        if !results.iter().any(|result| result.state == ChunkState::Committed) {
            return Err(PipelineError::NoChunkCommitted {
                attempted,
            });
        }

        Ok(results)
    }

    fn worker_loop(&self, worker_id: usize, shared: &Shared, progress: &Sender<ProgressEvent>) {
        loop {
            if self.cancel.load(Ordering::SeqCst) || shared.halted.load(Ordering::SeqCst) {
                break;
            }
            let Ok(mut job) = shared.queue.recv() else {
                break;
            };

            job.state = ChunkState::Running;
            debug!("worker {worker_id} dispatched chunk {id}", id = job.id);

            let (outcome, attempts) = self.run_with_retries(&job, shared, progress);
            let result = match outcome {
                Ok(reported) => {
                    let audit = self.sink.complete(&mut job);
                    match audit {
                        AuditOutcome::Committed {
                            frames,
                        } => {
                            // bring the display in line with what was committed
                            if frames > reported {
                                let _ = progress.send(ProgressEvent::Advance(frames - reported));
                            } else if reported > frames {
                                let _ = progress.send(ProgressEvent::Retract(reported - frames));
                            }
                            job.state = ChunkState::Committed;
                            job.frames_completed = frames;
                            info!("chunk {id} done ({frames} frames)", id = job.id);
                            None
                        },
                        AuditOutcome::Unresolved {
                            reason,
                        } => {
                            let _ = progress.send(ProgressEvent::Retract(reported));
                            job.state = ChunkState::Unresolved;
                            Some(reason)
                        },
                    }
                },
                Err(ChunkFailure::Exhausted(reason)) => {
                    job.state = ChunkState::Unresolved;
                    Some(reason)
                },
                Err(ChunkFailure::Interrupted) => {
                    debug!("chunk {id} interrupted", id = job.id);
                    job.state = ChunkState::Pending;
                    None
                },
            };

            if let Some(reason) = &result {
                warn!("chunk {id} unresolved: {reason}", id = job.id);
            }

            shared.results.lock().unwrap_or_else(PoisonError::into_inner).push(JobResult {
                id: job.id,
                index: job.index,
                state: job.state,
                frames: job.frames_completed,
                attempts,
                reason: result,
            });
        }
    }

    fn run_with_retries(
        &self,
        job: &ChunkJob,
        shared: &Shared,
        progress: &Sender<ProgressEvent>,
    ) -> (Result<usize, ChunkFailure>, usize) {
        let mut last_error = String::new();
        for attempt in 1..=self.max_tries {
            if self.cancel.load(Ordering::SeqCst) {
                return (Err(ChunkFailure::Interrupted), attempt - 1);
            }

            match self.runner.run(job, progress, self.cancel) {
                Ok(reported) => return (Ok(reported), attempt),
                Err(err) => {
                    if err.frames() > 0 {
                        let _ = progress.send(ProgressEvent::Retract(err.frames()));
                    }
                    if let RunError::Interrupted {
                        ..
                    } = err
                    {
                        return (Err(ChunkFailure::Interrupted), attempt);
                    }

                    let failures = shared.failures.fetch_add(1, Ordering::SeqCst) + 1;
                    error!(
                        "[chunk {id}] encoder failed on attempt {attempt}/{max}:\n{err}",
                        id = job.id,
                        max = self.max_tries
                    );
                    last_error = format!("encoder failed {attempt} time(s), last exit: {}", {
                        match &err {
                            RunError::Crashed {
                                crash, ..
                            } => crash.exit_summary(),
                            RunError::Interrupted {
                                ..
                            } => "interrupted".to_owned(),
                        }
                    });

                    if self.max_failures.is_some_and(|max| failures > max) {
                        error!("too many encoder failures ({failures}), stopping");
                        shared.halted.store(true, Ordering::SeqCst);
                        return (Err(ChunkFailure::Exhausted(last_error)), attempt);
                    }
                },
            }
        }

        (Err(ChunkFailure::Exhausted(last_error)), self.max_tries)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::HashSet;

    use super::*;

    /// Reports `frames_total` in two steps unless the chunk id is listed as
    /// failing.
    #[derive(Default)]
    pub struct FakeRunner {
        pub fail:       HashSet<String>,
        /// Fails only the first attempt of these.
        pub fail_once:  Mutex<HashSet<String>>,
        pub dispatched: Mutex<Vec<String>>,
    }

    impl FakeRunner {
        pub fn failing(ids: &[&str]) -> Self {
            Self {
                fail: ids.iter().map(|id| (*id).to_owned()).collect(),
                ..Self::default()
            }
        }

        fn crash(frames: usize) -> RunError {
            RunError::Crashed {
                crash: Box::new(EncoderCrash {
                    exit_status:   None,
                    source_status: None,
                    source_stderr: String::new().into(),
                    stderr:        "boom".to_owned().into(),
                    stdout:        String::new().into(),
                }),
                frames,
            }
        }
    }

    impl ChunkRunner for FakeRunner {
        fn run(
            &self,
            job: &ChunkJob,
            progress: &Sender<ProgressEvent>,
            _cancel: &AtomicBool,
        ) -> Result<usize, RunError> {
            self.dispatched.lock().unwrap().push(job.id.clone());
            let half = job.frames_total / 2;
            progress.send(ProgressEvent::Advance(half)).unwrap();
            if self.fail.contains(&job.id) || self.fail_once.lock().unwrap().remove(&job.id) {
                return Err(Self::crash(half));
            }
            progress.send(ProgressEvent::Advance(job.frames_total - half)).unwrap();
            Ok(job.frames_total)
        }
    }

    /// Commits every chunk with its full frame count.
    pub struct AcceptAll;

    impl CompletionSink for AcceptAll {
        fn complete(&self, job: &mut ChunkJob) -> AuditOutcome {
            AuditOutcome::Committed {
                frames: job.frames_total,
            }
        }
    }

    fn jobs(sizes: &[u64]) -> Vec<ChunkJob> {
        let mut jobs: Vec<_> = sizes
            .iter()
            .enumerate()
            .map(|(i, size)| {
                ChunkJob::new(i, format!("{i:05}.mkv").into(), "encode".as_ref(), "ivf", 10, *size)
            })
            .collect();
        crate::chunk::order_largest_first(&mut jobs);
        jobs
    }

    fn drain(rx: &crossbeam_channel::Receiver<ProgressEvent>) -> i64 {
        rx.try_iter()
            .map(|event| match event {
                ProgressEvent::Advance(n) => n as i64,
                ProgressEvent::Retract(n) => -(n as i64),
            })
            .sum()
    }

    #[test]
    fn largest_chunk_is_dispatched_first() {
        let runner = FakeRunner::default();
        let cancel = AtomicBool::new(false);
        let broker = Broker {
            runner:       &runner,
            sink:         &AcceptAll,
            max_tries:    1,
            max_failures: None,
            cancel:       &cancel,
        };
        let (tx, _rx) = crossbeam_channel::unbounded();

        let results = broker.run(jobs(&[1, 1, 1, 1, 1, 1, 10, 1, 1, 1]), 2, &tx).unwrap();

        assert_eq!(runner.dispatched.lock().unwrap()[0], "00006");
        assert_eq!(results.len(), 10);
        assert!(results.iter().all(|r| r.state == ChunkState::Committed));
    }

    #[test]
    fn failing_chunk_is_isolated_and_retried() {
        let runner = FakeRunner::failing(&["00001"]);
        runner.fail_once.lock().unwrap().insert("00002".to_owned());
        let cancel = AtomicBool::new(false);
        let broker = Broker {
            runner:       &runner,
            sink:         &AcceptAll,
            max_tries:    3,
            max_failures: None,
            cancel:       &cancel,
        };
        let (tx, rx) = crossbeam_channel::unbounded();

        let results = broker.run(jobs(&[3, 2, 1]), 3, &tx).unwrap();
        let by_id = |id: &str| results.iter().find(|r| r.id == id).unwrap().clone();

        assert_eq!(by_id("00000").state, ChunkState::Committed);
        assert_eq!(by_id("00001").state, ChunkState::Unresolved);
        assert_eq!(by_id("00001").attempts, 3);
        assert!(by_id("00001").reason.is_some());
        assert_eq!(by_id("00002").state, ChunkState::Committed);
        assert_eq!(by_id("00002").attempts, 2);
        // failed attempts are retracted, so only the committed frames remain
        assert_eq!(drain(&rx), 20);
    }

    #[test]
    fn all_failing_is_fatal() {
        let runner = FakeRunner::failing(&["00000", "00001"]);
        let cancel = AtomicBool::new(false);
        let broker = Broker {
            runner:       &runner,
            sink:         &AcceptAll,
            max_tries:    2,
            max_failures: None,
            cancel:       &cancel,
        };
        let (tx, _rx) = crossbeam_channel::unbounded();

        assert!(matches!(
            broker.run(jobs(&[5, 4]), 2, &tx),
            Err(PipelineError::NoChunkCommitted {
                attempted: 2
            })
        ));
    }

    #[test]
    fn failure_threshold_stops_the_run() {
        let runner = FakeRunner::failing(&["00000", "00001", "00002", "00003"]);
        let cancel = AtomicBool::new(false);
        let broker = Broker {
            runner:       &runner,
            sink:         &AcceptAll,
            max_tries:    1,
            max_failures: Some(1),
            cancel:       &cancel,
        };
        let (tx, _rx) = crossbeam_channel::unbounded();

        assert!(matches!(
            broker.run(jobs(&[4, 3, 2, 1, 0]), 1, &tx),
            Err(PipelineError::FailureThresholdExceeded { .. })
        ));
        // one worker: the second failure trips the threshold, nothing after
        // it is dispatched
        assert_eq!(runner.dispatched.lock().unwrap().len(), 2);
    }

    #[test]
    fn cancelled_run_dispatches_nothing() {
        let runner = FakeRunner::default();
        let cancel = AtomicBool::new(true);
        let broker = Broker {
            runner:       &runner,
            sink:         &AcceptAll,
            max_tries:    1,
            max_failures: None,
            cancel:       &cancel,
        };
        let (tx, _rx) = crossbeam_channel::unbounded();

        assert!(matches!(
            broker.run(jobs(&[1, 1]), 2, &tx),
            Err(PipelineError::Interrupted)
        ));
        assert!(runner.dispatched.lock().unwrap().is_empty());
    }
}
