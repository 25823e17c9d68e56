use std::{
    ffi::OsString,
    io::{BufRead, BufReader, Read},
    process::{Child, Command, ExitStatus, Stdio},
    sync::atomic::{AtomicBool, Ordering},
    thread,
    time::Duration,
};

use crossbeam_channel::Sender;
use tracing::{debug, trace};

use crate::{
    broker::{ChunkRunner, EncoderCrash, RunError, StringOrBytes},
    chunk::ChunkJob,
    encoder::PassCommand,
    parse::{ProgressParser, ProgressPattern},
    progress::ProgressEvent,
};

/// Runs each pass of a chunk as two piped processes, the source pipe feeding
/// the encoder's stdin.
#[derive(Debug, Clone, Copy)]
pub struct ProcessRunner {
    /// How often a running encoder is checked for exit and cancellation.
    pub poll_interval: Duration,
}

impl Default for ProcessRunner {
    #[inline]
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(50),
        }
    }
}

struct PassOutput {
    status:        Option<ExitStatus>,
    source_status: Option<ExitStatus>,
    frames:        usize,
    source_stderr: Vec<u8>,
    stdout:        Vec<u8>,
    stderr:        Vec<u8>,
}

impl ChunkRunner for ProcessRunner {
    #[tracing::instrument(level = "debug", skip_all, fields(chunk = %job.id))]
    #[inline]
    fn run(
        &self,
        job: &ChunkJob,
        progress: &Sender<ProgressEvent>,
        cancel: &AtomicBool,
    ) -> Result<usize, RunError> {
        let stages = &job.encode_stages;
        let passes = stages.passes.len();
        if passes == 0 {
            return Err(not_started("no encoder commands were composed", 0));
        }

        let mut reported = 0;
        for (i, pass) in stages.passes.iter().enumerate() {
            let last = i + 1 == passes;
            // only the final pass produces the output, earlier passes would
            // count every frame twice
            let pattern = if last { stages.progress } else { ProgressPattern::None };
            let output = self.run_pass(pass, pattern, progress, cancel, reported)?;
            reported += output.frames;

            match output.status {
                None => {
                    return Err(RunError::Interrupted {
                        frames: reported,
                    })
                },
                Some(status)
                    if !status.success() || output.source_status.is_some_and(|s| !s.success()) =>
                {
                    return Err(RunError::Crashed {
                        crash:  Box::new(EncoderCrash {
                            exit_status:   Some(status),
                            source_status: output.source_status.filter(|s| !s.success()),
                            source_stderr: output.source_stderr.into(),
                            stderr:        output.stderr.into(),
                            stdout:        output.stdout.into(),
                        }),
                        frames: reported,
                    });
                },
                Some(_) => {},
            }

            // encoders without parsable progress are credited per finished pass
            if stages.progress == ProgressPattern::None {
                let credit = if last {
                    job.frames_total.saturating_sub(reported)
                } else {
                    job.frames_total / passes
                };
                if credit > 0 {
                    let _ = progress.send(ProgressEvent::Advance(credit));
                    reported += credit;
                }
            }
            debug!("pass {}/{passes} finished", i + 1);
        }

        Ok(reported)
    }
}

impl ProcessRunner {
    fn run_pass(
        &self,
        pass: &PassCommand,
        pattern: ProgressPattern,
        progress: &Sender<ProgressEvent>,
        cancel: &AtomicBool,
        reported: usize,
    ) -> Result<PassOutput, RunError> {
        let mut source = spawn(&pass.source, Stdio::null())
            .map_err(|e| not_started(&format!("failed to start source pipe: {e}"), reported))?;
        let source_stdout = source.stdout.take().map_or_else(Stdio::null, Stdio::from);
        let mut encoder = match spawn(&pass.encode, source_stdout) {
            Ok(encoder) => encoder,
            Err(e) => {
                let _ = source.kill();
                let _ = source.wait();
                return Err(not_started(&format!("failed to start encoder: {e}"), reported));
            },
        };

        let source_stderr = source.stderr.take();
        let encoder_stdout = encoder.stdout.take();
        let encoder_stderr = encoder.stderr.take();

        thread::scope(|s| {
            let source_stderr = s.spawn(move || read_all(source_stderr));
            let stdout = s.spawn(move || read_all(encoder_stdout));
            let stderr = s.spawn(move || {
                let mut parser = ProgressParser::new(pattern);
                let mut captured = Vec::with_capacity(128);
                let Some(stderr) = encoder_stderr else {
                    return (captured, 0);
                };

                let mut reader = BufReader::new(stderr);
                let mut buf = Vec::with_capacity(128);
                let mut sent = 0;
                while let Ok(read) = reader.read_until(b'\r', &mut buf) {
                    if read == 0 {
                        break;
                    }
                    if let Ok(chunk) = simdutf8::basic::from_utf8(&buf) {
                        for line in chunk.split(['\r', '\n']).filter(|l| !l.is_empty()) {
                            trace!("{line}");
                            if let Some(delta) = parser.parse_progress(line) {
                                sent += delta;
                                let _ = progress.send(ProgressEvent::Advance(delta));
                            }
                        }
                    }
                    captured.extend_from_slice(&buf);
                    buf.clear();
                }
                (captured, sent)
            });

            let (status, source_status) = self.wait(&mut encoder, &mut source, cancel);
            let (stderr, frames) = stderr.join().unwrap_or_default();

            Ok(PassOutput {
                status,
                source_status,
                frames,
                source_stderr: source_stderr.join().unwrap_or_default(),
                stdout: stdout.join().unwrap_or_default(),
                stderr,
            })
        })
    }

    /// Waits for the encoder while watching `cancel`, then for the source.
    /// The encoder status is `None` if the pass was cancelled or the encoder
    /// could not be waited on, in which case both processes are killed.
    fn wait(
        &self,
        encoder: &mut Child,
        source: &mut Child,
        cancel: &AtomicBool,
    ) -> (Option<ExitStatus>, Option<ExitStatus>) {
        let status = loop {
            if cancel.load(Ordering::SeqCst) {
                debug!("cancelled, killing encoder pipeline");
                break None;
            }
            match encoder.try_wait() {
                Ok(Some(status)) => break Some(status),
                Ok(None) => thread::sleep(self.poll_interval),
                Err(e) => {
                    debug!("failed to poll encoder, blocking instead: {e}");
                    break encoder.wait().ok();
                },
            }
        };

        if status.is_none() {
            let _ = encoder.kill();
            let _ = encoder.wait();
            let _ = source.kill();
        }
        // the source exits on its own once the encoder closes its stdin
        let source_status = source.wait().ok();

        (status, source_status)
    }
}

fn spawn(cmd: &[OsString], stdin: Stdio) -> std::io::Result<Child> {
    let [bin, args @ ..] = cmd else {
        return Err(std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty command"));
    };
    Command::new(bin)
        .args(args)
        .stdin(stdin)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
}

fn read_all(pipe: Option<impl Read>) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        let _ = pipe.read_to_end(&mut buf);
    }
    buf
}

fn not_started(message: &str, frames: usize) -> RunError {
    RunError::Crashed {
        crash: Box::new(EncoderCrash {
            exit_status:   None,
            source_status: None,
            source_stderr: StringOrBytes::from(String::new()),
            stderr:        StringOrBytes::from(message.to_owned()),
            stdout:        StringOrBytes::from(String::new()),
        }),
        frames,
    }
}
