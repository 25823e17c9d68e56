use std::{
    cmp,
    fs,
    io,
    num::NonZeroUsize,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::available_parallelism,
};

use anyhow::{anyhow, bail, Context};
use colored::Colorize;
use tracing::{debug, error, info, warn};

use crate::{
    audit::Auditor,
    boost::{Boost, BrightnessProber, FfmpegBrightness},
    broker::{Broker, ChunkRunner, JobResult},
    checkpoint::CheckpointStore,
    chunk::{self, read_chunk_queue, save_chunk_queue, ChunkJob, ChunkSetBuilder, ChunkState},
    concat::{ConcatMethod, Concatenator, Remuxer},
    create_dir,
    encoder::{CommandComposer, Encoder, EncoderComposer, EncoderRegistry},
    error::PipelineError,
    ffmpeg::{
        self,
        compose_source_pipe,
        AudioExtractor,
        FfmpegAudio,
        FfmpegProber,
        FfmpegSegmenter,
        FrameProber,
    },
    pipes::ProcessRunner,
    progress::ProgressCounter,
    settings::{
        EncoderSettings,
        FfmpegSettings,
        InputOutputSettings,
        RunSettings,
        SplitMethod,
        SplitSettings,
        VmafReport,
    },
    split::{
        extra_splits,
        normalize,
        read_scenes,
        write_scenes,
        FixedInterval,
        NoSplit,
        ScenesFile,
        ScenesRecord,
        Segmenter,
        SplitCommand,
        Splitter,
    },
    target_quality::{vmaf_auto_threads, QualityScorer, TargetQuality},
    vmaf::{self, OutputScorer, Vmaf, VmafScorer},
};

/// One encode of one input.
#[derive(Debug)]
pub struct EncodeContext {
    pub encoder_settings: EncoderSettings,
    pub io_settings:      InputOutputSettings,
    pub run_settings:     RunSettings,
    pub split_settings:   SplitSettings,
    pub tq_settings:      Option<TargetQuality>,
    pub ffmpeg_settings:  FfmpegSettings,
    pub registry:         EncoderRegistry,
    pub boost:            Option<Boost>,
    pub vmaf_report:      Option<VmafReport>,
    /// Set to stop dispatching chunks and kill the running encoders.
    pub cancel:           Arc<AtomicBool>,
}

/// The external collaborators a run goes through.
pub struct Pipeline<'a> {
    pub splitter:      &'a dyn Splitter,
    pub segmenter:     &'a dyn Segmenter,
    pub prober:        &'a dyn FrameProber,
    pub composer:      &'a dyn CommandComposer,
    pub runner:        &'a dyn ChunkRunner,
    /// Required when target quality is set.
    pub scorer:        Option<&'a dyn QualityScorer>,
    /// Required when boosting.
    pub brightness:    Option<&'a dyn BrightnessProber>,
    pub remuxer:       &'a dyn Remuxer,
    pub audio:         Option<&'a dyn AudioExtractor>,
    /// Scores the finished output when a VMAF report is requested.
    pub output_scorer: Option<&'a dyn OutputScorer>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunSummary {
    /// Chunks in the whole queue, including ones done by earlier sessions.
    pub chunks:           usize,
    pub committed:        usize,
    /// Id and reason of every chunk left unfinished by this session.
    pub unresolved:       Vec<(String, String)>,
    pub total_frames:     usize,
    pub committed_frames: usize,
    /// VMAF of the finished output, when it was scored.
    pub vmaf:             Option<f64>,
}

impl RunSummary {
    #[inline]
    pub fn is_complete(&self) -> bool {
        self.committed == self.chunks
    }

    /// One line per chunk this session left unfinished.
    #[inline]
    pub fn unresolved_report(&self) -> Vec<String> {
        self.unresolved.iter().map(|(id, reason)| format!("chunk {id}: {reason}")).collect()
    }
}

impl EncodeContext {
    #[inline]
    pub fn new(
        encoder_settings: EncoderSettings,
        io_settings: InputOutputSettings,
        run_settings: RunSettings,
        split_settings: SplitSettings,
        tq_settings: Option<TargetQuality>,
        ffmpeg_settings: FfmpegSettings,
        registry: EncoderRegistry,
    ) -> Self {
        Self {
            encoder_settings,
            io_settings,
            run_settings,
            split_settings,
            tq_settings,
            ffmpeg_settings,
            registry,
            boost: None,
            vmaf_report: None,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Encodes the input with ffmpeg, the configured encoder and the
    /// configured concatenation tool.
    #[tracing::instrument(skip(self), fields(input = ?self.io_settings.input))]
    #[inline]
    pub fn encode_file(&mut self) -> anyhow::Result<RunSummary> {
        self.validate_tools()?;

        let splitter: Box<dyn Splitter> = match &self.split_settings.method {
            SplitMethod::None => Box::new(NoSplit),
            SplitMethod::Interval(interval) => Box::new(FixedInterval {
                interval: *interval,
            }),
            SplitMethod::ScenesFile(path) => Box::new(ScenesFile {
                path: path.clone(),
            }),
            SplitMethod::Command(command) => Box::new(SplitCommand {
                command: command.clone(),
            }),
        };
        let composer = EncoderComposer {
            encoder_settings: self.encoder_settings.clone(),
            ffmpeg_settings:  self.ffmpeg_settings.clone(),
            registry:         self.registry.clone(),
            stats_dir:        self.io_settings.temp.join("encode"),
        };
        let runner = ProcessRunner::default();
        let remuxer = Concatenator {
            method: self.ffmpeg_settings.concat,
            temp:   self.io_settings.temp.clone(),
        };
        let audio = FfmpegAudio {
            audio_params: self.ffmpeg_settings.audio_params.clone(),
        };
        let cancel = Arc::clone(&self.cancel);
        // probes and the output are scored one at a time
        let vmaf_threads =
            |threads: usize| if threads == 0 { vmaf_auto_threads(1) } else { threads };
        let probe_vmaf = self.tq_settings.as_ref().map(|tq| Vmaf {
            model:        tq.vmaf_path.clone(),
            threads:      vmaf_threads(tq.vmaf_threads),
            probing_rate: tq.probing_rate,
        });
        let scorer = probe_vmaf.as_ref().map(|vmaf| VmafScorer {
            composer:  &composer,
            runner:    &runner,
            probe_dir: self.io_settings.temp.join("probes"),
            vmaf,
            cancel:    &cancel,
        });
        let output_vmaf = self.vmaf_report.as_ref().map(|report| Vmaf {
            model:        report.model.clone(),
            threads:      vmaf_threads(report.threads),
            probing_rate: 1,
        });

        let pipeline = Pipeline {
            splitter:      splitter.as_ref(),
            segmenter:     &FfmpegSegmenter,
            prober:        &FfmpegProber,
            composer:      &composer,
            runner:        &runner,
            scorer:        scorer.as_ref().map(|s| s as &dyn QualityScorer),
            brightness:    self
                .boost
                .is_some()
                .then_some(&FfmpegBrightness as &dyn BrightnessProber),
            remuxer:       &remuxer,
            audio:         Some(&audio),
            output_scorer: output_vmaf.as_ref().map(|v| v as &dyn OutputScorer),
        };

        self.run_with(&pipeline)
    }

    /// Runs the whole encode through `pipeline`: split, schedule, verify,
    /// remux. The session directory is kept whenever a chunk is left
    /// unfinished so a later run with `resume` can pick it up.
    #[tracing::instrument(skip_all)]
    #[inline]
    pub fn run_with(&mut self, pipeline: &Pipeline<'_>) -> anyhow::Result<RunSummary> {
        self.validate_settings(pipeline)?;
        let temp = self.io_settings.temp.clone();
        let resumed = self.initialize()?;

        let (store, mut queue) = match resumed {
            Some(store) => {
                let queue = if temp.join("chunks.json").exists() {
                    read_chunk_queue(&temp)?
                } else {
                    self.rebuild_queue(pipeline)?
                };
                let queue_frames: usize = queue.iter().map(|job| job.frames_total).sum();
                if queue_frames != store.total_frames() {
                    warn!(
                        "chunks.json describes {queue_frames} frames but done.json expects {}",
                        store.total_frames()
                    );
                }
                (store, queue)
            },
            None => {
                let input = &self.io_settings.input;
                let total = pipeline
                    .prober
                    .probe(input)
                    .with_context(|| format!("Failed to count frames of {input:?}"))?;
                if total == 0 {
                    bail!("{input:?} has no video frames");
                }

                let splits = self.split_routine(pipeline.splitter, total)?;
                let queue = self.build_queue(pipeline, &splits)?;

                // the checkpoint total is what the chunks add up to
                let queue_frames: usize = queue.iter().map(|job| job.frames_total).sum();
                if queue_frames != total {
                    warn!("input has {total} frames but its chunks have {queue_frames}");
                }
                (CheckpointStore::init(&temp, queue_frames)?, queue)
            },
        };

        let mut pending = chunk::pending(&queue, &store);
        if self.run_settings.resume {
            info!(
                "encoding resumed with {}/{} chunks completed ({} remaining)",
                queue.len() - pending.len(),
                queue.len(),
                pending.len()
            );
        }

        if let (Some(tq), Some(scorer)) = (&self.tq_settings, pipeline.scorer) {
            self.resolve_quality(tq, scorer, &mut pending, &mut queue)?;
        }
        for job in &mut pending {
            let quality = self.boosted_quality(job, pipeline.brightness);
            job.encode_stages = pipeline.composer.compose(job, quality)?;
        }

        let requested = if self.run_settings.workers == 0 {
            self.determine_workers()
        } else {
            self.run_settings.workers
        };
        let workers = cmp::max(cmp::min(requested, pending.len()), 1);
        self.log_banner(pending.len(), workers);

        let (results, audio) = self.schedule(pipeline, &store, pending, workers)?;
        let unresolved: Vec<(String, String)> = results
            .iter()
            .filter(|result| result.state != ChunkState::Committed)
            .map(|result| {
                (
                    result.id.clone(),
                    result.reason.clone().unwrap_or_else(|| "not finished".to_owned()),
                )
            })
            .collect();

        let mut summary = RunSummary {
            chunks: queue.len(),
            committed: queue.iter().filter(|job| store.is_done(&job.id)).count(),
            unresolved,
            total_frames: store.total_frames(),
            committed_frames: store.committed_frames(),
            vmaf: None,
        };

        if summary.is_complete() {
            summary.vmaf = self.finish(pipeline, &queue, audio.as_deref())?;
        } else {
            for line in summary.unresolved_report() {
                warn!("unresolved {line}");
            }
            error!(
                "{} of {} chunks are unfinished, keeping {temp:?} for --resume",
                summary.chunks - summary.committed,
                summary.chunks
            );
        }

        Ok(summary)
    }

    #[inline]
    pub fn validate_settings(&self, pipeline: &Pipeline<'_>) -> Result<(), PipelineError> {
        if !self.io_settings.input.is_file() {
            return Err(PipelineError::Configuration(format!(
                "input {:?} does not exist or is not a file",
                self.io_settings.input
            )));
        }
        if self.io_settings.input == self.io_settings.output_file {
            return Err(PipelineError::Configuration(
                "output file must not be the input file".into(),
            ));
        }
        if !matches!(self.encoder_settings.passes, 1 | 2) {
            return Err(PipelineError::Configuration(format!(
                "passes must be 1 or 2, got {}",
                self.encoder_settings.passes
            )));
        }
        if self.run_settings.max_tries == 0 {
            return Err(PipelineError::Configuration("max tries must be at least 1".into()));
        }
        if let SplitMethod::Interval(0) = self.split_settings.method {
            return Err(PipelineError::Configuration("split interval must be at least 1".into()));
        }
        if let Some(tq) = &self.tq_settings {
            tq.validate()?;
            if pipeline.scorer.is_none() {
                return Err(PipelineError::Configuration(
                    "target quality is set but there is no quality scorer".into(),
                ));
            }
        }
        if self.boost.is_some() {
            if pipeline.brightness.is_none() {
                return Err(PipelineError::Configuration(
                    "boost is set but there is no brightness prober".into(),
                ));
            }
            let encoder = self.encoder_settings.encoder;
            let quantizer = encoder.quantizer(&self.encoder_settings.video_params);
            if self.tq_settings.is_none() && quantizer.is_none() {
                return Err(PipelineError::Configuration(format!(
                    "boost needs target quality or a quantizer in the {encoder} parameters"
                )));
            }
        }
        if self.vmaf_report.is_some() && pipeline.output_scorer.is_none() {
            return Err(PipelineError::Configuration(
                "a VMAF report is requested but there is no output scorer".into(),
            ));
        }
        Ok(())
    }

    /// Resolves executables through `PATH` and pins the encoder's path in
    /// the registry.
    fn validate_tools(&mut self) -> anyhow::Result<()> {
        let encoder = self.encoder_settings.encoder;
        let path = self.registry.resolve(encoder)?;
        debug!("using {encoder} at {path:?}");
        self.registry.insert(encoder, path);

        for tool in ["ffmpeg", "ffprobe"] {
            if which::which(tool).is_err() {
                bail!("{tool} not found. Is it installed in system path?");
            }
        }
        if self.ffmpeg_settings.concat == ConcatMethod::MKVMerge && which::which("mkvmerge").is_err()
        {
            bail!("mkvmerge not found, but `--concat mkvmerge` was specified. Is it installed in system path?");
        }
        if self.tq_settings.is_some() || self.vmaf_report.is_some() {
            vmaf::validate_libvmaf()?;
        }
        Ok(())
    }

    /// Prepares the session directory. Returns the loaded checkpoint when a
    /// previous session is resumed, `None` when starting over.
    #[tracing::instrument(level = "debug", skip(self))]
    fn initialize(&mut self) -> anyhow::Result<Option<CheckpointStore>> {
        let temp = self.io_settings.temp.clone();
        let resuming = self.run_settings.resume;

        if resuming {
            match CheckpointStore::load(&temp) {
                Ok(Some(store))
                    if temp.join("chunks.json").exists() || temp.join("scenes.json").exists() =>
                {
                    create_dir!(temp.join("split"))?;
                    create_dir!(temp.join("encode"))?;
                    return Ok(Some(store));
                },
                Ok(Some(_)) => {
                    let missing = PipelineError::persistence(
                        temp.join("chunks.json"),
                        io::Error::new(
                            io::ErrorKind::NotFound,
                            "neither chunks.json nor scenes.json exists",
                        ),
                    );
                    if !self.run_settings.discard_corrupt_checkpoint {
                        return Err(anyhow::Error::new(missing).context(
                            "Refusing to resume without a chunk queue, pass \
                             --discard-corrupt-checkpoint to start over",
                        ));
                    }
                    warn!("{missing}, discarding the previous session");
                },
                Ok(None) => {
                    info!("resume was set but done.json does not exist in temporary directory {temp:?}");
                },
                Err(e) if self.run_settings.discard_corrupt_checkpoint => {
                    warn!("{e}, discarding the previous session");
                },
                Err(e) => {
                    return Err(anyhow::Error::new(e).context(
                        "Refusing to resume from an unreadable checkpoint, pass \
                         --discard-corrupt-checkpoint to start over",
                    ));
                },
            }
            self.run_settings.resume = false;
        }

        // split points survive a resumed session that has to start over
        let scenes_path = temp.join("scenes.json");
        let scenes = if resuming { read_scenes(&scenes_path).ok() } else { None };

        if temp.is_dir() {
            fs::remove_dir_all(&temp)
                .with_context(|| format!("Failed to remove temporary directory {temp:?}"))?;
        }
        create_dir!(temp)?;
        create_dir!(temp.join("split"))?;
        create_dir!(temp.join("encode"))?;
        debug!("temporary directory: {temp:?}");

        if let Some(scenes) = scenes {
            write_scenes(&scenes_path, &scenes)?;
        }

        Ok(None)
    }

    fn split_routine(&self, splitter: &dyn Splitter, total: usize) -> anyhow::Result<Vec<usize>> {
        let scenes_path = self.io_settings.temp.join("scenes.json");
        if scenes_path.exists() {
            let scenes = read_scenes(&scenes_path)?;
            if scenes.frames == total {
                debug!("reusing {} split points from {scenes_path:?}", scenes.split_points.len());
                return Ok(scenes.split_points);
            }
        }

        let split_points = splitter
            .split(&self.io_settings.input, total)
            .context("Failed to split the input")?;
        let mut split_points = normalize(split_points, total);
        if let Some(max_len) = self.split_settings.extra_split {
            split_points = extra_splits(&split_points, total, max_len);
        }
        info!("found {} chunks", split_points.len() + 1);

        write_scenes(&scenes_path, &ScenesRecord {
            frames:       total,
            split_points: split_points.clone(),
        })?;
        Ok(split_points)
    }

    fn build_queue(
        &self,
        pipeline: &Pipeline<'_>,
        splits: &[usize],
    ) -> anyhow::Result<Vec<ChunkJob>> {
        let temp = &self.io_settings.temp;
        let queue = ChunkSetBuilder {
            segmenter:  pipeline.segmenter,
            prober:     pipeline.prober,
            split_dir:  temp.join("split"),
            encode_dir: temp.join("encode"),
            extension:  self.encoder_settings.encoder.output_extension(),
        }
        .build(splits, &self.io_settings.input)?;
        save_chunk_queue(temp, &queue)?;
        Ok(queue)
    }

    /// Rebuilds a lost chunk queue from the session's split points. The same
    /// split points give the same chunk ids, so `done.json` still applies.
    fn rebuild_queue(&self, pipeline: &Pipeline<'_>) -> anyhow::Result<Vec<ChunkJob>> {
        let scenes_path = self.io_settings.temp.join("scenes.json");
        let scenes = read_scenes(&scenes_path).map_err(|e| {
            anyhow::Error::new(PipelineError::persistence(
                &scenes_path,
                io::Error::new(io::ErrorKind::InvalidData, format!("{e:#}")),
            ))
            .context("chunks.json is missing and the split points cannot be read")
        })?;
        warn!(
            "chunks.json is missing, rebuilding the chunk queue from {} split points",
            scenes.split_points.len()
        );
        self.build_queue(pipeline, &scenes.split_points)
    }

    /// Searches the quality parameter of every pending chunk that has none
    /// yet, one chunk at a time. The queue is saved after each chunk so a
    /// resumed run does not probe it again.
    fn resolve_quality(
        &self,
        tq: &TargetQuality,
        scorer: &dyn QualityScorer,
        pending: &mut [ChunkJob],
        queue: &mut [ChunkJob],
    ) -> anyhow::Result<()> {
        let plots = self.io_settings.temp.join("plots");
        for job in pending.iter_mut().filter(|job| job.quality_param.is_none()) {
            if self.cancel.load(Ordering::SeqCst) {
                return Err(PipelineError::Interrupted.into());
            }

            let resolution = tq.resolve(job, scorer)?;
            job.quality_param = Some(resolution.param);

            if tq.plot_probes {
                create_dir!(plots)?;
                let path = plots.join(format!("{}.svg", job.id));
                if let Err(e) = vmaf::plot_probes(&path, &resolution.probes, tq.target, resolution.param)
                {
                    warn!("failed to plot probes of chunk {}: {e:#}", job.id);
                }
            }

            if let Some(queued) = queue.iter_mut().find(|queued| queued.id == job.id) {
                queued.quality_param = job.quality_param;
            }
            save_chunk_queue(&self.io_settings.temp, queue)?;
        }
        Ok(())
    }

    /// Runs the scheduler with the progress aggregator, extracting audio on
    /// the side. Returns the job results and the extracted audio, if any.
    fn schedule(
        &self,
        pipeline: &Pipeline<'_>,
        store: &CheckpointStore,
        pending: Vec<ChunkJob>,
        workers: usize,
    ) -> anyhow::Result<(Vec<JobResult>, Option<PathBuf>)> {
        let temp = self.io_settings.temp.as_path();
        let input = self.io_settings.input.as_path();

        let mut counter = ProgressCounter::new(store.total_frames(), store.committed_frames());
        if self.run_settings.show_progress {
            counter = counter.with_bar();
        }
        let auditor = Auditor {
            store,
            prober: pipeline.prober,
            trust_encoder: self.run_settings.trust_encoder,
        };
        let broker = Broker {
            runner:       pipeline.runner,
            sink:         &auditor,
            max_tries:    self.run_settings.max_tries,
            max_failures: self.run_settings.max_failures,
            cancel:       &self.cancel,
        };
        let (progress_tx, progress_rx) = crossbeam_channel::unbounded();

        crossbeam_utils::thread::scope(|s| -> anyhow::Result<(Vec<JobResult>, Option<PathBuf>)> {
            let audio_thread = match pipeline.audio {
                Some(audio) if !store.audio_done() => {
                    Some(s.spawn(move |_| -> anyhow::Result<Option<PathBuf>> {
                        let audio_output = audio.extract(input, temp)?;
                        store.mark_audio_done()?;
                        Ok(audio_output)
                    }))
                },
                _ => None,
            };

            let aggregator = s.spawn(|_| counter.aggregate(&progress_rx));
            let results = broker.run(pending, workers, &progress_tx);
            drop(progress_tx);
            aggregator.join().map_err(|_| anyhow!("progress aggregator panicked"))?;
            counter.finish();

            let audio = match audio_thread {
                Some(handle) => handle.join().map_err(|_| anyhow!("audio thread panicked"))??,
                None => Some(temp.join(FfmpegAudio::FILE_NAME)).filter(|path| path.exists()),
            };

            Ok((results?, audio))
        })
        .map_err(|_| anyhow!("a worker thread panicked"))?
    }

    /// Remuxes every chunk in source order, scores the output if requested
    /// and removes the session directory unless it should be kept.
    fn finish(
        &self,
        pipeline: &Pipeline<'_>,
        queue: &[ChunkJob],
        audio: Option<&Path>,
    ) -> anyhow::Result<Option<f64>> {
        let mut ordered: Vec<&ChunkJob> = queue.iter().collect();
        ordered.sort_by_key(|job| job.index);
        let outputs: Vec<PathBuf> = ordered.iter().map(|job| job.output_path.clone()).collect();

        debug!(
            "encoding finished, concatenating with {concat}",
            concat = self.ffmpeg_settings.concat
        );
        pipeline
            .remuxer
            .concatenate(&outputs, &self.io_settings.output_file, audio)
            .context("Failed to concatenate the encoded chunks")?;

        let temp = &self.io_settings.temp;
        if !self.io_settings.output_file.exists() {
            warn!(
                "Concatenation failed for unknown reasons! Temp folder will not be deleted: {temp:?}"
            );
            return Ok(None);
        }

        let vmaf = pipeline.output_scorer.and_then(|scorer| self.score_output(scorer));
        if !self.run_settings.keep {
            if let Err(e) = fs::remove_dir_all(temp) {
                warn!("Failed to delete temp directory: {e}");
            }
        }
        Ok(vmaf)
    }

    /// Scores the output against the filtered input, writing the VMAF log and
    /// a plot of it next to the output. A failure only costs the report.
    fn score_output(&self, scorer: &dyn OutputScorer) -> Option<f64> {
        let output = &self.io_settings.output_file;
        let reference = compose_source_pipe(
            &self.io_settings.input,
            &self.ffmpeg_settings.filter_args,
            &self.ffmpeg_settings.pix_format,
        );
        let log = output.with_extension("vmaf.json");

        let score = match scorer.score_output(output, &reference, &log) {
            Ok(score) => score,
            Err(e) => {
                warn!("failed to calculate the VMAF of {output:?}: {e:#}");
                return None;
            },
        };
        info!("VMAF of {output:?}: {score:.2}");

        if log.exists() {
            let plot = output.with_extension("vmaf.svg");
            let plotted =
                vmaf::read_vmaf_frames(&log).and_then(|scores| vmaf::plot_vmaf(&plot, &scores));
            if let Err(e) = plotted {
                warn!("failed to plot the VMAF of {output:?}: {e:#}");
            }
        }
        Some(score)
    }

    /// The quality `job` is encoded at, lowered for dark chunks when
    /// boosting. The boosted value is never persisted, so a resumed run
    /// starts from the same quantizer.
    fn boosted_quality(
        &self,
        job: &ChunkJob,
        prober: Option<&dyn BrightnessProber>,
    ) -> Option<u32> {
        let (Some(boost), Some(prober)) = (self.boost, prober) else {
            return job.quality_param;
        };
        let encoder = &self.encoder_settings;
        let cq = job.quality_param.or_else(|| encoder.encoder.quantizer(&encoder.video_params))?;

        match prober.brightness(&job.source_path) {
            Ok(brightness) => {
                let boosted = boost.adjust(cq, brightness);
                debug!(
                    "chunk {id}: average brightness {brightness:.1}, quantizer {cq} -> {boosted}",
                    id = job.id
                );
                Some(boosted)
            },
            Err(e) => {
                warn!("not boosting chunk {id}: {e:#}", id = job.id);
                Some(cq)
            },
        }
    }

    fn log_banner(&self, queue: usize, workers: usize) {
        info!(
            "\n{}{} {} {}{} {} {}{} {} {}{} {}\n{}: {}",
            "Q".green().bold(),
            "ueue".green(),
            format!("{queue}").green().bold(),
            "W".blue().bold(),
            "orkers".blue(),
            format!("{workers}").blue().bold(),
            "E".purple().bold(),
            "ncoder".purple(),
            format!("{encoder}", encoder = self.encoder_settings.encoder).purple().bold(),
            "P".purple().bold(),
            "asses".purple(),
            format!("{passes}", passes = self.encoder_settings.passes).purple().bold(),
            "Params".bold(),
            self.encoder_settings.video_params.join(" ").dimmed()
        );
    }

    /// Determine the optimal number of workers for an encoder
    fn determine_workers(&self) -> usize {
        let (width, height) = ffmpeg::probe_resolution(&self.io_settings.input).unwrap_or_else(|e| {
            debug!("could not read the input resolution, assuming 1080p: {e:#}");
            (1920, 1080)
        });
        let megapixels = f64::from(width * height) / 1e6;
        // encoder memory usage scales with resolution (megapixels), approximately
        // linearly. Expressed as GB/Megapixel
        let split_ram = 0.1;
        let enc_ram = match self.encoder_settings.encoder {
            Encoder::aom => 0.4,
            Encoder::rav1e => 0.7,
            Encoder::svt_av1 => 1.2,
            Encoder::vpx => 0.3,
            Encoder::x264 => 0.7,
            Encoder::x265 => 0.6,
        };
        // rough estimate of how many cpu cores are fully loaded by one worker with
        // the encoder's default threading
        let cpu_threads = match self.encoder_settings.encoder {
            Encoder::aom => 4,
            Encoder::rav1e => 1,
            Encoder::svt_av1 => 6,
            Encoder::vpx => 3,
            Encoder::x264 | Encoder::x265 => 8,
        };
        let pix_format = self.ffmpeg_settings.pix_format.as_str();
        let pix_mult = if pix_format.contains("444") {
            1.5
        } else if pix_format.contains("422") {
            1.25
        } else {
            1.0
        };

        let mut system = sysinfo::System::new();
        system.refresh_memory();
        let cpu = available_parallelism().map_or(1, NonZeroUsize::get);
        // sysinfo returns Bytes, convert to GB
        // use total instead of available, because the worker pool is never resized
        let ram_gb = system.total_memory() as f64 / 1e9;

        cmp::max(
            cmp::min(
                cpu / cpu_threads,
                (ram_gb / (megapixels * (enc_ram + split_ram) * pix_mult)).round() as usize,
            ),
            1,
        )
    }
}
