use std::{
    ffi::OsString,
    fs,
    path::{Path, PathBuf},
    process::{Command, Stdio},
    sync::atomic::AtomicBool,
};

use anyhow::{anyhow, bail, ensure, Context};
use plotters::prelude::*;
use serde_json::Value;
use tracing::{debug, trace};

use crate::{
    broker::{ChunkRunner, RunError},
    chunk::ChunkJob,
    encoder::CommandComposer,
    error::PipelineError,
    into_vec,
    target_quality::{ProbeSample, QualityScorer},
};

/// Fails unless the ffmpeg on `PATH` was built with libvmaf.
#[inline]
pub fn validate_libvmaf() -> anyhow::Result<()> {
    let output = Command::new("ffmpeg")
        .args(["-hide_banner", "-filters"])
        .output()
        .context("Failed to run ffmpeg. Is ffmpeg installed?")?;
    let filters = String::from_utf8_lossy(&output.stdout);
    ensure!(
        filters.contains("libvmaf"),
        "ffmpeg is not compiled with libvmaf, which VMAF scoring requires"
    );
    Ok(())
}

/// Compares an encode against a reference, writing the libvmaf JSON log to
/// `log`. The reference is the stage 1 command the encode was fed from, so
/// the comparison sees the same filters and pixel format.
pub trait OutputScorer: Sync {
    fn score_output(
        &self,
        distorted: &Path,
        reference: &[OsString],
        log: &Path,
    ) -> anyhow::Result<f64>;
}

impl<F> OutputScorer for F
where
    F: Fn(&Path, &[OsString], &Path) -> anyhow::Result<f64> + Sync,
{
    #[inline]
    fn score_output(
        &self,
        distorted: &Path,
        reference: &[OsString],
        log: &Path,
    ) -> anyhow::Result<f64> {
        self(distorted, reference, log)
    }
}

/// libvmaf through ffmpeg. The reference pipe is read from stdin.
#[derive(Debug, Clone, Default)]
pub struct Vmaf {
    pub model:        Option<PathBuf>,
    pub threads:      usize,
    /// Score every n-th frame.
    pub probing_rate: usize,
}

impl Vmaf {
    fn filter(&self, log: &Path) -> String {
        let select = if self.probing_rate > 1 {
            format!("select=not(mod(n\\,{})),setpts=PTS-STARTPTS,", self.probing_rate)
        } else {
            String::new()
        };
        let mut vmaf = format!(
            "libvmaf=log_fmt=json:log_path={log}:n_threads={threads}",
            log = escape_filter_path(log),
            threads = self.threads.max(1)
        );
        if let Some(model) = &self.model {
            vmaf.push_str(":model=path=");
            vmaf.push_str(&escape_filter_path(model));
        }
        format!(
            "[0:v]{select}format=yuv420p10le[distorted];[1:v]{select}format=yuv420p10le[reference];\
             [distorted][reference]{vmaf}"
        )
    }

    fn args(&self, distorted: &Path, log: &Path) -> Vec<OsString> {
        let filter = self.filter(log);
        trace!("vmaf filter: {filter}");
        into_vec![
            "-y",
            "-hide_banner",
            "-loglevel",
            "error",
            "-i",
            distorted,
            "-i",
            "-",
            "-lavfi",
            filter,
            "-f",
            "null",
            "-"
        ]
    }
}

impl OutputScorer for Vmaf {
    #[tracing::instrument(level = "debug", skip(self, reference))]
    #[inline]
    fn score_output(
        &self,
        distorted: &Path,
        reference: &[OsString],
        log: &Path,
    ) -> anyhow::Result<f64> {
        let [bin, args @ ..] = reference else {
            bail!("empty reference command");
        };
        let mut source = Command::new(bin)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .context("Failed to start the VMAF reference pipe")?;
        let reference_pipe = source.stdout.take().map_or_else(Stdio::null, Stdio::from);

        let output = Command::new("ffmpeg")
            .args(self.args(distorted, log))
            .stdin(reference_pipe)
            .output();
        if !output.as_ref().is_ok_and(|output| output.status.success()) {
            let _ = source.kill();
        }
        let _ = source.wait();

        let output = output.context("Failed to run ffmpeg. Is ffmpeg installed?")?;
        ensure!(
            output.status.success(),
            "VMAF calculation failed: {}",
            String::from_utf8_lossy(&output.stderr)
        );

        read_vmaf_file(log)
    }
}

/// Scores a candidate parameter by encoding a probe of the chunk and
/// comparing it against the chunk's source pipe.
pub struct VmafScorer<'a> {
    pub composer:  &'a dyn CommandComposer,
    pub runner:    &'a dyn ChunkRunner,
    /// Where probe encodes and VMAF logs go.
    pub probe_dir: PathBuf,
    pub vmaf:      &'a dyn OutputScorer,
    pub cancel:    &'a AtomicBool,
}

impl VmafScorer<'_> {
    /// Encodes a probe and returns it with the source pipe it was fed from.
    fn encode_probe(
        &self,
        job: &ChunkJob,
        param: u32,
    ) -> anyhow::Result<(PathBuf, Vec<OsString>)> {
        let mut probe = job.clone();
        let extension = job.output_path.extension().unwrap_or_default().to_string_lossy();
        probe.output_path = self.probe_dir.join(format!("{}_{param}.{extension}", job.id));
        probe.encode_stages = self.composer.compose(&probe, Some(param))?;
        let Some(reference) = probe.encode_stages.passes.last().map(|pass| pass.source.clone())
        else {
            bail!("no encoder commands were composed for the probe");
        };

        // probes are not part of the run's progress
        let (progress, _events) = crossbeam_channel::unbounded();
        self.runner.run(&probe, &progress, self.cancel).map_err(|e| match e {
            RunError::Interrupted {
                ..
            } => anyhow::Error::new(PipelineError::Interrupted),
            RunError::Crashed {
                ..
            } => anyhow!("probe encode with {param} failed: {e}"),
        })?;

        Ok((probe.output_path, reference))
    }
}

impl QualityScorer for VmafScorer<'_> {
    #[inline]
    fn score(&self, job: &ChunkJob, param: u32) -> anyhow::Result<f64> {
        fs::create_dir_all(&self.probe_dir)?;
        let (probe, reference) = self.encode_probe(job, param)?;
        let log = self.probe_dir.join(format!("{}_{param}.json", job.id));
        let score = self.vmaf.score_output(&probe, &reference, &log)?;
        debug!("chunk {id}: {param} scored {score:.2}", id = job.id);
        Ok(score)
    }
}

fn read_vmaf_log(path: &Path) -> anyhow::Result<Value> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("Failed to read VMAF log {path:?}"))?;
    serde_json::from_str(&contents).with_context(|| format!("Failed to parse VMAF log {path:?}"))
}

/// Pooled mean VMAF of a libvmaf JSON log.
#[inline]
pub fn read_vmaf_file(path: &Path) -> anyhow::Result<f64> {
    read_vmaf_log(path)?
        .get("pooled_metrics")
        .and_then(|pooled| pooled.get("vmaf"))
        .and_then(|vmaf| vmaf.get("mean"))
        .and_then(Value::as_f64)
        .ok_or_else(|| anyhow!("VMAF log {path:?} has no pooled mean"))
}

/// Per frame VMAF scores of a libvmaf JSON log, in frame order.
#[inline]
pub fn read_vmaf_frames(path: &Path) -> anyhow::Result<Vec<f64>> {
    let json = read_vmaf_log(path)?;
    let frames = json
        .get("frames")
        .and_then(Value::as_array)
        .ok_or_else(|| anyhow!("VMAF log {path:?} has no frames"))?;

    frames
        .iter()
        .map(|frame| {
            frame
                .get("metrics")
                .and_then(|metrics| metrics.get("vmaf"))
                .and_then(Value::as_f64)
                .ok_or_else(|| anyhow!("VMAF log {path:?} has a frame without a score"))
        })
        .collect()
}

/// Score below which `percent` percent of `scores` fall.
fn percentile(sorted: &[f64], percent: f64) -> f64 {
    let rank = ((sorted.len() - 1) as f64 * percent / 100.0).round() as usize;
    sorted[rank.min(sorted.len() - 1)]
}

/// Draws the per frame scores of a whole encode with its mean and 1% low.
#[inline]
pub fn plot_vmaf(path: &Path, scores: &[f64]) -> anyhow::Result<()> {
    if scores.is_empty() {
        bail!("no frames to plot");
    }

    let mut sorted = scores.to_vec();
    sorted.sort_by(f64::total_cmp);
    let mean = scores.iter().sum::<f64>() / scores.len() as f64;
    let low = percentile(&sorted, 1.0);
    let frames = scores.len() as f64;

    let root = SVGBackend::new(path, (1600, 600)).into_drawing_area();
    root.fill(&WHITE)?;

    let mut chart = ChartBuilder::on(&root)
        .set_label_area_size(LabelAreaPosition::Bottom, (7).percent())
        .set_label_area_size(LabelAreaPosition::Left, (5).percent())
        .margin((2).percent())
        .build_cartesian_2d(0.0..frames, (sorted[0] - 1.0).floor().max(0.0)..100.0)?;

    chart.configure_mesh().x_desc("frame").y_desc("VMAF").draw()?;

    chart
        .draw_series(LineSeries::new(
            scores.iter().enumerate().map(|(frame, score)| (frame as f64, *score)),
            &BLUE,
        ))?
        .label("frames")
        .legend(|(x, y)| PathElement::new([(x, y), (x + 20, y)], BLUE));
    chart
        .draw_series(LineSeries::new([(0.0, mean), (frames, mean)], &GREEN))?
        .label(format!("mean {mean:.2}"))
        .legend(|(x, y)| PathElement::new([(x, y), (x + 20, y)], GREEN));
    chart
        .draw_series(LineSeries::new([(0.0, low), (frames, low)], &RED))?
        .label(format!("1% low {low:.2}"))
        .legend(|(x, y)| PathElement::new([(x, y), (x + 20, y)], RED));
    chart.configure_series_labels().background_style(WHITE).border_style(BLACK).draw()?;

    root.present()?;
    Ok(())
}

/// Filter option values use `:` as a separator and `\` as an escape.
fn escape_filter_path(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/").replace(':', "\\:")
}

/// Draws the probes of one chunk as an SVG, with the target as a horizontal
/// line.
#[inline]
pub fn plot_probes(
    path: &Path,
    samples: &[ProbeSample],
    target: f64,
    chosen: u32,
) -> anyhow::Result<()> {
    if samples.is_empty() {
        bail!("no probes to plot");
    }

    let mut sorted = samples.to_vec();
    sorted.sort_by_key(|sample| sample.param);

    let min_param = f64::from(sorted[0].param.min(chosen)) - 1.0;
    let max_param = f64::from(sorted[sorted.len() - 1].param.max(chosen)) + 1.0;
    let (min_score, max_score) = sorted.iter().fold((target, target), |(lo, hi), s| {
        (lo.min(s.score), hi.max(s.score))
    });

    let root = SVGBackend::new(path, (1000, 600)).into_drawing_area();
    root.fill(&WHITE)?;

    let mut chart = ChartBuilder::on(&root)
        .set_label_area_size(LabelAreaPosition::Bottom, (7).percent())
        .set_label_area_size(LabelAreaPosition::Left, (7).percent())
        .margin((2).percent())
        .build_cartesian_2d(min_param..max_param, (min_score - 1.0).floor()..(max_score + 1.0).ceil())?;

    chart.configure_mesh().x_desc("parameter").y_desc("VMAF").draw()?;

    chart.draw_series(LineSeries::new(
        sorted.iter().map(|s| (f64::from(s.param), s.score)),
        &BLUE,
    ))?;
    chart.draw_series(
        sorted.iter().map(|s| Circle::new((f64::from(s.param), s.score), 4, BLUE.filled())),
    )?;
    chart.draw_series(LineSeries::new([(min_param, target), (max_param, target)], &RED))?;
    chart.draw_series(LineSeries::new(
        [(f64::from(chosen), (min_score - 1.0).floor()), (f64::from(chosen), (max_score + 1.0).ceil())],
        &GREEN,
    ))?;

    root.present()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::{Mutex, PoisonError};

    use crossbeam_channel::Sender;

    use super::*;
    use crate::{
        broker::tests::FakeRunner,
        encoder::{Encoder, EncoderComposer, EncoderRegistry},
        ffmpeg::compose_source_pipe,
        progress::ProgressEvent,
        settings::{EncoderSettings, FfmpegSettings},
    };

    fn job() -> ChunkJob {
        ChunkJob::new(3, "split/00003.mkv".into(), Path::new("encode"), "ivf", 48, 100)
    }

    fn composer(filter_args: &[&str]) -> EncoderComposer {
        EncoderComposer {
            encoder_settings: EncoderSettings {
                encoder:      Encoder::svt_av1,
                passes:       1,
                video_params: Vec::new(),
            },
            ffmpeg_settings:  FfmpegSettings {
                filter_args: filter_args.iter().map(|arg| (*arg).to_owned()).collect(),
                ..FfmpegSettings::default()
            },
            registry:         EncoderRegistry::default(),
            stats_dir:        PathBuf::from("encode"),
        }
    }

    #[test]
    fn reference_is_read_from_stdin() {
        let vmaf = Vmaf {
            probing_rate: 4,
            ..Vmaf::default()
        };
        let args: Vec<_> = vmaf
            .args(Path::new("probe.ivf"), Path::new("vmaf.json"))
            .iter()
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect();

        assert!(args.windows(4).any(|w| w == ["-i", "probe.ivf", "-i", "-"]));
        let filter = &args[args.iter().position(|arg| arg == "-lavfi").unwrap() + 1];
        assert_eq!(filter.matches("select=not(mod(n\\,4))").count(), 2);
        assert!(filter.contains("log_path=vmaf.json"));
    }

    #[test]
    fn candidates_are_compared_against_the_filtered_source() {
        let dir = tempfile::tempdir().unwrap();
        let composer = composer(&["-vf", "scale=1280:-2"]);
        let compared = Mutex::new(Vec::new());
        let vmaf = |distorted: &Path, reference: &[OsString], _log: &Path| -> anyhow::Result<f64> {
            compared
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push((distorted.to_owned(), reference.to_vec()));
            Ok(93.5)
        };
        let cancel = AtomicBool::new(false);
        let scorer = VmafScorer {
            composer:  &composer,
            runner:    &FakeRunner::default(),
            probe_dir: dir.path().to_owned(),
            vmaf:      &vmaf,
            cancel:    &cancel,
        };

        let score = scorer.score(&job(), 30).unwrap();

        assert!((score - 93.5).abs() < f64::EPSILON);
        let compared = compared.into_inner().unwrap();
        let (distorted, reference) = &compared[0];
        assert_eq!(distorted, &dir.path().join("00003_30.ivf"));
        assert_eq!(
            reference,
            &compose_source_pipe(
                Path::new("split/00003.mkv"),
                &["-vf".to_owned(), "scale=1280:-2".to_owned()],
                "yuv420p10le"
            )
        );
    }

    /// Behaves like a runner whose encode was cancelled.
    struct Cancelled;

    impl ChunkRunner for Cancelled {
        fn run(
            &self,
            _job: &ChunkJob,
            _progress: &Sender<ProgressEvent>,
            _cancel: &AtomicBool,
        ) -> Result<usize, RunError> {
            Err(RunError::Interrupted {
                frames: 0,
            })
        }
    }

    #[test]
    fn cancelled_encode_is_an_interrupt() {
        let dir = tempfile::tempdir().unwrap();
        let composer = composer(&[]);
        let vmaf = |_: &Path, _: &[OsString], _: &Path| -> anyhow::Result<f64> { unreachable!() };
        let cancel = AtomicBool::new(true);
        let scorer = VmafScorer {
            composer:  &composer,
            runner:    &Cancelled,
            probe_dir: dir.path().to_owned(),
            vmaf:      &vmaf,
            cancel:    &cancel,
        };

        let err = scorer.score(&job(), 30).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::Interrupted)
        ));
    }

    #[test]
    fn frame_scores_are_read_and_plotted() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("output.vmaf.json");
        fs::write(
            &log,
            r#"{"frames": [
                {"frameNum": 0, "metrics": {"vmaf": 95.5}},
                {"frameNum": 1, "metrics": {"vmaf": 91.0}},
                {"frameNum": 2, "metrics": {"vmaf": 97.25}}
            ], "pooled_metrics": {"vmaf": {"mean": 94.58}}}"#,
        )
        .unwrap();

        let scores = read_vmaf_frames(&log).unwrap();
        assert_eq!(scores, [95.5, 91.0, 97.25]);

        let path = dir.path().join("output.vmaf.svg");
        plot_vmaf(&path, &scores).unwrap();
        assert!(fs::read_to_string(&path).unwrap().contains("<svg"));
    }

    #[test]
    fn pooled_mean_is_read() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("vmaf.json");
        fs::write(
            &log,
            r#"{"version": "3.0.0", "frames": [], "pooled_metrics": {"vmaf": {"min": 88.1, "max": 97.2, "mean": 93.4, "harmonic_mean": 93.3}}}"#,
        )
        .unwrap();

        assert!((read_vmaf_file(&log).unwrap() - 93.4).abs() < f64::EPSILON);
    }

    #[test]
    fn log_without_vmaf_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("vmaf.json");
        fs::write(&log, r#"{"pooled_metrics": {}}"#).unwrap();

        assert!(read_vmaf_file(&log).is_err());
    }

    #[test]
    fn filter_paths_are_escaped() {
        assert_eq!(escape_filter_path(Path::new("C:\\temp\\x.json")), "C\\:/temp/x.json");
    }

    #[test]
    fn probes_are_plotted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("00001.svg");
        let samples = [
            ProbeSample {
                param: 20,
                score: 96.0,
            },
            ProbeSample {
                param: 35,
                score: 91.5,
            },
            ProbeSample {
                param: 50,
                score: 84.0,
            },
        ];

        plot_probes(&path, &samples, 93.0, 30).unwrap();

        let svg = fs::read_to_string(&path).unwrap();
        assert!(svg.contains("<svg"));
    }
}
