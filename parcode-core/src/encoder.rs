use std::{
    collections::BTreeMap,
    ffi::OsString,
    fmt::Debug,
    path::{Path, PathBuf},
    str::FromStr,
};

use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString, IntoEnumIterator, IntoStaticStr};

use crate::{
    chunk::ChunkJob,
    error::PipelineError,
    ffmpeg::compose_source_pipe,
    into_vec,
    parse::ProgressPattern,
    settings::{EncoderSettings, FfmpegSettings},
};

const NULL_OUTPUT: &str = if cfg!(windows) { "nul" } else { "/dev/null" };

#[allow(non_camel_case_types)]
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
    IntoStaticStr,
)]
pub enum Encoder {
    aom,
    rav1e,
    vpx,
    #[strum(to_string = "svt-av1", serialize = "svt_av1")]
    #[serde(rename = "svt-av1")]
    svt_av1,
    x264,
    x265,
}

impl Encoder {
    /// Default executable name of the encoder.
    #[inline]
    pub const fn bin(self) -> &'static str {
        match self {
            Self::aom => "aomenc",
            Self::rav1e => "rav1e",
            Self::vpx => "vpxenc",
            Self::svt_av1 => "SvtAv1EncApp",
            Self::x264 => "x264",
            Self::x265 => "x265",
        }
    }

    /// File extension of the raw bitstream the encoder writes.
    #[inline]
    pub const fn output_extension(self) -> &'static str {
        match self {
            Self::aom | Self::rav1e | Self::vpx | Self::svt_av1 => "ivf",
            Self::x264 => "264",
            Self::x265 => "hevc",
        }
    }

    #[inline]
    pub const fn default_passes(self) -> u8 {
        match self {
            Self::aom | Self::vpx => 2,
            Self::rav1e | Self::svt_av1 | Self::x264 | Self::x265 => 1,
        }
    }

    /// Quantizer range probed by target quality when none is given.
    #[inline]
    pub const fn default_cq_range(self) -> (u32, u32) {
        match self {
            Self::aom | Self::vpx => (15, 55),
            Self::rav1e => (50, 140),
            Self::svt_av1 => (15, 50),
            Self::x264 | Self::x265 => (15, 35),
        }
    }

    #[inline]
    pub const fn progress_pattern(self) -> ProgressPattern {
        match self {
            Self::aom | Self::vpx => ProgressPattern::AomVpx,
            Self::rav1e => ProgressPattern::Rav1e,
            Self::svt_av1 => ProgressPattern::SvtAv1,
            Self::x264 | Self::x265 => ProgressPattern::X26x,
        }
    }

    /// Parses an encoder name, suggesting the closest known name on failure.
    #[inline]
    pub fn from_name(name: &str) -> Result<Self, PipelineError> {
        Self::from_str(name).map_err(|_| {
            let suggestion = Self::iter()
                .map(<&'static str>::from)
                .max_by(|a, b| {
                    strsim::jaro_winkler(name, a).total_cmp(&strsim::jaro_winkler(name, b))
                })
                .map(|closest| format!(", did you mean {closest:?}?"))
                .unwrap_or_default();
            PipelineError::Configuration(format!("unknown encoder {name:?}{suggestion}"))
        })
    }

    /// Replaces any quantizer the user passed with `q`.
    #[inline]
    pub fn with_quantizer(self, params: &[String], q: u32) -> Vec<String> {
        let mut out = Vec::with_capacity(params.len() + 2);
        match self {
            Self::aom | Self::vpx => {
                out.extend(params.iter().filter(|p| !p.starts_with("--cq-level=")).cloned());
                if !out.iter().any(|p| p.starts_with("--end-usage=")) {
                    out.push("--end-usage=q".to_owned());
                }
                out.push(format!("--cq-level={q}"));
            },
            Self::rav1e | Self::svt_av1 | Self::x264 | Self::x265 => {
                let flag = match self {
                    Self::rav1e => "--quantizer",
                    _ => "--crf",
                };
                let mut iter = params.iter();
                while let Some(param) = iter.next() {
                    if param == flag {
                        iter.next();
                    } else if !param.starts_with(&format!("{flag}=")) {
                        out.push(param.clone());
                    }
                }
                out.push(flag.to_owned());
                out.push(q.to_string());
            },
        }
        out
    }

    /// The quantizer set in `params`, if any.
    #[inline]
    pub fn quantizer(self, params: &[String]) -> Option<u32> {
        let flag = match self {
            Self::aom | Self::vpx => "--cq-level",
            Self::rav1e => "--quantizer",
            Self::svt_av1 | Self::x264 | Self::x265 => "--crf",
        };
        let mut iter = params.iter();
        let mut found = None;
        while let Some(param) = iter.next() {
            if param == flag {
                found = iter.next().and_then(|value| value.parse().ok());
            } else if let Some(value) = param.strip_prefix(flag) {
                if let Some(value) = value.strip_prefix('=') {
                    found = value.parse().ok();
                }
            }
        }
        found
    }

    #[inline]
    pub fn compose_1_1_pass(self, bin: &Path, params: &[String], output: &Path) -> Vec<OsString> {
        let mut cmd: Vec<OsString> = into_vec![bin];
        match self {
            Self::aom | Self::vpx => {
                cmd.extend(into_vec!["--passes=1"]);
                cmd.extend(params.iter().map(OsString::from));
                cmd.extend(into_vec!["-o", output, "-"]);
            },
            Self::rav1e => {
                cmd.extend(into_vec!["-", "-y"]);
                cmd.extend(params.iter().map(OsString::from));
                cmd.extend(into_vec!["--output", output]);
            },
            Self::svt_av1 => {
                cmd.extend(into_vec!["-i", "stdin", "--progress", "2"]);
                cmd.extend(params.iter().map(OsString::from));
                cmd.extend(into_vec!["-b", output]);
            },
            Self::x264 => {
                cmd.extend(into_vec!["--stitchable", "--demuxer", "y4m"]);
                cmd.extend(params.iter().map(OsString::from));
                cmd.extend(into_vec!["-", "-o", output]);
            },
            Self::x265 => {
                cmd.extend(into_vec!["--y4m"]);
                cmd.extend(params.iter().map(OsString::from));
                cmd.extend(into_vec!["-", "-o", output]);
            },
        }
        cmd
    }

    #[inline]
    pub fn compose_1_2_pass(self, bin: &Path, params: &[String], fpf: &Path) -> Vec<OsString> {
        let mut cmd: Vec<OsString> = into_vec![bin];
        match self {
            Self::aom | Self::vpx => {
                let mut fpf_arg = OsString::from("--fpf=");
                fpf_arg.push(fpf.with_extension("log"));
                cmd.extend(into_vec!["--passes=2", "--pass=1", fpf_arg]);
                cmd.extend(params.iter().map(OsString::from));
                cmd.extend(into_vec!["-o", NULL_OUTPUT, "-"]);
            },
            Self::rav1e => {
                cmd.extend(into_vec!["-", "-y", "--quiet", "--first-pass"]);
                cmd.push(fpf.with_extension("stat").into());
                cmd.extend(params.iter().map(OsString::from));
                cmd.extend(into_vec!["--output", NULL_OUTPUT]);
            },
            Self::svt_av1 => {
                cmd.extend(into_vec!["-i", "stdin", "--progress", "2", "--pass", "1", "--stats"]);
                cmd.push(fpf.with_extension("stat").into());
                cmd.extend(params.iter().map(OsString::from));
                cmd.extend(into_vec!["-b", NULL_OUTPUT]);
            },
            Self::x264 | Self::x265 => {
                if self == Self::x264 {
                    cmd.extend(into_vec!["--stitchable", "--demuxer", "y4m"]);
                } else {
                    cmd.extend(into_vec!["--y4m"]);
                }
                cmd.extend(into_vec!["--pass", "1", "--stats"]);
                cmd.push(fpf.with_extension("log").into());
                cmd.extend(params.iter().map(OsString::from));
                cmd.extend(into_vec!["-", "-o", NULL_OUTPUT]);
            },
        }
        cmd
    }

    #[inline]
    pub fn compose_2_2_pass(
        self,
        bin: &Path,
        params: &[String],
        fpf: &Path,
        output: &Path,
    ) -> Vec<OsString> {
        let mut cmd: Vec<OsString> = into_vec![bin];
        match self {
            Self::aom | Self::vpx => {
                let mut fpf_arg = OsString::from("--fpf=");
                fpf_arg.push(fpf.with_extension("log"));
                cmd.extend(into_vec!["--passes=2", "--pass=2", fpf_arg]);
                cmd.extend(params.iter().map(OsString::from));
                cmd.extend(into_vec!["-o", output, "-"]);
            },
            Self::rav1e => {
                cmd.extend(into_vec!["-", "-y", "--second-pass"]);
                cmd.push(fpf.with_extension("stat").into());
                cmd.extend(params.iter().map(OsString::from));
                cmd.extend(into_vec!["--output", output]);
            },
            Self::svt_av1 => {
                cmd.extend(into_vec!["-i", "stdin", "--progress", "2", "--pass", "2", "--stats"]);
                cmd.push(fpf.with_extension("stat").into());
                cmd.extend(params.iter().map(OsString::from));
                cmd.extend(into_vec!["-b", output]);
            },
            Self::x264 | Self::x265 => {
                if self == Self::x264 {
                    cmd.extend(into_vec!["--stitchable", "--demuxer", "y4m"]);
                } else {
                    cmd.extend(into_vec!["--y4m"]);
                }
                cmd.extend(into_vec!["--pass", "2", "--stats"]);
                cmd.push(fpf.with_extension("log").into());
                cmd.extend(params.iter().map(OsString::from));
                cmd.extend(into_vec!["-", "-o", output]);
            },
        }
        cmd
    }
}

/// Maps encoders to the executable used to run them. Encoders without an
/// entry run their default binary from `PATH`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncoderRegistry {
    executables: BTreeMap<Encoder, PathBuf>,
}

impl EncoderRegistry {
    #[inline]
    pub fn insert(&mut self, encoder: Encoder, executable: impl Into<PathBuf>) {
        self.executables.insert(encoder, executable.into());
    }

    #[inline]
    #[must_use]
    pub fn with_executable(mut self, encoder: Encoder, executable: impl Into<PathBuf>) -> Self {
        self.insert(encoder, executable);
        self
    }

    #[inline]
    pub fn executable(&self, encoder: Encoder) -> PathBuf {
        self.executables.get(&encoder).cloned().unwrap_or_else(|| PathBuf::from(encoder.bin()))
    }

    /// Checks that the executable for `encoder` can actually be run.
    #[inline]
    pub fn resolve(&self, encoder: Encoder) -> Result<PathBuf, PipelineError> {
        let executable = self.executable(encoder);
        which::which(&executable).map_err(|_| {
            PipelineError::Configuration(format!(
                "encoder {encoder} not found at {executable:?}. Is it installed in the system \
                 path?"
            ))
        })
    }
}

/// Both stages of one encoder pass: stage 1 decodes and filters the chunk to
/// y4m on stdout, stage 2 encodes from stdin.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassCommand {
    pub source: Vec<OsString>,
    pub encode: Vec<OsString>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EncodeStages {
    pub passes:   Vec<PassCommand>,
    pub progress: ProgressPattern,
}

pub trait CommandComposer: Sync {
    /// Builds the external commands encoding `job`, with `quality` overriding
    /// the encoder's quantizer when set.
    fn compose(&self, job: &ChunkJob, quality: Option<u32>) -> Result<EncodeStages, PipelineError>;
}

#[derive(Debug, Clone)]
pub struct EncoderComposer {
    pub encoder_settings: EncoderSettings,
    pub ffmpeg_settings:  FfmpegSettings,
    pub registry:         EncoderRegistry,
    /// Where first pass statistics files go.
    pub stats_dir:        PathBuf,
}

impl CommandComposer for EncoderComposer {
    #[inline]
    fn compose(&self, job: &ChunkJob, quality: Option<u32>) -> Result<EncodeStages, PipelineError> {
        let encoder = self.encoder_settings.encoder;
        let bin = self.registry.executable(encoder);
        let params = match quality {
            Some(q) => encoder.with_quantizer(&self.encoder_settings.video_params, q),
            None => self.encoder_settings.video_params.clone(),
        };
        let source = compose_source_pipe(
            &job.source_path,
            &self.ffmpeg_settings.filter_args,
            &self.ffmpeg_settings.pix_format,
        );
        let fpf = self.stats_dir.join(format!("{id}_fpf", id = job.id));

        let passes = match self.encoder_settings.passes {
            1 => vec![PassCommand {
                source,
                encode: encoder.compose_1_1_pass(&bin, &params, &job.output_path),
            }],
            2 => vec![
                PassCommand {
                    source: source.clone(),
                    encode: encoder.compose_1_2_pass(&bin, &params, &fpf),
                },
                PassCommand {
                    source,
                    encode: encoder.compose_2_2_pass(&bin, &params, &fpf, &job.output_path),
                },
            ],
            passes => {
                return Err(PipelineError::Configuration(format!(
                    "{encoder} supports 1 or 2 passes, got {passes}"
                )))
            },
        };

        Ok(EncodeStages {
            passes,
            progress: encoder.progress_pattern(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_encoder_suggests_closest_name() {
        let err = Encoder::from_name("svt-av").unwrap_err().to_string();
        assert!(err.contains("svt-av1"), "{err}");
        assert_eq!(Encoder::from_name("svt_av1").unwrap(), Encoder::svt_av1);
        assert_eq!(Encoder::from_name("x265").unwrap(), Encoder::x265);
    }

    #[test]
    fn quantizer_replaces_existing_value() {
        let params = vec!["--preset".to_owned(), "4".to_owned(), "--crf".to_owned(), "20".to_owned()];
        assert_eq!(
            Encoder::svt_av1.with_quantizer(&params, 31),
            ["--preset", "4", "--crf", "31"]
        );

        let params = vec!["--cpu-used=6".to_owned(), "--cq-level=20".to_owned()];
        assert_eq!(
            Encoder::aom.with_quantizer(&params, 28),
            ["--cpu-used=6", "--end-usage=q", "--cq-level=28"]
        );
    }

    #[test]
    fn quantizer_is_read_from_params() {
        let params = vec!["--preset".to_owned(), "4".to_owned(), "--crf".to_owned(), "27".to_owned()];
        assert_eq!(Encoder::svt_av1.quantizer(&params), Some(27));
        assert_eq!(Encoder::aom.quantizer(&["--cq-level=32".to_owned()]), Some(32));
        assert_eq!(Encoder::rav1e.quantizer(&["--speed".to_owned(), "6".to_owned()]), None);
        // the last occurrence wins, as it does for the encoders
        assert_eq!(Encoder::x264.quantizer(&Encoder::x264.with_quantizer(&params, 19)), Some(19));
    }

    #[test]
    fn registry_overrides_default_binary() {
        let registry = EncoderRegistry::default().with_executable(Encoder::x264, "/opt/x264");
        assert_eq!(registry.executable(Encoder::x264), PathBuf::from("/opt/x264"));
        assert_eq!(registry.executable(Encoder::x265), PathBuf::from("x265"));
        assert!(matches!(
            EncoderRegistry::default()
                .with_executable(Encoder::aom, "/definitely/not/aomenc")
                .resolve(Encoder::aom),
            Err(PipelineError::Configuration(_))
        ));
    }

    #[test]
    fn two_pass_composition() {
        let composer = EncoderComposer {
            encoder_settings: EncoderSettings {
                encoder:      Encoder::aom,
                passes:       2,
                video_params: vec!["--cpu-used=6".to_owned()],
            },
            ffmpeg_settings:  FfmpegSettings::default(),
            registry:         EncoderRegistry::default(),
            stats_dir:        PathBuf::from("split"),
        };
        let job = ChunkJob::new(3, "split/00003.mkv".into(), Path::new("encode"), "ivf", 10, 10);
        let stages = composer.compose(&job, Some(30)).unwrap();

        assert_eq!(stages.passes.len(), 2);
        assert_eq!(stages.progress, ProgressPattern::AomVpx);
        let second = &stages.passes[1].encode;
        assert_eq!(second[0], "aomenc");
        assert!(second.contains(&OsString::from("--pass=2")));
        assert!(second.contains(&OsString::from("--cq-level=30")));
        assert!(second.contains(&OsString::from("encode/00003.ivf")));
        assert_eq!(stages.passes[0].source[0], "ffmpeg");
    }
}
