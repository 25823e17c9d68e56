use std::{
    fs,
    io,
    path::{Path, PathBuf},
};

use parcode_core::{
    Boost,
    Encoder,
    EncoderRegistry,
    EncoderSettings,
    FfmpegSettings,
    PipelineError,
    SplitMethod,
    SplitSettings,
    TargetQuality,
    VmafReport,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cli::{CliOpts, DEFAULT_SPLIT_INTERVAL};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path:?}: {source}")]
    Read { path: PathBuf, source: io::Error },

    #[error("failed to write config {path:?}: {source}")]
    Write { path: PathBuf, source: io::Error },

    #[error("invalid config {path:?}: {source}")]
    Parse {
        path:   PathBuf,
        source: serde_json::Error,
    },

    #[error("unbalanced quotes in {0:?}")]
    Quoting(String),

    #[error("expected NAME=PATH, got {0:?}")]
    EncoderPath(String),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}

/// The encode settings `--save-config` writes and `--config` reads.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncodeConfig {
    pub encoder: EncoderSettings,
    pub ffmpeg:  FfmpegSettings,
}

impl EncodeConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_owned(),
            source,
        })?;
        serde_json::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_owned(),
            source,
        })
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let mut buffer = vec![];
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
        let mut serializer = serde_json::Serializer::with_formatter(&mut buffer, formatter);
        self.serialize(&mut serializer).map_err(|source| ConfigError::Parse {
            path: path.to_owned(),
            source,
        })?;
        fs::write(path, buffer).map_err(|source| ConfigError::Write {
            path: path.to_owned(),
            source,
        })
    }

    /// Starts from the `--config` file, if any, and applies every flag that
    /// was given on top of it.
    pub fn from_opts(opts: &CliOpts) -> Result<Self, ConfigError> {
        let mut config = match &opts.config {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };

        if let Some(name) = &opts.encoder {
            let encoder = Encoder::from_name(name)?;
            if encoder != config.encoder.encoder {
                // parameters of one encoder mean nothing to another
                config.encoder = EncoderSettings {
                    encoder,
                    passes: encoder.default_passes(),
                    video_params: Vec::new(),
                };
            }
        }
        if let Some(passes) = opts.passes {
            config.encoder.passes = passes;
        }
        if let Some(params) = &opts.video_params {
            config.encoder.video_params = split_args(params)?;
        }
        if let Some(args) = &opts.ffmpeg_filter_args {
            config.ffmpeg.filter_args = split_args(args)?;
        }
        if let Some(params) = &opts.audio_params {
            config.ffmpeg.audio_params = split_args(params)?;
        }
        if let Some(pix_format) = &opts.pix_format {
            config.ffmpeg.pix_format.clone_from(pix_format);
        }
        if let Some(concat) = opts.concat {
            config.ffmpeg.concat = concat;
        }

        Ok(config)
    }
}

/// Splits a parameter string the way a POSIX shell would.
pub fn split_args(args: &str) -> Result<Vec<String>, ConfigError> {
    shlex::split(args).ok_or_else(|| ConfigError::Quoting(args.to_owned()))
}

pub fn split_settings(opts: &CliOpts) -> Result<SplitSettings, ConfigError> {
    let method = if let Some(scenes) = &opts.scenes {
        SplitMethod::ScenesFile(scenes.clone())
    } else if let Some(command) = &opts.split_command {
        SplitMethod::Command(split_args(command)?)
    } else {
        SplitMethod::Interval(opts.split_interval.unwrap_or(DEFAULT_SPLIT_INTERVAL))
    };

    Ok(SplitSettings {
        method,
        extra_split: opts.extra_split,
    })
}

pub fn encoder_registry(opts: &CliOpts) -> Result<EncoderRegistry, ConfigError> {
    let mut registry = EncoderRegistry::default();
    for entry in &opts.encoder_paths {
        let Some((name, path)) = entry.split_once('=') else {
            return Err(ConfigError::EncoderPath(entry.clone()));
        };
        if path.is_empty() {
            return Err(ConfigError::EncoderPath(entry.clone()));
        }
        registry.insert(Encoder::from_name(name.trim())?, path);
    }
    Ok(registry)
}

/// Target quality settings, checked before any work starts.
pub fn target_quality(
    opts: &CliOpts,
    encoder: Encoder,
) -> Result<Option<TargetQuality>, ConfigError> {
    let Some(target) = opts.target_quality else {
        return Ok(None);
    };

    let mut tq = TargetQuality::new(target, encoder);
    if let Some(min_q) = opts.min_q {
        tq.min_q = min_q;
    }
    if let Some(max_q) = opts.max_q {
        tq.max_q = max_q;
    }
    if let Some(probes) = opts.probes {
        tq.probes = probes;
    }
    if let Some(rate) = opts.probing_rate {
        tq.probing_rate = rate;
    }
    if let Some(threads) = opts.vmaf_threads {
        tq.vmaf_threads = threads;
    }
    tq.vmaf_path.clone_from(&opts.vmaf_path);
    tq.plot_probes = opts.plot_probes;

    tq.validate()?;
    Ok(Some(tq))
}

/// Dark chunk boosting, off unless `--boost` is given.
pub fn boost(opts: &CliOpts) -> Option<Boost> {
    if !opts.boost {
        return None;
    }
    let mut boost = Boost::default();
    if let Some(range) = opts.boost_range {
        boost.range = range;
    }
    if let Some(limit) = opts.boost_limit {
        boost.limit = limit;
    }
    Some(boost)
}

/// Whole output scoring, implied by target quality.
pub fn vmaf_report(opts: &CliOpts) -> Option<VmafReport> {
    (opts.vmaf || opts.target_quality.is_some()).then(|| VmafReport {
        model:   opts.vmaf_path.clone(),
        threads: opts.vmaf_threads.unwrap_or(0),
    })
}

#[cfg(test)]
mod tests {
    use clap::Parser;
    use parcode_core::ConcatMethod;

    use super::*;

    fn opts(args: &[&str]) -> CliOpts {
        CliOpts::try_parse_from(["parcode", "-i", "in.mkv"].iter().chain(args)).unwrap()
    }

    #[test]
    fn flags_override_the_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let saved = EncodeConfig {
            encoder: EncoderSettings {
                encoder:      Encoder::svt_av1,
                passes:       1,
                video_params: vec!["--preset".into(), "6".into()],
            },
            ffmpeg:  FfmpegSettings {
                concat: ConcatMethod::MKVMerge,
                ..FfmpegSettings::default()
            },
        };
        saved.save(&path).unwrap();
        assert_eq!(EncodeConfig::load(&path).unwrap(), saved);

        let config = EncodeConfig::from_opts(&opts(&[
            "--config",
            path.to_str().unwrap(),
            "-v",
            "--preset 4 --crf 28",
        ]))
        .unwrap();

        assert_eq!(config.encoder.encoder, Encoder::svt_av1);
        assert_eq!(config.encoder.video_params, ["--preset", "4", "--crf", "28"]);
        assert_eq!(config.ffmpeg.concat, ConcatMethod::MKVMerge);
    }

    #[test]
    fn switching_encoder_drops_its_params() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        EncodeConfig {
            encoder: EncoderSettings {
                encoder:      Encoder::aom,
                passes:       2,
                video_params: vec!["--cpu-used=6".into()],
            },
            ..EncodeConfig::default()
        }
        .save(&path)
        .unwrap();

        let config =
            EncodeConfig::from_opts(&opts(&["--config", path.to_str().unwrap(), "-e", "x264"]))
                .unwrap();

        assert_eq!(config.encoder.encoder, Encoder::x264);
        assert_eq!(config.encoder.passes, Encoder::x264.default_passes());
        assert!(config.encoder.video_params.is_empty());
    }

    #[test]
    fn unbalanced_quotes_are_rejected() {
        assert!(matches!(
            EncodeConfig::from_opts(&opts(&["-v", "--tune \"psnr"])),
            Err(ConfigError::Quoting(_))
        ));
    }

    #[test]
    fn default_split_is_a_fixed_interval() {
        assert_eq!(
            split_settings(&opts(&[])).unwrap().method,
            SplitMethod::Interval(DEFAULT_SPLIT_INTERVAL)
        );
        assert_eq!(
            split_settings(&opts(&["--split-command", "detect --fast"])).unwrap().method,
            SplitMethod::Command(vec!["detect".into(), "--fast".into()])
        );
    }

    #[test]
    fn encoder_paths_are_parsed() {
        let registry =
            encoder_registry(&opts(&["--encoder-path", "svt-av1=/opt/svt/SvtAv1EncApp"])).unwrap();
        assert_eq!(
            registry.executable(Encoder::svt_av1),
            PathBuf::from("/opt/svt/SvtAv1EncApp")
        );
        assert!(encoder_registry(&opts(&["--encoder-path", "svt-av1"])).is_err());
    }

    #[test]
    fn boost_flags_override_defaults() {
        assert_eq!(boost(&opts(&[])), None);
        assert_eq!(boost(&opts(&["--boost"])), Some(Boost::default()));
        assert_eq!(
            boost(&opts(&["--boost", "--boost-limit", "20"])),
            Some(Boost {
                limit: 20,
                ..Boost::default()
            })
        );
    }

    #[test]
    fn target_quality_scores_the_output() {
        assert_eq!(vmaf_report(&opts(&[])), None);
        assert_eq!(
            vmaf_report(&opts(&["--target-quality", "95", "--vmaf-path", "model.json"])),
            Some(VmafReport {
                model:   Some(PathBuf::from("model.json")),
                threads: 0,
            })
        );
        assert!(vmaf_report(&opts(&["--vmaf"])).is_some());
    }

    #[test]
    fn too_few_probes_are_rejected() {
        let opts = opts(&["--target-quality", "95", "--probes", "3"]);
        assert!(matches!(
            target_quality(&opts, Encoder::svt_av1),
            Err(ConfigError::Pipeline(PipelineError::Configuration(_)))
        ));
    }
}
