use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::{concat::ConcatMethod, encoder::Encoder};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncoderSettings {
    pub encoder:      Encoder,
    pub passes:       u8,
    pub video_params: Vec<String>,
}

impl Default for EncoderSettings {
    #[inline]
    fn default() -> Self {
        Self {
            encoder:      Encoder::aom,
            passes:       Encoder::aom.default_passes(),
            video_params: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct InputOutputSettings {
    pub input:       PathBuf,
    /// Session directory holding split chunks, encoded chunks and state files.
    pub temp:        PathBuf,
    pub output_file: PathBuf,
}

#[derive(Debug, Clone)]
pub struct RunSettings {
    pub resume:                     bool,
    pub keep:                       bool,
    /// Start over when `done.json` exists but cannot be read, instead of
    /// refusing to run.
    pub discard_corrupt_checkpoint: bool,
    /// Commit the source frame count without probing the encoded output.
    pub trust_encoder:              bool,
    pub max_tries:                  usize,
    /// Encoder failures tolerated across all chunks before the run is
    /// aborted. `None` never aborts.
    pub max_failures:               Option<usize>,
    /// 0 picks a worker count from available memory and cores.
    pub workers:                    usize,
    pub show_progress:              bool,
}

impl Default for RunSettings {
    #[inline]
    fn default() -> Self {
        Self {
            resume:                     false,
            keep:                       false,
            discard_corrupt_checkpoint: false,
            trust_encoder:              false,
            max_tries:                  3,
            max_failures:               None,
            workers:                    0,
            show_progress:              false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SplitMethod {
    /// The whole source is one chunk.
    #[default]
    None,
    Interval(usize),
    ScenesFile(PathBuf),
    /// External scene detector; receives the source path as its last argument
    /// and prints frame offsets to stdout.
    Command(Vec<String>),
}

#[derive(Debug, Clone, Default)]
pub struct SplitSettings {
    pub method:      SplitMethod,
    /// Maximum chunk length in frames; longer scenes are subdivided.
    pub extra_split: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FfmpegSettings {
    pub filter_args:  Vec<String>,
    pub audio_params: Vec<String>,
    pub pix_format:   String,
    pub concat:       ConcatMethod,
}

impl Default for FfmpegSettings {
    #[inline]
    fn default() -> Self {
        Self {
            filter_args:  Vec::new(),
            audio_params: vec!["-c:a".to_owned(), "copy".to_owned()],
            pix_format:   "yuv420p10le".to_owned(),
            concat:       ConcatMethod::default(),
        }
    }
}

/// Scores the finished output against the input with VMAF.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VmafReport {
    pub model:   Option<PathBuf>,
    /// 0 picks a count from available cores.
    pub threads: usize,
}
