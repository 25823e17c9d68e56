//! Chunked video encoding: split a source into independently encodable
//! chunks, encode them in parallel through external encoder pipelines,
//! checkpoint verified chunks for resuming, and optionally search a per
//! chunk quality parameter that reaches a target VMAF score.

pub use crate::{
    audit::{AuditOutcome, Auditor},
    boost::{Boost, BrightnessProber, FfmpegBrightness},
    broker::{Broker, ChunkRunner, CompletionSink, EncoderCrash, JobResult, RunError},
    checkpoint::{CheckpointRecord, CheckpointStore},
    chunk::{ChunkJob, ChunkSetBuilder, ChunkState},
    concat::{ConcatMethod, Concatenator, Remuxer},
    context::{EncodeContext, Pipeline, RunSummary},
    encoder::{CommandComposer, EncodeStages, Encoder, EncoderComposer, EncoderRegistry, PassCommand},
    error::PipelineError,
    ffmpeg::{AudioExtractor, FfmpegAudio, FfmpegProber, FfmpegSegmenter, FrameProber},
    parse::{ProgressParser, ProgressPattern},
    pipes::ProcessRunner,
    progress::{ProgressCounter, ProgressEvent},
    settings::{
        EncoderSettings,
        FfmpegSettings,
        InputOutputSettings,
        RunSettings,
        SplitMethod,
        SplitSettings,
        VmafReport,
    },
    split::{Segmenter, Splitter},
    target_quality::{ParameterScale, ProbeSample, QualityScorer, Resolution, TargetQuality},
    vmaf::{OutputScorer, Vmaf, VmafScorer},
};

pub mod audit;
pub mod boost;
pub mod broker;
pub mod checkpoint;
pub mod chunk;
pub mod concat;
pub mod context;
pub mod encoder;
pub mod error;
pub mod ffmpeg;
pub mod interpol;
pub mod parse;
pub mod pipes;
pub mod progress;
pub mod settings;
pub mod split;
pub mod target_quality;
pub mod vmaf;

/// Builds a `Vec` converting every element with `Into`, mostly used to
/// assemble `Vec<OsString>` command lines.
#[macro_export]
macro_rules! into_vec {
  ($($x:expr),* $(,)?) => {
    vec![
      $(
        $x.into(),
      )*
    ]
  };
}

/// Creates a directory (and its parents), logging the failure.
#[macro_export]
macro_rules! create_dir {
    ($loc:expr) => {
        match std::fs::create_dir_all(&$loc) {
            Ok(()) => Ok(()),
            Err(e) => {
                tracing::error!("Error while creating directory {:?}: {}", &$loc, e);
                Err(e)
            },
        }
    };
}
