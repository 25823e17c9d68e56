use std::path::PathBuf;

use clap::{value_parser, ArgGroup, Parser};
use clap_complete::Shell;
use parcode_core::ConcatMethod;

/// Frames per chunk when no other split method is given.
pub const DEFAULT_SPLIT_INTERVAL: usize = 240;

/// Cross-platform command-line chunked video encoding with resumable
/// sessions and per chunk target quality
#[derive(Parser, Debug)]
#[command(name = "parcode", version, about, long_about = None)]
#[command(group(ArgGroup::new("vmaf_scoring").args(["target_quality", "vmaf"]).multiple(true)))]
pub struct CliOpts {
    /// Input file to encode, or a directory to encode every video in it
    ///
    /// Can be passed multiple times to encode several inputs one after
    /// another.
    #[arg(short, long = "input", required_unless_present = "completions")]
    pub input: Vec<PathBuf>,

    /// Output file, or the output directory when encoding several inputs
    ///
    /// Defaults to `<input stem>_<encoder>.mkv` in the current directory.
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Session directory for split chunks, encoded chunks and progress
    ///
    /// Defaults to `.parcode-<input stem>` in the current directory.
    #[arg(long)]
    pub temp: Option<PathBuf>,

    /// Resume the previous session from the session directory
    #[arg(short, long)]
    pub resume: bool,

    /// Do not delete the session directory after a successful encode
    #[arg(short, long)]
    pub keep: bool,

    /// Start over if the previous session's done.json cannot be read
    #[arg(long)]
    pub discard_corrupt_checkpoint: bool,

    /// Number of workers, 0 picks a count from available memory and cores
    #[arg(short, long, default_value_t = 0)]
    pub workers: usize,

    /// Video encoder to use [aom, rav1e, svt-av1, vpx, x264, x265]
    ///
    /// Defaults to aom, or the encoder of `--config`.
    #[arg(short, long)]
    pub encoder: Option<String>,

    /// Number of encoder passes
    #[arg(short, long, value_parser = value_parser!(u8).range(1..=2))]
    pub passes: Option<u8>,

    /// Parameters for the video encoder, as one shell quoted string
    #[arg(short, long, allow_hyphen_values = true)]
    pub video_params: Option<String>,

    /// FFmpeg filter arguments applied to every chunk, e.g. "-vf crop=..."
    #[arg(short = 'f', long = "ffmpeg", allow_hyphen_values = true)]
    pub ffmpeg_filter_args: Option<String>,

    /// FFmpeg audio parameters
    #[arg(short, long, allow_hyphen_values = true)]
    pub audio_params: Option<String>,

    /// Pixel format the chunks are piped to the encoder in
    #[arg(long)]
    pub pix_format: Option<String>,

    /// Read split points from a scenes JSON file
    #[arg(long, conflicts_with_all = ["split_interval", "split_command"])]
    pub scenes: Option<PathBuf>,

    /// Split the input into chunks of this many frames
    #[arg(long, conflicts_with = "split_command")]
    pub split_interval: Option<usize>,

    /// Command printing split frame offsets to stdout, run with the input
    /// path as its last argument
    #[arg(long)]
    pub split_command: Option<String>,

    /// Maximum chunk length in frames, longer chunks are split evenly
    #[arg(short = 'x', long)]
    pub extra_split: Option<usize>,

    /// Do not probe encoded chunks, trust the encoder to have encoded every
    /// frame
    #[arg(long)]
    pub trust_encoder: bool,

    /// Attempts per chunk before it is left unresolved
    #[arg(long, default_value_t = 3)]
    pub max_tries: usize,

    /// Abort the run after this many failed encodes across all chunks
    #[arg(long)]
    pub max_failures: Option<usize>,

    /// Target VMAF score, searches a quantizer per chunk that reaches it
    #[arg(long)]
    pub target_quality: Option<f64>,

    /// Lowest quantizer target quality may pick
    #[arg(long, requires = "target_quality")]
    pub min_q: Option<u32>,

    /// Highest quantizer target quality may pick
    #[arg(long, requires = "target_quality")]
    pub max_q: Option<u32>,

    /// Number of probes per chunk, at least 4
    #[arg(long, requires = "target_quality")]
    pub probes: Option<u32>,

    /// Only score every n-th frame of a probe
    #[arg(long, requires = "target_quality")]
    pub probing_rate: Option<usize>,

    /// Path to a VMAF model file
    #[arg(long, requires = "vmaf_scoring")]
    pub vmaf_path: Option<PathBuf>,

    /// Threads used by libvmaf, 0 picks a count from available cores
    #[arg(long, requires = "vmaf_scoring")]
    pub vmaf_threads: Option<usize>,

    /// Plot the probes of every chunk as an SVG in the session directory
    #[arg(long, requires = "target_quality")]
    pub plot_probes: bool,

    /// Score the finished output against the input with VMAF
    ///
    /// Writes `<output>.vmaf.json` and a plot of it, `<output>.vmaf.svg`.
    /// Always on with `--target-quality`.
    #[arg(long)]
    pub vmaf: bool,

    /// Lower the quantizer of dark chunks
    ///
    /// Needs a quantizer in the video parameters, or `--target-quality`.
    #[arg(long)]
    pub boost: bool,

    /// Quantizer reduction for a completely black chunk [default: 15]
    #[arg(long, requires = "boost")]
    pub boost_range: Option<u32>,

    /// Quantizer boosting never goes below [default: 10]
    #[arg(long, requires = "boost")]
    pub boost_limit: Option<u32>,

    /// Method used to join the encoded chunks [ffmpeg, mkvmerge]
    #[arg(short, long)]
    pub concat: Option<ConcatMethod>,

    /// Executable to run an encoder with, e.g. `svt-av1=/opt/svt/SvtAv1EncApp`
    #[arg(long = "encoder-path", value_name = "NAME=PATH")]
    pub encoder_paths: Vec<String>,

    /// Load encode settings from a JSON file, explicit flags take precedence
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Save the effective encode settings to a JSON file
    #[arg(long)]
    pub save_config: Option<PathBuf>,

    /// Log file, written at debug level [default: ./logs/parcode.log]
    #[arg(long)]
    pub log_file: Option<PathBuf>,

    /// Console log level, `RUST_LOG` takes precedence
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Only log warnings and errors to the console and hide the progress bar
    #[arg(short, long)]
    pub quiet: bool,

    /// Print shell completions and exit
    #[arg(long, value_enum)]
    pub completions: Option<Shell>,
}
