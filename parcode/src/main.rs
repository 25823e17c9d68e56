mod cli;
mod config;
mod logging;

use std::{
    env,
    fs,
    io,
    panic,
    path::{Path, PathBuf},
    process::{self, ExitCode},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use anyhow::{ensure, Context};
use clap::{CommandFactory, Parser};
use parcode_core::{EncodeContext, Encoder, InputOutputSettings, RunSettings};
use tracing::{debug, error, info, level_filters::LevelFilter, warn};

use crate::{
    cli::CliOpts,
    config::{boost, encoder_registry, split_settings, target_quality, vmaf_report, EncodeConfig},
    logging::init_logging,
};

pub const DEFAULT_LOG_PATH: &str = "./logs/parcode.log";

const VIDEO_EXTENSIONS: &[&str] = &[
    "avi", "flv", "m2ts", "m4v", "mkv", "mov", "mp4", "mpeg", "mpg", "ts", "webm", "wmv", "y4m",
];

fn main() -> ExitCode {
    let orig_hook = panic::take_hook();
    // Catch panics in child threads
    panic::set_hook(Box::new(move |panic_info| {
        orig_hook(panic_info);
        process::exit(1);
    }));

    let opts = CliOpts::parse();
    if let Some(shell) = opts.completions {
        clap_complete::generate(shell, &mut CliOpts::command(), "parcode", &mut io::stdout());
        return ExitCode::SUCCESS;
    }

    match run(&opts) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("Error: {e:?}");
            ExitCode::FAILURE
        },
    }
}

/// Encodes every input. Returns whether all of them were completed.
fn run(opts: &CliOpts) -> anyhow::Result<bool> {
    let console_level = if opts.quiet {
        LevelFilter::WARN
    } else {
        opts.log_level
            .parse()
            .with_context(|| format!("Invalid log level {:?}", opts.log_level))?
    };
    let cwd = env::current_dir()?;
    let log_file = opts.log_file.clone().unwrap_or_else(|| cwd.join(DEFAULT_LOG_PATH));
    let _guard = init_logging(console_level, &log_file, LevelFilter::DEBUG)?;

    let config = EncodeConfig::from_opts(opts)?;
    if let Some(path) = &opts.save_config {
        config.save(path)?;
        info!("saved encode settings to {path:?}");
    }
    let registry = encoder_registry(opts)?;
    let split = split_settings(opts)?;
    let tq = target_quality(opts, config.encoder.encoder)?;
    let boost = boost(opts);
    let vmaf_report = vmaf_report(opts);

    let inputs = collect_inputs(&opts.input)?;
    ensure!(!inputs.is_empty(), "no video files found in {:?}", opts.input);
    let queue_mode = inputs.len() > 1 || opts.input.iter().any(|path| path.is_dir());
    debug!("encoding {} input(s), queue mode: {queue_mode}", inputs.len());

    let cancel = Arc::new(AtomicBool::new(false));
    {
        let cancel = Arc::clone(&cancel);
        ctrlc::set_handler(move || {
            if !cancel.swap(true, Ordering::SeqCst) {
                warn!("interrupted, stopping running encoders. Use --resume to continue later");
            }
        })
        .context("Failed to install the Ctrl-C handler")?;
    }

    let mut all_complete = true;
    for input in &inputs {
        let output_file = output_path(opts, input, config.encoder.encoder, queue_mode);
        let mut context = EncodeContext {
            encoder_settings: config.encoder.clone(),
            io_settings:      InputOutputSettings {
                input:       input.clone(),
                temp:        temp_path(opts, input, queue_mode),
                output_file: output_file.clone(),
            },
            run_settings:     RunSettings {
                resume:                     opts.resume,
                keep:                       opts.keep,
                discard_corrupt_checkpoint: opts.discard_corrupt_checkpoint,
                trust_encoder:              opts.trust_encoder,
                max_tries:                  opts.max_tries,
                max_failures:               opts.max_failures,
                workers:                    opts.workers,
                show_progress:              !opts.quiet,
            },
            split_settings:   split.clone(),
            tq_settings:      tq.clone(),
            ffmpeg_settings:  config.ffmpeg.clone(),
            registry:         registry.clone(),
            boost,
            vmaf_report:      vmaf_report.clone(),
            cancel:           Arc::clone(&cancel),
        };

        match context.encode_file() {
            Ok(summary) if summary.is_complete() => {
                info!("finished encoding {input:?} into {output_file:?}");
            },
            Ok(summary) => {
                all_complete = false;
                error!(
                    "{input:?}: {} of {} chunks were not encoded",
                    summary.chunks - summary.committed,
                    summary.chunks
                );
            },
            Err(e) if !queue_mode => return Err(e),
            Err(e) => {
                all_complete = false;
                error!("failed to encode {input:?}: {e:#}");
            },
        }

        if cancel.load(Ordering::SeqCst) {
            break;
        }
    }

    Ok(all_complete)
}

/// Expands directories into the video files directly inside them, sorted by
/// name.
fn collect_inputs(paths: &[PathBuf]) -> anyhow::Result<Vec<PathBuf>> {
    let mut inputs = Vec::new();
    for path in paths {
        if !path.is_dir() {
            inputs.push(path.clone());
            continue;
        }

        let mut videos = fs::read_dir(path)
            .with_context(|| format!("Failed to read input directory {path:?}"))?
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|file| file.is_file() && is_video(file))
            .collect::<Vec<_>>();
        videos.sort();
        inputs.extend(videos);
    }
    Ok(inputs)
}

fn is_video(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| VIDEO_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
}

fn file_stem(input: &Path) -> String {
    input.file_stem().map_or_else(|| "output".to_owned(), |stem| stem.to_string_lossy().into_owned())
}

fn output_path(opts: &CliOpts, input: &Path, encoder: Encoder, queue_mode: bool) -> PathBuf {
    let name = format!("{}_{encoder}.mkv", file_stem(input));
    match (&opts.output, queue_mode) {
        (Some(output), false) => output.clone(),
        (Some(dir), true) => dir.join(name),
        (None, _) => env::current_dir().unwrap_or_default().join(name),
    }
}

fn temp_path(opts: &CliOpts, input: &Path, queue_mode: bool) -> PathBuf {
    let name = format!(".parcode-{}", file_stem(input));
    match (&opts.temp, queue_mode) {
        (Some(temp), false) => temp.clone(),
        (Some(dir), true) => dir.join(name),
        (None, _) => PathBuf::from(name),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directories_expand_to_sorted_videos() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["b.mkv", "a.MP4", "notes.txt", "c.y4m"] {
            fs::write(dir.path().join(name), b"").unwrap();
        }
        fs::create_dir(dir.path().join("nested.mkv")).unwrap();

        let inputs = collect_inputs(&[dir.path().to_owned()]).unwrap();
        let names: Vec<_> = inputs.iter().map(|p| p.file_name().unwrap().to_owned()).collect();

        assert_eq!(names, ["a.MP4", "b.mkv", "c.y4m"]);
    }

    #[test]
    fn queue_outputs_are_named_after_input_and_encoder() {
        let opts = CliOpts::try_parse_from(["parcode", "-i", "videos", "-o", "out"]).unwrap();
        assert_eq!(
            output_path(&opts, Path::new("videos/clip.mp4"), Encoder::svt_av1, true),
            PathBuf::from("out/clip_svt-av1.mkv")
        );
        assert_eq!(
            temp_path(&opts, Path::new("videos/clip.mp4"), true),
            PathBuf::from(".parcode-clip")
        );
    }
}
