use std::{
    fs,
    path::{Path, PathBuf},
    process::Command,
};

use anyhow::{ensure, Context};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString, IntoStaticStr};
use tracing::debug;

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Default,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    IntoStaticStr,
)]
#[strum(serialize_all = "lowercase")]
pub enum ConcatMethod {
    #[default]
    #[serde(rename = "ffmpeg")]
    FFmpeg,
    #[serde(rename = "mkvmerge")]
    MKVMerge,
}

impl ConcatMethod {
    #[inline]
    pub const fn bin(self) -> &'static str {
        match self {
            Self::FFmpeg => "ffmpeg",
            Self::MKVMerge => "mkvmerge",
        }
    }
}

/// Joins the encoded chunks into the final output.
pub trait Remuxer: Sync {
    /// `outputs` are in presentation order.
    fn concatenate(
        &self,
        outputs: &[PathBuf],
        destination: &Path,
        audio: Option<&Path>,
    ) -> anyhow::Result<()>;
}

#[derive(Debug, Clone)]
pub struct Concatenator {
    pub method: ConcatMethod,
    /// Directory for the concat list / options file.
    pub temp:   PathBuf,
}

impl Remuxer for Concatenator {
    #[tracing::instrument(level = "debug", skip(self, outputs))]
    #[inline]
    fn concatenate(
        &self,
        outputs: &[PathBuf],
        destination: &Path,
        audio: Option<&Path>,
    ) -> anyhow::Result<()> {
        ensure!(!outputs.is_empty(), "there are no encoded chunks to concatenate");
        debug!(
            "concatenating {} chunks with {method}",
            outputs.len(),
            method = self.method
        );
        match self.method {
            ConcatMethod::FFmpeg => ffmpeg(&self.temp, outputs, destination, audio),
            ConcatMethod::MKVMerge => mkvmerge(&self.temp, outputs, destination, audio),
        }
    }
}

fn ffmpeg(
    temp: &Path,
    outputs: &[PathBuf],
    destination: &Path,
    audio: Option<&Path>,
) -> anyhow::Result<()> {
    let list_path = temp.join("concat.txt");
    let mut list = String::with_capacity(outputs.len() * 64);
    for output in outputs {
        let output = output
            .canonicalize()
            .with_context(|| format!("Encoded chunk {output:?} is missing"))?;
        // single quotes are escaped by closing the quote, escaping, reopening
        let escaped = output.to_string_lossy().replace('\'', r"'\''");
        list.push_str("file '");
        list.push_str(&escaped);
        list.push_str("'\n");
    }
    fs::write(&list_path, list).with_context(|| format!("Failed to write {list_path:?}"))?;

    let mut cmd = Command::new("ffmpeg");
    cmd.args(["-y", "-hide_banner", "-loglevel", "error", "-nostdin"])
        .args(["-f", "concat", "-safe", "0", "-i"])
        .arg(&list_path);
    if let Some(audio) = audio {
        cmd.arg("-i").arg(audio).args(["-map", "0:v", "-map", "1:a"]);
    } else {
        cmd.args(["-map", "0:v"]);
    }
    cmd.args(["-c", "copy"]).arg(destination);

    let output = cmd.output().context("Failed to run ffmpeg. Is ffmpeg installed?")?;
    ensure!(
        output.status.success(),
        "ffmpeg concatenation failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    Ok(())
}

fn mkvmerge(
    temp: &Path,
    outputs: &[PathBuf],
    destination: &Path,
    audio: Option<&Path>,
) -> anyhow::Result<()> {
    // mkvmerge reads its arguments from a JSON array, which avoids command
    // line length limits with many chunks
    let mut args = vec![
        "--quiet".to_owned(),
        "--output".to_owned(),
        destination.to_string_lossy().into_owned(),
    ];
    for (i, output) in outputs.iter().enumerate() {
        if i > 0 {
            args.push("+".to_owned());
        }
        args.push(output.to_string_lossy().into_owned());
    }
    if let Some(audio) = audio {
        args.push(audio.to_string_lossy().into_owned());
    }

    let options_path = temp.join("options.json");
    fs::write(&options_path, serde_json::to_vec_pretty(&args)?)
        .with_context(|| format!("Failed to write {options_path:?}"))?;

    let mut option_arg = std::ffi::OsString::from("@");
    option_arg.push(&options_path);
    let output = Command::new("mkvmerge")
        .arg(option_arg)
        .output()
        .context("Failed to run mkvmerge. Is it installed?")?;
    // 1 means warnings only
    ensure!(
        matches!(output.status.code(), Some(0 | 1)),
        "mkvmerge concatenation failed: {}",
        String::from_utf8_lossy(&output.stdout)
    );
    Ok(())
}
