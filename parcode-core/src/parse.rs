use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

static AOM_VPX_FRAMES: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"frame\s+\d+/(\d+)").expect("valid regex"));
static RAV1E_FRAMES: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"encoded\s+(\d+)\s+frames").expect("valid regex"));
static SVT_AV1_FRAMES: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Encoding(?: frame|:)\s+(\d+)").expect("valid regex"));
static X26X_FRAMES: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+)(?:/\d+)?\s+frames").expect("valid regex"));

/// Shape of the progress lines an encoder writes to stderr.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ProgressPattern {
    AomVpx,
    Rav1e,
    SvtAv1,
    X26x,
    /// The encoder reports nothing usable while running.
    #[default]
    None,
}

/// Number of frames encoded so far according to `line`.
#[inline]
pub fn parse_encoded_frames(pattern: ProgressPattern, line: &str) -> Option<usize> {
    let regex = match pattern {
        ProgressPattern::AomVpx => &AOM_VPX_FRAMES,
        ProgressPattern::Rav1e => &RAV1E_FRAMES,
        ProgressPattern::SvtAv1 => &SVT_AV1_FRAMES,
        ProgressPattern::X26x => &X26X_FRAMES,
        ProgressPattern::None => return None,
    };

    regex.captures(line)?.get(1)?.as_str().parse().ok()
}

/// Turns an encoder's progress lines into frame deltas.
///
/// Only increases of the parsed frame count are reported; a value lower than
/// the last one seen is treated as no progress.
#[derive(Debug, Clone)]
pub struct ProgressParser {
    pattern: ProgressPattern,
    frames:  usize,
}

impl ProgressParser {
    #[inline]
    pub const fn new(pattern: ProgressPattern) -> Self {
        Self {
            pattern,
            frames: 0,
        }
    }

    /// Highest frame count observed so far.
    #[inline]
    pub const fn frames(&self) -> usize {
        self.frames
    }

    #[inline]
    pub fn parse_progress(&mut self, line: &str) -> Option<usize> {
        let new = parse_encoded_frames(self.pattern, line)?;
        if new > self.frames {
            let delta = new - self.frames;
            self.frames = new;
            Some(delta)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encoder_lines() {
        assert_eq!(
            parse_encoded_frames(
                ProgressPattern::AomVpx,
                "Pass 2/2 frame  142/141   120846B    6807 ms 20.86 fps [ETA  unknown]"
            ),
            Some(141)
        );
        assert_eq!(
            parse_encoded_frames(
                ProgressPattern::Rav1e,
                "encoded 52 frames, 10.461 fps, 2371.41 Kb/s, est. size: 0.61 MB"
            ),
            Some(52)
        );
        assert_eq!(
            parse_encoded_frames(ProgressPattern::SvtAv1, "Encoding frame  240 1.23 kbps"),
            Some(240)
        );
        assert_eq!(
            parse_encoded_frames(
                ProgressPattern::X26x,
                "[ 5.1%] 51/1000 frames, 25.00 fps, 1234.56 kb/s, eta 0:00:38"
            ),
            Some(51)
        );
        assert_eq!(
            parse_encoded_frames(ProgressPattern::X26x, "17 frames: 4.12 fps, 920.11 kb/s"),
            Some(17)
        );
        assert_eq!(parse_encoded_frames(ProgressPattern::Rav1e, "garbage"), None);
        assert_eq!(parse_encoded_frames(ProgressPattern::None, "encoded 5 frames"), None);
    }

    #[test]
    fn regression_is_not_progress() {
        let mut parser = ProgressParser::new(ProgressPattern::Rav1e);
        assert_eq!(parser.parse_progress("encoded 10 frames"), Some(10));
        assert_eq!(parser.parse_progress("encoded 25 frames"), Some(15));
        assert_eq!(parser.parse_progress("encoded 3 frames"), None);
        assert_eq!(parser.parse_progress("encoded 25 frames"), None);
        assert_eq!(parser.parse_progress("encoded 30 frames"), Some(5));
        assert_eq!(parser.frames(), 30);
    }
}
