use std::{
    cmp,
    num::NonZeroUsize,
    path::PathBuf,
    thread::available_parallelism,
};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{chunk::ChunkJob, encoder::Encoder, error::PipelineError, interpol::Pchip};

/// Number of points the interpolated curve is sampled at.
const SCAN_POINTS: usize = 1000;

/// Which end of the parameter range gives the better quality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ParameterScale {
    /// Higher values mean lower quality (crf, cq-level, quantizer).
    #[default]
    Quantizer,
    /// Higher values mean higher quality.
    Quality,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetQuality {
    /// VMAF score each chunk should reach.
    pub target:       f64,
    pub min_q:        u32,
    pub max_q:        u32,
    pub probes:       u32,
    #[serde(default)]
    pub scale:        ParameterScale,
    /// Score every n-th frame of a probe.
    pub probing_rate: usize,
    pub vmaf_path:    Option<PathBuf>,
    /// 0 picks a count from the number of workers.
    #[serde(default)]
    pub vmaf_threads: usize,
    #[serde(default)]
    pub plot_probes:  bool,
}

impl TargetQuality {
    #[inline]
    pub fn new(target: f64, encoder: Encoder) -> Self {
        let (min_q, max_q) = encoder.default_cq_range();
        Self {
            target,
            min_q,
            max_q,
            probes: 4,
            scale: ParameterScale::Quantizer,
            probing_rate: 1,
            vmaf_path: None,
            vmaf_threads: 0,
            plot_probes: false,
        }
    }

    #[inline]
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.probes < 4 {
            return Err(PipelineError::Configuration(format!(
                "target quality needs at least 4 probes, got {}",
                self.probes
            )));
        }
        if self.min_q > self.max_q {
            return Err(PipelineError::Configuration(format!(
                "min-q ({}) must not be greater than max-q ({})",
                self.min_q, self.max_q
            )));
        }
        if !(self.target.is_finite() && self.target > 0.0) {
            return Err(PipelineError::Configuration(format!(
                "invalid target score {}",
                self.target
            )));
        }
        if self.probing_rate == 0 {
            return Err(PipelineError::Configuration("probing rate must be at least 1".into()));
        }
        Ok(())
    }

    /// Evenly spaced parameters over `[min_q, max_q]`, lowest quality first.
    fn candidates(&self) -> Vec<u32> {
        let span = u64::from(self.max_q - self.min_q);
        let steps = u64::from(self.probes - 1);
        let mut candidates: Vec<u32> = (0..=steps)
            .map(|i| self.min_q + (span * i / steps) as u32)
            .collect();
        candidates.dedup();
        if self.scale == ParameterScale::Quantizer {
            candidates.reverse();
        }
        candidates
    }

    /// Orders parameters from lowest to highest quality.
    fn quality_rank(&self, param: u32) -> i64 {
        match self.scale {
            ParameterScale::Quantizer => -i64::from(param),
            ParameterScale::Quality => i64::from(param),
        }
    }

    /// Searches the parameter whose score is closest to the target.
    ///
    /// The lowest quality candidate is probed first: if it already meets the
    /// target nothing else is probed. The highest quality candidate follows,
    /// and if even that misses the target it is returned right away.
    /// Otherwise every candidate is probed and the result is interpolated.
    #[tracing::instrument(level = "debug", skip(self, job, scorer), fields(chunk = %job.id))]
    #[inline]
    pub fn resolve(
        &self,
        job: &ChunkJob,
        scorer: &dyn QualityScorer,
    ) -> Result<Resolution, PipelineError> {
        self.validate()?;

        let candidates = self.candidates();
        let mut probes = Vec::with_capacity(candidates.len());
        let mut probe = |param: u32| -> Result<f64, PipelineError> {
            let score = scorer.score(job, param).map_err(|e| {
                if matches!(e.downcast_ref::<PipelineError>(), Some(PipelineError::Interrupted)) {
                    PipelineError::Interrupted
                } else {
                    PipelineError::ProbeFailed {
                        chunk:  job.id.clone(),
                        reason: format!("{e:#}"),
                    }
                }
            })?;
            if score.is_nan() {
                return Err(PipelineError::ProbeFailed {
                    chunk:  job.id.clone(),
                    reason: format!("score of parameter {param} is not a number"),
                });
            }
            probes.push(ProbeSample {
                param,
                score,
            });
            Ok(score)
        };

        let &[lowest, .., highest] = candidates.as_slice() else {
            // a single candidate, min_q == max_q
            let param = candidates[0];
            let score = probe(param)?;
            return Ok(self.finish(job, param, score, probes, SkipProbingReason::SingleCandidate));
        };

        let score = probe(lowest)?;
        if score >= self.target {
            return Ok(self.finish(
                job,
                lowest,
                score,
                probes,
                SkipProbingReason::LowestQualityMeetsTarget,
            ));
        }

        let score = probe(highest)?;
        if score < self.target {
            return Ok(self.finish(
                job,
                highest,
                score,
                probes,
                SkipProbingReason::HighestQualityMissesTarget,
            ));
        }

        for &param in &candidates[1..candidates.len() - 1] {
            probe(param)?;
        }

        let (param, score) = self.interpolate(&probes);
        Ok(self.finish(job, param, score, probes, SkipProbingReason::None))
    }

    /// Fits score to parameter over the probes and reads off the target.
    /// Falls back to the closest probe when the scores cannot be
    /// interpolated.
    fn interpolate(&self, probes: &[ProbeSample]) -> (u32, f64) {
        let mut sorted = probes.to_vec();
        sorted.sort_by(|a, b| {
            a.score
                .total_cmp(&b.score)
                .then_with(|| self.quality_rank(a.param).cmp(&self.quality_rank(b.param)))
        });
        // equal scores keep the lowest quality parameter
        sorted.dedup_by(|b, a| a.score.total_cmp(&b.score).is_eq());

        let (scores, params): (Vec<f64>, Vec<f64>) =
            sorted.iter().map(|p| (p.score, f64::from(p.param))).unzip();
        let Some(curve) = Pchip::new(&scores, &params) else {
            debug!(
                "{}, using the closest probe",
                PipelineError::InterpolationDegenerate {
                    distinct: sorted.len()
                }
            );
            return self.closest_probe(probes);
        };

        let (lo, hi) = curve.domain();
        let best = (0..SCAN_POINTS)
            .map(|i| lo + (hi - lo) * i as f64 / (SCAN_POINTS - 1) as f64)
            .min_by(|a, b| (a - self.target).abs().total_cmp(&(b - self.target).abs()))
            .unwrap_or(lo);

        let param = (curve.eval(best).round() as u32).clamp(self.min_q, self.max_q);
        (param, best)
    }

    fn closest_probe(&self, probes: &[ProbeSample]) -> (u32, f64) {
        probes
            .iter()
            .min_by(|a, b| {
                (a.score - self.target)
                    .abs()
                    .total_cmp(&(b.score - self.target).abs())
                    .then_with(|| self.quality_rank(a.param).cmp(&self.quality_rank(b.param)))
            })
            .map_or((self.max_q, 0.0), |p| (p.param, p.score))
    }

    fn finish(
        &self,
        job: &ChunkJob,
        param: u32,
        score: f64,
        probes: Vec<ProbeSample>,
        skip: SkipProbingReason,
    ) -> Resolution {
        log_probes(job, self, &probes, param, score, skip);
        Resolution {
            param,
            score,
            probes,
            skip,
        }
    }
}

/// Scores an encode of `job` made with `param`. Higher is better.
pub trait QualityScorer: Sync {
    fn score(&self, job: &ChunkJob, param: u32) -> anyhow::Result<f64>;
}

impl<F> QualityScorer for F
where
    F: Fn(&ChunkJob, u32) -> anyhow::Result<f64> + Sync,
{
    #[inline]
    fn score(&self, job: &ChunkJob, param: u32) -> anyhow::Result<f64> {
        self(job, param)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProbeSample {
    pub param: u32,
    pub score: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipProbingReason {
    LowestQualityMeetsTarget,
    HighestQualityMissesTarget,
    SingleCandidate,
    None,
}

#[derive(Debug, Clone)]
pub struct Resolution {
    pub param:  u32,
    /// Measured score for early exits, interpolated estimate otherwise.
    pub score:  f64,
    pub probes: Vec<ProbeSample>,
    pub skip:   SkipProbingReason,
}

/// VMAF threads per probe so that all workers together slightly
/// oversubscribe the machine.
#[inline]
pub fn vmaf_auto_threads(workers: usize) -> usize {
    const OVER_PROVISION_FACTOR: f64 = 1.25;

    let threads = available_parallelism().map_or(1, NonZeroUsize::get);

    cmp::max(
        ((threads / workers.max(1)) as f64 * OVER_PROVISION_FACTOR) as usize,
        1,
    )
}

#[inline]
pub fn log_probes(
    job: &ChunkJob,
    settings: &TargetQuality,
    probes: &[ProbeSample],
    param: u32,
    score: f64,
    skip: SkipProbingReason,
) {
    let mut sorted: Vec<_> = probes.iter().map(|p| (p.param, p.score)).collect();
    sorted.sort_by_key(|(param, _)| *param);

    debug!(
        "chunk {name}: Target={target}, P-Rate={rate}, {frames} frames
       TQ-Probes: {sorted:.2?}{suffix}
       Final Q={param}, Final Score={score:.2}",
        name = job.id,
        target = settings.target,
        rate = settings.probing_rate,
        frames = job.frames_total,
        suffix = match skip {
            SkipProbingReason::None => "",
            SkipProbingReason::LowestQualityMeetsTarget => " Early Skip Lowest Quality",
            SkipProbingReason::HighestQualityMissesTarget => " Early Skip Highest Quality",
            SkipProbingReason::SingleCandidate => " Single Candidate",
        },
    );
}
