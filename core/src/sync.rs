use crate::config::Params;
use crate::error::{DecodeError, Result, SyncError};
use crate::fft_correlation::MatchedFilter;
use std::f64::consts::PI;

/// Fraction of the data peak that counts as "signal present" when no guard
/// noise is available to set the floor.
const ONSET_PEAK_FRACTION: f32 = 0.02;

/// Above this guard-noise to data-peak ratio the sample-level onset search is
/// unreliable and the nominal data start is used as is.
const ONSET_MAX_NOISE_RATIO: f32 = 0.25;

/// Linear chirp from `preamble_start_freq` to `preamble_end_freq`.
///
/// `phi(t) = 2*pi * (rate/2 * t^2 + f0 * t)` with
/// `rate = (f1 - f0) / preamble_duration`, scaled by the configured amplitude.
pub fn generate_chirp(params: &Params) -> Vec<f32> {
    let config = params.config();
    let fs = params.sample_rate();
    let start = config.preamble_start_freq;
    let rate = (config.preamble_end_freq - start) / config.preamble_duration;
    let amplitude = config.amplitude.clamp(0.0, 1.0) as f64;

    (0..params.preamble_samples())
        .map(|n| {
            let t = n as f64 / fs;
            let phase = 2.0 * PI * (rate / 2.0 * t * t + start * t);
            (amplitude * phase.sin()) as f32
        })
        .collect()
}

/// Where the chirp was found in a capture.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SyncPoint {
    /// Index of the first chirp sample.
    pub offset: usize,
    /// Normalised matched-filter score at `offset`.
    pub score: f32,
}

/// Matched-filter detector for the preamble of one session geometry.
pub struct PreambleDetector {
    params: Params,
    filter: MatchedFilter,
}

impl PreambleDetector {
    pub fn new(params: &Params) -> Self {
        Self {
            params: params.clone(),
            filter: MatchedFilter::new(generate_chirp(params)),
        }
    }

    pub fn template(&self) -> &[f32] {
        self.filter.template()
    }

    /// Find the chirp in `samples`.
    ///
    /// The best-scoring offset is accepted only if its score reaches
    /// `sync_threshold`; otherwise the capture holds no usable preamble.
    pub fn detect(&self, samples: &[f32]) -> Result<SyncPoint> {
        let needed = self.filter.len();
        let threshold = self.params.config().sync_threshold;

        let peak = self
            .filter
            .best_match(samples)?
            .ok_or(SyncError::InsufficientSamples {
                needed,
                available: samples.len(),
            })?;

        if peak.score < threshold {
            log::debug!(
                "no preamble in {} samples, best score {:.3} at {}",
                samples.len(),
                peak.score,
                peak.offset
            );
            return Err(SyncError::PreambleNotFound {
                best_score: peak.score,
                threshold,
            }
            .into());
        }

        log::info!("preamble at sample {} (score {:.3})", peak.offset, peak.score);
        Ok(SyncPoint {
            offset: peak.offset,
            score: peak.score,
        })
    }

    /// First data sample if the link added no latency after the guard gap.
    pub fn nominal_data_start(&self, sync: &SyncPoint) -> usize {
        sync.offset + self.params.preamble_samples() + self.params.guard_samples()
    }

    /// Locate the first data sample, allowing up to `guard_slack` of extra
    /// silence after the guard gap.
    ///
    /// Every symbol's tones start at phase zero, so the first data sample is
    /// silent and the onset is the sample just before the first one that
    /// rises above the guard-gap noise floor. The result is never earlier
    /// than the nominal start. With no signal at all, or a channel too noisy
    /// for sample-level timing, the nominal start is returned. A clear rise
    /// past the slack is an error: reading from the nominal start would slice
    /// symbols in the wrong places.
    pub fn locate_data_start(&self, samples: &[f32], sync: &SyncPoint) -> Result<usize> {
        let nominal = self.nominal_data_start(sync);
        if nominal >= samples.len() {
            return Ok(nominal);
        }

        let slack = self.params.guard_slack_samples();
        let guard_start = (sync.offset + self.params.preamble_samples()).min(nominal);
        let noise_peak = peak_abs(&samples[guard_start..nominal]);

        let data_end = (nominal + slack + 1 + self.params.samples_per_symbol()).min(samples.len());
        let data_peak = peak_abs(&samples[nominal..data_end]);

        if data_peak == 0.0 || noise_peak > ONSET_MAX_NOISE_RATIO * data_peak {
            return Ok(nominal);
        }

        let threshold = (2.0 * noise_peak).max(ONSET_PEAK_FRACTION * data_peak);
        let Some(rise) = samples[nominal..data_end]
            .iter()
            .position(|s| s.abs() > threshold)
        else {
            return Ok(nominal);
        };

        let delay = rise.saturating_sub(1);
        if delay > slack {
            return Err(DecodeError::LateOnset { delay, slack }.into());
        }
        if delay > 0 {
            log::debug!("data onset {} samples after the guard gap", delay);
        }
        Ok(nominal + delay)
    }
}

fn peak_abs(samples: &[f32]) -> f32 {
    samples.iter().fold(0.0f32, |m, s| m.max(s.abs()))
}

/// One-shot helper for offline captures.
pub fn detect_preamble(params: &Params, samples: &[f32]) -> Result<SyncPoint> {
    PreambleDetector::new(params).detect(samples)
}
