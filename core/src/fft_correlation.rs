//! FFT cross-correlation and the normalised matched filter built on it.
//!
//! Only fully-overlapping lags are produced ("valid" mode): output index `i`
//! is the correlation of `template` with `signal[i..i + template.len()]`.

use crate::error::{ModemError, Result};
use realfft::RealFftPlanner;

/// Windows whose energy product is below this are scored as zero.
const MIN_ENERGY_PRODUCT: f64 = 1e-12;

/// Cross-correlate `template` against every fully-overlapping window of `signal`.
///
/// Returns `signal.len() - template.len() + 1` values, or an empty vector if
/// either input is empty or the template is longer than the signal.
pub fn correlate_valid(signal: &[f32], template: &[f32]) -> Result<Vec<f32>> {
    if signal.is_empty() || template.is_empty() || template.len() > signal.len() {
        return Ok(Vec::new());
    }

    let full_len = signal.len() + template.len() - 1;
    let fft_size = full_len.next_power_of_two();

    let mut padded_signal = vec![0.0; fft_size];
    padded_signal[..signal.len()].copy_from_slice(signal);

    // Correlation is convolution with the time-reversed template.
    let mut padded_template = vec![0.0; fft_size];
    for (slot, &value) in padded_template.iter_mut().zip(template.iter().rev()) {
        *slot = value;
    }

    let mut planner = RealFftPlanner::<f32>::new();
    let r2c = planner.plan_fft_forward(fft_size);
    let c2r = planner.plan_fft_inverse(fft_size);

    let mut signal_spectrum = r2c.make_output_vec();
    let mut template_spectrum = r2c.make_output_vec();
    r2c.process(&mut padded_signal, &mut signal_spectrum)
        .map_err(|e| ModemError::Fft(format!("forward transform of signal failed: {:?}", e)))?;
    r2c.process(&mut padded_template, &mut template_spectrum)
        .map_err(|e| ModemError::Fft(format!("forward transform of template failed: {:?}", e)))?;

    for (s, t) in signal_spectrum.iter_mut().zip(template_spectrum.iter()) {
        *s *= t;
    }

    let mut product = c2r.make_output_vec();
    c2r.process(&mut signal_spectrum, &mut product)
        .map_err(|e| ModemError::Fft(format!("inverse transform failed: {:?}", e)))?;

    let scale = fft_size as f32;
    let start = template.len() - 1;
    let valid_len = signal.len() - template.len() + 1;
    Ok(product[start..start + valid_len]
        .iter()
        .map(|v| v / scale)
        .collect())
}

/// Matched filter for a fixed reference waveform.
///
/// Scores are normalised cross-correlation coefficients,
/// `|<window, template>| / sqrt(E_window * E_template)`, so they lie in
/// `[0, 1]` independent of the capture gain.
pub struct MatchedFilter {
    template: Vec<f32>,
    template_energy: f64,
}

/// Best-scoring window of a matched-filter pass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Peak {
    pub offset: usize,
    pub score: f32,
}

impl MatchedFilter {
    pub fn new(template: Vec<f32>) -> Self {
        let template_energy = template.iter().map(|&x| x as f64 * x as f64).sum();
        Self {
            template,
            template_energy,
        }
    }

    pub fn template(&self) -> &[f32] {
        &self.template
    }

    pub fn len(&self) -> usize {
        self.template.len()
    }

    pub fn is_empty(&self) -> bool {
        self.template.is_empty()
    }

    /// Normalised score for every window start in `signal`.
    pub fn scores(&self, signal: &[f32]) -> Result<Vec<f32>> {
        let raw = correlate_valid(signal, &self.template)?;
        if raw.is_empty() {
            return Ok(raw);
        }

        // Prefix sums of squared samples give each window's energy in O(1).
        let mut energy_prefix = Vec::with_capacity(signal.len() + 1);
        energy_prefix.push(0.0f64);
        let mut running = 0.0f64;
        for &x in signal {
            running += x as f64 * x as f64;
            energy_prefix.push(running);
        }

        let width = self.template.len();
        let scores = raw
            .iter()
            .enumerate()
            .map(|(i, &corr)| {
                let window_energy = (energy_prefix[i + width] - energy_prefix[i]).max(0.0);
                let denom = window_energy * self.template_energy;
                if denom > MIN_ENERGY_PRODUCT {
                    ((corr as f64).abs() / denom.sqrt()).min(1.0) as f32
                } else {
                    0.0
                }
            })
            .collect();

        Ok(scores)
    }

    /// Highest-scoring window, or `None` when `signal` is shorter than the template.
    pub fn best_match(&self, signal: &[f32]) -> Result<Option<Peak>> {
        let scores = self.scores(signal)?;
        let mut best: Option<Peak> = None;
        for (offset, &score) in scores.iter().enumerate() {
            if best.map_or(true, |peak| score > peak.score) {
                best = Some(Peak { offset, score });
            }
        }
        Ok(best)
    }
}
