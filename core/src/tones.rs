use crate::bands::{decode_states, encode_symbol, BandStateVector};
use crate::bits::Symbol;
use crate::config::Params;
use crate::error::{DecodeError, ModemError, Result};
use realfft::{RealFftPlanner, RealToComplex};
use std::f64::consts::PI;
use std::f32::consts::PI as PI_F32;
use std::sync::Arc;

// Multi-tone FSK layout
//
// The band domain is split into `band_count` equal bands. Every symbol window
// carries exactly one sinusoid per band:
//
//   f_b = low + b * band_width + state[b] * step
//
// All tones start at phase zero at the first sample of the window, and the sum
// is scaled by `amplitude / band_count` so constructive peaks never clip.
// Windows are concatenated back to back; phase is not carried across symbol
// boundaries.

/// Analysis window taper ratio for demodulator signal conditioning.
const ANALYSIS_TAPER_RATIO: f32 = 0.06;

/// Minimum taper used on the demodulator input.
const ANALYSIS_MIN_TAPER_SAMPLES: usize = 32;

/// Zero-padded FFT bins per tone step, so the spectral peak is read to within
/// an eighth of a step.
const BINS_PER_STEP: f64 = 4.0;

/// Below this, a band's peak holds too little of the window's energy to be a
/// transmitted tone.
const MIN_TONE_STRENGTH: f32 = 0.25;

/// Raised-cosine window that softly ramps amplitude at both edges.
fn raised_cosine_window(len: usize, taper_len: usize) -> Vec<f32> {
    let taper = taper_len.min(len / 2);
    let mut window = vec![1.0; len];
    for i in 0..taper {
        let progress = i as f32 / taper as f32;
        let value = (PI_F32 * progress / 2.0).sin().powi(2);
        window[i] = value;
        window[len - 1 - i] = value;
    }
    window
}

fn analysis_taper_length(len: usize) -> usize {
    let taper = ((len as f32) * ANALYSIS_TAPER_RATIO).round() as usize;
    taper.max(ANALYSIS_MIN_TAPER_SAMPLES).min(len / 2)
}

/// Main-lobe half width in Hz of the tapered `analysis_len`-sample window.
///
/// Each raised-cosine ramp keeps half of its samples' weight, so the window
/// behaves like a rectangle `analysis_len - taper` samples long.
pub(crate) fn analysis_resolution(sample_rate: f64, analysis_len: usize) -> f64 {
    let effective = analysis_len - analysis_taper_length(analysis_len);
    sample_rate / effective.max(1) as f64
}

/// Synthesizes one multi-tone window per symbol.
pub struct ToneModulator {
    params: Params,
}

impl ToneModulator {
    pub fn new(params: &Params) -> Self {
        Self {
            params: params.clone(),
        }
    }

    /// Sum of one tone per band for a single symbol window.
    pub fn modulate_states(&self, states: &[u32]) -> Result<Vec<f32>> {
        let params = &self.params;
        if states.len() != params.band_count() {
            return Err(ModemError::InvalidInput(format!(
                "expected {} band states, got {}",
                params.band_count(),
                states.len()
            )));
        }

        let len = params.samples_per_symbol();
        let mut acc = vec![0.0f64; len];
        for (band, &state) in states.iter().enumerate() {
            if state >= params.states_per_band() {
                return Err(ModemError::InvalidInput(format!(
                    "state {} in band {} exceeds {} states",
                    state,
                    band,
                    params.states_per_band()
                )));
            }
            let omega = 2.0 * PI * params.tone_freq(band, state) / params.sample_rate();
            for (i, value) in acc.iter_mut().enumerate() {
                *value += (omega * i as f64).sin();
            }
        }

        let scale = params.config().amplitude as f64 / params.band_count() as f64;
        Ok(acc.into_iter().map(|v| (v * scale) as f32).collect())
    }

    pub fn modulate_symbol(&self, symbol: Symbol) -> Result<Vec<f32>> {
        let states = encode_symbol(&self.params, symbol)?;
        self.modulate_states(&states)
    }

    /// Concatenate the windows of consecutive symbols with no gap.
    pub fn modulate(&self, symbols: &[Symbol]) -> Result<Vec<f32>> {
        let mut samples = Vec::with_capacity(symbols.len() * self.params.samples_per_symbol());
        for &symbol in symbols {
            samples.extend_from_slice(&self.modulate_symbol(symbol)?);
        }
        Ok(samples)
    }
}

/// Recovers band states by picking the strongest spectral bin inside each band.
///
/// Each symbol window is trimmed by `analysis_margin` on both sides, DC is
/// removed and the edges are tapered before a zero-padded real FFT. Bins are
/// restricted to the band's own tone grid plus half a step, which keeps them
/// inside `[low_b, high_b)` and at least half a step away from the next
/// band's tones.
///
/// A window whose band peak carries too little of the window energy holds no
/// tone (silence, or noise only) and is rejected instead of read as state 0.
pub struct ToneDemodulator {
    params: Params,
    fft: Arc<dyn RealToComplex<f32>>,
    window: Vec<f32>,
    /// `(sum w)^2 / (2 * sum w^2)`: peak power over energy of a lone sinusoid.
    coherent_gain: f32,
    band_bins: Vec<(usize, usize)>,
}

impl ToneDemodulator {
    pub fn new(params: &Params) -> Self {
        let analysis_len = params.samples_per_symbol() - 2 * params.margin_samples();
        let window = raised_cosine_window(analysis_len, analysis_taper_length(analysis_len));
        let window_sum: f32 = window.iter().sum();
        let window_energy: f32 = window.iter().map(|w| w * w).sum();
        let coherent_gain = window_sum * window_sum / (2.0 * window_energy.max(f32::MIN_POSITIVE));

        let step = params.config().freq_step;
        let min_fft_len = (BINS_PER_STEP * params.sample_rate() / step).ceil() as usize;
        let fft_len = (2 * analysis_len).max(min_fft_len);
        let mut planner = RealFftPlanner::<f32>::new();
        let fft = planner.plan_fft_forward(fft_len);

        let bins_per_hz = fft_len as f64 / params.sample_rate();
        let spectrum_len = fft_len / 2 + 1;
        let top_tone = (params.states_per_band() - 1) as f64 * step;
        let band_bins = (0..params.band_count())
            .map(|band| {
                let (low, high) = params.band_range(band);
                let upper = (low + top_tone + step / 2.0).min(high);
                let start = ((low * bins_per_hz).ceil() as usize).min(spectrum_len - 1);
                let end = ((upper * bins_per_hz).ceil() as usize)
                    .max(start + 1)
                    .min(spectrum_len);
                (start, end)
            })
            .collect();

        Self {
            params: params.clone(),
            fft,
            window,
            coherent_gain,
            band_bins,
        }
    }

    pub fn analysis_len(&self) -> usize {
        self.window.len()
    }

    pub fn fft_len(&self) -> usize {
        self.fft.len()
    }

    /// Power spectrum and energy of the conditioned analysis region of one
    /// symbol window.
    fn power_spectrum(&self, samples: &[f32]) -> Result<(Vec<f32>, f32)> {
        let margin = self.params.margin_samples();
        let region = &samples[margin..margin + self.analysis_len()];

        let mean = region.iter().sum::<f32>() / region.len() as f32;
        let mut input = self.fft.make_input_vec();
        for ((slot, &s), &w) in input.iter_mut().zip(region).zip(&self.window) {
            *slot = (s - mean) * w;
        }
        let energy: f32 = input.iter().map(|x| x * x).sum();

        let mut spectrum = self.fft.make_output_vec();
        self.fft
            .process(&mut input, &mut spectrum)
            .map_err(|e| ModemError::Fft(format!("symbol spectrum failed: {:?}", e)))?;

        Ok((spectrum.iter().map(|c| c.norm_sqr()).collect(), energy))
    }

    /// Estimate the state of every band in one symbol window.
    pub fn detect_states(&self, samples: &[f32]) -> Result<BandStateVector> {
        if samples.len() != self.params.samples_per_symbol() {
            return Err(ModemError::InvalidInput(format!(
                "symbol window has {} samples, expected {}",
                samples.len(),
                self.params.samples_per_symbol()
            )));
        }

        let (spectrum, energy) = self.power_spectrum(samples)?;
        let hz_per_bin = self.params.sample_rate() / self.fft_len() as f64;
        let step = self.params.config().freq_step;
        let top_state = self.params.states_per_band() - 1;
        // A band's tone carries 1 / band_count of the window energy.
        let per_tone_energy = energy * self.coherent_gain / self.params.band_count() as f32;

        let mut states = Vec::with_capacity(self.band_bins.len());
        for (band, &(start, end)) in self.band_bins.iter().enumerate() {
            let mut best_bin = start;
            let mut best_power = spectrum[start];
            for (offset, &power) in spectrum[start..end].iter().enumerate() {
                if power > best_power {
                    best_power = power;
                    best_bin = start + offset;
                }
            }

            let strength = if per_tone_energy > 0.0 {
                best_power / per_tone_energy
            } else {
                0.0
            };
            if strength < MIN_TONE_STRENGTH || strength.is_nan() {
                return Err(DecodeError::NoTone { band, strength }.into());
            }

            let freq = best_bin as f64 * hz_per_bin;
            let (low, _) = self.params.band_range(band);
            let state = ((freq - low) / step).round().max(0.0) as u32;
            states.push(state.min(top_state));
        }

        Ok(states)
    }

    /// Demodulate one window to a symbol, rejecting vectors outside the alphabet.
    pub fn demodulate_symbol(&self, samples: &[f32]) -> Result<Symbol> {
        let states = self.detect_states(samples)?;
        log::debug!("band states {:?}", states);
        decode_states(&self.params, &states)
    }

    /// Demodulate back-to-back symbol windows.
    /// `samples.len()` must be a multiple of the symbol length.
    pub fn demodulate(&self, samples: &[f32]) -> Result<Vec<Symbol>> {
        let len = self.params.samples_per_symbol();
        if samples.len() % len != 0 {
            return Err(ModemError::InvalidInput(format!(
                "{} samples is not a whole number of {}-sample symbols",
                samples.len(),
                len
            )));
        }
        samples
            .chunks(len)
            .map(|window| self.demodulate_symbol(window))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bands::to_states;
    use crate::config::ModemConfig;
    use crate::error::ConfigError;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use rand_distr::{Distribution, Normal};

    fn voice_params() -> Params {
        Params::derive(&ModemConfig::voice_band()).unwrap()
    }

    fn random_states(params: &Params, rng: &mut StdRng) -> BandStateVector {
        let symbol = rng.gen_range(0..params.symbol_limit());
        to_states(symbol, params.states_per_band(), params.band_count())
    }

    #[test]
    fn test_symbol_length_and_amplitude() {
        let params = voice_params();
        let modulator = ToneModulator::new(&params);
        let samples = modulator.modulate_states(&[0, 5, 10, 16]).unwrap();
        assert_eq!(samples.len(), params.samples_per_symbol());
        assert_eq!(samples[0], 0.0);
        let peak = samples.iter().fold(0.0f32, |m, s| m.max(s.abs()));
        assert!(peak <= params.config().amplitude + 1e-6, "peak {}", peak);
        assert!(peak > 0.1);
    }

    #[test]
    fn test_modulator_rejects_bad_vectors() {
        let params = voice_params();
        let modulator = ToneModulator::new(&params);
        assert!(modulator.modulate_states(&[0, 0, 0]).is_err());
        assert!(modulator.modulate_states(&[0, 0, 0, 17]).is_err());
        assert!(modulator.modulate_symbol(params.symbol_limit()).is_err());
    }

    #[test]
    fn test_single_tone_peaks_in_its_band() {
        let params = voice_params();
        let modulator = ToneModulator::new(&params);
        let demodulator = ToneDemodulator::new(&params);
        let samples = modulator.modulate_states(&[3, 0, 16, 8]).unwrap();
        assert_eq!(demodulator.detect_states(&samples).unwrap(), vec![3, 0, 16, 8]);
    }

    #[test]
    fn test_roundtrip_random_vectors_voice_band() {
        let params = voice_params();
        let modulator = ToneModulator::new(&params);
        let demodulator = ToneDemodulator::new(&params);
        let mut rng = StdRng::seed_from_u64(11);

        for _ in 0..200 {
            let states = random_states(&params, &mut rng);
            let samples = modulator.modulate_states(&states).unwrap();
            assert_eq!(demodulator.detect_states(&samples).unwrap(), states);
        }
    }

    #[test]
    fn test_roundtrip_random_vectors_reference_profile() {
        let params = Params::derive(&ModemConfig::default()).unwrap();
        let modulator = ToneModulator::new(&params);
        let demodulator = ToneDemodulator::new(&params);
        let mut rng = StdRng::seed_from_u64(12);

        for _ in 0..4 {
            let states = random_states(&params, &mut rng);
            let samples = modulator.modulate_states(&states).unwrap();
            assert_eq!(demodulator.detect_states(&samples).unwrap(), states);
        }
    }

    #[test]
    fn test_roundtrip_across_geometries() {
        let mut rng = StdRng::seed_from_u64(13);
        for (band_count, step) in [(1, 50.0), (2, 100.0), (3, 60.0), (6, 50.0), (8, 50.0)] {
            let config = ModemConfig {
                band_count,
                freq_step: step,
                ..ModemConfig::voice_band()
            };
            let params = Params::derive(&config).unwrap();
            let modulator = ToneModulator::new(&params);
            let demodulator = ToneDemodulator::new(&params);
            for _ in 0..20 {
                let symbol = rng.gen_range(0..params.symbol_limit());
                let samples = modulator.modulate_symbol(symbol).unwrap();
                assert_eq!(
                    demodulator.demodulate_symbol(&samples).unwrap(),
                    symbol,
                    "{} bands, {} Hz step",
                    band_count,
                    step
                );
            }
        }
    }

    #[test]
    fn test_roundtrip_down_to_the_narrowest_accepted_step() {
        let mut rng = StdRng::seed_from_u64(15);
        for margin in [0.0, 0.002] {
            let mut accepted = Vec::new();
            for step in 20..=60 {
                let config = ModemConfig {
                    freq_step: step as f64,
                    analysis_margin: margin,
                    ..ModemConfig::voice_band()
                };
                let params = match Params::derive(&config) {
                    Ok(params) => params,
                    Err(ModemError::Config(ConfigError::AnalysisTooCoarse { .. })) => continue,
                    Err(e) => panic!("step {} margin {}: {}", step, margin, e),
                };
                accepted.push(step);

                let modulator = ToneModulator::new(&params);
                let demodulator = ToneDemodulator::new(&params);
                for _ in 0..100 {
                    let states = random_states(&params, &mut rng);
                    let samples = modulator.modulate_states(&states).unwrap();
                    assert_eq!(
                        demodulator.detect_states(&samples).unwrap(),
                        states,
                        "step {} margin {}",
                        step,
                        margin
                    );
                }
            }
            // Accepted steps form one run up to 60 Hz, starting near twice the
            // window's resolution.
            assert!(!accepted.contains(&20) && !accepted.contains(&40), "{:?}", accepted);
            assert_eq!(accepted.last(), Some(&60));
            assert_eq!(accepted.len() as i32, 61 - accepted[0]);
            assert!(accepted[0] <= 48, "{:?}", accepted);
        }
    }

    #[test]
    fn test_silent_window_has_no_tone() {
        let params = voice_params();
        let demodulator = ToneDemodulator::new(&params);
        let silence = vec![0.0; params.samples_per_symbol()];
        assert!(matches!(
            demodulator.detect_states(&silence),
            Err(ModemError::Decode(DecodeError::NoTone { band: 0, .. }))
        ));

        let hum = vec![0.25; params.samples_per_symbol()];
        assert!(matches!(
            demodulator.demodulate_symbol(&hum),
            Err(ModemError::Decode(DecodeError::NoTone { .. }))
        ));
    }

    #[test]
    fn test_noise_only_window_has_no_tone() {
        let params = voice_params();
        let demodulator = ToneDemodulator::new(&params);
        let noise = Normal::new(0.0f32, 0.1).unwrap();
        let mut rng = StdRng::seed_from_u64(16);

        for _ in 0..20 {
            let samples: Vec<f32> = (0..params.samples_per_symbol())
                .map(|_| noise.sample(&mut rng))
                .collect();
            assert!(matches!(
                demodulator.detect_states(&samples),
                Err(ModemError::Decode(DecodeError::NoTone { .. }))
            ));
        }
    }

    #[test]
    fn test_missing_band_tone_is_rejected() {
        let params = voice_params();
        let demodulator = ToneDemodulator::new(&params);
        let full = ToneModulator::new(&params).modulate_states(&[2, 4, 6, 8]).unwrap();

        // Keep only band 0's tone by subtracting the other three.
        let len = params.samples_per_symbol();
        let scale = params.config().amplitude as f64 / params.band_count() as f64;
        let mut lone = full;
        for (band, state) in [(1, 4), (2, 6), (3, 8)] {
            let omega = 2.0 * PI * params.tone_freq(band, state) / params.sample_rate();
            for (i, s) in lone.iter_mut().enumerate().take(len) {
                *s -= (scale * (omega * i as f64).sin()) as f32;
            }
        }
        assert!(matches!(
            demodulator.detect_states(&lone),
            Err(ModemError::Decode(DecodeError::NoTone { band: 1, .. }))
        ));
    }

    #[test]
    fn test_unused_alphabet_is_a_decode_error() {
        let params = voice_params();
        let modulator = ToneModulator::new(&params);
        let demodulator = ToneDemodulator::new(&params);
        let samples = modulator.modulate_states(&[16, 16, 16, 16]).unwrap();
        assert!(matches!(
            demodulator.demodulate_symbol(&samples),
            Err(ModemError::Decode(DecodeError::SymbolOutOfAlphabet { .. }))
        ));
    }

    #[test]
    fn test_one_sample_misalignment() {
        let params = voice_params();
        let modulator = ToneModulator::new(&params);
        let demodulator = ToneDemodulator::new(&params);
        let symbols = [0x1234, 0xBEEF, 0x0F0F];
        let samples = modulator.modulate(&symbols).unwrap();
        let len = params.samples_per_symbol();

        let late = &samples[len + 1..2 * len + 1];
        assert_eq!(demodulator.demodulate_symbol(late).unwrap(), 0xBEEF);
        let early = &samples[len - 1..2 * len - 1];
        assert_eq!(demodulator.demodulate_symbol(early).unwrap(), 0xBEEF);
    }

    #[test]
    fn test_gaussian_noise() {
        let params = voice_params();
        let modulator = ToneModulator::new(&params);
        let demodulator = ToneDemodulator::new(&params);
        let noise = Normal::new(0.0f32, 0.05).unwrap();
        let mut rng = StdRng::seed_from_u64(14);

        for _ in 0..20 {
            let symbol = rng.gen_range(0..params.symbol_limit());
            let mut samples = modulator.modulate_symbol(symbol).unwrap();
            for s in samples.iter_mut() {
                *s += noise.sample(&mut rng);
            }
            assert_eq!(demodulator.demodulate_symbol(&samples).unwrap(), symbol);
        }
    }

    #[test]
    fn test_gain_and_dc_invariance() {
        let params = voice_params();
        let modulator = ToneModulator::new(&params);
        let demodulator = ToneDemodulator::new(&params);
        let samples = modulator.modulate_symbol(0x5AC3).unwrap();

        for gain in [0.05, 0.5, 2.5] {
            let scaled: Vec<f32> = samples.iter().map(|s| s * gain).collect();
            assert_eq!(demodulator.demodulate_symbol(&scaled).unwrap(), 0x5AC3, "gain {}", gain);
        }
        for offset in [-0.2, 0.3] {
            let shifted: Vec<f32> = samples.iter().map(|s| s + offset).collect();
            assert_eq!(demodulator.demodulate_symbol(&shifted).unwrap(), 0x5AC3, "offset {}", offset);
        }
    }

    #[test]
    fn test_demodulate_length_validation() {
        let params = voice_params();
        let demodulator = ToneDemodulator::new(&params);
        let len = params.samples_per_symbol();
        assert!(demodulator.detect_states(&vec![0.0; len - 1]).is_err());
        assert!(demodulator.demodulate(&vec![0.0; len + 3]).is_err());
        assert!(demodulator.demodulate(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_raised_cosine_window_shape() {
        let window = raised_cosine_window(100, 10);
        assert_eq!(window[0], 0.0);
        assert_eq!(window[50], 1.0);
        assert!(window[5] > 0.0 && window[5] < 1.0);
        assert_eq!(window[5], window[94]);
    }
}
