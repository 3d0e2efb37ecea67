//! Physical constants of the link and the geometry derived from them.
//!
//! The modulation domain `[low_freq, high_freq)` is split into `band_count`
//! equal bands. Inside a band, tones sit `freq_step` Hz apart starting at the
//! band's lower edge, giving `states_per_band` selectable tones. One symbol
//! picks one tone per band, so the raw alphabet has
//! `states_per_band ^ band_count` entries, rounded down to a power of two for
//! bit packing.

use crate::error::{ConfigError, Result};
use crate::tones;
use serde::{Deserialize, Serialize};

/// Guards the `floor(band_width / step)` computation against values such as
/// `2.9999999999999996`.
const STATE_COUNT_EPSILON: f64 = 1e-9;

/// Tone steps must span this many main-lobe half widths of the demodulator's
/// analysis window, so each band's spectral peak rounds to the right state and
/// the neighbouring band's lowest tone stays outside the main lobe.
const MIN_STEP_RESOLUTIONS: f64 = 2.0;

/// Raw, user-facing link constants. Durations are in seconds, frequencies in Hz.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModemConfig {
    pub sample_rate: u32,
    pub symbol_duration: f64,
    pub low_freq: f64,
    pub high_freq: f64,
    pub band_count: u32,
    pub freq_step: f64,
    pub preamble_duration: f64,
    pub preamble_start_freq: f64,
    pub preamble_end_freq: f64,
    pub guard_gap: f64,
    /// Width of the payload-length field at the head of every frame.
    pub length_field_bits: u32,
    /// Peak output level of the chirp and of the summed tones.
    pub amplitude: f32,
    /// Trimmed from both edges of a symbol window before spectral analysis.
    pub analysis_margin: f64,
    /// Minimum normalised matched-filter score accepted as a preamble.
    pub sync_threshold: f32,
    /// Extra latency tolerated after the guard gap when locating the data.
    pub guard_slack: f64,
    /// How long the streaming receiver searches for a preamble.
    pub listen_duration: f64,
    /// Largest payload the streaming receiver preallocates room for.
    pub max_payload_bits: usize,
    /// Added to the expected duration of every streaming phase before a wait
    /// is declared a device timeout.
    pub phase_timeout: f64,
}

impl Default for ModemConfig {
    fn default() -> Self {
        Self {
            sample_rate: 44100,
            symbol_duration: 0.8,
            low_freq: 1000.0,
            high_freq: 17000.0,
            band_count: 10,
            freq_step: 100.0,
            preamble_duration: 0.8,
            preamble_start_freq: 1000.0,
            preamble_end_freq: 5000.0,
            guard_gap: 0.5,
            length_field_bits: 16,
            amplitude: 0.7,
            analysis_margin: 0.02,
            sync_threshold: 0.4,
            guard_slack: 0.25,
            listen_duration: 10.0,
            max_payload_bits: 4096,
            phase_timeout: 2.0,
        }
    }
}

impl ModemConfig {
    /// Narrow profile for 8 kHz telephone-grade links: 4 bands in 300-3700 Hz,
    /// 50 ms symbols, 16 bits per symbol.
    pub fn voice_band() -> Self {
        Self {
            sample_rate: 8000,
            symbol_duration: 0.05,
            low_freq: 300.0,
            high_freq: 3700.0,
            band_count: 4,
            freq_step: 50.0,
            preamble_duration: 0.25,
            preamble_start_freq: 500.0,
            preamble_end_freq: 3500.0,
            guard_gap: 0.1,
            length_field_bits: 16,
            amplitude: 0.7,
            analysis_margin: 0.002,
            sync_threshold: 0.4,
            guard_slack: 0.1,
            listen_duration: 5.0,
            max_payload_bits: 2048,
            phase_timeout: 2.0,
        }
    }

    fn validate_basics(&self) -> std::result::Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));
        let nyquist = self.sample_rate as f64 / 2.0;

        if self.sample_rate == 0 {
            return invalid("sample rate must be positive".into());
        }
        if !(self.symbol_duration > 0.0 && self.symbol_duration.is_finite()) {
            return invalid(format!("symbol duration {} s is not positive", self.symbol_duration));
        }
        if !(self.low_freq >= 0.0 && self.high_freq > self.low_freq) {
            return invalid(format!(
                "band bounds [{}, {}] Hz are inverted or negative",
                self.low_freq, self.high_freq
            ));
        }
        if self.high_freq > nyquist {
            return invalid(format!(
                "upper band bound {} Hz exceeds the Nyquist frequency {} Hz",
                self.high_freq, nyquist
            ));
        }
        if self.band_count == 0 {
            return invalid("band count must be at least 1".into());
        }
        if !(self.freq_step > 0.0 && self.freq_step.is_finite()) {
            return invalid(format!("frequency step {} Hz is not positive", self.freq_step));
        }
        if !(self.preamble_duration > 0.0) {
            return invalid("preamble duration must be positive".into());
        }
        for freq in [self.preamble_start_freq, self.preamble_end_freq] {
            if !(freq > 0.0 && freq <= nyquist) {
                return invalid(format!("preamble frequency {} Hz is outside (0, {}]", freq, nyquist));
            }
        }
        if !(1..=64).contains(&self.length_field_bits) {
            return invalid(format!(
                "length field width {} is outside 1..=64 bits",
                self.length_field_bits
            ));
        }
        if !(self.amplitude > 0.0 && self.amplitude <= 1.0) {
            return invalid(format!("amplitude {} is outside (0, 1]", self.amplitude));
        }
        if !(self.sync_threshold > 0.0 && self.sync_threshold <= 1.0) {
            return invalid(format!("sync threshold {} is outside (0, 1]", self.sync_threshold));
        }
        if self.guard_gap < 0.0 || self.guard_slack < 0.0 || self.analysis_margin < 0.0 {
            return invalid("guard gap, guard slack and analysis margin must not be negative".into());
        }
        if !(self.listen_duration > 0.0) || self.phase_timeout < 0.0 {
            return invalid("listen duration must be positive and phase timeout non-negative".into());
        }
        Ok(())
    }
}

/// Validated, immutable geometry of one modem session.
///
/// Built once at startup by [`Params::derive`] and handed by reference to every
/// component; nothing in the crate looks these values up globally.
#[derive(Debug, Clone, PartialEq)]
pub struct Params {
    config: ModemConfig,
    band_width: f64,
    states_per_band: u32,
    symbol_alphabet_size: u128,
    bits_per_symbol: u32,
    samples_per_symbol: usize,
    preamble_samples: usize,
    guard_samples: usize,
    margin_samples: usize,
    guard_slack_samples: usize,
    listen_samples: usize,
}

impl Params {
    pub fn derive(config: &ModemConfig) -> Result<Self> {
        config.validate_basics()?;

        let resolution = 1.0 / config.symbol_duration;
        if resolution > config.freq_step {
            return Err(ConfigError::ToneSpacingTooNarrow {
                step: config.freq_step,
                resolution,
            }
            .into());
        }

        let band_width = (config.high_freq - config.low_freq) / config.band_count as f64;
        let states = (band_width / config.freq_step + STATE_COUNT_EPSILON).floor() as u64;
        if states < 2 {
            return Err(ConfigError::TooFewStates {
                states_per_band: states,
            }
            .into());
        }
        let states_per_band = u32::try_from(states).map_err(|_| ConfigError::AlphabetTooLarge {
            band_count: config.band_count,
            states_per_band: states,
        })?;
        let symbol_alphabet_size = (states_per_band as u128)
            .checked_pow(config.band_count)
            .ok_or(ConfigError::AlphabetTooLarge {
                band_count: config.band_count,
                states_per_band: states,
            })?;
        let bits_per_symbol = symbol_alphabet_size.ilog2();

        let fs = config.sample_rate as f64;
        let to_samples = |seconds: f64| (fs * seconds).round() as usize;
        let samples_per_symbol = to_samples(config.symbol_duration);
        let margin_samples = to_samples(config.analysis_margin);
        if samples_per_symbol == 0 {
            return Err(ConfigError::Invalid("symbol is shorter than one sample".into()).into());
        }
        if 2 * margin_samples >= samples_per_symbol {
            return Err(ConfigError::Invalid(format!(
                "analysis margin of {} samples leaves nothing of a {}-sample symbol",
                margin_samples, samples_per_symbol
            ))
            .into());
        }

        let analysis_samples = samples_per_symbol - 2 * margin_samples;
        let required = MIN_STEP_RESOLUTIONS * tones::analysis_resolution(fs, analysis_samples);
        if config.freq_step < required {
            return Err(ConfigError::AnalysisTooCoarse {
                step: config.freq_step,
                required,
                analysis_samples,
            }
            .into());
        }

        let params = Self {
            config: config.clone(),
            band_width,
            states_per_band,
            symbol_alphabet_size,
            bits_per_symbol,
            samples_per_symbol,
            preamble_samples: to_samples(config.preamble_duration).max(1),
            guard_samples: to_samples(config.guard_gap),
            margin_samples,
            guard_slack_samples: to_samples(config.guard_slack),
            listen_samples: to_samples(config.listen_duration),
        };

        log::info!(
            "splitting [{} {}] Hz into {} bands of {} Hz, {} states {} Hz apart",
            config.low_freq,
            config.high_freq,
            config.band_count,
            band_width,
            states_per_band,
            config.freq_step
        );
        log::info!(
            "rounding the symbol set from {} down to 2^{} symbols",
            symbol_alphabet_size,
            bits_per_symbol
        );

        Ok(params)
    }

    pub fn config(&self) -> &ModemConfig {
        &self.config
    }

    pub fn sample_rate(&self) -> f64 {
        self.config.sample_rate as f64
    }

    pub fn band_count(&self) -> usize {
        self.config.band_count as usize
    }

    pub fn band_width(&self) -> f64 {
        self.band_width
    }

    pub fn states_per_band(&self) -> u32 {
        self.states_per_band
    }

    pub fn symbol_alphabet_size(&self) -> u128 {
        self.symbol_alphabet_size
    }

    pub fn bits_per_symbol(&self) -> u32 {
        self.bits_per_symbol
    }

    /// Exclusive upper bound of the symbols actually transmitted, `2^bits_per_symbol`.
    pub fn symbol_limit(&self) -> u128 {
        1u128 << self.bits_per_symbol
    }

    pub fn samples_per_symbol(&self) -> usize {
        self.samples_per_symbol
    }

    pub fn preamble_samples(&self) -> usize {
        self.preamble_samples
    }

    pub fn guard_samples(&self) -> usize {
        self.guard_samples
    }

    pub fn margin_samples(&self) -> usize {
        self.margin_samples
    }

    pub fn guard_slack_samples(&self) -> usize {
        self.guard_slack_samples
    }

    pub fn listen_samples(&self) -> usize {
        self.listen_samples
    }

    pub fn length_field_bits(&self) -> usize {
        self.config.length_field_bits as usize
    }

    /// Largest payload length the length field can express.
    pub fn max_payload_bits(&self) -> u64 {
        match self.config.length_field_bits {
            64 => u64::MAX,
            bits => (1u64 << bits) - 1,
        }
    }

    /// `[low, high)` frequency domain of one band.
    pub fn band_range(&self, band: usize) -> (f64, f64) {
        let low = self.config.low_freq + band as f64 * self.band_width;
        (low, low + self.band_width)
    }

    /// Tone frequency for `state` in `band`: `low + band * band_width + state * step`.
    pub fn tone_freq(&self, band: usize, state: u32) -> f64 {
        self.band_range(band).0 + state as f64 * self.config.freq_step
    }

    /// Symbols needed to carry the length field alone.
    pub fn header_symbols(&self) -> usize {
        self.length_field_bits().div_ceil(self.bits_per_symbol as usize)
    }

    /// Symbols needed for a whole frame carrying `payload_bits`.
    pub fn frame_symbols(&self, payload_bits: usize) -> usize {
        (self.length_field_bits() + payload_bits).div_ceil(self.bits_per_symbol as usize)
    }

    /// Playback length of the chirp, the guard gap and a frame carrying `payload_bits`.
    pub fn transmission_samples(&self, payload_bits: usize) -> usize {
        self.preamble_samples
            + self.guard_samples
            + self.frame_symbols(payload_bits) * self.samples_per_symbol
    }
}
