use thiserror::Error;

/// Infeasible modem geometry. Raised once, before any audio is produced.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("frequency step {step} Hz is below the {resolution} Hz resolution of one symbol")]
    ToneSpacingTooNarrow { step: f64, resolution: f64 },

    #[error(
        "frequency step {step} Hz is below {required:.1} Hz, twice the resolution of the {analysis_samples}-sample analysis window"
    )]
    AnalysisTooCoarse {
        step: f64,
        required: f64,
        analysis_samples: usize,
    },

    #[error("only {states_per_band} states fit in each band, need at least 2")]
    TooFewStates { states_per_band: u64 },

    #[error("{states_per_band}^{band_count} symbols do not fit in 128 bits")]
    AlphabetTooLarge { band_count: u32, states_per_band: u64 },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// The chirp preamble could not be located in the capture.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SyncError {
    #[error("preamble not found (best score {best_score:.3}, threshold {threshold:.3})")]
    PreambleNotFound { best_score: f32, threshold: f32 },

    #[error("need {needed} samples to search for the preamble, have {available}")]
    InsufficientSamples { needed: usize, available: usize },
}

/// The data region did not decode to a well-formed frame.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DecodeError {
    #[error("symbol {symbol} is outside the {bits_per_symbol}-bit alphabet")]
    SymbolOutOfAlphabet { symbol: u128, bits_per_symbol: u32 },

    #[error("no tone in band {band} (strength {strength:.3})")]
    NoTone { band: usize, strength: f32 },

    #[error("band {band} carries state {state}, only {states_per_band} states exist")]
    StateOutOfRange {
        band: usize,
        state: u32,
        states_per_band: u32,
    },

    #[error("data starts {delay} samples after the guard gap, beyond the {slack}-sample slack")]
    LateOnset { delay: usize, slack: usize },

    #[error("frame needs {needed_bits} bits, only {available_bits} were received")]
    TruncatedFrame {
        needed_bits: usize,
        available_bits: usize,
    },

    #[error("length field announces {payload_bits} payload bits, receiver accepts at most {capacity_bits}")]
    FrameTooLong {
        payload_bits: u64,
        capacity_bits: usize,
    },
}

/// Failure at the audio boundary. Never retried by the codec.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DeviceError {
    #[error("audio endpoint disconnected")]
    Disconnected,

    #[error("timed out waiting for the {phase} phase to complete")]
    Timeout { phase: &'static str },

    #[error("capture buffer overrun, {dropped} samples dropped")]
    CaptureOverrun { dropped: usize },
}

#[derive(Debug, Error)]
pub enum ModemError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error("payload of {payload_bits} bits does not fit a length field of at most {max_bits}")]
    PayloadTooLong { payload_bits: usize, max_bits: u64 },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("FFT error: {0}")]
    Fft(String),

    #[error("stream stopped before the phase completed")]
    Cancelled,
}

impl ModemError {
    /// A missed preamble can be fixed by listening again; nothing else can.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ModemError::Sync(_))
    }
}

pub type Result<T> = std::result::Result<T, ModemError>;
