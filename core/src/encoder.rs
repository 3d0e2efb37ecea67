use crate::bits::Symbol;
use crate::config::Params;
use crate::error::Result;
use crate::framing::{Frame, FrameEncoder};
use crate::sync::generate_chirp;
use crate::tones::ToneModulator;

/// The three playback phases of one transmission, fully synthesized.
#[derive(Debug, Clone, PartialEq)]
pub struct Transmission {
    pub preamble: Vec<f32>,
    pub guard: Vec<f32>,
    pub data: Vec<f32>,
}

impl Transmission {
    pub fn len(&self) -> usize {
        self.preamble.len() + self.guard.len() + self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Concatenate the phases into one waveform.
    pub fn into_samples(self) -> Vec<f32> {
        let mut samples = self.preamble;
        samples.reserve(self.guard.len() + self.data.len());
        samples.extend_from_slice(&self.guard);
        samples.extend_from_slice(&self.data);
        samples
    }
}

/// Encoder for the chirp-synchronized multi-tone link.
///
/// Output layout: chirp, `guard_gap` seconds of silence, then one
/// `samples_per_symbol` window per frame symbol.
pub struct Encoder {
    params: Params,
    modulator: ToneModulator,
    chirp: Vec<f32>,
}

impl Encoder {
    pub fn new(params: &Params) -> Self {
        Self {
            params: params.clone(),
            modulator: ToneModulator::new(params),
            chirp: generate_chirp(params),
        }
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    /// Frame `bits` behind the length field and pack them into symbols.
    pub fn frame_symbols(&self, bits: &[bool]) -> Result<Vec<Symbol>> {
        let frame = Frame {
            payload: bits.to_vec(),
        };
        FrameEncoder::encode(&frame, &self.params)
    }

    /// Synthesize every phase up front so playback only copies samples.
    pub fn prepare(&self, bits: &[bool]) -> Result<Transmission> {
        let symbols = self.frame_symbols(bits)?;
        let data = self.modulator.modulate(&symbols)?;

        log::info!(
            "encoded {} payload bits into {} symbols ({} data samples)",
            bits.len(),
            symbols.len(),
            data.len()
        );

        Ok(Transmission {
            preamble: self.chirp.clone(),
            guard: vec![0.0; self.params.guard_samples()],
            data,
        })
    }

    /// Encode `bits` into a single waveform.
    pub fn encode(&self, bits: &[bool]) -> Result<Vec<f32>> {
        Ok(self.prepare(bits)?.into_samples())
    }
}
