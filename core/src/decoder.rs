use crate::config::Params;
use crate::error::{DecodeError, Result};
use crate::framing::FrameDecoder;
use crate::sync::PreambleDetector;
use crate::tones::ToneDemodulator;

/// Decoder for complete recordings of one transmission.
///
/// Finds the chirp, skips the guard gap, reads the length field from the
/// first symbols and then demodulates exactly as many symbols as the frame
/// needs. Anything after the frame is ignored.
pub struct Decoder {
    params: Params,
    detector: PreambleDetector,
    demodulator: ToneDemodulator,
}

impl Decoder {
    pub fn new(params: &Params) -> Self {
        Self {
            params: params.clone(),
            detector: PreambleDetector::new(params),
            demodulator: ToneDemodulator::new(params),
        }
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    pub fn detector(&self) -> &PreambleDetector {
        &self.detector
    }

    /// Decode the payload bits carried by `samples`.
    pub fn decode(&self, samples: &[f32]) -> Result<Vec<bool>> {
        let sync = self.detector.detect(samples)?;
        let start = self.detector.locate_data_start(samples, &sync)?;
        let data = samples.get(start..).unwrap_or(&[]);
        self.decode_data(data).inspect_err(|e| {
            log::warn!("discarding frame at sample {}: {}", start, e);
        })
    }

    /// Decode a data region that starts exactly on the first symbol.
    pub fn decode_data(&self, data: &[f32]) -> Result<Vec<bool>> {
        let payload_bits = self.payload_length(data)?;
        self.decode_frame(data, payload_bits)
    }

    /// Read the length field from the header symbols at the start of `data`.
    pub fn payload_length(&self, data: &[f32]) -> Result<u64> {
        let header_samples = self.params.header_symbols() * self.params.samples_per_symbol();
        if data.len() < header_samples {
            return Err(DecodeError::TruncatedFrame {
                needed_bits: self.params.length_field_bits(),
                available_bits: self.available_bits(data),
            }
            .into());
        }

        let header = self.demodulator.demodulate(&data[..header_samples])?;
        let payload_bits = FrameDecoder::decode_length(&header, &self.params)?;
        log::debug!("length field announces {} payload bits", payload_bits);
        Ok(payload_bits)
    }

    /// Demodulate the whole frame for a known payload length.
    pub fn decode_frame(&self, data: &[f32], payload_bits: u64) -> Result<Vec<bool>> {
        let field = self.params.length_field_bits();
        let needed_bits = usize::try_from(payload_bits)
            .ok()
            .and_then(|bits| bits.checked_add(field))
            .unwrap_or(usize::MAX);
        let symbol_count = needed_bits.div_ceil(self.params.bits_per_symbol() as usize);
        let frame_samples = symbol_count.saturating_mul(self.params.samples_per_symbol());

        if data.len() < frame_samples {
            return Err(DecodeError::TruncatedFrame {
                needed_bits,
                available_bits: self.available_bits(data),
            }
            .into());
        }

        let symbols = self.demodulator.demodulate(&data[..frame_samples])?;
        let frame = FrameDecoder::decode(&symbols, &self.params)?;
        log::info!(
            "decoded {} payload bits from {} symbols",
            frame.payload.len(),
            symbols.len()
        );
        Ok(frame.payload)
    }

    fn available_bits(&self, data: &[f32]) -> usize {
        (data.len() / self.params.samples_per_symbol()) * self.params.bits_per_symbol() as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bits::{format_bits, parse_bits};
    use crate::config::ModemConfig;
    use crate::encoder::Encoder;
    use crate::error::ModemError;

    fn voice_params() -> Params {
        Params::derive(&ModemConfig::voice_band()).unwrap()
    }

    #[test]
    fn test_decode_clean_waveform() {
        let params = voice_params();
        let bits = parse_bits("1011001101").unwrap();
        let samples = Encoder::new(&params).encode(&bits).unwrap();
        let decoded = Decoder::new(&params).decode(&samples).unwrap();
        assert_eq!(format_bits(&decoded), "1011001101");
    }

    #[test]
    fn test_decode_ignores_trailing_audio() {
        let params = voice_params();
        let bits = parse_bits("111000111").unwrap();
        let mut samples = vec![0.0; 777];
        samples.extend(Encoder::new(&params).encode(&bits).unwrap());
        samples.extend((0..3000).map(|i| (i as f32 * 0.05).sin() * 0.3));
        assert_eq!(Decoder::new(&params).decode(&samples).unwrap(), bits);
    }

    #[test]
    fn test_truncated_recording() {
        let params = voice_params();
        let bits = vec![true; 100];
        let samples = Encoder::new(&params).encode(&bits).unwrap();
        let cut = samples.len() - params.samples_per_symbol();
        let err = Decoder::new(&params).decode(&samples[..cut]).unwrap_err();
        assert!(matches!(
            err,
            ModemError::Decode(DecodeError::TruncatedFrame { needed_bits: 116, .. })
        ));
    }

    #[test]
    fn test_missing_header() {
        let params = voice_params();
        let decoder = Decoder::new(&params);
        let err = decoder.payload_length(&[0.0; 10]).unwrap_err();
        assert!(matches!(
            err,
            ModemError::Decode(DecodeError::TruncatedFrame { needed_bits: 16, available_bits: 0 })
        ));
    }
}
