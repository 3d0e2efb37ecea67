use crate::bits::{pack, unpack, Symbol};
use crate::config::Params;
use crate::error::{DecodeError, ModemError, Result};

/// Length-prefixed payload as carried in the data region.
///
/// Wire layout, most-significant bit first:
/// `length (length_field_bits) | payload | zero padding to a symbol boundary`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub payload: Vec<bool>,
}

pub struct FrameEncoder;
pub struct FrameDecoder;

impl FrameEncoder {
    /// Serialize the frame into bits, padding included.
    pub fn encode_bits(frame: &Frame, params: &Params) -> Result<Vec<bool>> {
        let payload_bits = frame.payload.len();
        if payload_bits as u64 > params.max_payload_bits() {
            return Err(ModemError::PayloadTooLong {
                payload_bits,
                max_bits: params.max_payload_bits(),
            });
        }

        let field = params.length_field_bits();
        let mut bits = Vec::with_capacity(field + payload_bits + params.bits_per_symbol() as usize);
        bits.extend((0..field).rev().map(|shift| ((payload_bits as u64) >> shift) & 1 == 1));
        bits.extend_from_slice(&frame.payload);

        let width = params.bits_per_symbol() as usize;
        let padded = bits.len().div_ceil(width) * width;
        bits.resize(padded, false);

        Ok(bits)
    }

    /// Serialize the frame straight into transmit symbols.
    pub fn encode(frame: &Frame, params: &Params) -> Result<Vec<Symbol>> {
        let bits = Self::encode_bits(frame, params)?;
        pack(&bits, params.bits_per_symbol())
    }
}

impl FrameDecoder {
    /// Read the payload length from the leading symbols of a frame.
    ///
    /// Only the first [`Params::header_symbols`] symbols are consulted.
    pub fn decode_length(symbols: &[Symbol], params: &Params) -> Result<u64> {
        let field = params.length_field_bits();
        let header = &symbols[..symbols.len().min(params.header_symbols())];
        let bits = unpack(header, params.bits_per_symbol(), field)?;
        Ok(bits.iter().fold(0u64, |acc, &bit| (acc << 1) | bit as u64))
    }

    /// Decode a complete frame. Padding is removed using the length field only.
    pub fn decode(symbols: &[Symbol], params: &Params) -> Result<Frame> {
        let payload_bits = Self::decode_length(symbols, params)?;
        let field = params.length_field_bits();
        let available_bits = symbols.len() * params.bits_per_symbol() as usize;

        let total_bits = usize::try_from(payload_bits)
            .ok()
            .and_then(|bits| bits.checked_add(field))
            .ok_or(DecodeError::TruncatedFrame {
                needed_bits: usize::MAX,
                available_bits,
            })?;

        let bits = unpack(symbols, params.bits_per_symbol(), total_bits)?;
        Ok(Frame {
            payload: bits[field..].to_vec(),
        })
    }
}
