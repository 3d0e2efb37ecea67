//! Mixed-radix mapping between a symbol and its per-band tone selection.
//!
//! Every band has the same radix, `states_per_band`. Band 0 (the lowest
//! frequencies) carries the least-significant digit; this ordering is part of
//! the wire format.

use crate::bits::Symbol;
use crate::config::Params;
use crate::error::{DecodeError, ModemError, Result};

/// One state index per band, in increasing band order.
pub type BandStateVector = Vec<u32>;

/// Decompose `symbol` into `band_count` digits of radix `states_per_band`.
///
/// Digits above the most significant band are discarded, so callers must keep
/// `symbol < states_per_band ^ band_count`.
pub fn to_states(symbol: Symbol, states_per_band: u32, band_count: usize) -> BandStateVector {
    let radix = states_per_band as u128;
    let mut rest = symbol;
    (0..band_count)
        .map(|_| {
            let digit = (rest % radix) as u32;
            rest /= radix;
            digit
        })
        .collect()
}

/// Recombine digits produced by [`to_states`].
pub fn from_states(states: &[u32], states_per_band: u32) -> Result<Symbol> {
    let radix = states_per_band as u128;
    let mut symbol: u128 = 0;
    for (band, &state) in states.iter().enumerate().rev() {
        if state >= states_per_band {
            return Err(DecodeError::StateOutOfRange {
                band,
                state,
                states_per_band,
            }
            .into());
        }
        symbol = symbol
            .checked_mul(radix)
            .and_then(|s| s.checked_add(state as u128))
            .ok_or_else(|| {
                ModemError::InvalidInput(format!(
                    "{} bands of radix {} overflow a 128-bit symbol",
                    states.len(),
                    states_per_band
                ))
            })?;
    }
    Ok(symbol)
}

/// Map an outgoing symbol to its state vector, refusing symbols the link never sends.
pub fn encode_symbol(params: &Params, symbol: Symbol) -> Result<BandStateVector> {
    if symbol >= params.symbol_limit() {
        return Err(ModemError::InvalidInput(format!(
            "symbol {} does not fit in {} bits",
            symbol,
            params.bits_per_symbol()
        )));
    }
    Ok(to_states(symbol, params.states_per_band(), params.band_count()))
}

/// Map an observed state vector back to a symbol.
///
/// A vector that lands in the unused top of the alphabet means the frame is
/// corrupt or misaligned and is reported, never wrapped.
pub fn decode_states(params: &Params, states: &[u32]) -> Result<Symbol> {
    if states.len() != params.band_count() {
        return Err(ModemError::InvalidInput(format!(
            "expected {} band states, got {}",
            params.band_count(),
            states.len()
        )));
    }
    let symbol = from_states(states, params.states_per_band())?;
    if symbol >= params.symbol_limit() {
        return Err(DecodeError::SymbolOutOfAlphabet {
            symbol,
            bits_per_symbol: params.bits_per_symbol(),
        }
        .into());
    }
    Ok(symbol)
}
