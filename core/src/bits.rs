//! Bit strings and their grouping into fixed-width symbols.
//!
//! Symbols are filled most-significant bit first. A short final chunk is
//! right-padded with zeros; the padding can only be removed again by a caller
//! that knows the true bit count.

use crate::error::{DecodeError, ModemError, Result};

/// One transmitted symbol, `0 <= symbol < 2^bits_per_symbol`.
pub type Symbol = u128;

/// Largest symbol width the packer handles.
pub const MAX_BITS_PER_SYMBOL: u32 = 127;

fn check_width(bits_per_symbol: u32) -> Result<()> {
    if bits_per_symbol == 0 || bits_per_symbol > MAX_BITS_PER_SYMBOL {
        return Err(ModemError::InvalidInput(format!(
            "symbol width {} is outside 1..={}",
            bits_per_symbol, MAX_BITS_PER_SYMBOL
        )));
    }
    Ok(())
}

/// Split `bits` into big-endian chunks of `bits_per_symbol`, zero-padding the last one.
pub fn pack(bits: &[bool], bits_per_symbol: u32) -> Result<Vec<Symbol>> {
    check_width(bits_per_symbol)?;
    let width = bits_per_symbol as usize;

    let symbols = bits
        .chunks(width)
        .map(|chunk| {
            let value = chunk
                .iter()
                .fold(0u128, |acc, &bit| (acc << 1) | bit as u128);
            // Right-pad a short chunk so its bits stay in the high positions.
            value << (width - chunk.len())
        })
        .collect();

    Ok(symbols)
}

/// Inverse of [`pack`]: expand `symbols` and keep exactly `total_bits` bits.
///
/// Fails if the symbols carry fewer than `total_bits` bits or if a symbol has
/// bits set above `bits_per_symbol`.
pub fn unpack(symbols: &[Symbol], bits_per_symbol: u32, total_bits: usize) -> Result<Vec<bool>> {
    check_width(bits_per_symbol)?;
    let width = bits_per_symbol as usize;

    let available_bits = symbols.len() * width;
    if total_bits > available_bits {
        return Err(DecodeError::TruncatedFrame {
            needed_bits: total_bits,
            available_bits,
        }
        .into());
    }

    let mut bits = Vec::with_capacity(available_bits);
    for &symbol in symbols {
        if symbol >> bits_per_symbol != 0 {
            return Err(DecodeError::SymbolOutOfAlphabet {
                symbol,
                bits_per_symbol,
            }
            .into());
        }
        bits.extend((0..width).rev().map(|shift| (symbol >> shift) & 1 == 1));
    }
    bits.truncate(total_bits);

    Ok(bits)
}

/// Parse a string of `'0'` / `'1'` characters. Whitespace and `_` are ignored.
pub fn parse_bits(text: &str) -> Result<Vec<bool>> {
    text.chars()
        .filter(|c| !c.is_whitespace() && *c != '_')
        .map(|c| match c {
            '0' => Ok(false),
            '1' => Ok(true),
            other => Err(ModemError::InvalidInput(format!(
                "'{}' is not a binary digit",
                other
            ))),
        })
        .collect()
}

pub fn format_bits(bits: &[bool]) -> String {
    bits.iter().map(|&bit| if bit { '1' } else { '0' }).collect()
}

/// Expand bytes into bits, most-significant bit of each byte first.
pub fn bits_from_bytes(bytes: &[u8]) -> Vec<bool> {
    bytes
        .iter()
        .flat_map(|&byte| (0..8).rev().map(move |shift| (byte >> shift) & 1 == 1))
        .collect()
}

/// Collect bits into bytes, zero-padding the final byte.
pub fn bytes_from_bits(bits: &[bool]) -> Vec<u8> {
    bits.chunks(8)
        .map(|chunk| {
            chunk
                .iter()
                .enumerate()
                .fold(0u8, |acc, (i, &bit)| acc | ((bit as u8) << (7 - i)))
        })
        .collect()
}
