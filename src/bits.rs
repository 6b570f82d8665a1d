//! Bit-field helpers shared by every driver
//!
//! Device configuration registers pack several logical settings into one
//! byte, so all register updates go through `set_masked_bits` to avoid
//! clobbering sibling fields. All failure cases are surfaced as errors
//! rather than silently returning a default.

/// Bit manipulation error object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitError {
    /// Bit index outside 0..=7
    BadIndex(u8),
    /// Inclusive range with start >= end or an index outside 0..=7
    BadRange(u8, u8),
    /// Value has more active bits than the target mask can hold
    ValueTooWide(u8, u8),
}

/// Test a single bit of a byte
pub fn test_bit(byte: u8, index: u8) -> Result<bool, BitError> {
    if index > 7 {
        return Err(BitError::BadIndex(index));
    }

    Ok(byte & (1 << index) != 0)
}

/// Set or clear a single bit of a byte
pub fn set_bit(byte: u8, index: u8, value: bool) -> Result<u8, BitError> {
    if index > 7 {
        return Err(BitError::BadIndex(index));
    }

    let out = match value {
        true => byte | (1 << index),
        false => byte & !(1 << index),
    };

    Ok(out)
}

/// Replace the bits of `byte` selected by `mask` with `value`
///
/// `value` is given right-aligned and is shifted up to the mask's lowest
/// set bit before merging. A value wider than the mask is rejected, since
/// truncating it would corrupt adjacent fields.
pub fn set_masked_bits(byte: u8, value: u8, mask: u8) -> Result<u8, BitError> {
    // An empty mask selects no field at all, which is a caller error
    if mask == 0 || value.count_ones() > mask.count_ones() {
        return Err(BitError::ValueTooWide(value, mask));
    }

    let shift = mask.trailing_zeros();
    let aligned = value << shift;

    if aligned & !mask != 0 {
        return Err(BitError::ValueTooWide(value, mask));
    }

    Ok((byte & !mask) | aligned)
}

/// Extract an inclusive bit range of a byte, right-aligned
pub fn extract_bits(byte: u8, start: u8, end: u8) -> Result<u8, BitError> {
    if start >= end || start > 7 || end > 7 {
        return Err(BitError::BadRange(start, end));
    }

    let width = end - start + 1;
    let mask = if width == 8 { 0xFF } else { ((1u16 << width) - 1) as u8 };

    Ok((byte >> start) & mask)
}

/// Compose a 16-bit value from two bytes, big endian
pub fn combine_bytes(msb: u8, lsb: u8) -> u16 {
    (msb as u16) << 8 | lsb as u16
}

/// Split a 16-bit value into (msb, lsb)
pub fn split_word(word: u16) -> (u8, u8) {
    ((word >> 8) as u8, (word & 0xFF) as u8)
}
