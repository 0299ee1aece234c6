//! Compact target decoding and accumulated-work arithmetic.

use std::fmt;

use primitive_types::U256;

pub type Worksum = U256;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CompactError {
    Negative,
    Overflow,
    ZeroTarget,
}

impl fmt::Display for CompactError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompactError::Negative => write!(f, "compact target has negative sign bit"),
            CompactError::Overflow => write!(f, "compact target overflows 256-bit range"),
            CompactError::ZeroTarget => write!(f, "compact target is zero"),
        }
    }
}

impl std::error::Error for CompactError {}

pub fn compact_to_target(bits: u32) -> Result<U256, CompactError> {
    let size = bits >> 24;
    let word = bits & 0x007f_ffff;
    let negative = (bits & 0x0080_0000) != 0;

    if negative {
        return Err(CompactError::Negative);
    }

    let value = if size <= 3 {
        U256::from(word >> (8 * (3 - size)))
    } else {
        U256::from(word) << (8 * (size - 3))
    };

    if word != 0 {
        let overflow = size > 34 || (word > 0xff && size > 33) || (word > 0xffff && size > 32);
        if overflow {
            return Err(CompactError::Overflow);
        }
    }

    if value.is_zero() {
        return Err(CompactError::ZeroTarget);
    }
    Ok(value)
}

// Expected number of hash attempts to find a block at this target,
// ~target_space / (target + 1) computed as (~t / (t+1)) + 1.
pub fn header_proof(bits: u32) -> Result<U256, CompactError> {
    let target = compact_to_target(bits)?;
    Ok((!target / (target + U256::one())) + U256::one())
}

pub fn worksum_to_f64(work: Worksum) -> f64 {
    let mut out = 0.0f64;
    for i in (0..4).rev() {
        out = out * 18446744073709551616.0 + work.0[i] as f64;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_negative_sign_bit() {
        assert_eq!(compact_to_target(0x0180_0000), Err(CompactError::Negative));
    }

    #[test]
    fn rejects_overflowing_exponent() {
        assert_eq!(compact_to_target(0xff12_3456), Err(CompactError::Overflow));
    }

    #[test]
    fn small_exponent_shifts_down() {
        let target = compact_to_target(0x0101_0000).expect("target");
        assert_eq!(target, U256::from(1u32));
    }

    #[test]
    fn harder_target_means_more_work() {
        let easy = header_proof(0x2100_ffff).expect("easy");
        let hard = header_proof(0x1d00_ffff).expect("hard");
        assert!(hard > easy);
    }

    #[test]
    fn worksum_to_f64_tracks_magnitude() {
        let small = worksum_to_f64(U256::from(1000u32));
        assert!((small - 1000.0).abs() < 1e-9);
        let big = worksum_to_f64(U256::from(u64::MAX) * U256::from(4u32));
        assert!(big > 7.0e19);
    }
}
