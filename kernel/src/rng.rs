//! RNG utilities — non-cryptographic fast path (xorshift64*)
//!
//! The dispatcher's randomized priority mixing draws from here. Nothing in
//! this module is suitable for keys or tokens.

use core::sync::atomic::{AtomicU64, Ordering};

static RNG_STATE: AtomicU64 = AtomicU64::new(0x9E37_79B9_7F4A_7C15);

/// Re-seed the generator. Seed 0 is remapped, xorshift has no zero state.
pub fn seed(value: u64) {
    let v = if value == 0 { 0x9E37_79B9_7F4A_7C15 } else { value };
    RNG_STATE.store(v, Ordering::Relaxed);
}

/// Next value of the xorshift64* sequence.
pub fn next_u64() -> u64 {
    let mut x = RNG_STATE.load(Ordering::Relaxed);
    x ^= x >> 12;
    x ^= x << 25;
    x ^= x >> 27;
    RNG_STATE.store(x, Ordering::Relaxed);
    x.wrapping_mul(0x2545_F491_4F6C_DD1D)
}

/// 15-bit draw in `0..=0x7fff`, the range the scheduler's skip check uses.
pub fn next_u15() -> u16 {
    (next_u64() >> 33) as u16 & 0x7fff
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_is_deterministic() {
        seed(42);
        let a = [next_u64(), next_u64(), next_u64()];
        seed(42);
        let b = [next_u64(), next_u64(), next_u64()];
        assert_eq!(a, b);
    }

    #[test]
    fn test_u15_range() {
        seed(7);
        for _ in 0..1000 {
            assert!(next_u15() <= 0x7fff);
        }
    }
}
