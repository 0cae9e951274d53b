//! Deterministic hashing for cohort buckets and per-request seeds.
//!
//! Not cryptographic. The only requirement is stability across processes,
//! platforms and releases, so `std`'s randomized `DefaultHasher` is out.

/// FNV-1a over the bytes of `s`, mixed with `seed` through a SplitMix64
/// finalizer for better bit diffusion.
#[must_use]
pub fn stable_hash64(seed: u64, s: &str) -> u64 {
    let mut h: u64 = 0xcbf2_9ce4_8422_2325;
    for b in s.as_bytes() {
        h ^= u64::from(*b);
        h = h.wrapping_mul(0x0100_0000_01b3);
    }
    splitmix64(seed ^ h)
}

#[inline]
fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9E37_79B9_7F4A_7C15);
    let mut z = x;
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_stable_and_seed_sensitive() {
        assert_eq!(stable_hash64(0, "user-1"), stable_hash64(0, "user-1"));
        assert_ne!(stable_hash64(0, "user-1"), stable_hash64(0, "user-2"));
        assert_ne!(stable_hash64(0, "user-1"), stable_hash64(1, "user-1"));
    }
}
