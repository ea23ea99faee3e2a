use xxhash_rust::xxh64::xxh64;

const FINGERPRINT_SEED: u64 = u64::from_le_bytes(*b"BHIXFPRT");

/// The top `bits` bits of a seeded hash of `key`.
///
/// The seed is independent of the seeds the perfect hash uses, so the
/// fingerprint is independent of the slot a key lands in.
#[inline]
pub fn fingerprint(key: &[u8], bits: u32) -> u64 {
    if bits == 0 {
        return 0;
    }
    debug_assert!(bits <= 64);
    xxh64(key, FINGERPRINT_SEED) >> (64 - bits)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn width_is_respected() {
        for bits in [1, 8, 17, 32, 64] {
            let f = fingerprint(b"hello", bits);
            if bits < 64 {
                assert!(f < 1 << bits);
            }
        }
        assert_eq!(fingerprint(b"hello", 0), 0);
        assert_eq!(fingerprint(b"hello", 16), fingerprint(b"hello", 16));
        assert_ne!(fingerprint(b"hello", 32), fingerprint(b"hellp", 32));
    }
}
