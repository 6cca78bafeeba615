// Copyright (c) 2024-present, microforest-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

const SMIX_C1: u64 = 0x9e37_79b9_7f4a_7c15;
const SMIX_C2: u64 = 0xbf58_476d_1ce4_e5b9;
const SMIX_C3: u64 = 0x94d0_49bb_1331_11eb;

const FNV_OFFSET: u64 = 14_695_981_039_346_656_037;
const FNV_PRIME: u64 = 1_099_511_628_211;

fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(SMIX_C1);
    x = (x ^ (x >> 30)).wrapping_mul(SMIX_C2);
    x = (x ^ (x >> 27)).wrapping_mul(SMIX_C3);
    x ^ (x >> 31)
}

/// Deterministic PCG32 engine.
///
/// Substreams derived from the same base seed are independent, so each tree
/// can draw its bootstrap bag without consuming the forest-level stream.
#[derive(Clone, Debug)]
pub struct Rng {
    base_seed: u64,
    state: u64,
    inc: u64,
}

impl Rng {
    /// Creates an engine from a seed.
    #[must_use]
    pub fn new(seed: u64) -> Self {
        let mut rng = Self {
            base_seed: seed,
            state: 0,
            inc: 0,
        };
        rng.reseed(seed, seed ^ 0xda3e_39cb_94b9_5bdb);
        rng
    }

    fn reseed(&mut self, initstate: u64, initseq: u64) {
        self.state = 0;
        self.inc = (initseq << 1) | 1;
        self.next_u32();
        self.state = self.state.wrapping_add(initstate);
        self.next_u32();
    }

    /// Returns the seed this engine was created from.
    #[must_use]
    pub fn base_seed(&self) -> u64 {
        self.base_seed
    }

    /// Advances the engine and returns the next 32-bit output.
    pub fn next_u32(&mut self) -> u32 {
        let oldstate = self.state;
        self.state = oldstate
            .wrapping_mul(6_364_136_223_846_793_005)
            .wrapping_add(self.inc);
        #[allow(clippy::cast_possible_truncation)]
        let xorshifted = (((oldstate >> 18) ^ oldstate) >> 27) as u32;
        #[allow(clippy::cast_possible_truncation)]
        let rot = (oldstate >> 59) as u32;
        xorshifted.rotate_right(rot)
    }

    /// Returns a uniform value in `0..bound` (0 for bound 0).
    pub fn bounded(&mut self, bound: u32) -> u32 {
        if bound == 0 {
            return 0;
        }
        // Rejection threshold avoids modulo bias
        let threshold = bound.wrapping_neg() % bound;
        loop {
            let r = self.next_u32();
            if r >= threshold {
                return r % bound;
            }
        }
    }

    /// Returns a uniform float in `[0, 1]`.
    pub fn next_f32(&mut self) -> f32 {
        #[allow(clippy::cast_precision_loss)]
        {
            self.next_u32() as f32 / u32::MAX as f32
        }
    }

    /// Derives an independent substream.
    ///
    /// The derivation is a pure function of `(base_seed, stream, nonce)`, so
    /// tree `i` always sees the same bag for a given forest seed.
    #[must_use]
    pub fn derive(&self, stream: u64, nonce: u64) -> Self {
        let s = splitmix64(self.base_seed ^ stream.wrapping_mul(SMIX_C1).wrapping_add(nonce));
        let inc = splitmix64(
            self.base_seed
                .wrapping_add(stream << 1)
                .wrapping_add(0x632b_e59b_d9b4_e019),
        );
        let mut rng = Self {
            base_seed: s,
            state: 0,
            inc: 0,
        };
        rng.reseed(s, inc);
        rng
    }
}

/// FNV-1a over a byte slice.
#[must_use]
pub fn hash_bytes(data: &[u8]) -> u64 {
    let mut h = FNV_OFFSET;
    for byte in data {
        h ^= u64::from(*byte);
        h = h.wrapping_mul(FNV_PRIME);
    }
    h
}

/// FNV-1a over a sample-ID vector, for cache-key purposes.
///
/// The element count is folded in so a prefix never collides with the full
/// vector.
#[must_use]
pub fn hash_sample_ids(ids: &[u32]) -> u64 {
    let mut h = FNV_OFFSET;
    for id in ids {
        for byte in id.to_le_bytes() {
            h ^= u64::from(byte);
            h = h.wrapping_mul(FNV_PRIME);
        }
    }
    for byte in (ids.len() as u64).to_le_bytes() {
        h ^= u64::from(byte);
        h = h.wrapping_mul(FNV_PRIME);
    }
    h
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn rng_deterministic() {
        let mut a = Rng::new(37);
        let mut b = Rng::new(37);
        for _ in 0..100 {
            assert_eq!(a.next_u32(), b.next_u32());
        }
    }

    #[test]
    fn rng_seed_changes_stream() {
        let mut a = Rng::new(37);
        let mut b = Rng::new(38);
        let same = (0..32).filter(|_| a.next_u32() == b.next_u32()).count();
        assert!(same < 4);
    }

    #[test]
    fn rng_bounded_in_range() {
        let mut rng = Rng::new(1234);
        for _ in 0..1_000 {
            assert!(rng.bounded(10) < 10);
        }
        assert_eq!(0, rng.bounded(0));
        assert_eq!(0, rng.bounded(1));
    }

    #[test]
    fn rng_derive_is_stable_and_independent() {
        let root = Rng::new(42);

        let mut s1 = root.derive(1, 0);
        let mut s1_again = root.derive(1, 0);
        let mut s2 = root.derive(2, 0);

        let a: Vec<u32> = (0..16).map(|_| s1.next_u32()).collect();
        let b: Vec<u32> = (0..16).map(|_| s1_again.next_u32()).collect();
        let c: Vec<u32> = (0..16).map(|_| s2.next_u32()).collect();

        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn fnv_known_value() {
        // FNV-1a of empty input is the offset basis
        assert_eq!(14_695_981_039_346_656_037, hash_bytes(b""));
        assert_ne!(hash_bytes(b"a"), hash_bytes(b"b"));
    }

    #[test]
    fn id_hash_senses_length() {
        assert_ne!(hash_sample_ids(&[1, 2]), hash_sample_ids(&[1, 2, 0]));
    }
}
