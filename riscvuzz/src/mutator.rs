//! Post-generation amplification of instruction words.
//!
//! Every generated word can spawn up to two extra corpus entries: a copy
//! with a few random bits flipped, and a byte-reversed copy. Both reach
//! encodings the template catalog would never produce on its own.

use rand::Rng;
use rand::seq::index;

use crate::config::FuzzConfig;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WordMutator {
    flip_probability: f64,
    endian_probability: f64,
    max_flips: u32,
}

impl WordMutator {
    pub fn new(config: &FuzzConfig) -> Self {
        Self {
            flip_probability: config.flip_probability,
            endian_probability: config.endian_probability,
            max_flips: config.max_flips,
        }
    }

    /// With the configured flip probability, flips between one and
    /// `max_flips` distinct bits. Otherwise returns `word` unchanged.
    pub fn flip_bits<R: Rng + ?Sized>(&self, rng: &mut R, word: u32) -> u32 {
        if !rng.random_bool(self.flip_probability) {
            return word;
        }
        let max_flips = self.max_flips.clamp(1, u32::BITS) as usize;
        let count = rng.random_range(1..=max_flips);
        index::sample(rng, u32::BITS as usize, count)
            .into_iter()
            .fold(word, |acc, bit| acc ^ (1 << bit))
    }

    /// Appends zero, one or two derived words to `out`. The two draws are
    /// independent. The first copy goes through [`flip_bits`](Self::flip_bits),
    /// which is gated again, so it can equal `word`.
    pub fn augment<R: Rng + ?Sized>(&self, rng: &mut R, word: u32, out: &mut Vec<u32>) {
        if rng.random_bool(self.flip_probability) {
            out.push(self.flip_bits(rng, word));
        }
        if rng.random_bool(self.endian_probability) {
            out.push(flip_endian32(word));
        }
    }
}

/// Reverses the byte order of a word.
pub fn flip_endian32(word: u32) -> u32 {
    word.swap_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn mutator(flip_probability: f64, endian_probability: f64, max_flips: u32) -> WordMutator {
        WordMutator::new(&FuzzConfig {
            flip_probability,
            endian_probability,
            max_flips,
            ..FuzzConfig::default()
        })
    }

    #[test]
    fn flip_bits_is_noop_without_probability() {
        let mut rng = StdRng::seed_from_u64(1);
        let m = mutator(0.0, 0.0, 32);
        for word in [0, 0x13, 0xdead_beef, u32::MAX] {
            assert_eq!(m.flip_bits(&mut rng, word), word);
        }
    }

    #[test]
    fn hamming_distance_is_bounded() {
        let mut rng = StdRng::seed_from_u64(2);
        for max_flips in [1, 4, 32] {
            let m = mutator(1.0, 0.0, max_flips);
            for word in [0, 0x0000_0013, 0xffff_ffff, 0x1234_5678] {
                for _ in 0..200 {
                    let distance = (m.flip_bits(&mut rng, word) ^ word).count_ones();
                    assert!((1..=max_flips).contains(&distance), "distance {distance}");
                }
            }
        }
    }

    #[test]
    fn endian_flip_is_an_involution() {
        for word in [0, 0x13, 0x1234_5678, 0xdead_beef, u32::MAX] {
            assert_eq!(flip_endian32(flip_endian32(word)), word);
        }
        assert_eq!(flip_endian32(0x0000_0013), 0x1300_0000);
    }

    #[test]
    fn augment_appends_requested_copies() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut out = Vec::new();
        mutator(0.0, 0.0, 4).augment(&mut rng, 0x13, &mut out);
        assert!(out.is_empty());

        mutator(1.0, 1.0, 4).augment(&mut rng, 0x13, &mut out);
        assert_eq!(out.len(), 2);
        assert_ne!(out[0], 0x13);
        assert_eq!(out[1], 0x1300_0000);

        out.clear();
        mutator(0.0, 1.0, 4).augment(&mut rng, 0x13, &mut out);
        assert_eq!(out, vec![0x1300_0000]);
    }

    #[test]
    fn augment_copies_are_gated_twice() {
        let mut rng = StdRng::seed_from_u64(4);
        let m = mutator(0.5, 0.0, 4);
        let mut out = Vec::new();
        for _ in 0..2000 {
            m.augment(&mut rng, 0x13, &mut out);
        }
        // Appended about half the time, and flipped about half of those.
        let unchanged = out.iter().filter(|&&w| w == 0x13).count();
        let flipped = out.len() - unchanged;
        assert!((800..1200).contains(&out.len()), "appended {}", out.len());
        assert!(unchanged > 300 && flipped > 300, "unchanged {unchanged} flipped {flipped}");
    }
}
