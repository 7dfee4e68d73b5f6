//! Biased operand sampling.
//!
//! Each draw first tries the configured special values (register indices and
//! immediates that tend to hit corner cases) and otherwise falls back to a
//! uniform value over the legal range. Draws are independent of one another.

use rand::Rng;

use crate::config::SamplerConfig;
use crate::constants::{REGISTER_COUNT, RESERVED_GPR};

/// Small aligned branch offsets, so a share of generated branches lands on
/// nearby instructions of the same batch.
const NEAR_BRANCH_OFFSETS: [i64; 8] = [-16, -12, -8, -4, 4, 8, 12, 16];

#[derive(Debug, Clone)]
pub struct OperandSampler {
    config: SamplerConfig,
}

impl OperandSampler {
    pub fn new(config: SamplerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SamplerConfig {
        &self.config
    }

    /// Picks a general purpose register. `x9` is never returned, nor is any
    /// index in `exclude`, nor `x0` when `avoid_zero` is set. Special values
    /// that are excluded are skipped, and if none are left the draw is uniform.
    ///
    /// If the filters rule out all 32 registers, `x0` is returned even when
    /// `avoid_zero` is set.
    pub fn pick_gpr<R: Rng + ?Sized>(&self, rng: &mut R, avoid_zero: bool, exclude: &[u8]) -> u8 {
        let allowed = |r: u8| r != RESERVED_GPR && !exclude.contains(&r) && !(avoid_zero && r == 0);
        pick_register(rng, &self.config.special_gprs, self.config.gpr_special_prob, allowed)
    }

    pub fn pick_fpr<R: Rng + ?Sized>(&self, rng: &mut R) -> u8 {
        pick_register(rng, &self.config.special_fprs, self.config.fpr_special_prob, |_| true)
    }

    pub fn pick_vreg<R: Rng + ?Sized>(&self, rng: &mut R) -> u8 {
        pick_register(rng, &self.config.special_vregs, self.config.vreg_special_prob, |_| true)
    }

    /// Special signed immediates usable at `bits` width: the configured
    /// values that fit plus the width's minimum and maximum.
    pub fn special_simms(&self, bits: u32) -> Vec<i64> {
        let (min, max) = signed_range(bits);
        let mut out: Vec<i64> = self
            .config
            .special_simms
            .iter()
            .copied()
            .filter(|v| (min..=max).contains(v))
            .collect();
        for extreme in [min, max] {
            if !out.contains(&extreme) {
                out.push(extreme);
            }
        }
        out
    }

    /// Same as [`special_simms`](Self::special_simms) for unsigned fields.
    pub fn special_uimms(&self, bits: u32) -> Vec<u64> {
        let max = unsigned_max(bits);
        let mut out: Vec<u64> = self
            .config
            .special_uimms
            .iter()
            .copied()
            .filter(|v| *v <= max)
            .collect();
        for extreme in [0, max] {
            if !out.contains(&extreme) {
                out.push(extreme);
            }
        }
        out
    }

    /// A two's-complement immediate in `[-2^(bits-1), 2^(bits-1))`.
    pub fn rand_simm<R: Rng + ?Sized>(&self, rng: &mut R, bits: u32) -> i64 {
        if rng.random_bool(self.config.imm_special_prob) {
            let specials = self.special_simms(bits);
            return specials[rng.random_range(0..specials.len())];
        }
        let (min, max) = signed_range(bits);
        rng.random_range(min..=max)
    }

    /// An unsigned immediate in `[0, 2^bits)`.
    pub fn rand_uimm<R: Rng + ?Sized>(&self, rng: &mut R, bits: u32) -> u64 {
        if rng.random_bool(self.config.imm_special_prob) {
            let specials = self.special_uimms(bits);
            return specials[rng.random_range(0..specials.len())];
        }
        rng.random_range(0..=unsigned_max(bits))
    }

    /// An even 13-bit branch offset.
    pub fn branch_offset<R: Rng + ?Sized>(&self, rng: &mut R) -> i64 {
        if rng.random_bool(0.5) {
            NEAR_BRANCH_OFFSETS[rng.random_range(0..NEAR_BRANCH_OFFSETS.len())]
        } else {
            self.rand_simm(rng, 13) & !1
        }
    }

    /// An even 21-bit jump offset.
    pub fn jump_offset<R: Rng + ?Sized>(&self, rng: &mut R) -> i64 {
        self.rand_simm(rng, 21) & !1
    }
}

fn pick_register<R, F>(rng: &mut R, specials: &[u8], special_prob: f64, allowed: F) -> u8
where
    R: Rng + ?Sized,
    F: Fn(u8) -> bool,
{
    if rng.random_bool(special_prob) {
        let usable: Vec<u8> = specials.iter().copied().filter(|&r| allowed(r)).collect();
        if !usable.is_empty() {
            return usable[rng.random_range(0..usable.len())];
        }
    }
    let legal: Vec<u8> = (0..REGISTER_COUNT).filter(|&r| allowed(r)).collect();
    if legal.is_empty() {
        // The caller excluded the whole register file.
        return 0;
    }
    legal[rng.random_range(0..legal.len())]
}

fn signed_range(bits: u32) -> (i64, i64) {
    let half = 1i64 << (bits - 1);
    (-half, half - 1)
}

fn unsigned_max(bits: u32) -> u64 {
    (1u64 << bits) - 1
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::DEFAULT_SPECIAL_SIMMS;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    const DRAWS: usize = 2000;

    fn sampler_with(imm_special_prob: f64, gpr_special_prob: f64) -> OperandSampler {
        OperandSampler::new(SamplerConfig {
            imm_special_prob,
            gpr_special_prob,
            ..SamplerConfig::default()
        })
    }

    #[test]
    fn special_immediates_only_when_forced() {
        let mut rng = StdRng::seed_from_u64(7);
        let sampler = sampler_with(1.0, 0.0);
        for _ in 0..DRAWS {
            let imm = sampler.rand_simm(&mut rng, 12);
            assert!(DEFAULT_SPECIAL_SIMMS.contains(&imm), "{imm} is not special");
        }
    }

    #[test]
    fn uniform_immediates_stay_in_range() {
        let mut rng = StdRng::seed_from_u64(8);
        let sampler = sampler_with(0.0, 0.0);
        let mut seen_negative = false;
        for _ in 0..DRAWS {
            let imm = sampler.rand_simm(&mut rng, 12);
            assert!((-2048..=2047).contains(&imm));
            seen_negative |= imm < 0;

            let uimm = sampler.rand_uimm(&mut rng, 5);
            assert!(uimm < 32);
        }
        assert!(seen_negative);
    }

    #[test]
    fn specials_are_clipped_to_the_field_width() {
        let sampler = sampler_with(1.0, 0.0);
        let simms = sampler.special_simms(5);
        assert!(simms.contains(&-16) && simms.contains(&15));
        assert!(!simms.contains(&2047));

        let uimms = sampler.special_uimms(5);
        assert!(uimms.contains(&31));
        assert!(!uimms.contains(&4095));
    }

    #[test]
    fn reserved_register_is_never_picked() {
        let mut rng = StdRng::seed_from_u64(9);
        for special_prob in [0.0, 1.0] {
            let mut sampler = sampler_with(0.0, special_prob);
            sampler.config.special_gprs = vec![9, 3];
            for _ in 0..DRAWS {
                assert_ne!(sampler.pick_gpr(&mut rng, false, &[]), RESERVED_GPR);
            }
        }
    }

    #[test]
    fn caller_exclusions_and_zero_avoidance() {
        let mut rng = StdRng::seed_from_u64(10);
        let sampler = sampler_with(0.0, 0.5);
        for _ in 0..DRAWS {
            let r = sampler.pick_gpr(&mut rng, true, &[1, 2]);
            assert!(r < 32);
            assert!(![0, 1, 2, 9].contains(&r), "picked x{r}");
        }
    }

    #[test]
    fn fully_excluded_register_file_falls_back_to_zero() {
        let mut rng = StdRng::seed_from_u64(12);
        let everything: Vec<u8> = (0..32).collect();
        for special_prob in [0.0, 1.0] {
            let sampler = sampler_with(0.0, special_prob);
            assert_eq!(sampler.pick_gpr(&mut rng, true, &everything), 0);
        }
    }

    #[test]
    fn jump_and_branch_offsets_are_even() {
        let mut rng = StdRng::seed_from_u64(11);
        let sampler = sampler_with(0.5, 0.0);
        for _ in 0..DRAWS {
            let b = sampler.branch_offset(&mut rng);
            assert_eq!(b & 1, 0);
            assert!((-4096..4096).contains(&b));
            let j = sampler.jump_offset(&mut rng);
            assert_eq!(j & 1, 0);
            assert!((-(1 << 20)..(1 << 20)).contains(&j));
        }
    }
}
