//! Corpus generation.
//!
//! A [`GeneratorSession`] owns everything a single generation run mutates:
//! the random source, the FENCE.I flag, and the sampler and mutator built
//! from the run's config. Sessions never share state, so two of them can
//! run side by side.

use std::fmt::Write as _;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::catalog::{Catalog, CatalogError, Format, InstructionTemplate};
use crate::config::{FuzzConfig, Xlen};
use crate::constants::WORD_LEN;
use crate::encoder::{Operands, encode};
use crate::mutator::WordMutator;
use crate::sampler::OperandSampler;

/// The ordered instruction words of one fuzz run. Frozen once generated.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Corpus {
    words: Vec<u32>,
}

impl Corpus {
    pub fn new(words: Vec<u32>) -> Self {
        Self { words }
    }

    pub fn words(&self) -> &[u32] {
        &self.words
    }

    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    /// Number of data batches needed to send the corpus in slices of
    /// `batch_size`.
    pub fn batch_count(&self, batch_size: usize) -> usize {
        self.words.len().div_ceil(batch_size)
    }

    /// One `0x%08x` word per line.
    pub fn to_hex(&self) -> String {
        let mut out = String::with_capacity(self.words.len() * 11);
        for word in &self.words {
            let _ = writeln!(out, "{word:#010x}");
        }
        out
    }

    /// A C translation unit defining `fuzz_buffer` and `fuzz_buffer_len`,
    /// ready to be linked into a bare-metal test harness.
    pub fn to_c_array(&self) -> String {
        let mut out = String::from("#include <stdint.h>\n#include <stddef.h>\n\n");
        out.push_str("uint32_t fuzz_buffer[] = {\n");
        for chunk in self.words.chunks(8) {
            let line: Vec<String> = chunk.iter().map(|w| format!("{w:#010x}")).collect();
            let _ = writeln!(out, "    {},", line.join(", "));
        }
        out.push_str("};\n\n");
        let _ = writeln!(out, "const size_t fuzz_buffer_len = {};", self.words.len());
        out
    }

    /// Raw little-endian image, the byte order a RISC-V core fetches.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        self.words.iter().flat_map(|w| w.to_le_bytes()).collect()
    }

    /// Parses a raw little-endian image. Returns `None` when the length is
    /// not a whole number of words.
    pub fn from_le_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() % WORD_LEN != 0 {
            return None;
        }
        let words = bytes
            .chunks_exact(WORD_LEN)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        Some(Self { words })
    }
}

pub struct GeneratorSession {
    seed: u64,
    rng: StdRng,
    catalog: Catalog,
    sampler: OperandSampler,
    mutator: WordMutator,
    xlen: Xlen,
    random_word_probability: f64,
    fence_emitted: bool,
}

impl GeneratorSession {
    /// Seeds from `config.seed`, or from the current time when unset.
    pub fn new(config: &FuzzConfig) -> Result<Self, CatalogError> {
        let seed = config
            .seed
            .unwrap_or_else(|| chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default() as u64);
        Ok(Self {
            seed,
            rng: StdRng::seed_from_u64(seed),
            catalog: Catalog::build(config)?,
            sampler: OperandSampler::new(config.sampler.clone()),
            mutator: WordMutator::new(config),
            xlen: config.xlen,
            random_word_probability: config.random_word_probability,
            fence_emitted: false,
        })
    }

    /// The seed in use. Putting it in the config's `seed` reproduces the run.
    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// Produces `count` base words, each followed by whatever the mutator
    /// appends, so the result can be longer than `count`.
    pub fn generate(&mut self, count: usize) -> Corpus {
        let mut words = Vec::with_capacity(count * 2);
        for _ in 0..count {
            let word = if self.rng.random_bool(self.random_word_probability) {
                self.rng.random::<u32>()
            } else {
                let index = self.rng.random_range(0..self.catalog.len());
                let template = self.catalog.templates()[index];
                self.emit(&template)
            };
            words.push(word);
            self.mutator.augment(&mut self.rng, word, &mut words);
        }
        Corpus::new(words)
    }

    /// Samples operands for `template` and encodes it.
    pub fn emit(&mut self, template: &InstructionTemplate) -> u32 {
        let ops = self.sample_operands(template.format);
        encode(template, &ops, self.xlen)
    }

    fn sample_operands(&mut self, format: Format) -> Operands {
        let rng = &mut self.rng;
        let s = &self.sampler;
        match format {
            Format::R { .. } => Operands {
                rd: s.pick_gpr(rng, true, &[]),
                rs1: s.pick_gpr(rng, false, &[]),
                rs2: s.pick_gpr(rng, false, &[]),
                ..Operands::default()
            },
            Format::I { .. } => Operands {
                rd: s.pick_gpr(rng, false, &[]),
                rs1: s.pick_gpr(rng, false, &[]),
                imm: s.rand_simm(rng, 12),
                ..Operands::default()
            },
            Format::S { .. } => Operands {
                rs1: s.pick_gpr(rng, false, &[]),
                rs2: s.pick_gpr(rng, false, &[]),
                imm: s.rand_simm(rng, 12),
                ..Operands::default()
            },
            Format::B { .. } => Operands {
                rs1: s.pick_gpr(rng, false, &[]),
                rs2: s.pick_gpr(rng, false, &[]),
                imm: s.branch_offset(rng),
                ..Operands::default()
            },
            Format::U { .. } => Operands {
                rd: s.pick_gpr(rng, false, &[]),
                imm: s.rand_simm(rng, 20),
                ..Operands::default()
            },
            Format::J { .. } => Operands {
                rd: s.pick_gpr(rng, false, &[]),
                imm: s.jump_offset(rng),
                ..Operands::default()
            },
            Format::Shift { .. } => Operands {
                rd: s.pick_gpr(rng, false, &[]),
                rs1: s.pick_gpr(rng, false, &[]),
                imm: s.rand_uimm(rng, self.xlen.shamt_bits()) as i64,
                ..Operands::default()
            },
            Format::Fence { .. } => {
                // FENCE.I once per session, then FENCE with random pred/succ.
                let imm = if self.fence_emitted {
                    let pred = rng.random_range(0..16i64);
                    let succ = rng.random_range(0..16i64);
                    (pred << 4) | succ
                } else {
                    self.fence_emitted = true;
                    1
                };
                Operands { imm, ..Operands::default() }
            }
            Format::Sys { .. } => Operands::default(),
            Format::Amo { .. } => Operands {
                rd: s.pick_gpr(rng, false, &[]),
                rs1: s.pick_gpr(rng, false, &[]),
                rs2: s.pick_gpr(rng, false, &[]),
                aq: rng.random_range(0..=1),
                rl: rng.random_range(0..=1),
                ..Operands::default()
            },
            Format::F { .. } => Operands {
                rd: s.pick_fpr(rng),
                rs1: s.pick_fpr(rng),
                rs2: s.pick_fpr(rng),
                ..Operands::default()
            },
            Format::FLoad { .. } => Operands {
                rd: s.pick_fpr(rng),
                rs1: s.pick_gpr(rng, false, &[]),
                imm: s.rand_simm(rng, 12),
                ..Operands::default()
            },
            Format::FStore { .. } => Operands {
                rs1: s.pick_gpr(rng, false, &[]),
                rs2: s.pick_fpr(rng),
                imm: s.rand_simm(rng, 12),
                ..Operands::default()
            },
            Format::Vr { .. } | Format::Vm { .. } => Operands {
                rd: s.pick_vreg(rng),
                rs1: s.pick_vreg(rng),
                rs2: s.pick_vreg(rng),
                vm: rng.random_range(0..=1),
                ..Operands::default()
            },
            Format::Vr4 { .. } => Operands {
                rd: s.pick_vreg(rng),
                rs1: s.pick_vreg(rng),
                rs2: s.pick_vreg(rng),
                rs3: s.pick_vreg(rng),
                ..Operands::default()
            },
            Format::Vi { .. } => Operands {
                rd: s.pick_vreg(rng),
                rs2: s.pick_vreg(rng),
                imm: s.rand_uimm(rng, 5) as i64,
                vm: rng.random_range(0..=1),
                ..Operands::default()
            },
            Format::Vx { .. } => Operands {
                rd: s.pick_vreg(rng),
                rs1: s.pick_gpr(rng, false, &[]),
                rs2: s.pick_vreg(rng),
                vm: rng.random_range(0..=1),
                ..Operands::default()
            },
        }
    }
}

/// Builds a fresh session for `config` and generates `count` base words.
pub fn generate(config: &FuzzConfig, count: usize) -> Result<Corpus, CatalogError> {
    Ok(GeneratorSession::new(config)?.generate(count))
}
