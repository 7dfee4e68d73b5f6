//! Run configuration.
//!
//! A [`FuzzConfig`] is built once per process, validated, and then shared
//! read-only by the generator and every board session. It can be assembled in
//! code or read from a `KEY=value` text file with [`FuzzConfig::from_file`].

use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::constants::{
    DEFAULT_MAX_RESULT_LEN, DEFAULT_SPECIAL_FPRS, DEFAULT_SPECIAL_GPRS, DEFAULT_SPECIAL_SIMMS,
    DEFAULT_SPECIAL_UIMMS, DEFAULT_SPECIAL_VREGS, REGISTER_COUNT,
};

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("batch size must be at least 1")]
    ZeroBatchSize,
    #[error("{name} must be within [0, 1], got {value}")]
    ProbabilityOutOfRange { name: &'static str, value: f64 },
    #[error("max flips must be within 1..=32, got {0}")]
    MaxFlipsOutOfRange(u32),
    #[error("{set} contains register index {index}, registers are 0..=31")]
    RegisterOutOfRange { set: &'static str, index: u8 },
    #[error("xlen must be 32 or 64, got {0}")]
    UnsupportedXlen(u64),
    #[error("max result length must be at least 1 byte")]
    ZeroResultLen,
    #[error("invalid value for {key}: {value:?}")]
    InvalidValue { key: String, value: String },
    #[error("unable to read config file: {0}")]
    Io(String),
}

/// Register width of the target, which decides shift-amount width and
/// whether RV64-only templates are generated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Xlen {
    Rv32,
    #[default]
    Rv64,
}

impl Xlen {
    pub fn bits(self) -> u32 {
        match self {
            Xlen::Rv32 => 32,
            Xlen::Rv64 => 64,
        }
    }

    /// Width of the shift-amount field of SLLI/SRLI/SRAI.
    pub fn shamt_bits(self) -> u32 {
        match self {
            Xlen::Rv32 => 5,
            Xlen::Rv64 => 6,
        }
    }
}

impl TryFrom<u64> for Xlen {
    type Error = ConfigError;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        match value {
            32 => Ok(Xlen::Rv32),
            64 => Ok(Xlen::Rv64),
            other => Err(ConfigError::UnsupportedXlen(other)),
        }
    }
}

/// Optional instruction groups layered on top of the base integer set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Extensions {
    pub m: bool,
    pub amo: bool,
    pub f: bool,
    pub vector: bool,
}

/// How the two result blobs received per batch are paired for comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Topology {
    /// A board runs every batch twice and both runs are compared with each other.
    #[default]
    RepeatRun,
    /// The first run of every batch is compared against the same batch on
    /// the other boards.
    CrossBoard,
}

impl FromStr for Topology {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace(['-', '_'], "").as_str() {
            "repeatrun" | "repeat" => Ok(Topology::RepeatRun),
            "crossboard" | "cross" => Ok(Topology::CrossBoard),
            _ => Err(ConfigError::InvalidValue {
                key: "TOPOLOGY".to_string(),
                value: s.to_string(),
            }),
        }
    }
}

/// Bias tables consulted by the operand sampler.
#[derive(Debug, Clone, PartialEq)]
pub struct SamplerConfig {
    pub special_gprs: Vec<u8>,
    pub special_fprs: Vec<u8>,
    pub special_vregs: Vec<u8>,
    pub special_simms: Vec<i64>,
    pub special_uimms: Vec<u64>,
    pub gpr_special_prob: f64,
    pub fpr_special_prob: f64,
    pub vreg_special_prob: f64,
    pub imm_special_prob: f64,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            special_gprs: DEFAULT_SPECIAL_GPRS.to_vec(),
            special_fprs: DEFAULT_SPECIAL_FPRS.to_vec(),
            special_vregs: DEFAULT_SPECIAL_VREGS.to_vec(),
            special_simms: DEFAULT_SPECIAL_SIMMS.to_vec(),
            special_uimms: DEFAULT_SPECIAL_UIMMS.to_vec(),
            gpr_special_prob: 0.2,
            fpr_special_prob: 0.2,
            vreg_special_prob: 0.3,
            imm_special_prob: 0.875,
        }
    }
}

/// Everything a fuzz run needs to know, fixed for the lifetime of the run.
#[derive(Debug, Clone, PartialEq)]
pub struct FuzzConfig {
    pub batch_size: usize,
    pub flip_probability: f64,
    pub endian_probability: f64,
    pub max_flips: u32,
    /// Probability that a corpus slot holds a raw random word instead of a
    /// template instance.
    pub random_word_probability: f64,
    pub sampler: SamplerConfig,
    pub xlen: Xlen,
    pub extensions: Extensions,
    /// Explicit generator seed. `None` seeds from the wall clock.
    pub seed: Option<u64>,
    /// Upper bound on any single read from a board. `None` waits forever.
    pub read_timeout: Option<Duration>,
    pub topology: Topology,
    pub max_result_len: usize,
}

impl Default for FuzzConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            flip_probability: 0.5,
            endian_probability: 0.5,
            max_flips: 4,
            random_word_probability: 0.0,
            sampler: SamplerConfig::default(),
            xlen: Xlen::default(),
            extensions: Extensions::default(),
            seed: None,
            read_timeout: None,
            topology: Topology::default(),
            max_result_len: DEFAULT_MAX_RESULT_LEN,
        }
    }
}

impl FuzzConfig {
    /// Rejects every out-of-range setting. Called by all constructors that
    /// take outside input, and must pass before any board is contacted.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::ZeroBatchSize);
        }
        if !(1..=32).contains(&self.max_flips) {
            return Err(ConfigError::MaxFlipsOutOfRange(self.max_flips));
        }
        if self.max_result_len == 0 {
            return Err(ConfigError::ZeroResultLen);
        }

        let probabilities = [
            ("flip probability", self.flip_probability),
            ("endian probability", self.endian_probability),
            ("random word probability", self.random_word_probability),
            ("gpr special probability", self.sampler.gpr_special_prob),
            ("fpr special probability", self.sampler.fpr_special_prob),
            ("vreg special probability", self.sampler.vreg_special_prob),
            ("imm special probability", self.sampler.imm_special_prob),
        ];
        for (name, value) in probabilities {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::ProbabilityOutOfRange { name, value });
            }
        }

        let register_sets = [
            ("special gprs", &self.sampler.special_gprs),
            ("special fprs", &self.sampler.special_fprs),
            ("special vregs", &self.sampler.special_vregs),
        ];
        for (set, registers) in register_sets {
            if let Some(&index) = registers.iter().find(|&&r| r >= REGISTER_COUNT) {
                return Err(ConfigError::RegisterOutOfRange { set, index });
            }
        }
        Ok(())
    }

    /// Reads and validates a config file. Keys not present keep their
    /// [`Default`] values.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::Io(format!("{}: {e}", path.as_ref().display())))?;
        text.parse()
    }

    fn apply(&mut self, key: &str, value: &ConfigValue) -> Result<(), ConfigError> {
        let invalid = || ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        };
        match key {
            "BATCH_SIZE" => self.batch_size = value.as_u64().ok_or_else(invalid)? as usize,
            "FLIP_PROBABILITY" => self.flip_probability = value.as_f64().ok_or_else(invalid)?,
            "ENDIAN_PROBABILITY" => self.endian_probability = value.as_f64().ok_or_else(invalid)?,
            "MAX_FLIPS" => {
                let flips = value.as_u64().ok_or_else(invalid)?;
                self.max_flips = u32::try_from(flips).map_err(|_| invalid())?;
            }
            "RANDOM_WORD_PROBABILITY" => {
                self.random_word_probability = value.as_f64().ok_or_else(invalid)?
            }
            "XLEN" => self.xlen = Xlen::try_from(value.as_u64().ok_or_else(invalid)?)?,
            "ENABLE_M" => self.extensions.m = value.as_bool().ok_or_else(invalid)?,
            "ENABLE_AMO" => self.extensions.amo = value.as_bool().ok_or_else(invalid)?,
            "ENABLE_F" => self.extensions.f = value.as_bool().ok_or_else(invalid)?,
            "ENABLE_VECTOR" => self.extensions.vector = value.as_bool().ok_or_else(invalid)?,
            "SPECIAL_GPRS" => self.sampler.special_gprs = value.as_registers().ok_or_else(invalid)?,
            "SPECIAL_FPRS" => self.sampler.special_fprs = value.as_registers().ok_or_else(invalid)?,
            "SPECIAL_VREGS" => {
                self.sampler.special_vregs = value.as_registers().ok_or_else(invalid)?
            }
            "SPECIAL_SIMMS" => {
                self.sampler.special_simms = value.as_int_list().ok_or_else(invalid)?
            }
            "SPECIAL_UIMMS" => {
                self.sampler.special_uimms = value
                    .as_int_list()
                    .and_then(|l| {
                        l.into_iter()
                            .map(|v| u64::try_from(v).ok())
                            .collect::<Option<Vec<u64>>>()
                    })
                    .ok_or_else(invalid)?
            }
            "GPR_SPECIAL" => self.sampler.gpr_special_prob = value.as_f64().ok_or_else(invalid)?,
            "FPR_SPECIAL" => self.sampler.fpr_special_prob = value.as_f64().ok_or_else(invalid)?,
            "VREG_SPECIAL" => self.sampler.vreg_special_prob = value.as_f64().ok_or_else(invalid)?,
            "IMM_SPECIAL" => self.sampler.imm_special_prob = value.as_f64().ok_or_else(invalid)?,
            "SEED" => self.seed = Some(value.as_u64().ok_or_else(invalid)?),
            "READ_TIMEOUT_MS" => {
                let ms = value.as_u64().ok_or_else(invalid)?;
                self.read_timeout = (ms > 0).then(|| Duration::from_millis(ms));
            }
            "TOPOLOGY" => self.topology = value.to_string().parse()?,
            "MAX_RESULT_LEN" => self.max_result_len = value.as_u64().ok_or_else(invalid)? as usize,
            _ => {}
        }
        Ok(())
    }
}

impl FromStr for FuzzConfig {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut config = FuzzConfig::default();
        for (key, value) in parse_key_values(s) {
            config.apply(&key, &value)?;
        }
        config.validate()?;
        Ok(config)
    }
}

/// A coerced right-hand side of a config line.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    List(Vec<ConfigValue>),
    Str(String),
}

impl ConfigValue {
    /// Coerces a raw value: comma-separated lists first, then booleans,
    /// integers (decimal or `0x` hex), floats, and finally plain strings.
    pub fn coerce(raw: &str) -> Self {
        let raw = raw.trim();
        if raw.contains(',') {
            return ConfigValue::List(
                raw.split(',')
                    .filter(|item| !item.trim().is_empty())
                    .map(ConfigValue::coerce)
                    .collect(),
            );
        }
        if raw.eq_ignore_ascii_case("true") {
            return ConfigValue::Bool(true);
        }
        if raw.eq_ignore_ascii_case("false") {
            return ConfigValue::Bool(false);
        }
        if let Some(int) = parse_int(raw) {
            return ConfigValue::Int(int);
        }
        if let Ok(float) = raw.parse::<f64>() {
            return ConfigValue::Float(float);
        }
        ConfigValue::Str(raw.to_string())
    }

    fn as_bool(&self) -> Option<bool> {
        match self {
            ConfigValue::Bool(b) => Some(*b),
            ConfigValue::Int(0) => Some(false),
            ConfigValue::Int(1) => Some(true),
            _ => None,
        }
    }

    fn as_u64(&self) -> Option<u64> {
        match self {
            ConfigValue::Int(i) => u64::try_from(*i).ok(),
            _ => None,
        }
    }

    fn as_f64(&self) -> Option<f64> {
        match self {
            ConfigValue::Int(i) => Some(*i as f64),
            ConfigValue::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// A single integer counts as a one-element list.
    fn as_int_list(&self) -> Option<Vec<i64>> {
        match self {
            ConfigValue::Int(i) => Some(vec![*i]),
            ConfigValue::List(items) => items
                .iter()
                .map(|item| match item {
                    ConfigValue::Int(i) => Some(*i),
                    _ => None,
                })
                .collect(),
            _ => None,
        }
    }

    fn as_registers(&self) -> Option<Vec<u8>> {
        self.as_int_list()?
            .into_iter()
            .map(|r| u8::try_from(r).ok())
            .collect()
    }
}

impl std::fmt::Display for ConfigValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigValue::Bool(b) => write!(f, "{b}"),
            ConfigValue::Int(i) => write!(f, "{i}"),
            ConfigValue::Float(x) => write!(f, "{x}"),
            ConfigValue::Str(s) => write!(f, "{s}"),
            ConfigValue::List(items) => {
                let rendered: Vec<String> = items.iter().map(|i| i.to_string()).collect();
                write!(f, "{}", rendered.join(","))
            }
        }
    }
}

fn parse_int(raw: &str) -> Option<i64> {
    let (negative, digits) = match raw.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, raw),
    };
    let magnitude = match digits
        .strip_prefix("0x")
        .or_else(|| digits.strip_prefix("0X"))
    {
        Some(hex) => i64::from_str_radix(hex, 16).ok()?,
        None => digits.parse::<i64>().ok()?,
    };
    Some(if negative { -magnitude } else { magnitude })
}

/// Splits config text into `(KEY, value)` pairs. Lines are either
/// `KEY=value` or `KEY value`; blanks and `#` comments are skipped, as are
/// lines with no value. Later lines override earlier ones.
pub fn parse_key_values(text: &str) -> HashMap<String, ConfigValue> {
    let mut out = HashMap::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let split = match line.split_once('=') {
            Some(pair) => Some(pair),
            None => line.split_once(char::is_whitespace),
        };
        let Some((key, value)) = split else {
            continue;
        };
        let (key, value) = (key.trim(), value.trim());
        if key.is_empty() || value.is_empty() {
            continue;
        }
        out.insert(key.to_string(), ConfigValue::coerce(value));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn default_config_is_valid() {
        assert_eq!(FuzzConfig::default().validate(), Ok(()));
    }

    #[test]
    fn max_flips_outside_range_is_rejected() {
        for flips in [0, 33] {
            let config = FuzzConfig {
                max_flips: flips,
                ..FuzzConfig::default()
            };
            assert_eq!(config.validate(), Err(ConfigError::MaxFlipsOutOfRange(flips)));
        }
    }

    #[test]
    fn probability_outside_unit_interval_is_rejected() {
        let config = FuzzConfig {
            endian_probability: 1.5,
            ..FuzzConfig::default()
        };
        assert_matches!(
            config.validate(),
            Err(ConfigError::ProbabilityOutOfRange { name: "endian probability", .. })
        );
    }

    #[test]
    fn special_register_out_of_range_is_rejected() {
        let mut config = FuzzConfig::default();
        config.sampler.special_vregs = vec![0, 32];
        assert_eq!(
            config.validate(),
            Err(ConfigError::RegisterOutOfRange { set: "special vregs", index: 32 })
        );
    }

    #[test]
    fn values_are_coerced() {
        assert_eq!(ConfigValue::coerce("TRUE"), ConfigValue::Bool(true));
        assert_eq!(ConfigValue::coerce("42"), ConfigValue::Int(42));
        assert_eq!(ConfigValue::coerce("-0x10"), ConfigValue::Int(-16));
        assert_eq!(ConfigValue::coerce("0.25"), ConfigValue::Float(0.25));
        assert_eq!(
            ConfigValue::coerce("0, 1, -1"),
            ConfigValue::List(vec![
                ConfigValue::Int(0),
                ConfigValue::Int(1),
                ConfigValue::Int(-1)
            ])
        );
        assert_eq!(ConfigValue::coerce("cross"), ConfigValue::Str("cross".into()));
    }

    #[test]
    fn config_text_is_parsed() {
        let text = "
            # board run settings
            BATCH_SIZE=32
            FLIP_PROBABILITY 0.1
            ENDIAN_PROBABILITY=0
            MAX_FLIPS=8
            XLEN=32
            ENABLE_M=true
            ENABLE_VECTOR=1
            SPECIAL_GPRS=0,5,31
            SEED=1234
            READ_TIMEOUT_MS=2500
            TOPOLOGY=cross_board
            SOMETHING_ELSE=ignored
        ";
        let config: FuzzConfig = text.parse().unwrap();
        assert_eq!(config.batch_size, 32);
        assert_eq!(config.flip_probability, 0.1);
        assert_eq!(config.endian_probability, 0.0);
        assert_eq!(config.max_flips, 8);
        assert_eq!(config.xlen, Xlen::Rv32);
        assert!(config.extensions.m);
        assert!(config.extensions.vector);
        assert!(!config.extensions.f);
        assert_eq!(config.sampler.special_gprs, vec![0, 5, 31]);
        assert_eq!(config.seed, Some(1234));
        assert_eq!(config.read_timeout, Some(Duration::from_millis(2500)));
        assert_eq!(config.topology, Topology::CrossBoard);
    }

    #[test]
    fn invalid_config_text_is_rejected_at_load() {
        assert_eq!(
            "MAX_FLIPS=40".parse::<FuzzConfig>(),
            Err(ConfigError::MaxFlipsOutOfRange(40))
        );
        assert_eq!(
            "XLEN=128".parse::<FuzzConfig>(),
            Err(ConfigError::UnsupportedXlen(128))
        );
        assert_matches!(
            "BATCH_SIZE=many".parse::<FuzzConfig>(),
            Err(ConfigError::InvalidValue { .. })
        );
    }
}
