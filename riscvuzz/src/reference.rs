//! Cross-checking the encoder against an external reference assembler.
//!
//! A reference encoder answers one line of assembly with one JSON line,
//! either `{"hex": "0x..."}` or `{"error": "..."}`. It is only ever used to
//! audit the catalog; generation never depends on it.

use std::io::{self, BufRead, BufReader, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};

use serde::Deserialize;
use thiserror::Error;

use crate::catalog::{Catalog, Format, InstructionTemplate};
use crate::config::Xlen;
use crate::constants::{OP_JALR, OP_LOAD};
use crate::encoder::{self, Operands};
use crate::util::parse_hex_word;

#[derive(Debug, Error)]
pub enum ReferenceError {
    #[error("reference encoder I/O failed: {0}")]
    Io(#[from] io::Error),
    #[error("reference encoder closed its output")]
    Closed,
    #[error("malformed reply {line:?}: {source}")]
    Json {
        line: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("reference encoder rejected the instruction: {0}")]
    Rejected(String),
    #[error("reply carries neither a word nor an error")]
    EmptyReply,
    #[error("{0:?} is not a hex instruction word")]
    BadHex(String),
}

pub trait ReferenceEncoder {
    /// Encodes one line of assembly, e.g. `add x0, x0, x0`.
    fn encode(&mut self, asm: &str) -> Result<u32, ReferenceError>;
}

#[derive(Deserialize)]
struct Reply {
    hex: Option<String>,
    error: Option<String>,
}

/// Decodes one reply line.
pub fn parse_reply(line: &str) -> Result<u32, ReferenceError> {
    let reply: Reply = serde_json::from_str(line.trim()).map_err(|source| ReferenceError::Json {
        line: line.trim().to_string(),
        source,
    })?;
    if let Some(error) = reply.error {
        return Err(ReferenceError::Rejected(error));
    }
    let hex = reply.hex.ok_or(ReferenceError::EmptyReply)?;
    parse_hex_word(&hex).ok_or(ReferenceError::BadHex(hex))
}

/// A reference encoder running as a child process, one request per line.
pub struct SubprocessEncoder {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

impl SubprocessEncoder {
    pub fn spawn(program: &str, args: &[&str]) -> Result<Self, ReferenceError> {
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()?;
        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            let _ = child.kill();
            return Err(ReferenceError::Closed);
        };
        Ok(Self {
            child,
            stdin,
            stdout: BufReader::new(stdout),
        })
    }
}

impl ReferenceEncoder for SubprocessEncoder {
    fn encode(&mut self, asm: &str) -> Result<u32, ReferenceError> {
        writeln!(self.stdin, "{asm}")?;
        self.stdin.flush()?;
        let mut line = String::new();
        if self.stdout.read_line(&mut line)? == 0 {
            return Err(ReferenceError::Closed);
        }
        parse_reply(&line)
    }
}

impl Drop for SubprocessEncoder {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// Assembly text for `template` with every operand set to zero.
pub fn zero_operand_asm(template: &InstructionTemplate) -> String {
    let m = template.mnemonic;
    match template.format {
        Format::R { .. } => format!("{m} x0, x0, x0"),
        Format::I { opcode, .. } if opcode == OP_LOAD || opcode == OP_JALR => format!("{m} x0, 0(x0)"),
        Format::I { .. } | Format::Shift { .. } => format!("{m} x0, x0, 0"),
        Format::S { .. } => format!("{m} x0, 0(x0)"),
        Format::B { .. } => format!("{m} x0, x0, 0"),
        Format::U { .. } | Format::J { .. } => format!("{m} x0, 0"),
        Format::Fence { .. } | Format::Sys { .. } => m.to_string(),
        Format::Amo { .. } => format!("{m} x0, x0, (x0)"),
        Format::F { .. } => format!("{m} f0, f0, f0"),
        Format::FLoad { .. } | Format::FStore { .. } => format!("{m} f0, 0(x0)"),
        Format::Vr { .. } | Format::Vm { .. } | Format::Vr4 { .. } => format!("{m} v0, v0, v0"),
        Format::Vi { .. } => format!("{m} v0, v0, 0"),
        Format::Vx { .. } => format!("{m} v0, v0, x0"),
    }
}

#[derive(Debug)]
pub enum Mismatch {
    /// The reference disagrees on the opcode or funct3 field.
    Fields {
        mnemonic: &'static str,
        ours: u32,
        reference: u32,
    },
    /// The reference could not encode the instruction at all.
    Unencodable {
        mnemonic: &'static str,
        error: ReferenceError,
    },
}

/// Encodes every catalog template with zero operands and compares the
/// opcode and funct3 fields with what `reference` produces.
pub fn cross_validate<R: ReferenceEncoder + ?Sized>(
    catalog: &Catalog,
    reference: &mut R,
    xlen: Xlen,
) -> Vec<Mismatch> {
    let mut mismatches = Vec::new();
    for template in catalog.templates() {
        let ours = encoder::encode(template, &Operands::default(), xlen);
        match reference.encode(&zero_operand_asm(template)) {
            Ok(theirs) => {
                let funct3_differs = template.format.funct3().is_some()
                    && encoder::funct3(ours) != encoder::funct3(theirs);
                if encoder::opcode(ours) != encoder::opcode(theirs) || funct3_differs {
                    mismatches.push(Mismatch::Fields {
                        mnemonic: template.mnemonic,
                        ours,
                        reference: theirs,
                    });
                }
            }
            Err(error) => mismatches.push(Mismatch::Unencodable {
                mnemonic: template.mnemonic,
                error,
            }),
        }
    }
    mismatches
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Extensions, FuzzConfig};
    use assert_matches::assert_matches;

    /// Answers from a fixed table of known encodings.
    struct TableEncoder(Vec<(&'static str, u32)>);

    impl ReferenceEncoder for TableEncoder {
        fn encode(&mut self, asm: &str) -> Result<u32, ReferenceError> {
            let mnemonic = asm.split_whitespace().next().unwrap_or_default();
            self.0
                .iter()
                .find(|(m, _)| *m == mnemonic)
                .map(|(_, w)| *w)
                .ok_or_else(|| ReferenceError::Rejected(format!("unknown instruction {mnemonic}")))
        }
    }

    #[test]
    fn replies_are_parsed() {
        assert_eq!(parse_reply(r#"{"hex": "0x00000013"}"#).unwrap(), 0x13);
        assert_matches!(
            parse_reply(r#"{"error": "unknown mnemonic"}"#),
            Err(ReferenceError::Rejected(msg)) if msg == "unknown mnemonic"
        );
        assert_matches!(parse_reply("{}"), Err(ReferenceError::EmptyReply));
        assert_matches!(parse_reply(r#"{"hex": "0xnope"}"#), Err(ReferenceError::BadHex(_)));
        assert_matches!(parse_reply("not json"), Err(ReferenceError::Json { .. }));
    }

    #[test]
    fn asm_lines_use_zero_operands() {
        let catalog = Catalog::build(&FuzzConfig {
            extensions: Extensions {
                amo: true,
                vector: true,
                ..Extensions::default()
            },
            ..FuzzConfig::default()
        })
        .unwrap();
        let asm = |name| zero_operand_asm(catalog.find(name).unwrap());
        assert_eq!(asm("add"), "add x0, x0, x0");
        assert_eq!(asm("lw"), "lw x0, 0(x0)");
        assert_eq!(asm("addi"), "addi x0, x0, 0");
        assert_eq!(asm("ecall"), "ecall");
        assert_eq!(asm("amoswap.w"), "amoswap.w x0, x0, (x0)");
        assert_eq!(asm("vadd.vx"), "vadd.vx v0, v0, x0");
    }

    #[test]
    fn cross_validation_flags_disagreements() {
        let catalog = Catalog::build(&FuzzConfig::default()).unwrap();
        let mut reference = TableEncoder(vec![
            ("add", 0x0000_0033),
            ("sub", 0x4000_0033),
            // Wrong funct3: this is really `sll`.
            ("xor", 0x0000_1033),
        ]);
        let mismatches = cross_validate(&catalog, &mut reference, Xlen::Rv64);

        assert!(mismatches.iter().any(|m| matches!(
            m,
            Mismatch::Fields { mnemonic: "xor", reference: 0x0000_1033, .. }
        )));
        assert!(!mismatches.iter().any(|m| matches!(
            m,
            Mismatch::Fields { mnemonic: "add" | "sub", .. }
                | Mismatch::Unencodable { mnemonic: "add" | "sub", .. }
        )));
        let unencodable = mismatches
            .iter()
            .filter(|m| matches!(m, Mismatch::Unencodable { .. }))
            .count();
        assert_eq!(unencodable, catalog.len() - 3);
    }
}
