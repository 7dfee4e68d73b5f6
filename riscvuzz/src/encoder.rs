//! Bit-exact instruction encoding.
//!
//! [`encode`] places a template's fixed fields and a set of sampled
//! [`Operands`] into a 32-bit word. Every field is masked to its width before
//! it is shifted, so an out-of-range operand can only lose its high bits and
//! never spills into a neighbouring field.

use crate::catalog::{Format, InstructionTemplate};
use crate::config::Xlen;

/// Sampled operand values. Register fields double as vector register
/// indices (`rd` = `vd`, `rs1` = `vs1`, ...) for the vector formats.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Operands {
    pub rd: u8,
    pub rs1: u8,
    pub rs2: u8,
    pub rs3: u8,
    pub imm: i64,
    pub vm: u8,
    pub aq: u8,
    pub rl: u8,
}

const fn mask(width: u32) -> u32 {
    (1 << width) - 1
}

fn reg(index: u8) -> u32 {
    u32::from(index) & mask(5)
}

fn bits(imm: i64, width: u32) -> u32 {
    (imm as u32) & mask(width)
}

/// `funct7 | rs2 | rs1 | funct3 | rd | opcode`
pub fn encode_r(funct7: u32, rs2: u8, rs1: u8, funct3: u32, rd: u8, opcode: u32) -> u32 {
    (funct7 & mask(7)) << 25
        | reg(rs2) << 20
        | reg(rs1) << 15
        | (funct3 & mask(3)) << 12
        | reg(rd) << 7
        | (opcode & mask(7))
}

/// `imm[11:0] | rs1 | funct3 | rd | opcode`
pub fn encode_i(imm: i64, rs1: u8, funct3: u32, rd: u8, opcode: u32) -> u32 {
    bits(imm, 12) << 20 | reg(rs1) << 15 | (funct3 & mask(3)) << 12 | reg(rd) << 7 | (opcode & mask(7))
}

pub fn encode_s(imm: i64, rs2: u8, rs1: u8, funct3: u32, opcode: u32) -> u32 {
    let imm = bits(imm, 12);
    (imm >> 5) << 25
        | reg(rs2) << 20
        | reg(rs1) << 15
        | (funct3 & mask(3)) << 12
        | (imm & mask(5)) << 7
        | (opcode & mask(7))
}

/// Bit 0 of a branch offset is never encoded, so the result always
/// describes an even offset.
pub fn encode_b(imm: i64, rs2: u8, rs1: u8, funct3: u32, opcode: u32) -> u32 {
    let imm = bits(imm, 13);
    ((imm >> 12) & 1) << 31
        | ((imm >> 5) & mask(6)) << 25
        | reg(rs2) << 20
        | reg(rs1) << 15
        | (funct3 & mask(3)) << 12
        | ((imm >> 1) & mask(4)) << 8
        | ((imm >> 11) & 1) << 7
        | (opcode & mask(7))
}

/// `imm` is the 20-bit upper immediate, not the already-shifted value.
pub fn encode_u(imm: i64, rd: u8, opcode: u32) -> u32 {
    bits(imm, 20) << 12 | reg(rd) << 7 | (opcode & mask(7))
}

pub fn encode_j(imm: i64, rd: u8, opcode: u32) -> u32 {
    let imm = bits(imm, 21);
    ((imm >> 20) & 1) << 31
        | ((imm >> 1) & mask(10)) << 21
        | ((imm >> 11) & 1) << 20
        | ((imm >> 12) & mask(8)) << 12
        | reg(rd) << 7
        | (opcode & mask(7))
}

/// `funct6 | vm | vs2 | vs1 | funct3 | vd | opcode`. `vs1` is the raw 5-bit
/// slot, which the VI and VX forms reuse for an immediate or a GPR.
pub fn encode_v(funct6: u32, vm: u8, vs2: u8, vs1: u32, funct3: u32, vd: u8, opcode: u32) -> u32 {
    (funct6 & mask(6)) << 26
        | (u32::from(vm) & 1) << 25
        | reg(vs2) << 20
        | (vs1 & mask(5)) << 15
        | (funct3 & mask(3)) << 12
        | reg(vd) << 7
        | (opcode & mask(7))
}

/// Encodes one instruction. `xlen` decides the width of the SHIFT format's
/// shift amount.
pub fn encode(template: &InstructionTemplate, ops: &Operands, xlen: Xlen) -> u32 {
    match template.format {
        Format::R { opcode, funct3, funct7 } | Format::F { opcode, funct3, funct7 } => {
            encode_r(funct7, ops.rs2, ops.rs1, funct3, ops.rd, opcode)
        }
        Format::I { opcode, funct3 } | Format::FLoad { opcode, funct3 } => {
            encode_i(ops.imm, ops.rs1, funct3, ops.rd, opcode)
        }
        Format::S { opcode, funct3 } | Format::FStore { opcode, funct3 } => {
            encode_s(ops.imm, ops.rs2, ops.rs1, funct3, opcode)
        }
        Format::B { opcode, funct3 } => encode_b(ops.imm, ops.rs2, ops.rs1, funct3, opcode),
        Format::U { opcode } => encode_u(ops.imm, ops.rd, opcode),
        Format::J { opcode } => encode_j(ops.imm, ops.rd, opcode),
        Format::Shift { opcode, funct3, funct7 } => {
            let shamt = bits(ops.imm, xlen.shamt_bits());
            let imm = (funct7 << 5) | shamt;
            encode_i(i64::from(imm), ops.rs1, funct3, ops.rd, opcode)
        }
        Format::Fence { opcode, funct3 } => encode_i(ops.imm, 0, funct3, 0, opcode),
        Format::Sys { opcode, imm } => encode_i(i64::from(imm), 0, 0, 0, opcode),
        Format::Amo { opcode, funct3, funct5 } => {
            let funct7 = (funct5 & mask(5)) << 2 | (u32::from(ops.aq) & 1) << 1 | (u32::from(ops.rl) & 1);
            encode_r(funct7, ops.rs2, ops.rs1, funct3, ops.rd, opcode)
        }
        Format::Vr { opcode, funct6, funct3 } => {
            encode_v(funct6, ops.vm, ops.rs2, reg(ops.rs1), funct3, ops.rd, opcode)
        }
        Format::Vm { opcode, funct6, funct3 } => {
            encode_v(funct6, 0, ops.rs2, reg(ops.rs1), funct3, ops.rd, opcode)
        }
        Format::Vi { opcode, funct6, funct3 } => {
            encode_v(funct6, ops.vm, ops.rs2, bits(ops.imm, 5), funct3, ops.rd, opcode)
        }
        Format::Vx { opcode, funct6, funct3 } => {
            encode_v(funct6, ops.vm, ops.rs2, reg(ops.rs1), funct3, ops.rd, opcode)
        }
        Format::Vr4 { opcode, funct2, funct3 } => {
            reg(ops.rs3) << 27
                | (funct2 & mask(2)) << 25
                | reg(ops.rs2) << 20
                | reg(ops.rs1) << 15
                | (funct3 & mask(3)) << 12
                | reg(ops.rd) << 7
                | (opcode & mask(7))
        }
    }
}

pub fn opcode(word: u32) -> u32 {
    word & mask(7)
}

pub fn rd(word: u32) -> u8 {
    ((word >> 7) & mask(5)) as u8
}

pub fn funct3(word: u32) -> u32 {
    (word >> 12) & mask(3)
}

pub fn rs1(word: u32) -> u8 {
    ((word >> 15) & mask(5)) as u8
}

pub fn rs2(word: u32) -> u8 {
    ((word >> 20) & mask(5)) as u8
}

pub fn funct7(word: u32) -> u32 {
    word >> 25
}

/// Sign-extended I-type immediate.
pub fn imm_i(word: u32) -> i64 {
    i64::from((word as i32) >> 20)
}

/// Sign-extended B-type offset.
pub fn imm_b(word: u32) -> i64 {
    let raw = ((word >> 31) & 1) << 12
        | ((word >> 7) & 1) << 11
        | ((word >> 25) & mask(6)) << 5
        | ((word >> 8) & mask(4)) << 1;
    sign_extend(raw, 13)
}

/// Sign-extended J-type offset.
pub fn imm_j(word: u32) -> i64 {
    let raw = ((word >> 31) & 1) << 20
        | ((word >> 12) & mask(8)) << 12
        | ((word >> 20) & 1) << 11
        | ((word >> 21) & mask(10)) << 1;
    sign_extend(raw, 21)
}

fn sign_extend(value: u32, width: u32) -> i64 {
    let shift = 32 - width;
    i64::from(((value << shift) as i32) >> shift)
}
