//! The static instruction catalog.
//!
//! Every template names one mnemonic and carries exactly the constant bit
//! fields its encoding format needs, so a template can never be missing a
//! field at encode time. [`Catalog::build`] concatenates the base integer
//! group with the extension groups enabled in the [`FuzzConfig`] and checks
//! that every constant fits the width of its field.

use thiserror::Error;

use crate::config::{FuzzConfig, Xlen};
use crate::constants::*;

/// Encoding format of a template, together with its fixed fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    R { opcode: u32, funct3: u32, funct7: u32 },
    I { opcode: u32, funct3: u32 },
    S { opcode: u32, funct3: u32 },
    B { opcode: u32, funct3: u32 },
    U { opcode: u32 },
    J { opcode: u32 },
    Shift { opcode: u32, funct3: u32, funct7: u32 },
    Fence { opcode: u32, funct3: u32 },
    Sys { opcode: u32, imm: u32 },
    /// `funct5` is the operation selector at bits 31:27; `funct3` selects
    /// the `.W` (2) or `.D` (3) width.
    Amo { opcode: u32, funct3: u32, funct5: u32 },
    F { opcode: u32, funct3: u32, funct7: u32 },
    FLoad { opcode: u32, funct3: u32 },
    FStore { opcode: u32, funct3: u32 },
    Vr { opcode: u32, funct6: u32, funct3: u32 },
    /// Four-operand vector layout: `vs3[31:27] funct2[26:25] vs2 vs1 funct3 vd opcode`.
    ///
    /// A fourth register leaves no room for `funct6` or `vm`, so this follows
    /// the scalar R4 (fused multiply-add) layout on its own major opcode,
    /// `0x5b`, and is always unmasked.
    Vr4 { opcode: u32, funct2: u32, funct3: u32 },
    Vi { opcode: u32, funct6: u32, funct3: u32 },
    Vx { opcode: u32, funct6: u32, funct3: u32 },
    Vm { opcode: u32, funct6: u32, funct3: u32 },
}

impl Format {
    pub fn opcode(&self) -> u32 {
        match *self {
            Format::R { opcode, .. }
            | Format::I { opcode, .. }
            | Format::S { opcode, .. }
            | Format::B { opcode, .. }
            | Format::U { opcode }
            | Format::J { opcode }
            | Format::Shift { opcode, .. }
            | Format::Fence { opcode, .. }
            | Format::Sys { opcode, .. }
            | Format::Amo { opcode, .. }
            | Format::F { opcode, .. }
            | Format::FLoad { opcode, .. }
            | Format::FStore { opcode, .. }
            | Format::Vr { opcode, .. }
            | Format::Vr4 { opcode, .. }
            | Format::Vi { opcode, .. }
            | Format::Vx { opcode, .. }
            | Format::Vm { opcode, .. } => opcode,
        }
    }

    /// The `funct3` field, for formats that have one.
    pub fn funct3(&self) -> Option<u32> {
        match *self {
            Format::R { funct3, .. }
            | Format::I { funct3, .. }
            | Format::S { funct3, .. }
            | Format::B { funct3, .. }
            | Format::Shift { funct3, .. }
            | Format::Fence { funct3, .. }
            | Format::Amo { funct3, .. }
            | Format::F { funct3, .. }
            | Format::FLoad { funct3, .. }
            | Format::FStore { funct3, .. }
            | Format::Vr { funct3, .. }
            | Format::Vr4 { funct3, .. }
            | Format::Vi { funct3, .. }
            | Format::Vx { funct3, .. }
            | Format::Vm { funct3, .. } => Some(funct3),
            Format::U { .. } | Format::J { .. } | Format::Sys { .. } => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Format::R { .. } => "R",
            Format::I { .. } => "I",
            Format::S { .. } => "S",
            Format::B { .. } => "B",
            Format::U { .. } => "U",
            Format::J { .. } => "J",
            Format::Shift { .. } => "SHIFT",
            Format::Fence { .. } => "FENCE",
            Format::Sys { .. } => "SYS",
            Format::Amo { .. } => "AMO",
            Format::F { .. } => "F",
            Format::FLoad { .. } => "FLOAD",
            Format::FStore { .. } => "FSTORE",
            Format::Vr { .. } => "VR",
            Format::Vr4 { .. } => "VR4",
            Format::Vi { .. } => "VI",
            Format::Vx { .. } => "VX",
            Format::Vm { .. } => "VM",
        }
    }

    /// Every fixed field as `(name, value, width)`.
    fn fields(&self) -> Vec<(&'static str, u32, u32)> {
        let mut out = vec![("opcode", self.opcode(), 7)];
        if let Some(funct3) = self.funct3() {
            out.push(("funct3", funct3, 3));
        }
        match *self {
            Format::R { funct7, .. } | Format::F { funct7, .. } => out.push(("funct7", funct7, 7)),
            // The shift amount shares the immediate with funct7, so only six
            // bits remain once RV64 claims imm[5].
            Format::Shift { funct7, .. } => out.push(("funct7", funct7, 6)),
            Format::Sys { imm, .. } => out.push(("imm", imm, 12)),
            Format::Amo { funct5, .. } => out.push(("funct5", funct5, 5)),
            Format::Vr { funct6, .. }
            | Format::Vi { funct6, .. }
            | Format::Vx { funct6, .. }
            | Format::Vm { funct6, .. } => out.push(("funct6", funct6, 6)),
            Format::Vr4 { funct2, .. } => out.push(("funct2", funct2, 2)),
            _ => {}
        }
        out
    }
}

/// One catalog entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstructionTemplate {
    pub mnemonic: &'static str,
    pub format: Format,
}

const fn t(mnemonic: &'static str, format: Format) -> InstructionTemplate {
    InstructionTemplate { mnemonic, format }
}

const fn r(opcode: u32, funct3: u32, funct7: u32) -> Format {
    Format::R { opcode, funct3, funct7 }
}

const fn i(opcode: u32, funct3: u32) -> Format {
    Format::I { opcode, funct3 }
}

pub const BASE_TEMPLATES: &[InstructionTemplate] = &[
    t("add", r(OP_R, 0x0, 0x00)),
    t("sub", r(OP_R, 0x0, 0x20)),
    t("sll", r(OP_R, 0x1, 0x00)),
    t("slt", r(OP_R, 0x2, 0x00)),
    t("sltu", r(OP_R, 0x3, 0x00)),
    t("xor", r(OP_R, 0x4, 0x00)),
    t("srl", r(OP_R, 0x5, 0x00)),
    t("sra", r(OP_R, 0x5, 0x20)),
    t("or", r(OP_R, 0x6, 0x00)),
    t("and", r(OP_R, 0x7, 0x00)),
    t("addi", i(OP_IMM, 0x0)),
    t("slti", i(OP_IMM, 0x2)),
    t("sltiu", i(OP_IMM, 0x3)),
    t("xori", i(OP_IMM, 0x4)),
    t("ori", i(OP_IMM, 0x6)),
    t("andi", i(OP_IMM, 0x7)),
    t("slli", Format::Shift { opcode: OP_IMM, funct3: 0x1, funct7: 0x00 }),
    t("srli", Format::Shift { opcode: OP_IMM, funct3: 0x5, funct7: 0x00 }),
    t("srai", Format::Shift { opcode: OP_IMM, funct3: 0x5, funct7: 0x20 }),
    t("lb", i(OP_LOAD, 0x0)),
    t("lh", i(OP_LOAD, 0x1)),
    t("lw", i(OP_LOAD, 0x2)),
    t("lbu", i(OP_LOAD, 0x4)),
    t("lhu", i(OP_LOAD, 0x5)),
    t("sb", Format::S { opcode: OP_STORE, funct3: 0x0 }),
    t("sh", Format::S { opcode: OP_STORE, funct3: 0x1 }),
    t("sw", Format::S { opcode: OP_STORE, funct3: 0x2 }),
    t("beq", Format::B { opcode: OP_BRANCH, funct3: 0x0 }),
    t("bne", Format::B { opcode: OP_BRANCH, funct3: 0x1 }),
    t("blt", Format::B { opcode: OP_BRANCH, funct3: 0x4 }),
    t("bge", Format::B { opcode: OP_BRANCH, funct3: 0x5 }),
    t("bltu", Format::B { opcode: OP_BRANCH, funct3: 0x6 }),
    t("bgeu", Format::B { opcode: OP_BRANCH, funct3: 0x7 }),
    t("jal", Format::J { opcode: OP_JAL }),
    t("jalr", i(OP_JALR, 0x0)),
    t("lui", Format::U { opcode: OP_LUI }),
    t("auipc", Format::U { opcode: OP_AUIPC }),
    t("fence", Format::Fence { opcode: OP_MISC, funct3: 0x0 }),
    t("ecall", Format::Sys { opcode: OP_SYSTEM, imm: 0x0 }),
    t("ebreak", Format::Sys { opcode: OP_SYSTEM, imm: 0x1 }),
];

/// Loads and stores that only exist on RV64.
pub const RV64_TEMPLATES: &[InstructionTemplate] = &[
    t("lwu", i(OP_LOAD, 0x6)),
    t("ld", i(OP_LOAD, 0x3)),
    t("sd", Format::S { opcode: OP_STORE, funct3: 0x3 }),
];

pub const M_TEMPLATES: &[InstructionTemplate] = &[
    t("mul", r(OP_R, 0x0, 0x01)),
    t("mulh", r(OP_R, 0x1, 0x01)),
    t("mulhsu", r(OP_R, 0x2, 0x01)),
    t("mulhu", r(OP_R, 0x3, 0x01)),
    t("div", r(OP_R, 0x4, 0x01)),
    t("divu", r(OP_R, 0x5, 0x01)),
    t("rem", r(OP_R, 0x6, 0x01)),
    t("remu", r(OP_R, 0x7, 0x01)),
];

const fn amo(funct3: u32, funct5: u32) -> Format {
    Format::Amo { opcode: OP_AMO, funct3, funct5 }
}

pub const AMO_TEMPLATES: &[InstructionTemplate] = &[
    t("amoswap.w", amo(0x2, 0x01)),
    t("amoadd.w", amo(0x2, 0x00)),
    t("amoxor.w", amo(0x2, 0x04)),
    t("amoand.w", amo(0x2, 0x0c)),
    t("amoor.w", amo(0x2, 0x08)),
    t("amomin.w", amo(0x2, 0x10)),
    t("amomax.w", amo(0x2, 0x14)),
    t("amominu.w", amo(0x2, 0x18)),
    t("amomaxu.w", amo(0x2, 0x1c)),
];

pub const AMO_RV64_TEMPLATES: &[InstructionTemplate] = &[
    t("amoswap.d", amo(0x3, 0x01)),
    t("amoadd.d", amo(0x3, 0x00)),
    t("amoxor.d", amo(0x3, 0x04)),
    t("amoand.d", amo(0x3, 0x0c)),
    t("amoor.d", amo(0x3, 0x08)),
    t("amomin.d", amo(0x3, 0x10)),
    t("amomax.d", amo(0x3, 0x14)),
    t("amominu.d", amo(0x3, 0x18)),
    t("amomaxu.d", amo(0x3, 0x1c)),
];

const fn fp(funct3: u32, funct7: u32) -> Format {
    Format::F { opcode: OP_FPU, funct3, funct7 }
}

pub const FLOAT_TEMPLATES: &[InstructionTemplate] = &[
    t("fadd.s", fp(0x0, 0x00)),
    t("fsub.s", fp(0x0, 0x04)),
    t("fmul.s", fp(0x0, 0x08)),
    t("fdiv.s", fp(0x0, 0x0c)),
    t("fadd.d", fp(0x1, 0x01)),
    t("fsub.d", fp(0x1, 0x05)),
    t("fmul.d", fp(0x1, 0x09)),
    t("fdiv.d", fp(0x1, 0x0d)),
    t("flw", Format::FLoad { opcode: OP_LOAD_FP, funct3: 0x2 }),
    t("fld", Format::FLoad { opcode: OP_LOAD_FP, funct3: 0x3 }),
    t("fsw", Format::FStore { opcode: OP_STORE_FP, funct3: 0x2 }),
    t("fsd", Format::FStore { opcode: OP_STORE_FP, funct3: 0x3 }),
];

const fn vr(funct6: u32, funct3: u32) -> Format {
    Format::Vr { opcode: OP_VECTOR, funct6, funct3 }
}

const fn vm(funct6: u32) -> Format {
    Format::Vm { opcode: OP_VECTOR, funct6, funct3: 0x2 }
}

const fn vr4(funct2: u32) -> Format {
    Format::Vr4 { opcode: OP_VFMA, funct2, funct3: 0x0 }
}

pub const VECTOR_TEMPLATES: &[InstructionTemplate] = &[
    t("vadd.vv", vr(0x00, 0x0)),
    t("vsub.vv", vr(0x02, 0x0)),
    t("vand.vv", vr(0x09, 0x0)),
    t("vor.vv", vr(0x0a, 0x0)),
    t("vxor.vv", vr(0x0b, 0x0)),
    t("vmul.vv", vr(0x25, 0x2)),
    t("vdiv.vv", vr(0x21, 0x2)),
    t("vfmadd.vv", vr4(0x0)),
    t("vfnmadd.vv", vr4(0x1)),
    t("vfmsub.vv", vr4(0x2)),
    t("vfnmsub.vv", vr4(0x3)),
    t("vsll.vi", Format::Vi { opcode: OP_VECTOR, funct6: 0x25, funct3: 0x3 }),
    t("vsrl.vi", Format::Vi { opcode: OP_VECTOR, funct6: 0x28, funct3: 0x3 }),
    t("vsra.vi", Format::Vi { opcode: OP_VECTOR, funct6: 0x29, funct3: 0x3 }),
    t("vmand.mm", vm(0x19)),
    t("vmnand.mm", vm(0x1d)),
    t("vmor.mm", vm(0x1a)),
    t("vmnor.mm", vm(0x1e)),
    t("vmxor.mm", vm(0x1b)),
    t("vmxnor.mm", vm(0x1f)),
    t("vmornot.mm", vm(0x1c)),
    t("vadd.vx", Format::Vx { opcode: OP_VECTOR, funct6: 0x00, funct3: 0x4 }),
    t("vsub.vx", Format::Vx { opcode: OP_VECTOR, funct6: 0x02, funct3: 0x4 }),
    t("vmul.vx", Format::Vx { opcode: OP_VECTOR, funct6: 0x25, funct3: 0x6 }),
];

/// A template constant does not fit its field, which is a catalog authoring
/// defect and fatal at startup.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CatalogError {
    #[error("{mnemonic}: {field} = {value:#x} does not fit in {width} bits")]
    FieldTooWide {
        mnemonic: &'static str,
        field: &'static str,
        value: u32,
        width: u32,
    },
    #[error("{mnemonic}: opcode {opcode:#04x} is not a 32-bit encoding")]
    CompressedOpcode { mnemonic: &'static str, opcode: u32 },
    #[error("catalog is empty")]
    Empty,
}

/// The instruction pool a generator draws from. Immutable once built.
#[derive(Debug, Clone)]
pub struct Catalog {
    templates: Vec<InstructionTemplate>,
}

impl Catalog {
    /// Concatenates the base group with every group enabled by `config`.
    /// Deterministic: the same config always yields the same order.
    pub fn build(config: &FuzzConfig) -> Result<Self, CatalogError> {
        let rv64 = config.xlen == Xlen::Rv64;
        let ext = config.extensions;
        let groups: [(bool, &[InstructionTemplate]); 7] = [
            (true, BASE_TEMPLATES),
            (rv64, RV64_TEMPLATES),
            (ext.m, M_TEMPLATES),
            (ext.amo, AMO_TEMPLATES),
            (ext.amo && rv64, AMO_RV64_TEMPLATES),
            (ext.f, FLOAT_TEMPLATES),
            (ext.vector, VECTOR_TEMPLATES),
        ];
        let templates: Vec<InstructionTemplate> = groups
            .into_iter()
            .filter(|(enabled, _)| *enabled)
            .flat_map(|(_, group)| group.iter().copied())
            .collect();
        Self::from_templates(templates)
    }

    /// Builds a catalog from an explicit template list, validating every entry.
    pub fn from_templates(templates: Vec<InstructionTemplate>) -> Result<Self, CatalogError> {
        if templates.is_empty() {
            return Err(CatalogError::Empty);
        }
        for template in &templates {
            validate_template(template)?;
        }
        Ok(Self { templates })
    }

    pub fn templates(&self) -> &[InstructionTemplate] {
        &self.templates
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }

    pub fn find(&self, mnemonic: &str) -> Option<&InstructionTemplate> {
        self.templates.iter().find(|t| t.mnemonic == mnemonic)
    }
}

fn validate_template(template: &InstructionTemplate) -> Result<(), CatalogError> {
    for (field, value, width) in template.format.fields() {
        if value >> width != 0 {
            return Err(CatalogError::FieldTooWide {
                mnemonic: template.mnemonic,
                field,
                value,
                width,
            });
        }
    }
    let opcode = template.format.opcode();
    if opcode & 0b11 != 0b11 {
        return Err(CatalogError::CompressedOpcode {
            mnemonic: template.mnemonic,
            opcode,
        });
    }
    Ok(())
}
