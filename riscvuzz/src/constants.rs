//! This module defines constants used throughout the fuzzer.
//! These constants cover the RISC-V major opcodes used by the instruction
//! catalog, the default operand bias tables, and the limits of the board
//! wire protocol.

/// Integer register-register operations (`0110011`).
pub const OP_R: u32 = 0x33;
/// Integer register-immediate operations (`0010011`).
pub const OP_IMM: u32 = 0x13;
pub const OP_LUI: u32 = 0x37;
pub const OP_AUIPC: u32 = 0x17;
pub const OP_JAL: u32 = 0x6f;
pub const OP_JALR: u32 = 0x67;
pub const OP_BRANCH: u32 = 0x63;
pub const OP_LOAD: u32 = 0x03;
pub const OP_STORE: u32 = 0x23;
/// `MISC-MEM`, home of FENCE and FENCE.I.
pub const OP_MISC: u32 = 0x0f;
pub const OP_SYSTEM: u32 = 0x73;
/// A-extension atomic memory operations.
pub const OP_AMO: u32 = 0x2f;
pub const OP_FPU: u32 = 0x53;
pub const OP_LOAD_FP: u32 = 0x07;
pub const OP_STORE_FP: u32 = 0x27;
/// `OP-V`, the vector arithmetic major opcode.
pub const OP_VECTOR: u32 = 0x57;
/// Major opcode used for the four-operand vector multiply-add templates.
pub const OP_VFMA: u32 = 0x5b;

/// The canonical NOP (`addi x0, x0, 0`).
pub const NOP: u32 = 0x0000_0013;

/// Number of architectural registers in each register file.
pub const REGISTER_COUNT: u8 = 32;

/// General purpose register that is never sampled by the uniform path.
/// The board harness uses `x9` to hold the return address into the sandbox.
pub const RESERVED_GPR: u8 = 9;

pub const DEFAULT_SPECIAL_GPRS: [u8; 4] = [0, 1, 2, 31];
pub const DEFAULT_SPECIAL_FPRS: [u8; 3] = [0, 1, 31];
pub const DEFAULT_SPECIAL_VREGS: [u8; 3] = [0, 1, 31];
pub const DEFAULT_SPECIAL_SIMMS: [i64; 5] = [0, 1, -1, (1 << 11) - 1, -(1 << 11)];
pub const DEFAULT_SPECIAL_UIMMS: [u64; 5] = [0, 1, (1 << 12) - 1, 1 << 12, 1 << 10];

/// Size in bytes of the big-endian length prefix carried by every frame.
pub const FRAME_HEADER_LEN: usize = 4;

/// Size in bytes of a single instruction word on the wire.
pub const WORD_LEN: usize = 4;

/// Longest board name accepted during the handshake.
pub const MAX_BOARD_NAME_LEN: usize = 256;

/// Default cap on the size of a single result blob (16 MiB).
pub const DEFAULT_MAX_RESULT_LEN: usize = 16 * 1024 * 1024;

/// Default baud rate used for serial-attached boards.
pub const DEFAULT_SERIAL_BAUD: u32 = 115_200;

/// Number of result messages a board reports for every batch.
pub const RESULTS_PER_BATCH: usize = 2;
