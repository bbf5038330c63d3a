//! Internal limits and encoding constants shared by the compiler,
//! the instruction stream and the binary chunk format.

/// Size in bytes of an opcode.
pub const SIZE_INSTR: usize = 1;
/// Size in bytes of a short operand.
pub const SIZE_ARG_S: usize = 1;
/// Size in bytes of a long operand (3 bytes, little-endian).
pub const SIZE_ARG_L: usize = 3;

/// Maximum value of a short operand.
pub const MAX_ARG_S: u32 = (1 << (SIZE_ARG_S * 8)) - 1;
/// Maximum value of a long operand.
pub const MAX_ARG_L: u32 = (1 << (SIZE_ARG_L * 8)) - 1;

/// Maximum size of a function's instruction stream, in bytes.
pub const MAX_CODE: usize = MAX_ARG_L as usize;
/// Maximum encodable jump offset.
pub const MAX_JMP: usize = MAX_ARG_L as usize;

/// Immediate operands are signed-magnitude: the most significant bit of
/// the operand carries the sign, so one "bit" of range is lost compared
/// to the raw operand width.
pub const MAX_IMM: i64 = (MAX_ARG_S >> 1) as i64;
pub const MIN_IMM: i64 = -MAX_IMM;
pub const MAX_IMML: i64 = (MAX_ARG_L >> 1) as i64;
pub const MIN_IMML: i64 = -MAX_IMML;

/// Result count meaning "all values the call produced". On the wire the
/// count is biased by +1 so `MULTRET` encodes as 0.
pub const MULTRET: i32 = -1;

/// Maximum number of active local variables per function.
pub const MAX_VARS: usize = MAX_ARG_L as usize;

/// Line deltas must fit a signed byte; at this magnitude the entry is
/// promoted to the absolute line-info table.
pub const LIM_LINE_DIFF: i32 = 0x80;

/// Sentinel stored in `lineinfo` for entries whose line is recorded in
/// `abslineinfo` instead, and for operand filler bytes.
pub const ABS_LINEINFO: i8 = i8::MIN;

/// An absolute line-info entry is forced after this many consecutive
/// relative entries, bounding line lookup cost.
pub const MAX_IWTHABS: u8 = 128;

/// Strings up to this byte length are interned.
pub const MAX_SHORT_LEN: usize = 40;

/// Number of list items accumulated on the stack before a SETLIST
/// flush. Must stay below `MAX_ARG_S`.
pub const LIST_FIELDS_PER_FLUSH: usize = 50;

pub const VERSION_MAJOR: u8 = 1;
pub const VERSION_MINOR: u8 = 0;
