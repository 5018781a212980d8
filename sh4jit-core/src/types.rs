/// IR value types. Guest state is 32-bit; I64 exists for paired
/// floating-point transfers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Type {
    I32 = 0,
    I64 = 1,
}

impl Type {
    pub const fn size_bytes(self) -> u32 {
        match self {
            Type::I32 => 4,
            Type::I64 => 8,
        }
    }
}

/// Guest memory access width.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MemSize {
    S8 = 0,
    S16 = 1,
    S32 = 2,
    S64 = 3,
}

impl MemSize {
    pub const fn bytes(self) -> u32 {
        1 << (self as u32)
    }

    pub const fn from_log2(v: u8) -> MemSize {
        match v & 0x3 {
            0 => MemSize::S8,
            1 => MemSize::S16,
            2 => MemSize::S32,
            _ => MemSize::S64,
        }
    }
}

/// Comparison conditions for `SetCond`. The set matches what the SH4
/// CMP/xx family can ask for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Cond {
    Eq = 0,
    /// Signed greater-than.
    Gt = 1,
    /// Signed greater-or-equal.
    Ge = 2,
    /// Unsigned greater-than (SH4 "HI").
    Hi = 3,
    /// Unsigned greater-or-equal (SH4 "HS").
    Hs = 4,
    /// (a & b) != 0; the inverted sense is handled by the translator.
    TstNe = 5,
}

impl Cond {
    pub const fn from_raw(v: u32) -> Cond {
        match v {
            0 => Cond::Eq,
            1 => Cond::Gt,
            2 => Cond::Ge,
            3 => Cond::Hi,
            4 => Cond::Hs,
            _ => Cond::TstNe,
        }
    }
}

/// One host register as exposed by the backend register file.
///
/// `code` is the host encoding (ModR/M numbering on x86-64). The
/// register allocation pass is parameterized by a slice of these and
/// never hard-codes a host architecture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Register {
    pub name: &'static str,
    pub code: u8,
}
