//! Trap causes and CHERI fault-vector decoding
//!
//! A trap delivers two words: `mcause`, the RISC-V exception cause, and
//! `mtval`, the cause-specific detail. For CHERI violations (`mcause ==
//! 0x1c`) the detail packs the violation code in its low 5 bits and the
//! offending register above them. Bit `0x400` marks a special capability
//! register; its index is then `(mtval >> 5) & 0x3f`.

use crate::regs::Reg;

/// Instruction address misaligned.
pub const MCAUSE_MISALIGNED_FETCH: u32 = 0x0;
/// Illegal instruction.
pub const MCAUSE_ILLEGAL_INSTRUCTION: u32 = 0x2;
/// `ebreak`; raised deliberately by an unwind with no protected region.
pub const MCAUSE_BREAKPOINT: u32 = 0x3;
/// Load access fault.
pub const MCAUSE_LOAD_ACCESS: u32 = 0x5;
/// Store access fault.
pub const MCAUSE_STORE_ACCESS: u32 = 0x7;
/// Environment call from machine mode.
pub const MCAUSE_ECALL: u32 = 0xb;
/// CHERI capability violation.
pub const MCAUSE_CHERI: u32 = 0x1c;

/// Set in `mtval` when the faulting register is a special capability register.
pub const MTVAL_SPECIAL_REGISTER: u32 = 0x400;

/// Printable names for the 5-bit CHERI exception code.
pub const CHERI_EXCEPTION_NAMES: [&str; 32] = [
    "UNWIND", "BOUNDS", "TAG", "SEAL", "04", "05", "06", "07",
    "08", "09", "0a", "0b", "0c", "0d", "0e", "0f",
    "10", "EXEC", "LOAD", "STORE", "14", "STCAP", "STLOC", "17",
    "SYSREG", "19", "1a", "1b", "1c", "1d", "1e", "1f",
];

/// A capability check that failed, as reported by the hardware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, thiserror::Error)]
pub enum CapFault {
    #[error("bounds violation")]
    Bounds,
    #[error("tag violation")]
    Tag,
    #[error("seal violation")]
    Seal,
    #[error("permit execute violation")]
    PermitExecute,
    #[error("permit load violation")]
    PermitLoad,
    #[error("permit store violation")]
    PermitStore,
    #[error("permit store capability violation")]
    PermitStoreCap,
    #[error("permit store local capability violation")]
    PermitStoreLocal,
    #[error("permit access system registers violation")]
    PermitSystemRegisters,
}

impl CapFault {
    /// The 5-bit CHERI exception code.
    pub const fn code(self) -> u32 {
        match self {
            CapFault::Bounds => 0x01,
            CapFault::Tag => 0x02,
            CapFault::Seal => 0x03,
            CapFault::PermitExecute => 0x11,
            CapFault::PermitLoad => 0x12,
            CapFault::PermitStore => 0x13,
            CapFault::PermitStoreCap => 0x15,
            CapFault::PermitStoreLocal => 0x16,
            CapFault::PermitSystemRegisters => 0x18,
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        Some(match code {
            0x01 => CapFault::Bounds,
            0x02 => CapFault::Tag,
            0x03 => CapFault::Seal,
            0x11 => CapFault::PermitExecute,
            0x12 => CapFault::PermitLoad,
            0x13 => CapFault::PermitStore,
            0x15 => CapFault::PermitStoreCap,
            0x16 => CapFault::PermitStoreLocal,
            0x18 => CapFault::PermitSystemRegisters,
            _ => return None,
        })
    }
}

/// Special capability registers that can appear in a CHERI fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SpecialReg {
    Pcc,
    Mtcc,
    Mtdc,
    MScratchC,
    Mepcc,
}

impl SpecialReg {
    pub fn from_index(index: u32) -> Option<Self> {
        match index {
            0x20 => Some(SpecialReg::Pcc),
            0x3c => Some(SpecialReg::Mtcc),
            0x3d => Some(SpecialReg::Mtdc),
            0x3e => Some(SpecialReg::MScratchC),
            0x3f => Some(SpecialReg::Mepcc),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            SpecialReg::Pcc => "PCC",
            SpecialReg::Mtcc => "MTCC",
            SpecialReg::Mtdc => "MTDC",
            SpecialReg::MScratchC => "MScratchC",
            SpecialReg::Mepcc => "MEPCC",
        }
    }
}

/// Register named by a CHERI fault's `mtval`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultRegister {
    /// The zero register (`cnull`).
    Zero,
    General(Reg),
    Special(SpecialReg),
    /// An index the machine does not implement.
    Unknown(u32),
}

/// Decoded CHERI violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheriFault {
    pub code: u32,
    pub register: FaultRegister,
}

impl CheriFault {
    pub fn decode(mtval: u32) -> Self {
        let code = mtval & 0x1f;
        let register = if mtval & MTVAL_SPECIAL_REGISTER != 0 {
            let index = (mtval >> 5) & 0x3f;
            SpecialReg::from_index(index)
                .map(FaultRegister::Special)
                .unwrap_or(FaultRegister::Unknown(index))
        } else {
            match (mtval >> 5) & 0x1f {
                0 => FaultRegister::Zero,
                index => Reg::from_index(index)
                    .map(FaultRegister::General)
                    .unwrap_or(FaultRegister::Unknown(index)),
            }
        };
        CheriFault { code, register }
    }

    /// Packs a violation on a general-purpose register into `mtval`.
    pub fn encode(reg: Reg, fault: CapFault) -> u32 {
        (u32::from(reg.index()) << 5) | fault.code()
    }

    pub fn name(&self) -> &'static str {
        CHERI_EXCEPTION_NAMES[(self.code & 0x1f) as usize]
    }

    pub fn cap_fault(&self) -> Option<CapFault> {
        CapFault::from_code(self.code)
    }
}
