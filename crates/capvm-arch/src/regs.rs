//! Capability register file and trapped frames

use std::ops::{Index, IndexMut};

use crate::capability::Capability;

/// Number of general-purpose capability registers (RV32E minus `zero`).
pub const GENERAL_REGISTERS: usize = 15;

/// ABI names indexed by architectural register number.
pub const REGISTER_NAMES: [&str; GENERAL_REGISTERS + 1] = [
    "zr", "ra", "sp", "gp", "tp", "t0", "t1", "t2", "s0", "s1", "a0", "a1", "a2", "a3", "a4",
    "a5",
];

/// A general-purpose capability register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Reg {
    Ra = 1,
    Sp,
    Gp,
    Tp,
    T0,
    T1,
    T2,
    S0,
    S1,
    A0,
    A1,
    A2,
    A3,
    A4,
    A5,
}

impl Reg {
    pub const ALL: [Reg; GENERAL_REGISTERS] = [
        Reg::Ra,
        Reg::Sp,
        Reg::Gp,
        Reg::Tp,
        Reg::T0,
        Reg::T1,
        Reg::T2,
        Reg::S0,
        Reg::S1,
        Reg::A0,
        Reg::A1,
        Reg::A2,
        Reg::A3,
        Reg::A4,
        Reg::A5,
    ];

    /// Architectural register number, 1..=15.
    pub const fn index(self) -> u8 {
        self as u8
    }

    pub fn from_index(index: u32) -> Option<Reg> {
        Self::ALL.get((index as usize).checked_sub(1)?).copied()
    }

    pub fn name(self) -> &'static str {
        REGISTER_NAMES[self as usize]
    }

    const fn slot(self) -> usize {
        self as usize - 1
    }
}

/// The fifteen general capability registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RegisterFile {
    regs: [Capability; GENERAL_REGISTERS],
}

impl RegisterFile {
    pub fn get(&self, reg: Reg) -> Capability {
        self.regs[reg.slot()]
    }

    pub fn set(&mut self, reg: Reg, value: Capability) {
        self.regs[reg.slot()] = value;
    }

    /// Registers in slot order: slot 0 is `ra`, slot 9 is `a0`.
    pub fn slots(&self) -> &[Capability; GENERAL_REGISTERS] {
        &self.regs
    }
}

impl Index<Reg> for RegisterFile {
    type Output = Capability;

    fn index(&self, reg: Reg) -> &Capability {
        &self.regs[reg.slot()]
    }
}

impl IndexMut<Reg> for RegisterFile {
    fn index_mut(&mut self, reg: Reg) -> &mut Capability {
        &mut self.regs[reg.slot()]
    }
}

/// Register state captured by the hardware at a trap.
///
/// Handlers get `&mut` access but the only mutation offered is
/// [`redirect`](TrappedFrame::redirect).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrappedFrame {
    pcc: Capability,
    registers: RegisterFile,
}

impl TrappedFrame {
    pub fn new(pcc: Capability, registers: RegisterFile) -> Self {
        TrappedFrame { pcc, registers }
    }

    /// The faulting program counter.
    pub fn pcc(&self) -> Capability {
        self.pcc
    }

    pub fn register(&self, reg: Reg) -> Capability {
        self.registers.get(reg)
    }

    pub fn registers(&self) -> &RegisterFile {
        &self.registers
    }

    /// Makes resumption enter the code at `entry` with `argument` in `ca0`
    /// and a null return address. Every other register is left untouched.
    pub fn redirect(&mut self, entry: u32, argument: Capability) {
        self.pcc = self.pcc.with_address(entry);
        self.registers.set(Reg::Ra, Capability::NULL);
        self.registers.set(Reg::A0, argument);
    }
}
