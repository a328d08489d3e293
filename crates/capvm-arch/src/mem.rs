//! Simulated data memory
//!
//! Byte-addressed, little-endian, sparse. Every instruction-level access
//! names the register holding its authorising capability; a failed check
//! traps with `mcause = 0x1c` and `mtval = (reg << 5) | code`, and is
//! retried if the handler resumes at the faulting instruction.

use std::cell::RefCell;

use rustc_hash::FxHashMap;

use crate::capability::Capability;
use crate::cause::{CapFault, CheriFault, MCAUSE_CHERI};
use crate::hart;
use crate::perms::Permissions;
use crate::regs::Reg;

/// Access width.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Width {
    Byte,
    Half,
    Word,
}

impl Width {
    pub const fn bytes(self) -> u32 {
        match self {
            Width::Byte => 1,
            Width::Half => 2,
            Width::Word => 4,
        }
    }
}

thread_local! {
    static RAM: RefCell<FxHashMap<u32, u8>> = RefCell::new(FxHashMap::default());
}

fn read_raw(address: u32, width: Width) -> u32 {
    RAM.with(|ram| {
        let ram = ram.borrow();
        (0..width.bytes()).fold(0u32, |acc, i| {
            let byte = ram.get(&address.wrapping_add(i)).copied().unwrap_or(0);
            acc | (u32::from(byte) << (8 * i))
        })
    })
}

fn write_raw(address: u32, width: Width, value: u32) {
    RAM.with(|ram| {
        let mut ram = ram.borrow_mut();
        for i in 0..width.bytes() {
            ram.insert(address.wrapping_add(i), (value >> (8 * i)) as u8);
        }
    });
}

/// Drops the stored bytes of `[base, base + len)`. Called when an
/// allocation is released; addresses are never handed out again.
pub fn release(base: u32, len: u32) {
    RAM.with(|ram| {
        let mut ram = ram.borrow_mut();
        for i in 0..len {
            ram.remove(&base.wrapping_add(i));
        }
    });
}

/// Number of bytes currently stored.
pub fn resident_bytes() -> usize {
    RAM.with(|ram| ram.borrow().len())
}

/// `l{b,h,w} rd, offset(base)`.
pub fn load(base: Reg, offset: u32, width: Width) -> u32 {
    loop {
        match hart::read(base).check(Permissions::LOAD, offset, width.bytes()) {
            Ok(address) => return read_raw(address, width),
            Err(fault) => hart::trap(MCAUSE_CHERI, CheriFault::encode(base, fault)),
        }
    }
}

/// `s{b,h,w} value, offset(base)`.
pub fn store(base: Reg, offset: u32, width: Width, value: u32) {
    loop {
        match hart::read(base).check(Permissions::STORE, offset, width.bytes()) {
            Ok(address) => return write_raw(address, width, value),
            Err(fault) => hart::trap(MCAUSE_CHERI, CheriFault::encode(base, fault)),
        }
    }
}

/// Non-trapping load used by trusted code, such as fault reporting.
pub fn peek(cap: &Capability, offset: u32, width: Width) -> Result<u32, CapFault> {
    let address = cap.check(Permissions::LOAD, offset, width.bytes())?;
    Ok(read_raw(address, width))
}

/// Non-trapping byte copy into memory through `cap`.
pub fn write_bytes(cap: &Capability, offset: u32, bytes: &[u8]) -> Result<(), CapFault> {
    let address = cap.check(Permissions::STORE, offset, bytes.len() as u32)?;
    for (i, byte) in bytes.iter().enumerate() {
        write_raw(address.wrapping_add(i as u32), Width::Byte, u32::from(*byte));
    }
    Ok(())
}

/// Non-trapping byte copy out of memory through `cap`.
pub fn read_bytes(cap: &Capability, offset: u32, len: u32) -> Result<Vec<u8>, CapFault> {
    let address = cap.check(Permissions::LOAD, offset, len)?;
    Ok((0..len)
        .map(|i| read_raw(address.wrapping_add(i), Width::Byte) as u8)
        .collect())
}
