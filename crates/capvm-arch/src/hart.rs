//! The hart: register file, program counter and trap delivery
//!
//! One simulated hart per thread. Compartment entry swaps its register
//! state; [`trap`] hands a [`TrappedFrame`] to the running compartment's
//! error handler and carries out the recovery it asks for.

use std::cell::RefCell;
use std::panic;
use std::rc::Rc;

use crate::capability::Capability;
use crate::compartment::{Compartment, CompartmentInner, ErrorRecovery};
use crate::nlr::{self, UnwindFrame, JUMP_ENTRY_OFFSET};
use crate::regs::{Reg, RegisterFile, TrappedFrame};

/// Unwind payload for a forced unwind back to the compartment boundary.
pub(crate) struct ForcedUnwind;

/// Unwind payload for a halt after a double fault.
pub(crate) struct Halt;

#[derive(Default)]
struct Hart {
    pcc: Capability,
    registers: RegisterFile,
    in_handler: bool,
    active: Vec<Rc<CompartmentInner>>,
}

thread_local! {
    static HART: RefCell<Hart> = RefCell::new(Hart::default());
}

pub fn read(reg: Reg) -> Capability {
    HART.with(|h| h.borrow().registers.get(reg))
}

pub fn write(reg: Reg, value: Capability) {
    HART.with(|h| h.borrow_mut().registers.set(reg, value));
}

pub fn pcc() -> Capability {
    HART.with(|h| h.borrow().pcc)
}

pub fn set_pcc(pcc: Capability) {
    HART.with(|h| h.borrow_mut().pcc = pcc);
}

/// Snapshot of the current register state.
pub fn frame() -> TrappedFrame {
    HART.with(|h| {
        let h = h.borrow();
        TrappedFrame::new(h.pcc, h.registers)
    })
}

/// The compartment currently executing on this hart.
pub fn current() -> Option<Compartment> {
    HART.with(|h| h.borrow().active.last().cloned().map(Compartment::from_inner))
}

/// Whether an error handler is running.
pub fn in_handler() -> bool {
    HART.with(|h| h.borrow().in_handler)
}

/// Caller state put aside while a compartment runs.
pub(crate) struct SavedHart {
    pcc: Capability,
    registers: RegisterFile,
    in_handler: bool,
    chain: Vec<UnwindFrame>,
}

/// Installs the callee's entry state: fresh stack and globals, everything
/// else null, and an empty unwind chain.
pub(crate) fn enter(callee: Rc<CompartmentInner>) -> SavedHart {
    let mut registers = RegisterFile::default();
    registers.set(Reg::Sp, callee.stack.with_address(callee.stack.base() + callee.stack.length()));
    registers.set(Reg::Gp, callee.globals);
    let pcc = callee.code;
    let saved = HART.with(|h| {
        let mut h = h.borrow_mut();
        registers.set(Reg::Ra, h.pcc);
        let saved_pcc = std::mem::replace(&mut h.pcc, pcc);
        let saved_registers = std::mem::replace(&mut h.registers, registers);
        let in_handler = std::mem::replace(&mut h.in_handler, false);
        h.active.push(callee);
        (saved_pcc, saved_registers, in_handler)
    });
    SavedHart {
        pcc: saved.0,
        registers: saved.1,
        in_handler: saved.2,
        chain: nlr::swap_chain(Vec::new()),
    }
}

pub(crate) fn leave(saved: SavedHart) {
    nlr::swap_chain(saved.chain);
    HART.with(|h| {
        let mut h = h.borrow_mut();
        h.active.pop();
        h.pcc = saved.pcc;
        h.registers = saved.registers;
        h.in_handler = saved.in_handler;
    });
}

struct HandlerGuard;

impl HandlerGuard {
    fn enter() -> Self {
        HART.with(|h| h.borrow_mut().in_handler = true);
        HandlerGuard
    }
}

impl Drop for HandlerGuard {
    fn drop(&mut self) {
        HART.with(|h| h.borrow_mut().in_handler = false);
    }
}

fn install(frame: &TrappedFrame) {
    HART.with(|h| {
        let mut h = h.borrow_mut();
        h.pcc = frame.pcc();
        h.registers = *frame.registers();
    });
}

/// Stops the current compartment for good.
pub fn halt() -> ! {
    panic::resume_unwind(Box::new(Halt))
}

/// Raises a trap.
///
/// Returns only when the handler installed a context that resumes at the
/// trapping instruction; the caller then retries it.
pub fn trap(mcause: u32, mtval: u32) {
    let (mut frame, compartment, nested) = HART.with(|h| {
        let h = h.borrow();
        (
            TrappedFrame::new(h.pcc, h.registers),
            h.active.last().cloned(),
            h.in_handler,
        )
    });
    let Some(compartment) = compartment else {
        log::error!("trap outside any compartment: mcause {:#x} mtval {:#x}", mcause, mtval);
        halt();
    };
    if nested {
        log::error!(
            "double fault in compartment {}: mcause {:#x} mtval {:#x}",
            compartment.name,
            mcause,
            mtval
        );
        halt();
    }

    let handler = compartment.handler.borrow().clone();
    let recovery = match handler {
        Some(handler) => {
            let _guard = HandlerGuard::enter();
            handler.handle(&mut frame, mcause, mtval)
        }
        None => ErrorRecovery::ForceUnwind,
    };

    match recovery {
        ErrorRecovery::ForceUnwind => {
            log::warn!(
                "forcing unwind out of compartment {} (mcause {:#x} mtval {:#x})",
                compartment.name,
                mcause,
                mtval
            );
            panic::resume_unwind(Box::new(ForcedUnwind))
        }
        ErrorRecovery::InstallContext => {
            install(&frame);
            let pcc = frame.pcc();
            if !pcc.is_tagged() {
                log::error!("resumed with invalid pcc {:?}", pcc);
                halt();
            }
            if pcc.address() == compartment.code.base() + JUMP_ENTRY_OFFSET {
                nlr::unwind(frame.register(Reg::A0));
            }
        }
    }
}
