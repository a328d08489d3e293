//! Compartments and the switcher
//!
//! A [`Compartment`] owns a code region, a stack and a globals region, plus
//! an optional [`ErrorHandler`]. [`Compartment::call`] is the switcher: it
//! installs the callee's registers and a fresh unwind chain, runs the body
//! and restores the caller whatever happens. Forced unwinds and halts stop
//! at this boundary and come back as [`CallFault`]s.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::capability::Capability;
use crate::hart::{self, ForcedUnwind, Halt};
use crate::nlr::{Jump, JUMP_ENTRY_OFFSET};
use crate::perms::Permissions;
use crate::regs::TrappedFrame;

/// Size of each compartment's code region.
pub const CODE_SIZE: u32 = 0x1000;
/// Size of each compartment's stack.
pub const STACK_SIZE: u32 = 0x800;
/// Size of each compartment's globals region.
pub const GLOBALS_SIZE: u32 = 0x100;

const IMAGE_SPACE_START: u32 = 0x2000_0000;

static NEXT_IMAGE_ADDRESS: AtomicU32 = AtomicU32::new(IMAGE_SPACE_START);

fn reserve_image(size: u32, perms: Permissions) -> Capability {
    let base = NEXT_IMAGE_ADDRESS.fetch_add(size, Ordering::Relaxed);
    Capability::root(base, size, perms)
}

/// What the hart should do once an error handler returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorRecovery {
    /// Resume with the (possibly redirected) trapped frame.
    InstallContext,
    /// Discard the compartment's stack and return to its caller.
    ForceUnwind,
}

/// A compartment's trap handler.
pub trait ErrorHandler {
    fn handle(&self, frame: &mut TrappedFrame, mcause: u32, mtval: u32) -> ErrorRecovery;
}

/// How a compartment call failed to return normally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CallFault {
    #[error("compartment call was forcibly unwound")]
    ForcedUnwind,

    #[error("compartment halted after a double fault")]
    DoubleFault,
}

pub(crate) struct CompartmentInner {
    pub(crate) name: String,
    pub(crate) code: Capability,
    pub(crate) stack: Capability,
    pub(crate) globals: Capability,
    pub(crate) handler: RefCell<Option<Rc<dyn ErrorHandler>>>,
    halted: Cell<bool>,
}

/// A protection domain. Cloning gives another handle to the same one.
#[derive(Clone)]
pub struct Compartment {
    inner: Rc<CompartmentInner>,
}

impl Compartment {
    pub fn new(name: impl Into<String>) -> Self {
        let inner = CompartmentInner {
            name: name.into(),
            code: reserve_image(CODE_SIZE, Permissions::CODE),
            stack: reserve_image(STACK_SIZE, Permissions::DATA),
            globals: reserve_image(GLOBALS_SIZE, Permissions::DATA),
            handler: RefCell::new(None),
            halted: Cell::new(false),
        };
        log::debug!("compartment {} code at {:?}", inner.name, inner.code);
        Compartment {
            inner: Rc::new(inner),
        }
    }

    pub(crate) fn from_inner(inner: Rc<CompartmentInner>) -> Self {
        Compartment { inner }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn code(&self) -> Capability {
        self.inner.code
    }

    pub fn stack(&self) -> Capability {
        self.inner.stack
    }

    pub fn globals(&self) -> Capability {
        self.inner.globals
    }

    /// Address a redirected trap frame must resume at to unwind.
    pub fn jump_entry(&self) -> u32 {
        self.inner.code.base() + JUMP_ENTRY_OFFSET
    }

    pub fn set_error_handler(&self, handler: Rc<dyn ErrorHandler>) {
        *self.inner.handler.borrow_mut() = Some(handler);
    }

    pub fn clear_error_handler(&self) {
        self.inner.handler.borrow_mut().take();
    }

    pub fn is_halted(&self) -> bool {
        self.inner.halted.get()
    }

    pub fn same_as(&self, other: &Compartment) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    /// Calls into this compartment.
    ///
    /// Panics that are neither forced unwinds nor halts are bugs and keep
    /// propagating once the caller's state is back in place.
    pub fn call<R>(&self, body: impl FnOnce() -> R) -> Result<R, CallFault> {
        if self.is_halted() {
            log::warn!("call into halted compartment {} refused", self.inner.name);
            return Err(CallFault::DoubleFault);
        }
        let saved = hart::enter(self.inner.clone());
        let outcome = panic::catch_unwind(AssertUnwindSafe(body));
        hart::leave(saved);

        match outcome {
            Ok(value) => Ok(value),
            Err(payload) if payload.is::<ForcedUnwind>() || payload.is::<Jump>() => {
                Err(CallFault::ForcedUnwind)
            }
            Err(payload) if payload.is::<Halt>() => {
                log::error!("compartment {} halted", self.inner.name);
                self.inner.halted.set(true);
                Err(CallFault::DoubleFault)
            }
            Err(payload) => panic::resume_unwind(payload),
        }
    }
}

impl fmt::Debug for Compartment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Compartment")
            .field("name", &self.inner.name)
            .field("code", &self.inner.code)
            .field("halted", &self.inner.halted.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::regs::Reg;

    #[test]
    fn test_call_installs_and_restores_registers() {
        let c = Compartment::new("callee");
        hart::write(Reg::S0, Capability::from_address(0x99));
        let inside = c
            .call(|| {
                assert!(hart::current().is_some_and(|cur| cur.same_as(&c)));
                hart::write(Reg::S0, Capability::from_address(0x11));
                (hart::read(Reg::Sp), hart::read(Reg::Gp), hart::pcc())
            })
            .unwrap();
        assert_eq!(inside.0.address(), c.stack().base() + STACK_SIZE);
        assert_eq!(inside.1, c.globals());
        assert_eq!(inside.2, c.code());
        assert_eq!(hart::read(Reg::S0).address(), 0x99);
        assert!(hart::current().is_none());
    }

    #[test]
    fn test_trap_without_handler_forces_unwind() {
        let c = Compartment::new("plain");
        let out = c.call(|| {
            hart::trap(crate::cause::MCAUSE_ILLEGAL_INSTRUCTION, 0);
            1
        });
        assert_eq!(out, Err(CallFault::ForcedUnwind));
        assert!(!c.is_halted());
        assert_eq!(c.call(|| 2), Ok(2));
    }
}
