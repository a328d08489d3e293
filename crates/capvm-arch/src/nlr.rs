//! Non-local control transfer
//!
//! A protected region pushes an [`UnwindFrame`] onto the per-compartment
//! chain and runs its body. [`unwind`] pops the top frame, restores exactly
//! the registers it captured and transfers control straight back to the
//! region, crossing any number of intervening frames. The transfer is Rust
//! stack unwinding (`resume_unwind` caught by `catch_unwind`), the one
//! facility in the language that crosses arbitrary native frames in one step.
//!
//! Unwinding with an empty chain is never a silent return: it executes a
//! breakpoint so the compartment's error handler can force the whole call
//! back out through the switcher.

use std::cell::RefCell;
use std::panic::{self, AssertUnwindSafe};

use crate::capability::Capability;
use crate::cause::MCAUSE_BREAKPOINT;
use crate::hart;
use crate::regs::Reg;

#[cfg(panic = "abort")]
compile_error!("capvm-arch transfers control by unwinding; build with panic = \"unwind\"");

/// Offset of the unwind entry point within a compartment's code region. A
/// trap frame redirected here resumes as `unwind(ca0)`.
pub const JUMP_ENTRY_OFFSET: u32 = 0x40;

/// Registers a protected region needs to resume at its failure path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnwindFrame {
    pub gp: Capability,
    pub ra: Capability,
    pub sp: Capability,
    pub s0: Capability,
    pub s1: Capability,
}

impl UnwindFrame {
    fn capture() -> Self {
        UnwindFrame {
            gp: hart::read(Reg::Gp),
            ra: hart::read(Reg::Ra),
            sp: hart::read(Reg::Sp),
            s0: hart::read(Reg::S0),
            s1: hart::read(Reg::S1),
        }
    }

    fn restore(&self) {
        hart::write(Reg::Gp, self.gp);
        hart::write(Reg::Ra, self.ra);
        hart::write(Reg::Sp, self.sp);
        hart::write(Reg::S0, self.s0);
        hart::write(Reg::S1, self.s1);
    }
}

/// Unwind payload; `depth` identifies the region it targets.
pub(crate) struct Jump {
    value: Capability,
    frame: UnwindFrame,
    depth: usize,
}

thread_local! {
    static CHAIN: RefCell<Vec<UnwindFrame>> = const { RefCell::new(Vec::new()) };
}

/// Number of protected regions currently open in this compartment.
pub fn depth() -> usize {
    CHAIN.with(|c| c.borrow().len())
}

/// Replaces the chain; used by the switcher on compartment entry and exit.
pub(crate) fn swap_chain(chain: Vec<UnwindFrame>) -> Vec<UnwindFrame> {
    CHAIN.with(|c| std::mem::replace(&mut *c.borrow_mut(), chain))
}

fn truncate(depth: usize) {
    CHAIN.with(|c| c.borrow_mut().truncate(depth));
}

/// Runs `body` as a protected region.
///
/// Returns `Ok` if the body completes and `Err(value)` if something inside
/// it called [`unwind`]`(value)`. Any other unwinding passes through after
/// the region's frame is discarded.
pub fn protect<R>(body: impl FnOnce() -> R) -> Result<R, Capability> {
    let frame = UnwindFrame::capture();
    let depth = CHAIN.with(|c| {
        let mut chain = c.borrow_mut();
        chain.push(frame);
        chain.len()
    });

    match panic::catch_unwind(AssertUnwindSafe(body)) {
        Ok(value) => {
            truncate(depth - 1);
            Ok(value)
        }
        Err(payload) => match payload.downcast::<Jump>() {
            Ok(jump) if jump.depth == depth => {
                jump.frame.restore();
                Err(jump.value)
            }
            Ok(jump) => {
                truncate(depth - 1);
                panic::resume_unwind(jump)
            }
            Err(other) => {
                truncate(depth - 1);
                panic::resume_unwind(other)
            }
        },
    }
}

/// Abandons everything up to the innermost protected region, which then
/// returns `Err(value)`.
pub fn unwind(value: Capability) -> ! {
    let top = CHAIN.with(|c| {
        let mut chain = c.borrow_mut();
        let depth = chain.len();
        chain.pop().map(|frame| (frame, depth))
    });
    match top {
        Some((frame, depth)) => panic::resume_unwind(Box::new(Jump { value, frame, depth })),
        None => unwind_failed(),
    }
}

fn unwind_failed() -> ! {
    log::error!("unwind with no protected region");
    hart::trap(MCAUSE_BREAKPOINT, 0);
    // The handler was expected to force an unwind; returning here means it
    // tried to resume a breakpoint that has nowhere to go.
    hart::halt()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protect_normal_exit_pops() {
        let before = depth();
        let out = protect(|| {
            assert_eq!(depth(), before + 1);
            7
        });
        assert_eq!(out, Ok(7));
        assert_eq!(depth(), before);
    }

    #[test]
    fn test_unwind_crosses_frames() {
        fn deep(n: u32) -> u32 {
            if n == 0 {
                unwind(Capability::from_address(0x42));
            }
            deep(n - 1) + 1
        }
        let out = protect(|| deep(16));
        assert_eq!(out.map_err(|c| c.address()), Err(0x42));
        assert_eq!(depth(), 0);
    }

    #[test]
    fn test_nested_regions_target_innermost() {
        let outer = protect(|| {
            let inner = protect(|| unwind(Capability::from_address(1)));
            assert_eq!(depth(), 1);
            inner.map_err(|c| c.address())
        });
        assert_eq!(outer, Ok(Err(1)));
    }

    #[test]
    fn test_unwind_restores_captured_registers() {
        hart::write(Reg::S0, Capability::from_address(0x5000));
        let out = protect(|| {
            hart::write(Reg::S0, Capability::from_address(0x6000));
            hart::write(Reg::T0, Capability::from_address(0x7000));
            unwind(Capability::NULL)
        });
        assert!(out.is_err());
        assert_eq!(hart::read(Reg::S0).address(), 0x5000);
        // Caller-saved registers are not part of the frame.
        assert_eq!(hart::read(Reg::T0).address(), 0x7000);
    }

    #[test]
    fn test_foreign_panic_passes_through() {
        let result = panic::catch_unwind(|| protect(|| panic!("boom")));
        assert!(result.is_err());
        assert_eq!(depth(), 0);
    }
}
