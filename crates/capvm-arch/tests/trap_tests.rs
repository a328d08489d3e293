//! Trap delivery, protected regions and the compartment switcher
//!
//! These exercise the full path a hardware fault takes: a checked access
//! fails, the hart builds a trapped frame, the compartment's handler
//! redirects it to the unwind entry and the innermost protected region sees
//! the value the handler posted.

use std::cell::RefCell;
use std::rc::Rc;

use capvm_arch::cause::{MCAUSE_BREAKPOINT, MCAUSE_CHERI};
use capvm_arch::mem::{self, Width};
use capvm_arch::{
    hart, nlr, Allocator, CallFault, CapFault, Capability, CheriFault, Compartment, ErrorHandler,
    ErrorRecovery, FaultRegister, Permissions, Reg, TrappedFrame,
};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Posts `(mcause << 24) | mtval` to the unwind entry, like a real
/// translator; force-unwinds on breakpoints.
struct Redirect {
    entry: u32,
    seen: RefCell<Vec<(u32, u32, TrappedFrame)>>,
}

impl ErrorHandler for Redirect {
    fn handle(&self, frame: &mut TrappedFrame, mcause: u32, mtval: u32) -> ErrorRecovery {
        self.seen.borrow_mut().push((mcause, mtval, *frame));
        if mcause == MCAUSE_BREAKPOINT {
            return ErrorRecovery::ForceUnwind;
        }
        frame.redirect(self.entry, Capability::from_address((mcause << 24) | (mtval & 0xff_ffff)));
        ErrorRecovery::InstallContext
    }
}

fn redirecting(name: &str) -> (Compartment, Rc<Redirect>) {
    let compartment = Compartment::new(name);
    let handler = Rc::new(Redirect {
        entry: compartment.jump_entry(),
        seen: RefCell::new(Vec::new()),
    });
    compartment.set_error_handler(handler.clone());
    (compartment, handler)
}

// ============================================================================
// Fault Redirection Tests
// ============================================================================

#[test]
fn test_fault_in_protected_region_reaches_catch_point() {
    init_logging();
    let (compartment, handler) = redirecting("faulting");
    let heap = Allocator::with_quota(64);
    let buffer = heap.alloc(8).unwrap();

    let caught = compartment
        .call(|| {
            nlr::protect(|| {
                hart::write(Reg::A1, buffer);
                mem::load(Reg::A1, 8, Width::Word)
            })
        })
        .unwrap();

    let value = caught.unwrap_err();
    let expected_tval = CheriFault::encode(Reg::A1, CapFault::Bounds);
    assert_eq!(value.address(), (MCAUSE_CHERI << 24) | expected_tval);

    let seen = handler.seen.borrow();
    assert_eq!(seen.len(), 1);
    let (mcause, mtval, frame) = seen[0];
    assert_eq!(mcause, MCAUSE_CHERI);
    let decoded = CheriFault::decode(mtval);
    assert_eq!(decoded.register, FaultRegister::General(Reg::A1));
    assert_eq!(frame.register(Reg::A1), buffer);
}

#[test]
fn test_fault_without_region_forces_unwind() {
    init_logging();
    let (compartment, handler) = redirecting("unprotected");
    let out = compartment.call(|| {
        hart::write(Reg::A2, Capability::from_address(0x1000));
        mem::store(Reg::A2, 0, Width::Byte, 1);
        "unreachable"
    });
    assert_eq!(out, Err(CallFault::ForcedUnwind));

    // Tag fault first, then the breakpoint from unwinding with no frame.
    let causes: Vec<u32> = handler.seen.borrow().iter().map(|s| s.0).collect();
    assert_eq!(causes, vec![MCAUSE_CHERI, MCAUSE_BREAKPOINT]);
    assert!(!compartment.is_halted());
}

#[test]
fn test_redirect_preserves_restored_registers() {
    init_logging();
    let (compartment, _handler) = redirecting("preserve");
    let (sp_before, sp_after) = compartment
        .call(|| {
            let sp = hart::read(Reg::Sp);
            let _ = nlr::protect(|| {
                hart::write(Reg::Sp, sp.offset(-64));
                hart::write(Reg::A3, Capability::NULL);
                mem::load(Reg::A3, 0, Width::Word)
            });
            (sp, hart::read(Reg::Sp))
        })
        .unwrap();
    assert_eq!(sp_before, sp_after);
}

#[test]
fn test_permission_fault_code() {
    init_logging();
    let (compartment, handler) = redirecting("readonly");
    let heap = Allocator::with_quota(64);
    let cap = heap.alloc(4).unwrap().restrict(Permissions::LOAD | Permissions::GLOBAL);
    let out = compartment
        .call(|| {
            nlr::protect(|| {
                hart::write(Reg::S1, cap);
                mem::store(Reg::S1, 0, Width::Byte, 0xff)
            })
        })
        .unwrap();
    assert!(out.is_err());
    let mtval = handler.seen.borrow()[0].1;
    assert_eq!(CheriFault::decode(mtval).name(), "STORE");
}

// ============================================================================
// Double Fault Tests
// ============================================================================

struct FaultingHandler;

impl ErrorHandler for FaultingHandler {
    fn handle(&self, _frame: &mut TrappedFrame, _mcause: u32, _mtval: u32) -> ErrorRecovery {
        hart::write(Reg::T0, Capability::NULL);
        mem::load(Reg::T0, 0, Width::Word);
        ErrorRecovery::InstallContext
    }
}

#[test]
fn test_double_fault_halts_compartment() {
    init_logging();
    let compartment = Compartment::new("doomed");
    compartment.set_error_handler(Rc::new(FaultingHandler));
    let out = compartment.call(|| nlr::protect(|| hart::trap(0x2, 0)));
    assert_eq!(out, Err(CallFault::DoubleFault));
    assert!(compartment.is_halted());
    assert_eq!(compartment.call(|| ()), Err(CallFault::DoubleFault));
    assert!(!hart::in_handler());
}

// ============================================================================
// Nesting Tests
// ============================================================================

#[test]
fn test_nested_compartments_isolate_unwind_chains() {
    init_logging();
    let (outer, _) = redirecting("outer");
    let inner = Compartment::new("inner");

    let result = outer
        .call(|| {
            nlr::protect(|| {
                assert_eq!(nlr::depth(), 1);
                let inner_out = inner.call(|| {
                    assert_eq!(nlr::depth(), 0);
                    nlr::unwind(Capability::from_address(5))
                });
                assert_eq!(nlr::depth(), 1);
                inner_out
            })
        })
        .unwrap();
    assert_eq!(result, Ok(Err(CallFault::ForcedUnwind)));
    assert!(hart::current().is_none());
}
