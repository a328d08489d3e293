//! The script compartment's trap handler
//!
//! A trap raised while an engine is running is delivered to that engine as
//! an `OSError`: the handler posts the exception into the engine's
//! emergency buffer and rewrites the trapped frame so it resumes at the
//! compartment's unwind entry with the exception value in `ca0`. Nothing
//! else in the frame changes.
//!
//! The breakpoint raised by an unwind with no protected region is not
//! converted; the whole call is unwound back to the compartment boundary.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use capvm_arch::cause::MCAUSE_BREAKPOINT;
use capvm_arch::{Compartment, ErrorHandler, ErrorRecovery, TrappedFrame};
use capvm_engine::{EmergencyBuffer, ExcKind, OutputSink};

use crate::report::FaultReport;

/// Engine that receives translated faults while it runs.
struct ActiveEngine {
    emergency: Rc<EmergencyBuffer>,
    output: OutputSink,
}

pub struct FaultTranslator {
    compartment: String,
    jump_entry: u32,
    active: RefCell<Vec<ActiveEngine>>,
    last_fault: Cell<Option<(u32, u32)>>,
}

impl FaultTranslator {
    pub fn new(compartment: &Compartment) -> Self {
        FaultTranslator {
            compartment: compartment.name().to_string(),
            jump_entry: compartment.jump_entry(),
            active: RefCell::new(Vec::new()),
            last_fault: Cell::new(None),
        }
    }

    /// Makes the engine owning `emergency` the target of translated faults
    /// until the guard drops.
    pub fn activate(self: &Rc<Self>, emergency: Rc<EmergencyBuffer>, output: OutputSink) -> ActiveGuard {
        self.active.borrow_mut().push(ActiveEngine { emergency, output });
        ActiveGuard(Rc::clone(self))
    }

    /// The last fault turned into an exception, as `(mcause, mtval)`.
    pub fn take_last_fault(&self) -> Option<(u32, u32)> {
        self.last_fault.take()
    }

    fn report_console(&self, text: &str) {
        if let Some(engine) = self.active.borrow().last() {
            engine.output.write_str(text);
        }
    }
}

impl ErrorHandler for FaultTranslator {
    fn handle(&self, frame: &mut TrappedFrame, mcause: u32, mtval: u32) -> ErrorRecovery {
        let report = FaultReport::capture(&self.compartment, frame, mcause, mtval);
        log::error!("{}", report);

        if mcause == MCAUSE_BREAKPOINT {
            self.report_console("\x04\x04");
            return ErrorRecovery::ForceUnwind;
        }

        let active = self.active.borrow();
        let Some(engine) = active.last() else {
            log::warn!("fault in '{}' with no engine running", self.compartment);
            return ErrorRecovery::ForceUnwind;
        };
        let packed = report.packed();
        let exc = engine.emergency.post(ExcKind::OSError, i64::from(packed));
        self.last_fault.set(Some((mcause, mtval)));
        frame.redirect(self.jump_entry, exc);
        log::warn!("delivering fault as OSError({:#x})", packed);
        ErrorRecovery::InstallContext
    }
}

/// Deactivates an engine on drop, including during an unwind.
pub struct ActiveGuard(Rc<FaultTranslator>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.active.borrow_mut().pop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use capvm_arch::cause::MCAUSE_CHERI;
    use capvm_arch::{nlr, Allocator, CallFault, CapFault, CheriFault, Reg};
    use capvm_engine::{EngineConfig, SharedBuffer, Vm};

    fn engine() -> Vm {
        let heap = Allocator::with_quota(0x2000).alloc(0x1000).unwrap();
        Vm::new(heap, EngineConfig::default()).unwrap()
    }

    #[test]
    fn test_fault_resumes_at_protected_region_as_os_error() {
        let compartment = Compartment::new("mp_vm");
        let translator = Rc::new(FaultTranslator::new(&compartment));
        compartment.set_error_handler(translator.clone());
        let mut vm = engine();
        let mtval = CheriFault::encode(Reg::A2, CapFault::Tag);

        let out = compartment
            .call(|| {
                let _active = translator.activate(vm.emergency(), OutputSink::Discard);
                vm.protected(|_| {
                    capvm_arch::hart::trap(MCAUSE_CHERI, mtval);
                    Ok(())
                })
                .map_err(|exc| vm.exception_args(exc))
            })
            .unwrap();
        assert_eq!(out, Err(vec![capvm_engine::Value::Int(0x1c00_0000 | i64::from(mtval))]));
        assert_eq!(translator.take_last_fault(), Some((MCAUSE_CHERI, mtval)));
        assert!(translator.active.borrow().is_empty());
    }

    #[test]
    fn test_unwind_without_region_forces_unwind() {
        let compartment = Compartment::new("mp_vm");
        let translator = Rc::new(FaultTranslator::new(&compartment));
        compartment.set_error_handler(translator.clone());
        let vm = engine();
        let console = SharedBuffer::new();

        let out = compartment.call(|| {
            let _active = translator.activate(vm.emergency(), OutputSink::Buffer(console.clone()));
            nlr::unwind(vm.heap_capability())
        });
        assert_eq!(out, Err(CallFault::ForcedUnwind));
        assert_eq!(console.take(), "\x04\x04");
        assert!(translator.active.borrow().is_empty());
        assert!(!compartment.is_halted());
    }

    #[test]
    fn test_fault_with_no_engine_forces_unwind() {
        let compartment = Compartment::new("mp_vm");
        compartment.set_error_handler(Rc::new(FaultTranslator::new(&compartment)));
        let out = compartment.call(|| capvm_arch::hart::trap(capvm_arch::cause::MCAUSE_ILLEGAL_INSTRUCTION, 0));
        assert_eq!(out, Err(CallFault::ForcedUnwind));
    }
}
