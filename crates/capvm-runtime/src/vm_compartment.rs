//! The script compartment and its sealed contexts
//!
//! A [`VmCompartment`] owns one protection domain with a fixed allocator
//! quota. Each context it creates is an independent engine over a private
//! heap, reachable only through an [`SObj`] sealed with a key the
//! compartment never hands out. Every entry point runs through the
//! compartment switcher and unseals its handle before touching anything;
//! a handle that does not unseal fails closed with
//! [`BoundaryError::InvalidHandle`].

use std::cell::RefCell;
use std::rc::Rc;

use capvm_arch::{Allocator, Capability, Compartment, SObj, SealingKey, TokenStore};
use capvm_engine::{ExcKind, Exception, ExecResult, GcStats, Mode, Value, Vm};

use crate::config::{VmConfig, AUTO_BOOT_MODULE, BOOT_MODULE};
use crate::error::{BoundaryError, BoundaryResult};
use crate::export::{ExportRoots, ExportTable};
use crate::marshal;
use crate::native::NativeValue;
use crate::repl::{self, Console, ReplExit, ReplMode};
use crate::report::pack_fault;
use crate::signature::Signature;
use crate::translator::{ActiveGuard, FaultTranslator};

/// Quota charged for the sealed allocation behind each context handle.
pub const CONTEXT_STATE_SIZE: u32 = 64;

struct ContextState {
    vm: Vm,
    heap: Capability,
    exports: Rc<RefCell<ExportTable>>,
    repl_mode: ReplMode,
}

type ContextCell = Rc<RefCell<ContextState>>;

pub struct VmCompartment {
    config: VmConfig,
    compartment: Compartment,
    allocator: Allocator,
    contexts: RefCell<TokenStore<ContextCell>>,
    translator: Rc<FaultTranslator>,
}

impl VmCompartment {
    pub fn new(config: VmConfig) -> Self {
        let compartment = Compartment::new(config.name.clone());
        let allocator = Allocator::with_quota(config.quota);
        let translator = Rc::new(FaultTranslator::new(&compartment));
        compartment.set_error_handler(translator.clone());
        let contexts = TokenStore::new(SealingKey::new(), allocator.clone());
        log::debug!(
            "compartment '{}' ready with a {} byte quota",
            config.name,
            config.quota
        );
        VmCompartment {
            config,
            compartment,
            allocator,
            contexts: RefCell::new(contexts),
            translator,
        }
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    pub fn compartment(&self) -> &Compartment {
        &self.compartment
    }

    pub fn allocator(&self) -> &Allocator {
        &self.allocator
    }

    pub fn live_contexts(&self) -> usize {
        self.contexts.borrow().len()
    }

    // ------------------------------------------------------------------
    // Plumbing
    // ------------------------------------------------------------------

    /// Runs `body` inside the compartment.
    fn enter<R>(&self, body: impl FnOnce() -> BoundaryResult<R>) -> BoundaryResult<R> {
        match self.compartment.call(body) {
            Ok(result) => result,
            Err(fault) => {
                log::warn!("call into '{}' failed: {}", self.config.name, fault);
                Err(fault.into())
            }
        }
    }

    fn unseal(&self, handle: SObj) -> BoundaryResult<ContextCell> {
        self.contexts
            .borrow()
            .unseal(handle)
            .cloned()
            .ok_or(BoundaryError::InvalidHandle(handle))
    }

    /// Enters the compartment and hands `body` exclusive access to the
    /// context behind `handle`.
    fn with_context<R>(
        &self,
        handle: SObj,
        body: impl FnOnce(&mut ContextState) -> BoundaryResult<R>,
    ) -> BoundaryResult<R> {
        self.enter(|| {
            let cell = self.unseal(handle)?;
            let mut state = cell.try_borrow_mut().map_err(|_| BoundaryError::ContextBusy)?;
            state.vm.reset_stacks();
            state.vm.set_output(self.config.output.clone());
            body(&mut state)
        })
    }

    fn activate(&self, vm: &Vm) -> ActiveGuard {
        self.translator.take_last_fault();
        self.translator.activate(vm.emergency(), vm.output().clone())
    }

    /// Runs `body` in a protected region of the context's engine. An
    /// exception that reaches the region is printed and becomes the error.
    fn run<R>(&self, vm: &mut Vm, body: impl FnOnce(&mut Vm) -> ExecResult<R>) -> BoundaryResult<R> {
        let _active = self.activate(vm);
        match vm.protected(body) {
            Ok(value) => Ok(value),
            Err(exc) => {
                vm.print_exception(exc);
                Err(self.classify(vm, exc))
            }
        }
    }

    fn classify(&self, vm: &Vm, exc: Exception) -> BoundaryError {
        let kind = vm.exception_kind(exc).unwrap_or(ExcKind::RuntimeError);
        if let Some((mcause, mtval)) = self.translator.take_last_fault() {
            let packed = Value::Int(i64::from(pack_fault(mcause, mtval)));
            if kind == ExcKind::OSError && vm.exception_args(exc) == [packed] {
                return BoundaryError::HardwareFault { mcause, mtval };
            }
        }
        BoundaryError::UncaughtScriptException {
            kind,
            message: vm.to_str(Value::Obj(exc.object())),
        }
    }

    fn teardown(&self, state: &mut ContextState) {
        state.exports.borrow_mut().clear();
        state.vm.clear();
        self.release_heap(state.heap);
    }

    fn start_engine(&self, heap: Capability, exports: &Rc<RefCell<ExportTable>>) -> BoundaryResult<Vm> {
        let mut vm = Vm::new(heap, self.config.engine_config())?;
        vm.add_root_source(Rc::new(ExportRoots(Rc::clone(exports))));
        Ok(vm)
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Creates a context over a fresh `heap_size` byte heap and runs the
    /// boot script. On any failure nothing stays allocated.
    pub fn create(&self, heap_size: u32) -> BoundaryResult<SObj> {
        self.enter(|| {
            let pending = self.build_context(heap_size)?;
            if let Some(boot) = self.config.frozen_module(BOOT_MODULE) {
                let mut state = pending.cell.borrow_mut();
                if let Err(err) = self.run(&mut state.vm, |vm| vm.exec_module(BOOT_MODULE, boot)) {
                    log::warn!("boot script failed, discarding context: {}", err);
                    return Err(err);
                }
            }
            log::info!("engine initialised");
            Ok(pending.commit())
        })
    }

    /// Allocates the heap, engine and handle of a new context. The result
    /// is discarded again unless committed, including when a halt unwinds
    /// through the boot script.
    fn build_context(&self, heap_size: u32) -> BoundaryResult<PendingContext<'_>> {
        let heap = self.allocator.alloc(heap_size)?;
        let exports = Rc::new(RefCell::new(ExportTable::new(self.allocator.clone())));
        let vm = match self.start_engine(heap, &exports) {
            Ok(vm) => vm,
            Err(err) => {
                self.release_heap(heap);
                return Err(err);
            }
        };
        log::info!("collector initialised over {} bytes", heap.length());

        let cell = Rc::new(RefCell::new(ContextState {
            vm,
            heap,
            exports,
            repl_mode: ReplMode::default(),
        }));
        let handle = match self.contexts.borrow_mut().alloc(CONTEXT_STATE_SIZE, Rc::clone(&cell)) {
            Ok(handle) => handle,
            Err(err) => {
                self.teardown(&mut cell.borrow_mut());
                return Err(err.into());
            }
        };
        Ok(PendingContext {
            owner: self,
            cell,
            handle: Some(handle),
        })
    }

    fn release_heap(&self, heap: Capability) {
        if let Err(err) = self.allocator.free(heap) {
            log::warn!("context heap {} was already released: {}", heap, err);
        }
    }

    /// Tears down the context and releases its heap and handle.
    pub fn destroy(&self, handle: SObj) -> BoundaryResult<()> {
        self.enter(|| {
            let cell = self.unseal(handle)?;
            let mut state = cell.try_borrow_mut().map_err(|_| BoundaryError::ContextBusy)?;
            log::info!("exiting engine");
            self.teardown(&mut state);
            drop(state);
            self.contexts.borrow_mut().destroy(handle);
            Ok(())
        })
    }

    /// Restarts the engine in place: same heap, same handle, empty globals.
    /// The boot script does not run again.
    ///
    /// If the heap has been revoked the context is discarded and
    /// [`BoundaryError::HeapRevoked`] is returned.
    pub fn restart(&self, handle: SObj) -> BoundaryResult<()> {
        self.enter(|| {
            let cell = self.unseal(handle)?;
            let mut state = cell.try_borrow_mut().map_err(|_| BoundaryError::ContextBusy)?;
            state.exports.borrow_mut().clear();
            state.vm.clear();

            let heap = self.allocator.load_filter(state.heap);
            let restarted = if heap.is_tagged() && self.allocator.is_live(&heap) {
                self.start_engine(heap, &state.exports)
            } else {
                Err(BoundaryError::HeapRevoked)
            };
            match restarted {
                Ok(vm) => {
                    state.vm = vm;
                    state.repl_mode = ReplMode::default();
                    log::info!("reinitialised");
                    Ok(())
                }
                Err(err) => {
                    log::warn!("restart failed, discarding context: {}", err);
                    self.release_heap(state.heap);
                    drop(state);
                    self.contexts.borrow_mut().destroy(handle);
                    Err(err)
                }
            }
        })
    }

    // ------------------------------------------------------------------
    // Execution
    // ------------------------------------------------------------------

    /// Runs one interactive statement; expression results are printed.
    pub fn execute_statement(&self, handle: SObj, source: &str) -> BoundaryResult<()> {
        self.with_context(handle, |state| {
            self.run(&mut state.vm, |vm| vm.exec(source, Mode::Single))
        })
    }

    pub fn execute_file(&self, handle: SObj, source: &str) -> BoundaryResult<()> {
        self.with_context(handle, |state| {
            self.run(&mut state.vm, |vm| vm.exec_module("<stdin>", source))
        })
    }

    /// Runs a module from the frozen table.
    pub fn execute_frozen(&self, handle: SObj, name: &str) -> BoundaryResult<()> {
        self.with_context(handle, |state| match self.config.frozen_module(name) {
            Some(source) => self.run(&mut state.vm, |vm| vm.exec_module(name, source)),
            None => {
                let message = format!("could not find module '{}'", name);
                state.vm.write(&message);
                state.vm.write("\n");
                Err(BoundaryError::UncaughtScriptException {
                    kind: ExcKind::OSError,
                    message,
                })
            }
        })
    }

    /// Calls the global function `name` with `args` marshalled per
    /// `signature` (return tag first). The signature and every argument are
    /// checked before the engine runs.
    pub fn execute_named(
        &self,
        handle: SObj,
        name: &str,
        signature: &str,
        args: &[NativeValue],
    ) -> BoundaryResult<NativeValue> {
        let signature = Signature::parse(signature)?;
        self.with_context(handle, |state| {
            marshal::check_args(&signature, args, &state.exports.borrow())?;
            let exports = Rc::clone(&state.exports);
            let ret = self.run(&mut state.vm, |vm| {
                vm.scoped(|vm| {
                    let mut values = Vec::with_capacity(args.len());
                    for arg in args {
                        let value = marshal::to_script(vm, &exports, arg)?;
                        vm.keep(value);
                        values.push(value);
                    }
                    vm.call_global(name, &values)
                })
            })?;
            marshal::from_script(&state.vm, &exports, signature.ret(), ret)
        })
    }

    /// Unroots an object handed out as an `O` return.
    pub fn free_exported_handle(&self, handle: SObj, token: SObj) -> BoundaryResult<()> {
        self.with_context(handle, |state| {
            match state.exports.borrow_mut().free(token) {
                Some(_) => Ok(()),
                None => Err(BoundaryError::InvalidHandle(token)),
            }
        })
    }

    pub fn collect_garbage(&self, handle: SObj) -> BoundaryResult<GcStats> {
        self.with_context(handle, |state| Ok(state.vm.collect()))
    }

    pub fn heap_capability(&self, handle: SObj) -> BoundaryResult<Capability> {
        self.with_context(handle, |state| Ok(state.heap))
    }

    // ------------------------------------------------------------------
    // Interactive loops
    // ------------------------------------------------------------------

    pub fn run_raw_repl(&self, handle: SObj, console: &mut dyn Console) -> BoundaryResult<ReplExit> {
        self.with_context(handle, |state| {
            let _active = self.activate(&state.vm);
            Ok(repl::raw_repl(&mut state.vm, console, &mut state.repl_mode))
        })
    }

    pub fn run_friendly_repl(&self, handle: SObj, console: &mut dyn Console) -> BoundaryResult<ReplExit> {
        self.with_context(handle, |state| {
            let _active = self.activate(&state.vm);
            Ok(repl::friendly_repl(
                &mut state.vm,
                console,
                &mut state.repl_mode,
                &self.config.name,
            ))
        })
    }

    /// Runs frozen `boot.py` if configured, then the loop the context was
    /// last in, switching on request until a soft reset.
    pub fn run_auto_repl(&self, handle: SObj, console: &mut dyn Console) -> BoundaryResult<ReplExit> {
        self.with_context(handle, |state| {
            let _active = self.activate(&state.vm);
            Ok(repl::auto_repl(
                &mut state.vm,
                console,
                &mut state.repl_mode,
                &self.config.name,
                self.config.frozen_module(AUTO_BOOT_MODULE),
            ))
        })
    }
}

/// A context that is not yet handed out.
struct PendingContext<'a> {
    owner: &'a VmCompartment,
    cell: ContextCell,
    handle: Option<SObj>,
}

impl PendingContext<'_> {
    fn commit(mut self) -> SObj {
        self.handle.take().unwrap_or(SObj::INVALID)
    }
}

impl Drop for PendingContext<'_> {
    fn drop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        match self.cell.try_borrow_mut() {
            Ok(mut state) => self.owner.teardown(&mut state),
            Err(_) => log::error!("context {:?} still borrowed while discarded", handle),
        }
        self.owner.contexts.borrow_mut().destroy(handle);
    }
}

impl std::fmt::Debug for VmCompartment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VmCompartment")
            .field("name", &self.config.name)
            .field("contexts", &self.live_contexts())
            .field("used", &self.allocator.used())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use capvm_arch::hart;
    use capvm_engine::OutputSink;

    #[test]
    fn test_halt_during_construction_rolls_back() {
        let vm = VmCompartment::new(VmConfig::new().with_output(OutputSink::Discard));
        let result = vm.enter(|| -> BoundaryResult<()> {
            let _pending = vm.build_context(0x4000)?;
            hart::halt()
        });
        assert_eq!(result, Err(BoundaryError::DoubleFault));
        assert!(vm.compartment().is_halted());
        assert_eq!(vm.allocator().used(), 0);
        assert_eq!(vm.allocator().live_allocations(), 0);
        assert_eq!(vm.live_contexts(), 0);
    }

    #[test]
    fn test_committed_context_stays() {
        let vm = VmCompartment::new(VmConfig::new().with_output(OutputSink::Discard));
        let handle = vm.enter(|| Ok(vm.build_context(0x4000)?.commit())).unwrap();
        assert_eq!(vm.live_contexts(), 1);
        assert!(vm.execute_statement(handle, "x = 1").is_ok());
    }
}
