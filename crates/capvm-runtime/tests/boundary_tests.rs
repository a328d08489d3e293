//! Entry points of the script compartment, driven from outside it

use std::rc::Rc;

use capvm_arch::cause::{MCAUSE_CHERI, MCAUSE_ILLEGAL_INSTRUCTION};
use capvm_arch::{hart, nlr, Capability, Compartment, Permissions, SObj};
use capvm_engine::{ExcKind, OutputSink, SharedBuffer};
use capvm_runtime::{
    status_of, typed_callback, BoundaryError, Callback, Context, NativeValue, ReplExit, ScriptedConsole, StrView,
    VmCompartment, VmConfig,
};

const HEAP: u32 = 0x4000;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn compartment_with(config: VmConfig) -> (VmCompartment, SharedBuffer) {
    init_logging();
    let out = SharedBuffer::new();
    let vm = VmCompartment::new(config.with_output(OutputSink::Buffer(out.clone())));
    (vm, out)
}

fn compartment() -> (VmCompartment, SharedBuffer) {
    compartment_with(VmConfig::default())
}

fn define(vm: &VmCompartment, handle: SObj, source: &str) {
    if let Err(err) = vm.execute_file(handle, source) {
        panic!("definition failed: {}", err);
    }
}

fn native() -> Compartment {
    Compartment::new("native")
}

// ============================================================================
// Handles
// ============================================================================

#[test]
fn test_forged_handle_is_rejected_without_side_effects() {
    let (vm, _) = compartment();
    let h = vm.create(HEAP).unwrap();
    let used = vm.allocator().used();

    let forged = SObj::from_capability(Capability::from_address(0x1234));
    assert_eq!(
        vm.execute_statement(forged, "x = 1"),
        Err(BoundaryError::InvalidHandle(forged))
    );
    assert_eq!(vm.destroy(forged), Err(BoundaryError::InvalidHandle(forged)));
    assert_eq!(vm.restart(SObj::INVALID), Err(BoundaryError::InvalidHandle(SObj::INVALID)));
    assert_eq!(vm.allocator().used(), used);
    assert_eq!(vm.live_contexts(), 1);
    assert!(vm.execute_statement(h, "x = 1").is_ok());
}

#[test]
fn test_handle_from_another_compartment_does_not_unseal() {
    let (a, _) = compartment();
    let (b, _) = compartment();
    let ha = a.create(HEAP).unwrap();
    assert_eq!(b.execute_statement(ha, "1"), Err(BoundaryError::InvalidHandle(ha)));
    assert_eq!(b.free_exported_handle(ha, ha), Err(BoundaryError::InvalidHandle(ha)));
    assert!(a.execute_statement(ha, "1").is_ok());
}

#[test]
fn test_destroyed_handle_stays_dead() {
    let (vm, _) = compartment();
    let h = vm.create(HEAP).unwrap();
    assert!(vm.destroy(h).is_ok());
    assert_eq!(vm.destroy(h), Err(BoundaryError::InvalidHandle(h)));
    assert_eq!(vm.execute_statement(h, "1"), Err(BoundaryError::InvalidHandle(h)));
    assert_eq!(vm.allocator().used(), 0);
    assert_eq!(vm.allocator().live_allocations(), 0);
}

#[test]
fn test_status_words() {
    let (vm, _) = compartment();
    let h = vm.create(HEAP).unwrap();
    assert_eq!(status_of(&vm.execute_statement(h, "x = 1")), 0);
    assert_eq!(status_of(&vm.execute_statement(h, "1/0")), -1);
    assert_eq!(status_of(&vm.destroy(SObj::INVALID)), -1);
}

// ============================================================================
// Lifecycle
// ============================================================================

#[test]
fn test_create_over_quota_leaves_nothing_allocated() {
    let (vm, _) = compartment_with(VmConfig::new().with_quota(0x2000));
    assert!(matches!(vm.create(0x4000), Err(BoundaryError::AllocationFailure(_))));
    assert_eq!(vm.allocator().used(), 0);

    let (vm, _) = compartment_with(VmConfig::new().with_quota(0x2000 + 32));
    assert!(matches!(vm.create(0x2000), Err(BoundaryError::AllocationFailure(_))));
    assert_eq!(vm.allocator().used(), 0);
    assert_eq!(vm.allocator().live_allocations(), 0);
    assert_eq!(vm.live_contexts(), 0);
}

#[test]
fn test_heap_too_small_for_engine_is_rolled_back() {
    let (vm, _) = compartment();
    assert!(matches!(vm.create(64), Err(BoundaryError::AllocationFailure(_))));
    assert_eq!(vm.allocator().used(), 0);
}

#[test]
fn test_boot_script_runs_on_create() {
    let (vm, out) = compartment_with(VmConfig::new().with_boot_script("greeting = 'ready'\nprint(greeting)\n"));
    let h = vm.create(HEAP).unwrap();
    assert_eq!(out.take(), "ready\n");
    assert!(vm.execute_statement(h, "print(greeting)").is_ok());
    assert_eq!(out.take(), "ready\n");
}

#[test]
fn test_failing_boot_script_rolls_back() {
    let (vm, out) = compartment_with(VmConfig::new().with_boot_script("x = 1/0\n"));
    let err = vm.create(HEAP).unwrap_err();
    assert!(matches!(
        err,
        BoundaryError::UncaughtScriptException {
            kind: ExcKind::ZeroDivisionError,
            ..
        }
    ));
    assert!(out.take().contains("ZeroDivisionError"));
    assert_eq!(vm.allocator().used(), 0);
    assert_eq!(vm.allocator().live_allocations(), 0);
    assert_eq!(vm.live_contexts(), 0);
}

#[test]
fn test_restart_keeps_identity_and_forgets_globals() {
    let (vm, _) = compartment_with(VmConfig::new().with_boot_script("booted = 1\n"));
    let h = vm.create(HEAP).unwrap();
    let heap = vm.heap_capability(h).unwrap();
    assert!(vm.execute_statement(h, "x = 5").is_ok());
    let used = vm.allocator().used();

    assert!(vm.restart(h).is_ok());
    assert_eq!(vm.heap_capability(h), Ok(heap));
    assert_eq!(vm.allocator().used(), used);
    assert!(matches!(
        vm.execute_statement(h, "x"),
        Err(BoundaryError::UncaughtScriptException {
            kind: ExcKind::NameError,
            ..
        })
    ));
    assert!(matches!(
        vm.execute_statement(h, "booted"),
        Err(BoundaryError::UncaughtScriptException {
            kind: ExcKind::NameError,
            ..
        })
    ));
    assert!(vm.execute_statement(h, "x = 6").is_ok());
}

#[test]
fn test_restart_over_revoked_heap_fails() {
    let (vm, _) = compartment();
    let h = vm.create(HEAP).unwrap();
    let heap = vm.heap_capability(h).unwrap();
    vm.allocator().free(heap).unwrap();

    assert_eq!(vm.restart(h), Err(BoundaryError::HeapRevoked));
    assert_eq!(vm.execute_statement(h, "1"), Err(BoundaryError::InvalidHandle(h)));
    assert_eq!(vm.allocator().used(), 0);
}

#[test]
fn test_contexts_are_independent() {
    let (vm, _) = compartment();
    let a = vm.create(HEAP).unwrap();
    let b = vm.create(HEAP).unwrap();
    assert!(vm.execute_statement(a, "x = 'a'").is_ok());
    assert!(matches!(
        vm.execute_statement(b, "x"),
        Err(BoundaryError::UncaughtScriptException {
            kind: ExcKind::NameError,
            ..
        })
    ));
    assert!(vm.destroy(a).is_ok());
    assert!(vm.execute_statement(b, "y = 1").is_ok());
}

// ============================================================================
// Execution
// ============================================================================

#[test]
fn test_script_error_is_reported_and_context_survives() {
    let (vm, out) = compartment();
    let h = vm.create(HEAP).unwrap();
    assert_eq!(
        vm.execute_statement(h, "1/0"),
        Err(BoundaryError::UncaughtScriptException {
            kind: ExcKind::ZeroDivisionError,
            message: "divide by zero".into(),
        })
    );
    assert!(out.take().ends_with("ZeroDivisionError: divide by zero\n"));
    assert!(vm.execute_statement(h, "y = 2").is_ok());
    assert!(vm.execute_statement(h, "y").is_ok());
    assert_eq!(out.take(), "2\n");
}

#[test]
fn test_execute_file_does_not_echo() {
    let (vm, out) = compartment();
    let h = vm.create(HEAP).unwrap();
    assert!(vm.execute_file(h, "x = 40\nx + 2\nprint(x + 2)\n").is_ok());
    assert_eq!(out.take(), "42\n");
}

#[test]
fn test_frozen_modules() {
    let (vm, out) = compartment_with(VmConfig::new().with_frozen_module("hello.py", "print('hello')\n"));
    let h = vm.create(HEAP).unwrap();
    assert!(vm.execute_frozen(h, "hello.py").is_ok());
    assert_eq!(out.take(), "hello\n");
    assert!(matches!(
        vm.execute_frozen(h, "missing.py"),
        Err(BoundaryError::UncaughtScriptException {
            kind: ExcKind::OSError,
            ..
        })
    ));
    assert_eq!(out.take(), "could not find module 'missing.py'\n");
}

#[test]
fn test_collect_garbage_reports_statistics() {
    let (vm, _) = compartment();
    let h = vm.create(HEAP).unwrap();
    define(&vm, h, "def churn():\n    s = ''\n    i = 0\n    while i < 20:\n        s = s + 'x'\n        i = i + 1\n");
    assert!(vm.execute_named(h, "churn", "v", &[]).is_ok());
    let stats = vm.collect_garbage(h).unwrap();
    assert!(stats.freed_objects > 0);
}

// ============================================================================
// Marshalling
// ============================================================================

#[test]
fn test_every_tag_round_trips_through_a_script() {
    let (vm, _) = compartment();
    let h = vm.create(HEAP).unwrap();
    define(&vm, h, "def ident(x):\n    return x\n");

    let call = |sig: &str, value: NativeValue| vm.execute_named(h, "ident", sig, &[value]).unwrap();
    assert_eq!(call("ii", NativeValue::Int(42)), NativeValue::Int(42));
    assert_eq!(call("ii", NativeValue::Int(-42)), NativeValue::Int(-42));
    assert_eq!(call("II", NativeValue::Uint(u32::MAX)), NativeValue::Uint(u32::MAX));
    assert_eq!(call("ff", NativeValue::Float(3.5)), NativeValue::Float(3.5));
    assert_eq!(call("dd", NativeValue::Double(-1.25)), NativeValue::Double(-1.25));

    let buffer = vm.allocator().alloc(8).unwrap();
    let text = StrView::copy_into(buffer, "hi").unwrap();
    let back = call("ss", NativeValue::Str(Some(text)));
    assert_eq!(back.as_str(), Some("hi"));
    assert_eq!(call("ss", NativeValue::Str(None)), NativeValue::Str(None));

    let cap = vm
        .allocator()
        .alloc(32)
        .unwrap()
        .offset(8)
        .restrict(Permissions::LOAD | Permissions::LOAD_STORE_CAP);
    let back = call("PP", NativeValue::Ptr(cap));
    assert_eq!(back, NativeValue::Ptr(cap));
    let back = back.as_ptr().unwrap();
    assert_eq!((back.base(), back.length(), back.perms()), (cap.base(), cap.length(), cap.perms()));
    assert!(back.is_tagged());
}

#[test]
fn test_exported_objects_round_trip_and_stay_alive() {
    let (vm, _) = compartment();
    let h = vm.create(HEAP).unwrap();
    define(
        &vm,
        h,
        "def make():\n    return 'kept' + str(1)\ndef ident(x):\n    return x\ndef same(a, b):\n    return a is b\n",
    );
    let first = vm.execute_named(h, "make", "O", &[]).unwrap().as_object().unwrap();
    let second = vm
        .execute_named(h, "ident", "OO", &[NativeValue::Object(first)])
        .unwrap()
        .as_object()
        .unwrap();
    assert_ne!(first, second);
    let same = vm.execute_named(h, "same", "iOO", &[NativeValue::Object(first), NativeValue::Object(second)]);
    assert_eq!(same, Ok(NativeValue::Int(1)));

    vm.collect_garbage(h).unwrap();
    let shown = vm.execute_named(h, "ident", "sO", &[NativeValue::Object(second)]).unwrap();
    assert_eq!(shown.as_str(), Some("kept1"));
}

#[test]
fn test_freeing_an_export_twice_fails_the_second_time() {
    let (vm, _) = compartment();
    let h = vm.create(HEAP).unwrap();
    define(&vm, h, "def make(n):\n    return 'obj' + str(n)\ndef show(o):\n    return o\n");
    let tokens: Vec<SObj> = (1..=3)
        .map(|n| {
            vm.execute_named(h, "make", "Oi", &[NativeValue::Int(n)])
                .unwrap()
                .as_object()
                .unwrap()
        })
        .collect();

    assert!(vm.free_exported_handle(h, tokens[1]).is_ok());
    assert_eq!(
        vm.free_exported_handle(h, tokens[1]),
        Err(BoundaryError::InvalidHandle(tokens[1]))
    );
    assert_eq!(
        vm.execute_named(h, "show", "sO", &[NativeValue::Object(tokens[1])]),
        Err(BoundaryError::InvalidHandle(tokens[1]))
    );
    vm.collect_garbage(h).unwrap();
    for (token, text) in [(tokens[0], "obj1"), (tokens[2], "obj3")] {
        let shown = vm.execute_named(h, "show", "sO", &[NativeValue::Object(token)]).unwrap();
        assert_eq!(shown.as_str(), Some(text));
    }
}

#[test]
fn test_bad_signatures_fail_before_the_script_runs() {
    let (vm, _) = compartment();
    let h = vm.create(HEAP).unwrap();
    define(&vm, h, "n = 0\ndef bump(x):\n    global n\n    n = n + x\n    return n\ndef get():\n    return n\n");

    for (sig, args) in [
        ("iq", vec![NativeValue::Int(1)]),
        ("ii", vec![]),
        ("ii", vec![NativeValue::Uint(1)]),
        ("iO", vec![NativeValue::Object(SObj::INVALID)]),
        ("", vec![]),
    ] {
        assert!(
            matches!(vm.execute_named(h, "bump", sig, &args), Err(BoundaryError::BadSignature(_))),
            "{:?} accepted",
            sig
        );
    }
    assert_eq!(vm.execute_named(h, "get", "i", &[]), Ok(NativeValue::Int(0)));

    assert!(matches!(
        vm.execute_named(h, "bump", "si", &[NativeValue::Int(1)]),
        Err(BoundaryError::BadSignature(_))
    ));
    assert_eq!(vm.execute_named(h, "get", "i", &[]), Ok(NativeValue::Int(1)));
}

#[test]
fn test_unknown_function_is_a_name_error() {
    let (vm, _) = compartment();
    let h = vm.create(HEAP).unwrap();
    assert!(matches!(
        vm.execute_named(h, "nope", "v", &[]),
        Err(BoundaryError::UncaughtScriptException {
            kind: ExcKind::NameError,
            ..
        })
    ));
}

#[test]
fn test_integer_returned_as_pointer_is_untagged() {
    let (vm, _) = compartment();
    let h = vm.create(HEAP).unwrap();
    define(&vm, h, "def addr():\n    return 0x1234\ndef bump(p):\n    return p + 8\n");
    let cap = vm.execute_named(h, "addr", "P", &[]).unwrap().as_ptr().unwrap();
    assert_eq!(cap.address(), 0x1234);
    assert!(!cap.is_tagged());

    let buffer = vm.allocator().alloc(16).unwrap();
    let moved = vm
        .execute_named(h, "bump", "PP", &[NativeValue::Ptr(buffer)])
        .unwrap()
        .as_ptr()
        .unwrap();
    assert_eq!(moved.address(), buffer.address() + 8);
    assert!(moved.is_tagged());
}

// ============================================================================
// Faults
// ============================================================================

const PROBE: &str = "def probe(p):\n    return p.read32(64)\n\
def guarded(p):\n    try:\n        return p.read32(64)\n    except OSError as e:\n        return e.errno\n";

#[test]
fn test_fault_inside_try_becomes_os_error() {
    let (vm, out) = compartment();
    let h = vm.create(HEAP).unwrap();
    define(&vm, h, PROBE);
    let small = vm.allocator().alloc(16).unwrap();

    let errno = vm.execute_named(h, "guarded", "iP", &[NativeValue::Ptr(small)]);
    assert_eq!(errno, Ok(NativeValue::Int(0x1c00_0161)));
    assert_eq!(out.take(), "");
    assert!(vm.execute_statement(h, "print(hex(1))").is_ok());
    assert_eq!(out.take(), "0x1\n");
}

#[test]
fn test_uncaught_fault_is_a_hardware_fault() {
    let (vm, out) = compartment();
    let h = vm.create(HEAP).unwrap();
    define(&vm, h, PROBE);
    let small = vm.allocator().alloc(16).unwrap();

    assert_eq!(
        vm.execute_named(h, "probe", "iP", &[NativeValue::Ptr(small)]),
        Err(BoundaryError::HardwareFault {
            mcause: MCAUSE_CHERI,
            mtval: 0x161,
        })
    );
    assert!(out.take().contains("OSError: 469762401"));
    assert!(!vm.compartment().is_halted());
    define(&vm, h, "def ok():\n    return 7\n");
    assert_eq!(vm.execute_named(h, "ok", "i", &[]), Ok(NativeValue::Int(7)));
}

#[test]
fn test_script_raised_os_error_is_not_a_hardware_fault() {
    let (vm, _) = compartment();
    let h = vm.create(HEAP).unwrap();
    assert!(matches!(
        vm.execute_statement(h, "raise OSError(469762401)"),
        Err(BoundaryError::UncaughtScriptException {
            kind: ExcKind::OSError,
            ..
        })
    ));
}

#[test]
fn test_unwind_with_no_region_forces_unwind() {
    let (vm, out) = compartment();
    let h = vm.create(HEAP).unwrap();
    let escape = Callback::from_fn(vm.compartment(), "ii", |_| nlr::unwind(Capability::NULL)).unwrap();
    define(&vm, h, "def apply(f, x):\n    return f(x)\n");

    let result = vm.execute_named(
        h,
        "apply",
        "iCi",
        &[NativeValue::Callback(escape), NativeValue::Int(1)],
    );
    assert!(matches!(
        result,
        Err(BoundaryError::UncaughtScriptException {
            kind: ExcKind::RuntimeError,
            ..
        })
    ));
    assert!(out.take().starts_with("\x04\x04"));
    assert!(vm.execute_statement(h, "z = 1").is_ok());
}

// ============================================================================
// Callbacks
// ============================================================================

#[test]
fn test_callback_runs_in_its_home_compartment() {
    let (vm, _) = compartment();
    let h = vm.create(HEAP).unwrap();
    let home = native();
    let seen = home.clone();
    let double = Callback::from_fn(&home, "ii", move |args| {
        assert!(hart::current().is_some_and(|c| c.same_as(&seen)));
        NativeValue::Int(args[0].as_int().unwrap_or(0) * 2)
    })
    .unwrap();
    define(&vm, h, "def apply(f, x):\n    return f(x) + 1\n");

    let out = vm.execute_named(h, "apply", "iCi", &[NativeValue::Callback(double), NativeValue::Int(20)]);
    assert_eq!(out, Ok(NativeValue::Int(41)));
}

#[test]
fn test_callback_arity_and_type_errors_are_script_exceptions() {
    let (vm, _) = compartment();
    let h = vm.create(HEAP).unwrap();
    let cb = Callback::from_fn(&native(), "ii", |_| NativeValue::Int(0)).unwrap();
    define(
        &vm,
        h,
        "def two(f):\n    return f(1, 2)\ndef text(f):\n    try:\n        f('x')\n    except TypeError:\n        return 9\n",
    );
    assert!(matches!(
        vm.execute_named(h, "two", "iC", &[NativeValue::Callback(cb.clone())]),
        Err(BoundaryError::UncaughtScriptException {
            kind: ExcKind::TypeError,
            ..
        })
    ));
    assert_eq!(
        vm.execute_named(h, "text", "iC", &[NativeValue::Callback(cb)]),
        Ok(NativeValue::Int(9))
    );
}

#[test]
fn test_callback_rejected_arguments_export_nothing() {
    let (vm, _) = compartment();
    let h = vm.create(HEAP).unwrap();
    let calls = Rc::new(std::cell::Cell::new(0));
    let seen = Rc::clone(&calls);
    let keep = Callback::from_fn(&native(), "iOi", move |args| {
        seen.set(seen.get() + 1);
        NativeValue::Int(args[1].as_int().unwrap_or(-1))
    })
    .unwrap();
    define(
        &vm,
        h,
        "def misuse(f):\n    rejected = 0\n    i = 0\n    while i < 5:\n        i += 1\n        try:\n            f('obj', 'not an int')\n        except TypeError:\n            rejected += 1\n    return rejected\n",
    );
    let used = vm.allocator().used();

    assert_eq!(
        vm.execute_named(h, "misuse", "iC", &[NativeValue::Callback(keep.clone())]),
        Ok(NativeValue::Int(5))
    );
    assert_eq!(vm.allocator().used(), used);
    assert_eq!(calls.get(), 0);

    define(&vm, h, "def proper(f):\n    return f('obj', 3)\n");
    assert_eq!(
        vm.execute_named(h, "proper", "iC", &[NativeValue::Callback(keep)]),
        Ok(NativeValue::Int(3))
    );
    assert_eq!(calls.get(), 1);
}

#[test]
fn test_callback_result_contradicting_its_signature_is_a_type_error() {
    let (vm, _) = compartment();
    let h = vm.create(HEAP).unwrap();
    let silent = Callback::from_fn(&native(), "ii", |_| NativeValue::Void).unwrap();
    let wrong = Callback::from_fn(&native(), "di", |_| NativeValue::Int(1)).unwrap();
    let nothing = Callback::from_fn(&native(), "si", |_| NativeValue::Str(None)).unwrap();
    define(
        &vm,
        h,
        "def guard(f):\n    try:\n        f(1)\n    except TypeError:\n        return 7\n    return 0\ndef is_none(f):\n    return f(1) is None\n",
    );

    assert_eq!(
        vm.execute_named(h, "guard", "iC", &[NativeValue::Callback(silent)]),
        Ok(NativeValue::Int(7))
    );
    assert_eq!(
        vm.execute_named(h, "guard", "iC", &[NativeValue::Callback(wrong)]),
        Ok(NativeValue::Int(7))
    );
    assert_eq!(
        vm.execute_named(h, "is_none", "iC", &[NativeValue::Callback(nothing)]),
        Ok(NativeValue::Int(1))
    );
}

#[test]
fn test_fault_in_callback_home_becomes_runtime_error() {
    let (vm, _) = compartment();
    let h = vm.create(HEAP).unwrap();
    let crash = Callback::from_fn(&native(), "ii", |_| {
        hart::trap(MCAUSE_ILLEGAL_INSTRUCTION, 0);
        NativeValue::Int(0)
    })
    .unwrap();
    define(
        &vm,
        h,
        "def apply(f):\n    try:\n        return f(1)\n    except RuntimeError:\n        return -1\n",
    );
    assert_eq!(
        vm.execute_named(h, "apply", "iC", &[NativeValue::Callback(crash)]),
        Ok(NativeValue::Int(-1))
    );
}

#[test]
fn test_reentering_a_busy_context_is_refused() {
    init_logging();
    let vm = Rc::new(VmCompartment::new(VmConfig::new().with_output(OutputSink::Discard)));
    let h = vm.create(HEAP).unwrap();
    let other = vm.create(HEAP).unwrap();
    let inner = Rc::clone(&vm);
    let reenter = typed_callback(&native(), move |(which,): (i32,)| {
        let target = if which == 0 { h } else { other };
        match inner.execute_statement(target, "x = 1") {
            Ok(()) => 0,
            Err(BoundaryError::ContextBusy) => 1,
            Err(_) => 2,
        }
    })
    .unwrap();
    assert!(vm.execute_file(h, "def apply(f, x):\n    return f(x)\n").is_ok());

    let same = vm.execute_named(h, "apply", "iCi", &[NativeValue::Callback(reenter.clone()), NativeValue::Int(0)]);
    assert_eq!(same, Ok(NativeValue::Int(1)));
    let different = vm.execute_named(h, "apply", "iCi", &[NativeValue::Callback(reenter), NativeValue::Int(1)]);
    assert_eq!(different, Ok(NativeValue::Int(0)));
}

// ============================================================================
// Interactive loops
// ============================================================================

#[test]
fn test_raw_repl_through_the_boundary() {
    let (vm, _) = compartment();
    let h = vm.create(HEAP).unwrap();
    let mut console = ScriptedConsole::new("x = 6 * 7\nprint(x)\x04\x04");
    assert_eq!(vm.run_raw_repl(h, &mut console), Ok(ReplExit::SoftReset));
    assert_eq!(
        console.output(),
        "raw REPL; CTRL-B to exit\r\n>OK42\n\x04\x04>OK\r\n"
    );
}

#[test]
fn test_repl_reports_faults_as_os_errors() {
    let (vm, _) = compartment();
    let h = vm.create(HEAP).unwrap();
    define(&vm, h, PROBE);
    let small = vm.allocator().alloc(16).unwrap();
    define(&vm, h, "def keep(p):\n    global cap\n    cap = p\n");
    assert!(vm.execute_named(h, "keep", "vP", &[NativeValue::Ptr(small)]).is_ok());

    let mut console = ScriptedConsole::new("probe(cap)\r\x04");
    assert_eq!(vm.run_friendly_repl(h, &mut console), Ok(ReplExit::SoftReset));
    assert!(console.output().contains("OSError: 469762401\n>>> "));
}

#[test]
fn test_auto_repl_runs_boot_py_and_remembers_mode() {
    let (vm, _) = compartment_with(VmConfig::new().with_frozen_module("boot.py", "print('booting')\n"));
    let h = vm.create(HEAP).unwrap();

    let mut console = ScriptedConsole::new("\x01\x04");
    assert_eq!(vm.run_auto_repl(h, &mut console), Ok(ReplExit::SoftReset));
    let out = console.take_output();
    assert!(out.starts_with("booting\n"));
    assert!(out.ends_with(">>> \r\nraw REPL; CTRL-B to exit\r\n>OK\r\n"));

    let mut console = ScriptedConsole::new("\x04");
    assert_eq!(vm.run_auto_repl(h, &mut console), Ok(ReplExit::SoftReset));
    assert_eq!(console.output(), "booting\nraw REPL; CTRL-B to exit\r\n>OK\r\n");
}

// ============================================================================
// Typed contexts
// ============================================================================

#[test]
fn test_typed_context_calls_and_cleans_up() {
    let (vm, _) = compartment_with(VmConfig::new().with_heap_size(HEAP));
    {
        let ctx = Context::create_default(&vm).unwrap();
        ctx.execute_file("def add(a, b):\n    return a + b\ndef half(x):\n    return x / 2\ndef nothing():\n    pass\n")
            .unwrap();
        assert_eq!(ctx.call::<i32, _>("add", (2, 3)), Ok(5));
        assert_eq!(ctx.call::<f64, _>("half", (5.0f64,)), Ok(2.5));
        assert_eq!(ctx.call::<(), _>("nothing", ()), Ok(()));
        assert!(matches!(
            ctx.call::<StrView, _>("add", (2, 3)),
            Err(BoundaryError::BadSignature(_))
        ));
        assert_eq!(vm.live_contexts(), 1);
    }
    assert_eq!(vm.live_contexts(), 0);
    assert_eq!(vm.allocator().used(), 0);
}

#[test]
fn test_typed_callback_from_script() {
    let (vm, _) = compartment();
    let ctx = Context::create(&vm, HEAP).unwrap();
    let scale = typed_callback(&native(), |(x, k): (f64, i32)| x * f64::from(k)).unwrap();
    ctx.execute_file("def run(f):\n    return f(1.5, 4)\n").unwrap();
    assert_eq!(ctx.call::<f64, _>("run", (scale,)), Ok(6.0));

    let handle = ctx.into_handle();
    assert_eq!(vm.live_contexts(), 1);
    assert!(vm.destroy(handle).is_ok());
}
