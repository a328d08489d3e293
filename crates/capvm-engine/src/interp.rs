//! Tree-walking interpreter
//!
//! [`Vm`] owns one engine instance: its heap, globals and call frames.
//! Script exceptions travel as `Err(Exception)` through ordinary returns.
//! Hardware faults and [`Vm::throw`] arrive as non-local unwinds instead and
//! are caught at the nearest [`Vm::protected`] region, which every `try`
//! statement opens.

use std::rc::Rc;

use capvm_arch::{nlr, Capability, Permissions};
use rustc_hash::{FxHashMap, FxHashSet};

use crate::ast::{BinOp, CmpOp, Expr, FunctionDef, Handler, Stmt, StmtKind, UnaryOp};
use crate::builtins::{self, Builtin};
use crate::error::{Exception, ExecResult, InitError};
use crate::heap::{EmergencyBuffer, ExceptionObject, GcStats, Heap, HeapObject, HeapStats, TracebackEntry};
use crate::native::{NativeObject, RootSource};
use crate::output::OutputSink;
use crate::parser::{parse, Mode};
use crate::value::{ExcKind, ObjRef, Value};

/// Smallest heap an engine can start on.
pub const MIN_HEAP_SIZE: u32 = 256;

const MODULE_SCOPE: &str = "<module>";

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Deepest allowed script call nesting.
    pub max_depth: usize,
    /// Collect once this share of the heap has been allocated since the
    /// last collection.
    pub gc_threshold_percent: u8,
    pub output: OutputSink,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            max_depth: 64,
            gc_threshold_percent: 50,
            output: OutputSink::Stdout,
        }
    }
}

enum Flow {
    Normal,
    Return(Value),
    Break,
    Continue,
}

struct Frame {
    scope: Rc<str>,
    file: Rc<str>,
    locals: FxHashMap<Rc<str>, Value>,
    global_names: FxHashSet<Rc<str>>,
    line: u32,
}

#[derive(Clone, Copy)]
struct Checkpoint {
    frames: usize,
    temps: usize,
    handling: usize,
}

enum Num {
    Int(i64),
    Float(f64),
}

impl Num {
    fn as_f64(&self) -> f64 {
        match self {
            Num::Int(i) => *i as f64,
            Num::Float(x) => *x,
        }
    }
}

fn number(v: Value) -> Option<Num> {
    match v {
        Value::Bool(b) => Some(Num::Int(i64::from(b))),
        Value::Int(i) => Some(Num::Int(i)),
        Value::Float(x) => Some(Num::Float(x)),
        _ => None,
    }
}

pub struct Vm {
    heap: Heap,
    globals: FxHashMap<Rc<str>, Value>,
    frames: Vec<Frame>,
    module_file: Rc<str>,
    module_line: u32,
    echo: bool,
    /// Intermediate values that must survive a collection.
    temps: Vec<Value>,
    /// Exceptions whose `except` block is running.
    handling: Vec<Exception>,
    root_sources: Vec<Rc<dyn RootSource>>,
    emergency: Rc<EmergencyBuffer>,
    memory_error: ObjRef,
    allocated_since_gc: u32,
    config: EngineConfig,
}

impl Vm {
    /// Starts an engine whose heap lives entirely inside `heap`.
    pub fn new(heap: Capability, config: EngineConfig) -> Result<Vm, InitError> {
        let usable = heap.is_tagged()
            && !heap.is_sealed()
            && heap.perms().contains(Permissions::LOAD | Permissions::STORE);
        if !usable {
            return Err(InitError::InvalidHeap(heap));
        }
        if heap.length() < MIN_HEAP_SIZE {
            return Err(InitError::HeapTooSmall {
                size: heap.length(),
                minimum: MIN_HEAP_SIZE,
            });
        }

        let mut engine_heap = Heap::new(heap);
        let memory_error = engine_heap
            .alloc(HeapObject::Exception(ExceptionObject {
                kind: ExcKind::MemoryError,
                args: Vec::new(),
                traceback: Vec::new(),
            }))
            .ok_or(InitError::HeapTooSmall {
                size: heap.length(),
                minimum: MIN_HEAP_SIZE,
            })?;

        log::debug!(
            "engine heap at {} ({} bytes usable)",
            heap,
            engine_heap.capacity()
        );

        Ok(Vm {
            heap: engine_heap,
            globals: FxHashMap::default(),
            frames: Vec::new(),
            module_file: "<stdin>".into(),
            module_line: 0,
            echo: false,
            temps: Vec::new(),
            handling: Vec::new(),
            root_sources: Vec::new(),
            emergency: Rc::new(EmergencyBuffer::new(heap)),
            memory_error,
            allocated_since_gc: 0,
            config,
        })
    }

    // ------------------------------------------------------------------
    // Running source
    // ------------------------------------------------------------------

    /// Runs interactive input. Top-level expression statements print the
    /// repr of any non-`None` result.
    pub fn exec(&mut self, source: &str, mode: Mode) -> ExecResult<()> {
        self.run_source("<stdin>", source, mode, true)
    }

    /// Runs `source` as a named module without echoing expression results.
    pub fn exec_module(&mut self, name: &str, source: &str) -> ExecResult<()> {
        self.run_source(name, source, Mode::File, false)
    }

    fn run_source(&mut self, file: &str, source: &str, mode: Mode, echo: bool) -> ExecResult<()> {
        let file: Rc<str> = file.into();
        let stmts = match parse(source, mode) {
            Ok(stmts) => stmts,
            Err(err) => {
                let exc = self.new_error(ExcKind::SyntaxError, err.message);
                self.add_traceback(exc, file, err.line, "".into());
                return Err(exc);
            }
        };

        let saved_file = std::mem::replace(&mut self.module_file, file);
        let saved_line = self.module_line;
        let saved_echo = std::mem::replace(&mut self.echo, echo);
        let result = self.run_module(&stmts);
        self.module_file = saved_file;
        self.module_line = saved_line;
        self.echo = saved_echo;
        result
    }

    fn run_module(&mut self, stmts: &[Stmt]) -> ExecResult<()> {
        for stmt in stmts {
            self.module_line = stmt.line;
            let outcome = match self.exec_stmt(stmt) {
                Ok(Flow::Normal) => Ok(()),
                Ok(Flow::Return(_)) => Err(self.new_error(ExcKind::SyntaxError, "'return' outside function")),
                Ok(Flow::Break) | Ok(Flow::Continue) => {
                    Err(self.new_error(ExcKind::SyntaxError, "'break' outside loop"))
                }
                Err(exc) => Err(exc),
            };
            if let Err(exc) = outcome {
                let file = self.module_file.clone();
                self.add_traceback(exc, file, self.module_line, MODULE_SCOPE.into());
                return Err(exc);
            }
        }
        Ok(())
    }

    /// Calls the global function `name`.
    pub fn call_global(&mut self, name: &str, args: &[Value]) -> ExecResult<Value> {
        let callee = self.load(&Rc::from(name))?;
        self.call(callee, args)
    }

    pub fn call(&mut self, callee: Value, args: &[Value]) -> ExecResult<Value> {
        match callee {
            Value::Builtin(builtin) => builtins::call(self, builtin, args),
            Value::ExcType(kind) => {
                let exc = self.try_new_exception(kind, args.to_vec())?;
                Ok(Value::Obj(exc.0))
            }
            Value::Obj(r) => match self.heap.get(r) {
                Some(HeapObject::Function { def, file }) => {
                    let (def, file) = (def.clone(), file.clone());
                    self.call_function(def, file, args)
                }
                Some(HeapObject::Native(native)) => {
                    let native = native.clone();
                    native.call(self, args)
                }
                Some(_) | None => Err(self.not_callable(callee)),
            },
            _ => Err(self.not_callable(callee)),
        }
    }

    fn not_callable(&mut self, callee: Value) -> Exception {
        let message = format!("'{}' object isn't callable", self.type_name(callee));
        self.new_error(ExcKind::TypeError, message)
    }

    fn call_function(&mut self, def: Rc<FunctionDef>, file: Rc<str>, args: &[Value]) -> ExecResult<Value> {
        if args.len() != def.params.len() {
            let message = format!(
                "function takes {} positional arguments but {} were given",
                def.params.len(),
                args.len()
            );
            return Err(self.new_error(ExcKind::TypeError, message));
        }
        if self.frames.len() >= self.config.max_depth {
            return Err(self.new_error(ExcKind::RuntimeError, "maximum recursion depth exceeded"));
        }

        let locals = def.params.iter().cloned().zip(args.iter().copied()).collect();
        self.frames.push(Frame {
            scope: def.name.clone(),
            file,
            locals,
            global_names: FxHashSet::default(),
            line: def.line,
        });
        let result = self.exec_block(&def.body);
        let frame = self.frames.pop();
        match result {
            Ok(Flow::Return(value)) => Ok(value),
            Ok(_) => Ok(Value::None),
            Err(exc) => {
                if let Some(frame) = frame {
                    self.add_traceback(exc, frame.file, frame.line, frame.scope);
                }
                Err(exc)
            }
        }
    }

    // ------------------------------------------------------------------
    // Protected regions
    // ------------------------------------------------------------------

    /// Runs `body` so that a non-local unwind inside it comes back as an
    /// ordinary `Err`.
    pub fn protected<R>(&mut self, body: impl FnOnce(&mut Vm) -> ExecResult<R>) -> ExecResult<R> {
        let checkpoint = Checkpoint {
            frames: self.frames.len(),
            temps: self.temps.len(),
            handling: self.handling.len(),
        };
        match nlr::protect(|| body(self)) {
            Ok(result) => result,
            Err(value) => {
                let exc = self.resolve_unwind(value);
                self.rollback(checkpoint, exc);
                Err(exc)
            }
        }
    }

    fn rollback(&mut self, checkpoint: Checkpoint, exc: Exception) {
        let abandoned: Vec<TracebackEntry> = self.frames[checkpoint.frames.min(self.frames.len())..]
            .iter()
            .rev()
            .map(|f| TracebackEntry {
                file: f.file.clone(),
                line: f.line,
                scope: f.scope.clone(),
            })
            .collect();
        if let Some(HeapObject::Exception(obj)) = self.heap.get_mut(exc.0) {
            obj.traceback.extend(abandoned);
        }
        self.frames.truncate(checkpoint.frames);
        self.temps.truncate(checkpoint.temps);
        self.handling.truncate(checkpoint.handling);
    }

    /// Turns an unwind value into the exception it stands for.
    pub fn resolve_unwind(&mut self, value: Capability) -> Exception {
        if value.address() == self.emergency.capability().address() {
            if let Some((kind, arg)) = self.emergency.take() {
                return self.new_exception(kind, vec![Value::Int(arg)]);
            }
        }
        if let Some(r) = self.heap.ref_at(value.address()) {
            if matches!(self.heap.get(r), Some(HeapObject::Exception(_))) {
                return Exception(r);
            }
        }
        log::warn!("unwind carried {:?}, which is not an exception", value);
        self.new_error(ExcKind::RuntimeError, format!("unwind with non-exception value {}", value))
    }

    /// Raises `exc` non-locally, skipping every Rust frame up to the nearest
    /// protected region.
    pub fn throw(&self, exc: Exception) -> ! {
        nlr::unwind(self.heap.pointer(exc.0))
    }

    // ------------------------------------------------------------------
    // Statements
    // ------------------------------------------------------------------

    fn set_line(&mut self, line: u32) {
        match self.frames.last_mut() {
            Some(frame) => frame.line = line,
            None => self.module_line = line,
        }
    }

    fn exec_block(&mut self, stmts: &[Stmt]) -> ExecResult<Flow> {
        for stmt in stmts {
            self.set_line(stmt.line);
            match self.exec_stmt(stmt)? {
                Flow::Normal => {}
                flow => return Ok(flow),
            }
        }
        Ok(Flow::Normal)
    }

    fn exec_stmt(&mut self, stmt: &Stmt) -> ExecResult<Flow> {
        match &stmt.kind {
            StmtKind::Expr(expr) => {
                let value = self.eval(expr)?;
                if self.echo && self.frames.is_empty() && !value.is_none() {
                    let mut text = self.repr(value);
                    text.push('\n');
                    self.write(&text);
                }
                Ok(Flow::Normal)
            }
            StmtKind::Assign(targets, expr) => {
                let value = self.eval(expr)?;
                for target in targets {
                    self.assign(target, value);
                }
                Ok(Flow::Normal)
            }
            StmtKind::AugAssign(name, op, expr) => {
                let value = self.rooted(|vm| {
                    let current = vm.load(name)?;
                    vm.temps.push(current);
                    let rhs = vm.eval(expr)?;
                    vm.temps.push(rhs);
                    vm.binary_op(*op, current, rhs)
                })?;
                self.assign(name, value);
                Ok(Flow::Normal)
            }
            StmtKind::Def(def) => {
                let file = self.current_file();
                let function = self.alloc(HeapObject::Function {
                    def: def.clone(),
                    file,
                })?;
                self.assign(&def.name, Value::Obj(function));
                Ok(Flow::Normal)
            }
            StmtKind::Return(expr) => {
                let value = match expr {
                    Some(expr) => self.eval(expr)?,
                    None => Value::None,
                };
                Ok(Flow::Return(value))
            }
            StmtKind::If(branches, orelse) => {
                for (cond, body) in branches {
                    let test = self.eval(cond)?;
                    if self.truthy(test) {
                        return self.exec_block(body);
                    }
                }
                match orelse {
                    Some(body) => self.exec_block(body),
                    None => Ok(Flow::Normal),
                }
            }
            StmtKind::While(cond, body) => {
                loop {
                    let test = self.eval(cond)?;
                    if !self.truthy(test) {
                        break;
                    }
                    match self.exec_block(body)? {
                        Flow::Break => break,
                        Flow::Return(value) => return Ok(Flow::Return(value)),
                        Flow::Normal | Flow::Continue => {}
                    }
                }
                Ok(Flow::Normal)
            }
            StmtKind::Break => Ok(Flow::Break),
            StmtKind::Continue => Ok(Flow::Continue),
            StmtKind::Pass => Ok(Flow::Normal),
            StmtKind::Try {
                body,
                handlers,
                orelse,
                finally,
            } => self.exec_try(body, handlers, orelse.as_deref(), finally.as_deref()),
            StmtKind::Raise(expr) => Err(self.exec_raise(expr.as_ref())),
            StmtKind::Global(names) => {
                if let Some(frame) = self.frames.last_mut() {
                    for name in names {
                        frame.global_names.insert(name.clone());
                    }
                }
                Ok(Flow::Normal)
            }
        }
    }

    fn exec_try(
        &mut self,
        body: &[Stmt],
        handlers: &[Handler],
        orelse: Option<&[Stmt]>,
        finally: Option<&[Stmt]>,
    ) -> ExecResult<Flow> {
        let outcome = match self.protected(|vm| vm.exec_block(body)) {
            Ok(Flow::Normal) => match orelse {
                Some(orelse) => self.exec_block(orelse),
                None => Ok(Flow::Normal),
            },
            Ok(flow) => Ok(flow),
            Err(exc) if !handlers.is_empty() => self.handle_exception(exc, handlers),
            Err(exc) => Err(exc),
        };

        let Some(finally) = finally else {
            return outcome;
        };
        let mark = self.temps.len();
        match &outcome {
            Err(exc) => self.temps.push(Value::Obj(exc.0)),
            Ok(Flow::Return(value)) => self.temps.push(*value),
            Ok(_) => {}
        }
        let cleanup = self.exec_block(finally);
        self.temps.truncate(mark);
        match cleanup {
            Ok(Flow::Normal) => outcome,
            other => other,
        }
    }

    fn handle_exception(&mut self, exc: Exception, handlers: &[Handler]) -> ExecResult<Flow> {
        let kind = self.exception_kind(exc).unwrap_or(ExcKind::BaseException);
        let mark = self.temps.len();
        self.temps.push(Value::Obj(exc.0));
        for handler in handlers {
            let matched = match &handler.kind {
                None => true,
                Some(expr) => match self.eval(expr) {
                    Ok(filter) => self.exception_matches(kind, filter),
                    Err(err) => {
                        self.temps.truncate(mark);
                        return Err(err);
                    }
                },
            };
            if !matched {
                continue;
            }
            self.temps.truncate(mark);
            if let Some(name) = &handler.binding {
                self.assign(name, Value::Obj(exc.0));
            }
            self.handling.push(exc);
            let result = self.exec_block(&handler.body);
            self.handling.pop();
            return result;
        }
        self.temps.truncate(mark);
        Err(exc)
    }

    fn exception_matches(&self, kind: ExcKind, filter: Value) -> bool {
        match filter {
            Value::ExcType(k) => kind.is_a(k),
            Value::Obj(r) => match self.heap.get(r) {
                Some(HeapObject::Tuple(items)) => items.iter().any(|item| self.exception_matches(kind, *item)),
                _ => false,
            },
            _ => false,
        }
    }

    fn exec_raise(&mut self, expr: Option<&Expr>) -> Exception {
        let Some(expr) = expr else {
            return match self.handling.last() {
                Some(exc) => *exc,
                None => self.new_error(ExcKind::RuntimeError, "no active exception to reraise"),
            };
        };
        let value = match self.eval(expr) {
            Ok(value) => value,
            Err(exc) => return exc,
        };
        match value {
            Value::ExcType(kind) => self.new_exception(kind, Vec::new()),
            other => match self.as_exception(other) {
                Some(exc) => exc,
                None => self.new_error(ExcKind::TypeError, "exceptions must derive from BaseException"),
            },
        }
    }

    // ------------------------------------------------------------------
    // Expressions
    // ------------------------------------------------------------------

    /// Runs `body` and drops whatever it pushed onto the temporary roots.
    fn rooted<R>(&mut self, body: impl FnOnce(&mut Vm) -> ExecResult<R>) -> ExecResult<R> {
        let mark = self.temps.len();
        let result = body(self);
        self.temps.truncate(mark);
        result
    }

    fn eval(&mut self, expr: &Expr) -> ExecResult<Value> {
        match expr {
            Expr::None => Ok(Value::None),
            Expr::Bool(b) => Ok(Value::Bool(*b)),
            Expr::Int(i) => Ok(Value::Int(*i)),
            Expr::Float(x) => Ok(Value::Float(*x)),
            Expr::Str(s) => self.alloc(HeapObject::Str(s.clone())).map(Value::Obj),
            Expr::Bytes(b) => self.alloc(HeapObject::Bytes(b.clone())).map(Value::Obj),
            Expr::Name(name) => self.load(name),
            Expr::Tuple(items) => self.rooted(|vm| {
                let start = vm.temps.len();
                for item in items {
                    let value = vm.eval(item)?;
                    vm.temps.push(value);
                }
                let values: Rc<[Value]> = vm.temps[start..].into();
                vm.alloc(HeapObject::Tuple(values)).map(Value::Obj)
            }),
            Expr::Unary(op, operand) => {
                let value = self.eval(operand)?;
                self.unary_op(*op, value)
            }
            Expr::Binary(op, lhs, rhs) => self.rooted(|vm| {
                let a = vm.eval(lhs)?;
                vm.temps.push(a);
                let b = vm.eval(rhs)?;
                vm.temps.push(b);
                vm.binary_op(*op, a, b)
            }),
            Expr::Compare(first, chain) => self.rooted(|vm| {
                let mut left = vm.eval(first)?;
                vm.temps.push(left);
                for (op, expr) in chain {
                    let right = vm.eval(expr)?;
                    vm.temps.push(right);
                    if !vm.compare(*op, left, right)? {
                        return Ok(Value::Bool(false));
                    }
                    left = right;
                }
                Ok(Value::Bool(true))
            }),
            Expr::And(lhs, rhs) => {
                let left = self.eval(lhs)?;
                if self.truthy(left) {
                    self.eval(rhs)
                } else {
                    Ok(left)
                }
            }
            Expr::Or(lhs, rhs) => {
                let left = self.eval(lhs)?;
                if self.truthy(left) {
                    Ok(left)
                } else {
                    self.eval(rhs)
                }
            }
            Expr::Call(callee, args) => self.rooted(|vm| {
                let callee = vm.eval(callee)?;
                vm.temps.push(callee);
                let argv = vm.eval_args(args)?;
                vm.call(callee, &argv)
            }),
            Expr::Method(receiver, name, args) => self.rooted(|vm| {
                let receiver = vm.eval(receiver)?;
                vm.temps.push(receiver);
                let argv = vm.eval_args(args)?;
                vm.call_method(receiver, name, &argv)
            }),
            Expr::Attribute(object, name) => {
                let object = self.eval(object)?;
                self.rooted(|vm| {
                    vm.temps.push(object);
                    vm.get_attr(object, name)
                })
            }
            Expr::Subscript(object, index) => self.rooted(|vm| {
                let object = vm.eval(object)?;
                vm.temps.push(object);
                let index = vm.eval(index)?;
                vm.subscript(object, index)
            }),
        }
    }

    /// Runs `body` with a temporary-root scope: values passed to
    /// [`keep`](Self::keep) inside it survive collections until it returns.
    pub fn scoped<R>(&mut self, body: impl FnOnce(&mut Vm) -> ExecResult<R>) -> ExecResult<R> {
        self.rooted(body)
    }

    pub fn keep(&mut self, value: Value) {
        self.temps.push(value);
    }

    /// Forgets interpreter stacks left behind by an unwind that never
    /// reached a protected region of this engine.
    pub fn reset_stacks(&mut self) {
        if !self.frames.is_empty() || !self.temps.is_empty() || !self.handling.is_empty() {
            log::debug!(
                "dropping {} abandoned frames and {} temporaries",
                self.frames.len(),
                self.temps.len()
            );
        }
        self.frames.clear();
        self.temps.clear();
        self.handling.clear();
    }

    /// Evaluates call arguments, leaving them rooted on the temporaries.
    fn eval_args(&mut self, args: &[Expr]) -> ExecResult<Vec<Value>> {
        let start = self.temps.len();
        for arg in args {
            let value = self.eval(arg)?;
            self.temps.push(value);
        }
        Ok(self.temps[start..].to_vec())
    }

    fn current_file(&self) -> Rc<str> {
        match self.frames.last() {
            Some(frame) => frame.file.clone(),
            None => self.module_file.clone(),
        }
    }

    fn load(&mut self, name: &Rc<str>) -> ExecResult<Value> {
        if let Some(frame) = self.frames.last() {
            if !frame.global_names.contains(name) {
                if let Some(value) = frame.locals.get(name) {
                    return Ok(*value);
                }
            }
        }
        if let Some(value) = self.globals.get(name) {
            return Ok(*value);
        }
        if let Some(builtin) = Builtin::from_name(name) {
            return Ok(Value::Builtin(builtin));
        }
        if let Some(kind) = ExcKind::from_name(name) {
            return Ok(Value::ExcType(kind));
        }
        Err(self.new_error(ExcKind::NameError, format!("name '{}' isn't defined", name)))
    }

    fn assign(&mut self, name: &Rc<str>, value: Value) {
        match self.frames.last_mut() {
            Some(frame) if !frame.global_names.contains(name) => {
                frame.locals.insert(name.clone(), value);
            }
            _ => {
                self.globals.insert(name.clone(), value);
            }
        }
    }

    pub fn global(&self, name: &str) -> Option<Value> {
        self.globals.get(name).copied()
    }

    pub fn set_global(&mut self, name: &str, value: Value) {
        self.globals.insert(name.into(), value);
    }

    // ------------------------------------------------------------------
    // Operators
    // ------------------------------------------------------------------

    fn unsupported(&mut self, op: &str, a: Value, b: Value) -> Exception {
        let message = format!(
            "unsupported types for {}: '{}', '{}'",
            op,
            self.type_name(a),
            self.type_name(b)
        );
        self.new_error(ExcKind::TypeError, message)
    }

    fn overflow(&mut self) -> Exception {
        self.new_error(ExcKind::OverflowError, "small int overflow")
    }

    fn zero_division(&mut self) -> Exception {
        self.new_error(ExcKind::ZeroDivisionError, "divide by zero")
    }

    pub fn unary_op(&mut self, op: UnaryOp, value: Value) -> ExecResult<Value> {
        if op == UnaryOp::Not {
            return Ok(Value::Bool(!self.truthy(value)));
        }
        if let Some(native) = self.native(value) {
            if let Some(result) = native.unary_op(op) {
                return Ok(result);
            }
        } else {
            match (op, number(value)) {
                (UnaryOp::Neg, Some(Num::Int(i))) => return i.checked_neg().map(Value::Int).ok_or_else(|| self.overflow()),
                (UnaryOp::Neg, Some(Num::Float(x))) => return Ok(Value::Float(-x)),
                (UnaryOp::Pos, Some(Num::Int(i))) => return Ok(Value::Int(i)),
                (UnaryOp::Pos, Some(Num::Float(x))) => return Ok(Value::Float(x)),
                (UnaryOp::Invert, Some(Num::Int(i))) => return Ok(Value::Int(!i)),
                _ => {}
            }
        }
        let symbol = match op {
            UnaryOp::Neg => "-",
            UnaryOp::Pos => "+",
            UnaryOp::Invert => "~",
            UnaryOp::Not => "not",
        };
        let message = format!("unsupported type for {}: '{}'", symbol, self.type_name(value));
        Err(self.new_error(ExcKind::TypeError, message))
    }

    pub fn binary_op(&mut self, op: BinOp, a: Value, b: Value) -> ExecResult<Value> {
        if let Some(native) = self.native(a) {
            return match native.binary_op(self, op, b) {
                Some(result) => result,
                None => Err(self.unsupported(op.symbol(), a, b)),
            };
        }
        match (number(a), number(b)) {
            (Some(Num::Int(x)), Some(Num::Int(y))) => self.int_op(op, x, y),
            (Some(x), Some(y)) => self.float_op(op, x.as_f64(), y.as_f64(), a, b),
            _ => self.sequence_op(op, a, b),
        }
    }

    fn int_op(&mut self, op: BinOp, x: i64, y: i64) -> ExecResult<Value> {
        let result = match op {
            BinOp::Add => x.checked_add(y),
            BinOp::Sub => x.checked_sub(y),
            BinOp::Mul => x.checked_mul(y),
            BinOp::Div => {
                if y == 0 {
                    return Err(self.zero_division());
                }
                return Ok(Value::Float(x as f64 / y as f64));
            }
            BinOp::FloorDiv => {
                if y == 0 {
                    return Err(self.zero_division());
                }
                floor_div(x, y)
            }
            BinOp::Mod => {
                if y == 0 {
                    return Err(self.zero_division());
                }
                floor_div(x, y).and_then(|q| q.checked_mul(y)).and_then(|p| x.checked_sub(p))
            }
            BinOp::Pow => {
                if y < 0 {
                    return Ok(Value::Float((x as f64).powf(y as f64)));
                }
                u32::try_from(y).ok().and_then(|e| x.checked_pow(e))
            }
            BinOp::Shl => {
                if y < 0 {
                    return Err(self.new_error(ExcKind::ValueError, "negative shift count"));
                }
                if x == 0 {
                    Some(0)
                } else if y >= 63 {
                    None
                } else {
                    let shifted = x << y;
                    (shifted >> y == x).then_some(shifted)
                }
            }
            BinOp::Shr => {
                if y < 0 {
                    return Err(self.new_error(ExcKind::ValueError, "negative shift count"));
                }
                Some(if y >= 64 { if x < 0 { -1 } else { 0 } } else { x >> y })
            }
            BinOp::BitAnd => Some(x & y),
            BinOp::BitOr => Some(x | y),
            BinOp::BitXor => Some(x ^ y),
        };
        result.map(Value::Int).ok_or_else(|| self.overflow())
    }

    fn float_op(&mut self, op: BinOp, x: f64, y: f64, a: Value, b: Value) -> ExecResult<Value> {
        let result = match op {
            BinOp::Add => x + y,
            BinOp::Sub => x - y,
            BinOp::Mul => x * y,
            BinOp::Div | BinOp::FloorDiv | BinOp::Mod if y == 0.0 => return Err(self.zero_division()),
            BinOp::Div => x / y,
            BinOp::FloorDiv => (x / y).floor(),
            BinOp::Mod => {
                let r = x % y;
                if r != 0.0 && (r < 0.0) != (y < 0.0) {
                    r + y
                } else {
                    r
                }
            }
            BinOp::Pow => x.powf(y),
            _ => return Err(self.unsupported(op.symbol(), a, b)),
        };
        Ok(Value::Float(result))
    }

    fn sequence_op(&mut self, op: BinOp, a: Value, b: Value) -> ExecResult<Value> {
        let left = a.as_obj().and_then(|r| self.heap.get(r));
        let right = b.as_obj().and_then(|r| self.heap.get(r));
        match (op, left, right) {
            (BinOp::Add, Some(HeapObject::Str(x)), Some(HeapObject::Str(y))) => {
                let joined = format!("{}{}", x, y);
                self.new_str(&joined)
            }
            (BinOp::Add, Some(HeapObject::Bytes(x)), Some(HeapObject::Bytes(y))) => {
                let joined = [&x[..], &y[..]].concat();
                self.new_bytes(&joined)
            }
            (BinOp::Add, Some(HeapObject::Tuple(x)), Some(HeapObject::Tuple(y))) => {
                let joined = [&x[..], &y[..]].concat();
                self.new_tuple(&joined)
            }
            (BinOp::Mul, Some(HeapObject::Str(_) | HeapObject::Bytes(_) | HeapObject::Tuple(_)), None) => {
                self.repeat(a, b)
            }
            (BinOp::Mul, None, Some(HeapObject::Str(_) | HeapObject::Bytes(_) | HeapObject::Tuple(_))) => {
                self.repeat(b, a)
            }
            _ => Err(self.unsupported(op.symbol(), a, b)),
        }
    }

    fn repeat(&mut self, sequence: Value, count: Value) -> ExecResult<Value> {
        let Some(Num::Int(n)) = number(count) else {
            return Err(self.unsupported("*", sequence, count));
        };
        let n = usize::try_from(n).unwrap_or(0);
        let object = sequence.as_obj().and_then(|r| self.heap.get(r));
        let unit = match object {
            Some(HeapObject::Str(s)) => s.len(),
            Some(HeapObject::Bytes(b)) => b.len(),
            Some(HeapObject::Tuple(t)) => t.len() * 8,
            _ => 0,
        };
        if unit.checked_mul(n).is_none_or(|total| total > self.heap.capacity() as usize) {
            return Err(self.out_of_memory());
        }
        match object {
            Some(HeapObject::Str(s)) => {
                let text = s.repeat(n);
                self.new_str(&text)
            }
            Some(HeapObject::Bytes(b)) => {
                let bytes = b.repeat(n);
                self.new_bytes(&bytes)
            }
            Some(HeapObject::Tuple(t)) => {
                let items = t.repeat(n);
                self.new_tuple(&items)
            }
            _ => Err(self.unsupported("*", sequence, count)),
        }
    }

    /// Evaluates one comparison link.
    pub fn compare(&mut self, op: CmpOp, a: Value, b: Value) -> ExecResult<bool> {
        match op {
            CmpOp::Is => return Ok(a == b),
            CmpOp::IsNot => return Ok(a != b),
            CmpOp::Eq => return Ok(self.values_equal(a, b)),
            CmpOp::NotEq => return Ok(!self.values_equal(a, b)),
            _ => {}
        }
        if let Some(native) = self.native(a) {
            return match native.compare(self, op, b) {
                Some(result) => Ok(result),
                None => Err(self.unsupported(cmp_symbol(op), a, b)),
            };
        }
        let ordering = match (number(a), number(b)) {
            (Some(Num::Int(x)), Some(Num::Int(y))) => Some(x.cmp(&y)),
            (Some(x), Some(y)) => x.as_f64().partial_cmp(&y.as_f64()),
            _ => {
                let left = a.as_obj().and_then(|r| self.heap.get(r));
                let right = b.as_obj().and_then(|r| self.heap.get(r));
                match (left, right) {
                    (Some(HeapObject::Str(x)), Some(HeapObject::Str(y))) => Some(x.cmp(y)),
                    (Some(HeapObject::Bytes(x)), Some(HeapObject::Bytes(y))) => Some(x.cmp(y)),
                    _ => return Err(self.unsupported(cmp_symbol(op), a, b)),
                }
            }
        };
        let Some(ordering) = ordering else {
            return Ok(false);
        };
        Ok(match op {
            CmpOp::Lt => ordering.is_lt(),
            CmpOp::Gt => ordering.is_gt(),
            CmpOp::Le => ordering.is_le(),
            CmpOp::Ge => ordering.is_ge(),
            _ => unreachable!("equality handled above"),
        })
    }

    pub fn values_equal(&self, a: Value, b: Value) -> bool {
        if let Some(native) = self.native(a) {
            return native.compare(self, CmpOp::Eq, b).unwrap_or(a == b);
        }
        if let Some(native) = self.native(b) {
            return native.compare(self, CmpOp::Eq, a).unwrap_or(a == b);
        }
        match (number(a), number(b)) {
            (Some(Num::Int(x)), Some(Num::Int(y))) => return x == y,
            (Some(x), Some(y)) => return x.as_f64() == y.as_f64(),
            _ => {}
        }
        let left = a.as_obj().and_then(|r| self.heap.get(r));
        let right = b.as_obj().and_then(|r| self.heap.get(r));
        match (left, right) {
            (Some(HeapObject::Str(x)), Some(HeapObject::Str(y))) => x == y,
            (Some(HeapObject::Bytes(x)), Some(HeapObject::Bytes(y))) => x == y,
            (Some(HeapObject::Tuple(x)), Some(HeapObject::Tuple(y))) => {
                x.len() == y.len() && x.iter().zip(y.iter()).all(|(p, q)| self.values_equal(*p, *q))
            }
            _ => a == b,
        }
    }

    pub fn truthy(&self, value: Value) -> bool {
        match value {
            Value::None => false,
            Value::Bool(b) => b,
            Value::Int(i) => i != 0,
            Value::Float(x) => x != 0.0,
            Value::Builtin(_) | Value::ExcType(_) => true,
            Value::Obj(r) => match self.heap.get(r) {
                Some(HeapObject::Str(s)) => !s.is_empty(),
                Some(HeapObject::Bytes(b)) => !b.is_empty(),
                Some(HeapObject::Tuple(t)) => !t.is_empty(),
                Some(HeapObject::Native(n)) => n.truthy(),
                _ => true,
            },
        }
    }

    fn get_attr(&mut self, object: Value, name: &str) -> ExecResult<Value> {
        if let Some(exc) = self.as_exception(object) {
            let args = self.exception_args(exc);
            match name {
                "args" => return self.new_tuple(&args),
                "errno" if self.exception_kind(exc) == Some(ExcKind::OSError) => {
                    return Ok(args.first().copied().unwrap_or(Value::None));
                }
                _ => {}
            }
        }
        let message = format!("'{}' object has no attribute '{}'", self.type_name(object), name);
        Err(self.new_error(ExcKind::AttributeError, message))
    }

    fn call_method(&mut self, receiver: Value, name: &str, args: &[Value]) -> ExecResult<Value> {
        if let Some(native) = self.native(receiver) {
            return native.call_method(self, name, args);
        }
        match (name, args) {
            ("encode", []) => {
                if let Some(text) = self.str_value(receiver) {
                    return self.new_bytes(text.as_bytes());
                }
            }
            ("decode", []) => {
                if let Some(bytes) = self.bytes_value(receiver) {
                    let text = String::from_utf8_lossy(&bytes).into_owned();
                    return self.new_str(&text);
                }
            }
            _ => {}
        }
        let message = format!("'{}' object has no attribute '{}'", self.type_name(receiver), name);
        Err(self.new_error(ExcKind::AttributeError, message))
    }

    fn subscript(&mut self, object: Value, index: Value) -> ExecResult<Value> {
        let Some(Num::Int(i)) = number(index) else {
            let message = format!("indices must be integers, not {}", self.type_name(index));
            return Err(self.new_error(ExcKind::TypeError, message));
        };
        let resolve = |len: usize| -> Option<usize> {
            let i = if i < 0 { i.checked_add(len as i64)? } else { i };
            usize::try_from(i).ok().filter(|i| *i < len)
        };
        let found = match object.as_obj().and_then(|r| self.heap.get(r)) {
            Some(HeapObject::Tuple(items)) => Some(("tuple", resolve(items.len()).map(|i| Ok(items[i])))),
            Some(HeapObject::Bytes(bytes)) => {
                Some(("bytes", resolve(bytes.len()).map(|i| Ok(Value::Int(i64::from(bytes[i]))))))
            }
            Some(HeapObject::Str(s)) => {
                let chars: Vec<char> = s.chars().collect();
                Some(("string", resolve(chars.len()).map(|i| Err(chars[i].to_string()))))
            }
            _ => None,
        };
        match found {
            Some((_, Some(Ok(value)))) => Ok(value),
            Some((_, Some(Err(ch)))) => self.new_str(&ch),
            Some((kind, None)) => Err(self.new_error(ExcKind::IndexError, format!("{} index out of range", kind))),
            None => {
                let message = format!("'{}' object isn't subscriptable", self.type_name(object));
                Err(self.new_error(ExcKind::TypeError, message))
            }
        }
    }

    pub fn len(&mut self, value: Value) -> ExecResult<usize> {
        match value.as_obj().and_then(|r| self.heap.get(r)) {
            Some(HeapObject::Str(s)) => Ok(s.chars().count()),
            Some(HeapObject::Bytes(b)) => Ok(b.len()),
            Some(HeapObject::Tuple(t)) => Ok(t.len()),
            _ => {
                let message = format!("object of type '{}' has no len()", self.type_name(value));
                Err(self.new_error(ExcKind::TypeError, message))
            }
        }
    }

    // ------------------------------------------------------------------
    // Objects
    // ------------------------------------------------------------------

    fn alloc(&mut self, object: HeapObject) -> ExecResult<ObjRef> {
        let size = object.size();
        let threshold = (u64::from(self.heap.capacity()) * u64::from(self.config.gc_threshold_percent) / 100) as u32;
        if !self.heap.fits(size) || self.allocated_since_gc.saturating_add(size) > threshold {
            let mark = self.temps.len();
            object.children(&mut self.temps);
            self.collect();
            self.temps.truncate(mark);
        }
        match self.heap.alloc(object) {
            Some(r) => {
                self.allocated_since_gc = self.allocated_since_gc.saturating_add(size);
                Ok(r)
            }
            None => Err(self.out_of_memory()),
        }
    }

    fn out_of_memory(&mut self) -> Exception {
        log::debug!("engine heap exhausted ({} of {} bytes)", self.heap.used(), self.heap.capacity());
        if let Some(HeapObject::Exception(obj)) = self.heap.get_mut(self.memory_error) {
            obj.traceback.clear();
        }
        Exception(self.memory_error)
    }

    pub fn new_str(&mut self, text: &str) -> ExecResult<Value> {
        self.alloc(HeapObject::Str(text.into())).map(Value::Obj)
    }

    pub fn new_bytes(&mut self, bytes: &[u8]) -> ExecResult<Value> {
        self.alloc(HeapObject::Bytes(bytes.into())).map(Value::Obj)
    }

    pub fn new_tuple(&mut self, items: &[Value]) -> ExecResult<Value> {
        self.alloc(HeapObject::Tuple(items.into())).map(Value::Obj)
    }

    pub fn alloc_native(&mut self, object: Rc<dyn NativeObject>) -> ExecResult<Value> {
        self.alloc(HeapObject::Native(object)).map(Value::Obj)
    }

    fn try_new_exception(&mut self, kind: ExcKind, args: Vec<Value>) -> ExecResult<Exception> {
        self.alloc(HeapObject::Exception(ExceptionObject {
            kind,
            args,
            traceback: Vec::new(),
        }))
        .map(Exception)
    }

    /// A fresh `kind(*args)`, or the preallocated `MemoryError` if the heap
    /// is full.
    pub fn new_exception(&mut self, kind: ExcKind, args: Vec<Value>) -> Exception {
        self.try_new_exception(kind, args).unwrap_or_else(|oom| oom)
    }

    /// A fresh `kind(message)`.
    pub fn new_error(&mut self, kind: ExcKind, message: impl Into<String>) -> Exception {
        let message: String = message.into();
        let text = match self.new_str(&message) {
            Ok(text) => text,
            Err(oom) => return oom,
        };
        self.rooted(|vm| {
            vm.temps.push(text);
            Ok(vm.new_exception(kind, vec![text]))
        })
        .unwrap_or_else(|exc| exc)
    }

    fn add_traceback(&mut self, exc: Exception, file: Rc<str>, line: u32, scope: Rc<str>) {
        if let Some(HeapObject::Exception(obj)) = self.heap.get_mut(exc.0) {
            obj.traceback.push(TracebackEntry { file, line, scope });
        }
    }

    pub(crate) fn heap_object(&self, r: ObjRef) -> Option<&HeapObject> {
        self.heap.get(r)
    }

    pub fn address_of(&self, r: ObjRef) -> u32 {
        self.heap.address_of(r)
    }

    /// A capability to `r`, derived from the heap capability.
    pub fn pointer(&self, r: ObjRef) -> Capability {
        self.heap.pointer(r)
    }

    pub fn str_value(&self, value: Value) -> Option<Rc<str>> {
        match value.as_obj().and_then(|r| self.heap.get(r)) {
            Some(HeapObject::Str(s)) => Some(s.clone()),
            _ => None,
        }
    }

    pub fn bytes_value(&self, value: Value) -> Option<Rc<[u8]>> {
        match value.as_obj().and_then(|r| self.heap.get(r)) {
            Some(HeapObject::Bytes(b)) => Some(b.clone()),
            _ => None,
        }
    }

    pub fn tuple_items(&self, value: Value) -> Option<Rc<[Value]>> {
        match value.as_obj().and_then(|r| self.heap.get(r)) {
            Some(HeapObject::Tuple(t)) => Some(t.clone()),
            _ => None,
        }
    }

    pub fn native(&self, value: Value) -> Option<Rc<dyn NativeObject>> {
        match value.as_obj().and_then(|r| self.heap.get(r)) {
            Some(HeapObject::Native(n)) => Some(n.clone()),
            _ => None,
        }
    }

    pub fn is_callable(&self, value: Value) -> bool {
        match value {
            Value::Builtin(_) | Value::ExcType(_) => true,
            Value::Obj(r) => matches!(
                self.heap.get(r),
                Some(HeapObject::Function { .. } | HeapObject::Native(_))
            ),
            _ => false,
        }
    }

    pub fn as_exception(&self, value: Value) -> Option<Exception> {
        match value.as_obj().and_then(|r| self.heap.get(r).map(|o| (r, o))) {
            Some((r, HeapObject::Exception(_))) => Some(Exception(r)),
            _ => None,
        }
    }

    pub fn exception_kind(&self, exc: Exception) -> Option<ExcKind> {
        match self.heap.get(exc.0) {
            Some(HeapObject::Exception(obj)) => Some(obj.kind),
            _ => None,
        }
    }

    pub fn exception_args(&self, exc: Exception) -> Vec<Value> {
        match self.heap.get(exc.0) {
            Some(HeapObject::Exception(obj)) => obj.args.clone(),
            _ => Vec::new(),
        }
    }

    pub fn traceback(&self, exc: Exception) -> Vec<TracebackEntry> {
        match self.heap.get(exc.0) {
            Some(HeapObject::Exception(obj)) => obj.traceback.clone(),
            _ => Vec::new(),
        }
    }

    /// `int` conversion for values that are integers already.
    pub fn to_int(&mut self, value: Value) -> ExecResult<i64> {
        match number(value) {
            Some(Num::Int(i)) => Ok(i),
            _ => {
                let message = format!("can't convert {} to int", self.type_name(value));
                Err(self.new_error(ExcKind::TypeError, message))
            }
        }
    }

    pub fn to_float(&mut self, value: Value) -> ExecResult<f64> {
        match number(value) {
            Some(n) => Ok(n.as_f64()),
            None => {
                let message = format!("can't convert {} to float", self.type_name(value));
                Err(self.new_error(ExcKind::TypeError, message))
            }
        }
    }

    pub fn type_name(&self, value: Value) -> &'static str {
        match value {
            Value::None => "NoneType",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Builtin(_) => "function",
            Value::ExcType(_) => "type",
            Value::Obj(r) => self.heap.get(r).map_or("object", HeapObject::type_name),
        }
    }

    // ------------------------------------------------------------------
    // Printing
    // ------------------------------------------------------------------

    pub fn repr(&self, value: Value) -> String {
        match value {
            Value::None => "None".into(),
            Value::Bool(true) => "True".into(),
            Value::Bool(false) => "False".into(),
            Value::Int(i) => i.to_string(),
            Value::Float(x) => format_float(x),
            Value::Builtin(b) => format!("<function {}>", b.name()),
            Value::ExcType(k) => format!("<class '{}'>", k.name()),
            Value::Obj(r) => match self.heap.get(r) {
                Some(HeapObject::Str(s)) => quote_str(s),
                Some(HeapObject::Bytes(b)) => quote_bytes(b),
                Some(HeapObject::Tuple(items)) => self.repr_tuple(items),
                Some(HeapObject::Function { def, .. }) => {
                    format!("<function {} at 0x{:08x}>", def.name, self.heap.address_of(r))
                }
                Some(HeapObject::Exception(obj)) => format!("{}{}", obj.kind.name(), self.repr_tuple(&obj.args)),
                Some(HeapObject::Native(n)) => n.repr(),
                None => "<freed>".into(),
            },
        }
    }

    fn repr_tuple(&self, items: &[Value]) -> String {
        let parts: Vec<String> = items.iter().map(|v| self.repr(*v)).collect();
        if parts.len() == 1 {
            format!("({},)", parts[0])
        } else {
            format!("({})", parts.join(", "))
        }
    }

    /// `str(value)`.
    pub fn to_str(&self, value: Value) -> String {
        match value.as_obj().and_then(|r| self.heap.get(r)) {
            Some(HeapObject::Str(s)) => s.to_string(),
            Some(HeapObject::Exception(obj)) => match obj.args.as_slice() {
                [] => String::new(),
                [arg] => self.to_str(*arg),
                args => self.repr_tuple(args),
            },
            _ => self.repr(value),
        }
    }

    /// The report printed for an uncaught exception.
    pub fn format_exception(&self, exc: Exception) -> String {
        let Some(HeapObject::Exception(obj)) = self.heap.get(exc.0) else {
            return "<freed exception>\n".into();
        };
        let mut out = String::new();
        if !obj.traceback.is_empty() {
            out.push_str("Traceback (most recent call last):\n");
            for entry in obj.traceback.iter().rev() {
                out.push_str(&format!("  File \"{}\", line {}", entry.file, entry.line));
                if !entry.scope.is_empty() {
                    out.push_str(&format!(", in {}", entry.scope));
                }
                out.push('\n');
            }
        }
        out.push_str(obj.kind.name());
        let message = self.to_str(Value::Obj(exc.0));
        if !message.is_empty() {
            out.push_str(": ");
            out.push_str(&message);
        }
        out.push('\n');
        out
    }

    pub fn print_exception(&self, exc: Exception) {
        let report = self.format_exception(exc);
        self.write(&report);
    }

    pub fn write(&self, text: &str) {
        self.config.output.write_str(text);
    }

    pub fn output(&self) -> &OutputSink {
        &self.config.output
    }

    pub fn set_output(&mut self, output: OutputSink) {
        self.config.output = output;
    }

    // ------------------------------------------------------------------
    // Collector
    // ------------------------------------------------------------------

    pub fn add_root_source(&mut self, source: Rc<dyn RootSource>) {
        self.root_sources.push(source);
    }

    fn roots(&self) -> Vec<Value> {
        let mut roots: Vec<Value> = self.globals.values().copied().collect();
        for frame in &self.frames {
            roots.extend(frame.locals.values().copied());
        }
        roots.extend(self.temps.iter().copied());
        roots.extend(self.handling.iter().map(|exc| Value::Obj(exc.0)));
        roots.push(Value::Obj(self.memory_error));
        for source in &self.root_sources {
            source.roots(&mut roots);
        }
        roots
    }

    /// Runs a full collection.
    pub fn collect(&mut self) -> GcStats {
        let roots = self.roots();
        let stats = self.heap.collect(roots);
        self.allocated_since_gc = 0;
        log::debug!(
            "gc #{}: freed {} objects ({} bytes), {} live ({} bytes)",
            stats.collections,
            stats.freed_objects,
            stats.freed_bytes,
            stats.live_objects,
            stats.live_bytes
        );
        stats
    }

    pub fn heap_stats(&self) -> HeapStats {
        self.heap.stats()
    }

    pub fn heap_capability(&self) -> Capability {
        self.heap.region()
    }

    pub fn emergency(&self) -> Rc<EmergencyBuffer> {
        self.emergency.clone()
    }

    /// Drops every script object. The engine is unusable afterwards.
    pub fn clear(&mut self) {
        self.globals.clear();
        self.frames.clear();
        self.temps.clear();
        self.handling.clear();
        self.root_sources.clear();
        self.heap.clear();
    }
}

fn floor_div(x: i64, y: i64) -> Option<i64> {
    let q = x.checked_div(y)?;
    if (x % y != 0) && ((x < 0) != (y < 0)) {
        q.checked_sub(1)
    } else {
        Some(q)
    }
}

fn cmp_symbol(op: CmpOp) -> &'static str {
    match op {
        CmpOp::Lt => "<",
        CmpOp::Gt => ">",
        CmpOp::Le => "<=",
        CmpOp::Ge => ">=",
        CmpOp::Eq => "==",
        CmpOp::NotEq => "!=",
        CmpOp::Is => "is",
        CmpOp::IsNot => "is not",
    }
}

pub(crate) fn format_float(x: f64) -> String {
    if x.is_nan() {
        return "nan".into();
    }
    if x.is_infinite() {
        return if x > 0.0 { "inf".into() } else { "-inf".into() };
    }
    let magnitude = x.abs();
    if magnitude != 0.0 && !(1e-4..1e16).contains(&magnitude) {
        let formatted = format!("{:e}", x);
        let (mantissa, exponent) = formatted.split_once('e').unwrap_or((&formatted, "0"));
        let (sign, digits) = match exponent.strip_prefix('-') {
            Some(digits) => ('-', digits),
            None => ('+', exponent),
        };
        return format!("{}e{}{:0>2}", mantissa, sign, digits);
    }
    if x.fract() == 0.0 {
        format!("{:.1}", x)
    } else {
        format!("{}", x)
    }
}

fn quote_str(s: &str) -> String {
    let quote = if s.contains('\'') && !s.contains('"') { '"' } else { '\'' };
    let mut out = String::with_capacity(s.len() + 2);
    out.push(quote);
    for ch in s.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c == quote => {
                out.push('\\');
                out.push(c);
            }
            c if (c as u32) < 0x20 || c as u32 == 0x7f => out.push_str(&format!("\\x{:02x}", c as u32)),
            c => out.push(c),
        }
    }
    out.push(quote);
    out
}

fn quote_bytes(bytes: &[u8]) -> String {
    let mut out = String::from("b'");
    for &b in bytes {
        match b {
            b'\\' => out.push_str("\\\\"),
            b'\'' => out.push_str("\\'"),
            b'\n' => out.push_str("\\n"),
            b'\r' => out.push_str("\\r"),
            b'\t' => out.push_str("\\t"),
            0x20..=0x7e => out.push(b as char),
            _ => out.push_str(&format!("\\x{:02x}", b)),
        }
    }
    out.push('\'');
    out
}
