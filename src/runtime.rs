//! The bytecode interpreter (§4.9, §3 "Procedure"/"Frame").
//!
//! [`Vm`] walks one [`Procedure`]'s bytecode at a time, dispatching each
//! [`Opcode`] against the VM's own stack plus the shared [`Heaps`] and
//! [`GlobalTable`]. It never owns the compiled module, the heap, or the
//! globals — those are handed in by the caller (`Context`, in the host
//! layer) on every `invoke`/`resume`, so one `Vm` can be reused across
//! many calls without re-allocating its stack.
//!
//! Instrumentation is a generic parameter rather than a trait object: a
//! `Tracer` with empty default bodies monomorphizes down to nothing, so a
//! host that never traces pays zero overhead for the hook calls sprinkled
//! through the dispatch loop.

use std::sync::atomic::{AtomicBool, Ordering};

use ahash::AHashMap;

use crate::ast::Action;
use crate::bytecode::{Opcode, PoolLiteral, Procedure, decode_at, span_at};
use crate::error::{MethodStatus, RunStatus, RuntimeFailure, TerminatePayload, TraceFrame};
use crate::heap::{HeapId, Heaps};
use crate::object::{
    self, DictObj, ExtensionObj, ExtensionState, IteratorObj, ListObj, Object, StrObj, SubRoutineObj,
    DEFAULT_LIST_MAX,
};
use crate::value::{self, ArithError, Value};

/// A frame's ceiling when no explicit limit is configured (§4.13 "frame
/// depth ceiling"). Hosts are expected to override this from
/// `ContextOptions` rather than rely on it.
pub const DEFAULT_MAX_FRAME_DEPTH: usize = 2048;

/// The globals table (§3 "Module"/§4.5 "global"): string-keyed, mutable,
/// shared by every procedure in a compiled module.
#[derive(Debug, Default)]
pub struct GlobalTable {
    entries: AHashMap<String, Value>,
}

impl GlobalTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<Value> {
        self.entries.get(name).copied()
    }

    pub fn set(&mut self, name: impl Into<String>, value: Value) {
        self.entries.insert(name.into(), value);
    }

    pub fn unset(&mut self, name: &str) {
        self.entries.remove(name);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Value)> + '_ {
        self.entries.iter().map(|(k, v)| (k.as_str(), *v))
    }

    /// Visits every heap reference a global currently holds, so a GC cycle
    /// run mid-execution doesn't sweep something only a global points to.
    pub fn trace(&self, visit: &mut dyn FnMut(HeapId)) {
        for v in self.entries.values() {
            if let Some(id) = v.heap_id() {
                visit(id);
            }
        }
    }
}

/// The outcome of a host-registered `Function` call (§4.10 "Function").
#[derive(Debug, Clone)]
pub enum HostCall {
    Ok(Value),
    Fail(String),
    /// The call suspended the whole VM (the coroutine-style `yield()`
    /// built-in, §8 scenario 5); `Vm::resume` continues right after it.
    Yield,
    /// The host recognizes the call but declined it; lets an embedding
    /// layer substitute a default without every call site special-casing
    /// the distinction between "unimplemented" and "failed" (§7).
    Unimplemented,
}

/// The embedding boundary the VM calls into for host functions and
/// extension construction (§4.10 "Host"). A host is a single
/// runtime-selected implementation per `Context`, so unlike `Tracer` this
/// stays a trait object rather than a generic parameter.
pub trait Host {
    fn call(&mut self, registry_index: u32, from_engine: bool, args: &[Value]) -> HostCall;

    fn construct_extension(
        &mut self,
        type_name: &str,
        fields: &[(String, Value)],
    ) -> Result<Box<dyn ExtensionState>, String>;
}

/// Execution observer hooks (§4.12 "Tracer"). Every method defaults to a
/// no-op so `NoopTracer` compiles away entirely when used as the `T` in
/// `Vm::invoke::<NoopTracer>`.
pub trait Tracer {
    fn on_instruction(&mut self, _procedure_index: u32, _ip: usize, _opcode: Opcode) {}
    fn on_debug_marker(&mut self, _source_index: u32) {}
}

/// The zero-cost default tracer.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTracer;

impl Tracer for NoopTracer {}

/// A compiled module's procedure table, borrowed for the duration of a
/// `run`. Subs and ACLs never need a side table: they're resolved to
/// heap-allocated `SubRoutine`/`Acl` values once, at `GSub`/`LAcl` time,
/// and carried as ordinary `Value`s from then on.
#[derive(Debug, Clone, Copy)]
pub struct LoadedModule<'a> {
    pub procedures: &'a [Procedure],
}

/// One script-procedure activation record. Only what the interpreter
/// itself needs to resume execution and report a trace: the procedure
/// being run, where within it, and where its locals start on the VM
/// stack. Call arity is re-checked against `Procedure::arity()` at call
/// time rather than stashed here, and a failure's trace is built from
/// `procedure_index`/`ip` via `span_at` rather than a separately carried
/// source index, so neither needs a field of its own.
#[derive(Debug, Clone, Copy)]
struct Frame {
    procedure_index: u32,
    ip: usize,
    base: usize,
}

/// The bytecode interpreter. Holds its operand stack and call-frame stack
/// across calls so a host can `invoke` many subroutines back to back
/// without reallocating either.
#[derive(Debug)]
pub struct Vm {
    stack: Vec<Value>,
    frames: Vec<Frame>,
    /// Scratch registers the GC root-scan also has to see (§4.9): these
    /// hold in-flight values (e.g. an iteration's current key) that may
    /// momentarily live nowhere else.
    v0: Value,
    v1: Value,
    yielded: bool,
    max_frame_depth: usize,
    /// Longest a `llist` literal may allocate (§4.8 "List"), threaded in
    /// from `ContextOptions::list_max_len`.
    max_list_len: usize,
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

impl Vm {
    pub fn new() -> Self {
        Self::with_max_frame_depth(DEFAULT_MAX_FRAME_DEPTH)
    }

    pub fn with_max_frame_depth(max_frame_depth: usize) -> Self {
        Self::with_limits(max_frame_depth, DEFAULT_LIST_MAX)
    }

    pub fn with_limits(max_frame_depth: usize, max_list_len: usize) -> Self {
        Self {
            stack: Vec::new(),
            frames: Vec::new(),
            v0: Value::Null,
            v1: Value::Null,
            yielded: false,
            max_frame_depth,
            max_list_len,
        }
    }

    /// Whether the VM is parked mid-call, waiting for `resume`.
    pub fn is_yielded(&self) -> bool {
        self.yielded
    }

    /// Starts a fresh call into `procedure_index` with `args` as its
    /// locals. Panics if the VM is already yielded or mid-call — callers
    /// are expected to check `is_yielded`/keep one `Vm` per in-flight call
    /// chain.
    #[allow(clippy::too_many_arguments)]
    pub fn invoke<T: Tracer>(
        &mut self,
        module: &LoadedModule<'_>,
        heaps: &mut Heaps<'_>,
        globals: &mut GlobalTable,
        host: &mut dyn Host,
        tracer: &mut T,
        procedure_index: u32,
        args: &[Value],
        budget: Option<u32>,
        interrupt: Option<&AtomicBool>,
    ) -> RunStatus {
        assert!(!self.yielded, "invoke called on a yielded Vm; call resume instead");
        assert!(self.frames.is_empty(), "invoke called while a call is already in flight");

        let proc = &module.procedures[procedure_index as usize];
        if proc.arity() != args.len() {
            return RunStatus::Fail(RuntimeFailure {
                message: format!("'{}' expects {} argument(s), got {}", proc.name, proc.arity(), args.len()),
                trace: Vec::new(),
            });
        }

        let base = self.stack.len();
        self.stack.extend_from_slice(args);
        self.frames.push(Frame { procedure_index, ip: 0, base });
        self.run(module, heaps, globals, host, tracer, budget, interrupt)
    }

    /// Continues a yielded call. `resume_value` becomes the value the
    /// suspended `Call` opcode observes as its result.
    #[allow(clippy::too_many_arguments)]
    pub fn resume<T: Tracer>(
        &mut self,
        module: &LoadedModule<'_>,
        heaps: &mut Heaps<'_>,
        globals: &mut GlobalTable,
        host: &mut dyn Host,
        tracer: &mut T,
        resume_value: Option<Value>,
        budget: Option<u32>,
        interrupt: Option<&AtomicBool>,
    ) -> RunStatus {
        assert!(self.yielded, "resume called on a Vm that is not yielded");
        self.yielded = false;
        if let Some(v) = resume_value {
            self.stack.push(v);
        }
        self.run(module, heaps, globals, host, tracer, budget, interrupt)
    }

    #[allow(clippy::too_many_lines, clippy::too_many_arguments)]
    fn run<T: Tracer>(
        &mut self,
        module: &LoadedModule<'_>,
        heaps: &mut Heaps<'_>,
        globals: &mut GlobalTable,
        host: &mut dyn Host,
        tracer: &mut T,
        mut budget: Option<u32>,
        interrupt: Option<&AtomicBool>,
    ) -> RunStatus {
        loop {
            if let Some(flag) = interrupt {
                if flag.load(Ordering::Relaxed) {
                    self.yielded = true;
                    return RunStatus::Yield;
                }
            }
            if let Some(remaining) = budget.as_mut() {
                if *remaining == 0 {
                    self.yielded = true;
                    return RunStatus::Yield;
                }
                *remaining -= 1;
            }

            if heaps.context.cycle_due() {
                let mut extra_roots: Vec<HeapId> = self.stack.iter().filter_map(Value::heap_id).collect();
                extra_roots.extend(self.v0.heap_id());
                extra_roots.extend(self.v1.heap_id());
                globals.trace(&mut |id| extra_roots.push(id));
                heaps.context.collect(extra_roots.into_iter(), heaps.engine);
            }

            let frame_index = self.frames.len() - 1;
            let frame = self.frames[frame_index];
            let proc = &module.procedures[frame.procedure_index as usize];
            let (op, operand, ilen) = decode_at(&proc.code, frame.ip);
            let next_ip = frame.ip + ilen;
            tracer.on_instruction(frame.procedure_index, frame.ip, op);

            match op {
                Opcode::Add | Opcode::Sub | Opcode::Mul | Opcode::Div | Opcode::Mod => {
                    let rhs = self.stack.pop().unwrap();
                    let lhs = self.stack.pop().unwrap();
                    let result = match op {
                        Opcode::Add => value::add(&lhs, &rhs),
                        Opcode::Sub => value::sub(&lhs, &rhs),
                        Opcode::Mul => value::mul(&lhs, &rhs),
                        Opcode::Div => value::div(&lhs, &rhs),
                        Opcode::Mod => value::rem(&lhs, &rhs),
                        _ => unreachable!(),
                    };
                    match result {
                        Ok(v) => self.stack.push(v),
                        Err(e) => return self.fail_status(describe_arith_error(&e), module),
                    }
                }

                Opcode::AddIv | Opcode::SubIv | Opcode::MulIv => {
                    let rhs = self.stack.pop().unwrap();
                    let lit = Value::Int(pool_int(proc, operand));
                    let result = match op {
                        Opcode::AddIv => value::add(&lit, &rhs),
                        Opcode::SubIv => value::sub(&lit, &rhs),
                        Opcode::MulIv => value::mul(&lit, &rhs),
                        _ => unreachable!(),
                    };
                    match result {
                        Ok(v) => self.stack.push(v),
                        Err(e) => return self.fail_status(describe_arith_error(&e), module),
                    }
                }
                Opcode::AddVi | Opcode::SubVi | Opcode::MulVi => {
                    let lhs = self.stack.pop().unwrap();
                    let lit = Value::Int(pool_int(proc, operand));
                    let result = match op {
                        Opcode::AddVi => value::add(&lhs, &lit),
                        Opcode::SubVi => value::sub(&lhs, &lit),
                        Opcode::MulVi => value::mul(&lhs, &lit),
                        _ => unreachable!(),
                    };
                    match result {
                        Ok(v) => self.stack.push(v),
                        Err(e) => return self.fail_status(describe_arith_error(&e), module),
                    }
                }

                Opcode::Eq | Opcode::Ne => {
                    let rhs = self.stack.pop().unwrap();
                    let lhs = self.stack.pop().unwrap();
                    let eq = values_equal(heaps, &lhs, &rhs);
                    self.stack.push(Value::Bool(if op == Opcode::Eq { eq } else { !eq }));
                }

                Opcode::Lt | Opcode::Le | Opcode::Gt | Opcode::Ge => {
                    let rhs = self.stack.pop().unwrap();
                    let lhs = self.stack.pop().unwrap();
                    match value::cmp_primitive(&lhs, &rhs) {
                        Some(ord) => {
                            let b = match op {
                                Opcode::Lt => ord.is_lt(),
                                Opcode::Le => ord.is_le(),
                                Opcode::Gt => ord.is_gt(),
                                Opcode::Ge => ord.is_ge(),
                                _ => unreachable!(),
                            };
                            self.stack.push(Value::Bool(b));
                        }
                        None => {
                            return self.fail_status(
                                format!(
                                    "unsupported operand types for comparison: {} and {}",
                                    lhs.type_name(),
                                    rhs.type_name()
                                ),
                                module,
                            );
                        }
                    }
                }

                Opcode::Match | Opcode::NotMatch => {
                    let rhs = self.stack.pop().unwrap();
                    let lhs = self.stack.pop().unwrap();
                    let status = if op == Opcode::Match {
                        object::match_value(heaps, &lhs, &rhs)
                    } else {
                        object::not_match_value(heaps, &lhs, &rhs)
                    };
                    match self.unwrap_method(status, module) {
                        Ok(b) => self.stack.push(Value::Bool(b)),
                        Err(status) => return status,
                    }
                }

                Opcode::Neg => {
                    let v = self.stack.pop().unwrap();
                    let result = match v {
                        Value::Int(i) => Value::Int(i.wrapping_neg()),
                        Value::Real(r) => Value::Real(-r),
                        other => return self.fail_status(format!("cannot negate a {}", other.type_name()), module),
                    };
                    self.stack.push(result);
                }
                Opcode::Not => {
                    let v = self.stack.pop().unwrap();
                    let b = object::to_bool(heaps, &v);
                    self.stack.push(Value::Bool(!b));
                }

                Opcode::GGet => {
                    let name = pool_str(proc, operand);
                    match globals.get(name) {
                        Some(v) => self.stack.push(v),
                        None => return self.fail_status(format!("read of unset global '{name}'"), module),
                    }
                }
                Opcode::GSet => {
                    let name = pool_str(proc, operand).to_string();
                    let v = self.stack.pop().unwrap();
                    globals.set(name, v);
                }
                Opcode::GUnset => {
                    let name = pool_str(proc, operand).to_string();
                    globals.unset(&name);
                }

                Opcode::PGet | Opcode::AGet => {
                    let name = pool_str(proc, operand).to_string();
                    let base = self.stack.pop().unwrap();
                    let status =
                        if op == Opcode::PGet { object::get_property(heaps, &base, &name) } else { object::get_attribute(heaps, &base, &name) };
                    match self.unwrap_method(status, module) {
                        Ok(v) => self.stack.push(v),
                        Err(status) => return status,
                    }
                }
                Opcode::PSet | Opcode::ASet => {
                    let name = pool_str(proc, operand).to_string();
                    let value = self.stack.pop().unwrap();
                    let base = self.stack.pop().unwrap();
                    let status = if op == Opcode::PSet {
                        object::set_property(heaps, &base, &name, value)
                    } else {
                        object::set_attribute(heaps, &base, &name, value)
                    };
                    if let Err(status) = self.unwrap_method(status, module) {
                        return status;
                    }
                }
                Opcode::PSetAdd
                | Opcode::PSetSub
                | Opcode::PSetMul
                | Opcode::PSetDiv
                | Opcode::PSetMod
                | Opcode::ASetAdd
                | Opcode::ASetSub
                | Opcode::ASetMul
                | Opcode::ASetDiv
                | Opcode::ASetMod => {
                    let is_attr = matches!(
                        op,
                        Opcode::ASetAdd | Opcode::ASetSub | Opcode::ASetMul | Opcode::ASetDiv | Opcode::ASetMod
                    );
                    let name = pool_str(proc, operand).to_string();
                    let rhs = self.stack.pop().unwrap();
                    let base = *self.stack.last().unwrap();
                    let get_status =
                        if is_attr { object::get_attribute(heaps, &base, &name) } else { object::get_property(heaps, &base, &name) };
                    let old = match self.unwrap_method(get_status, module) {
                        Ok(v) => v,
                        Err(status) => return status,
                    };
                    let new = match apply_compound(op, &old, &rhs) {
                        Ok(v) => v,
                        Err(e) => return self.fail_status(describe_arith_error(&e), module),
                    };
                    let set_status = if is_attr {
                        object::set_attribute(heaps, &base, &name, new)
                    } else {
                        object::set_property(heaps, &base, &name, new)
                    };
                    if let Err(status) = self.unwrap_method(set_status, module) {
                        return status;
                    }
                    self.stack.pop();
                }
                Opcode::PUnset | Opcode::AUnset => {
                    let name = pool_str(proc, operand).to_string();
                    let base = self.stack.pop().unwrap();
                    if let Err(status) = self.unwrap_method(object::unset(heaps, &base, &name), module) {
                        return status;
                    }
                }

                Opcode::IGet => {
                    let index = self.stack.pop().unwrap();
                    let base = self.stack.pop().unwrap();
                    match self.unwrap_method(object::get_index(heaps, &base, &index), module) {
                        Ok(v) => self.stack.push(v),
                        Err(status) => return status,
                    }
                }
                Opcode::ISet => {
                    let value = self.stack.pop().unwrap();
                    let index = self.stack.pop().unwrap();
                    let base = self.stack.pop().unwrap();
                    if let Err(status) = self.unwrap_method(object::set_index(heaps, &base, &index, value), module) {
                        return status;
                    }
                }
                Opcode::ISetAdd | Opcode::ISetSub | Opcode::ISetMul | Opcode::ISetDiv | Opcode::ISetMod => {
                    let rhs = self.stack.pop().unwrap();
                    let index = self.stack.pop().unwrap();
                    let base = *self.stack.last().unwrap();
                    let old = match self.unwrap_method(object::get_index(heaps, &base, &index), module) {
                        Ok(v) => v,
                        Err(status) => return status,
                    };
                    let new = match apply_compound(op, &old, &rhs) {
                        Ok(v) => v,
                        Err(e) => return self.fail_status(describe_arith_error(&e), module),
                    };
                    if let Err(status) = self.unwrap_method(object::set_index(heaps, &base, &index, new), module) {
                        return status;
                    }
                    self.stack.pop();
                }
                Opcode::IUnset => {
                    let index = self.stack.pop().unwrap();
                    let base = self.stack.pop().unwrap();
                    if let Err(status) = self.unwrap_method(unset_index(heaps, &base, &index), module) {
                        return status;
                    }
                }

                Opcode::SLoad => {
                    let v = self.stack[frame.base + operand as usize];
                    self.stack.push(v);
                }
                Opcode::SStore => {
                    let v = self.stack.pop().unwrap();
                    self.stack[frame.base + operand as usize] = v;
                }
                Opcode::SUnset => {
                    self.stack[frame.base + operand as usize] = Value::Null;
                }
                Opcode::SPop => {
                    let new_len = self.stack.len() - operand as usize;
                    self.stack.truncate(new_len);
                }

                Opcode::Jmp => {
                    self.frames[frame_index].ip = operand as usize;
                    continue;
                }
                Opcode::Jt | Opcode::Jf => {
                    let cond = self.stack.pop().unwrap();
                    let b = object::to_bool(heaps, &cond);
                    let take = if op == Opcode::Jt { b } else { !b };
                    self.frames[frame_index].ip = if take { operand as usize } else { next_ip };
                    continue;
                }
                Opcode::Brt | Opcode::Brf => {
                    let cond = *self.stack.last().unwrap();
                    let b = object::to_bool(heaps, &cond);
                    let take = if op == Opcode::Brt { b } else { !b };
                    if take {
                        *self.stack.last_mut().unwrap() = Value::Bool(op == Opcode::Brt);
                        self.frames[frame_index].ip = operand as usize;
                    } else {
                        self.stack.pop();
                        self.frames[frame_index].ip = next_ip;
                    }
                    continue;
                }

                Opcode::Call => {
                    let argc = operand as usize;
                    let callee_idx = self.stack.len() - argc - 1;
                    let callee = self.stack[callee_idx];
                    match callee {
                        Value::SubRoutine(id) => {
                            let Object::SubRoutine(sub) = heaps.get(id) else { unreachable!() };
                            let sub = *sub;
                            let target = &module.procedures[sub.procedure_index as usize];
                            if target.arity() != argc {
                                return self.fail_status(
                                    format!(
                                        "sub '{}' expects {} argument(s), got {argc}",
                                        target.name,
                                        target.arity()
                                    ),
                                    module,
                                );
                            }
                            if self.frames.len() >= self.max_frame_depth {
                                return self.fail_status("call stack overflow".to_string(), module);
                            }
                            self.frames[frame_index].ip = next_ip;
                            self.frames.push(Frame { procedure_index: sub.procedure_index, ip: 0, base: callee_idx + 1 });
                            continue;
                        }
                        Value::Function(id) => {
                            let Object::Function(func) = heaps.get(id) else { unreachable!() };
                            let registry_index = func.registry_index;
                            let from_engine = func.from_engine;
                            let args = self.stack.split_off(callee_idx + 1);
                            self.stack.truncate(callee_idx);
                            match host.call(registry_index, from_engine, &args) {
                                HostCall::Ok(v) => self.stack.push(v),
                                HostCall::Fail(msg) => return self.fail_status(msg, module),
                                HostCall::Yield => {
                                    self.frames[frame_index].ip = next_ip;
                                    self.yielded = true;
                                    return RunStatus::Yield;
                                }
                                HostCall::Unimplemented => {
                                    self.frames.clear();
                                    self.stack.clear();
                                    self.yielded = false;
                                    return RunStatus::Unimplemented(format!(
                                        "host function (registry index {registry_index}) is unimplemented"
                                    ));
                                }
                            }
                        }
                        other => return self.fail_status(format!("cannot call a {}", other.type_name()), module),
                    }
                }
                Opcode::Ret => {
                    let value = self.stack.pop().unwrap();
                    self.frames.pop();
                    if self.frames.is_empty() {
                        self.stack.clear();
                        return RunStatus::Ok(value);
                    }
                    self.stack.truncate(frame.base - 1);
                    self.stack.push(value);
                    continue;
                }
                Opcode::Term => {
                    let action = Action::from_code(operand).expect("invalid action code in compiled bytecode");
                    self.frames.clear();
                    self.stack.clear();
                    self.yielded = false;
                    return RunStatus::Terminate(TerminatePayload::Action(action, None));
                }

                Opcode::GSub | Opcode::LSub => {
                    let sub = Object::SubRoutine(SubRoutineObj { procedure_index: operand });
                    match heaps.alloc(sub) {
                        Ok(id) => self.stack.push(Value::SubRoutine(id)),
                        Err(e) => return self.fail_status(e, module),
                    }
                }

                Opcode::ForPrep => {
                    let top = *self.stack.last().unwrap();
                    match top {
                        Value::List(container) => {
                            let empty = match heaps.get(container) {
                                Object::List(l) => l.is_empty(),
                                _ => unreachable!(),
                            };
                            if empty {
                                self.stack.pop();
                                self.frames[frame_index].ip = operand as usize;
                                continue;
                            }
                            match heaps.alloc(Object::Iterator(IteratorObj::List { container, next: 0 })) {
                                Ok(id) => *self.stack.last_mut().unwrap() = Value::Iterator(id),
                                Err(e) => return self.fail_status(e, module),
                            }
                        }
                        Value::Dict(container) => {
                            let empty = match heaps.get(container) {
                                Object::Dict(d) => d.is_empty(),
                                _ => unreachable!(),
                            };
                            if empty {
                                self.stack.pop();
                                self.frames[frame_index].ip = operand as usize;
                                continue;
                            }
                            match heaps.alloc(Object::Iterator(IteratorObj::Dict { container, next: 0 })) {
                                Ok(id) => *self.stack.last_mut().unwrap() = Value::Iterator(id),
                                Err(e) => return self.fail_status(e, module),
                            }
                        }
                        // Already a prepared iterator: nothing to do, the
                        // compiler never emits this path itself but a host
                        // could in principle hand one in.
                        Value::Iterator(_) => {}
                        other => return self.fail_status(format!("cannot iterate a {}", other.type_name()), module),
                    }
                }
                Opcode::IterK => {
                    let Value::Iterator(id) = *self.stack.last().unwrap() else {
                        unreachable!("iterk without a prepared iterator")
                    };
                    let Object::Iterator(it) = heaps.get(id) else { unreachable!() };
                    let key = match *it {
                        IteratorObj::List { next, .. } => Value::Int(next as i32),
                        IteratorObj::Dict { container, next } => {
                            let Object::Dict(dict) = heaps.get(container) else { unreachable!() };
                            let key_id = dict.key_ids().nth(next).expect("iterk past end");
                            Value::String(key_id)
                        }
                    };
                    self.stack.push(key);
                }
                Opcode::IterV => {
                    let iter_idx = self.stack.len() - 2;
                    let Value::Iterator(id) = self.stack[iter_idx] else {
                        unreachable!("iterv without a prepared iterator")
                    };
                    let Object::Iterator(it) = heaps.get(id) else { unreachable!() };
                    let value = match *it {
                        IteratorObj::List { container, next } => {
                            let Object::List(list) = heaps.get(container) else { unreachable!() };
                            list.get(next as i64).expect("iterv past end")
                        }
                        IteratorObj::Dict { container, next } => {
                            let Object::Dict(dict) = heaps.get(container) else { unreachable!() };
                            dict.iter().nth(next).map(|(_, v)| v).expect("iterv past end")
                        }
                    };
                    self.stack.push(value);
                }
                Opcode::ForEnd => {
                    let Value::Iterator(id) = *self.stack.last().unwrap() else {
                        unreachable!("forend without a prepared iterator")
                    };
                    let (next, len) = {
                        let Object::Iterator(it) = heaps.get(id) else { unreachable!() };
                        let container = it.container();
                        let next = match *it {
                            IteratorObj::List { next, .. } | IteratorObj::Dict { next, .. } => next,
                        };
                        let len = match heaps.get(container) {
                            Object::List(l) => l.len(),
                            Object::Dict(d) => d.len(),
                            _ => unreachable!(),
                        };
                        (next, len)
                    };
                    let new_next = next + 1;
                    if let Object::Iterator(it) = heaps.get_mut(id) {
                        match it {
                            IteratorObj::List { next, .. } | IteratorObj::Dict { next, .. } => *next = new_next,
                        }
                    }
                    self.frames[frame_index].ip = if new_next < len { operand as usize } else { next_ip };
                    continue;
                }
                Opcode::Brk | Opcode::Cont => {
                    self.frames[frame_index].ip = operand as usize;
                    continue;
                }

                Opcode::LInt => self.stack.push(Value::Int(pool_int(proc, operand))),
                Opcode::LReal => {
                    let bits = match proc.literals.get(operand) {
                        PoolLiteral::Real(bits) => *bits,
                        other => unreachable!("expected a real literal, found {other:?}"),
                    };
                    self.stack.push(Value::Real(f64::from_bits(bits)));
                }
                Opcode::LStr => {
                    let text = pool_str(proc, operand).to_string();
                    match heaps.alloc(Object::Str(StrObj::new(text))) {
                        Ok(id) => self.stack.push(Value::String(id)),
                        Err(e) => return self.fail_status(e, module),
                    }
                }
                Opcode::LSize => {
                    let size = match proc.literals.get(operand) {
                        PoolLiteral::Size(s) => *s,
                        other => unreachable!("expected a size literal, found {other:?}"),
                    };
                    self.stack.push(Value::Size(size));
                }
                Opcode::LDuration => {
                    let duration = match proc.literals.get(operand) {
                        PoolLiteral::Duration(d) => *d,
                        other => unreachable!("expected a duration literal, found {other:?}"),
                    };
                    self.stack.push(Value::Duration(duration));
                }
                Opcode::LAcl => {
                    let acl = proc.acls[operand as usize].clone();
                    match heaps.alloc(Object::Acl(acl)) {
                        Ok(id) => self.stack.push(Value::Acl(id)),
                        Err(e) => return self.fail_status(e, module),
                    }
                }
                Opcode::LDict => {
                    let count = operand as usize;
                    let base = self.stack.len() - count * 2;
                    let mut dict = DictObj::new();
                    for i in 0..count {
                        let Value::String(key_id) = self.stack[base + i * 2] else {
                            unreachable!("ldict key must be a string")
                        };
                        let value = self.stack[base + i * 2 + 1];
                        let Object::Str(key_s) = heaps.get(key_id) else { unreachable!() };
                        let key_text = key_s.as_str().to_string();
                        dict.insert(key_id, &key_text, value);
                    }
                    match heaps.alloc(Object::Dict(dict)) {
                        Ok(id) => {
                            self.stack.truncate(base);
                            self.stack.push(Value::Dict(id));
                        }
                        Err(e) => return self.fail_status(e, module),
                    }
                }
                Opcode::LList => {
                    let count = operand as usize;
                    let base = self.stack.len() - count;
                    let items: Vec<Value> = self.stack[base..].to_vec();
                    match heaps.alloc(Object::List(ListObj::from_vec(items, self.max_list_len))) {
                        Ok(id) => {
                            self.stack.truncate(base);
                            self.stack.push(Value::List(id));
                        }
                        Err(e) => return self.fail_status(e, module),
                    }
                }
                Opcode::LExt => {
                    let count = operand as usize;
                    let total = count * 2 + 1;
                    let base = self.stack.len() - total;
                    let Value::String(type_id) = self.stack[base] else {
                        unreachable!("lext type name must be a string")
                    };
                    let Object::Str(type_s) = heaps.get(type_id) else { unreachable!() };
                    let type_name = type_s.as_str().to_string();
                    let mut fields = Vec::with_capacity(count);
                    for i in 0..count {
                        let Value::String(name_id) = self.stack[base + 1 + i * 2] else {
                            unreachable!("lext field name must be a string")
                        };
                        let value = self.stack[base + 2 + i * 2];
                        let Object::Str(name_s) = heaps.get(name_id) else { unreachable!() };
                        fields.push((name_s.as_str().to_string(), value));
                    }
                    match host.construct_extension(&type_name, &fields) {
                        Ok(inner) => match heaps.alloc(Object::Extension(ExtensionObj { inner })) {
                            Ok(id) => {
                                self.stack.truncate(base);
                                self.stack.push(Value::Extension(id));
                            }
                            Err(e) => return self.fail_status(e, module),
                        },
                        Err(msg) => return self.fail_status(msg, module),
                    }
                }
                Opcode::LTrue => self.stack.push(Value::Bool(true)),
                Opcode::LFalse => self.stack.push(Value::Bool(false)),
                Opcode::LNull => self.stack.push(Value::Null),

                Opcode::Debug => tracer.on_debug_marker(operand),

                Opcode::CStr => {
                    let v = self.stack.pop().unwrap();
                    match self.unwrap_method(object::to_display_string(heaps, &v), module) {
                        Ok(text) => match heaps.alloc(Object::Str(StrObj::new(text))) {
                            Ok(id) => self.stack.push(Value::String(id)),
                            Err(e) => return self.fail_status(e, module),
                        },
                        Err(status) => return status,
                    }
                }
                Opcode::CInt => {
                    let v = self.stack.pop().unwrap();
                    match coerce_int(heaps, &v) {
                        Ok(i) => self.stack.push(Value::Int(i)),
                        Err(e) => return self.fail_status(e, module),
                    }
                }
                Opcode::CReal => {
                    let v = self.stack.pop().unwrap();
                    match coerce_real(heaps, &v) {
                        Ok(r) => self.stack.push(Value::Real(r)),
                        Err(e) => return self.fail_status(e, module),
                    }
                }
                Opcode::CBool => {
                    let v = self.stack.pop().unwrap();
                    let b = object::to_bool(heaps, &v);
                    self.stack.push(Value::Bool(b));
                }
                Opcode::Type => {
                    let v = self.stack.pop().unwrap();
                    let name = match v.heap_id() {
                        Some(id) => heaps.get(id).type_name(),
                        None => v.type_name(),
                    };
                    match heaps.alloc(Object::Str(StrObj::new(name.to_string()))) {
                        Ok(id) => self.stack.push(Value::String(id)),
                        Err(e) => return self.fail_status(e, module),
                    }
                }
                Opcode::SCat => {
                    let count = operand as usize;
                    let base = self.stack.len() - count;
                    let mut combined = String::new();
                    for i in base..self.stack.len() {
                        let Value::String(id) = self.stack[i] else { unreachable!("scat operand must be a string") };
                        let Object::Str(s) = heaps.get(id) else { unreachable!() };
                        combined.push_str(s.as_str());
                    }
                    match heaps.alloc(Object::Str(StrObj::new(combined))) {
                        Ok(id) => {
                            self.stack.truncate(base);
                            self.stack.push(Value::String(id));
                        }
                        Err(e) => return self.fail_status(e, module),
                    }
                }
            }

            self.frames[frame_index].ip = next_ip;
        }
    }

    /// Builds a `Fail` status with a newest-first trace from the current
    /// frame stack, then clears the VM so it's ready for a fresh `invoke`.
    fn fail_status(&mut self, message: String, module: &LoadedModule<'_>) -> RunStatus {
        let mut trace = Vec::with_capacity(self.frames.len());
        for frame in self.frames.iter().rev() {
            let proc = &module.procedures[frame.procedure_index as usize];
            let span = span_at(&proc.source_map, frame.ip as u32);
            trace.push(TraceFrame { procedure_name: proc.name.clone(), source_index: span.source_index, line: span.line });
        }
        self.frames.clear();
        self.stack.clear();
        self.yielded = false;
        RunStatus::Fail(RuntimeFailure { message, trace })
    }

    /// Turns an object-capability result into either its value or a
    /// `RunStatus::Fail` built from the current call stack — `Fail` and
    /// `Unimplemented` both read as a runtime failure at this level, since
    /// the host-side "fall back to default" meaning of `Unimplemented`
    /// only applies to `Function` calls, not intrinsic opcode dispatch.
    fn unwrap_method<V>(&mut self, status: MethodStatus<V>, module: &LoadedModule<'_>) -> Result<V, RunStatus> {
        match status {
            MethodStatus::Ok(v) => Ok(v),
            MethodStatus::Fail(msg) => Err(self.fail_status(msg, module)),
            MethodStatus::Unimplemented(what) => Err(self.fail_status(format!("unimplemented: {what}"), module)),
        }
    }
}

fn pool_str<'a>(proc: &'a Procedure, operand: u32) -> &'a str {
    match proc.literals.get(operand) {
        PoolLiteral::Str(s) => s.as_str(),
        other => unreachable!("expected a string literal, found {other:?}"),
    }
}

fn pool_int(proc: &Procedure, operand: u32) -> i32 {
    match proc.literals.get(operand) {
        PoolLiteral::Int(v) => *v,
        other => unreachable!("expected an integer literal, found {other:?}"),
    }
}

fn describe_arith_error(e: &ArithError) -> String {
    match e {
        ArithError::DivideByZero => "division by zero".to_string(),
        ArithError::Unsupported => "unsupported operand types for arithmetic".to_string(),
    }
}

fn apply_compound(op: Opcode, old: &Value, rhs: &Value) -> Result<Value, ArithError> {
    match op {
        Opcode::PSetAdd | Opcode::ASetAdd | Opcode::ISetAdd => value::add(old, rhs),
        Opcode::PSetSub | Opcode::ASetSub | Opcode::ISetSub => value::sub(old, rhs),
        Opcode::PSetMul | Opcode::ASetMul | Opcode::ISetMul => value::mul(old, rhs),
        Opcode::PSetDiv | Opcode::ASetDiv | Opcode::ISetDiv => value::div(old, rhs),
        Opcode::PSetMod | Opcode::ASetMod | Opcode::ISetMod => value::rem(old, rhs),
        _ => unreachable!("apply_compound called with a non-compound opcode"),
    }
}

/// `Eq`/`Ne` dispatch: primitives compare by value (§3 "Value" equality),
/// strings and actions compare by content, everything else compares by
/// heap identity.
fn values_equal(heaps: &Heaps<'_>, a: &Value, b: &Value) -> bool {
    if let Some(eq) = value::eq_primitive(a, b) {
        return eq;
    }
    match (a.heap_id(), b.heap_id()) {
        (Some(ia), Some(ib)) => match (heaps.get(ia), heaps.get(ib)) {
            (Object::Str(sa), Object::Str(sb)) => sa.as_str() == sb.as_str(),
            (Object::Action(aa), Object::Action(ab)) => aa == ab,
            _ => ia == ib,
        },
        _ => false,
    }
}

/// `UnsetIndex`: combines the dict-key-removal and list-element-removal
/// capabilities, which `object::unset` doesn't cover since that function
/// only ever takes a name, not an arbitrary index `Value`.
fn unset_index(heaps: &mut Heaps<'_>, base: &Value, index: &Value) -> MethodStatus<()> {
    let Some(base_id) = base.heap_id() else {
        return MethodStatus::Unimplemented("UnsetIndex");
    };
    match index {
        Value::String(key_id) => {
            let Object::Str(key) = heaps.get(*key_id) else { unreachable!() };
            let key_text = key.as_str().to_string();
            object::unset(heaps, base, &key_text)
        }
        Value::Int(i) => {
            let i = i64::from(*i);
            if let Object::List(list) = heaps.get_mut(base_id) {
                return match list.remove_at(i) {
                    Ok(_) => MethodStatus::Ok(()),
                    Err(e) => MethodStatus::Fail(e),
                };
            }
            MethodStatus::Unimplemented("UnsetIndex")
        }
        _ => MethodStatus::Fail("unsupported index type for unset".to_string()),
    }
}

fn coerce_int(heaps: &Heaps<'_>, v: &Value) -> Result<i32, String> {
    match v {
        Value::Int(i) => Ok(*i),
        Value::Real(r) => Ok(*r as i32),
        Value::Bool(b) => Ok(i32::from(*b)),
        Value::String(id) => {
            let Object::Str(s) = heaps.get(*id) else { unreachable!() };
            s.as_str().trim().parse::<i32>().map_err(|_| format!("cannot convert '{}' to an integer", s.as_str()))
        }
        other => Err(format!("cannot convert a {} to an integer", other.type_name())),
    }
}

fn coerce_real(heaps: &Heaps<'_>, v: &Value) -> Result<f64, String> {
    match v {
        Value::Int(i) => Ok(f64::from(*i)),
        Value::Real(r) => Ok(*r),
        Value::Bool(b) => Ok(if *b { 1.0 } else { 0.0 }),
        Value::String(id) => {
            let Object::Str(s) = heaps.get(*id) else { unreachable!() };
            s.as_str().trim().parse::<f64>().map_err(|_| format!("cannot convert '{}' to a real", s.as_str()))
        }
        other => Err(format!("cannot convert a {} to a real", other.type_name())),
    }
}
