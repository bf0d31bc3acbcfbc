//! The embedding boundary (§4.10, C10): [`Engine`] is the process-wide,
//! read-mostly container a host builds once; [`Context`] is the
//! per-execution container a host builds once per independent run and
//! drives with [`Context::invoke`]/[`Context::resume`].
//!
//! Host callables are registered as plain closures over a `&[Value]` slice
//! rather than the wire-level `GetArgumentSize`/`GetArgument` ABI named in
//! §6 — see DESIGN.md for why the simpler convention was kept once
//! `runtime::Host::call` had already settled on it.

use std::path::Path;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use ahash::AHashMap;

use crate::compiler::{CompiledModule, Compiler};
use crate::config::ContextOptions;
use crate::error::{CompileError, RunStatus, RuntimeFailure};
use crate::heap::Collector;
use crate::object::{ExtensionState, FunctionObj, Object};
use crate::parser::NameSeed;
use crate::runtime::{GlobalTable, Host, HostCall, LoadedModule, NoopTracer, Vm};
use crate::source_repo::{CompilationUnit, SourceRepo};
use crate::value::Value;
use crate::zone::Zone;

/// Produces an [`ExtensionState`] from field initializers when the VM
/// evaluates an extension literal naming a registered type (§4.10
/// "ExtensionFactory").
pub trait ExtensionFactory {
    fn construct(&mut self, fields: &[(String, Value)]) -> Result<Box<dyn ExtensionState>, String>;
}

/// A cloneable, thread-safe flag a host can use to ask a running [`Context`]
/// to suspend at the next dispatch (§5 "Preemption"), independent of
/// whatever thread actually owns the `Context` — the flag, not the
/// `Context` itself, is what needs to be `Send`/`Sync`.
#[derive(Debug, Clone)]
pub struct YieldHandle(Arc<AtomicBool>);

impl YieldHandle {
    pub fn request_yield(&self) {
        self.0.store(true, Ordering::Relaxed);
    }
}

/// Process-wide container (§4.10 "Engine"): owns the immutable collector
/// shared by every `Context` built from it, plus engine-level globals and
/// functions that every such `Context` starts out seeded with.
///
/// Engine-level functions are `Fn`, not `FnMut`: they may be called
/// concurrently from Contexts running on different threads (§5 "Shared
/// resources"), whereas a `Context`'s own functions are `FnMut` because a
/// `Context` is never driven from two threads at once.
pub struct Engine {
    collector: Collector,
    globals: GlobalTable,
    functions: Vec<Box<dyn Fn(&[Value]) -> HostCall + Send + Sync>>,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine {
    pub fn new() -> Self {
        Self { collector: Collector::new_engine(), globals: GlobalTable::new(), functions: Vec::new() }
    }

    pub fn collector(&self) -> &Collector {
        &self.collector
    }

    pub fn get_global(&self, name: &str) -> Option<Value> {
        self.globals.get(name)
    }

    pub fn set_global(&mut self, name: impl Into<String>, value: Value) {
        self.globals.set(name, value);
    }

    /// Registers a function callable from script as `name`, returning the
    /// `Value::Function` every `Context` built from this engine will see
    /// under that name by default.
    pub fn register_function(
        &mut self,
        name: impl Into<String>,
        f: impl Fn(&[Value]) -> HostCall + Send + Sync + 'static,
    ) -> Result<Value, String> {
        let registry_index = self.functions.len() as u32;
        self.functions.push(Box::new(f));
        let id = self.collector.alloc(Object::Function(FunctionObj { registry_index, from_engine: true }))?;
        let value = Value::Function(id);
        self.globals.set(name, value);
        Ok(value)
    }

    /// Parses `entry_path` (and its `include` tree, via `repo`) and compiles
    /// it into a [`CompiledModule`], reference-shared so every `Context`
    /// built against it can share one copy (§5 "Resource scopes").
    pub fn load(
        &self,
        repo: &SourceRepo,
        entry_path: &str,
        entry_folder: Option<&Path>,
    ) -> Result<Rc<CompiledModule>, CompileError> {
        let zone = Zone::new();
        let (unit, _seed) = CompilationUnit::build(&zone, repo, entry_path, entry_folder, NameSeed(0))?;
        let module = Compiler::new().compile_unit(&unit)?;
        Ok(Rc::new(module))
    }
}

/// Adapts a `Context`'s function registry, extension factories, and engine
/// reference into the [`Host`] trait the VM dispatches through. Lives only
/// for the duration of one `invoke`/`resume` call — see
/// `Context::with_vm`.
struct HostAdapter<'a> {
    engine: &'a Engine,
    functions: &'a mut Vec<Box<dyn FnMut(&[Value]) -> HostCall>>,
    extension_factories: &'a mut AHashMap<String, Box<dyn ExtensionFactory>>,
}

impl Host for HostAdapter<'_> {
    fn call(&mut self, registry_index: u32, from_engine: bool, args: &[Value]) -> HostCall {
        if from_engine {
            match self.engine.functions.get(registry_index as usize) {
                Some(f) => f(args),
                None => HostCall::Fail(format!("no engine function registered at index {registry_index}")),
            }
        } else {
            match self.functions.get_mut(registry_index as usize) {
                Some(f) => f(args),
                None => HostCall::Fail(format!("no context function registered at index {registry_index}")),
            }
        }
    }

    fn construct_extension(&mut self, type_name: &str, fields: &[(String, Value)]) -> Result<Box<dyn ExtensionState>, String> {
        match self.extension_factories.get_mut(type_name) {
            Some(factory) => factory.construct(fields),
            None => Err(format!("no extension factory registered for type '{type_name}'")),
        }
    }
}

/// Per-execution container (§4.10 "Context"). Holds the engine reference,
/// its own mutable collector and globals, the `Vm` that actually runs
/// bytecode, and the function/extension registries a host populates before
/// calling [`Context::initialize`].
pub struct Context<'e> {
    engine: &'e Engine,
    module: Rc<CompiledModule>,
    collector: Collector,
    globals: GlobalTable,
    vm: Vm,
    functions: Vec<Box<dyn FnMut(&[Value]) -> HostCall>>,
    extension_factories: AHashMap<String, Box<dyn ExtensionFactory>>,
    options: ContextOptions,
    interrupt: Arc<AtomicBool>,
}

impl<'e> Context<'e> {
    /// Builds a fresh `Context` against `module`, seeded with `engine`'s
    /// globals and functions. Does **not** run the module's init procedure
    /// — a host registers whatever extension factories/functions the init
    /// procedure's extension literals and global initializers need first,
    /// then calls [`Context::initialize`] explicitly (see DESIGN.md).
    pub fn new(engine: &'e Engine, module: Rc<CompiledModule>, options: ContextOptions) -> Self {
        let mut globals = GlobalTable::new();
        for (name, value) in engine.globals.iter() {
            globals.set(name.to_string(), value);
        }
        Self {
            engine,
            module,
            collector: Collector::new_context(options.gc),
            globals,
            vm: Vm::with_limits(options.frame_depth_ceiling, options.list_max_len),
            functions: Vec::new(),
            extension_factories: AHashMap::default(),
            options,
            interrupt: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Runs `action` against the context's `Vm`, `LoadedModule`, `Heaps`,
    /// globals, and a freshly-built `Host` adapter, borrowing every field it
    /// needs directly so the borrow checker sees them as disjoint.
    fn with_vm<R>(
        &mut self,
        action: impl FnOnce(&mut Vm, &LoadedModule<'_>, &mut crate::heap::Heaps<'_>, &mut GlobalTable, &mut dyn Host) -> R,
    ) -> R {
        let loaded = LoadedModule { procedures: &self.module.procedures };
        let mut heaps = crate::heap::Heaps { context: &mut self.collector, engine: self.engine.collector() };
        let mut host =
            HostAdapter { engine: self.engine, functions: &mut self.functions, extension_factories: &mut self.extension_factories };
        action(&mut self.vm, &loaded, &mut heaps, &mut self.globals, &mut host)
    }

    /// Runs the module's synthetic init procedure: extension instantiation,
    /// ACL compilation, global initializers, and named-sub self-registration
    /// (§4.7 "compile_unit"), in source order.
    pub fn initialize(&mut self) -> RunStatus {
        let init_index = self.module.init_index;
        let budget = self.options.default_instruction_budget;
        self.with_vm(|vm, loaded, heaps, globals, host| {
            vm.invoke(loaded, heaps, globals, host, &mut NoopTracer, init_index, &[], budget, None)
        })
    }

    /// Invokes the subroutine registered under `name` (§4.5 "sub"). Fails
    /// if no global of that name holds a `SubRoutine`.
    pub fn invoke(&mut self, name: &str, args: &[Value]) -> RunStatus {
        let Some(callee) = self.globals.get(name) else {
            return RunStatus::Fail(RuntimeFailure { message: format!("'{name}' is not defined"), trace: Vec::new() });
        };
        self.invoke_value(callee, args)
    }

    /// Invokes a `SubRoutine` value directly, e.g. one read back out of a
    /// global or a list rather than looked up by name.
    pub fn invoke_value(&mut self, callee: Value, args: &[Value]) -> RunStatus {
        let budget = self.options.default_instruction_budget;
        let interrupt = Arc::clone(&self.interrupt);
        self.with_vm(|vm, loaded, heaps, globals, host| {
            let procedure_index = match callee {
                Value::SubRoutine(id) => match heaps.get(id) {
                    Object::SubRoutine(sub) => sub.procedure_index,
                    _ => unreachable!("SubRoutine Value must point at an Object::SubRoutine"),
                },
                other => {
                    return RunStatus::Fail(RuntimeFailure {
                        message: format!("cannot invoke a {} as a subroutine", other.type_name()),
                        trace: Vec::new(),
                    });
                }
            };
            vm.invoke(loaded, heaps, globals, host, &mut NoopTracer, procedure_index, args, budget, Some(interrupt.as_ref()))
        })
    }

    /// Continues a yielded call (§5 "Suspension"). `resume_value` becomes
    /// the value the suspended host-function `Call` observes as its result.
    pub fn resume(&mut self, resume_value: Option<Value>) -> RunStatus {
        let budget = self.options.default_instruction_budget;
        let interrupt = Arc::clone(&self.interrupt);
        self.with_vm(|vm, loaded, heaps, globals, host| {
            vm.resume(loaded, heaps, globals, host, &mut NoopTracer, resume_value, budget, Some(interrupt.as_ref()))
        })
    }

    pub fn is_yielded(&self) -> bool {
        self.vm.is_yielded()
    }

    /// A cloneable handle another thread can use to request this context
    /// yield at its next dispatch (§5 "Preemption").
    pub fn yield_handle(&self) -> YieldHandle {
        YieldHandle(Arc::clone(&self.interrupt))
    }

    pub fn get_global(&self, name: &str) -> Option<Value> {
        self.globals.get(name)
    }

    pub fn set_global(&mut self, name: impl Into<String>, value: Value) {
        self.globals.set(name, value);
    }

    /// Registers a function callable from script as `name`, shadowing any
    /// engine-level function or global of the same name in this context.
    pub fn register_function(
        &mut self,
        name: impl Into<String>,
        f: impl FnMut(&[Value]) -> HostCall + 'static,
    ) -> Result<Value, String> {
        let registry_index = self.functions.len() as u32;
        self.functions.push(Box::new(f));
        let id = self.collector.alloc(Object::Function(FunctionObj { registry_index, from_engine: false }))?;
        let value = Value::Function(id);
        self.globals.set(name, value);
        Ok(value)
    }

    pub fn register_extension_factory(&mut self, type_name: impl Into<String>, factory: impl ExtensionFactory + 'static) {
        self.extension_factories.insert(type_name.into(), Box::new(factory));
    }

    /// Allocates a string onto this context's collector, for host functions
    /// that need to hand a `Value::String` back to script.
    pub fn alloc_string(&mut self, s: impl Into<String>) -> Result<Value, String> {
        let id = self.collector.alloc(Object::Str(crate::object::StrObj::new(s.into())))?;
        Ok(Value::String(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc as StdRc;

    struct OneFile(&'static str);
    impl crate::source_repo::SourceLoader for OneFile {
        fn load(&self, _path: &Path) -> std::io::Result<String> {
            Ok(self.0.to_string())
        }
    }

    fn build_context(engine: &Engine, src: &'static str) -> Context<'_> {
        let repo = SourceRepo::new(Box::new(OneFile(src)), false, 16);
        let module = engine.load(&repo, "main.vcl", None).unwrap();
        Context::new(engine, module, ContextOptions::default())
    }

    #[test]
    fn init_registers_named_subs_as_globals() {
        let engine = Engine::new();
        let mut ctx = build_context(&engine, "vcl 4.0; sub vcl_recv { return(ok); }");
        let status = ctx.initialize();
        assert!(matches!(status, RunStatus::Ok(_)));
        assert!(matches!(ctx.get_global("vcl_recv"), Some(Value::SubRoutine(_))));
    }

    #[test]
    fn invoking_a_registered_sub_runs_it() {
        let engine = Engine::new();
        let mut ctx = build_context(&engine, "vcl 4.0; sub vcl_recv { return(ok); }");
        ctx.initialize();
        let status = ctx.invoke("vcl_recv", &[]);
        match status {
            RunStatus::Terminate(_) => {}
            other => panic!("expected a terminal action, got {other:?}"),
        }
    }

    #[test]
    fn invoking_an_undefined_name_fails() {
        let engine = Engine::new();
        let mut ctx = build_context(&engine, "vcl 4.0;");
        ctx.initialize();
        let status = ctx.invoke("nope", &[]);
        assert!(matches!(status, RunStatus::Fail(_)));
    }

    #[test]
    fn registered_function_is_reachable_as_a_global() {
        let engine = Engine::new();
        let mut ctx = build_context(&engine, "vcl 4.0;");
        let calls = StdRc::new(RefCell::new(0));
        let calls_inner = StdRc::clone(&calls);
        ctx.register_function("ping", move |_args| {
            *calls_inner.borrow_mut() += 1;
            HostCall::Ok(Value::Bool(true))
        })
        .unwrap();
        assert!(matches!(ctx.get_global("ping"), Some(Value::Function(_))));
    }

    #[test]
    fn engine_level_function_is_visible_to_a_fresh_context() {
        let mut engine = Engine::new();
        engine.register_function("ping", |_args| HostCall::Ok(Value::Bool(true))).unwrap();
        let ctx = build_context(&engine, "vcl 4.0;");
        assert!(matches!(ctx.get_global("ping"), Some(Value::Function(_))));
    }
}
