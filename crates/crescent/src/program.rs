//! A loaded module linked to a host environment: the unit of execution.
//!
//! `Program` owns the decoded module, the settings, the import
//! pre-resolution cache and the liveness flag. Calling it runs the main
//! prototype under the protected boundary (when `error_handling` is on):
//! failures first reach the panic hook, then surface as a formatted
//! diagnostic naming the faulting prototype, program counter and opcode.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use ahash::AHashMap;

use crate::closure::LuaClosure;
use crate::error::{CallError, Diagnostic, Faulted, LoadError, RuntimeError};
use crate::host::Settings;
use crate::module::{Constant, ImportPath, KSlot, Module, Proto};
use crate::string::{LuaStr, StringTable};
use crate::table::Table;
use crate::value::Value;
use crate::vm::Vm;

/// A module bound to an environment and settings, ready to run.
#[derive(Debug)]
pub struct Program {
    pub(crate) module: Module,
    pub(crate) env: Rc<RefCell<Table>>,
    pub(crate) settings: Settings,
    pub(crate) alive: Rc<Cell<bool>>,
    /// Pre-resolved GETIMPORT values, per prototype, keyed by the
    /// instruction's code position. Populated only when
    /// `use_import_constants` is set; misses fall back to the runtime walk.
    import_cache: Vec<AHashMap<usize, Value>>,
    /// COVERAGE counters, per prototype, one slot per code position.
    coverage: Vec<Vec<Cell<u32>>>,
}

impl Program {
    /// Decodes and links a binary module in one step.
    pub fn load(
        bytes: &[u8],
        env: Rc<RefCell<Table>>,
        settings: Settings,
    ) -> Result<Self, LoadError> {
        Ok(Self::link(Module::load(bytes)?, env, settings))
    }

    /// Links an already decoded module (for example one revived through
    /// serde) to an environment and settings.
    #[must_use]
    pub fn link(module: Module, env: Rc<RefCell<Table>>, settings: Settings) -> Self {
        let import_cache = resolve_imports(&module, &settings);
        let coverage = module
            .protos
            .iter()
            .map(|p| vec![Cell::new(0); p.code.len()])
            .collect();
        Self {
            module,
            env,
            settings,
            alive: Rc::new(Cell::new(true)),
            import_cache,
            coverage,
        }
    }

    /// Runs the main prototype. This is the module's entry point.
    pub fn call(&self, args: &[Value]) -> Result<Vec<Value>, CallError> {
        if !self.alive.get() {
            return Ok(Vec::new());
        }
        let main = LuaClosure::new(self.module.main_proto, Vec::new());
        let vm = Vm::new(self);
        self.finish(vm.execute(main, args))
    }

    /// Calls a function value produced by the script (or a host
    /// function), under the same error-handling policy as [`call`].
    ///
    /// [`call`]: Self::call
    pub fn call_value(&self, func: &Value, args: &[Value]) -> Result<Vec<Value>, CallError> {
        if !self.alive.get() {
            return Ok(Vec::new());
        }
        match func {
            Value::Closure(closure) => {
                let vm = Vm::new(self);
                self.finish(vm.execute(closure.clone(), args))
            }
            Value::Native(native) => {
                self.finish(native.call(args).map_err(|error| Faulted {
                    error,
                    debug_name: native.name().to_owned(),
                    pc: 0,
                    opname: "NONE",
                }))
            }
            other => self.finish(Err(Faulted {
                error: RuntimeError::type_error(format!(
                    "attempt to call a {} value",
                    other.type_name()
                )),
                debug_name: "(??)".to_owned(),
                pc: 0,
                opname: "NONE",
            })),
        }
    }

    fn finish(&self, result: Result<Vec<Value>, Faulted>) -> Result<Vec<Value>, CallError> {
        match result {
            Ok(values) => Ok(values),
            Err(fault) => {
                if self.settings.error_handling {
                    if let Some(panic) = &self.settings.hooks.panic {
                        panic(&fault.error);
                    }
                    let message = fault.error.render(self.settings.allow_proxy_errors);
                    Err(CallError::Faulted(Diagnostic {
                        debug_name: fault.debug_name,
                        pc: fault.pc,
                        opname: fault.opname,
                        message,
                    }))
                } else {
                    Err(CallError::Runtime(fault.error))
                }
            }
        }
    }

    /// A handle that cancels execution from outside the dispatch loop.
    #[must_use]
    pub fn kill_switch(&self) -> KillSwitch {
        KillSwitch(self.alive.clone())
    }

    /// The decoded module.
    #[must_use]
    pub fn module(&self) -> &Module {
        &self.module
    }

    /// The global environment table.
    #[must_use]
    pub fn env(&self) -> &Rc<RefCell<Table>> {
        &self.env
    }

    /// COVERAGE counters for one prototype, by code position.
    #[must_use]
    pub fn coverage(&self, proto: u32) -> Option<Vec<u32>> {
        self.coverage
            .get(proto as usize)
            .map(|slots| slots.iter().map(Cell::get).collect())
    }

    pub(crate) fn import_value(&self, proto: u32, pc: usize) -> Option<Value> {
        self.import_cache.get(proto as usize)?.get(&pc).cloned()
    }

    pub(crate) fn bump_coverage(&self, proto: u32, pc: usize) {
        if let Some(slot) = self
            .coverage
            .get(proto as usize)
            .and_then(|slots| slots.get(pc))
        {
            slot.set(slot.get().saturating_add(1));
        }
    }
}

/// Cooperative shutdown handle. Cloneable; all clones share the flag.
#[derive(Debug, Clone)]
pub struct KillSwitch(Rc<Cell<bool>>);

impl KillSwitch {
    /// Asks the interpreter to stop. The current instruction completes,
    /// then the dispatch loop exits cleanly, closing upvalues and
    /// iterators.
    pub fn shutdown(&self) {
        self.0.set(false);
    }

    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.0.get()
    }
}

/// Eagerly resolves GETIMPORT chains against the static environment.
/// Chains the static environment cannot resolve cleanly are left uncached
/// so the runtime walk reports the error instead.
fn resolve_imports(module: &Module, settings: &Settings) -> Vec<AHashMap<usize, Value>> {
    let mut cache: Vec<AHashMap<usize, Value>> =
        module.protos.iter().map(|_| AHashMap::new()).collect();
    if !settings.use_import_constants {
        return cache;
    }
    let Some(static_env) = settings.static_environment.clone() else {
        return cache;
    };
    for (pid, proto) in module.protos.iter().enumerate() {
        for (pc, inst) in proto.code.iter().enumerate() {
            let KSlot::Import(path) = inst.k else { continue };
            if let Some(value) = resolve_static(&static_env, proto, path, &module.strings) {
                cache[pid].insert(pc, value);
            }
        }
    }
    cache
}

fn resolve_static(
    env: &Rc<RefCell<Table>>,
    proto: &Proto,
    path: ImportPath,
    strings: &StringTable,
) -> Option<Value> {
    let segment = |index: u16| -> Option<LuaStr> {
        match proto.constants.get(usize::from(index))? {
            Constant::Str(wire) => strings.get(*wire).cloned(),
            _ => None,
        }
    };
    let mut value = env.borrow().get_str(&segment(path.ids[0])?);
    for step in 1..usize::from(path.count.min(3)) {
        if value.is_nil() {
            break;
        }
        let key = segment(path.ids[step])?;
        value = match &value {
            Value::Table(t) => t.borrow().get_str(&key),
            _ => return None,
        };
    }
    Some(value)
}
