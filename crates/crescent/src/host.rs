//! The host interface: everything the embedding application can inject
//! into the interpreter.
//!
//! The host supplies the global environment table separately (at
//! [`crate::Program::load`]); `Settings` carries the remaining knobs:
//! vector construction, the namecall fast path, extension globals, call
//! hooks, error handling policy, and import pre-resolution.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use ahash::AHashMap;

use crate::error::RuntimeError;
use crate::module::{Module, Proto};
use crate::string::LuaStr;
use crate::table::Table;
use crate::upvalue::UpvalueCell;
use crate::value::{Value, Vector};

/// Number of meaningful lanes in a vector value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub enum VectorSize {
    Three,
    #[default]
    Four,
}

impl VectorSize {
    #[must_use]
    pub fn lanes(self) -> usize {
        match self {
            Self::Three => 3,
            Self::Four => 4,
        }
    }
}

/// Builds a vector value from 3 or 4 floats (per [`VectorSize`]).
pub type VectorCtor = Rc<dyn Fn(&[f32]) -> Value>;

/// Outcome of a native namecall dispatch.
pub enum Namecall {
    /// The handler performed the call; these are its results.
    Handled(Vec<Value>),
    /// Fall back to the ordinary method lookup and CALL.
    Unhandled,
}

/// Native dispatcher for method-style calls. Receives the receiver, the
/// method name and the call arguments (the receiver is also `args[0]`).
pub type NamecallHandler =
    Rc<dyn Fn(&Value, &LuaStr, &[Value]) -> Result<Namecall, RuntimeError>>;

/// Context handed to step and break hooks.
pub struct HookCtx<'a> {
    /// 1-based program counter of the instruction about to execute.
    pub pc: usize,
    pub module: &'a Module,
    pub proto: &'a Proto,
    pub debug_name: &'a str,
    /// The live register stack of the current frame.
    pub stack: &'a Rc<RefCell<Vec<Value>>>,
    /// The current closure's captured cells.
    pub upvalues: &'a [Rc<UpvalueCell>],
}

/// Callback bundle invoked synchronously between instructions.
///
/// * `step` fires before each executed instruction.
/// * `break_hook` fires on BREAK.
/// * `interrupt` fires before CALL, RETURN, JUMPBACK, JUMPX and each
///   FORNLOOP/FORGLOOP iteration — every point that can loop.
/// * `panic` fires once at protected-call failure, before the diagnostic
///   surfaces.
#[derive(Clone, Default)]
pub struct Hooks {
    pub step: Option<Rc<dyn Fn(&HookCtx<'_>)>>,
    pub break_hook: Option<Rc<dyn Fn(&HookCtx<'_>)>>,
    pub interrupt: Option<Rc<dyn Fn(&HookCtx<'_>)>>,
    pub panic: Option<Rc<dyn Fn(&RuntimeError)>>,
}

impl fmt::Debug for Hooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hooks")
            .field("step", &self.step.is_some())
            .field("break_hook", &self.break_hook.is_some())
            .field("interrupt", &self.interrupt.is_some())
            .field("panic", &self.panic.is_some())
            .finish()
    }
}

/// Interpreter configuration.
#[derive(Clone)]
pub struct Settings {
    /// Lane count for vector constants and the vector constructor.
    pub vector_size: VectorSize,
    /// Custom vector constructor; defaults to the built-in vector value.
    pub vector_ctor: Option<VectorCtor>,
    /// Enables the native namecall fast path.
    pub use_native_namecall: bool,
    pub namecall_handler: Option<NamecallHandler>,
    /// Globals that shadow the environment on GETGLOBAL and GETIMPORT.
    pub extensions: AHashMap<String, Value>,
    pub hooks: Hooks,
    /// Wrap each top-level call in a protected boundary.
    pub error_handling: bool,
    /// Allow generic `for` over non-function iterables.
    pub generalized_iteration: bool,
    /// Surface non-string error payloads verbatim instead of coercing
    /// them to their type tag.
    pub allow_proxy_errors: bool,
    /// Resolve import chains against `static_environment` at load time.
    pub use_import_constants: bool,
    /// Lookup root for import pre-resolution.
    pub static_environment: Option<Rc<RefCell<Table>>>,
    /// Receives diagnostic strings the interpreter would otherwise drop
    /// (unknown opcodes, BREAK without a break hook).
    pub warn: Option<Rc<dyn Fn(&str)>>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            vector_size: VectorSize::default(),
            vector_ctor: None,
            use_native_namecall: false,
            namecall_handler: None,
            extensions: AHashMap::new(),
            hooks: Hooks::default(),
            error_handling: true,
            generalized_iteration: true,
            allow_proxy_errors: false,
            use_import_constants: false,
            static_environment: None,
            warn: None,
        }
    }
}

impl fmt::Debug for Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Settings")
            .field("vector_size", &self.vector_size)
            .field("use_native_namecall", &self.use_native_namecall)
            .field("extensions", &self.extensions.len())
            .field("hooks", &self.hooks)
            .field("error_handling", &self.error_handling)
            .field("generalized_iteration", &self.generalized_iteration)
            .field("allow_proxy_errors", &self.allow_proxy_errors)
            .field("use_import_constants", &self.use_import_constants)
            .finish_non_exhaustive()
    }
}

impl Settings {
    /// Builds a vector value through the configured constructor.
    pub(crate) fn make_vector(&self, lanes: [f32; 4]) -> Value {
        let n = self.vector_size.lanes();
        match &self.vector_ctor {
            Some(ctor) => ctor(&lanes[..n]),
            None => Value::Vector(Vector {
                x: lanes[0],
                y: lanes[1],
                z: lanes[2],
                w: if n == 4 { lanes[3] } else { 0.0 },
            }),
        }
    }

    /// Emits a dropped-diagnostic string to the host, if it listens.
    pub(crate) fn emit_warning(&self, message: &str) {
        if let Some(warn) = &self.warn {
            warn(message);
        }
    }
}
