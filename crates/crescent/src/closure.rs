//! Callable values: scripted closures and host functions.

use std::fmt;
use std::rc::Rc;

use crate::error::RuntimeError;
use crate::upvalue::UpvalueCell;
use crate::value::Value;

/// A prototype bound to its captured upvalues.
///
/// The prototype itself lives in the module; the closure only carries the
/// module index, which breaks the ownership cycle between prototypes and
/// the closures they spawn.
#[derive(Debug)]
pub struct LuaClosure {
    /// Module prototype index.
    pub proto_id: u32,
    /// Captured cells, in capture order.
    pub upvalues: Vec<Rc<UpvalueCell>>,
}

impl LuaClosure {
    #[must_use]
    pub fn new(proto_id: u32, upvalues: Vec<Rc<UpvalueCell>>) -> Rc<Self> {
        Rc::new(Self { proto_id, upvalues })
    }
}

/// An opaque callable supplied by the host environment.
pub struct NativeFn {
    name: String,
    func: Box<dyn Fn(&[Value]) -> Result<Vec<Value>, RuntimeError>>,
}

impl NativeFn {
    pub fn new(
        name: &str,
        f: impl Fn(&[Value]) -> Result<Vec<Value>, RuntimeError> + 'static,
    ) -> Self {
        Self {
            name: name.to_owned(),
            func: Box::new(f),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Invokes the host function. Runs to completion before the VM
    /// executes its next instruction.
    pub fn call(&self, args: &[Value]) -> Result<Vec<Value>, RuntimeError> {
        (self.func)(args)
    }
}

impl fmt::Debug for NativeFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NativeFn({})", self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn native_functions_forward_results() {
        let double = NativeFn::new("double", |args| {
            let n = args[0].as_number().unwrap_or(0.0);
            Ok(vec![Value::Number(n * 2.0)])
        });
        assert_eq!(
            double.call(&[Value::Number(21.0)]).unwrap(),
            vec![Value::Number(42.0)]
        );
        assert_eq!(double.name(), "double");
    }
}
