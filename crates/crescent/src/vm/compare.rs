//! Ordering comparisons for the conditional-jump opcodes.

use super::Vm;
use crate::error::RuntimeError;
use crate::value::Value;

impl Vm<'_> {
    /// `lhs < rhs`. Numbers compare numerically, strings byte-wise;
    /// anything else is a type error.
    pub(super) fn less_than(&self, lhs: &Value, rhs: &Value) -> Result<bool, RuntimeError> {
        match (lhs, rhs) {
            (Value::Number(a), Value::Number(b)) => Ok(a < b),
            (Value::Str(a), Value::Str(b)) => Ok(a.as_str() < b.as_str()),
            _ => Err(compare_error(lhs, rhs)),
        }
    }

    /// `lhs <= rhs`.
    pub(super) fn less_equal(&self, lhs: &Value, rhs: &Value) -> Result<bool, RuntimeError> {
        match (lhs, rhs) {
            (Value::Number(a), Value::Number(b)) => Ok(a <= b),
            (Value::Str(a), Value::Str(b)) => Ok(a.as_str() <= b.as_str()),
            _ => Err(compare_error(lhs, rhs)),
        }
    }
}

fn compare_error(lhs: &Value, rhs: &Value) -> RuntimeError {
    RuntimeError::type_error(format!(
        "attempt to compare {} with {}",
        lhs.type_name(),
        rhs.type_name()
    ))
}
