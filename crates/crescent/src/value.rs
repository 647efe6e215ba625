//! The runtime value union.
//!
//! Small values (nil, booleans, numbers, vectors) are stored inline;
//! strings are shared handles; tables, closures and host functions are
//! reference-counted so cloning a `Value` is always cheap.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use crate::closure::{LuaClosure, NativeFn};
use crate::string::LuaStr;
use crate::table::Table;

/// A 3- or 4-lane float vector. The fourth lane is zero when the host
/// configures 3-wide vectors.
#[derive(Debug, Clone, Copy, PartialEq, Default, serde::Serialize, serde::Deserialize)]
pub struct Vector {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub w: f32,
}

/// A runtime value.
#[derive(Debug, Clone, Default)]
pub enum Value {
    #[default]
    Nil,
    Bool(bool),
    Number(f64),
    Str(LuaStr),
    Vector(Vector),
    Table(Rc<RefCell<Table>>),
    Closure(Rc<LuaClosure>),
    Native(Rc<NativeFn>),
}

impl Value {
    /// Creates a string value.
    pub fn str(s: &str) -> Self {
        Self::Str(LuaStr::new(s))
    }

    /// Wraps a table in a fresh shared handle.
    #[must_use]
    pub fn table(t: Table) -> Self {
        Self::Table(Rc::new(RefCell::new(t)))
    }

    /// Wraps a host function.
    pub fn native(
        name: &str,
        f: impl Fn(&[Value]) -> Result<Vec<Value>, crate::error::RuntimeError> + 'static,
    ) -> Self {
        Self::Native(Rc::new(NativeFn::new(name, f)))
    }

    #[must_use]
    pub fn is_nil(&self) -> bool {
        matches!(self, Self::Nil)
    }

    /// Language truthiness: everything except nil and false.
    #[must_use]
    pub fn truthy(&self) -> bool {
        !matches!(self, Self::Nil | Self::Bool(false))
    }

    /// The value's type tag, as surfaced in error messages.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Nil => "nil",
            Self::Bool(_) => "boolean",
            Self::Number(_) => "number",
            Self::Str(_) => "string",
            Self::Vector(_) => "vector",
            Self::Table(_) => "table",
            Self::Closure(_) | Self::Native(_) => "function",
        }
    }

    /// Raw (non-coercing) equality: numbers by value, strings by content,
    /// vectors componentwise, reference types by identity.
    #[must_use]
    pub fn raw_eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Nil, Self::Nil) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Number(a), Self::Number(b)) => a == b,
            (Self::Str(a), Self::Str(b)) => a == b,
            (Self::Vector(a), Self::Vector(b)) => a == b,
            (Self::Table(a), Self::Table(b)) => Rc::ptr_eq(a, b),
            (Self::Closure(a), Self::Closure(b)) => Rc::ptr_eq(a, b),
            (Self::Native(a), Self::Native(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// The number behind this value, without string coercion.
    #[must_use]
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// `tonumber` semantics: numbers pass through, numeric strings parse.
    #[must_use]
    pub fn coerce_number(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            Self::Str(s) => s.as_str().trim().parse::<f64>().ok(),
            _ => None,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.raw_eq(other)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Number(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::str(v)
    }
}

impl From<LuaStr> for Value {
    fn from(v: LuaStr) -> Self {
        Self::Str(v)
    }
}

/// Formats a number the way the language's `tostring` does: integral
/// values print without a fractional part.
pub(crate) fn format_number(n: f64) -> String {
    if n.is_infinite() {
        return if n > 0.0 { "inf" } else { "-inf" }.to_owned();
    }
    if n.is_nan() {
        return "nan".to_owned();
    }
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{n}")
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Nil => f.write_str("nil"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Number(n) => f.write_str(&format_number(*n)),
            Self::Str(s) => f.write_str(s),
            Self::Vector(v) => write!(f, "{}, {}, {}, {}", v.x, v.y, v.z, v.w),
            Self::Table(t) => write!(f, "table: {:p}", Rc::as_ptr(t)),
            Self::Closure(c) => write!(f, "function: {:p}", Rc::as_ptr(c)),
            Self::Native(n) => write!(f, "function: builtin: {}", n.name()),
        }
    }
}
