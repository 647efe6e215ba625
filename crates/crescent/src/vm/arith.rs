//! Arithmetic helpers for the dispatch loop.

use super::Vm;
use crate::error::RuntimeError;
use crate::opcode::Opcode;
use crate::value::{Value, Vector};

/// The arithmetic operation behind the register-register, register-K and
/// K-register opcode flavors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    IDiv,
}

impl ArithOp {
    /// Only called from the arithmetic opcode arms of the dispatch loop.
    pub(super) fn from_opcode(op: Opcode) -> Self {
        match op {
            Opcode::Add | Opcode::AddK => Self::Add,
            Opcode::Sub | Opcode::SubK | Opcode::SubRK => Self::Sub,
            Opcode::Mul | Opcode::MulK => Self::Mul,
            Opcode::Div | Opcode::DivK | Opcode::DivRK => Self::Div,
            Opcode::Mod | Opcode::ModK => Self::Mod,
            Opcode::Pow | Opcode::PowK => Self::Pow,
            // IDIV and IDIVK are the only other arithmetic opcodes.
            _ => Self::IDiv,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Sub => "sub",
            Self::Mul => "mul",
            Self::Div => "div",
            Self::Mod => "mod",
            Self::Pow => "pow",
            Self::IDiv => "idiv",
        }
    }

    fn apply(self, a: f64, b: f64) -> f64 {
        match self {
            Self::Add => a + b,
            Self::Sub => a - b,
            Self::Mul => a * b,
            Self::Div => a / b,
            // Floored modulo, so the result takes the divisor's sign.
            Self::Mod => a - (a / b).floor() * b,
            Self::Pow => a.powf(b),
            Self::IDiv => (a / b).floor(),
        }
    }
}

impl Vm<'_> {
    /// Binary arithmetic with numeric-string coercion and vector support.
    pub(super) fn arith(
        &self,
        op: ArithOp,
        lhs: &Value,
        rhs: &Value,
    ) -> Result<Value, RuntimeError> {
        if let (Some(a), Some(b)) = (lhs.coerce_number(), rhs.coerce_number()) {
            return Ok(Value::Number(op.apply(a, b)));
        }
        match (lhs, rhs) {
            (Value::Vector(a), Value::Vector(b))
                if matches!(
                    op,
                    ArithOp::Add | ArithOp::Sub | ArithOp::Mul | ArithOp::Div | ArithOp::IDiv
                ) =>
            {
                Ok(Value::Vector(Vector {
                    x: op.apply(f64::from(a.x), f64::from(b.x)) as f32,
                    y: op.apply(f64::from(a.y), f64::from(b.y)) as f32,
                    z: op.apply(f64::from(a.z), f64::from(b.z)) as f32,
                    w: op.apply(f64::from(a.w), f64::from(b.w)) as f32,
                }))
            }
            (Value::Vector(v), Value::Number(n))
                if matches!(op, ArithOp::Mul | ArithOp::Div | ArithOp::IDiv) =>
            {
                Ok(Value::Vector(scale(op, *v, *n, false)))
            }
            (Value::Number(n), Value::Vector(v))
                if matches!(op, ArithOp::Mul | ArithOp::Div | ArithOp::IDiv) =>
            {
                Ok(Value::Vector(scale(op, *v, *n, true)))
            }
            _ => Err(RuntimeError::type_error(format!(
                "attempt to perform arithmetic ({}) on a {} and a {} value",
                op.name(),
                lhs.type_name(),
                rhs.type_name()
            ))),
        }
    }

    /// Unary minus.
    pub(super) fn negate(&self, value: &Value) -> Result<Value, RuntimeError> {
        if let Some(n) = value.coerce_number() {
            return Ok(Value::Number(-n));
        }
        if let Value::Vector(v) = value {
            return Ok(Value::Vector(Vector {
                x: -v.x,
                y: -v.y,
                z: -v.z,
                w: -v.w,
            }));
        }
        Err(RuntimeError::type_error(format!(
            "attempt to perform arithmetic (unm) on a {} value",
            value.type_name()
        )))
    }
}

fn scale(op: ArithOp, v: Vector, n: f64, number_on_left: bool) -> Vector {
    let apply = |lane: f32| {
        if number_on_left {
            op.apply(n, f64::from(lane)) as f32
        } else {
            op.apply(f64::from(lane), n) as f32
        }
    };
    Vector {
        x: apply(v.x),
        y: apply(v.y),
        z: apply(v.z),
        w: apply(v.w),
    }
}
