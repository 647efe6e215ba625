//! The dispatch loop.
//!
//! One frame per closure invocation. The program counter pre-increments
//! past the fetched instruction, so AUX-carrying handlers add one more
//! increment to skip the AUX slot, conditional jumps encode fall-through
//! as that same skip, and taken branches add the signed D/E delta to the
//! post-increment position.

mod arith;
mod compare;
mod iter;

use std::cell::Cell;
use std::rc::{Rc, Weak};

use ahash::AHashMap;

use crate::closure::LuaClosure;
use crate::error::{Faulted, RuntimeError};
use crate::host::{HookCtx, Namecall};
use crate::module::{Constant, Instruction, KSlot, Proto};
use crate::opcode::Opcode;
use crate::program::Program;
use crate::string::LuaStr;
use crate::table::Table;
use crate::upvalue::UpvalueCell;
use crate::value::{format_number, Value};

use arith::ArithOp;
use iter::GenIter;

/// Recursion guard for scripted calls.
const MAX_CALL_DEPTH: usize = 200;

/// Errors in flight inside the dispatch loop. `Here` is a failure raised
/// by the current frame and still needs fault-site information attached;
/// `Nested` already carries it from an inner frame.
pub(crate) enum VmError {
    Here(RuntimeError),
    Nested(Faulted),
}

impl From<RuntimeError> for VmError {
    fn from(e: RuntimeError) -> Self {
        Self::Here(e)
    }
}

/// Per-invocation state.
struct Frame {
    stack: Rc<std::cell::RefCell<Vec<Value>>>,
    varargs: Vec<Value>,
    /// 0-based index of the next instruction to fetch.
    pc: usize,
    /// High-water mark of live registers; only meaningful after a
    /// multi-return site.
    top: i64,
    /// Open cells by register, weak so a cell disappears with its last
    /// closure.
    open_upvalues: AHashMap<u8, Weak<UpvalueCell>>,
    /// Live generic-for iterators keyed by FORGLOOP position.
    iterators: AHashMap<usize, GenIter>,
    closure: Rc<LuaClosure>,
    /// Debug record: 1-based pc and mnemonic of the current instruction.
    debug_pc: usize,
    debug_op: &'static str,
}

impl Frame {
    fn reg_at(&self, index: usize) -> Value {
        self.stack
            .borrow()
            .get(index)
            .cloned()
            .unwrap_or(Value::Nil)
    }

    fn set_at(&self, index: usize, value: Value) {
        let mut stack = self.stack.borrow_mut();
        if index >= stack.len() {
            stack.resize(index + 1, Value::Nil);
        }
        stack[index] = value;
    }
}

fn jump(f: &mut Frame, delta: i64) {
    f.pc = usize::try_from(f.pc as i64 + delta).unwrap_or(usize::MAX);
}

/// Truncates or pads call results into registers starting at `a`,
/// honoring the multi-return encoding (`c == 0`).
fn splice_results(f: &mut Frame, a: usize, c: u8, results: &[Value]) {
    if c == 0 {
        for (i, v) in results.iter().enumerate() {
            f.set_at(a + i, v.clone());
        }
        f.top = a as i64 + results.len() as i64 - 1;
    } else {
        let want = usize::from(c) - 1;
        for i in 0..want {
            f.set_at(a + i, results.get(i).cloned().unwrap_or(Value::Nil));
        }
    }
}

pub(crate) struct Vm<'p> {
    program: &'p Program,
    depth: Cell<usize>,
}

impl<'p> Vm<'p> {
    pub(crate) fn new(program: &'p Program) -> Self {
        Self {
            program,
            depth: Cell::new(0),
        }
    }

    /// Invokes a scripted closure: fresh frame, parameter copy, surplus
    /// arguments captured as varargs, then the dispatch loop.
    pub(crate) fn execute(
        &self,
        closure: Rc<LuaClosure>,
        args: &[Value],
    ) -> Result<Vec<Value>, Faulted> {
        self.depth.set(self.depth.get() + 1);
        let result = self.execute_inner(&closure, args);
        self.depth.set(self.depth.get() - 1);
        result
    }

    fn execute_inner(
        &self,
        closure: &Rc<LuaClosure>,
        args: &[Value],
    ) -> Result<Vec<Value>, Faulted> {
        let program = self.program;
        let Some(proto) = program.module.protos.get(closure.proto_id as usize) else {
            return Err(Faulted {
                error: RuntimeError::type_error("closure prototype out of range"),
                debug_name: "(??)".to_owned(),
                pc: 0,
                opname: "NONE",
            });
        };
        let debug_name = proto.debug_name_str(&program.module.strings);

        if self.depth.get() > MAX_CALL_DEPTH {
            return Err(Faulted {
                error: RuntimeError::StackOverflow,
                debug_name: debug_name.to_owned(),
                pc: 0,
                opname: "NONE",
            });
        }

        let mut f = Frame {
            stack: Rc::new(std::cell::RefCell::new(vec![
                Value::Nil;
                usize::from(proto.max_stack_size)
            ])),
            varargs: args
                .get(usize::from(proto.num_params)..)
                .map(<[Value]>::to_vec)
                .unwrap_or_default(),
            pc: 0,
            top: -1,
            open_upvalues: AHashMap::new(),
            iterators: AHashMap::new(),
            closure: closure.clone(),
            debug_pc: 0,
            debug_op: "NONE",
        };
        {
            let mut stack = f.stack.borrow_mut();
            let n = usize::from(proto.num_params)
                .min(args.len())
                .min(stack.len());
            stack[..n].clone_from_slice(&args[..n]);
        }

        let result = loop {
            if !program.alive.get() {
                break Ok(Vec::new());
            }
            let Some(&inst) = proto.code.get(f.pc) else {
                // Ran off the end of the code: malformed input without a
                // RETURN. Exit cleanly with no results.
                break Ok(Vec::new());
            };
            f.pc += 1;
            f.debug_pc = f.pc;

            let Some(op) = inst.op else {
                program.settings.emit_warning(&format!(
                    "unknown opcode {:#04x} at {}:{}, skipping",
                    inst.raw_op, debug_name, f.debug_pc
                ));
                continue;
            };
            f.debug_op = op.name();

            if program.settings.hooks.step.is_some() {
                self.fire_hook(program.settings.hooks.step.clone(), proto, &f);
            }

            match self.step(proto, &mut f, inst, op) {
                Ok(None) => {}
                Ok(Some(values)) => break Ok(values),
                Err(e) => break Err(e),
            }
        };

        // Frame exit: every still-open cell closes, every live iterator
        // dies with the frame.
        for (_, weak) in f.open_upvalues.drain() {
            if let Some(cell) = weak.upgrade() {
                cell.close();
            }
        }
        f.iterators.clear();

        result.map_err(|e| match e {
            VmError::Nested(fault) => fault,
            VmError::Here(error) => Faulted {
                error,
                debug_name: debug_name.to_owned(),
                pc: f.debug_pc,
                opname: f.debug_op,
            },
        })
    }

    /// Executes one instruction. `Ok(Some(values))` is a RETURN.
    #[allow(clippy::too_many_lines)]
    fn step(
        &self,
        proto: &Proto,
        f: &mut Frame,
        inst: Instruction,
        op: Opcode,
    ) -> Result<Option<Vec<Value>>, VmError> {
        let settings = &self.program.settings;
        let a = usize::from(inst.a);
        let b = usize::from(inst.b);
        let c = usize::from(inst.c);

        match op {
            Opcode::Nop | Opcode::PrepVarargs | Opcode::NativeCall => {}

            Opcode::Break => {
                if settings.hooks.break_hook.is_some() {
                    self.fire_hook(settings.hooks.break_hook.clone(), proto, f);
                } else {
                    settings.emit_warning(&format!(
                        "BREAK at pc {} with no break hook installed",
                        f.debug_pc
                    ));
                }
            }

            Opcode::LoadNil => f.set_at(a, Value::Nil),
            Opcode::LoadB => {
                f.set_at(a, Value::Bool(inst.b != 0));
                f.pc += c;
            }
            Opcode::LoadN => f.set_at(a, Value::Number(f64::from(inst.d))),
            Opcode::LoadK => {
                let value = self.k_const_value(proto, &inst)?;
                f.set_at(a, value);
            }
            Opcode::LoadKX => {
                let value = self.k_const_value(proto, &inst)?;
                f.set_at(a, value);
                f.pc += 1;
            }
            Opcode::Move => f.set_at(a, f.reg_at(b)),

            Opcode::GetGlobal => {
                let name = self.k_str(proto, &inst)?;
                f.set_at(a, self.global_read(&name));
                f.pc += 1;
            }
            Opcode::SetGlobal => {
                let name = self.k_str(proto, &inst)?;
                self.program.env.borrow_mut().set_str(&name, f.reg_at(a));
                f.pc += 1;
            }

            Opcode::GetUpval => {
                let cell = self.upvalue(f, b)?;
                f.set_at(a, cell.get());
            }
            Opcode::SetUpval => {
                let cell = self.upvalue(f, b)?;
                cell.set(f.reg_at(a));
            }
            Opcode::CloseUpvals => {
                f.open_upvalues.retain(|&reg, weak| {
                    if usize::from(reg) >= a {
                        if let Some(cell) = weak.upgrade() {
                            cell.close();
                        }
                        false
                    } else {
                        true
                    }
                });
            }

            Opcode::GetImport => {
                let value = if settings.use_import_constants {
                    match self.program.import_value(proto.bytecode_id, f.pc - 1) {
                        Some(v) => v,
                        None => self.walk_import(proto, &inst)?,
                    }
                } else {
                    self.walk_import(proto, &inst)?
                };
                f.set_at(a, value);
                f.pc += 1;
            }

            Opcode::GetTable => {
                let value = self.index_value(&f.reg_at(b), &f.reg_at(c))?;
                f.set_at(a, value);
            }
            Opcode::SetTable => {
                self.newindex_value(&f.reg_at(b), f.reg_at(c), f.reg_at(a))?;
            }
            Opcode::GetTableKS => {
                let key = self.k_str(proto, &inst)?;
                let value = self.index_value(&f.reg_at(b), &Value::Str(key))?;
                f.set_at(a, value);
                f.pc += 1;
            }
            Opcode::SetTableKS => {
                let key = self.k_str(proto, &inst)?;
                self.newindex_value(&f.reg_at(b), Value::Str(key), f.reg_at(a))?;
                f.pc += 1;
            }
            Opcode::GetTableN => {
                let value = self.index_int(&f.reg_at(b), inst.c as i64 + 1)?;
                f.set_at(a, value);
            }
            Opcode::SetTableN => {
                let base = f.reg_at(b);
                let Value::Table(t) = &base else {
                    return Err(index_error(&base).into());
                };
                t.borrow_mut().set_int(inst.c as i64 + 1, f.reg_at(a));
            }

            Opcode::NewClosure => {
                let child = usize::try_from(inst.d)
                    .ok()
                    .and_then(|i| proto.protos.get(i).copied())
                    .ok_or_else(|| {
                        RuntimeError::type_error("closure prototype index out of range")
                    })?;
                let closure = self.make_closure(proto, f, child, true)?;
                f.set_at(a, closure);
            }
            Opcode::DupClosure => {
                let KSlot::Const(idx) = inst.k else {
                    return Err(malformed_k().into());
                };
                let Some(Constant::Closure(child)) = proto.constants.get(idx as usize) else {
                    return Err(
                        RuntimeError::type_error("DUPCLOSURE expects a closure constant").into(),
                    );
                };
                let closure = self.make_closure(proto, f, *child, false)?;
                f.set_at(a, closure);
            }

            Opcode::Namecall => {
                let receiver = f.reg_at(b);
                f.set_at(a + 1, receiver.clone());
                let method = self.k_str(proto, &inst)?;

                let mut handled = false;
                if settings.use_native_namecall {
                    if let Some(handler) = settings.namecall_handler.clone() {
                        // The instruction after the AUX slot must be the
                        // CALL this NAMECALL feeds.
                        let call_inst = proto
                            .code
                            .get(f.pc + 1)
                            .copied()
                            .filter(|ci| ci.op == Some(Opcode::Call));
                        if let Some(call_inst) = call_inst {
                            let ca = usize::from(call_inst.a);
                            let nargs = if call_inst.b == 0 {
                                (f.top - ca as i64).max(0) as usize
                            } else {
                                usize::from(call_inst.b) - 1
                            };
                            let call_args: Vec<Value> =
                                (0..nargs).map(|i| f.reg_at(ca + 1 + i)).collect();
                            match handler(&receiver, &method, &call_args)
                                .map_err(VmError::Here)?
                            {
                                Namecall::Handled(results) => {
                                    splice_results(f, ca, call_inst.c, &results);
                                    f.pc += 2; // skip AUX and the CALL
                                    handled = true;
                                }
                                Namecall::Unhandled => {}
                            }
                        }
                    }
                }
                if !handled {
                    let looked_up = self.index_value(&receiver, &Value::Str(method))?;
                    f.set_at(a, looked_up);
                    f.pc += 1;
                }
            }

            Opcode::Call => {
                self.fire_hook(settings.hooks.interrupt.clone(), proto, f);
                let nargs = if inst.b == 0 {
                    (f.top - a as i64).max(0) as usize
                } else {
                    b - 1
                };
                let func = f.reg_at(a);
                let args: Vec<Value> = (0..nargs).map(|i| f.reg_at(a + 1 + i)).collect();
                let results = self.call_any(&func, &args)?;
                splice_results(f, a, inst.c, &results);
            }

            Opcode::Return => {
                self.fire_hook(settings.hooks.interrupt.clone(), proto, f);
                let n = if inst.b == 0 {
                    (f.top - a as i64 + 1).max(0) as usize
                } else {
                    b - 1
                };
                return Ok(Some((0..n).map(|i| f.reg_at(a + i)).collect()));
            }

            Opcode::Jump => jump(f, i64::from(inst.d)),
            Opcode::JumpBack => {
                self.fire_hook(settings.hooks.interrupt.clone(), proto, f);
                jump(f, i64::from(inst.d));
            }
            Opcode::JumpX => {
                self.fire_hook(settings.hooks.interrupt.clone(), proto, f);
                jump(f, i64::from(inst.e));
            }
            Opcode::JumpIf => {
                if f.reg_at(a).truthy() {
                    jump(f, i64::from(inst.d));
                }
            }
            Opcode::JumpIfNot => {
                if !f.reg_at(a).truthy() {
                    jump(f, i64::from(inst.d));
                }
            }

            Opcode::JumpIfEq | Opcode::JumpIfNotEq => {
                let eq = f.reg_at(a).raw_eq(&f.reg_at(inst.aux as usize));
                if eq == (op == Opcode::JumpIfEq) {
                    jump(f, i64::from(inst.d));
                } else {
                    f.pc += 1;
                }
            }
            Opcode::JumpIfLe | Opcode::JumpIfLt | Opcode::JumpIfNotLe | Opcode::JumpIfNotLt => {
                let lhs = f.reg_at(a);
                let rhs = f.reg_at(inst.aux as usize);
                let ord = match op {
                    Opcode::JumpIfLe | Opcode::JumpIfNotLe => self.less_equal(&lhs, &rhs)?,
                    _ => self.less_than(&lhs, &rhs)?,
                };
                let take = if matches!(op, Opcode::JumpIfNotLe | Opcode::JumpIfNotLt) {
                    !ord
                } else {
                    ord
                };
                if take {
                    jump(f, i64::from(inst.d));
                } else {
                    f.pc += 1;
                }
            }

            Opcode::JumpXEqKNil => {
                let eq = f.reg_at(a).is_nil();
                if eq != inst.kn {
                    jump(f, i64::from(inst.d));
                } else {
                    f.pc += 1;
                }
            }
            Opcode::JumpXEqKB => {
                let KSlot::Bool(kb) = inst.k else {
                    return Err(malformed_k().into());
                };
                let eq = f.reg_at(a).raw_eq(&Value::Bool(kb));
                if eq != inst.kn {
                    jump(f, i64::from(inst.d));
                } else {
                    f.pc += 1;
                }
            }
            Opcode::JumpXEqKN | Opcode::JumpXEqKS => {
                let kv = self.k_const_value(proto, &inst)?;
                let eq = f.reg_at(a).raw_eq(&kv);
                if eq != inst.kn {
                    jump(f, i64::from(inst.d));
                } else {
                    f.pc += 1;
                }
            }

            Opcode::Add
            | Opcode::Sub
            | Opcode::Mul
            | Opcode::Div
            | Opcode::Mod
            | Opcode::Pow
            | Opcode::IDiv => {
                let value =
                    self.arith(ArithOp::from_opcode(op), &f.reg_at(b), &f.reg_at(c))?;
                f.set_at(a, value);
            }
            Opcode::AddK
            | Opcode::SubK
            | Opcode::MulK
            | Opcode::DivK
            | Opcode::ModK
            | Opcode::PowK
            | Opcode::IDivK => {
                let kv = self.k_const_value(proto, &inst)?;
                let value = self.arith(ArithOp::from_opcode(op), &f.reg_at(b), &kv)?;
                f.set_at(a, value);
            }
            Opcode::SubRK | Opcode::DivRK => {
                // The constant is the left operand.
                let kv = self.k_const_value(proto, &inst)?;
                let value = self.arith(ArithOp::from_opcode(op), &kv, &f.reg_at(c))?;
                f.set_at(a, value);
            }

            Opcode::And | Opcode::AndK => {
                let lhs = f.reg_at(b);
                let value = if !lhs.truthy() {
                    lhs
                } else {
                    let rhs = if op == Opcode::And {
                        f.reg_at(c)
                    } else {
                        self.k_const_value(proto, &inst)?
                    };
                    // A falsey right operand canonicalizes to false.
                    if rhs.truthy() {
                        rhs
                    } else {
                        Value::Bool(false)
                    }
                };
                f.set_at(a, value);
            }
            Opcode::Or | Opcode::OrK => {
                let lhs = f.reg_at(b);
                let value = if lhs.truthy() {
                    lhs
                } else {
                    let rhs = if op == Opcode::Or {
                        f.reg_at(c)
                    } else {
                        self.k_const_value(proto, &inst)?
                    };
                    if rhs.truthy() {
                        rhs
                    } else {
                        Value::Bool(false)
                    }
                };
                f.set_at(a, value);
            }

            Opcode::Concat => {
                let mut out = String::new();
                for i in b..=c {
                    let v = f.reg_at(i);
                    match &v {
                        Value::Str(s) => out.push_str(s),
                        Value::Number(n) => out.push_str(&format_number(*n)),
                        other => {
                            return Err(RuntimeError::type_error(format!(
                                "attempt to concatenate a {} value",
                                other.type_name()
                            ))
                            .into())
                        }
                    }
                }
                f.set_at(a, Value::Str(LuaStr::from(out)));
            }

            Opcode::Not => f.set_at(a, Value::Bool(!f.reg_at(b).truthy())),
            Opcode::Minus => {
                let value = self.negate(&f.reg_at(b))?;
                f.set_at(a, value);
            }
            Opcode::Length => {
                let value = match f.reg_at(b) {
                    Value::Table(t) => Value::Number(t.borrow().len() as f64),
                    Value::Str(s) => Value::Number(s.len() as f64),
                    other => {
                        return Err(RuntimeError::type_error(format!(
                            "attempt to get length of a {} value",
                            other.type_name()
                        ))
                        .into())
                    }
                };
                f.set_at(a, value);
            }

            Opcode::NewTable => {
                f.set_at(a, Value::table(Table::with_capacity(inst.aux as usize, 0)));
                f.pc += 1;
            }
            Opcode::DupTable => {
                let KSlot::Const(idx) = inst.k else {
                    return Err(malformed_k().into());
                };
                let Some(Constant::Table(keys)) = proto.constants.get(idx as usize) else {
                    return Err(
                        RuntimeError::type_error("DUPTABLE expects a table constant").into()
                    );
                };
                // The key list is a shape hint; entries default to nil and
                // are filled by the SETTABLEKS instructions that follow.
                for &key in keys {
                    self.constant_str(proto, key)?;
                }
                f.set_at(a, Value::table(Table::with_capacity(0, keys.len())));
            }
            Opcode::SetList => {
                let count = if inst.c == 0 {
                    (f.top - b as i64 + 1).max(0) as usize
                } else {
                    c - 1
                };
                let base = f.reg_at(a);
                let Value::Table(t) = &base else {
                    return Err(index_error(&base).into());
                };
                {
                    let mut t = t.borrow_mut();
                    for i in 0..count {
                        t.set_int(i64::from(inst.aux) + i as i64, f.reg_at(b + i));
                    }
                }
                f.pc += 1;
            }

            Opcode::ForNPrep => {
                let limit = self.for_number(f, a, "'for' limit must be a number")?;
                let step = self.for_number(f, a + 1, "'for' step must be a number")?;
                let index = self.for_number(f, a + 2, "'for' initial value must be a number")?;
                let continues = if step > 0.0 {
                    index <= limit
                } else {
                    limit <= index
                };
                if !continues {
                    jump(f, i64::from(inst.d));
                }
            }
            Opcode::ForNLoop => {
                self.fire_hook(settings.hooks.interrupt.clone(), proto, f);
                let limit = require_number(&f.reg_at(a))?;
                let step = require_number(&f.reg_at(a + 1))?;
                let index = require_number(&f.reg_at(a + 2))? + step;
                f.set_at(a + 2, Value::Number(index));
                let continues = if step > 0.0 {
                    index <= limit
                } else {
                    limit <= index
                };
                if continues {
                    jump(f, i64::from(inst.d));
                }
            }

            Opcode::ForGPrep => {
                let iterator = f.reg_at(a);
                match iterator {
                    Value::Closure(_) | Value::Native(_) => {}
                    other => {
                        if settings.generalized_iteration {
                            let target = usize::try_from(f.pc as i64 + i64::from(inst.d))
                                .unwrap_or(usize::MAX);
                            f.iterators.insert(target, GenIter::new(&other)?);
                        } else {
                            return Err(iterate_error(&other).into());
                        }
                    }
                }
                jump(f, i64::from(inst.d));
            }
            Opcode::ForGLoop => {
                self.fire_hook(settings.hooks.interrupt.clone(), proto, f);
                let KSlot::VarCount(nvars) = inst.k else {
                    return Err(malformed_k().into());
                };
                let nvars = usize::from(nvars);
                // The generic-for ABI reserves six scratch registers.
                f.top = a as i64 + 6;
                let loop_pc = f.pc - 1;
                let iterator = f.reg_at(a);
                match iterator {
                    Value::Closure(_) | Value::Native(_) => {
                        let args = [f.reg_at(a + 1), f.reg_at(a + 2)];
                        let results = self.call_any(&iterator, &args)?;
                        for i in 0..nvars {
                            f.set_at(a + 3 + i, results.get(i).cloned().unwrap_or(Value::Nil));
                        }
                        if f.reg_at(a + 3).is_nil() {
                            f.pc += 1;
                        } else {
                            f.set_at(a + 2, f.reg_at(a + 3));
                            jump(f, i64::from(inst.d));
                        }
                    }
                    other => {
                        let stepped = match f.iterators.get_mut(&loop_pc) {
                            Some(iter) => iter.next(),
                            None => return Err(iterate_error(&other).into()),
                        };
                        match stepped {
                            Some((key, value)) => {
                                let bound = [key, value];
                                for i in 0..nvars {
                                    f.set_at(
                                        a + 3 + i,
                                        bound.get(i).cloned().unwrap_or(Value::Nil),
                                    );
                                }
                                f.set_at(a + 2, f.reg_at(a + 3));
                                jump(f, i64::from(inst.d));
                            }
                            None => {
                                f.iterators.remove(&loop_pc);
                                f.pc += 1;
                            }
                        }
                    }
                }
            }
            Opcode::ForGPrepINext | Opcode::ForGPrepNext => {
                let iterator = f.reg_at(a);
                match iterator {
                    Value::Closure(_) | Value::Native(_) => jump(f, i64::from(inst.d)),
                    other => return Err(iterate_error(&other).into()),
                }
            }

            Opcode::GetVarargs => {
                if inst.b == 0 {
                    for (i, v) in f.varargs.iter().enumerate() {
                        f.set_at(a + i, v.clone());
                    }
                    f.top = a as i64 + f.varargs.len() as i64 - 1;
                } else {
                    for i in 0..b - 1 {
                        f.set_at(a + i, f.varargs.get(i).cloned().unwrap_or(Value::Nil));
                    }
                }
            }

            Opcode::Coverage => {
                self.program.bump_coverage(proto.bytecode_id, f.pc - 1);
            }
            Opcode::Capture => {
                // Pseudo-instruction; only meaningful when consumed by
                // NEWCLOSURE/DUPCLOSURE.
                settings.emit_warning(&format!(
                    "orphaned CAPTURE instruction at pc {}",
                    f.debug_pc
                ));
            }

            // Builtin fast paths; the general call path already covers
            // their semantics, so they reduce to pc bookkeeping.
            Opcode::FastCall | Opcode::FastCall1 => {}
            Opcode::FastCall2 | Opcode::FastCall2K | Opcode::FastCall3 => f.pc += 1,
        }
        Ok(None)
    }

    /// Dispatches a call to a scripted closure or a host function.
    fn call_any(&self, func: &Value, args: &[Value]) -> Result<Vec<Value>, VmError> {
        match func {
            Value::Closure(closure) => self
                .execute(closure.clone(), args)
                .map_err(VmError::Nested),
            Value::Native(native) => native.call(args).map_err(VmError::Here),
            other => Err(RuntimeError::type_error(format!(
                "attempt to call a {} value",
                other.type_name()
            ))
            .into()),
        }
    }

    /// Consumes the CAPTURE pseudo-instructions after NEWCLOSURE or
    /// DUPCLOSURE and builds the closure value.
    fn make_closure(
        &self,
        proto: &Proto,
        f: &mut Frame,
        child_id: u32,
        allow_ref_capture: bool,
    ) -> Result<Value, VmError> {
        let child = &self.program.module.protos[child_id as usize];
        let nups = usize::from(child.num_upvalues);
        let mut upvalues = Vec::with_capacity(nups);
        for _ in 0..nups {
            let Some(&capture) = proto.code.get(f.pc) else {
                return Err(RuntimeError::type_error("truncated capture sequence").into());
            };
            f.pc += 1;
            match capture.a {
                0 => upvalues.push(UpvalueCell::closed(f.reg_at(usize::from(capture.b)))),
                1 if allow_ref_capture => {
                    let reg = capture.b;
                    let existing = f.open_upvalues.get(&reg).and_then(Weak::upgrade);
                    let cell = match existing {
                        Some(cell) => cell,
                        None => {
                            let cell = UpvalueCell::open(f.stack.clone(), usize::from(reg));
                            f.open_upvalues.insert(reg, Rc::downgrade(&cell));
                            cell
                        }
                    };
                    upvalues.push(cell);
                }
                2 => {
                    let cell = f
                        .closure
                        .upvalues
                        .get(usize::from(capture.b))
                        .cloned()
                        .ok_or_else(|| {
                            RuntimeError::type_error("captured upvalue index out of range")
                        })?;
                    upvalues.push(cell);
                }
                mode => {
                    return Err(RuntimeError::type_error(format!(
                        "unsupported capture mode {mode}"
                    ))
                    .into())
                }
            }
        }
        Ok(Value::Closure(LuaClosure::new(child_id, upvalues)))
    }

    /// GETGLOBAL lookup: extensions shadow the environment.
    fn global_read(&self, name: &str) -> Value {
        if let Some(value) = self.program.settings.extensions.get(name) {
            return value.clone();
        }
        self.program.env.borrow().get_str(name)
    }

    /// The uncached GETIMPORT walk: the first segment resolves like a
    /// global (extensions shadow the environment), subsequent segments
    /// index into the previous result, stopping at the chain length or
    /// the first nil.
    fn walk_import(&self, proto: &Proto, inst: &Instruction) -> Result<Value, RuntimeError> {
        let KSlot::Import(path) = inst.k else {
            return Err(malformed_k());
        };
        let first = self.constant_str(proto, u32::from(path.ids[0]))?;
        let mut value = self.global_read(&first);
        for step in 1..usize::from(path.count.min(3)) {
            if value.is_nil() {
                break;
            }
            let segment = self.constant_str(proto, u32::from(path.ids[step]))?;
            value = self.index_value(&value, &Value::Str(segment))?;
        }
        Ok(value)
    }

    fn upvalue(&self, f: &Frame, index: usize) -> Result<Rc<UpvalueCell>, RuntimeError> {
        f.closure
            .upvalues
            .get(index)
            .cloned()
            .ok_or_else(|| RuntimeError::type_error("upvalue index out of range"))
    }

    /// `base[key]` for dynamic keys. Vectors expose their lanes as
    /// `x`/`y`/`z`/`w` fields.
    fn index_value(&self, base: &Value, key: &Value) -> Result<Value, RuntimeError> {
        match base {
            Value::Table(t) => Ok(t.borrow().get(key)),
            Value::Vector(v) => {
                if let Value::Str(s) = key {
                    let lane = match s.as_str() {
                        "x" | "X" => Some(v.x),
                        "y" | "Y" => Some(v.y),
                        "z" | "Z" => Some(v.z),
                        "w" | "W" => Some(v.w),
                        _ => None,
                    };
                    if let Some(lane) = lane {
                        return Ok(Value::Number(f64::from(lane)));
                    }
                }
                Err(RuntimeError::type_error(format!(
                    "attempt to index vector with '{key}'"
                )))
            }
            other => Err(index_error(other)),
        }
    }

    fn index_int(&self, base: &Value, key: i64) -> Result<Value, RuntimeError> {
        match base {
            Value::Table(t) => Ok(t.borrow().get_int(key)),
            other => Err(index_error(other)),
        }
    }

    fn newindex_value(
        &self,
        base: &Value,
        key: Value,
        value: Value,
    ) -> Result<(), RuntimeError> {
        match base {
            Value::Table(t) => t.borrow_mut().set(key, value),
            other => Err(index_error(other)),
        }
    }

    /// Materializes the constant an instruction's K binding refers to.
    fn k_const_value(&self, proto: &Proto, inst: &Instruction) -> Result<Value, RuntimeError> {
        let KSlot::Const(index) = inst.k else {
            return Err(malformed_k());
        };
        self.constant_value(proto, index)
    }

    fn k_str(&self, proto: &Proto, inst: &Instruction) -> Result<LuaStr, RuntimeError> {
        let KSlot::Const(index) = inst.k else {
            return Err(malformed_k());
        };
        self.constant_str(proto, index)
    }

    fn constant_value(&self, proto: &Proto, index: u32) -> Result<Value, RuntimeError> {
        match proto.constants.get(index as usize) {
            Some(Constant::Nil) => Ok(Value::Nil),
            Some(Constant::Bool(b)) => Ok(Value::Bool(*b)),
            Some(Constant::Number(n)) => Ok(Value::Number(*n)),
            Some(Constant::Str(wire)) => self
                .program
                .module
                .strings
                .get(*wire)
                .map(|s| Value::Str(s.clone()))
                .ok_or_else(|| RuntimeError::type_error("string constant out of range")),
            Some(Constant::Vector(lanes)) => Ok(self.program.settings.make_vector(*lanes)),
            Some(Constant::Import(_) | Constant::Table(_) | Constant::Closure(_)) => Err(
                RuntimeError::type_error("constant kind not loadable as a value"),
            ),
            None => Err(RuntimeError::type_error("constant index out of range")),
        }
    }

    fn constant_str(&self, proto: &Proto, index: u32) -> Result<LuaStr, RuntimeError> {
        match proto.constants.get(index as usize) {
            Some(Constant::Str(wire)) => self
                .program
                .module
                .strings
                .get(*wire)
                .cloned()
                .ok_or_else(|| RuntimeError::type_error("string constant out of range")),
            _ => Err(RuntimeError::type_error("expected a string constant")),
        }
    }

    /// Coerces a numeric-for control register in place.
    fn for_number(&self, f: &Frame, index: usize, msg: &str) -> Result<f64, VmError> {
        let value = f.reg_at(index);
        let n = value
            .coerce_number()
            .ok_or_else(|| RuntimeError::type_error(msg))?;
        f.set_at(index, Value::Number(n));
        Ok(n)
    }

    fn fire_hook(
        &self,
        hook: Option<Rc<dyn Fn(&HookCtx<'_>)>>,
        proto: &Proto,
        f: &Frame,
    ) {
        if let Some(hook) = hook {
            let ctx = HookCtx {
                pc: f.debug_pc,
                module: &self.program.module,
                proto,
                debug_name: proto.debug_name_str(&self.program.module.strings),
                stack: &f.stack,
                upvalues: &f.closure.upvalues,
            };
            hook(&ctx);
        }
    }
}

fn malformed_k() -> RuntimeError {
    RuntimeError::type_error("malformed constant binding")
}

fn index_error(base: &Value) -> RuntimeError {
    RuntimeError::type_error(format!(
        "attempt to index a {} value",
        base.type_name()
    ))
}

fn iterate_error(value: &Value) -> RuntimeError {
    RuntimeError::type_error(format!(
        "attempt to iterate over a {} value",
        value.type_name()
    ))
}

fn require_number(value: &Value) -> Result<f64, RuntimeError> {
    value
        .as_number()
        .ok_or_else(|| RuntimeError::type_error("'for' control variable must be a number"))
}
