//! Test-only bytecode assembler.
//!
//! Builds binary modules in the wire format the loader consumes, so the
//! end-to-end tests can exercise the interpreter without a compiler.
#![allow(dead_code)]

use std::cell::RefCell;
use std::rc::Rc;

use crescent::{CallError, Opcode, Program, Settings, Table, Value};

/// Encodes an ABC-shaped instruction word.
pub fn abc(op: Opcode, a: u8, b: u8, c: u8) -> u32 {
    op as u32 | (u32::from(a) << 8) | (u32::from(b) << 16) | (u32::from(c) << 24)
}

/// Encodes an AD-shaped instruction word.
pub fn ad(op: Opcode, a: u8, d: i16) -> u32 {
    op as u32 | (u32::from(a) << 8) | (u32::from(d as u16) << 16)
}

/// Encodes an AE-shaped instruction word.
pub fn ae(op: Opcode, e: i32) -> u32 {
    op as u32 | (((e as u32) & 0xFF_FFFF) << 8)
}

/// Encodes a bare opcode.
pub fn op(op: Opcode) -> u32 {
    op as u32
}

/// Packs a GETIMPORT path.
pub fn pack_import(count: u8, id0: u16, id1: u16, id2: u16) -> u32 {
    (u32::from(count) << 30) | (u32::from(id0) << 20) | (u32::from(id1) << 10) | u32::from(id2)
}

/// Constant-pool entry spec.
pub enum Const {
    Nil,
    Bool(bool),
    Num(f64),
    /// Wire string index (from [`ModuleSpec::string`]).
    Str(u32),
    /// Packed import path (from [`pack_import`]).
    Import(u32),
    /// Constant-pool indices of key strings.
    Table(Vec<u32>),
    /// Module prototype index.
    Closure(u32),
    Vector([f32; 4]),
}

/// Prototype spec.
pub struct ProtoSpec {
    pub max_stack: u8,
    pub num_params: u8,
    pub num_upvalues: u8,
    pub is_vararg: bool,
    pub code: Vec<u32>,
    pub consts: Vec<Const>,
    pub protos: Vec<u32>,
}

impl Default for ProtoSpec {
    fn default() -> Self {
        Self {
            max_stack: 8,
            num_params: 0,
            num_upvalues: 0,
            is_vararg: false,
            code: Vec::new(),
            consts: Vec::new(),
            protos: Vec::new(),
        }
    }
}

/// Module spec assembling to version-3 (or later) wire bytes.
pub struct ModuleSpec {
    pub version: u8,
    pub strings: Vec<String>,
    pub protos: Vec<ProtoSpec>,
    pub main: u32,
}

impl Default for ModuleSpec {
    fn default() -> Self {
        Self {
            version: 3,
            strings: Vec::new(),
            protos: Vec::new(),
            main: 0,
        }
    }
}

impl ModuleSpec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Interns a string, returning its wire index (1-based).
    pub fn string(&mut self, s: &str) -> u32 {
        if let Some(i) = self.strings.iter().position(|e| e == s) {
            return i as u32 + 1;
        }
        self.strings.push(s.to_owned());
        self.strings.len() as u32
    }

    /// Appends a prototype, returning its module index.
    pub fn proto(&mut self, proto: ProtoSpec) -> u32 {
        self.protos.push(proto);
        self.protos.len() as u32 - 1
    }

    pub fn build(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.push(self.version);
        if self.version >= 4 {
            out.push(0); // types version
        }
        varint(&mut out, self.strings.len() as u32);
        for s in &self.strings {
            varint(&mut out, s.len() as u32);
            out.extend_from_slice(s.as_bytes());
        }
        varint(&mut out, self.protos.len() as u32);
        for proto in &self.protos {
            out.push(proto.max_stack);
            out.push(proto.num_params);
            out.push(proto.num_upvalues);
            out.push(u8::from(proto.is_vararg));
            if self.version >= 4 {
                out.push(0); // flags
                varint(&mut out, 0); // empty type blob
            }
            varint(&mut out, proto.code.len() as u32);
            for word in &proto.code {
                out.extend_from_slice(&word.to_le_bytes());
            }
            varint(&mut out, proto.consts.len() as u32);
            for k in &proto.consts {
                match k {
                    Const::Nil => out.push(0),
                    Const::Bool(b) => {
                        out.push(1);
                        out.push(u8::from(*b));
                    }
                    Const::Num(n) => {
                        out.push(2);
                        out.extend_from_slice(&n.to_le_bytes());
                    }
                    Const::Str(wire) => {
                        out.push(3);
                        varint(&mut out, *wire);
                    }
                    Const::Import(packed) => {
                        out.push(4);
                        out.extend_from_slice(&packed.to_le_bytes());
                    }
                    Const::Table(keys) => {
                        out.push(5);
                        varint(&mut out, keys.len() as u32);
                        for key in keys {
                            varint(&mut out, *key);
                        }
                    }
                    Const::Closure(proto) => {
                        out.push(6);
                        varint(&mut out, *proto);
                    }
                    Const::Vector(lanes) => {
                        out.push(7);
                        for lane in lanes {
                            out.extend_from_slice(&lane.to_le_bytes());
                        }
                    }
                }
            }
            varint(&mut out, proto.protos.len() as u32);
            for child in &proto.protos {
                varint(&mut out, *child);
            }
            varint(&mut out, 0); // line_defined
            varint(&mut out, 0); // debug name
            out.push(0); // no line info
            out.push(0); // no debug info
        }
        varint(&mut out, self.main);
        out
    }
}

fn varint(out: &mut Vec<u8>, mut v: u32) {
    loop {
        let mut byte = (v & 0x7F) as u8;
        v >>= 7;
        if v != 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if v == 0 {
            break;
        }
    }
}

/// A fresh, empty environment table.
pub fn empty_env() -> Rc<RefCell<Table>> {
    Rc::new(RefCell::new(Table::new()))
}

/// Loads and runs a module against an empty environment with default
/// settings, panicking on failure.
pub fn run(bytes: &[u8]) -> Vec<Value> {
    run_with(bytes, empty_env(), Settings::default()).expect("script should succeed")
}

/// Loads and runs a module with the given environment and settings.
pub fn run_with(
    bytes: &[u8],
    env: Rc<RefCell<Table>>,
    settings: Settings,
) -> Result<Vec<Value>, CallError> {
    Program::load(bytes, env, settings)
        .expect("module should load")
        .call(&[])
}

/// An `ipairs`-style pair native: returns the stepper, the table and 0.
pub fn ipairs_native() -> Value {
    Value::native("ipairs", |args| {
        let table = args.first().cloned().unwrap_or(Value::Nil);
        let stepper = Value::native("inext", |args| {
            let Some(Value::Table(t)) = args.first() else {
                return Ok(vec![Value::Nil]);
            };
            let i = args.get(1).and_then(Value::as_number).unwrap_or(0.0) as i64;
            let value = t.borrow().get_int(i + 1);
            if value.is_nil() {
                Ok(vec![Value::Nil])
            } else {
                Ok(vec![Value::Number((i + 1) as f64), value])
            }
        });
        Ok(vec![stepper, table, Value::Number(0.0)])
    })
}
