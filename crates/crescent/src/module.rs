//! The loaded module graph.
//!
//! A `Module` is the output of the loader and the input to the VM. It is
//! immutable after loading and contains no runtime state, so it can be
//! shared between invocations, serialized for caching, or inspected with
//! [`Module::disassemble`].

use std::fmt;
use std::fmt::Write;

use crate::error::LoadError;
use crate::loader;
use crate::opcode::{OpMode, Opcode};
use crate::string::StringTable;

/// A constant-pool entry.
///
/// String constants reference the module string table by wire index;
/// closure constants reference the module prototype list. Vector constants
/// always carry four lanes — the configured vector size decides how many
/// reach the vector constructor at runtime.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum Constant {
    Nil,
    Bool(bool),
    Number(f64),
    /// Wire index into the module string table.
    Str(u32),
    Import(ImportPath),
    /// Constant-pool indices of the key strings of a table shape.
    Table(Vec<u32>),
    /// Module prototype index.
    Closure(u32),
    Vector([f32; 4]),
}

/// An import chain of up to three path segments, each a constant-pool
/// index of a string constant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ImportPath {
    /// Number of meaningful segments (1..=3).
    pub count: u8,
    pub ids: [u16; 3],
}

impl ImportPath {
    /// Unpacks the wire encoding `count << 30 | id0 << 20 | id1 << 10 | id2`.
    #[must_use]
    pub fn unpack(aux: u32) -> Self {
        Self {
            count: (aux >> 30) as u8,
            ids: [
                ((aux >> 20) & 0x3FF) as u16,
                ((aux >> 10) & 0x3FF) as u16,
                (aux & 0x3FF) as u16,
            ],
        }
    }
}

/// Result of the loader's K-binding pass for one instruction.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum KSlot {
    None,
    /// Index into the owning prototype's constant pool.
    Const(u32),
    /// Immediate boolean (JUMPXEQKB).
    Bool(bool),
    /// Loop-variable count (FORGLOOP).
    VarCount(u8),
    /// Import chain (GETIMPORT).
    Import(ImportPath),
}

/// A decoded instruction.
///
/// Every operand field is pre-extracted whether or not the opcode uses it;
/// extraction is cheap and keeps the decoder free of per-mode branches.
/// AUX words occupy their own slot in a prototype's code (with `op: None`)
/// so the program counter advances one slot per code word, exactly as it
/// does over the binary.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Instruction {
    /// Low byte of the raw word. Retained for unknown opcodes.
    pub raw_op: u8,
    /// `None` for unknown opcode bytes and for AUX placeholder slots.
    pub op: Option<Opcode>,
    pub a: u8,
    pub b: u8,
    pub c: u8,
    /// Signed 16-bit operand (jump deltas, constant indices).
    pub d: i16,
    /// Signed 24-bit operand.
    pub e: i32,
    /// The AUX word following this instruction, if any (0 otherwise).
    pub aux: u32,
    pub k: KSlot,
    /// Negation flag extracted from the AUX high bit (JUMPXEQK*).
    pub kn: bool,
    /// True for the placeholder slot holding an AUX word.
    pub aux_slot: bool,
}

impl Instruction {
    /// Decodes a single code word. K-binding happens in a later pass.
    #[must_use]
    pub fn decode(word: u32) -> Self {
        let raw_op = (word & 0xFF) as u8;
        Self {
            raw_op,
            op: Opcode::from_repr(raw_op),
            a: ((word >> 8) & 0xFF) as u8,
            b: ((word >> 16) & 0xFF) as u8,
            c: ((word >> 24) & 0xFF) as u8,
            d: (word >> 16) as i16,
            e: (word as i32) >> 8,
            aux: 0,
            k: KSlot::None,
            kn: false,
            aux_slot: false,
        }
    }

    /// Builds the placeholder slot for an AUX word.
    #[must_use]
    pub fn aux_slot(aux: u32) -> Self {
        Self {
            raw_op: (aux & 0xFF) as u8,
            op: None,
            a: 0,
            b: 0,
            c: 0,
            d: 0,
            e: 0,
            aux,
            k: KSlot::None,
            kn: false,
            aux_slot: true,
        }
    }

    /// Mnemonic for diagnostics; `"AUX"` for placeholder slots and
    /// `"UNKNOWN"` for unrecognized opcode bytes.
    #[must_use]
    pub fn opname(&self) -> &'static str {
        match self.op {
            Some(op) => op.name(),
            None if self.aux_slot => "AUX",
            None => "UNKNOWN",
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Some(op) = self.op else {
            return if self.aux_slot {
                write!(f, "AUX {:#010x}", self.aux)
            } else {
                write!(f, "UNKNOWN {:#04x}", self.raw_op)
            };
        };
        match op.mode() {
            OpMode::None => write!(f, "{op}"),
            OpMode::A => write!(f, "{op} {}", self.a),
            OpMode::Ab => write!(f, "{op} {} {}", self.a, self.b),
            OpMode::Abc => write!(f, "{op} {} {} {}", self.a, self.b, self.c),
            OpMode::Ad => write!(f, "{op} {} {}", self.a, self.d),
            OpMode::Ae => write!(f, "{op} {}", self.e),
        }
    }
}

/// A compiled function body plus metadata. Immutable after loading.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Proto {
    pub max_stack_size: u8,
    pub num_params: u8,
    pub num_upvalues: u8,
    pub is_vararg: bool,
    /// Decoded instructions with interleaved AUX slots.
    pub code: Vec<Instruction>,
    pub constants: Vec<Constant>,
    /// Module prototype indices of nested prototypes, in declaration order.
    pub protos: Vec<u32>,
    pub line_defined: u32,
    /// Wire string index of the debug name; 0 means none.
    pub debug_name: u32,
    /// Per-instruction source line, materialized from the gap-compressed
    /// wire encoding when line info is present.
    pub instruction_line_info: Option<Vec<u32>>,
    /// Stable index of this prototype in the module.
    pub bytecode_id: u32,
}

impl Proto {
    /// The debug name, or `"(??)"` when the prototype has none.
    #[must_use]
    pub fn debug_name_str<'a>(&self, strings: &'a StringTable) -> &'a str {
        strings
            .get(self.debug_name)
            .map_or("(??)", |s| s.as_str())
    }

    /// Source line of the instruction at `pc` (0-based), if line info was
    /// present in the binary.
    #[must_use]
    pub fn line_for(&self, pc: usize) -> Option<u32> {
        self.instruction_line_info
            .as_ref()
            .and_then(|lines| lines.get(pc).copied())
    }
}

/// A fully loaded module: string table, prototype list and entry point.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Module {
    pub strings: StringTable,
    pub protos: Vec<Proto>,
    /// Index of the main prototype (0-based).
    pub main_proto: u32,
    pub version: u8,
    pub types_version: u8,
}

impl Module {
    /// Decodes a binary module blob.
    pub fn load(bytes: &[u8]) -> Result<Self, LoadError> {
        loader::load_module(bytes)
    }

    /// The main prototype.
    #[must_use]
    pub fn main(&self) -> &Proto {
        &self.protos[self.main_proto as usize]
    }

    /// Renders a textual listing of every prototype, one instruction per
    /// line. Diagnostic aid only; the format is not stable.
    #[must_use]
    pub fn disassemble(&self) -> String {
        let mut out = String::new();
        for proto in &self.protos {
            let _ = writeln!(
                out,
                "proto {} {} params={} upvals={} stack={}{}",
                proto.bytecode_id,
                proto.debug_name_str(&self.strings),
                proto.num_params,
                proto.num_upvalues,
                proto.max_stack_size,
                if proto.is_vararg { " vararg" } else { "" },
            );
            for (pc, inst) in proto.code.iter().enumerate() {
                let _ = writeln!(out, "  {pc:4}  {inst}");
            }
        }
        out
    }
}
