#![doc = include_str!("../../../README.md")]
mod closure;
mod error;
mod host;
mod loader;
mod module;
mod opcode;
mod program;
mod reader;
mod string;
mod table;
mod upvalue;
mod value;
mod vm;

pub use crate::{
    closure::{LuaClosure, NativeFn},
    error::{CallError, Diagnostic, LoadError, RuntimeError},
    host::{HookCtx, Hooks, Namecall, NamecallHandler, Settings, VectorCtor, VectorSize},
    module::{Constant, ImportPath, Instruction, KSlot, Module, Proto},
    opcode::{KMode, OpMode, Opcode},
    program::{KillSwitch, Program},
    reader::ByteReader,
    string::{LuaStr, StringTable},
    table::Table,
    upvalue::UpvalueCell,
    value::{Value, Vector},
};
