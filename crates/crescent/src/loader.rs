//! Binary module decoder.
//!
//! Decoding runs two passes over every prototype's code: pass one splits
//! the word stream into decoded instructions (AUX words get their own
//! placeholder slot so the program counter advances one slot per word),
//! pass two binds constant references according to each opcode's K-mode.

use crate::error::LoadError;
use crate::module::{Constant, ImportPath, Instruction, KSlot, Module, Proto};
use crate::opcode::{KMode, Opcode};
use crate::reader::ByteReader;
use crate::string::StringTable;

/// Lowest supported bytecode version.
const VERSION_MIN: u8 = 3;
/// Highest supported bytecode version.
const VERSION_MAX: u8 = 6;
/// Types-version that carries a userdata remapping table.
const TYPES_VERSION_USERDATA_REMAP: u8 = 3;

pub(crate) fn load_module(bytes: &[u8]) -> Result<Module, LoadError> {
    let mut r = ByteReader::new(bytes);

    let version = r.read_u8()?;
    if version == 0 {
        // Version byte 0 marks a compiler failure; the rest of the blob is
        // the error message.
        let msg = String::from_utf8_lossy(r.read_to_end()).into_owned();
        return Err(LoadError::CompileFailure(msg));
    }
    if !(VERSION_MIN..=VERSION_MAX).contains(&version) {
        return Err(LoadError::UnsupportedVersion(version));
    }

    let types_version = if version >= 4 { r.read_u8()? } else { 0 };

    let n_strings = r.read_varint()? as usize;
    let mut strings = StringTable::default();
    for _ in 0..n_strings {
        let len = r.read_varint()? as usize;
        let raw = r.read_bytes(len)?;
        strings.push(String::from_utf8_lossy(raw).into_owned());
    }

    if types_version == TYPES_VERSION_USERDATA_REMAP {
        // Userdata type remapping: (u8 index, varint) pairs, 0-terminated.
        loop {
            let index = r.read_u8()?;
            if index == 0 {
                break;
            }
            r.read_varint()?;
        }
    }

    let n_protos = r.read_varint()? as usize;
    let mut protos = Vec::with_capacity(n_protos);
    for id in 0..n_protos {
        protos.push(read_proto(&mut r, version, id as u32, n_protos, &strings)?);
    }

    let main_proto = r.read_varint()?;
    if main_proto as usize >= protos.len() {
        return Err(LoadError::BadProtoRef(main_proto));
    }

    Ok(Module {
        strings,
        protos,
        main_proto,
        version,
        types_version,
    })
}

fn read_proto(
    r: &mut ByteReader<'_>,
    version: u8,
    bytecode_id: u32,
    n_protos: usize,
    strings: &StringTable,
) -> Result<Proto, LoadError> {
    let max_stack_size = r.read_u8()?;
    let num_params = r.read_u8()?;
    let num_upvalues = r.read_u8()?;
    let is_vararg = r.read_u8()? != 0;

    if version >= 4 {
        let _flags = r.read_u8()?;
        let type_blob_len = r.read_varint()? as usize;
        r.read_bytes(type_blob_len)?;
    }

    // Pass 1: decode. Read every word up front so a malformed AUX claim on
    // the final word cannot misconsume the constant section.
    let size_code = r.read_varint()? as usize;
    let mut words = Vec::with_capacity(size_code);
    for _ in 0..size_code {
        words.push(r.read_u32_le()?);
    }
    let mut code = Vec::with_capacity(size_code);
    let mut i = 0;
    while i < size_code {
        let mut inst = Instruction::decode(words[i]);
        i += 1;
        let wants_aux = inst.op.is_some_and(Opcode::has_aux);
        if wants_aux && i < size_code {
            let aux = words[i];
            i += 1;
            inst.aux = aux;
            code.push(inst);
            code.push(Instruction::aux_slot(aux));
        } else {
            code.push(inst);
        }
    }

    let size_k = r.read_varint()? as usize;
    let mut constants = Vec::with_capacity(size_k);
    for _ in 0..size_k {
        let offset = r.offset();
        let tag = r.read_u8()?;
        constants.push(match tag {
            0 => Constant::Nil,
            1 => Constant::Bool(r.read_u8()? != 0),
            2 => Constant::Number(r.read_f64()?),
            3 => {
                let wire = r.read_varint()?;
                if strings.get(wire).is_none() {
                    return Err(LoadError::BadStringRef(wire));
                }
                Constant::Str(wire)
            }
            4 => Constant::Import(ImportPath::unpack(r.read_u32_le()?)),
            5 => {
                let len = r.read_varint()? as usize;
                let mut keys = Vec::with_capacity(len);
                for _ in 0..len {
                    keys.push(r.read_varint()?);
                }
                Constant::Table(keys)
            }
            6 => {
                let proto = r.read_varint()?;
                if proto as usize >= n_protos {
                    return Err(LoadError::BadProtoRef(proto));
                }
                Constant::Closure(proto)
            }
            7 => {
                let x = r.read_f32()?;
                let y = r.read_f32()?;
                let z = r.read_f32()?;
                let w = r.read_f32()?;
                Constant::Vector([x, y, z, w])
            }
            tag => return Err(LoadError::BadConstantTag { tag, offset }),
        });
    }

    // Pass 2: bind constant references.
    bind_constants(&mut code, &constants, bytecode_id)?;

    let size_p = r.read_varint()? as usize;
    let mut child_protos = Vec::with_capacity(size_p);
    for _ in 0..size_p {
        let child = r.read_varint()?;
        if child as usize >= n_protos {
            return Err(LoadError::BadProtoRef(child));
        }
        child_protos.push(child);
    }

    let line_defined = r.read_varint()?;
    let debug_name = r.read_varint()?;
    if debug_name != 0 && strings.get(debug_name).is_none() {
        return Err(LoadError::BadStringRef(debug_name));
    }

    let instruction_line_info = if r.read_u8()? != 0 {
        Some(read_line_info(r, size_code)?)
    } else {
        None
    };

    if r.read_u8()? != 0 {
        skip_debug_info(r)?;
    }

    Ok(Proto {
        max_stack_size,
        num_params,
        num_upvalues,
        is_vararg,
        code,
        constants,
        protos: child_protos,
        line_defined,
        debug_name,
        instruction_line_info,
        bytecode_id,
    })
}

fn bind_constants(
    code: &mut [Instruction],
    constants: &[Constant],
    proto: u32,
) -> Result<(), LoadError> {
    let check = |index: i64| -> Result<u32, LoadError> {
        if (0..constants.len() as i64).contains(&index) {
            Ok(index as u32)
        } else {
            Err(LoadError::BadConstantRef {
                proto,
                index: index as u32,
            })
        }
    };

    for inst in code.iter_mut() {
        let Some(op) = inst.op else { continue };
        match op.kmode() {
            KMode::None => {}
            KMode::Aux => inst.k = KSlot::Const(check(i64::from(inst.aux))?),
            KMode::C => inst.k = KSlot::Const(check(i64::from(inst.c))?),
            KMode::D => inst.k = KSlot::Const(check(i64::from(inst.d))?),
            KMode::B => inst.k = KSlot::Const(check(i64::from(inst.b))?),
            KMode::AuxImport => inst.k = KSlot::Import(ImportPath::unpack(inst.aux)),
            KMode::AuxBool => {
                inst.k = KSlot::Bool(inst.aux & 1 == 1);
                inst.kn = (inst.aux >> 31) & 1 == 1;
            }
            KMode::AuxNumber => {
                inst.k = KSlot::Const(check(i64::from(inst.aux & 0xFF_FFFF))?);
                inst.kn = (inst.aux >> 31) & 1 == 1;
            }
            // Nominally a 16-bit field, masked to the low nibble by the
            // reference tooling; preserved verbatim.
            KMode::AuxCount => inst.k = KSlot::VarCount((inst.aux & 0xF) as u8),
        }
    }
    Ok(())
}

fn read_line_info(r: &mut ByteReader<'_>, size_code: usize) -> Result<Vec<u32>, LoadError> {
    let gap_log2 = r.read_u8()? as u32;

    let mut rel = Vec::with_capacity(size_code);
    let mut last = 0u8;
    for _ in 0..size_code {
        last = last.wrapping_add(r.read_u8()?);
        rel.push(last);
    }

    let intervals = if size_code == 0 {
        0
    } else {
        ((size_code - 1) >> gap_log2) + 1
    };
    let mut abs = Vec::with_capacity(intervals);
    let mut last_abs = 0u32;
    for _ in 0..intervals {
        last_abs = last_abs.wrapping_add(r.read_u32_le()?);
        abs.push(last_abs);
    }

    Ok((0..size_code)
        .map(|pc| abs[pc >> gap_log2].wrapping_add(u32::from(rel[pc])))
        .collect())
}

/// The debug info block (local and upvalue names) is read and discarded.
fn skip_debug_info(r: &mut ByteReader<'_>) -> Result<(), LoadError> {
    let n_locals = r.read_varint()? as usize;
    for _ in 0..n_locals {
        r.read_varint()?; // name
        r.read_varint()?; // start pc
        r.read_varint()?; // end pc
        r.read_u8()?; // register
    }
    let n_upvalues = r.read_varint()? as usize;
    for _ in 0..n_upvalues {
        r.read_varint()?; // name
    }
    Ok(())
}
