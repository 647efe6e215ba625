//! Static opcode metadata.
//!
//! One entry per opcode byte: mnemonic (diagnostic only), operand layout,
//! K-mode (how the constant reference is bound in the loader's second
//! pass), and whether the instruction is followed by an AUX word.

use strum::{Display, FromRepr, IntoStaticStr};

/// Operand layout of an instruction word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpMode {
    /// No operands.
    None,
    /// A only.
    A,
    /// A and B.
    Ab,
    /// A, B and C.
    Abc,
    /// A and D (signed 16-bit).
    Ad,
    /// A and E (signed 24-bit).
    Ae,
}

/// How the loader's K-binding pass resolves an instruction's constant
/// reference. The numbering follows the wire tooling this format comes
/// from; `AuxCount` masks the AUX word with `0xF` even though it is
/// nominally a 16-bit field — preserved verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum KMode {
    None = 0,
    /// `K = constants[aux]`.
    Aux = 1,
    /// `K = constants[C]`.
    C = 2,
    /// `K = constants[D]`.
    D = 3,
    /// AUX packs an import path: `count << 30 | id0 << 20 | id1 << 10 | id2`.
    AuxImport = 4,
    /// `K = aux & 1`, `KN = aux >> 31`.
    AuxBool = 5,
    /// `K = constants[aux & 0xFFFFFF]`, `KN = aux >> 31`.
    AuxNumber = 6,
    /// `K = constants[B]`.
    B = 7,
    /// `K = aux & 0xF` (loop-variable count).
    AuxCount = 8,
}

/// The instruction set. Byte values 0..=82.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Display,
    FromRepr,
    IntoStaticStr,
    serde::Serialize,
    serde::Deserialize,
)]
#[strum(serialize_all = "UPPERCASE")]
#[repr(u8)]
pub enum Opcode {
    Nop = 0,
    Break,
    LoadNil,
    LoadB,
    LoadN,
    LoadK,
    Move,
    GetGlobal,
    SetGlobal,
    GetUpval,
    SetUpval,
    CloseUpvals,
    GetImport,
    GetTable,
    SetTable,
    GetTableKS,
    SetTableKS,
    GetTableN,
    SetTableN,
    NewClosure,
    Namecall,
    Call,
    Return,
    Jump,
    JumpBack,
    JumpIf,
    JumpIfNot,
    JumpIfEq,
    JumpIfLe,
    JumpIfLt,
    JumpIfNotEq,
    JumpIfNotLe,
    JumpIfNotLt,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    AddK,
    SubK,
    MulK,
    DivK,
    ModK,
    PowK,
    And,
    Or,
    AndK,
    OrK,
    Concat,
    Not,
    Minus,
    Length,
    NewTable,
    DupTable,
    SetList,
    ForNPrep,
    ForNLoop,
    ForGLoop,
    #[strum(serialize = "FORGPREP_INEXT")]
    ForGPrepINext,
    FastCall3,
    #[strum(serialize = "FORGPREP_NEXT")]
    ForGPrepNext,
    NativeCall,
    GetVarargs,
    DupClosure,
    PrepVarargs,
    LoadKX,
    JumpX,
    FastCall,
    Coverage,
    Capture,
    SubRK,
    DivRK,
    FastCall1,
    FastCall2,
    FastCall2K,
    ForGPrep,
    JumpXEqKNil,
    JumpXEqKB,
    JumpXEqKN,
    JumpXEqKS,
    IDiv,
    IDivK,
}

impl Opcode {
    /// Number of opcodes in the instruction set.
    pub const COUNT: usize = 83;

    /// The diagnostic mnemonic.
    #[must_use]
    pub fn name(self) -> &'static str {
        self.into()
    }

    /// Operand layout of this opcode.
    #[must_use]
    pub fn mode(self) -> OpMode {
        use Opcode::*;
        match self {
            Nop | Break | NativeCall => OpMode::None,
            LoadNil | CloseUpvals | PrepVarargs => OpMode::A,
            Move | GetUpval | SetUpval | Return | Not | Minus | Length | NewTable | GetVarargs
            | Capture => OpMode::Ab,
            LoadB | GetGlobal | SetGlobal | GetTable | SetTable | GetTableKS | SetTableKS
            | GetTableN | SetTableN | Namecall | Call | Add | Sub | Mul | Div | Mod | Pow
            | AddK | SubK | MulK | DivK | ModK | PowK | And | Or | AndK | OrK | Concat
            | SetList | SubRK | DivRK | FastCall | FastCall1 | FastCall2 | FastCall2K
            | FastCall3 | IDiv | IDivK => OpMode::Abc,
            LoadN | LoadK | GetImport | NewClosure | Jump | JumpBack | JumpIf | JumpIfNot
            | JumpIfEq | JumpIfLe | JumpIfLt | JumpIfNotEq | JumpIfNotLe | JumpIfNotLt
            | DupTable | ForNPrep | ForNLoop | ForGLoop | ForGPrepINext | ForGPrepNext
            | DupClosure | LoadKX | ForGPrep | JumpXEqKNil | JumpXEqKB | JumpXEqKN
            | JumpXEqKS => OpMode::Ad,
            JumpX | Coverage => OpMode::Ae,
        }
    }

    /// K-mode used by the loader's constant-binding pass.
    #[must_use]
    pub fn kmode(self) -> KMode {
        use Opcode::*;
        match self {
            GetGlobal | SetGlobal | GetTableKS | SetTableKS | Namecall | LoadKX | FastCall2K => {
                KMode::Aux
            }
            AddK | SubK | MulK | DivK | ModK | PowK | AndK | OrK | IDivK => KMode::C,
            LoadK | DupTable | DupClosure => KMode::D,
            GetImport => KMode::AuxImport,
            JumpXEqKNil | JumpXEqKB => KMode::AuxBool,
            JumpXEqKN | JumpXEqKS => KMode::AuxNumber,
            SubRK | DivRK => KMode::B,
            ForGLoop => KMode::AuxCount,
            _ => KMode::None,
        }
    }

    /// Whether an AUX word follows this instruction in the code stream.
    #[must_use]
    pub fn has_aux(self) -> bool {
        use Opcode::*;
        matches!(
            self,
            GetGlobal
                | SetGlobal
                | GetImport
                | GetTableKS
                | SetTableKS
                | Namecall
                | JumpIfEq
                | JumpIfLe
                | JumpIfLt
                | JumpIfNotEq
                | JumpIfNotLe
                | JumpIfNotLt
                | NewTable
                | SetList
                | ForGLoop
                | LoadKX
                | FastCall2
                | FastCall2K
                | FastCall3
                | JumpXEqKNil
                | JumpXEqKB
                | JumpXEqKN
                | JumpXEqKS
        )
    }
}
