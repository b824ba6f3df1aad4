//! Instruction-level IR for the specialization graph.
//!
//! Instructions are stored in a per-graph arena and linked into basic blocks
//! by index; an instruction carries an opcode, whose static descriptor gives
//! its purity and the read/write kind of every operand position, plus a
//! variable-length operand array. Alongside the instructions lives the facts
//! table: for every (register origin, SSA version) pair, the statically
//! inferred properties the optimizer trades in.

use bitflags::bitflags;
use smallvec::SmallVec;

use crate::model::{StRef, Value};

/// Index of a basic block in the graph's block arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockId(pub u32);

/// Index of an instruction in the graph's instruction arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InsId(pub u32);

/// A (register origin, SSA version) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegRef {
    pub orig: u16,
    pub version: u16,
}

impl RegRef {
    pub fn new(orig: u16, version: u16) -> Self {
        Self { orig, version }
    }
}

/// Index into the graph's string heap.
pub type StrIdx = u32;

/// Index into the graph's callsite table.
pub type CallsiteIdx = u32;

/// An instruction operand.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Reg(RegRef),
    LitI16(i16),
    LitI64(i64),
    LitN64(f64),
    LitStr(StrIdx),
    Callsite(CallsiteIdx),
    Target(BlockId),
}

impl Operand {
    pub fn reg(&self) -> RegRef {
        match self {
            Operand::Reg(r) => *r,
            other => panic!("operand is not a register: {:?}", other),
        }
    }

    pub fn lit_i16(&self) -> i16 {
        match self {
            Operand::LitI16(v) => *v,
            other => panic!("operand is not an i16 literal: {:?}", other),
        }
    }

    pub fn lit_i64(&self) -> i64 {
        match self {
            Operand::LitI64(v) => *v,
            other => panic!("operand is not an i64 literal: {:?}", other),
        }
    }

    pub fn lit_str(&self) -> StrIdx {
        match self {
            Operand::LitStr(v) => *v,
            other => panic!("operand is not a string literal: {:?}", other),
        }
    }

    pub fn callsite_idx(&self) -> CallsiteIdx {
        match self {
            Operand::Callsite(v) => *v,
            other => panic!("operand is not a callsite index: {:?}", other),
        }
    }

    pub fn target(&self) -> BlockId {
        match self {
            Operand::Target(v) => *v,
            other => panic!("operand is not a branch target: {:?}", other),
        }
    }
}

/// Read/write kind of an operand position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandKind {
    ReadReg,
    WriteReg,
    LitI16,
    LitI64,
    LitN64,
    LitStr,
    Callsite,
    Target,
}

/// Static opcode metadata.
#[derive(Debug, Clone, Copy)]
pub struct OpDescriptor {
    pub name: &'static str,
    pub pure: bool,
    pub operands: &'static [OperandKind],
}

/// Opcodes understood by the optimizer. `Sp*` forms are the specialized
/// opcodes the optimizer itself introduces; downstream code generation must
/// honor them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(non_camel_case_types)]
pub enum Op {
    Set,
    Goto,
    IfI,
    UnlessI,
    IfN,
    UnlessN,
    IfS,
    UnlessS,
    IfO,
    UnlessO,
    IfNonNull,
    PrepArgs,
    ArgI,
    ArgN,
    ArgS,
    ArgO,
    ArgConstI,
    ArgConstN,
    ArgConstS,
    InvokeV,
    InvokeI,
    InvokeN,
    InvokeS,
    InvokeO,
    ParamRpI,
    ParamRpN,
    ParamRpS,
    ParamRpO,
    ReturnV,
    ReturnI,
    ReturnN,
    ReturnS,
    ReturnO,
    CoerceIn,
    IsList,
    IsHash,
    IsInt,
    IsNum,
    IsStr,
    IsNonNull,
    IsConcrete,
    IsType,
    FindMeth,
    Can,
    CanS,
    Create,
    Elems,
    BindAttrI,
    BindAttrN,
    BindAttrS,
    BindAttrO,
    GetAttrI,
    GetAttrN,
    GetAttrS,
    GetAttrO,
    BoxI,
    BoxN,
    BoxS,
    UnboxI,
    UnboxN,
    UnboxS,
    Hllize,
    Decont,
    AssertParamCheck,
    GetLexStaticO,
    GetLexPerInvTypeO,
    ConstI64,
    ConstI64_16,
    ConstN64,
    ConstS,
    SpLog,
    SpGuard,
    SpOsrFinalize,
    SpGetSpeshSlot,
    SpFindMeth,
    SpFastInvokeV,
    SpFastInvokeI,
    SpFastInvokeN,
    SpFastInvokeS,
    SpFastInvokeO,
    Phi,
}

impl Op {
    pub fn descriptor(self) -> OpDescriptor {
        use OperandKind::*;
        macro_rules! desc {
            ($name:expr, $pure:expr, [$($k:expr),*]) => {
                OpDescriptor { name: $name, pure: $pure, operands: &[$($k),*] }
            };
        }
        match self {
            Op::Set => desc!("set", true, [WriteReg, ReadReg]),
            Op::Goto => desc!("goto", false, [Target]),
            Op::IfI => desc!("if_i", false, [ReadReg, Target]),
            Op::UnlessI => desc!("unless_i", false, [ReadReg, Target]),
            Op::IfN => desc!("if_n", false, [ReadReg, Target]),
            Op::UnlessN => desc!("unless_n", false, [ReadReg, Target]),
            Op::IfS => desc!("if_s", false, [ReadReg, Target]),
            Op::UnlessS => desc!("unless_s", false, [ReadReg, Target]),
            Op::IfO => desc!("if_o", false, [ReadReg, Target]),
            Op::UnlessO => desc!("unless_o", false, [ReadReg, Target]),
            Op::IfNonNull => desc!("ifnonnull", false, [ReadReg, Target]),
            Op::PrepArgs => desc!("prepargs", false, [Callsite]),
            Op::ArgI => desc!("arg_i", false, [LitI16, ReadReg]),
            Op::ArgN => desc!("arg_n", false, [LitI16, ReadReg]),
            Op::ArgS => desc!("arg_s", false, [LitI16, ReadReg]),
            Op::ArgO => desc!("arg_o", false, [LitI16, ReadReg]),
            Op::ArgConstI => desc!("argconst_i", false, [LitI16, LitI64]),
            Op::ArgConstN => desc!("argconst_n", false, [LitI16, LitN64]),
            Op::ArgConstS => desc!("argconst_s", false, [LitI16, LitStr]),
            Op::InvokeV => desc!("invoke_v", false, [ReadReg]),
            Op::InvokeI => desc!("invoke_i", false, [WriteReg, ReadReg]),
            Op::InvokeN => desc!("invoke_n", false, [WriteReg, ReadReg]),
            Op::InvokeS => desc!("invoke_s", false, [WriteReg, ReadReg]),
            Op::InvokeO => desc!("invoke_o", false, [WriteReg, ReadReg]),
            Op::ParamRpI => desc!("param_rp_i", false, [WriteReg, LitI16]),
            Op::ParamRpN => desc!("param_rp_n", false, [WriteReg, LitI16]),
            Op::ParamRpS => desc!("param_rp_s", false, [WriteReg, LitI16]),
            Op::ParamRpO => desc!("param_rp_o", false, [WriteReg, LitI16]),
            Op::ReturnV => desc!("return", false, []),
            Op::ReturnI => desc!("return_i", false, [ReadReg]),
            Op::ReturnN => desc!("return_n", false, [ReadReg]),
            Op::ReturnS => desc!("return_s", false, [ReadReg]),
            Op::ReturnO => desc!("return_o", false, [ReadReg]),
            Op::CoerceIn => desc!("coerce_in", true, [WriteReg, ReadReg]),
            Op::IsList => desc!("islist", true, [WriteReg, ReadReg]),
            Op::IsHash => desc!("ishash", true, [WriteReg, ReadReg]),
            Op::IsInt => desc!("isint", true, [WriteReg, ReadReg]),
            Op::IsNum => desc!("isnum", true, [WriteReg, ReadReg]),
            Op::IsStr => desc!("isstr", true, [WriteReg, ReadReg]),
            Op::IsNonNull => desc!("isnonnull", true, [WriteReg, ReadReg]),
            Op::IsConcrete => desc!("isconcrete", true, [WriteReg, ReadReg]),
            Op::IsType => desc!("istype", true, [WriteReg, ReadReg, ReadReg]),
            Op::FindMeth => desc!("findmeth", true, [WriteReg, ReadReg, LitStr]),
            Op::Can => desc!("can", true, [WriteReg, ReadReg, LitStr]),
            Op::CanS => desc!("can_s", true, [WriteReg, ReadReg, ReadReg]),
            Op::Create => desc!("create", true, [WriteReg, ReadReg]),
            Op::Elems => desc!("elems", true, [WriteReg, ReadReg]),
            Op::BindAttrI => desc!("bindattr_i", false, [ReadReg, ReadReg, LitStr, ReadReg, LitI16]),
            Op::BindAttrN => desc!("bindattr_n", false, [ReadReg, ReadReg, LitStr, ReadReg, LitI16]),
            Op::BindAttrS => desc!("bindattr_s", false, [ReadReg, ReadReg, LitStr, ReadReg, LitI16]),
            Op::BindAttrO => desc!("bindattr_o", false, [ReadReg, ReadReg, LitStr, ReadReg, LitI16]),
            Op::GetAttrI => desc!("getattr_i", true, [WriteReg, ReadReg, ReadReg, LitStr, LitI16]),
            Op::GetAttrN => desc!("getattr_n", true, [WriteReg, ReadReg, ReadReg, LitStr, LitI16]),
            Op::GetAttrS => desc!("getattr_s", true, [WriteReg, ReadReg, ReadReg, LitStr, LitI16]),
            Op::GetAttrO => desc!("getattr_o", true, [WriteReg, ReadReg, ReadReg, LitStr, LitI16]),
            Op::BoxI => desc!("box_i", true, [WriteReg, ReadReg, ReadReg]),
            Op::BoxN => desc!("box_n", true, [WriteReg, ReadReg, ReadReg]),
            Op::BoxS => desc!("box_s", true, [WriteReg, ReadReg, ReadReg]),
            Op::UnboxI => desc!("unbox_i", true, [WriteReg, ReadReg]),
            Op::UnboxN => desc!("unbox_n", true, [WriteReg, ReadReg]),
            Op::UnboxS => desc!("unbox_s", true, [WriteReg, ReadReg]),
            Op::Hllize => desc!("hllize", false, [WriteReg, ReadReg]),
            Op::Decont => desc!("decont", false, [WriteReg, ReadReg]),
            Op::AssertParamCheck => desc!("assertparamcheck", false, [ReadReg]),
            Op::GetLexStaticO => desc!("getlexstatic_o", true, [WriteReg, LitStr]),
            Op::GetLexPerInvTypeO => desc!("getlexperinvtype_o", true, [WriteReg, LitStr]),
            Op::ConstI64 => desc!("const_i64", true, [WriteReg, LitI64]),
            Op::ConstI64_16 => desc!("const_i64_16", true, [WriteReg, LitI16]),
            Op::ConstN64 => desc!("const_n64", true, [WriteReg, LitN64]),
            Op::ConstS => desc!("const_s", true, [WriteReg, LitStr]),
            Op::SpLog => desc!("sp_log", false, [ReadReg, LitI16]),
            Op::SpGuard => desc!("sp_guard", false, [ReadReg, LitI16]),
            Op::SpOsrFinalize => desc!("sp_osrfinalize", false, [LitI16]),
            Op::SpGetSpeshSlot => desc!("sp_getspeshslot", true, [WriteReg, LitI16]),
            Op::SpFindMeth => desc!("sp_findmeth", false, [WriteReg, ReadReg, LitStr, LitI16]),
            Op::SpFastInvokeV => desc!("sp_fastinvoke_v", false, [ReadReg, LitI16]),
            Op::SpFastInvokeI => desc!("sp_fastinvoke_i", false, [WriteReg, ReadReg, LitI16]),
            Op::SpFastInvokeN => desc!("sp_fastinvoke_n", false, [WriteReg, ReadReg, LitI16]),
            Op::SpFastInvokeS => desc!("sp_fastinvoke_s", false, [WriteReg, ReadReg, LitI16]),
            Op::SpFastInvokeO => desc!("sp_fastinvoke_o", false, [WriteReg, ReadReg, LitI16]),
            Op::Phi => desc!("phi", true, [WriteReg]),
        }
    }

    pub fn name(self) -> &'static str {
        self.descriptor().name
    }

    pub fn is_pure(self) -> bool {
        self.descriptor().pure
    }

    /// Read/write kind of operand position `idx`. PHI nodes have a variable
    /// operand count: position 0 writes, every other reads.
    pub fn operand_kind(self, idx: usize) -> OperandKind {
        if self == Op::Phi {
            return if idx == 0 {
                OperandKind::WriteReg
            } else {
                OperandKind::ReadReg
            };
        }
        self.descriptor().operands[idx]
    }
}

impl std::fmt::Display for Op {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// An instruction: opcode, operands, and its links in the owning block's
/// doubly-linked instruction list.
#[derive(Debug, Clone, PartialEq)]
pub struct Ins {
    pub op: Op,
    pub operands: SmallVec<[Operand; 4]>,
    pub prev: Option<InsId>,
    pub next: Option<InsId>,
}

bitflags! {
    /// Semantic facts known about a register version.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FactFlags: u32 {
        const KNOWN_TYPE        = 1 << 0;
        const KNOWN_VALUE       = 1 << 1;
        const DECONTED          = 1 << 2;
        const CONCRETE          = 1 << 3;
        const TYPEOBJ           = 1 << 4;
        const KNOWN_DECONT_TYPE = 1 << 5;
        const DECONT_CONCRETE   = 1 << 6;
        const DECONT_TYPEOBJ    = 1 << 7;
        const FROM_LOG_GUARD    = 1 << 8;
    }
}

/// Facts about one (register origin, SSA version).
#[derive(Debug, Clone, Default)]
pub struct Facts {
    pub flags: FactFlags,
    pub type_: Option<StRef>,
    pub decont_type: Option<StRef>,
    pub value: Option<Value>,
    /// Index of the log guard these facts depend on; meaningful only when
    /// `FROM_LOG_GUARD` is set.
    pub log_guard: usize,
    /// Count of live read references to this register version.
    pub usages: u32,
}

impl Facts {
    pub fn known_type(st: StRef) -> Self {
        Facts {
            flags: FactFlags::KNOWN_TYPE,
            type_: Some(st),
            ..Facts::default()
        }
    }

    pub fn known_value(value: Value) -> Self {
        Facts {
            flags: FactFlags::KNOWN_VALUE,
            value: Some(value),
            ..Facts::default()
        }
    }
}
