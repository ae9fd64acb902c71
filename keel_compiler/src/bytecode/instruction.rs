//! Instruction set of the register/accumulator VM.
//!
//! Every instruction is 32 bits wide, so addresses can be resolved in a
//! single pass before any byte is written.
//!
//! # Instruction Format
//!
//! ```text
//! ┌─────────┬─────────┬─────────┬─────────┐
//! │ opcode  │    A    │  D low  │ D high  │
//! │ (8 bit) │ (8 bit) │ (8 bit) │ (8 bit) │
//! └─────────┴─────────┴─────────┴─────────┘
//! ```
//!
//! - `A`: register/slot operand, flags or a small count
//! - `D`: 16-bit index, count, or signed jump displacement (little endian)
//!
//! Values travel through an implicit accumulator. For stack-depth accounting
//! the accumulator and pending operands are modelled as a stack: loading a
//! value pushes, consuming one pops.

use keel_core::JumpConstruct;
use std::fmt;

/// Encoded width of every instruction, in bytes.
pub const INSTRUCTION_WIDTH: u32 = 4;

/// `MAKE_FUNCTION` flag: a tuple of closure cells precedes the code object.
pub const MAKE_FUNCTION_CLOSURE: u32 = 0x08;

/// A scratch register number, numbered from 0 within a code object.
///
/// Registers live in the frame after the local variables; the final slot is
/// only known once the number of locals is, so registers stay symbolic until
/// assembly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(transparent)]
pub struct Register(pub u8);

impl Register {
    /// Create a new register with the given index.
    #[inline]
    pub const fn new(index: u8) -> Self {
        Register(index)
    }

    /// Get the register index.
    #[inline]
    pub const fn index(self) -> u8 {
        self.0
    }
}

impl fmt::Display for Register {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}", self.0)
    }
}

/// A local variable slot index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(transparent)]
pub struct LocalSlot(pub u16);

impl LocalSlot {
    /// Create a new local slot.
    #[inline]
    pub const fn new(index: u16) -> Self {
        LocalSlot(index)
    }
}

/// A frame slot operand: a named local or a scratch register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Slot {
    /// Fast local variable.
    Local(LocalSlot),
    /// Scratch register, placed after all locals.
    Register(Register),
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Slot::Local(slot) => write!(f, "l{}", slot.0),
            Slot::Register(reg) => fmt::Display::fmt(reg, f),
        }
    }
}

/// A jump target placeholder, bound to an address during assembly.
///
/// Labels are numbered per code generator and remember which construct
/// created them, so an unreachable displacement can be reported against
/// the source construct.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Label {
    id: u32,
    owner: JumpConstruct,
}

impl Label {
    /// Create a label.
    #[inline]
    pub const fn new(id: u32, owner: JumpConstruct) -> Self {
        Self { id, owner }
    }

    /// Label number.
    #[inline]
    pub const fn id(self) -> u32 {
        self.id
    }

    /// Construct that owns jumps to this label.
    #[inline]
    pub const fn owner(self) -> JumpConstruct {
        self.owner
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "L{}", self.id)
    }
}

/// An unencoded operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Operand {
    /// Field unused (encodes as 0).
    #[default]
    None,
    /// Immediate index, count or flags.
    Imm(u32),
    /// Frame slot.
    Slot(Slot),
    /// Pending jump target.
    Label(Label),
}

impl Operand {
    /// Value used for stack-effect computation; labels and slots count as 0.
    #[inline]
    pub const fn effect_arg(self) -> i32 {
        match self {
            Operand::Imm(n) => n as i32,
            _ => 0,
        }
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::None => Ok(()),
            Operand::Imm(n) => write!(f, "{n}"),
            Operand::Slot(slot) => fmt::Display::fmt(slot, f),
            Operand::Label(label) => fmt::Display::fmt(label, f),
        }
    }
}

/// An instruction before address resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Instruction {
    /// Operation.
    pub opcode: Opcode,
    /// A operand (8 bits when encoded).
    pub a: Operand,
    /// D operand (16 bits when encoded).
    pub d: Operand,
}

impl Instruction {
    /// Instruction with no operands.
    #[inline]
    pub const fn op(opcode: Opcode) -> Self {
        Self {
            opcode,
            a: Operand::None,
            d: Operand::None,
        }
    }

    /// Instruction with only an A operand.
    #[inline]
    pub const fn op_a(opcode: Opcode, a: Operand) -> Self {
        Self {
            opcode,
            a,
            d: Operand::None,
        }
    }

    /// Instruction with only a D operand.
    #[inline]
    pub const fn op_d(opcode: Opcode, d: Operand) -> Self {
        Self {
            opcode,
            a: Operand::None,
            d,
        }
    }

    /// Instruction with both operands.
    #[inline]
    pub const fn op_ad(opcode: Opcode, a: Operand, d: Operand) -> Self {
        Self { opcode, a, d }
    }

    /// Static stack effect of this instruction.
    #[inline]
    pub const fn stack_effect(&self) -> i32 {
        self.opcode
            .stack_effect(self.a.effect_arg(), self.d.effect_arg())
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.opcode.name())?;
        match (self.a, self.d) {
            (Operand::None, Operand::None) => Ok(()),
            (a, Operand::None) => write!(f, " {a}"),
            (Operand::None, d) => write!(f, " {d}"),
            (a, d) => write!(f, " {a}, {d}"),
        }
    }
}

/// Which operand fields an opcode uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstructionFormat {
    /// No operands.
    NoOp,
    /// A only.
    A,
    /// D only.
    D,
    /// A and D.
    AD,
}

/// Bytecode opcodes.
///
/// Opcodes are organized by category:
/// - 0x00-0x0F: Control flow
/// - 0x10-0x1F: Load/Store
/// - 0x20-0x2F: Unary operations
/// - 0x30-0x3F: Binary operations and comparison
/// - 0x40-0x4F: Container operations
/// - 0x50-0x5F: Functions and classes
/// - 0x60-0x6F: Imports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    // =========================================================================
    // Control Flow (0x00-0x0F)
    // =========================================================================
    /// No operation.
    Nop = 0x00,
    /// Return the accumulator.
    ReturnValue = 0x01,
    /// Unconditional relative jump.
    Jump = 0x02,
    /// Pop the accumulator, jump if it is falsy.
    PopJumpIfFalse = 0x03,
    /// Jump keeping the accumulator if falsy, else drop it.
    JumpIfFalseOrPop = 0x04,
    /// Jump keeping the accumulator if truthy, else drop it.
    JumpIfTrueOrPop = 0x05,
    /// Advance the iterator; on exhaustion drop it and jump.
    ForIter = 0x06,
    /// Replace the accumulator with an iterator over it.
    GetIter = 0x07,
    /// Raise D values (0 = re-raise).
    RaiseVarargs = 0x08,
    /// Discard the accumulator.
    ClearAcc = 0x09,

    // =========================================================================
    // Load/Store (0x10-0x1F)
    // =========================================================================
    /// acc = consts[D].
    LoadConst = 0x10,
    /// acc = frame[D].
    LoadFast = 0x11,
    /// frame[D] = acc.
    StoreFast = 0x12,
    /// acc = lookup(consts[D]).
    LoadName = 0x13,
    /// bind(consts[D]) = acc.
    StoreName = 0x14,
    /// acc = cells[D].contents.
    LoadDeref = 0x15,
    /// cells[D].contents = acc.
    StoreDeref = 0x16,
    /// acc = cells[D] (the cell itself).
    LoadClosure = 0x17,
    /// acc = acc.consts[D].
    LoadAttr = 0x18,
    /// obj.consts[D] = value.
    StoreAttr = 0x19,
    /// acc = frame[A][acc].
    BinarySubscr = 0x1A,
    /// frame[A][index] = value.
    StoreSubscr = 0x1B,

    // =========================================================================
    // Unary (0x20-0x2F)
    // =========================================================================
    /// acc = +acc.
    UnaryPositive = 0x20,
    /// acc = -acc.
    UnaryNegative = 0x21,
    /// acc = not acc.
    UnaryNot = 0x22,
    /// acc = ~acc.
    UnaryInvert = 0x23,

    // =========================================================================
    // Binary (0x30-0x3F): acc = frame[A] op acc
    // =========================================================================
    /// `+`
    BinaryAdd = 0x30,
    /// `-`
    BinarySubtract = 0x31,
    /// `*`
    BinaryMultiply = 0x32,
    /// `/`
    BinaryTrueDivide = 0x33,
    /// `//`
    BinaryFloorDivide = 0x34,
    /// `%`
    BinaryModulo = 0x35,
    /// `**`
    BinaryPower = 0x36,
    /// `<<`
    BinaryLshift = 0x37,
    /// `>>`
    BinaryRshift = 0x38,
    /// `&`
    BinaryAnd = 0x39,
    /// `|`
    BinaryOr = 0x3A,
    /// `^`
    BinaryXor = 0x3B,
    /// acc = frame[A] cmp_op[D] acc.
    CompareOp = 0x3C,

    // =========================================================================
    // Containers (0x40-0x4F)
    // =========================================================================
    /// Build a tuple from D values.
    BuildTuple = 0x40,
    /// Build a list from D values.
    BuildList = 0x41,
    /// Build a set from D values.
    BuildSet = 0x42,
    /// Build an empty map presized for D entries.
    BuildMap = 0x43,
    /// map[key] = value, keeping the map.
    StoreMap = 0x44,
    /// Unpack the accumulator into D values.
    UnpackSequence = 0x45,

    // =========================================================================
    // Functions and classes (0x50-0x5F)
    // =========================================================================
    /// Call with A positional and D keyword arguments.
    CallFunction = 0x50,
    /// Build a function from name, code and (flag 0x08) a cell tuple.
    MakeFunction = 0x51,
    /// Load the class-building builtin.
    LoadBuildClass = 0x52,

    // =========================================================================
    // Imports (0x60-0x6F)
    // =========================================================================
    /// Import module consts[D] given level and fromlist.
    ImportName = 0x60,
    /// acc = module.consts[D], keeping the module.
    ImportFrom = 0x61,
}

impl Opcode {
    /// Every opcode, in numeric order.
    pub const ALL: [Opcode; 50] = [
        Opcode::Nop,
        Opcode::ReturnValue,
        Opcode::Jump,
        Opcode::PopJumpIfFalse,
        Opcode::JumpIfFalseOrPop,
        Opcode::JumpIfTrueOrPop,
        Opcode::ForIter,
        Opcode::GetIter,
        Opcode::RaiseVarargs,
        Opcode::ClearAcc,
        Opcode::LoadConst,
        Opcode::LoadFast,
        Opcode::StoreFast,
        Opcode::LoadName,
        Opcode::StoreName,
        Opcode::LoadDeref,
        Opcode::StoreDeref,
        Opcode::LoadClosure,
        Opcode::LoadAttr,
        Opcode::StoreAttr,
        Opcode::BinarySubscr,
        Opcode::StoreSubscr,
        Opcode::UnaryPositive,
        Opcode::UnaryNegative,
        Opcode::UnaryNot,
        Opcode::UnaryInvert,
        Opcode::BinaryAdd,
        Opcode::BinarySubtract,
        Opcode::BinaryMultiply,
        Opcode::BinaryTrueDivide,
        Opcode::BinaryFloorDivide,
        Opcode::BinaryModulo,
        Opcode::BinaryPower,
        Opcode::BinaryLshift,
        Opcode::BinaryRshift,
        Opcode::BinaryAnd,
        Opcode::BinaryOr,
        Opcode::BinaryXor,
        Opcode::CompareOp,
        Opcode::BuildTuple,
        Opcode::BuildList,
        Opcode::BuildSet,
        Opcode::BuildMap,
        Opcode::StoreMap,
        Opcode::UnpackSequence,
        Opcode::CallFunction,
        Opcode::MakeFunction,
        Opcode::LoadBuildClass,
        Opcode::ImportName,
        Opcode::ImportFrom,
    ];

    /// Iterate over every opcode.
    pub fn iter() -> impl Iterator<Item = Opcode> {
        Self::ALL.into_iter()
    }

    /// Convert from u8, returning None if invalid.
    #[inline]
    pub fn from_u8(value: u8) -> Option<Self> {
        Self::iter().find(|op| *op as u8 == value)
    }

    /// Upper-case mnemonic used in listings.
    pub const fn name(self) -> &'static str {
        use Opcode::*;
        match self {
            Nop => "NOP",
            ReturnValue => "RETURN_VALUE",
            Jump => "JUMP",
            PopJumpIfFalse => "POP_JUMP_IF_FALSE",
            JumpIfFalseOrPop => "JUMP_IF_FALSE_OR_POP",
            JumpIfTrueOrPop => "JUMP_IF_TRUE_OR_POP",
            ForIter => "FOR_ITER",
            GetIter => "GET_ITER",
            RaiseVarargs => "RAISE_VARARGS",
            ClearAcc => "CLEAR_ACC",
            LoadConst => "LOAD_CONST",
            LoadFast => "LOAD_FAST",
            StoreFast => "STORE_FAST",
            LoadName => "LOAD_NAME",
            StoreName => "STORE_NAME",
            LoadDeref => "LOAD_DEREF",
            StoreDeref => "STORE_DEREF",
            LoadClosure => "LOAD_CLOSURE",
            LoadAttr => "LOAD_ATTR",
            StoreAttr => "STORE_ATTR",
            BinarySubscr => "BINARY_SUBSCR",
            StoreSubscr => "STORE_SUBSCR",
            UnaryPositive => "UNARY_POSITIVE",
            UnaryNegative => "UNARY_NEGATIVE",
            UnaryNot => "UNARY_NOT",
            UnaryInvert => "UNARY_INVERT",
            BinaryAdd => "BINARY_ADD",
            BinarySubtract => "BINARY_SUBTRACT",
            BinaryMultiply => "BINARY_MULTIPLY",
            BinaryTrueDivide => "BINARY_TRUE_DIVIDE",
            BinaryFloorDivide => "BINARY_FLOOR_DIVIDE",
            BinaryModulo => "BINARY_MODULO",
            BinaryPower => "BINARY_POWER",
            BinaryLshift => "BINARY_LSHIFT",
            BinaryRshift => "BINARY_RSHIFT",
            BinaryAnd => "BINARY_AND",
            BinaryOr => "BINARY_OR",
            BinaryXor => "BINARY_XOR",
            CompareOp => "COMPARE_OP",
            BuildTuple => "BUILD_TUPLE",
            BuildList => "BUILD_LIST",
            BuildSet => "BUILD_SET",
            BuildMap => "BUILD_MAP",
            StoreMap => "STORE_MAP",
            UnpackSequence => "UNPACK_SEQUENCE",
            CallFunction => "CALL_FUNCTION",
            MakeFunction => "MAKE_FUNCTION",
            LoadBuildClass => "LOAD_BUILD_CLASS",
            ImportName => "IMPORT_NAME",
            ImportFrom => "IMPORT_FROM",
        }
    }

    /// Get the operand format for this opcode.
    #[inline]
    pub const fn format(self) -> InstructionFormat {
        use InstructionFormat::*;
        use Opcode::*;

        match self {
            Nop | ReturnValue | GetIter | ClearAcc | UnaryPositive | UnaryNegative | UnaryNot
            | UnaryInvert | StoreMap | LoadBuildClass => NoOp,

            Jump | PopJumpIfFalse | JumpIfFalseOrPop | JumpIfTrueOrPop | ForIter
            | RaiseVarargs => D,

            LoadConst | LoadFast | StoreFast | LoadName | StoreName | LoadDeref | StoreDeref
            | LoadClosure | LoadAttr | StoreAttr => D,

            BinarySubscr | StoreSubscr | BinaryAdd | BinarySubtract | BinaryMultiply
            | BinaryTrueDivide | BinaryFloorDivide | BinaryModulo | BinaryPower | BinaryLshift
            | BinaryRshift | BinaryAnd | BinaryOr | BinaryXor => A,

            CompareOp | CallFunction => AD,
            MakeFunction => A,

            BuildTuple | BuildList | BuildSet | BuildMap | UnpackSequence => D,
            ImportName | ImportFrom => D,
        }
    }

    /// Whether D holds a signed displacement to a label.
    #[inline]
    pub const fn is_jump(self) -> bool {
        matches!(
            self,
            Opcode::Jump
                | Opcode::PopJumpIfFalse
                | Opcode::JumpIfFalseOrPop
                | Opcode::JumpIfTrueOrPop
                | Opcode::ForIter
        )
    }

    /// Static stack effect given the numeric A and D operands.
    ///
    /// Conditional jumps report the effect of the fall-through path; merge
    /// points compensate with stack-adjustment markers.
    pub const fn stack_effect(self, a: i32, d: i32) -> i32 {
        use Opcode::*;
        match self {
            Nop | Jump | JumpIfFalseOrPop | JumpIfTrueOrPop | GetIter => 0,
            ReturnValue | PopJumpIfFalse | ClearAcc => -1,
            ForIter => 1,
            RaiseVarargs => -d,

            LoadConst | LoadFast | LoadName | LoadDeref | LoadClosure => 1,
            StoreFast | StoreName | StoreDeref => -1,
            LoadAttr | BinarySubscr => 0,
            StoreAttr | StoreSubscr => -2,

            UnaryPositive | UnaryNegative | UnaryNot | UnaryInvert => 0,

            BinaryAdd | BinarySubtract | BinaryMultiply | BinaryTrueDivide
            | BinaryFloorDivide | BinaryModulo | BinaryPower | BinaryLshift | BinaryRshift
            | BinaryAnd | BinaryOr | BinaryXor | CompareOp => 0,

            BuildTuple | BuildList | BuildSet => 1 - d,
            BuildMap => 1,
            StoreMap => -2,
            UnpackSequence => d - 1,

            CallFunction => -(a + 2 * d),
            MakeFunction => {
                if a & MAKE_FUNCTION_CLOSURE as i32 != 0 {
                    -2
                } else {
                    -1
                }
            }
            LoadBuildClass => 1,

            ImportName => -1,
            ImportFrom => 1,
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One instruction read back from encoded bytecode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedInstruction {
    /// Byte offset of the instruction.
    pub offset: u32,
    /// Operation.
    pub opcode: Opcode,
    /// Raw A field.
    pub a: u8,
    /// Raw D field.
    pub d: u16,
}

impl DecodedInstruction {
    /// Decode the instruction at `offset`; `None` if the word is truncated or
    /// the opcode unknown.
    pub fn decode(code: &[u8], offset: u32) -> Option<Self> {
        let start = offset as usize;
        let word = code.get(start..start + INSTRUCTION_WIDTH as usize)?;
        Some(Self {
            offset,
            opcode: Opcode::from_u8(word[0])?,
            a: word[1],
            d: u16::from_le_bytes([word[2], word[3]]),
        })
    }

    /// Signed displacement held in D.
    #[inline]
    pub const fn displacement(&self) -> i16 {
        self.d as i16
    }

    /// Absolute target address for jumps.
    pub fn jump_target(&self) -> Option<u32> {
        if !self.opcode.is_jump() {
            return None;
        }
        let next = i64::from(self.offset) + i64::from(INSTRUCTION_WIDTH);
        u32::try_from(next + i64::from(self.displacement())).ok()
    }
}

/// Comparison operator index carried by `COMPARE_OP`.
pub const CMP_OPS: [&str; 10] = ["<", "<=", "==", "!=", ">", ">=", "in", "not in", "is", "is not"];

/// Index of a comparison operator in [`CMP_OPS`].
pub fn cmp_op_index(op: &str) -> Option<u32> {
    CMP_OPS.iter().position(|c| *c == op).map(|i| i as u32)
}
