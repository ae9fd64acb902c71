//! Code objects: the compiler's output.

use super::instruction::{CMP_OPS, DecodedInstruction, INSTRUCTION_WIDTH, InstructionFormat, Opcode};
use super::line_table::LineTable;
use std::fmt::{self, Write as _};
use std::ops::BitOr;
use std::sync::Arc;

/// Code object flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct CodeFlags(u32);

impl CodeFlags {
    /// No flags.
    pub const NONE: CodeFlags = CodeFlags(0);
    /// The frame has local variable slots.
    pub const NEWLOCALS: CodeFlags = CodeFlags(0x02);
    /// Accepts `*args`.
    pub const VARARGS: CodeFlags = CodeFlags(0x04);
    /// Accepts `**kwargs`.
    pub const VARKEYWORDS: CodeFlags = CodeFlags(0x08);
    /// Has free variables (is a closure).
    pub const NESTED: CodeFlags = CodeFlags(0x10);
    /// No cell or free variables at all.
    pub const NOFREE: CodeFlags = CodeFlags(0x40);

    /// Raw bit pattern.
    #[inline]
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Check if all bits of `other` are set.
    #[inline]
    pub const fn contains(self, other: CodeFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for CodeFlags {
    type Output = CodeFlags;

    fn bitor(self, rhs: CodeFlags) -> CodeFlags {
        CodeFlags(self.0 | rhs.0)
    }
}

/// A value in a code object's constant pool.
#[derive(Debug, Clone, PartialEq)]
pub enum Constant {
    /// `None`.
    None,
    /// `True` / `False`.
    Bool(bool),
    /// Integer.
    Int(i64),
    /// Float.
    Float(f64),
    /// String (also used for names).
    Str(Arc<str>),
    /// Bytes.
    Bytes(Arc<[u8]>),
    /// `...`.
    Ellipsis,
    /// Tuple of constants.
    Tuple(Arc<[Constant]>),
    /// Nested code object.
    Code(Arc<CodeObject>),
}

impl Constant {
    /// String constant.
    pub fn str(s: &str) -> Self {
        Constant::Str(Arc::from(s))
    }

    /// Tuple of string constants.
    pub fn str_tuple<'a>(items: impl IntoIterator<Item = &'a str>) -> Self {
        Constant::Tuple(items.into_iter().map(Constant::str).collect())
    }

    /// String payload, if this is a string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Constant::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Nested code object, if this is one.
    pub fn as_code(&self) -> Option<&Arc<CodeObject>> {
        match self {
            Constant::Code(code) => Some(code),
            _ => None,
        }
    }
}

impl From<&keel_ast::Constant> for Constant {
    fn from(value: &keel_ast::Constant) -> Self {
        match value {
            keel_ast::Constant::None => Constant::None,
            keel_ast::Constant::Bool(b) => Constant::Bool(*b),
            keel_ast::Constant::Int(n) => Constant::Int(*n),
            keel_ast::Constant::Float(x) => Constant::Float(*x),
            keel_ast::Constant::Str(s) => Constant::str(s),
            keel_ast::Constant::Bytes(b) => Constant::Bytes(Arc::from(b.as_slice())),
            keel_ast::Constant::Ellipsis => Constant::Ellipsis,
        }
    }
}

impl fmt::Display for Constant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Constant::None => f.write_str("None"),
            Constant::Bool(true) => f.write_str("True"),
            Constant::Bool(false) => f.write_str("False"),
            Constant::Int(n) => write!(f, "{n}"),
            Constant::Float(x) => write!(f, "{x:?}"),
            Constant::Str(s) => write!(f, "{s:?}"),
            Constant::Bytes(b) => write!(f, "b{:?}", String::from_utf8_lossy(b)),
            Constant::Ellipsis => f.write_str("Ellipsis"),
            Constant::Tuple(items) => {
                f.write_str("(")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                if items.len() == 1 {
                    f.write_str(",")?;
                }
                f.write_str(")")
            }
            Constant::Code(code) => write!(f, "<code {}>", code.name),
        }
    }
}

/// A compiled module, function or class body.
///
/// Immutable once built; nested code objects are shared through
/// [`Constant::Code`].
#[derive(Debug, Clone, PartialEq)]
pub struct CodeObject {
    /// Name (`<module>`, function or class name).
    pub name: Arc<str>,
    /// Dotted qualified name.
    pub qualname: Arc<str>,
    /// Source file name.
    pub filename: Arc<str>,
    /// Encoded instructions.
    pub code: Box<[u8]>,
    /// Constant pool (literals, names, nested code).
    pub constants: Box<[Constant]>,
    /// Local variable names by slot.
    pub varnames: Box<[Arc<str>]>,
    /// Variables captured from enclosing scopes.
    pub freevars: Box<[Arc<str>]>,
    /// Local variables captured by nested scopes.
    pub cellvars: Box<[Arc<str>]>,
    /// Number of positional parameters, including positional-only.
    pub argcount: u32,
    /// Number of positional-only parameters.
    pub posonlyargcount: u32,
    /// Number of keyword-only parameters.
    pub kwonlyargcount: u32,
    /// Number of local variable slots.
    pub nlocals: u32,
    /// Number of scratch registers after the locals.
    pub nregisters: u32,
    /// Maximum operand stack depth.
    pub stacksize: u32,
    /// Total frame slots: locals, registers and stack.
    pub framesize: u32,
    /// Code flags.
    pub flags: CodeFlags,
    /// Line table.
    pub linetable: LineTable,
}

impl CodeObject {
    /// Line of the first line marker.
    #[inline]
    pub fn first_lineno(&self) -> u32 {
        self.linetable.first_line()
    }

    /// Decode the instruction stream.
    pub fn instructions(&self) -> impl Iterator<Item = DecodedInstruction> + '_ {
        (0..self.code.len() as u32)
            .step_by(INSTRUCTION_WIDTH as usize)
            .map_while(|offset| DecodedInstruction::decode(&self.code, offset))
    }

    /// Code objects stored directly in the constant pool.
    pub fn nested_code_objects(&self) -> impl Iterator<Item = &Arc<CodeObject>> {
        self.constants.iter().filter_map(Constant::as_code)
    }

    /// Cell variables followed by free variables.
    pub fn derefvars(&self) -> impl Iterator<Item = &Arc<str>> {
        self.cellvars.iter().chain(self.freevars.iter())
    }

    /// Name of the frame slot `slot` (a local or a register).
    pub fn slot_name(&self, slot: u32) -> String {
        match self.varnames.get(slot as usize) {
            Some(name) => name.to_string(),
            None => format!("r{}", slot.saturating_sub(self.nlocals)),
        }
    }

    /// Operand annotation shown by the disassembler.
    fn describe(&self, inst: &DecodedInstruction) -> Option<String> {
        use Opcode::*;
        let d = usize::from(inst.d);
        match inst.opcode {
            LoadConst => self.constants.get(d).map(ToString::to_string),
            LoadName | StoreName | LoadAttr | StoreAttr | ImportName | ImportFrom => self
                .constants
                .get(d)
                .and_then(Constant::as_str)
                .map(str::to_owned),
            LoadFast | StoreFast => Some(self.slot_name(u32::from(inst.d))),
            LoadDeref | StoreDeref | LoadClosure => self.derefvars().nth(d).map(|n| n.to_string()),
            CompareOp => Some(format!(
                "{} {}",
                self.slot_name(u32::from(inst.a)),
                CMP_OPS.get(d).copied().unwrap_or("?")
            )),
            BinarySubscr | StoreSubscr | BinaryAdd | BinarySubtract | BinaryMultiply
            | BinaryTrueDivide | BinaryFloorDivide | BinaryModulo | BinaryPower | BinaryLshift
            | BinaryRshift | BinaryAnd | BinaryOr | BinaryXor => {
                Some(self.slot_name(u32::from(inst.a)))
            }
            _ => inst.jump_target().map(|t| format!("to {t}")),
        }
    }
}

/// Render a listing of `code` and, after it, every nested code object.
pub fn disassemble(code: &CodeObject) -> String {
    let mut out = String::new();
    let mut pending = vec![code];
    while let Some(code) = pending.pop() {
        if !out.is_empty() {
            out.push('\n');
        }
        disassemble_one(code, &mut out);
        let nested: Vec<_> = code.nested_code_objects().map(Arc::as_ref).collect();
        pending.extend(nested.into_iter().rev());
    }
    out
}

fn disassemble_one(code: &CodeObject, out: &mut String) {
    let _ = writeln!(
        out,
        "Disassembly of {} ({}, line {}):",
        code.qualname,
        code.filename,
        code.first_lineno()
    );
    let mut last_line = 0;
    for inst in code.instructions() {
        let line = code.linetable.line_for_offset(inst.offset);
        let line_col = if line != last_line {
            last_line = line;
            line.to_string()
        } else {
            String::new()
        };

        let operands = match inst.opcode.format() {
            InstructionFormat::NoOp => String::new(),
            InstructionFormat::A => inst.a.to_string(),
            InstructionFormat::D if inst.opcode.is_jump() => {
                inst.displacement().to_string()
            }
            InstructionFormat::D => inst.d.to_string(),
            InstructionFormat::AD => format!("{}, {}", inst.a, inst.d),
        };

        let _ = write!(
            out,
            "{line_col:>4} {:>6} {:<22}{operands:>8}",
            inst.offset,
            inst.opcode.name()
        );
        if let Some(note) = code.describe(&inst) {
            let _ = write!(out, " ({note})");
        }
        out.push('\n');
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn code_with(bytes: Vec<u8>, constants: Vec<Constant>) -> CodeObject {
        CodeObject {
            name: Arc::from("<module>"),
            qualname: Arc::from("<module>"),
            filename: Arc::from("test.py"),
            code: bytes.into_boxed_slice(),
            constants: constants.into_boxed_slice(),
            varnames: Box::default(),
            freevars: Box::default(),
            cellvars: Box::default(),
            argcount: 0,
            posonlyargcount: 0,
            kwonlyargcount: 0,
            nlocals: 0,
            nregisters: 0,
            stacksize: 1,
            framesize: 1,
            flags: CodeFlags::NOFREE,
            linetable: LineTable::from_line_nos(&[(0, 1)]),
        }
    }

    #[test]
    fn test_flags() {
        let flags = CodeFlags::NEWLOCALS | CodeFlags::NOFREE;
        assert_eq!(flags.bits(), 0x42);
        assert!(flags.contains(CodeFlags::NOFREE));
        assert!(!flags.contains(CodeFlags::NESTED));
    }

    #[test]
    fn test_constant_display() {
        assert_eq!(Constant::None.to_string(), "None");
        assert_eq!(Constant::Bool(true).to_string(), "True");
        assert_eq!(Constant::Float(1.0).to_string(), "1.0");
        assert_eq!(Constant::str("x").to_string(), "\"x\"");
        assert_eq!(Constant::str_tuple(["a"]).to_string(), "(\"a\",)");
        assert_eq!(Constant::str_tuple(["a", "b"]).to_string(), "(\"a\", \"b\")");
    }

    #[test]
    fn test_instructions_decode() {
        let code = code_with(
            vec![Opcode::LoadConst as u8, 0, 0, 0, Opcode::ReturnValue as u8, 0, 0, 0],
            vec![Constant::None],
        );
        let ops: Vec<_> = code.instructions().map(|i| i.opcode).collect();
        assert_eq!(ops, [Opcode::LoadConst, Opcode::ReturnValue]);
    }

    #[test]
    fn test_disassemble_annotates_constants() {
        let code = code_with(
            vec![Opcode::LoadConst as u8, 0, 0, 0, Opcode::ReturnValue as u8, 0, 0, 0],
            vec![Constant::None],
        );
        let listing = disassemble(&code);
        assert!(listing.starts_with("Disassembly of <module> (test.py, line 1):"));
        assert!(listing.contains("LOAD_CONST"));
        assert!(listing.contains("(None)"));
        assert!(listing.contains("RETURN_VALUE"));
    }

    #[test]
    fn test_disassemble_recurses_into_nested_code() {
        let inner = code_with(vec![Opcode::ReturnValue as u8, 0, 0, 0], vec![]);
        let mut inner = inner;
        inner.qualname = Arc::from("f");
        let outer = code_with(
            vec![Opcode::LoadConst as u8, 0, 0, 0],
            vec![Constant::Code(Arc::new(inner))],
        );
        assert_eq!(outer.nested_code_objects().count(), 1);
        let listing = disassemble(&outer);
        assert!(listing.contains("Disassembly of f"));
    }

    #[test]
    fn test_slot_name_for_registers() {
        let mut code = code_with(vec![], vec![]);
        code.varnames = vec![Arc::from("x")].into_boxed_slice();
        code.nlocals = 1;
        assert_eq!(code.slot_name(0), "x");
        assert_eq!(code.slot_name(2), "r1");
    }
}
