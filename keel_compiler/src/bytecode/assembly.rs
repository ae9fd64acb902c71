//! Assembly IR and the assembler passes.
//!
//! Code generation produces an immutable tree of [`Assembly`] fragments that
//! are glued together with `+`. Nothing is laid out until the whole tree for
//! a code object exists; then four walks run over its leaves:
//!
//! 1. `resolve`: assign each label its byte address
//! 2. `encode`: emit 4-byte instruction words, patching jump displacements
//! 3. `plumb_depths`: compute the maximum operand stack depth
//! 4. `line_nos`: collect `(offset, line)` pairs for the line table
//!
//! Every walk is iterative, and dropping a tree unwinds chains through an
//! explicit stack, so neither long sequences nor left-deep chains grow the
//! native stack.

use super::instruction::{INSTRUCTION_WIDTH, Instruction, Label, Opcode, Operand, Slot};
use keel_core::{CompileError, CompileResult};
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use std::fmt;
use std::mem;
use std::ops::Add;
use std::rc::Rc;

#[derive(Debug)]
enum Node {
    NoOp,
    Label(Label),
    LineNo(u32),
    Instr(Instruction),
    Chain {
        first: Assembly,
        second: Assembly,
        length: u32,
    },
    OffsetStack,
}

impl Drop for Node {
    fn drop(&mut self) {
        let Node::Chain { first, second, .. } = self else {
            return;
        };
        let mut pending = vec![mem::take(first), mem::take(second)];
        while let Some(assembly) = pending.pop() {
            // Shared subtrees stay alive and are released by their last owner.
            if let Ok(mut node) = Rc::try_unwrap(assembly.0) {
                if let Node::Chain { first, second, .. } = &mut node {
                    pending.push(mem::take(first));
                    pending.push(mem::take(second));
                }
            }
        }
    }
}

/// A fragment of not-yet-encoded code.
///
/// Cloning is cheap (reference counted) and fragments are never mutated, so
/// a fragment can appear in several trees.
#[derive(Clone)]
pub struct Assembly(Rc<Node>);

/// A leaf of an [`Assembly`] tree, as seen by the assembler walks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Leaf {
    /// Jump target definition.
    Label(Label),
    /// Source line marker.
    LineNo(u32),
    /// An instruction.
    Instr(Instruction),
    /// Stack-depth adjustment of -1.
    OffsetStack,
}

impl Assembly {
    fn from_node(node: Node) -> Self {
        Assembly(Rc::new(node))
    }

    /// The empty fragment; identity for `+`.
    pub fn no_op() -> Self {
        Self::from_node(Node::NoOp)
    }

    /// Define `label` at the current position.
    pub fn label(label: Label) -> Self {
        Self::from_node(Node::Label(label))
    }

    /// Mark the start of code for source `line`.
    pub fn line_no(line: u32) -> Self {
        Self::from_node(Node::LineNo(line))
    }

    /// A single instruction.
    pub fn instr(instruction: Instruction) -> Self {
        Self::from_node(Node::Instr(instruction))
    }

    /// Decrement the tracked stack depth at a control-flow merge point.
    ///
    /// Conditional jumps are accounted along their fall-through path, which
    /// overcounts by one where a kept value from the other path merges.
    pub fn offset_stack() -> Self {
        Self::from_node(Node::OffsetStack)
    }

    /// Concatenate fragments in order.
    ///
    /// Builds a balanced tree so that dropping a long sequence stays shallow.
    pub fn concat(parts: impl IntoIterator<Item = Assembly>) -> Self {
        let parts: Vec<Assembly> = parts.into_iter().filter(|p| !p.is_no_op()).collect();
        Self::concat_slice(&parts)
    }

    fn concat_slice(parts: &[Assembly]) -> Self {
        match parts {
            [] => Self::no_op(),
            [one] => one.clone(),
            _ => {
                let (left, right) = parts.split_at(parts.len() / 2);
                Self::concat_slice(left) + Self::concat_slice(right)
            }
        }
    }

    /// Encoded size in bytes.
    #[inline]
    pub fn len(&self) -> u32 {
        match &*self.0 {
            Node::Instr(_) => INSTRUCTION_WIDTH,
            Node::Chain { length, .. } => *length,
            _ => 0,
        }
    }

    /// Check if this fragment encodes to no bytes.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn is_no_op(&self) -> bool {
        matches!(&*self.0, Node::NoOp)
    }

    /// Iterate over leaves with their byte offsets.
    pub fn leaves(&self) -> Leaves<'_> {
        let mut stack = SmallVec::new();
        stack.push(self);
        Leaves { stack, offset: 0 }
    }

    // =========================================================================
    // Assembler passes
    // =========================================================================

    /// Assign every label its byte address.
    pub fn resolve(&self) -> CompileResult<FxHashMap<Label, u32>> {
        let mut addresses = FxHashMap::default();
        for (offset, leaf) in self.leaves() {
            if let Leaf::Label(label) = leaf {
                if addresses.insert(label, offset).is_some() {
                    return Err(CompileError::internal(format!(
                        "label {label} defined more than once"
                    )));
                }
            }
        }
        Ok(addresses)
    }

    /// Encode to bytes, given resolved label addresses and the frame layout
    /// for register slots.
    pub fn encode(
        &self,
        addresses: &FxHashMap<Label, u32>,
        frame: FrameLayout,
    ) -> CompileResult<Vec<u8>> {
        let mut code = Vec::with_capacity(self.len() as usize);
        let mut line = 0;
        for (start, leaf) in self.leaves() {
            match leaf {
                Leaf::LineNo(n) => line = n,
                Leaf::Instr(instr) => {
                    let a = encode_a(instr.a, frame)?;
                    let d = if instr.opcode.is_jump() {
                        encode_jump(instr, start, line, addresses)?
                    } else {
                        encode_d(instr.d, frame)?
                    };
                    let [lo, hi] = d.to_le_bytes();
                    code.extend_from_slice(&[instr.opcode as u8, a, lo, hi]);
                }
                Leaf::Label(_) | Leaf::OffsetStack => {}
            }
        }
        if code.len() != self.len() as usize {
            return Err(CompileError::internal(format!(
                "encoded {} bytes but layout reserved {}",
                code.len(),
                self.len()
            )));
        }
        Ok(code)
    }

    /// Maximum operand stack depth reached along the fall-through path.
    pub fn plumb_depths(&self) -> u32 {
        let mut depth: i64 = 0;
        let mut max: i64 = 0;
        for (_, leaf) in self.leaves() {
            match leaf {
                Leaf::Instr(instr) => depth += i64::from(instr.stack_effect()),
                Leaf::OffsetStack => depth -= 1,
                Leaf::Label(_) | Leaf::LineNo(_) => continue,
            }
            max = max.max(depth);
        }
        u32::try_from(max).unwrap_or(u32::MAX)
    }

    /// `(offset, line)` for every line marker, in code order.
    pub fn line_nos(&self) -> Vec<(u32, u32)> {
        self.leaves()
            .filter_map(|(offset, leaf)| match leaf {
                Leaf::LineNo(line) => Some((offset, line)),
                _ => None,
            })
            .collect()
    }
}

impl Default for Assembly {
    fn default() -> Self {
        Self::no_op()
    }
}

impl From<Instruction> for Assembly {
    fn from(instruction: Instruction) -> Self {
        Self::instr(instruction)
    }
}

impl Add for Assembly {
    type Output = Assembly;

    fn add(self, rhs: Assembly) -> Assembly {
        if self.is_no_op() {
            return rhs;
        }
        if rhs.is_no_op() {
            return self;
        }
        let length = self.len() + rhs.len();
        Assembly::from_node(Node::Chain {
            first: self,
            second: rhs,
            length,
        })
    }
}

impl Add<Instruction> for Assembly {
    type Output = Assembly;

    fn add(self, rhs: Instruction) -> Assembly {
        self + Assembly::instr(rhs)
    }
}

impl fmt::Debug for Assembly {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut list = f.debug_list();
        for (offset, leaf) in self.leaves() {
            match leaf {
                Leaf::Label(label) => list.entry(&format_args!("{label}:")),
                Leaf::LineNo(line) => list.entry(&format_args!("# line {line}")),
                Leaf::Instr(instr) => list.entry(&format_args!("{offset:>4} {instr}")),
                Leaf::OffsetStack => list.entry(&format_args!("<offset stack>")),
            };
        }
        list.finish()
    }
}

/// Iterator over the leaves of an [`Assembly`], depth first.
pub struct Leaves<'a> {
    stack: SmallVec<[&'a Assembly; 16]>,
    offset: u32,
}

impl Iterator for Leaves<'_> {
    type Item = (u32, Leaf);

    fn next(&mut self) -> Option<Self::Item> {
        while let Some(node) = self.stack.pop() {
            let leaf = match &*node.0 {
                Node::NoOp => continue,
                Node::Chain { first, second, .. } => {
                    self.stack.push(second);
                    self.stack.push(first);
                    continue;
                }
                Node::Label(label) => Leaf::Label(*label),
                Node::LineNo(line) => Leaf::LineNo(*line),
                Node::Instr(instr) => Leaf::Instr(*instr),
                Node::OffsetStack => Leaf::OffsetStack,
            };
            let start = self.offset;
            self.offset += node.len();
            return Some((start, leaf));
        }
        None
    }
}

// =============================================================================
// Operand encoding
// =============================================================================

/// Frame layout used to place scratch registers after the locals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameLayout {
    /// Number of local variable slots.
    pub nlocals: u32,
    /// Register high-water mark.
    pub nregisters: u32,
}

impl FrameLayout {
    /// Absolute frame slot of `slot`.
    pub fn slot_index(self, slot: Slot) -> CompileResult<u32> {
        match slot {
            Slot::Local(local) => Ok(u32::from(local.0)),
            Slot::Register(reg) => {
                let r = u32::from(reg.index());
                if r >= self.nregisters {
                    return Err(CompileError::internal(format!(
                        "register {reg} used but only {} allocated",
                        self.nregisters
                    )));
                }
                Ok(self.nlocals + r)
            }
        }
    }
}

fn encode_a(operand: Operand, frame: FrameLayout) -> CompileResult<u8> {
    let value = match operand {
        Operand::None => return Ok(0),
        Operand::Imm(n) => n,
        Operand::Slot(slot) => frame.slot_index(slot)?,
        Operand::Label(label) => {
            return Err(CompileError::internal(format!(
                "label {label} used as an A operand"
            )));
        }
    };
    u8::try_from(value).map_err(|_| CompileError::overflow("A operand", value, u8::MAX))
}

fn encode_d(operand: Operand, frame: FrameLayout) -> CompileResult<u16> {
    let value = match operand {
        Operand::None => return Ok(0),
        Operand::Imm(n) => n,
        Operand::Slot(slot) => frame.slot_index(slot)?,
        Operand::Label(label) => {
            return Err(CompileError::internal(format!(
                "label {label} passed to non-jump instruction"
            )));
        }
    };
    u16::try_from(value).map_err(|_| CompileError::overflow("D operand", value, u16::MAX))
}

fn encode_jump(
    instr: Instruction,
    start: u32,
    line: u32,
    addresses: &FxHashMap<Label, u32>,
) -> CompileResult<u16> {
    let Operand::Label(label) = instr.d else {
        return Err(CompileError::internal(format!(
            "{} at offset {start} has no target label",
            instr.opcode
        )));
    };
    let target = addresses
        .get(&label)
        .copied()
        .ok_or_else(|| CompileError::internal(format!("jump to undefined label {label}")))?;
    let displacement = i64::from(target) - (i64::from(start) + i64::from(INSTRUCTION_WIDTH));
    let d = i16::try_from(displacement).map_err(|_| CompileError::DisplacementOutOfRange {
        construct: label.owner(),
        line,
        offset: start,
        displacement,
    })?;
    Ok(d as u16)
}

/// Convenience for building a jump instruction.
#[inline]
pub fn jump(opcode: Opcode, target: Label) -> Instruction {
    Instruction::op_d(opcode, Operand::Label(target))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::instruction::Register;
    use keel_core::JumpConstruct;

    fn load_const(i: u32) -> Assembly {
        Assembly::instr(Instruction::op_d(Opcode::LoadConst, Operand::Imm(i)))
    }

    fn op(opcode: Opcode) -> Assembly {
        Assembly::instr(Instruction::op(opcode))
    }

    #[test]
    fn test_no_op_is_identity() {
        let a = load_const(0);
        assert_eq!((Assembly::no_op() + a.clone()).len(), 4);
        assert_eq!((a + Assembly::no_op()).len(), 4);
        assert!(Assembly::no_op().is_empty());
    }

    #[test]
    fn test_chain_length_and_offsets() {
        let asm = Assembly::line_no(1) + load_const(0) + Assembly::line_no(2) + op(Opcode::ReturnValue);
        assert_eq!(asm.len(), 8);
        assert_eq!(asm.line_nos(), vec![(0, 1), (4, 2)]);
    }

    #[test]
    fn test_concat_preserves_order() {
        let parts: Vec<_> = (0..7).map(load_const).collect();
        let asm = Assembly::concat(parts);
        let consts: Vec<_> = asm
            .leaves()
            .filter_map(|(_, leaf)| match leaf {
                Leaf::Instr(i) => Some(i.d),
                _ => None,
            })
            .collect();
        assert_eq!(consts, (0..7).map(Operand::Imm).collect::<Vec<_>>());
    }

    #[test]
    fn test_resolve_and_encode_backward_jump() {
        let top = Label::new(0, JumpConstruct::While);
        let asm = Assembly::label(top) + load_const(0) + jump(Opcode::Jump, top);
        let addresses = asm.resolve().unwrap();
        assert_eq!(addresses[&top], 0);

        let code = asm.encode(&addresses, FrameLayout::default()).unwrap();
        assert_eq!(code.len(), 8);
        // JUMP at 4: displacement = 0 - (4 + 4) = -8
        assert_eq!(i16::from_le_bytes([code[6], code[7]]), -8);
    }

    #[test]
    fn test_duplicate_label_is_internal() {
        let l = Label::new(3, JumpConstruct::If);
        let asm = Assembly::label(l) + load_const(0) + Assembly::label(l);
        assert!(asm.resolve().unwrap_err().is_internal());
    }

    #[test]
    fn test_unknown_label_is_internal() {
        let l = Label::new(9, JumpConstruct::If);
        let asm = Assembly::from(jump(Opcode::Jump, l));
        let err = asm.encode(&FxHashMap::default(), FrameLayout::default());
        assert!(err.unwrap_err().is_internal());
    }

    #[test]
    fn test_displacement_out_of_range() {
        let end = Label::new(0, JumpConstruct::If);
        let filler = Assembly::concat((0..9000).map(|_| op(Opcode::Nop)));
        let asm = Assembly::line_no(5)
            + jump(Opcode::PopJumpIfFalse, end)
            + filler
            + Assembly::label(end);
        let addresses = asm.resolve().unwrap();
        match asm.encode(&addresses, FrameLayout::default()) {
            Err(CompileError::DisplacementOutOfRange {
                construct,
                line,
                offset,
                displacement,
            }) => {
                assert_eq!(construct, JumpConstruct::If);
                assert_eq!(line, 5);
                assert_eq!(offset, 0);
                assert_eq!(displacement, 36000);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_register_slots_follow_locals() {
        let store = Instruction::op_d(
            Opcode::StoreFast,
            Operand::Slot(Slot::Register(Register::new(1))),
        );
        let asm = Assembly::instr(store);
        let frame = FrameLayout {
            nlocals: 3,
            nregisters: 2,
        };
        let code = asm.encode(&FxHashMap::default(), frame).unwrap();
        assert_eq!(code, vec![Opcode::StoreFast as u8, 0, 4, 0]);
    }

    #[test]
    fn test_unallocated_register_is_internal() {
        let frame = FrameLayout {
            nlocals: 0,
            nregisters: 1,
        };
        let err = frame.slot_index(Slot::Register(Register::new(1))).unwrap_err();
        assert!(err.is_internal());
    }

    #[test]
    fn test_operand_overflow() {
        let asm = load_const(70_000);
        let err = asm
            .encode(&FxHashMap::default(), FrameLayout::default())
            .unwrap_err();
        assert!(matches!(err, CompileError::OperandOverflow { value: 70_000, .. }));
    }

    #[test]
    fn test_plumb_depths() {
        // a, b, build_list(2), return
        let asm = load_const(0)
            + load_const(1)
            + Instruction::op_d(Opcode::BuildList, Operand::Imm(2))
            + op(Opcode::ReturnValue);
        assert_eq!(asm.plumb_depths(), 2);
    }

    #[test]
    fn test_offset_stack_lowers_depth() {
        let asm = load_const(0) + Assembly::offset_stack() + load_const(1) + load_const(2);
        assert_eq!(asm.plumb_depths(), 2);
    }

    #[test]
    fn test_left_deep_chain_drops() {
        let mut asm = Assembly::no_op();
        for i in 0..200_000 {
            asm = asm + load_const(i % 8);
        }
        assert_eq!(asm.len(), 800_000);
        drop(asm);
    }

    #[test]
    fn test_shared_subtree_survives_drop() {
        let shared = load_const(0) + load_const(1);
        let outer = shared.clone() + op(Opcode::ReturnValue);
        drop(outer);
        assert_eq!(shared.len(), 8);
        assert_eq!(shared.leaves().count(), 2);
    }

    #[test]
    fn test_depth_never_negative() {
        assert_eq!(op(Opcode::ClearAcc).plumb_depths(), 0);
    }
}
