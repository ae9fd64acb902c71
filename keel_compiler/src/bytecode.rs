//! Bytecode definitions: the instruction set, the assembly IR that the code
//! generator produces, and the finished code objects.

pub mod assembly;
pub mod code_object;
pub mod instruction;
pub mod line_table;

pub use assembly::{Assembly, FrameLayout, Leaf};
pub use code_object::{CodeFlags, CodeObject, Constant, disassemble};
pub use instruction::{
    DecodedInstruction, INSTRUCTION_WIDTH, Instruction, InstructionFormat, Label, LocalSlot,
    Opcode, Operand, Register, Slot,
};
pub use line_table::{LineTable, LineTableEntry};
