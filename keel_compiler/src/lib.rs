//! Bytecode compiler for Keel.
//!
//! This crate compiles a parsed module into code objects for a register and
//! accumulator virtual machine.
//!
//! # Architecture
//!
//! ```text
//! AST → Desugar → Conformity → Scope Analysis → CodeGen → Assembly → CodeObject
//! ```
//!
//! # Key Types
//!
//! - [`Compiler`] - Pipeline entry point
//! - [`CodeObject`] - Compiled module, function or class body
//! - [`Assembly`] - Instruction tree with labels, line and stack markers
//! - [`Instruction`] - 32-bit instruction with symbolic operands
//! - [`Opcode`] - Bytecode operation enumeration
//!
//! # Example
//!
//! ```
//! use keel_ast::{Constant as Lit, Expr, ExprContext, Module, Span, Stmt};
//! use keel_compiler::{Opcode, compile_module};
//!
//! // x = 1
//! let module = Module::new(vec![Stmt::assign(
//!     Expr::name("x", ExprContext::Store, Span::line(1)),
//!     Expr::constant(Lit::Int(1), Span::line(1)),
//!     Span::line(1),
//! )]);
//!
//! let code = compile_module(&module, "<module>", "example.py").unwrap();
//! let ops: Vec<_> = code.instructions().map(|i| i.opcode).collect();
//! assert_eq!(
//!     ops,
//!     [Opcode::LoadConst, Opcode::StoreName, Opcode::LoadConst, Opcode::ReturnValue]
//! );
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod bytecode;
pub mod class_compiler;
pub mod compiler;
pub mod conformity;
pub mod desugar;
pub mod scope;
pub mod tables;

// Re-export main types
pub use bytecode::{
    Assembly, CodeFlags, CodeObject, Constant, DecodedInstruction, FrameLayout, Instruction,
    InstructionFormat, Label, LineTable, LineTableEntry, LocalSlot, Opcode, Operand, Register,
    Slot, disassemble,
};
pub use class_compiler::ClassCompiler;
pub use compiler::{CodeGen, Compiler, compile_module};
pub use conformity::{ConformityCheck, SubsetChecker};
pub use desugar::desugar;
pub use keel_core::{CompileError, CompileResult, JumpConstruct};
pub use scope::{Access, Scope, ScopeKind};
