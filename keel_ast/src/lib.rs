//! Abstract syntax tree for the Keel compiler.
//!
//! The tree is produced by an external parser and consumed by
//! `keel_compiler`. See [`ast`] for the node types.

#![warn(missing_docs)]

pub mod ast;

pub use ast::{
    Alias, Arg, Arguments, BinOp, BoolOp, ClassDef, CmpOp, Comprehension, Constant, Expr,
    ExprContext, ExprKind, Function, Keyword, Module, Stmt, StmtKind, UnaryOp,
};
pub use keel_core::Span;
