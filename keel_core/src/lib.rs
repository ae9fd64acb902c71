//! # Keel Core
//!
//! Primitives shared by every stage of the Keel compiler:
//!
//! - **Spans**: source positions carried by AST nodes and line markers
//! - **Errors**: the compile error taxonomy and result alias

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

pub mod error;
pub mod span;

pub use error::{CompileError, CompileResult, JumpConstruct};
pub use span::Span;

/// Keel compiler version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
