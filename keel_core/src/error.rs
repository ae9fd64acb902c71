//! Error types and result definitions for Keel.
//!
//! Every failure is fatal to the module being compiled: the pipeline is a
//! deterministic function of its input, so there is nothing to retry and no
//! partial code object is ever returned.
//!
//! - Unsupported constructs (no translation rule, or rejected by the
//!   conformity checker)
//! - Jump displacements that do not fit the signed 16-bit operand
//! - Operands that exceed their encoding field
//! - Internal consistency violations (code generation defects)

use crate::span::Span;
use std::fmt;
use thiserror::Error;

/// The result type used throughout the compiler.
pub type CompileResult<T> = Result<T, CompileError>;

/// Control-flow construct that owns a jump instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JumpConstruct {
    /// `if` statement.
    If,
    /// Conditional expression `a if c else b`.
    IfExp,
    /// Short-circuit `and`.
    And,
    /// Short-circuit `or`.
    Or,
    /// `while` loop.
    While,
    /// `for` loop.
    For,
}

impl JumpConstruct {
    /// Source-level spelling of the construct.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::If => "if statement",
            Self::IfExp => "conditional expression",
            Self::And => "'and' expression",
            Self::Or => "'or' expression",
            Self::While => "while loop",
            Self::For => "for loop",
        }
    }
}

impl fmt::Display for JumpConstruct {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Compilation failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CompileError {
    /// The tree contains a node outside the supported grammar subset.
    #[error("unsupported construct at {span}: {construct}")]
    Unsupported {
        /// Description of the offending construct.
        construct: String,
        /// Where it appeared.
        span: Span,
    },

    /// A jump target is too far away for the 16-bit displacement operand.
    #[error(
        "jump displacement {displacement} out of range in {construct} (line {line}, offset {offset})"
    )]
    DisplacementOutOfRange {
        /// The construct whose jump overflowed.
        construct: JumpConstruct,
        /// Source line active at the jump (0 if unknown).
        line: u32,
        /// Byte offset of the jump instruction.
        offset: u32,
        /// The displacement that did not fit.
        displacement: i64,
    },

    /// An operand does not fit its encoding field.
    #[error("{what} {value} exceeds the encodable limit {limit}")]
    OperandOverflow {
        /// What kind of operand overflowed.
        what: &'static str,
        /// The offending value.
        value: u64,
        /// The largest encodable value.
        limit: u64,
    },

    /// The code generator produced inconsistent output.
    #[error("internal compiler error: {message}")]
    Internal {
        /// Description of the inconsistency.
        message: String,
    },
}

impl CompileError {
    /// Create an unsupported-construct error.
    #[must_use]
    pub fn unsupported(construct: impl Into<String>, span: Span) -> Self {
        Self::Unsupported {
            construct: construct.into(),
            span,
        }
    }

    /// Create an internal consistency error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Create an operand overflow error.
    #[must_use]
    pub fn overflow(what: &'static str, value: impl Into<u64>, limit: impl Into<u64>) -> Self {
        Self::OperandOverflow {
            what,
            value: value.into(),
            limit: limit.into(),
        }
    }

    /// Source span associated with the error, if it has one.
    #[must_use]
    pub fn span(&self) -> Option<Span> {
        match self {
            Self::Unsupported { span, .. } => Some(*span),
            Self::DisplacementOutOfRange { line, .. } if *line != 0 => Some(Span::line(*line)),
            _ => None,
        }
    }

    /// Check if this error reports a defect in the compiler rather than in
    /// its input.
    #[must_use]
    pub fn is_internal(&self) -> bool {
        matches!(self, Self::Internal { .. })
    }
}
