//! Abstract syntax tree node types.
//!
//! Statements and expressions carry a [`Span`]; auxiliary nodes (arguments,
//! aliases, keywords, comprehension clauses) do not, matching the host
//! language's own tree. The node set is closed: every pass matches it
//! exhaustively, and nodes outside the compiled subset are still
//! representable so they can be rejected with a located error.

use keel_core::Span;

/// A parsed module.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Module {
    /// Module body.
    pub body: Vec<Stmt>,
}

impl Module {
    /// Create a module from its statements.
    #[must_use]
    pub fn new(body: Vec<Stmt>) -> Self {
        Self { body }
    }
}

// =============================================================================
// Statements
// =============================================================================

/// A statement with its source location.
#[derive(Debug, Clone, PartialEq)]
pub struct Stmt {
    /// Statement kind.
    pub kind: StmtKind,
    /// Source location.
    pub span: Span,
}

impl Stmt {
    /// Create a statement.
    #[inline]
    #[must_use]
    pub fn new(kind: StmtKind, span: Span) -> Self {
        Self { kind, span }
    }

    /// Expression statement.
    #[must_use]
    pub fn expr(value: Expr, span: Span) -> Self {
        Self::new(StmtKind::Expr(Box::new(value)), span)
    }

    /// Single-target assignment.
    #[must_use]
    pub fn assign(target: Expr, value: Expr, span: Span) -> Self {
        Self::new(
            StmtKind::Assign {
                targets: vec![target],
                value: Box::new(value),
            },
            span,
        )
    }

    /// `return value`.
    #[must_use]
    pub fn ret(value: Option<Expr>, span: Span) -> Self {
        Self::new(StmtKind::Return(value.map(Box::new)), span)
    }
}

/// Statement variants.
#[derive(Debug, Clone, PartialEq)]
pub enum StmtKind {
    /// `def name(args): body`, possibly decorated.
    FunctionDef {
        /// The function being defined.
        function: Box<Function>,
        /// Decorators in declaration order (outermost first).
        decorator_list: Vec<Expr>,
    },
    /// `class name(bases): body`.
    ClassDef(Box<ClassDef>),
    /// `return [value]`.
    Return(Option<Box<Expr>>),
    /// `t1 = t2 = value`.
    Assign {
        /// Assignment targets.
        targets: Vec<Expr>,
        /// Assigned value.
        value: Box<Expr>,
    },
    /// `target op= value`.
    AugAssign {
        /// Assignment target.
        target: Box<Expr>,
        /// Operator.
        op: BinOp,
        /// Right-hand side.
        value: Box<Expr>,
    },
    /// `for target in iter: body else: orelse`.
    For {
        /// Loop variable(s).
        target: Box<Expr>,
        /// Iterated expression.
        iter: Box<Expr>,
        /// Loop body.
        body: Vec<Stmt>,
        /// `else` clause.
        orelse: Vec<Stmt>,
    },
    /// `while test: body else: orelse`.
    While {
        /// Loop condition.
        test: Box<Expr>,
        /// Loop body.
        body: Vec<Stmt>,
        /// `else` clause.
        orelse: Vec<Stmt>,
    },
    /// `if test: body else: orelse`.
    If {
        /// Condition.
        test: Box<Expr>,
        /// Taken branch.
        body: Vec<Stmt>,
        /// Else branch.
        orelse: Vec<Stmt>,
    },
    /// `raise [exc [from cause]]`.
    Raise {
        /// Raised exception.
        exc: Option<Box<Expr>>,
        /// Chained cause.
        cause: Option<Box<Expr>>,
    },
    /// `assert test[, msg]`.
    Assert {
        /// Asserted condition.
        test: Box<Expr>,
        /// Failure message.
        msg: Option<Box<Expr>>,
    },
    /// `import a.b as c, d`.
    Import(Vec<Alias>),
    /// `from module import names`.
    ImportFrom {
        /// Module path (`None` for `from . import x`).
        module: Option<String>,
        /// Imported names.
        names: Vec<Alias>,
        /// Number of leading dots.
        level: u32,
    },
    /// Expression statement.
    Expr(Box<Expr>),
    /// `pass`.
    Pass,
    /// `break`.
    Break,
    /// `continue`.
    Continue,
    /// `del targets`.
    Delete(Vec<Expr>),
    /// `global names`.
    Global(Vec<String>),
    /// `nonlocal names`.
    Nonlocal(Vec<String>),
}

/// A function: name, parameters and body.
///
/// Appears as the payload of `def` statements and, after desugaring, as a
/// function-object expression ([`ExprKind::Function`]).
#[derive(Debug, Clone, PartialEq)]
pub struct Function {
    /// Function name.
    pub name: String,
    /// Parameters.
    pub args: Arguments,
    /// Body statements.
    pub body: Vec<Stmt>,
}

impl Function {
    /// Create a function.
    #[must_use]
    pub fn new(name: impl Into<String>, args: Arguments, body: Vec<Stmt>) -> Self {
        Self {
            name: name.into(),
            args,
            body,
        }
    }
}

/// A class definition.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassDef {
    /// Class name.
    pub name: String,
    /// Base class expressions.
    pub bases: Vec<Expr>,
    /// Class keywords (`metaclass=...`).
    pub keywords: Vec<Keyword>,
    /// Class body.
    pub body: Vec<Stmt>,
    /// Decorators in declaration order.
    pub decorator_list: Vec<Expr>,
}

impl ClassDef {
    /// Create an undecorated class with positional bases.
    #[must_use]
    pub fn new(name: impl Into<String>, bases: Vec<Expr>, body: Vec<Stmt>) -> Self {
        Self {
            name: name.into(),
            bases,
            keywords: Vec::new(),
            body,
            decorator_list: Vec::new(),
        }
    }
}

/// Function parameters.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Arguments {
    /// Positional-only parameters.
    pub posonlyargs: Vec<Arg>,
    /// Positional-or-keyword parameters.
    pub args: Vec<Arg>,
    /// `*args`.
    pub vararg: Option<Arg>,
    /// Keyword-only parameters.
    pub kwonlyargs: Vec<Arg>,
    /// `**kwargs`.
    pub kwarg: Option<Arg>,
    /// Defaults for the trailing positional parameters.
    pub defaults: Vec<Expr>,
    /// Defaults for keyword-only parameters (`None` = required).
    pub kw_defaults: Vec<Option<Expr>>,
}

impl Arguments {
    /// Plain positional parameters.
    #[must_use]
    pub fn positional<S: Into<String>>(names: impl IntoIterator<Item = S>) -> Self {
        Self {
            args: names.into_iter().map(Arg::new).collect(),
            ..Self::default()
        }
    }

    /// All parameter names in local-slot order: positional-only, positional,
    /// keyword-only, `*args`, `**kwargs`.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.posonlyargs
            .iter()
            .chain(&self.args)
            .chain(&self.kwonlyargs)
            .chain(&self.vararg)
            .chain(&self.kwarg)
            .map(|a| a.arg.as_str())
    }
}

/// A single parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct Arg {
    /// Parameter name.
    pub arg: String,
}

impl Arg {
    /// Create a parameter.
    #[must_use]
    pub fn new(arg: impl Into<String>) -> Self {
        Self { arg: arg.into() }
    }
}

/// `name as asname` in an import.
#[derive(Debug, Clone, PartialEq)]
pub struct Alias {
    /// Imported (possibly dotted) name.
    pub name: String,
    /// Local binding name.
    pub asname: Option<String>,
}

impl Alias {
    /// Create an alias.
    #[must_use]
    pub fn new(name: impl Into<String>, asname: Option<&str>) -> Self {
        Self {
            name: name.into(),
            asname: asname.map(str::to_owned),
        }
    }
}

/// `arg=value` in a call or class header; `arg` is `None` for `**value`.
#[derive(Debug, Clone, PartialEq)]
pub struct Keyword {
    /// Keyword name.
    pub arg: Option<String>,
    /// Value.
    pub value: Expr,
}

/// One `for target in iter if cond...` clause of a comprehension.
#[derive(Debug, Clone, PartialEq)]
pub struct Comprehension {
    /// Loop variable(s).
    pub target: Expr,
    /// Iterated expression.
    pub iter: Expr,
    /// Filters, in declaration order.
    pub ifs: Vec<Expr>,
}

// =============================================================================
// Expressions
// =============================================================================

/// An expression with its source location.
#[derive(Debug, Clone, PartialEq)]
pub struct Expr {
    /// Expression kind.
    pub kind: ExprKind,
    /// Source location.
    pub span: Span,
}

impl Expr {
    /// Create an expression.
    #[inline]
    #[must_use]
    pub fn new(kind: ExprKind, span: Span) -> Self {
        Self { kind, span }
    }

    /// Identifier reference.
    #[must_use]
    pub fn name(id: impl Into<String>, ctx: ExprContext, span: Span) -> Self {
        Self::new(
            ExprKind::Name {
                id: id.into(),
                ctx,
            },
            span,
        )
    }

    /// Literal constant.
    #[must_use]
    pub fn constant(value: Constant, span: Span) -> Self {
        Self::new(ExprKind::Constant(value), span)
    }

    /// Call with positional arguments only.
    #[must_use]
    pub fn call(func: Expr, args: Vec<Expr>, span: Span) -> Self {
        Self::new(
            ExprKind::Call {
                func: Box::new(func),
                args,
                keywords: Vec::new(),
            },
            span,
        )
    }

    /// Attribute access.
    #[must_use]
    pub fn attribute(value: Expr, attr: impl Into<String>, ctx: ExprContext, span: Span) -> Self {
        Self::new(
            ExprKind::Attribute {
                value: Box::new(value),
                attr: attr.into(),
                ctx,
            },
            span,
        )
    }

    /// Binary operation.
    #[must_use]
    pub fn binop(left: Expr, op: BinOp, right: Expr, span: Span) -> Self {
        Self::new(
            ExprKind::BinOp {
                left: Box::new(left),
                op,
                right: Box::new(right),
            },
            span,
        )
    }

    /// Check if this is a string constant (docstring candidate).
    #[must_use]
    pub fn as_str_constant(&self) -> Option<&str> {
        match &self.kind {
            ExprKind::Constant(Constant::Str(s)) => Some(s),
            _ => None,
        }
    }
}

/// Expression variants.
#[derive(Debug, Clone, PartialEq)]
pub enum ExprKind {
    /// `a and b and c`.
    BoolOp {
        /// Operator.
        op: BoolOp,
        /// Operands (at least two).
        values: Vec<Expr>,
    },
    /// `left op right`.
    BinOp {
        /// Left operand.
        left: Box<Expr>,
        /// Operator.
        op: BinOp,
        /// Right operand.
        right: Box<Expr>,
    },
    /// `op operand`.
    UnaryOp {
        /// Operator.
        op: UnaryOp,
        /// Operand.
        operand: Box<Expr>,
    },
    /// `lambda args: body`.
    Lambda {
        /// Parameters.
        args: Box<Arguments>,
        /// Returned expression.
        body: Box<Expr>,
    },
    /// `body if test else orelse`.
    IfExp {
        /// Condition.
        test: Box<Expr>,
        /// Value when true.
        body: Box<Expr>,
        /// Value when false.
        orelse: Box<Expr>,
    },
    /// `{k: v, ...}`.
    Dict {
        /// Keys.
        keys: Vec<Expr>,
        /// Values, parallel to `keys`.
        values: Vec<Expr>,
    },
    /// `{a, b}`.
    Set(Vec<Expr>),
    /// `[elt for ...]`.
    ListComp {
        /// Element expression.
        elt: Box<Expr>,
        /// Clauses, outermost first.
        generators: Vec<Comprehension>,
    },
    /// `{elt for ...}`.
    SetComp {
        /// Element expression.
        elt: Box<Expr>,
        /// Clauses.
        generators: Vec<Comprehension>,
    },
    /// `{k: v for ...}`.
    DictComp {
        /// Key expression.
        key: Box<Expr>,
        /// Value expression.
        value: Box<Expr>,
        /// Clauses.
        generators: Vec<Comprehension>,
    },
    /// `(elt for ...)`.
    GeneratorExp {
        /// Element expression.
        elt: Box<Expr>,
        /// Clauses.
        generators: Vec<Comprehension>,
    },
    /// `yield [value]`.
    Yield(Option<Box<Expr>>),
    /// `left op1 c1 op2 c2 ...`.
    Compare {
        /// First operand.
        left: Box<Expr>,
        /// Operators.
        ops: Vec<CmpOp>,
        /// Remaining operands, parallel to `ops`.
        comparators: Vec<Expr>,
    },
    /// `func(args, kw=value)`.
    Call {
        /// Callee.
        func: Box<Expr>,
        /// Positional arguments.
        args: Vec<Expr>,
        /// Keyword arguments.
        keywords: Vec<Keyword>,
    },
    /// Literal.
    Constant(Constant),
    /// `value.attr`.
    Attribute {
        /// Object.
        value: Box<Expr>,
        /// Attribute name.
        attr: String,
        /// Load or store.
        ctx: ExprContext,
    },
    /// `value[slice]`.
    Subscript {
        /// Container.
        value: Box<Expr>,
        /// Index expression.
        slice: Box<Expr>,
        /// Load or store.
        ctx: ExprContext,
    },
    /// `*value`.
    Starred {
        /// Starred operand.
        value: Box<Expr>,
        /// Load or store.
        ctx: ExprContext,
    },
    /// Identifier.
    Name {
        /// Identifier text.
        id: String,
        /// Load or store.
        ctx: ExprContext,
    },
    /// `[a, b]`.
    List {
        /// Elements.
        elts: Vec<Expr>,
        /// Load or store.
        ctx: ExprContext,
    },
    /// `(a, b)`.
    Tuple {
        /// Elements.
        elts: Vec<Expr>,
        /// Load or store.
        ctx: ExprContext,
    },
    /// `lower:upper:step` inside a subscript.
    Slice {
        /// Lower bound.
        lower: Option<Box<Expr>>,
        /// Upper bound.
        upper: Option<Box<Expr>>,
        /// Step.
        step: Option<Box<Expr>>,
    },
    /// A function object (produced by desugaring `def`, `lambda` and
    /// comprehensions).
    Function(Box<Function>),
}

/// Literal values.
#[derive(Debug, Clone, PartialEq)]
pub enum Constant {
    /// `None`.
    None,
    /// `True` / `False`.
    Bool(bool),
    /// Integer literal.
    Int(i64),
    /// Float literal.
    Float(f64),
    /// String literal.
    Str(String),
    /// Bytes literal.
    Bytes(Vec<u8>),
    /// `...`.
    Ellipsis,
}

/// Whether an expression is read, written or deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExprContext {
    /// Read.
    Load,
    /// Written.
    Store,
    /// Deleted.
    Del,
}

/// Short-circuit operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BoolOp {
    /// `and`.
    And,
    /// `or`.
    Or,
}

/// Binary arithmetic/bitwise operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinOp {
    /// `+`
    Add,
    /// `-`
    Sub,
    /// `*`
    Mult,
    /// `@`
    MatMult,
    /// `/`
    Div,
    /// `%`
    Mod,
    /// `**`
    Pow,
    /// `<<`
    LShift,
    /// `>>`
    RShift,
    /// `|`
    BitOr,
    /// `^`
    BitXor,
    /// `&`
    BitAnd,
    /// `//`
    FloorDiv,
}

/// Unary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    /// `~`
    Invert,
    /// `not`
    Not,
    /// unary `+`
    UAdd,
    /// unary `-`
    USub,
}

/// Comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CmpOp {
    /// `==`
    Eq,
    /// `!=`
    NotEq,
    /// `<`
    Lt,
    /// `<=`
    LtE,
    /// `>`
    Gt,
    /// `>=`
    GtE,
    /// `is`
    Is,
    /// `is not`
    IsNot,
    /// `in`
    In,
    /// `not in`
    NotIn,
}

impl CmpOp {
    /// Source spelling of the operator.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Eq => "==",
            Self::NotEq => "!=",
            Self::Lt => "<",
            Self::LtE => "<=",
            Self::Gt => ">",
            Self::GtE => ">=",
            Self::Is => "is",
            Self::IsNot => "is not",
            Self::In => "in",
            Self::NotIn => "not in",
        }
    }
}
