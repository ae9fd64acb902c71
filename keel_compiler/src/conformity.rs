//! Subset conformity checking.
//!
//! The code generator only has translation rules for a subset of the
//! language. A [`ConformityCheck`] runs on the desugared tree before scope
//! analysis and rejects anything outside that subset with a located
//! [`CompileError::Unsupported`], so the later passes can assume a
//! well-formed input.

use keel_ast::{
    Arguments, BinOp, ClassDef, Expr, ExprContext, ExprKind, Function, Keyword,
    Module, Stmt, StmtKind,
};
use keel_core::{CompileError, CompileResult, Span};
use tracing::debug;

/// A pass that decides whether a desugared module can be compiled.
pub trait ConformityCheck {
    /// Return `Ok(())` if every node of `module` is supported.
    fn check(&self, module: &Module) -> CompileResult<()>;
}

impl<F> ConformityCheck for F
where
    F: Fn(&Module) -> CompileResult<()>,
{
    fn check(&self, module: &Module) -> CompileResult<()> {
        self(module)
    }
}

/// The default checker: accepts exactly what the code generator compiles.
#[derive(Debug, Default, Clone, Copy)]
pub struct SubsetChecker;

impl ConformityCheck for SubsetChecker {
    fn check(&self, module: &Module) -> CompileResult<()> {
        let result = self.body(&module.body);
        if let Err(err) = &result {
            debug!(error = %err, "module rejected by subset checker");
        }
        result
    }
}

fn reject<T>(construct: &str, span: Span) -> CompileResult<T> {
    Err(CompileError::unsupported(construct, span))
}

impl SubsetChecker {
    fn body(&self, body: &[Stmt]) -> CompileResult<()> {
        body.iter().try_for_each(|s| self.stmt(s))
    }

    fn exprs<'a>(&self, exprs: impl IntoIterator<Item = &'a Expr>) -> CompileResult<()> {
        exprs.into_iter().try_for_each(|e| self.expr(e))
    }

    fn stmt(&self, stmt: &Stmt) -> CompileResult<()> {
        let span = stmt.span;
        match &stmt.kind {
            StmtKind::FunctionDef { .. } => reject("function definition (not desugared)", span),
            StmtKind::Assert { .. } => reject("assert statement (not desugared)", span),
            StmtKind::Break => reject("break statement", span),
            StmtKind::Continue => reject("continue statement", span),
            StmtKind::Delete(_) => reject("del statement", span),
            StmtKind::Global(_) => reject("global declaration", span),
            StmtKind::Nonlocal(_) => reject("nonlocal declaration", span),

            StmtKind::ClassDef(class) => self.class(class, span),
            StmtKind::Return(value) => self.exprs(value.as_deref()),
            StmtKind::Assign { targets, value } => {
                if targets.len() != 1 {
                    return reject("assignment to multiple targets", span);
                }
                self.expr(value)?;
                self.target(&targets[0])
            }
            StmtKind::AugAssign { target, op, value } => {
                if !matches!(target.kind, ExprKind::Name { .. }) {
                    return reject("augmented assignment to a non-name target", span);
                }
                self.binop(*op, span)?;
                self.expr(value)
            }
            StmtKind::For {
                target,
                iter,
                body,
                orelse,
            } => {
                if !orelse.is_empty() {
                    return reject("for loop with else clause", span);
                }
                self.expr(iter)?;
                self.target(target)?;
                self.body(body)
            }
            StmtKind::While { test, body, orelse } => {
                if !orelse.is_empty() {
                    return reject("while loop with else clause", span);
                }
                self.expr(test)?;
                self.body(body)
            }
            StmtKind::If { test, body, orelse } => {
                self.expr(test)?;
                self.body(body)?;
                self.body(orelse)
            }
            StmtKind::Raise { exc, cause } => {
                if cause.is_some() {
                    return reject("raise ... from ...", span);
                }
                self.exprs(exc.as_deref())
            }
            StmtKind::Import(names) => {
                for alias in names {
                    if alias.name.contains('.') && alias.asname.is_some() {
                        return reject("import of a dotted name with an alias", span);
                    }
                }
                Ok(())
            }
            StmtKind::ImportFrom { names, .. } => {
                if names.iter().any(|a| a.name == "*") {
                    return reject("import *", span);
                }
                Ok(())
            }
            StmtKind::Expr(value) => self.expr(value),
            StmtKind::Pass => Ok(()),
        }
    }

    fn class(&self, class: &ClassDef, span: Span) -> CompileResult<()> {
        if !class.decorator_list.is_empty() {
            return reject("class decorator", span);
        }
        if !class.keywords.is_empty() {
            return reject("class keyword argument", span);
        }
        self.exprs(&class.bases)?;
        self.body(&class.body)
    }

    fn function(&self, function: &Function, span: Span) -> CompileResult<()> {
        self.arguments(&function.args, span)?;
        self.body(&function.body)
    }

    fn arguments(&self, args: &Arguments, span: Span) -> CompileResult<()> {
        if !args.defaults.is_empty() || args.kw_defaults.iter().any(Option::is_some) {
            return reject("argument default value", span);
        }
        Ok(())
    }

    fn keywords(&self, keywords: &[Keyword], span: Span) -> CompileResult<()> {
        for keyword in keywords {
            if keyword.arg.is_none() {
                return reject("** argument unpacking", span);
            }
            self.expr(&keyword.value)?;
        }
        Ok(())
    }

    fn binop(&self, op: BinOp, span: Span) -> CompileResult<()> {
        if op == BinOp::MatMult {
            return reject("matrix multiplication operator", span);
        }
        Ok(())
    }

    /// An assignment or loop target.
    fn target(&self, target: &Expr) -> CompileResult<()> {
        match &target.kind {
            ExprKind::Name { .. } => Ok(()),
            ExprKind::Attribute { value, .. } => self.expr(value),
            ExprKind::Subscript { value, slice, .. } => {
                self.expr(value)?;
                self.expr(slice)
            }
            ExprKind::List { elts, .. } | ExprKind::Tuple { elts, .. } => {
                elts.iter().try_for_each(|e| self.target(e))
            }
            ExprKind::Starred { .. } => reject("starred assignment target", target.span),
            _ => reject("assignment to an expression", target.span),
        }
    }

    fn expr(&self, expr: &Expr) -> CompileResult<()> {
        let span = expr.span;
        match &expr.kind {
            ExprKind::Lambda { .. } => reject("lambda (not desugared)", span),
            ExprKind::ListComp { .. } => reject("list comprehension (not desugared)", span),
            ExprKind::SetComp { .. } => reject("set comprehension", span),
            ExprKind::DictComp { .. } => reject("dict comprehension", span),
            ExprKind::GeneratorExp { .. } => reject("generator expression", span),
            ExprKind::Yield(_) => reject("yield expression", span),
            ExprKind::Starred { .. } => reject("starred expression", span),
            ExprKind::Slice { .. } => reject("slice", span),

            ExprKind::Function(function) => self.function(function, span),
            ExprKind::BoolOp { values, .. } => self.exprs(values),
            ExprKind::BinOp { left, op, right } => {
                self.binop(*op, span)?;
                self.expr(left)?;
                self.expr(right)
            }
            ExprKind::UnaryOp { operand, .. } => self.expr(operand),
            ExprKind::IfExp { test, body, orelse } => {
                self.expr(test)?;
                self.expr(body)?;
                self.expr(orelse)
            }
            ExprKind::Dict { keys, values } => {
                self.exprs(keys)?;
                self.exprs(values)
            }
            ExprKind::Set(elts) => self.exprs(elts),
            ExprKind::Compare {
                left,
                ops,
                comparators,
            } => {
                if ops.len() != 1 || comparators.len() != 1 {
                    return reject("chained comparison", span);
                }
                self.expr(left)?;
                self.exprs(comparators)
            }
            ExprKind::Call {
                func,
                args,
                keywords,
            } => {
                self.expr(func)?;
                self.exprs(args)?;
                self.keywords(keywords, span)
            }
            ExprKind::Constant(_) => Ok(()),
            ExprKind::Attribute { value, ctx, .. } => {
                self.context(*ctx, span)?;
                self.expr(value)
            }
            ExprKind::Subscript { value, slice, ctx } => {
                self.context(*ctx, span)?;
                self.expr(value)?;
                self.expr(slice)
            }
            ExprKind::Name { ctx, .. } => self.context(*ctx, span),
            ExprKind::List { elts, ctx } | ExprKind::Tuple { elts, ctx } => {
                self.context(*ctx, span)?;
                self.exprs(elts)
            }
        }
    }

    fn context(&self, ctx: ExprContext, span: Span) -> CompileResult<()> {
        match ctx {
            ExprContext::Del => reject("deletion target", span),
            ExprContext::Load | ExprContext::Store => Ok(()),
        }
    }
}
