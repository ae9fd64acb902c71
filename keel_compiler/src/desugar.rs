//! Rewrite syntactic sugar into the core grammar.
//!
//! | Sugar | Core form |
//! |---|---|
//! | `assert t, m` | `if t: pass` / `else: raise AssertionError(m)` |
//! | `lambda a: e` | function object `<lambda>` with body `return e` |
//! | `@d1 @d2 def f(): ...` | `f = d1(d2(<function f>))` |
//! | `[e for x in xs if c]` | `<listcomp>(.0)` called with `[]` |
//!
//! The pass consumes the tree and rebuilds it. Synthesized nodes take the
//! span of the node they replace, and any node without a position inherits
//! the span of its nearest positioned ancestor, so later passes always see a
//! real line.

use keel_ast::{
    Arg, Arguments, ClassDef, Comprehension, Expr, ExprContext, ExprKind, Function,
    Keyword, Module, Stmt, StmtKind,
};
use keel_core::Span;

/// Name of the accumulator parameter of a desugared list comprehension.
pub const LISTCOMP_ACCUMULATOR: &str = ".0";

/// Desugar a whole module.
pub fn desugar(module: Module) -> Module {
    Desugarer.module(module)
}

/// The rewriting fold. Stateless; every method consumes its input.
#[derive(Debug, Default, Clone, Copy)]
pub struct Desugarer;

impl Desugarer {
    /// Rewrite a module.
    pub fn module(self, module: Module) -> Module {
        Module::new(self.body(module.body, Span::line(1)))
    }

    fn body(self, body: Vec<Stmt>, parent: Span) -> Vec<Stmt> {
        body.into_iter().map(|s| self.stmt(s, parent)).collect()
    }

    fn boxed(self, expr: Box<Expr>, parent: Span) -> Box<Expr> {
        Box::new(self.expr(*expr, parent))
    }

    fn opt(self, expr: Option<Box<Expr>>, parent: Span) -> Option<Box<Expr>> {
        expr.map(|e| self.boxed(e, parent))
    }

    fn exprs(self, exprs: Vec<Expr>, parent: Span) -> Vec<Expr> {
        exprs.into_iter().map(|e| self.expr(e, parent)).collect()
    }

    fn stmt(self, stmt: Stmt, parent: Span) -> Stmt {
        let span = stmt.span.or(parent);
        let kind = match stmt.kind {
            StmtKind::Assert { test, msg } => return self.assert(*test, msg, span),
            StmtKind::FunctionDef {
                function,
                decorator_list,
            } => return self.function_def(*function, decorator_list, span),

            StmtKind::ClassDef(class) => StmtKind::ClassDef(Box::new(self.class(*class, span))),
            StmtKind::Return(value) => StmtKind::Return(self.opt(value, span)),
            StmtKind::Assign { targets, value } => StmtKind::Assign {
                targets: self.exprs(targets, span),
                value: self.boxed(value, span),
            },
            StmtKind::AugAssign { target, op, value } => StmtKind::AugAssign {
                target: self.boxed(target, span),
                op,
                value: self.boxed(value, span),
            },
            StmtKind::For {
                target,
                iter,
                body,
                orelse,
            } => StmtKind::For {
                target: self.boxed(target, span),
                iter: self.boxed(iter, span),
                body: self.body(body, span),
                orelse: self.body(orelse, span),
            },
            StmtKind::While { test, body, orelse } => StmtKind::While {
                test: self.boxed(test, span),
                body: self.body(body, span),
                orelse: self.body(orelse, span),
            },
            StmtKind::If { test, body, orelse } => StmtKind::If {
                test: self.boxed(test, span),
                body: self.body(body, span),
                orelse: self.body(orelse, span),
            },
            StmtKind::Raise { exc, cause } => StmtKind::Raise {
                exc: self.opt(exc, span),
                cause: self.opt(cause, span),
            },
            StmtKind::Expr(value) => StmtKind::Expr(self.boxed(value, span)),
            StmtKind::Delete(targets) => StmtKind::Delete(self.exprs(targets, span)),
            kind @ (StmtKind::Import(_)
            | StmtKind::ImportFrom { .. }
            | StmtKind::Pass
            | StmtKind::Break
            | StmtKind::Continue
            | StmtKind::Global(_)
            | StmtKind::Nonlocal(_)) => kind,
        };
        Stmt::new(kind, span)
    }

    fn expr(self, expr: Expr, parent: Span) -> Expr {
        let span = expr.span.or(parent);
        let kind = match expr.kind {
            ExprKind::Lambda { args, body } => {
                let args = self.arguments(*args, span);
                let body = vec![Stmt::ret(Some(self.expr(*body, span)), span)];
                ExprKind::Function(Box::new(Function::new("<lambda>", args, body)))
            }
            ExprKind::ListComp { elt, generators } => {
                return self.list_comp(*elt, generators, span);
            }

            ExprKind::Function(function) => {
                ExprKind::Function(Box::new(self.function(*function, span)))
            }
            ExprKind::BoolOp { op, values } => ExprKind::BoolOp {
                op,
                values: self.exprs(values, span),
            },
            ExprKind::BinOp { left, op, right } => ExprKind::BinOp {
                left: self.boxed(left, span),
                op,
                right: self.boxed(right, span),
            },
            ExprKind::UnaryOp { op, operand } => ExprKind::UnaryOp {
                op,
                operand: self.boxed(operand, span),
            },
            ExprKind::IfExp { test, body, orelse } => ExprKind::IfExp {
                test: self.boxed(test, span),
                body: self.boxed(body, span),
                orelse: self.boxed(orelse, span),
            },
            ExprKind::Dict { keys, values } => ExprKind::Dict {
                keys: self.exprs(keys, span),
                values: self.exprs(values, span),
            },
            ExprKind::Set(elts) => ExprKind::Set(self.exprs(elts, span)),
            ExprKind::SetComp { elt, generators } => ExprKind::SetComp {
                elt: self.boxed(elt, span),
                generators: self.comprehensions(generators, span),
            },
            ExprKind::DictComp {
                key,
                value,
                generators,
            } => ExprKind::DictComp {
                key: self.boxed(key, span),
                value: self.boxed(value, span),
                generators: self.comprehensions(generators, span),
            },
            ExprKind::GeneratorExp { elt, generators } => ExprKind::GeneratorExp {
                elt: self.boxed(elt, span),
                generators: self.comprehensions(generators, span),
            },
            ExprKind::Yield(value) => ExprKind::Yield(self.opt(value, span)),
            ExprKind::Compare {
                left,
                ops,
                comparators,
            } => ExprKind::Compare {
                left: self.boxed(left, span),
                ops,
                comparators: self.exprs(comparators, span),
            },
            ExprKind::Call {
                func,
                args,
                keywords,
            } => ExprKind::Call {
                func: self.boxed(func, span),
                args: self.exprs(args, span),
                keywords: self.keywords(keywords, span),
            },
            ExprKind::Attribute { value, attr, ctx } => ExprKind::Attribute {
                value: self.boxed(value, span),
                attr,
                ctx,
            },
            ExprKind::Subscript { value, slice, ctx } => ExprKind::Subscript {
                value: self.boxed(value, span),
                slice: self.boxed(slice, span),
                ctx,
            },
            ExprKind::Starred { value, ctx } => ExprKind::Starred {
                value: self.boxed(value, span),
                ctx,
            },
            ExprKind::List { elts, ctx } => ExprKind::List {
                elts: self.exprs(elts, span),
                ctx,
            },
            ExprKind::Tuple { elts, ctx } => ExprKind::Tuple {
                elts: self.exprs(elts, span),
                ctx,
            },
            ExprKind::Slice { lower, upper, step } => ExprKind::Slice {
                lower: self.opt(lower, span),
                upper: self.opt(upper, span),
                step: self.opt(step, span),
            },
            kind @ (ExprKind::Constant(_) | ExprKind::Name { .. }) => kind,
        };
        Expr::new(kind, span)
    }

    fn function(self, function: Function, span: Span) -> Function {
        Function {
            name: function.name,
            args: self.arguments(function.args, span),
            body: self.body(function.body, span),
        }
    }

    fn arguments(self, args: Arguments, span: Span) -> Arguments {
        Arguments {
            defaults: self.exprs(args.defaults, span),
            kw_defaults: args
                .kw_defaults
                .into_iter()
                .map(|d| d.map(|e| self.expr(e, span)))
                .collect(),
            ..args
        }
    }

    fn class(self, class: ClassDef, span: Span) -> ClassDef {
        ClassDef {
            name: class.name,
            bases: self.exprs(class.bases, span),
            keywords: self.keywords(class.keywords, span),
            body: self.body(class.body, span),
            decorator_list: self.exprs(class.decorator_list, span),
        }
    }

    fn keywords(self, keywords: Vec<Keyword>, span: Span) -> Vec<Keyword> {
        keywords
            .into_iter()
            .map(|k| Keyword {
                arg: k.arg,
                value: self.expr(k.value, span),
            })
            .collect()
    }

    fn comprehensions(self, generators: Vec<Comprehension>, span: Span) -> Vec<Comprehension> {
        generators
            .into_iter()
            .map(|g| Comprehension {
                target: self.expr(g.target, span),
                iter: self.expr(g.iter, span),
                ifs: self.exprs(g.ifs, span),
            })
            .collect()
    }

    // =========================================================================
    // Rewrites
    // =========================================================================

    fn assert(self, test: Expr, msg: Option<Box<Expr>>, span: Span) -> Stmt {
        let test = self.expr(test, span);
        let args = msg.map(|m| self.expr(*m, span)).into_iter().collect();
        let error = Expr::call(
            Expr::name("AssertionError", ExprContext::Load, span),
            args,
            span,
        );
        let raise = Stmt::new(
            StmtKind::Raise {
                exc: Some(Box::new(error)),
                cause: None,
            },
            span,
        );
        Stmt::new(
            StmtKind::If {
                test: Box::new(test),
                body: Vec::new(),
                orelse: vec![raise],
            },
            span,
        )
    }

    fn function_def(self, function: Function, decorators: Vec<Expr>, span: Span) -> Stmt {
        let target = Expr::name(function.name.clone(), ExprContext::Store, span);
        let decorators = self.exprs(decorators, span);
        let mut value = Expr::new(
            ExprKind::Function(Box::new(self.function(function, span))),
            span,
        );
        for decorator in decorators.into_iter().rev() {
            value = Expr::call(decorator, vec![value], span);
        }
        Stmt::assign(target, value, span)
    }

    fn list_comp(self, elt: Expr, generators: Vec<Comprehension>, span: Span) -> Expr {
        let accumulator = || Expr::name(LISTCOMP_ACCUMULATOR, ExprContext::Load, span);

        let append = Expr::attribute(accumulator(), "append", ExprContext::Load, span);
        let mut body = Stmt::expr(
            Expr::call(append, vec![self.expr(elt, span)], span),
            span,
        );
        for generator in self.comprehensions(generators, span).into_iter().rev() {
            for test in generator.ifs.into_iter().rev() {
                body = Stmt::new(
                    StmtKind::If {
                        test: Box::new(test),
                        body: vec![body],
                        orelse: Vec::new(),
                    },
                    span,
                );
            }
            body = Stmt::new(
                StmtKind::For {
                    target: Box::new(generator.target),
                    iter: Box::new(generator.iter),
                    body: vec![body],
                    orelse: Vec::new(),
                },
                span,
            );
        }

        let function = Function::new(
            "<listcomp>",
            Arguments {
                args: vec![Arg::new(LISTCOMP_ACCUMULATOR)],
                ..Arguments::default()
            },
            vec![body, Stmt::ret(Some(accumulator()), span)],
        );
        let empty = Expr::new(
            ExprKind::List {
                elts: Vec::new(),
                ctx: ExprContext::Load,
            },
            span,
        );
        Expr::call(
            Expr::new(ExprKind::Function(Box::new(function)), span),
            vec![empty],
            span,
        )
    }
}
