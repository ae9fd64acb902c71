//! First analysis pass: record definitions and uses per scope.

use super::{Scope, ScopeKey, ScopeKind};
use keel_ast::{
    Arguments, ClassDef, Comprehension, Expr, ExprContext, ExprKind, Function, Keyword, Module,
    Stmt, StmtKind,
};

/// Walks a desugared module top-down, building the scope tree.
#[derive(Debug)]
pub struct ScopeCollector {
    current: Scope,
}

impl ScopeCollector {
    /// Create a collector positioned at a fresh module scope.
    pub fn new() -> Self {
        Self {
            current: Scope::new(ScopeKind::Module, "<module>", ScopeKey::MODULE),
        }
    }

    /// Collect the scope tree of `module`.
    pub fn collect(mut self, module: &Module) -> Scope {
        self.visit_body(&module.body);
        self.current
    }

    /// Run `f` inside a new child scope, then attach the child.
    fn enter(&mut self, child: Scope, f: impl FnOnce(&mut Self)) {
        let parent = std::mem::replace(&mut self.current, child);
        f(self);
        let child = std::mem::replace(&mut self.current, parent);
        self.current.children.push(child);
    }

    fn visit_body(&mut self, body: &[Stmt]) {
        for stmt in body {
            self.visit_stmt(stmt);
        }
    }

    fn visit_exprs<'a>(&mut self, exprs: impl IntoIterator<Item = &'a Expr>) {
        for expr in exprs {
            self.visit_expr(expr);
        }
    }

    fn visit_stmt(&mut self, stmt: &Stmt) {
        match &stmt.kind {
            StmtKind::FunctionDef {
                function,
                decorator_list,
            } => {
                self.visit_exprs(decorator_list);
                self.current.add_def(&function.name);
                self.visit_function(function);
            }
            StmtKind::ClassDef(class) => self.visit_class(class),
            StmtKind::Return(value) => self.visit_exprs(value.as_deref()),
            StmtKind::Assign { targets, value } => {
                self.visit_expr(value);
                self.visit_exprs(targets);
            }
            StmtKind::AugAssign { target, value, .. } => {
                if let ExprKind::Name { id, .. } = &target.kind {
                    self.current.add_use(id);
                    self.current.add_def(id);
                } else {
                    self.visit_expr(target);
                }
                self.visit_expr(value);
            }
            StmtKind::For {
                target,
                iter,
                body,
                orelse,
            } => {
                self.visit_expr(iter);
                self.visit_expr(target);
                self.visit_body(body);
                self.visit_body(orelse);
            }
            StmtKind::While { test, body, orelse } | StmtKind::If { test, body, orelse } => {
                self.visit_expr(test);
                self.visit_body(body);
                self.visit_body(orelse);
            }
            StmtKind::Raise { exc, cause } => {
                self.visit_exprs(exc.as_deref());
                self.visit_exprs(cause.as_deref());
            }
            StmtKind::Assert { test, msg } => {
                self.visit_expr(test);
                self.visit_exprs(msg.as_deref());
            }
            StmtKind::Import(names) => {
                for alias in names {
                    let bound = alias
                        .asname
                        .as_deref()
                        .unwrap_or_else(|| alias.name.split('.').next().unwrap_or(&alias.name));
                    self.current.add_def(bound);
                }
            }
            StmtKind::ImportFrom { names, .. } => {
                for alias in names {
                    self.current
                        .add_def(alias.asname.as_deref().unwrap_or(&alias.name));
                }
            }
            StmtKind::Expr(value) => self.visit_expr(value),
            StmtKind::Delete(targets) => self.visit_exprs(targets),
            StmtKind::Pass
            | StmtKind::Break
            | StmtKind::Continue
            | StmtKind::Global(_)
            | StmtKind::Nonlocal(_) => {}
        }
    }

    fn visit_class(&mut self, class: &ClassDef) {
        self.current.add_def(&class.name);
        self.visit_exprs(&class.bases);
        self.visit_keywords(&class.keywords);
        self.visit_exprs(&class.decorator_list);

        let scope = Scope::new(ScopeKind::Class, class.name.as_str(), ScopeKey::class(class));
        self.enter(scope, |this| this.visit_body(&class.body));
    }

    fn visit_function(&mut self, function: &Function) {
        self.visit_defaults(&function.args);

        let mut scope = Scope::new(
            ScopeKind::Function,
            function.name.as_str(),
            ScopeKey::function(function),
        );
        for name in function.args.names() {
            scope.add_def(name);
        }
        self.enter(scope, |this| this.visit_body(&function.body));
    }

    fn visit_defaults(&mut self, args: &Arguments) {
        self.visit_exprs(&args.defaults);
        self.visit_exprs(args.kw_defaults.iter().flatten());
    }

    fn visit_keywords(&mut self, keywords: &[Keyword]) {
        self.visit_exprs(keywords.iter().map(|k| &k.value));
    }

    fn visit_comprehensions(&mut self, generators: &[Comprehension]) {
        for generator in generators {
            self.visit_expr(&generator.iter);
            self.visit_expr(&generator.target);
            self.visit_exprs(&generator.ifs);
        }
    }

    fn visit_expr(&mut self, expr: &Expr) {
        match &expr.kind {
            ExprKind::Name { id, ctx } => match ctx {
                ExprContext::Load => self.current.add_use(id),
                ExprContext::Store | ExprContext::Del => self.current.add_def(id),
            },
            ExprKind::Function(function) => self.visit_function(function),
            ExprKind::BoolOp { values, .. } => self.visit_exprs(values),
            ExprKind::BinOp { left, right, .. } => {
                self.visit_expr(left);
                self.visit_expr(right);
            }
            ExprKind::UnaryOp { operand, .. } => self.visit_expr(operand),
            ExprKind::Lambda { args, body } => {
                self.visit_defaults(args);
                self.visit_expr(body);
            }
            ExprKind::IfExp { test, body, orelse } => {
                self.visit_expr(test);
                self.visit_expr(body);
                self.visit_expr(orelse);
            }
            ExprKind::Dict { keys, values } => {
                self.visit_exprs(keys);
                self.visit_exprs(values);
            }
            ExprKind::Set(elts) => self.visit_exprs(elts),
            ExprKind::ListComp { elt, generators }
            | ExprKind::SetComp { elt, generators }
            | ExprKind::GeneratorExp { elt, generators } => {
                self.visit_comprehensions(generators);
                self.visit_expr(elt);
            }
            ExprKind::DictComp {
                key,
                value,
                generators,
            } => {
                self.visit_comprehensions(generators);
                self.visit_expr(key);
                self.visit_expr(value);
            }
            ExprKind::Yield(value) => self.visit_exprs(value.as_deref()),
            ExprKind::Compare {
                left, comparators, ..
            } => {
                self.visit_expr(left);
                self.visit_exprs(comparators);
            }
            ExprKind::Call {
                func,
                args,
                keywords,
            } => {
                self.visit_expr(func);
                self.visit_exprs(args);
                self.visit_keywords(keywords);
            }
            ExprKind::Constant(_) => {}
            ExprKind::Attribute { value, .. } | ExprKind::Starred { value, .. } => {
                self.visit_expr(value)
            }
            ExprKind::Subscript { value, slice, .. } => {
                self.visit_expr(value);
                self.visit_expr(slice);
            }
            ExprKind::List { elts, .. } | ExprKind::Tuple { elts, .. } => self.visit_exprs(elts),
            ExprKind::Slice { lower, upper, step } => {
                self.visit_exprs(lower.as_deref());
                self.visit_exprs(upper.as_deref());
                self.visit_exprs(step.as_deref());
            }
        }
    }
}

impl Default for ScopeCollector {
    fn default() -> Self {
        Self::new()
    }
}
