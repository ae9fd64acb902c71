//! AST to register/accumulator bytecode compiler.
//!
//! The compiler transforms a parsed module into code objects in four phases:
//!
//! 1. **Desugaring**: rewrites `assert`, `lambda`, decorated `def` and list
//!    comprehensions into the core grammar
//! 2. **Conformity**: rejects constructs without a translation rule
//! 3. **Scope analysis**: classifies every name as fast, deref or by-name
//! 4. **Code generation**: one [`CodeGen`] per module, function and class
//!    body, each producing an [`Assembly`] tree that is assembled into a
//!    [`CodeObject`]
//!
//! # Register discipline
//!
//! Values flow through the accumulator. A binary operation evaluates its
//! left operand into a scratch register (a fast local is read in place),
//! its right operand into the accumulator, and combines the two. The
//! register counter is restored after every such node, so the number of
//! registers a code object needs is bounded by expression nesting depth.

use crate::bytecode::assembly::jump;
use crate::bytecode::{
    Assembly, CodeFlags, CodeObject, Constant, FrameLayout, Instruction, Label, LineTable,
    LocalSlot, Opcode, Operand, Register, Slot,
};
use crate::bytecode::instruction::MAKE_FUNCTION_CLOSURE;
use crate::conformity::{ConformityCheck, SubsetChecker};
use crate::desugar::desugar;
use crate::scope::{self, Access, Scope, ScopeKey, ScopeKind};
use crate::tables::{ConstantTable, Table, operand_index};

use keel_ast::{
    Alias, Arguments, BinOp, BoolOp, CmpOp, Expr, ExprContext, ExprKind, Function, Keyword,
    Module, Stmt, StmtKind, UnaryOp,
};
use keel_core::{CompileError, CompileResult, JumpConstruct, Span};
use std::sync::Arc;
use tracing::debug;

// =============================================================================
// Pipeline
// =============================================================================

/// Module compiler: runs the whole pipeline on one parsed module.
pub struct Compiler {
    filename: Arc<str>,
    checker: Box<dyn ConformityCheck>,
}

impl Compiler {
    /// Create a compiler using the default [`SubsetChecker`].
    pub fn new(filename: impl Into<Arc<str>>) -> Self {
        Self::with_checker(filename, SubsetChecker)
    }

    /// Create a compiler with a custom conformity checker.
    pub fn with_checker(
        filename: impl Into<Arc<str>>,
        checker: impl ConformityCheck + 'static,
    ) -> Self {
        Self {
            filename: filename.into(),
            checker: Box::new(checker),
        }
    }

    /// Source file name recorded in every code object.
    pub fn filename(&self) -> &str {
        &self.filename
    }

    /// Compile a module.
    ///
    /// The input is not modified; desugaring works on a copy.
    pub fn compile_module(&self, module: &Module, module_name: &str) -> CompileResult<CodeObject> {
        let module = desugar(module.clone());
        self.checker.check(&module)?;
        let scope = scope::analyze(&module);
        CodeGen::new(self.filename.clone(), &scope, Arc::from(module_name)).compile_module(&module)
    }
}

/// Compile a module with the default configuration.
pub fn compile_module(
    module: &Module,
    module_name: &str,
    filename: &str,
) -> CompileResult<CodeObject> {
    Compiler::new(filename).compile_module(module, module_name)
}

// =============================================================================
// Code Generator
// =============================================================================

/// Code generator for one code object.
///
/// Owns the constant pool, local slot table, register counter and label
/// counter of the code object it builds. Nested functions and classes get
/// their own generator; nothing is shared with the parent.
pub struct CodeGen<'s> {
    filename: Arc<str>,
    scope: &'s Scope,
    qualname: Arc<str>,
    constants: ConstantTable,
    varnames: Table<Arc<str>>,
    next_register: u32,
    max_registers: u32,
    next_label: u32,
}

/// Parameter shape of the code object being built.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Signature {
    argcount: u32,
    posonlyargcount: u32,
    kwonlyargcount: u32,
    varargs: bool,
    varkeywords: bool,
}

impl Signature {
    fn of(args: &Arguments) -> Self {
        Self {
            argcount: (args.posonlyargs.len() + args.args.len()) as u32,
            posonlyargcount: args.posonlyargs.len() as u32,
            kwonlyargcount: args.kwonlyargs.len() as u32,
            varargs: args.vararg.is_some(),
            varkeywords: args.kwarg.is_some(),
        }
    }
}

impl<'s> CodeGen<'s> {
    /// Create a generator for `scope`.
    pub fn new(filename: Arc<str>, scope: &'s Scope, qualname: Arc<str>) -> Self {
        Self {
            filename,
            scope,
            qualname,
            constants: ConstantTable::new(),
            varnames: Table::new(),
            next_register: 0,
            max_registers: 0,
            next_label: 0,
        }
    }

    /// Compile a module body, followed by `return None`.
    pub fn compile_module(mut self, module: &Module) -> CompileResult<CodeObject> {
        let assembly = self.body(&module.body)? + self.return_none()?;
        let name = self.qualname.clone();
        self.make_code(assembly, &name, Signature::default())
    }

    /// Compile a function object's body into its code object.
    pub fn compile_function(mut self, function: &Function) -> CompileResult<CodeObject> {
        let doc = docstring(&function.body).map_or(Constant::None, Constant::str);
        self.constants.index(doc);
        for name in function.args.names() {
            self.varnames.index(Arc::from(name));
        }
        let assembly = self.body(&function.body)? + self.return_none()?;
        self.make_code(assembly, &function.name, Signature::of(&function.args))
    }

    /// Assemble `assembly` and package it with this generator's tables.
    pub(crate) fn make_code(
        self,
        assembly: Assembly,
        name: &str,
        signature: Signature,
    ) -> CompileResult<CodeObject> {
        let nlocals = self.varnames.len() as u32;
        let frame = FrameLayout {
            nlocals,
            nregisters: self.max_registers,
        };
        let addresses = assembly.resolve()?;
        let code = assembly.encode(&addresses, frame)?;
        let stacksize = assembly.plumb_depths();
        let linetable = LineTable::from_line_nos(&assembly.line_nos());

        let mut flags = CodeFlags::NONE;
        if nlocals > 0 {
            flags = flags | CodeFlags::NEWLOCALS;
        }
        if signature.varargs {
            flags = flags | CodeFlags::VARARGS;
        }
        if signature.varkeywords {
            flags = flags | CodeFlags::VARKEYWORDS;
        }
        if !self.scope.freevars.is_empty() {
            flags = flags | CodeFlags::NESTED;
        }
        if !self.scope.has_derefvars() {
            flags = flags | CodeFlags::NOFREE;
        }

        let code = CodeObject {
            name: Arc::from(name),
            qualname: self.qualname,
            filename: self.filename,
            code: code.into_boxed_slice(),
            constants: self.constants.into_constants().into_boxed_slice(),
            varnames: self.varnames.into_entries().into_boxed_slice(),
            freevars: self.scope.freevars.clone().into_boxed_slice(),
            cellvars: self.scope.cellvars.clone().into_boxed_slice(),
            argcount: signature.argcount,
            posonlyargcount: signature.posonlyargcount,
            kwonlyargcount: signature.kwonlyargcount,
            nlocals,
            nregisters: self.max_registers,
            stacksize,
            framesize: nlocals + self.max_registers + stacksize,
            flags,
            linetable,
        };
        debug!(
            qualname = %code.qualname,
            bytes = code.code.len(),
            constants = code.constants.len(),
            nlocals = code.nlocals,
            nregisters = code.nregisters,
            stacksize = code.stacksize,
            "assembled code object"
        );
        Ok(code)
    }

    /// Qualified name of the code object being built.
    pub(crate) fn qualname(&self) -> &Arc<str> {
        &self.qualname
    }

    // =========================================================================
    // Tables, registers and labels
    // =========================================================================

    pub(crate) fn load_const(&mut self, constant: Constant) -> CompileResult<Assembly> {
        let index = operand_index("constant index", self.constants.index(constant))?;
        Ok(Instruction::op_d(Opcode::LoadConst, Operand::Imm(index)).into())
    }

    pub(crate) fn return_none(&mut self) -> CompileResult<Assembly> {
        Ok(self.load_const(Constant::None)? + Instruction::op(Opcode::ReturnValue))
    }

    /// Constant-pool operand for a dynamically looked-up name.
    fn name_operand(&mut self, name: &str) -> CompileResult<Operand> {
        let index = operand_index("name index", self.constants.name(name))?;
        Ok(Operand::Imm(index))
    }

    fn local_slot(&mut self, name: &str) -> CompileResult<Slot> {
        let index = self.varnames.index(Arc::from(name));
        let index = u16::try_from(index)
            .map_err(|_| CompileError::overflow("local slot", index, u16::MAX))?;
        Ok(Slot::Local(LocalSlot::new(index)))
    }

    fn cell_operand(&self, name: &str) -> CompileResult<Operand> {
        let index = operand_index("cell index", self.scope.cell_index(name)?)?;
        Ok(Operand::Imm(index))
    }

    fn new_register(&mut self) -> CompileResult<Register> {
        let index = u8::try_from(self.next_register)
            .map_err(|_| CompileError::overflow("register", self.next_register, u8::MAX))?;
        self.next_register += 1;
        self.max_registers = self.max_registers.max(self.next_register);
        Ok(Register::new(index))
    }

    /// Run `f`, then release every register it allocated.
    fn with_registers<T>(
        &mut self,
        f: impl FnOnce(&mut Self) -> CompileResult<T>,
    ) -> CompileResult<T> {
        let top = self.next_register;
        let result = f(self);
        self.next_register = top;
        result
    }

    /// Evaluate `expr` into a frame slot usable as an A operand.
    fn to_register(&mut self, expr: &Expr) -> CompileResult<(Slot, Assembly)> {
        if let ExprKind::Name {
            id,
            ctx: ExprContext::Load,
        } = &expr.kind
        {
            if self.scope.access(id) == Access::Fast {
                return Ok((self.local_slot(id)?, Assembly::no_op()));
            }
        }
        let reg = Slot::Register(self.new_register()?);
        let assembly = self.expr(expr)? + Instruction::op_d(Opcode::StoreFast, Operand::Slot(reg));
        Ok((reg, assembly))
    }

    /// Like [`Self::to_register`] for a bare name.
    fn name_to_register(&mut self, name: &str) -> CompileResult<(Slot, Assembly)> {
        if self.scope.access(name) == Access::Fast {
            return Ok((self.local_slot(name)?, Assembly::no_op()));
        }
        let reg = Slot::Register(self.new_register()?);
        let assembly = self.load(name)? + Instruction::op_d(Opcode::StoreFast, Operand::Slot(reg));
        Ok((reg, assembly))
    }

    fn new_label(&mut self, owner: JumpConstruct) -> Label {
        let label = Label::new(self.next_label, owner);
        self.next_label += 1;
        label
    }

    // =========================================================================
    // Names
    // =========================================================================

    pub(crate) fn load(&mut self, name: &str) -> CompileResult<Assembly> {
        let instr = match self.scope.access(name) {
            Access::Fast => {
                Instruction::op_d(Opcode::LoadFast, Operand::Slot(self.local_slot(name)?))
            }
            Access::Deref => Instruction::op_d(Opcode::LoadDeref, self.cell_operand(name)?),
            Access::Name => Instruction::op_d(Opcode::LoadName, self.name_operand(name)?),
        };
        Ok(instr.into())
    }

    pub(crate) fn store(&mut self, name: &str) -> CompileResult<Assembly> {
        let instr = match self.scope.access(name) {
            Access::Fast => {
                Instruction::op_d(Opcode::StoreFast, Operand::Slot(self.local_slot(name)?))
            }
            Access::Deref => Instruction::op_d(Opcode::StoreDeref, self.cell_operand(name)?),
            Access::Name => Instruction::op_d(Opcode::StoreName, self.name_operand(name)?),
        };
        Ok(instr.into())
    }

    // =========================================================================
    // Statements
    // =========================================================================

    pub(crate) fn body(&mut self, body: &[Stmt]) -> CompileResult<Assembly> {
        let mut parts = Vec::with_capacity(body.len());
        for stmt in body {
            parts.push(self.stmt(stmt)?);
        }
        Ok(Assembly::concat(parts))
    }

    fn stmt(&mut self, stmt: &Stmt) -> CompileResult<Assembly> {
        Ok(line_marker(stmt.span) + self.stmt_kind(stmt)?)
    }

    fn stmt_kind(&mut self, stmt: &Stmt) -> CompileResult<Assembly> {
        let span = stmt.span;
        match &stmt.kind {
            StmtKind::Expr(value) => Ok(self.expr(value)? + Instruction::op(Opcode::ClearAcc)),
            StmtKind::Pass => Ok(Assembly::no_op()),
            StmtKind::Assign { targets, value } => match targets.as_slice() {
                [target] => Ok(self.expr(value)? + self.expr(target)?),
                _ => Err(CompileError::unsupported("assignment to multiple targets", span)),
            },
            StmtKind::AugAssign { target, op, value } => self.aug_assign(target, *op, value),
            StmtKind::Return(value) => {
                let value = match value {
                    Some(value) => self.expr(value)?,
                    None => self.load_const(Constant::None)?,
                };
                Ok(value + Instruction::op(Opcode::ReturnValue))
            }
            StmtKind::If { test, body, orelse } => self.if_stmt(test, body, orelse),
            StmtKind::While { test, body, orelse } => {
                if !orelse.is_empty() {
                    return Err(CompileError::unsupported("while loop with else clause", span));
                }
                self.while_stmt(test, body)
            }
            StmtKind::For {
                target,
                iter,
                body,
                orelse,
            } => {
                if !orelse.is_empty() {
                    return Err(CompileError::unsupported("for loop with else clause", span));
                }
                self.for_stmt(target, iter, body)
            }
            StmtKind::Raise { exc, cause: None } => match exc {
                Some(exc) => Ok(self.expr(exc)?
                    + Instruction::op_d(Opcode::RaiseVarargs, Operand::Imm(1))),
                None => Ok(Instruction::op_d(Opcode::RaiseVarargs, Operand::Imm(0)).into()),
            },
            StmtKind::Import(names) => self.import(names),
            StmtKind::ImportFrom {
                module,
                names,
                level,
            } => self.import_from(module.as_deref().unwrap_or(""), names, *level),
            StmtKind::ClassDef(class) => self.class_def(class),

            StmtKind::Raise { .. } => Err(CompileError::unsupported("raise ... from ...", span)),
            StmtKind::FunctionDef { .. } => {
                Err(CompileError::unsupported("function definition statement", span))
            }
            StmtKind::Assert { .. } => Err(CompileError::unsupported("assert statement", span)),
            StmtKind::Break => Err(CompileError::unsupported("break statement", span)),
            StmtKind::Continue => Err(CompileError::unsupported("continue statement", span)),
            StmtKind::Delete(_) => Err(CompileError::unsupported("del statement", span)),
            StmtKind::Global(_) => Err(CompileError::unsupported("global declaration", span)),
            StmtKind::Nonlocal(_) => Err(CompileError::unsupported("nonlocal declaration", span)),
        }
    }

    fn aug_assign(&mut self, target: &Expr, op: BinOp, value: &Expr) -> CompileResult<Assembly> {
        let ExprKind::Name { id, .. } = &target.kind else {
            return Err(CompileError::unsupported(
                "augmented assignment to a non-name target",
                target.span,
            ));
        };
        let opcode = binary_opcode(op, target.span)?;
        let update = self.with_registers(|this| {
            let (reg, load) = this.name_to_register(id)?;
            Ok(load + this.expr(value)? + Instruction::op_a(opcode, Operand::Slot(reg)))
        })?;
        Ok(update + self.store(id)?)
    }

    fn if_stmt(&mut self, test: &Expr, body: &[Stmt], orelse: &[Stmt]) -> CompileResult<Assembly> {
        let else_label = self.new_label(JumpConstruct::If);
        let after = self.new_label(JumpConstruct::If);
        Ok(self.expr(test)?
            + jump(Opcode::PopJumpIfFalse, else_label)
            + self.body(body)?
            + jump(Opcode::Jump, after)
            + Assembly::label(else_label)
            + self.body(orelse)?
            + Assembly::label(after))
    }

    fn while_stmt(&mut self, test: &Expr, body: &[Stmt]) -> CompileResult<Assembly> {
        let top = self.new_label(JumpConstruct::While);
        let end = self.new_label(JumpConstruct::While);
        Ok(Assembly::label(top)
            + self.expr(test)?
            + jump(Opcode::PopJumpIfFalse, end)
            + self.body(body)?
            + jump(Opcode::Jump, top)
            + Assembly::label(end))
    }

    fn for_stmt(&mut self, target: &Expr, iter: &Expr, body: &[Stmt]) -> CompileResult<Assembly> {
        let top = self.new_label(JumpConstruct::For);
        let end = self.new_label(JumpConstruct::For);
        Ok(self.expr(iter)?
            + Instruction::op(Opcode::GetIter)
            + Assembly::label(top)
            + jump(Opcode::ForIter, end)
            + self.expr(target)?
            + self.body(body)?
            + jump(Opcode::Jump, top)
            + Assembly::label(end)
            + Assembly::offset_stack())
    }

    fn import_name(&mut self, level: u32, fromlist: Constant, name: &str) -> CompileResult<Assembly> {
        Ok(self.load_const(Constant::Int(i64::from(level)))?
            + self.load_const(fromlist)?
            + Instruction::op_d(Opcode::ImportName, self.name_operand(name)?))
    }

    fn import(&mut self, names: &[Alias]) -> CompileResult<Assembly> {
        let mut parts = Vec::with_capacity(names.len());
        for alias in names {
            let bound = match &alias.asname {
                Some(asname) => asname.as_str(),
                None => alias.name.split('.').next().unwrap_or(&alias.name),
            };
            parts.push(self.import_name(0, Constant::None, &alias.name)? + self.store(bound)?);
        }
        Ok(Assembly::concat(parts))
    }

    fn import_from(&mut self, module: &str, names: &[Alias], level: u32) -> CompileResult<Assembly> {
        let fromlist = Constant::str_tuple(names.iter().map(|a| a.name.as_str()));
        let mut parts = Vec::with_capacity(names.len() + 2);
        parts.push(self.import_name(level, fromlist, module)?);
        for alias in names {
            let bound = alias.asname.as_deref().unwrap_or(&alias.name);
            parts.push(
                Assembly::from(Instruction::op_d(Opcode::ImportFrom, self.name_operand(&alias.name)?))
                    + self.store(bound)?,
            );
        }
        parts.push(Instruction::op(Opcode::ClearAcc).into());
        Ok(Assembly::concat(parts))
    }

    // =========================================================================
    // Expressions
    // =========================================================================

    pub(crate) fn exprs(&mut self, exprs: &[Expr]) -> CompileResult<Assembly> {
        let mut parts = Vec::with_capacity(exprs.len());
        for expr in exprs {
            parts.push(self.expr(expr)?);
        }
        Ok(Assembly::concat(parts))
    }

    pub(crate) fn expr(&mut self, expr: &Expr) -> CompileResult<Assembly> {
        Ok(line_marker(expr.span) + self.expr_kind(expr)?)
    }

    fn expr_kind(&mut self, expr: &Expr) -> CompileResult<Assembly> {
        let span = expr.span;
        match &expr.kind {
            ExprKind::Constant(value) => self.load_const(Constant::from(value)),
            ExprKind::Name { id, ctx } => match ctx {
                ExprContext::Load => self.load(id),
                ExprContext::Store => self.store(id),
                ExprContext::Del => Err(CompileError::unsupported("deletion target", span)),
            },
            ExprKind::Call {
                func,
                args,
                keywords,
            } => self.call(func, args, keywords, span),
            ExprKind::Attribute { value, attr, ctx } => {
                let opcode = match ctx {
                    ExprContext::Load => Opcode::LoadAttr,
                    ExprContext::Store => Opcode::StoreAttr,
                    ExprContext::Del => {
                        return Err(CompileError::unsupported("attribute deletion", span));
                    }
                };
                Ok(self.expr(value)? + Instruction::op_d(opcode, self.name_operand(attr)?))
            }
            ExprKind::Subscript { value, slice, ctx } => {
                let opcode = match ctx {
                    ExprContext::Load => Opcode::BinarySubscr,
                    ExprContext::Store => Opcode::StoreSubscr,
                    ExprContext::Del => {
                        return Err(CompileError::unsupported("subscript deletion", span));
                    }
                };
                self.with_registers(|this| {
                    let (reg, container) = this.to_register(value)?;
                    Ok(container + this.expr(slice)? + Instruction::op_a(opcode, Operand::Slot(reg)))
                })
            }
            ExprKind::List { elts, ctx } => self.sequence(elts, *ctx, Opcode::BuildList, span),
            ExprKind::Tuple { elts, ctx } => self.sequence(elts, *ctx, Opcode::BuildTuple, span),
            ExprKind::Set(elts) => Ok(self.exprs(elts)?
                + Instruction::op_d(Opcode::BuildSet, count_operand("set size", elts.len())?)),
            ExprKind::Dict { keys, values } => self.dict(keys, values),
            ExprKind::UnaryOp { op, operand } => {
                Ok(self.expr(operand)? + Instruction::op(unary_opcode(*op)))
            }
            ExprKind::BinOp { left, op, right } => {
                let opcode = binary_opcode(*op, span)?;
                self.with_registers(|this| {
                    let (reg, left) = this.to_register(left)?;
                    Ok(left + this.expr(right)? + Instruction::op_a(opcode, Operand::Slot(reg)))
                })
            }
            ExprKind::Compare {
                left,
                ops,
                comparators,
            } => match (ops.as_slice(), comparators.as_slice()) {
                ([op], [right]) => self.compare(left, *op, right),
                _ => Err(CompileError::unsupported("chained comparison", span)),
            },
            ExprKind::BoolOp { op, values } => self.bool_op(*op, values, span),
            ExprKind::IfExp { test, body, orelse } => {
                let else_label = self.new_label(JumpConstruct::IfExp);
                let after = self.new_label(JumpConstruct::IfExp);
                Ok(self.expr(test)?
                    + jump(Opcode::PopJumpIfFalse, else_label)
                    + self.expr(body)?
                    + jump(Opcode::Jump, after)
                    + Assembly::offset_stack()
                    + Assembly::label(else_label)
                    + self.expr(orelse)?
                    + Assembly::label(after))
            }
            ExprKind::Function(function) => {
                let code = self.sprout_function(function)?;
                self.make_closure(code, &function.name)
            }

            ExprKind::Lambda { .. } => Err(CompileError::unsupported("lambda", span)),
            ExprKind::ListComp { .. } => {
                Err(CompileError::unsupported("list comprehension", span))
            }
            ExprKind::SetComp { .. } => Err(CompileError::unsupported("set comprehension", span)),
            ExprKind::DictComp { .. } => {
                Err(CompileError::unsupported("dict comprehension", span))
            }
            ExprKind::GeneratorExp { .. } => {
                Err(CompileError::unsupported("generator expression", span))
            }
            ExprKind::Yield(_) => Err(CompileError::unsupported("yield expression", span)),
            ExprKind::Starred { .. } => Err(CompileError::unsupported("starred expression", span)),
            ExprKind::Slice { .. } => Err(CompileError::unsupported("slice", span)),
        }
    }

    fn call(
        &mut self,
        func: &Expr,
        args: &[Expr],
        keywords: &[Keyword],
        span: Span,
    ) -> CompileResult<Assembly> {
        let mut parts = Vec::with_capacity(keywords.len() + 3);
        parts.push(self.expr(func)?);
        parts.push(self.exprs(args)?);
        for keyword in keywords {
            let Some(name) = &keyword.arg else {
                return Err(CompileError::unsupported("** argument unpacking", span));
            };
            parts.push(self.load_const(Constant::str(name))? + self.expr(&keyword.value)?);
        }
        let nargs = small_count("positional argument count", args.len())?;
        let nkw = small_count("keyword argument count", keywords.len())?;
        parts.push(Instruction::op_ad(Opcode::CallFunction, nargs, nkw).into());
        Ok(Assembly::concat(parts))
    }

    fn compare(&mut self, left: &Expr, op: CmpOp, right: &Expr) -> CompileResult<Assembly> {
        let index = compare_index(op);
        self.with_registers(|this| {
            let (reg, left) = this.to_register(left)?;
            Ok(left
                + this.expr(right)?
                + Instruction::op_ad(Opcode::CompareOp, Operand::Slot(reg), Operand::Imm(index)))
        })
    }

    fn bool_op(&mut self, op: BoolOp, values: &[Expr], span: Span) -> CompileResult<Assembly> {
        let (opcode, owner) = match op {
            BoolOp::And => (Opcode::JumpIfFalseOrPop, JumpConstruct::And),
            BoolOp::Or => (Opcode::JumpIfTrueOrPop, JumpConstruct::Or),
        };
        let Some((first, rest)) = values.split_first() else {
            return Err(CompileError::unsupported("empty boolean operation", span));
        };
        let mut parts = Vec::with_capacity(values.len());
        parts.push(self.expr(first)?);
        for value in rest {
            let after = self.new_label(owner);
            parts.push(
                Assembly::from(jump(opcode, after))
                    + Assembly::offset_stack()
                    + self.expr(value)?
                    + Assembly::label(after),
            );
        }
        Ok(Assembly::concat(parts))
    }

    fn sequence(
        &mut self,
        elts: &[Expr],
        ctx: ExprContext,
        build: Opcode,
        span: Span,
    ) -> CompileResult<Assembly> {
        let count = count_operand("sequence length", elts.len())?;
        match ctx {
            ExprContext::Load => Ok(self.exprs(elts)? + Instruction::op_d(build, count)),
            ExprContext::Store => {
                Ok(Assembly::from(Instruction::op_d(Opcode::UnpackSequence, count)) + self.exprs(elts)?)
            }
            ExprContext::Del => Err(CompileError::unsupported("sequence deletion", span)),
        }
    }

    fn dict(&mut self, keys: &[Expr], values: &[Expr]) -> CompileResult<Assembly> {
        let presize = keys.len().min(usize::from(u16::MAX)) as u32;
        let mut parts: Vec<Assembly> = Vec::with_capacity(keys.len() + 1);
        parts.push(Instruction::op_d(Opcode::BuildMap, Operand::Imm(presize)).into());
        for (key, value) in keys.iter().zip(values) {
            parts.push(self.expr(value)? + self.expr(key)? + Instruction::op(Opcode::StoreMap));
        }
        Ok(Assembly::concat(parts))
    }

    // =========================================================================
    // Nested code objects
    // =========================================================================

    /// Qualified name for a scope named `name` nested in this one.
    pub(crate) fn child_qualname(&self, name: &str) -> Arc<str> {
        match self.scope.kind {
            ScopeKind::Module => Arc::from(name),
            ScopeKind::Function => Arc::from(format!("{}.<locals>.{name}", self.qualname)),
            ScopeKind::Class => Arc::from(format!("{}.{name}", self.qualname)),
        }
    }

    /// Generator for the scope opened by the node with `key`.
    pub(crate) fn sprout(&self, key: ScopeKey, name: &str) -> CompileResult<CodeGen<'s>> {
        let scope: &'s Scope = self.scope;
        let child = scope.child(key)?;
        Ok(CodeGen::new(
            self.filename.clone(),
            child,
            self.child_qualname(name),
        ))
    }

    fn sprout_function(&self, function: &Function) -> CompileResult<CodeObject> {
        self.sprout(ScopeKey::function(function), &function.name)?
            .compile_function(function)
    }

    /// Build a function object from `code`, passing its free variables'
    /// cells when it has any.
    pub(crate) fn make_closure(&mut self, code: CodeObject, name: &str) -> CompileResult<Assembly> {
        let code = Arc::new(code);
        let mut parts: Vec<Assembly> = Vec::with_capacity(code.freevars.len() + 4);
        let flags = if code.freevars.is_empty() {
            0
        } else {
            for freevar in code.freevars.iter() {
                parts.push(Instruction::op_d(Opcode::LoadClosure, self.cell_operand(freevar)?).into());
            }
            parts.push(
                Instruction::op_d(
                    Opcode::BuildTuple,
                    count_operand("closure size", code.freevars.len())?,
                )
                .into(),
            );
            MAKE_FUNCTION_CLOSURE
        };
        parts.push(self.load_const(Constant::Code(code))?);
        parts.push(self.load_const(Constant::str(name))?);
        parts.push(Instruction::op_a(Opcode::MakeFunction, Operand::Imm(flags)).into());
        Ok(Assembly::concat(parts))
    }
}

// =============================================================================
// Helpers
// =============================================================================

/// Line marker preceding the code of a node, if it has a position.
fn line_marker(span: Span) -> Assembly {
    if span.is_dummy() {
        Assembly::no_op()
    } else {
        Assembly::line_no(span.line)
    }
}

/// Docstring of a body: a leading string-literal expression statement.
pub(crate) fn docstring(body: &[Stmt]) -> Option<&str> {
    match &body.first()?.kind {
        StmtKind::Expr(value) => value.as_str_constant(),
        _ => None,
    }
}

fn count_operand(what: &'static str, n: usize) -> CompileResult<Operand> {
    let n = u32::try_from(n).map_err(|_| CompileError::overflow(what, n as u64, u16::MAX))?;
    Ok(Operand::Imm(operand_index(what, n)?))
}

fn small_count(what: &'static str, n: usize) -> CompileResult<Operand> {
    u8::try_from(n)
        .map(|n| Operand::Imm(u32::from(n)))
        .map_err(|_| CompileError::overflow(what, n as u64, u8::MAX))
}

fn unary_opcode(op: UnaryOp) -> Opcode {
    match op {
        UnaryOp::UAdd => Opcode::UnaryPositive,
        UnaryOp::USub => Opcode::UnaryNegative,
        UnaryOp::Not => Opcode::UnaryNot,
        UnaryOp::Invert => Opcode::UnaryInvert,
    }
}

fn binary_opcode(op: BinOp, span: Span) -> CompileResult<Opcode> {
    Ok(match op {
        BinOp::Add => Opcode::BinaryAdd,
        BinOp::Sub => Opcode::BinarySubtract,
        BinOp::Mult => Opcode::BinaryMultiply,
        BinOp::Div => Opcode::BinaryTrueDivide,
        BinOp::FloorDiv => Opcode::BinaryFloorDivide,
        BinOp::Mod => Opcode::BinaryModulo,
        BinOp::Pow => Opcode::BinaryPower,
        BinOp::LShift => Opcode::BinaryLshift,
        BinOp::RShift => Opcode::BinaryRshift,
        BinOp::BitAnd => Opcode::BinaryAnd,
        BinOp::BitOr => Opcode::BinaryOr,
        BinOp::BitXor => Opcode::BinaryXor,
        BinOp::MatMult => {
            return Err(CompileError::unsupported("matrix multiplication operator", span));
        }
    })
}

/// Index of a comparison in the `COMPARE_OP` operator table.
fn compare_index(op: CmpOp) -> u32 {
    match op {
        CmpOp::Lt => 0,
        CmpOp::LtE => 1,
        CmpOp::Eq => 2,
        CmpOp::NotEq => 3,
        CmpOp::Gt => 4,
        CmpOp::GtE => 5,
        CmpOp::In => 6,
        CmpOp::NotIn => 7,
        CmpOp::Is => 8,
        CmpOp::IsNot => 9,
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::instruction::cmp_op_index;
    use keel_ast::Constant as Lit;

    fn line(n: u32) -> Span {
        Span::line(n)
    }

    fn load(id: &str) -> Expr {
        Expr::name(id, ExprContext::Load, line(1))
    }

    fn store(id: &str) -> Expr {
        Expr::name(id, ExprContext::Store, line(1))
    }

    fn int(n: i64) -> Expr {
        Expr::constant(Lit::Int(n), line(1))
    }

    fn compile(stmts: Vec<Stmt>) -> CodeObject {
        compile_module(&Module::new(stmts), "<module>", "test.py").expect("compile failed")
    }

    fn opcodes(code: &CodeObject) -> Vec<Opcode> {
        code.instructions().map(|i| i.opcode).collect()
    }

    #[test]
    fn test_compare_index_matches_table() {
        for op in [
            CmpOp::Lt,
            CmpOp::LtE,
            CmpOp::Eq,
            CmpOp::NotEq,
            CmpOp::Gt,
            CmpOp::GtE,
            CmpOp::In,
            CmpOp::NotIn,
            CmpOp::Is,
            CmpOp::IsNot,
        ] {
            assert_eq!(cmp_op_index(op.as_str()), Some(compare_index(op)), "{op:?}");
        }
    }

    #[test]
    fn test_empty_module() {
        let code = compile(vec![]);
        assert_eq!(opcodes(&code), [Opcode::LoadConst, Opcode::ReturnValue]);
        assert_eq!(&*code.constants, &[Constant::None]);
        assert_eq!(code.first_lineno(), 1);
        assert_eq!(code.stacksize, 1);
        assert_eq!(code.flags, CodeFlags::NOFREE);
    }

    #[test]
    fn test_compile_assignment() {
        let code = compile(vec![Stmt::assign(store("x"), int(1), line(1))]);
        assert_eq!(
            opcodes(&code),
            [
                Opcode::LoadConst,
                Opcode::StoreName,
                Opcode::LoadConst,
                Opcode::ReturnValue
            ]
        );
        assert_eq!(code.constants[1], Constant::str("x"));
    }

    #[test]
    fn test_expression_statement_clears_accumulator() {
        let code = compile(vec![Stmt::expr(load("f"), line(1))]);
        assert_eq!(opcodes(&code)[..2], [Opcode::LoadName, Opcode::ClearAcc]);
    }

    #[test]
    fn test_binop_uses_register() {
        let sum = Expr::binop(load("a"), BinOp::Add, load("b"), line(1));
        let code = compile(vec![Stmt::expr(sum, line(1))]);
        assert_eq!(
            opcodes(&code)[..4],
            [
                Opcode::LoadName,
                Opcode::StoreFast,
                Opcode::LoadName,
                Opcode::BinaryAdd
            ]
        );
        assert_eq!(code.nregisters, 1);
        assert_eq!(code.nlocals, 0);
    }

    #[test]
    fn test_call_with_keywords() {
        let call = Expr::new(
            ExprKind::Call {
                func: Box::new(load("f")),
                args: vec![int(1)],
                keywords: vec![Keyword {
                    arg: Some("k".into()),
                    value: int(2),
                }],
            },
            line(1),
        );
        let code = compile(vec![Stmt::expr(call, line(1))]);
        let call = code
            .instructions()
            .find(|i| i.opcode == Opcode::CallFunction)
            .unwrap();
        assert_eq!((call.a, call.d), (1, 1));
    }

    #[test]
    fn test_bare_raise() {
        let code = compile(vec![Stmt::new(
            StmtKind::Raise {
                exc: None,
                cause: None,
            },
            line(1),
        )]);
        let first = code.instructions().next().unwrap();
        assert_eq!(first.opcode, Opcode::RaiseVarargs);
        assert_eq!(first.d, 0);
    }

    #[test]
    fn test_qualname_rules() {
        let scope = Scope::new(ScopeKind::Function, "outer", ScopeKey::MODULE);
        let generator = CodeGen::new(Arc::from("t.py"), &scope, Arc::from("outer"));
        assert_eq!(&*generator.child_qualname("inner"), "outer.<locals>.inner");

        let class = Scope::new(ScopeKind::Class, "C", ScopeKey::MODULE);
        let generator = CodeGen::new(Arc::from("t.py"), &class, Arc::from("C"));
        assert_eq!(&*generator.child_qualname("m"), "C.m");
    }

    #[test]
    fn test_docstring_detection() {
        let body = vec![Stmt::expr(
            Expr::constant(Lit::Str("doc".into()), line(1)),
            line(1),
        )];
        assert_eq!(docstring(&body), Some("doc"));
        assert_eq!(docstring(&[]), None);
    }

    #[test]
    fn test_custom_checker_runs() {
        let compiler = Compiler::with_checker("t.py", |_: &Module| -> CompileResult<()> {
            Err(CompileError::unsupported("nothing allowed", Span::dummy()))
        });
        assert!(compiler.compile_module(&Module::default(), "m").is_err());
        assert_eq!(compiler.filename(), "t.py");
    }
}
