//! Shared helpers for the integration tests: terse AST builders and a small
//! reference interpreter for executing compiled code objects.

#![allow(dead_code)]

use keel_ast::{
    Alias, Arguments, BinOp, BoolOp, CmpOp, Comprehension, Constant as Lit, Expr, ExprContext, ExprKind,
    Function, Module, Span, Stmt, StmtKind,
};
use keel_compiler::bytecode::INSTRUCTION_WIDTH;
use keel_compiler::{
    CodeObject, CompileError, Constant, DecodedInstruction, Opcode, compile_module,
};
use rustc_hash::FxHashMap;
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

// =============================================================================
// AST Builders
// =============================================================================

pub fn name(id: &str) -> Expr {
    Expr::name(id, ExprContext::Load, Span::dummy())
}

pub fn store(id: &str) -> Expr {
    Expr::name(id, ExprContext::Store, Span::dummy())
}

pub fn int(n: i64) -> Expr {
    Expr::constant(Lit::Int(n), Span::dummy())
}

pub fn string(s: &str) -> Expr {
    Expr::constant(Lit::Str(s.to_owned()), Span::dummy())
}

pub fn none() -> Expr {
    Expr::constant(Lit::None, Span::dummy())
}

pub fn call(func: Expr, args: Vec<Expr>) -> Expr {
    Expr::call(func, args, Span::dummy())
}

pub fn attr(value: Expr, attr: &str) -> Expr {
    Expr::attribute(value, attr, ExprContext::Load, Span::dummy())
}

pub fn attr_store(value: Expr, attr: &str) -> Expr {
    Expr::attribute(value, attr, ExprContext::Store, Span::dummy())
}

pub fn binop(left: Expr, op: BinOp, right: Expr) -> Expr {
    Expr::binop(left, op, right, Span::dummy())
}

pub fn compare(left: Expr, op: CmpOp, right: Expr) -> Expr {
    Expr::new(
        ExprKind::Compare {
            left: Box::new(left),
            ops: vec![op],
            comparators: vec![right],
        },
        Span::dummy(),
    )
}

pub fn list(elts: Vec<Expr>) -> Expr {
    Expr::new(
        ExprKind::List {
            elts,
            ctx: ExprContext::Load,
        },
        Span::dummy(),
    )
}

pub fn dict(keys: Vec<Expr>, values: Vec<Expr>) -> Expr {
    Expr::new(ExprKind::Dict { keys, values }, Span::dummy())
}

pub fn bool_op(op: BoolOp, values: Vec<Expr>) -> Expr {
    Expr::new(ExprKind::BoolOp { op, values }, Span::dummy())
}

pub fn subscript(value: Expr, index: Expr) -> Expr {
    Expr::new(
        ExprKind::Subscript {
            value: Box::new(value),
            slice: Box::new(index),
            ctx: ExprContext::Load,
        },
        Span::dummy(),
    )
}

pub fn lambda(params: &[&str], body: Expr) -> Expr {
    Expr::new(
        ExprKind::Lambda {
            args: Box::new(Arguments::positional(params.iter().copied())),
            body: Box::new(body),
        },
        Span::dummy(),
    )
}

/// `[elt for target in iter if ifs...]`
pub fn listcomp(elt: Expr, target: &str, iter: Expr, ifs: Vec<Expr>) -> Expr {
    Expr::new(
        ExprKind::ListComp {
            elt: Box::new(elt),
            generators: vec![Comprehension {
                target: store(target),
                iter,
                ifs,
            }],
        },
        Span::dummy(),
    )
}

pub fn assign(target: &str, value: Expr) -> Stmt {
    Stmt::assign(store(target), value, Span::dummy())
}

pub fn assign_to(target: Expr, value: Expr) -> Stmt {
    Stmt::assign(target, value, Span::dummy())
}

pub fn expr_stmt(value: Expr) -> Stmt {
    Stmt::expr(value, Span::dummy())
}

pub fn ret(value: Expr) -> Stmt {
    Stmt::ret(Some(value), Span::dummy())
}

pub fn pass() -> Stmt {
    Stmt::new(StmtKind::Pass, Span::dummy())
}

pub fn def(name: &str, params: &[&str], body: Vec<Stmt>) -> Stmt {
    decorated(name, params, vec![], body)
}

pub fn decorated(name: &str, params: &[&str], decorators: Vec<Expr>, body: Vec<Stmt>) -> Stmt {
    Stmt::new(
        StmtKind::FunctionDef {
            function: Box::new(Function::new(
                name,
                Arguments::positional(params.iter().copied()),
                body,
            )),
            decorator_list: decorators,
        },
        Span::dummy(),
    )
}

pub fn class(name: &str, bases: Vec<Expr>, body: Vec<Stmt>) -> Stmt {
    Stmt::new(
        StmtKind::ClassDef(Box::new(keel_ast::ClassDef::new(name, bases, body))),
        Span::dummy(),
    )
}

pub fn aug(target: Expr, op: BinOp, value: Expr) -> Stmt {
    Stmt::new(
        StmtKind::AugAssign {
            target: Box::new(target),
            op,
            value: Box::new(value),
        },
        Span::dummy(),
    )
}

pub fn if_(test: Expr, body: Vec<Stmt>, orelse: Vec<Stmt>) -> Stmt {
    Stmt::new(
        StmtKind::If {
            test: Box::new(test),
            body,
            orelse,
        },
        Span::dummy(),
    )
}

pub fn while_(test: Expr, body: Vec<Stmt>) -> Stmt {
    Stmt::new(
        StmtKind::While {
            test: Box::new(test),
            body,
            orelse: Vec::new(),
        },
        Span::dummy(),
    )
}

pub fn for_(target: &str, iter: Expr, body: Vec<Stmt>) -> Stmt {
    Stmt::new(
        StmtKind::For {
            target: Box::new(store(target)),
            iter: Box::new(iter),
            body,
            orelse: Vec::new(),
        },
        Span::dummy(),
    )
}

pub fn import(names: &[(&str, Option<&str>)]) -> Stmt {
    Stmt::new(
        StmtKind::Import(names.iter().map(|(n, a)| Alias::new(*n, *a)).collect()),
        Span::dummy(),
    )
}

pub fn import_from(module: &str, names: &[(&str, Option<&str>)], level: u32) -> Stmt {
    Stmt::new(
        StmtKind::ImportFrom {
            module: Some(module.to_owned()),
            names: names.iter().map(|(n, a)| Alias::new(*n, *a)).collect(),
            level,
        },
        Span::dummy(),
    )
}

/// Place a statement on a source line.
pub fn at(line: u32, mut stmt: Stmt) -> Stmt {
    stmt.span = Span::line(line);
    stmt
}

// =============================================================================
// Compilation Helpers
// =============================================================================

/// Compile a module body, panicking on error.
pub fn compile(body: Vec<Stmt>) -> CodeObject {
    compile_module(&Module::new(body), "<module>", "test.py").expect("Failed to compile")
}

/// Compile a module body that must be rejected.
pub fn compile_err(body: Vec<Stmt>) -> CompileError {
    compile_module(&Module::new(body), "<module>", "test.py")
        .expect_err("compilation should have failed")
}

/// Opcodes of a code object, in order.
pub fn ops(code: &CodeObject) -> Vec<Opcode> {
    code.instructions().map(|i| i.opcode).collect()
}

/// Number of occurrences of `opcode`.
pub fn count(code: &CodeObject, opcode: Opcode) -> usize {
    code.instructions().filter(|i| i.opcode == opcode).count()
}

/// Find a nested code object by name, searching depth first.
pub fn nested<'a>(code: &'a CodeObject, name: &str) -> &'a CodeObject {
    fn find<'a>(code: &'a CodeObject, name: &str) -> Option<&'a CodeObject> {
        code.nested_code_objects().find_map(|child| {
            if &*child.name == name {
                Some(&**child)
            } else {
                find(child, name)
            }
        })
    }
    find(code, name).unwrap_or_else(|| panic!("no nested code object named {name}"))
}

/// Constant referenced by the D operand of `instr`.
pub fn operand_const<'a>(code: &'a CodeObject, instr: &DecodedInstruction) -> &'a Constant {
    &code.constants[usize::from(instr.d)]
}

// =============================================================================
// Reference Interpreter
// =============================================================================

/// Runtime value of the reference interpreter.
#[derive(Debug, Clone)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Str(Arc<str>),
    List(Rc<RefCell<Vec<Value>>>),
    Tuple(Rc<Vec<Value>>),
    Code(Arc<CodeObject>),
    Function(Rc<FunctionValue>),
    Builtin(&'static str),
    /// `list.append` bound to a list.
    Append(Rc<RefCell<Vec<Value>>>),
    Cell(Rc<RefCell<Value>>),
    Iter(Rc<RefCell<std::vec::IntoIter<Value>>>),
}

#[derive(Debug)]
pub struct FunctionValue {
    pub code: Arc<CodeObject>,
    pub closure: Vec<Rc<RefCell<Value>>>,
}

impl Value {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            Value::Bool(b) => Some(i64::from(*b)),
            _ => None,
        }
    }

    /// Elements of a list of integers.
    pub fn int_list(&self) -> Option<Vec<i64>> {
        match self {
            Value::List(items) => items.borrow().iter().map(Value::as_int).collect(),
            _ => None,
        }
    }

    fn truthy(&self) -> bool {
        match self {
            Value::None => false,
            Value::Bool(b) => *b,
            Value::Int(n) => *n != 0,
            Value::Str(s) => !s.is_empty(),
            Value::List(items) => !items.borrow().is_empty(),
            Value::Tuple(items) => !items.is_empty(),
            _ => true,
        }
    }

    fn from_constant(constant: &Constant) -> Result<Value, String> {
        Ok(match constant {
            Constant::None => Value::None,
            Constant::Bool(b) => Value::Bool(*b),
            Constant::Int(n) => Value::Int(*n),
            Constant::Str(s) => Value::Str(s.clone()),
            Constant::Tuple(items) => Value::Tuple(Rc::new(
                items
                    .iter()
                    .map(Value::from_constant)
                    .collect::<Result<_, _>>()?,
            )),
            Constant::Code(code) => Value::Code(code.clone()),
            other => return Err(format!("unsupported constant {other}")),
        })
    }
}

const STEP_LIMIT: usize = 100_000;

/// Executes code objects with module-level names in a single namespace.
#[derive(Debug, Default)]
pub struct Interpreter {
    pub globals: FxHashMap<Arc<str>, Value>,
    steps: usize,
}

impl Interpreter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run a module code object, returning its result.
    pub fn run_module(&mut self, code: &CodeObject) -> Result<Value, String> {
        let slots = vec![Value::None; (code.nlocals + code.nregisters) as usize];
        self.run(code, slots, Vec::new())
    }

    pub fn global(&self, name: &str) -> Option<&Value> {
        self.globals.get(name)
    }

    fn lookup(&self, name: &str) -> Result<Value, String> {
        if let Some(value) = self.globals.get(name) {
            return Ok(value.clone());
        }
        match name {
            "range" => Ok(Value::Builtin("range")),
            "len" => Ok(Value::Builtin("len")),
            _ => Err(format!("name {name:?} is not defined")),
        }
    }

    fn call(&mut self, callee: Value, args: Vec<Value>) -> Result<Value, String> {
        match callee {
            Value::Function(function) => {
                let code = &function.code;
                if args.len() != code.argcount as usize {
                    return Err(format!(
                        "{} takes {} arguments, got {}",
                        code.name,
                        code.argcount,
                        args.len()
                    ));
                }
                let mut slots = vec![Value::None; (code.nlocals + code.nregisters) as usize];
                for (slot, arg) in slots.iter_mut().zip(args) {
                    *slot = arg;
                }
                let mut cells: Vec<Rc<RefCell<Value>>> = code
                    .cellvars
                    .iter()
                    .map(|cell| {
                        let init = code
                            .varnames
                            .iter()
                            .position(|v| v == cell)
                            .filter(|&i| i < code.argcount as usize)
                            .map_or(Value::None, |i| slots[i].clone());
                        Rc::new(RefCell::new(init))
                    })
                    .collect();
                cells.extend(function.closure.iter().cloned());
                self.run(code, slots, cells)
            }
            Value::Builtin("range") => match args.as_slice() {
                [Value::Int(n)] => Ok(Value::List(Rc::new(RefCell::new(
                    (0..*n).map(Value::Int).collect(),
                )))),
                _ => Err("range expects one integer".into()),
            },
            Value::Builtin("len") => match args.as_slice() {
                [Value::List(items)] => Ok(Value::Int(items.borrow().len() as i64)),
                _ => Err("len expects a list".into()),
            },
            Value::Append(items) => {
                items.borrow_mut().extend(args);
                Ok(Value::None)
            }
            other => Err(format!("{other:?} is not callable")),
        }
    }

    fn run(
        &mut self,
        code: &CodeObject,
        mut slots: Vec<Value>,
        cells: Vec<Rc<RefCell<Value>>>,
    ) -> Result<Value, String> {
        let mut stack: Vec<Value> = Vec::with_capacity(code.stacksize as usize);
        let mut pc = 0u32;
        loop {
            self.steps += 1;
            if self.steps > STEP_LIMIT {
                return Err("step limit exceeded".into());
            }
            let instr = DecodedInstruction::decode(&code.code, pc)
                .ok_or_else(|| format!("no instruction at offset {pc}"))?;
            pc += INSTRUCTION_WIDTH;
            let a = usize::from(instr.a);
            let d = usize::from(instr.d);
            let target = instr.jump_target();

            match instr.opcode {
                Opcode::Nop => {}
                Opcode::LoadConst => stack.push(Value::from_constant(&code.constants[d])?),
                Opcode::LoadFast => stack.push(slots[d].clone()),
                Opcode::StoreFast => slots[d] = pop(&mut stack)?,
                Opcode::LoadName => {
                    let name = const_str(code, d)?;
                    stack.push(self.lookup(name)?);
                }
                Opcode::StoreName => {
                    let name = const_str(code, d)?;
                    let value = pop(&mut stack)?;
                    self.globals.insert(Arc::from(name), value);
                }
                Opcode::LoadDeref => stack.push(cells[d].borrow().clone()),
                Opcode::StoreDeref => {
                    let value = pop(&mut stack)?;
                    *cells[d].borrow_mut() = value;
                }
                Opcode::LoadClosure => stack.push(Value::Cell(cells[d].clone())),
                Opcode::BuildTuple => {
                    let items = stack.split_off(stack.len() - d);
                    stack.push(Value::Tuple(Rc::new(items)));
                }
                Opcode::BuildList => {
                    let items = stack.split_off(stack.len() - d);
                    stack.push(Value::List(Rc::new(RefCell::new(items))));
                }
                Opcode::BinaryAdd
                | Opcode::BinarySubtract
                | Opcode::BinaryMultiply
                | Opcode::BinaryModulo
                | Opcode::CompareOp => {
                    let right = pop(&mut stack)?;
                    let left = slots[a].clone();
                    stack.push(binary(instr.opcode, d, &left, &right)?);
                }
                Opcode::BinarySubscr => {
                    let index = pop(&mut stack)?;
                    let value = match (&slots[a], index.as_int()) {
                        (Value::List(items), Some(i)) => items
                            .borrow()
                            .get(i as usize)
                            .cloned()
                            .ok_or("list index out of range")?,
                        (container, _) => return Err(format!("cannot index {container:?}")),
                    };
                    stack.push(value);
                }
                Opcode::LoadAttr => {
                    let attr = const_str(code, d)?;
                    match (pop(&mut stack)?, attr) {
                        (Value::List(items), "append") => stack.push(Value::Append(items)),
                        (obj, attr) => return Err(format!("no attribute {attr} on {obj:?}")),
                    }
                }
                Opcode::CallFunction => {
                    if d != 0 {
                        return Err("keyword arguments are not supported".into());
                    }
                    let args = stack.split_off(stack.len() - a);
                    let callee = pop(&mut stack)?;
                    let result = self.call(callee, args)?;
                    stack.push(result);
                }
                Opcode::MakeFunction => {
                    let _name = pop(&mut stack)?;
                    let Value::Code(function_code) = pop(&mut stack)? else {
                        return Err("MAKE_FUNCTION without code".into());
                    };
                    let closure = if a & 0x08 != 0 {
                        match pop(&mut stack)? {
                            Value::Tuple(items) => items
                                .iter()
                                .map(|item| match item {
                                    Value::Cell(cell) => Ok(cell.clone()),
                                    other => Err(format!("{other:?} is not a cell")),
                                })
                                .collect::<Result<_, _>>()?,
                            other => return Err(format!("{other:?} is not a closure tuple")),
                        }
                    } else {
                        Vec::new()
                    };
                    stack.push(Value::Function(Rc::new(FunctionValue {
                        code: function_code,
                        closure,
                    })));
                }
                Opcode::GetIter => match pop(&mut stack)? {
                    Value::List(items) => {
                        let items = items.borrow().clone();
                        stack.push(Value::Iter(Rc::new(RefCell::new(items.into_iter()))));
                    }
                    other => return Err(format!("{other:?} is not iterable")),
                },
                Opcode::ForIter => {
                    let next = match stack.last() {
                        Some(Value::Iter(iter)) => iter.borrow_mut().next(),
                        _ => return Err("FOR_ITER without an iterator".into()),
                    };
                    match next {
                        Some(item) => stack.push(item),
                        None => {
                            stack.pop();
                            pc = target.ok_or("FOR_ITER without target")?;
                        }
                    }
                }
                Opcode::Jump => pc = target.ok_or("JUMP without target")?,
                Opcode::PopJumpIfFalse => {
                    if !pop(&mut stack)?.truthy() {
                        pc = target.ok_or("jump without target")?;
                    }
                }
                Opcode::JumpIfFalseOrPop | Opcode::JumpIfTrueOrPop => {
                    let jump_when = instr.opcode == Opcode::JumpIfTrueOrPop;
                    let top = stack.last().ok_or("empty stack")?;
                    if top.truthy() == jump_when {
                        pc = target.ok_or("jump without target")?;
                    } else {
                        stack.pop();
                    }
                }
                Opcode::UnaryNot => {
                    let value = pop(&mut stack)?;
                    stack.push(Value::Bool(!value.truthy()));
                }
                Opcode::UnaryNegative => match pop(&mut stack)?.as_int() {
                    Some(n) => stack.push(Value::Int(-n)),
                    None => return Err("bad operand for unary -".into()),
                },
                Opcode::ClearAcc => {
                    pop(&mut stack)?;
                }
                Opcode::ReturnValue => return pop(&mut stack),
                Opcode::RaiseVarargs => return Err("exception raised".into()),
                other => {
                    return Err(format!("{} is not supported by the interpreter", other.name()));
                }
            }
        }
    }
}

fn pop(stack: &mut Vec<Value>) -> Result<Value, String> {
    stack.pop().ok_or_else(|| "stack underflow".to_string())
}

fn const_str(code: &CodeObject, index: usize) -> Result<&str, String> {
    code.constants[index]
        .as_str()
        .ok_or_else(|| format!("constant {index} is not a name"))
}

fn binary(opcode: Opcode, cmp: usize, left: &Value, right: &Value) -> Result<Value, String> {
    if let (Value::Str(l), Value::Str(r), Opcode::BinaryAdd) = (left, right, opcode) {
        return Ok(Value::Str(Arc::from(format!("{l}{r}"))));
    }
    let (Some(l), Some(r)) = (left.as_int(), right.as_int()) else {
        return Err(format!("unsupported operands {left:?} and {right:?}"));
    };
    Ok(match opcode {
        Opcode::BinaryAdd => Value::Int(l + r),
        Opcode::BinarySubtract => Value::Int(l - r),
        Opcode::BinaryMultiply => Value::Int(l * r),
        Opcode::BinaryModulo => Value::Int(l.rem_euclid(r)),
        Opcode::CompareOp => Value::Bool(match cmp {
            0 => l < r,
            1 => l <= r,
            2 => l == r,
            3 => l != r,
            4 => l > r,
            5 => l >= r,
            _ => return Err(format!("comparison {cmp} is not supported")),
        }),
        _ => return Err(format!("{} is not supported", opcode.name())),
    })
}

/// Compile and run a module body, returning the interpreter for inspection.
pub fn exec(body: Vec<Stmt>) -> Interpreter {
    let code = compile(body);
    let mut interp = Interpreter::new();
    interp
        .run_module(&code)
        .unwrap_or_else(|err| panic!("execution failed: {err}\n{}", keel_compiler::disassemble(&code)));
    interp
}
