//! Class definition compilation.
//!
//! A class statement compiles to a call of the class builder:
//!
//! 1. `LOAD_BUILD_CLASS` pushes the builder
//! 2. The class body is compiled into a child `CodeObject` and wrapped in a
//!    function (a closure when methods capture enclosing variables)
//! 3. The class name and the base expressions follow as arguments
//! 4. `CALL_FUNCTION` runs the body to populate the namespace and creates
//!    the class, which is then bound to the class name
//!
//! The body itself starts by recording `__module__`, `__qualname__` and,
//! when present, `__doc__` in the class namespace.

use crate::bytecode::{Assembly, CodeObject, Constant, Instruction, Opcode, Operand};
use crate::compiler::{CodeGen, Signature, docstring};
use crate::scope::ScopeKey;
use keel_ast::ClassDef;
use keel_core::{CompileError, CompileResult};
use std::sync::Arc;

/// Compiler for a class body.
///
/// Wraps the [`CodeGen`] of the class scope; the resulting code object
/// returns `None` after populating its namespace.
pub struct ClassCompiler<'s> {
    /// Name of the class being compiled.
    name: Arc<str>,
    /// Generator for the class scope.
    body: CodeGen<'s>,
}

impl<'s> ClassCompiler<'s> {
    /// Create a class compiler over the generator of the class scope.
    pub fn new(name: impl Into<Arc<str>>, body: CodeGen<'s>) -> Self {
        Self {
            name: name.into(),
            body,
        }
    }

    /// Compile the class body.
    pub fn compile(self, class: &ClassDef) -> CompileResult<CodeObject> {
        let mut body = self.body;
        let qualname = body.qualname().clone();

        let mut parts = vec![
            body.load("__name__")? + body.store("__module__")?,
            body.load_const(Constant::Str(qualname))? + body.store("__qualname__")?,
        ];
        if let Some(doc) = docstring(&class.body) {
            parts.push(body.load_const(Constant::str(doc))? + body.store("__doc__")?);
        }
        parts.push(body.body(&class.body)?);
        parts.push(body.return_none()?);

        body.make_code(Assembly::concat(parts), &self.name, Signature::default())
    }
}

impl CodeGen<'_> {
    /// `class Name(bases): body`
    pub(crate) fn class_def(&mut self, class: &ClassDef) -> CompileResult<Assembly> {
        let nargs = class.bases.len() + 2;
        let nargs = u8::try_from(nargs)
            .map_err(|_| CompileError::overflow("class base count", nargs as u64, u8::MAX))?;

        let body = self.sprout(ScopeKey::class(class), &class.name)?;
        let code = ClassCompiler::new(class.name.as_str(), body).compile(class)?;

        Ok(Assembly::from(Instruction::op(Opcode::LoadBuildClass))
            + self.make_closure(code, &class.name)?
            + self.load_const(Constant::str(&class.name))?
            + self.exprs(&class.bases)?
            + Instruction::op_ad(
                Opcode::CallFunction,
                Operand::Imm(u32::from(nargs)),
                Operand::Imm(0),
            )
            + self.store(&class.name)?)
    }
}
