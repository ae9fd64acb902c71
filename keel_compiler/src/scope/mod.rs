//! Lexical scope analysis.
//!
//! Every module, function object and class body opens a [`Scope`]. Analysis
//! runs over the whole desugared tree in two passes:
//!
//! 1. [`ScopeCollector`] walks top-down and records, per scope, which names
//!    are defined (assigned, imported, parameters) and which are used.
//! 2. [`ClosureAnalyzer`] walks bottom-up and classifies each name as a
//!    local, a cell, a free variable, or a dynamic (by-name) lookup.
//!
//! The code generator then asks a scope for the [`Access`] of a name to pick
//! between the `*_FAST`, `*_DEREF` and `*_NAME` instruction families.

mod closure;
mod collector;

pub use closure::{ClosureAnalyzer, ClosureStats};
pub use collector::ScopeCollector;

use keel_ast::{ClassDef, Function, Module};
use keel_core::{CompileError, CompileResult};
use rustc_hash::FxHashSet;
use std::sync::Arc;
use tracing::debug;

/// Kind of scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScopeKind {
    /// Module top level.
    Module,
    /// Function body (including lambdas and comprehensions after
    /// desugaring).
    Function,
    /// Class body.
    Class,
}

/// Identity of the node that opened a scope.
///
/// Scopes are keyed by the address of their defining node, so analysis and
/// code generation must see the same, unmoved tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScopeKey(usize);

impl ScopeKey {
    /// Key of the module scope.
    pub const MODULE: ScopeKey = ScopeKey(0);

    /// Key of the scope opened by a function object.
    #[inline]
    pub fn function(function: &Function) -> Self {
        ScopeKey(std::ptr::from_ref(function) as usize)
    }

    /// Key of the scope opened by a class body.
    #[inline]
    pub fn class(class: &ClassDef) -> Self {
        ScopeKey(std::ptr::from_ref(class) as usize)
    }
}

/// How the code generator reaches a name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Access {
    /// Through a cell (`LOAD_DEREF` / `STORE_DEREF`).
    Deref,
    /// A local frame slot (`LOAD_FAST` / `STORE_FAST`).
    Fast,
    /// Dynamic lookup by name (`LOAD_NAME` / `STORE_NAME`).
    Name,
}

/// A lexical scope and, after analysis, the classification of its names.
#[derive(Debug, Clone)]
pub struct Scope {
    /// Scope kind.
    pub kind: ScopeKind,
    /// Name of the defining construct (`<module>` for the top level).
    pub name: Arc<str>,
    /// Key of the defining node.
    pub key: ScopeKey,
    /// Enclosed scopes in source order.
    pub children: Vec<Scope>,
    /// Names bound in this scope.
    pub defs: FxHashSet<Arc<str>>,
    /// Names read in this scope.
    pub uses: FxHashSet<Arc<str>>,
    /// Names stored in frame slots (function scopes only).
    pub local_defs: FxHashSet<Arc<str>>,
    /// Locals captured by enclosed scopes, sorted.
    pub cellvars: Vec<Arc<str>>,
    /// Names captured from enclosing scopes, sorted.
    pub freevars: Vec<Arc<str>>,
    /// `cellvars` followed by `freevars`; indices are closure cell indices.
    pub derefvars: Vec<Arc<str>>,
}

impl Scope {
    /// Create an empty scope.
    pub fn new(kind: ScopeKind, name: impl Into<Arc<str>>, key: ScopeKey) -> Self {
        Self {
            kind,
            name: name.into(),
            key,
            children: Vec::new(),
            defs: FxHashSet::default(),
            uses: FxHashSet::default(),
            local_defs: FxHashSet::default(),
            cellvars: Vec::new(),
            freevars: Vec::new(),
            derefvars: Vec::new(),
        }
    }

    /// Record a binding.
    #[inline]
    pub fn add_def(&mut self, name: &str) {
        if !self.defs.contains(name) {
            self.defs.insert(Arc::from(name));
        }
    }

    /// Record a read.
    #[inline]
    pub fn add_use(&mut self, name: &str) {
        if !self.uses.contains(name) {
            self.uses.insert(Arc::from(name));
        }
    }

    /// How code in this scope reaches `name`.
    pub fn access(&self, name: &str) -> Access {
        if self.derefvars.iter().any(|v| &**v == name) {
            Access::Deref
        } else if self.local_defs.contains(name) {
            Access::Fast
        } else {
            Access::Name
        }
    }

    /// Closure cell index of `name`.
    pub fn cell_index(&self, name: &str) -> CompileResult<u32> {
        self.derefvars
            .iter()
            .position(|v| &**v == name)
            .map(|i| i as u32)
            .ok_or_else(|| {
                CompileError::internal(format!(
                    "no closure cell for '{name}' in scope '{}'",
                    self.name
                ))
            })
    }

    /// The enclosed scope opened by the node with `key`.
    pub fn child(&self, key: ScopeKey) -> CompileResult<&Scope> {
        self.children
            .iter()
            .find(|c| c.key == key)
            .ok_or_else(|| {
                CompileError::internal(format!("no scope recorded under '{}'", self.name))
            })
    }

    /// Check if any names are reached through cells.
    #[inline]
    pub fn has_derefvars(&self) -> bool {
        !self.derefvars.is_empty()
    }
}

/// Analyze a desugared module, returning its fully classified module scope.
pub fn analyze(module: &Module) -> Scope {
    let mut root = ScopeCollector::new().collect(module);
    let stats = ClosureAnalyzer::new().analyze(&mut root);
    debug!(
        scopes = stats.scopes_analyzed,
        closures = stats.scopes_with_freevars,
        cells = stats.cell_count,
        max_depth = stats.max_depth,
        "scope analysis finished"
    );
    root
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classified(kind: ScopeKind) -> Scope {
        let mut scope = Scope::new(kind, "f", ScopeKey::MODULE);
        scope.add_def("x");
        scope.add_def("c");
        scope.local_defs = scope.defs.clone();
        scope.cellvars = vec![Arc::from("c")];
        scope.freevars = vec![Arc::from("free")];
        scope.derefvars = vec![Arc::from("c"), Arc::from("free")];
        scope
    }

    #[test]
    fn test_access_priority() {
        let scope = classified(ScopeKind::Function);
        assert_eq!(scope.access("c"), Access::Deref);
        assert_eq!(scope.access("free"), Access::Deref);
        assert_eq!(scope.access("x"), Access::Fast);
        assert_eq!(scope.access("print"), Access::Name);
    }

    #[test]
    fn test_cell_index() {
        let scope = classified(ScopeKind::Function);
        assert_eq!(scope.cell_index("c").unwrap(), 0);
        assert_eq!(scope.cell_index("free").unwrap(), 1);
        assert!(scope.cell_index("x").unwrap_err().is_internal());
    }

    #[test]
    fn test_missing_child_is_internal() {
        let scope = Scope::new(ScopeKind::Module, "<module>", ScopeKey::MODULE);
        let class = ClassDef::new("C", vec![], vec![]);
        assert!(scope.child(ScopeKey::class(&class)).unwrap_err().is_internal());
    }

    #[test]
    fn test_defs_are_deduplicated() {
        let mut scope = Scope::new(ScopeKind::Module, "<module>", ScopeKey::MODULE);
        scope.add_def("a");
        scope.add_def("a");
        scope.add_use("a");
        assert_eq!(scope.defs.len(), 1);
        assert_eq!(scope.uses.len(), 1);
    }
}
