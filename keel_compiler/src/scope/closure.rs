//! Closure analysis for cell and free variable detection.
//!
//! Runs after [`ScopeCollector`](super::ScopeCollector) and completes the
//! classification of every scope, inner scopes first.
//!
//! # Cell vs Free Variables
//!
//! - **Cell variable**: a local of a function that some enclosed scope
//!   reads or writes. The function creates the cell.
//! - **Free variable**: a name an enclosed scope reaches in a cell owned by
//!   an enclosing function. It is passed in through the closure tuple.
//!
//! Module and class bodies have no frame-slot locals, so they never own
//! cells; a class body only forwards free variables to its methods.
//!
//! # Algorithm
//!
//! For each scope, given `parent_defs` (the locals of all enclosing
//! functions):
//!
//! 1. `local_defs` = defs for a function, nothing otherwise
//! 2. analyze children with `parent_defs ∪ local_defs`
//! 3. `cellvars` = (∪ child freevars) ∩ `local_defs`
//! 4. `freevars` = (uses ∪ child freevars) ∩ (`parent_defs` − `local_defs`)
//! 5. `derefvars` = `cellvars` ++ `freevars`

use super::{Scope, ScopeKind};
use rustc_hash::FxHashSet;
use std::sync::Arc;
use tracing::trace;

/// Closure analyzer that computes cell/freevar relationships.
#[derive(Debug, Default)]
pub struct ClosureAnalyzer {
    stats: ClosureStats,
}

/// Statistics about closure analysis.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ClosureStats {
    /// Total number of scopes analyzed.
    pub scopes_analyzed: usize,
    /// Number of scopes with freevars.
    pub scopes_with_freevars: usize,
    /// Total number of cell variables created.
    pub cell_count: usize,
    /// Total number of free variable references.
    pub freevar_count: usize,
    /// Maximum scope nesting depth encountered.
    pub max_depth: usize,
}

impl ClosureAnalyzer {
    /// Create a new closure analyzer.
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Classify every scope under `root` in place.
    pub fn analyze(&mut self, root: &mut Scope) -> ClosureStats {
        self.process_scope(root, &FxHashSet::default(), 0);
        self.stats.clone()
    }

    fn process_scope(&mut self, scope: &mut Scope, parent_defs: &FxHashSet<Arc<str>>, depth: usize) {
        self.stats.scopes_analyzed += 1;
        self.stats.max_depth = self.stats.max_depth.max(depth);

        scope.local_defs = if scope.kind == ScopeKind::Function {
            scope.defs.clone()
        } else {
            FxHashSet::default()
        };

        let child_parent_defs: FxHashSet<Arc<str>> =
            parent_defs.union(&scope.local_defs).cloned().collect();
        let mut child_free: FxHashSet<Arc<str>> = FxHashSet::default();
        for child in &mut scope.children {
            self.process_scope(child, &child_parent_defs, depth + 1);
            child_free.extend(child.freevars.iter().cloned());
        }

        let mut cellvars: Vec<Arc<str>> = child_free
            .iter()
            .filter(|name| scope.local_defs.contains(*name))
            .cloned()
            .collect();
        cellvars.sort();

        let mut freevars: Vec<Arc<str>> = scope
            .uses
            .iter()
            .chain(child_free.iter())
            .filter(|name| parent_defs.contains(*name) && !scope.local_defs.contains(*name))
            .cloned()
            .collect::<FxHashSet<_>>()
            .into_iter()
            .collect();
        freevars.sort();

        if !freevars.is_empty() {
            self.stats.scopes_with_freevars += 1;
        }
        self.stats.cell_count += cellvars.len();
        self.stats.freevar_count += freevars.len();

        scope.derefvars = cellvars.iter().chain(freevars.iter()).cloned().collect();
        scope.cellvars = cellvars;
        scope.freevars = freevars;

        trace!(
            scope = %scope.name,
            kind = ?scope.kind,
            locals = scope.local_defs.len(),
            cellvars = ?scope.cellvars,
            freevars = ?scope.freevars,
            "classified scope"
        );
    }
}

// =============================================================================
// Tests
// =============================================================================
