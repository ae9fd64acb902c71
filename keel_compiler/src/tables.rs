//! Insert-or-get tables for constants and local variable names.
//!
//! Both tables hand out dense indices in first-insertion order. Indices end
//! up in the 16-bit D operand, so the code generator checks them with
//! [`operand_index`] before use.

use crate::bytecode::Constant;
use keel_core::{CompileError, CompileResult};
use rustc_hash::FxHashMap;
use std::hash::Hash;
use std::sync::Arc;

/// Ordered interning table.
#[derive(Debug, Clone)]
pub struct Table<K> {
    map: FxHashMap<K, u32>,
    entries: Vec<K>,
}

impl<K: Hash + Eq + Clone> Table<K> {
    /// Create an empty table.
    pub fn new() -> Self {
        Self {
            map: FxHashMap::default(),
            entries: Vec::new(),
        }
    }

    /// Index of `key`, assigning the next index on first sight.
    pub fn index(&mut self, key: K) -> u32 {
        if let Some(&index) = self.map.get(&key) {
            return index;
        }
        let index = self.entries.len() as u32;
        self.map.insert(key.clone(), index);
        self.entries.push(key);
        index
    }

    /// Index of `key` if already present.
    pub fn get<Q>(&self, key: &Q) -> Option<u32>
    where
        K: std::borrow::Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.map.get(key).copied()
    }

    /// Number of entries.
    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in index order.
    #[inline]
    pub fn entries(&self) -> &[K] {
        &self.entries
    }

    /// Consume the table, yielding entries in index order.
    pub fn into_entries(self) -> Vec<K> {
        self.entries
    }
}

impl<K: Hash + Eq + Clone> Default for Table<K> {
    fn default() -> Self {
        Self::new()
    }
}

/// Interning identity of a constant: value and type.
///
/// `1`, `1.0` and `True` are distinct; floats compare by bit pattern (so
/// `0.0` and `-0.0` stay apart and NaN interns); code objects compare by
/// identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum ConstantKey {
    None,
    Bool(bool),
    Int(i64),
    Float(u64),
    Str(Arc<str>),
    Bytes(Arc<[u8]>),
    Ellipsis,
    Tuple(Vec<ConstantKey>),
    Code(usize),
}

impl ConstantKey {
    fn of(constant: &Constant) -> Self {
        match constant {
            Constant::None => ConstantKey::None,
            Constant::Bool(b) => ConstantKey::Bool(*b),
            Constant::Int(n) => ConstantKey::Int(*n),
            Constant::Float(x) => ConstantKey::Float(x.to_bits()),
            Constant::Str(s) => ConstantKey::Str(s.clone()),
            Constant::Bytes(b) => ConstantKey::Bytes(b.clone()),
            Constant::Ellipsis => ConstantKey::Ellipsis,
            Constant::Tuple(items) => ConstantKey::Tuple(items.iter().map(Self::of).collect()),
            Constant::Code(code) => ConstantKey::Code(Arc::as_ptr(code) as usize),
        }
    }
}

/// Constant pool: literals, names looked up dynamically, and nested code.
#[derive(Debug, Clone, Default)]
pub struct ConstantTable {
    keys: Table<ConstantKey>,
    values: Vec<Constant>,
}

impl ConstantTable {
    /// Create an empty pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// Index of `constant`, adding it on first sight.
    pub fn index(&mut self, constant: Constant) -> u32 {
        let before = self.keys.len();
        let index = self.keys.index(ConstantKey::of(&constant));
        if self.keys.len() > before {
            self.values.push(constant);
        }
        index
    }

    /// Index of a name, interned as a string constant.
    pub fn name(&mut self, name: &str) -> u32 {
        self.index(Constant::str(name))
    }

    /// Number of constants.
    #[inline]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Check if empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Constants in index order.
    pub fn into_constants(self) -> Vec<Constant> {
        self.values
    }
}

/// Check that a table index fits the 16-bit D operand.
pub fn operand_index(what: &'static str, index: u32) -> CompileResult<u32> {
    if index > u32::from(u16::MAX) {
        return Err(CompileError::overflow(what, index, u16::MAX));
    }
    Ok(index)
}
