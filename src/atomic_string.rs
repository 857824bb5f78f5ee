//! Context-scoped string interning.
//!
//! An [`AtomicString`] is equal to another iff both were produced by the
//! same [`AtomicStringTable`] interning equal bytes — equality is a 32-bit
//! index comparison, not a byte comparison. Two tables never share
//! identity: the same source text interned in two different contexts
//! produces [`AtomicString`]s that are not comparable to one another by
//! value, matching the "per-context interning table" contract.

use rustc_hash::FxHashMap;
use std::num::NonZeroU32;

/// An interned, context-scoped string. Cheap to copy and compare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AtomicString(NonZeroU32);

impl AtomicString {
    #[inline]
    fn from_raw(raw: u32) -> Self {
        AtomicString(NonZeroU32::new(raw + 1).expect("interner index overflow"))
    }

    #[inline]
    fn to_raw(self) -> usize {
        (self.0.get() - 1) as usize
    }
}

/// Per-context string interning table.
///
/// Creation is O(length) amortized: a hash lookup against the existing
/// entries, or a fresh allocation on first sight of a string.
#[derive(Default)]
pub struct AtomicStringTable {
    map: FxHashMap<Box<str>, AtomicString>,
    strings: Vec<Box<str>>,
}

impl AtomicStringTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern `s`, returning the existing [`AtomicString`] if this table
    /// has already seen an equal string.
    pub fn intern(&mut self, s: &str) -> AtomicString {
        if let Some(&existing) = self.map.get(s) {
            return existing;
        }
        let sym = AtomicString::from_raw(self.strings.len() as u32);
        let boxed: Box<str> = s.into();
        self.strings.push(boxed.clone());
        self.map.insert(boxed, sym);
        sym
    }

    /// Resolve a previously interned string back to its contents.
    ///
    /// # Panics
    /// Panics if `sym` was not produced by this table.
    pub fn resolve(&self, sym: AtomicString) -> &str {
        &self.strings[sym.to_raw()]
    }

    pub fn len(&self) -> usize {
        self.strings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strings.is_empty()
    }

    /// Iterate interned strings in first-seen (insertion) order — the
    /// order the code cache writer uses for its string table section.
    pub fn iter_in_insertion_order(&self) -> impl Iterator<Item = (AtomicString, &str)> {
        self.strings
            .iter()
            .enumerate()
            .map(|(i, s)| (AtomicString::from_raw(i as u32), s.as_ref()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_deduplicates() {
        let mut t = AtomicStringTable::new();
        let a = t.intern("foo");
        let b = t.intern("bar");
        let c = t.intern("foo");
        assert_eq!(a, c);
        assert_ne!(a, b);
        assert_eq!(t.len(), 2);
    }

    #[test]
    fn two_tables_do_not_share_identity() {
        let mut t1 = AtomicStringTable::new();
        let mut t2 = AtomicStringTable::new();
        let a = t1.intern("x");
        let b = t2.intern("x");
        // Same raw index is possible, but they come from different tables;
        // nothing in the API lets you compare across tables, which is the point.
        assert_eq!(t1.resolve(a), t2.resolve(b));
    }

    #[test]
    fn insertion_order_is_first_seen() {
        let mut t = AtomicStringTable::new();
        t.intern("b");
        t.intern("a");
        t.intern("b");
        let order: Vec<&str> = t.iter_in_insertion_order().map(|(_, s)| s).collect();
        assert_eq!(order, vec!["b", "a"]);
    }
}
