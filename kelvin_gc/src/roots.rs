//! Temporary roots.
//!
//! Any routine that performs two or more allocations must protect the
//! first before making the second: it pushes the value as a temporary
//! root, and reads it back through the root after every potential
//! collection point, because compaction may have moved it.
//!
//! The stack is a single growable array indexed by a saved length; a
//! [`RootScope`] restores the saved length when dropped, which is the
//! nestable-scope rendition of the C original's save/restore-a-global
//! discipline. Interior pointers use [`TempRoot::Interior`]: the
//! collector rewrites the address by the same delta it applies to the
//! run of live objects containing it.

use crate::header::Ptr;
use std::cell::RefCell;

/// One temporary root entry.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TempRoot {
    /// An object pointer to keep alive and relocate.
    Object(Ptr),
    /// An interior cell address within `base`; the address is rewritten
    /// by the delta the collector applies to `base`.
    Interior { address: u32, base: Ptr },
}

/// Index of a pushed root, used to read the value back after a
/// potential collection point.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RootId(usize);

/// The temporary-root stack.
///
/// Interior mutability lets a [`RootScope`] hold the stack open while
/// the VM continues to push roots and read them back.
#[derive(Debug, Default)]
pub struct TempRoots {
    entries: RefCell<Vec<TempRoot>>,
}

impl TempRoots {
    #[must_use]
    pub fn new() -> Self {
        TempRoots::default()
    }

    /// Push an object root; read it back with [`TempRoots::get`].
    pub fn push(&self, ptr: Ptr) -> RootId {
        let mut entries = self.entries.borrow_mut();
        entries.push(TempRoot::Object(ptr));
        RootId(entries.len() - 1)
    }

    /// Push an interior root over `base`.
    pub fn push_interior(&self, address: u32, base: Ptr) -> RootId {
        let mut entries = self.entries.borrow_mut();
        entries.push(TempRoot::Interior { address, base });
        RootId(entries.len() - 1)
    }

    /// Read a root back, after any potential collection point.
    #[must_use]
    pub fn get(&self, id: RootId) -> Ptr {
        match self.entries.borrow()[id.0] {
            TempRoot::Object(ptr) => ptr,
            TempRoot::Interior { base, .. } => base,
        }
    }

    /// Read an interior root's address back.
    #[must_use]
    pub fn get_interior(&self, id: RootId) -> u32 {
        match self.entries.borrow()[id.0] {
            TempRoot::Object(ptr) => ptr.0,
            TempRoot::Interior { address, .. } => address,
        }
    }

    /// Overwrite a root in place.
    pub fn set(&self, id: RootId, ptr: Ptr) {
        self.entries.borrow_mut()[id.0] = TempRoot::Object(ptr);
    }

    /// Current stack depth.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.entries.borrow().len()
    }

    /// Truncate to `depth`; used by the error-unwind path, which must
    /// restore the stack to its depth at the enclosing try point.
    pub fn truncate(&self, depth: usize) {
        self.entries.borrow_mut().truncate(depth);
    }

    /// Snapshot for the collector.
    pub(crate) fn entries(&self) -> Vec<TempRoot> {
        self.entries.borrow().clone()
    }

    /// Store the collector's rewritten entries.
    pub(crate) fn replace_entries(&self, entries: Vec<TempRoot>) {
        *self.entries.borrow_mut() = entries;
    }
}

/// A scope guard that restores the temporary-root stack depth on drop.
#[derive(Debug)]
pub struct RootScope<'a> {
    roots: &'a TempRoots,
    saved_depth: usize,
}

impl<'a> RootScope<'a> {
    #[must_use]
    pub fn new(roots: &'a TempRoots) -> Self {
        RootScope {
            roots,
            saved_depth: roots.depth(),
        }
    }

    /// The stack the scope protects.
    #[must_use]
    pub fn roots(&self) -> &'a TempRoots {
        self.roots
    }
}

impl Drop for RootScope<'_> {
    fn drop(&mut self) {
        self.roots.truncate(self.saved_depth);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_restores_depth() {
        let roots = TempRoots::new();
        let outer = roots.push(Ptr(10));
        {
            let _scope = RootScope::new(&roots);
            roots.push(Ptr(20));
            roots.push(Ptr(30));
            assert_eq!(roots.depth(), 3);
        }
        assert_eq!(roots.depth(), 1);
        assert_eq!(roots.get(outer), Ptr(10));
    }

    #[test]
    fn test_nested_scopes() {
        let roots = TempRoots::new();
        let _outer_scope = RootScope::new(&roots);
        roots.push(Ptr(1));
        {
            let _inner_scope = RootScope::new(&roots);
            roots.push(Ptr(2));
            assert_eq!(roots.depth(), 2);
        }
        assert_eq!(roots.depth(), 1);
    }

    #[test]
    fn test_interior_root() {
        let roots = TempRoots::new();
        let id = roots.push_interior(105, Ptr(100));
        assert_eq!(roots.get_interior(id), 105);
        assert_eq!(roots.get(id), Ptr(100));
    }
}
