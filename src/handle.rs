//! Handle indirection: the process-local table mapping coordinator-assigned
//! 64-bit handles to live, reference-counted scene objects.
//!
//! Handles substitute for pointers across processes that never share memory.
//! The coordinator allocates the numeric value once and embeds it in the
//! serialized command; each process binds its own object under that value, so
//! lookups resolve to the semantically corresponding object everywhere.
//!
//! Only the dispatch task binds and releases entries, but render tasks
//! concurrently retain, read, and release their claims, so the table lives
//! behind a `DashMap` with per-entry locking.

use crate::core::errors::HandleError;
use crate::object::SceneObject;
use dashmap::DashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Opaque object identity shared by every process in the cluster.
/// The raw value 0 is the reserved null sentinel, which is also the default.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle(u64);

impl Handle {
    /// The undefined/null sentinel
    pub const NULL: Handle = Handle(0);

    pub const fn from_raw(raw: u64) -> Self {
        Handle(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }

    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            write!(f, "null")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

struct Slot {
    object: Arc<SceneObject>,
    refs: u32,
}

/// Process-local table of live objects keyed by handle.
///
/// An entry owns its object and carries an explicit reference count: binding
/// sets it to 1, retains (async render claims) increment it, releases
/// decrement it, and the entry is destroyed only at zero. A released entry
/// fails further lookups cleanly rather than returning stale data.
pub struct HandleTable {
    slots: DashMap<Handle, Slot>,
    next: AtomicU64,
}

impl HandleTable {
    pub fn new() -> Self {
        Self {
            slots: DashMap::new(),
            next: AtomicU64::new(1),
        }
    }

    /// Allocate a fresh handle. Only the coordinator calls this; workers
    /// receive every handle value over the wire.
    pub fn allocate(&self) -> Handle {
        Handle(self.next.fetch_add(1, Ordering::Relaxed))
    }

    /// Bind an object under `handle` with a reference count of 1. This is
    /// what first brings the handle into existence on this process.
    pub fn bind(&self, handle: Handle, object: Arc<SceneObject>) -> Result<(), HandleError> {
        if handle.is_null() {
            return Err(HandleError::Undefined { handle });
        }
        match self.slots.entry(handle) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(HandleError::AlreadyBound { handle })
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(Slot { object, refs: 1 });
                Ok(())
            }
        }
    }

    /// Resolve a handle to its live object. The returned `Arc` is a borrow
    /// for the current command's execution; holding it past that scope is
    /// only legitimate together with an explicit `retain`.
    pub fn lookup(&self, handle: Handle) -> Result<Arc<SceneObject>, HandleError> {
        if handle.is_null() {
            return Err(HandleError::Undefined { handle });
        }
        match self.slots.get(&handle) {
            Some(slot) if slot.refs > 0 => Ok(Arc::clone(&slot.object)),
            _ => Err(HandleError::Undefined { handle }),
        }
    }

    /// Increment the reference count, keeping the entry alive across an
    /// asynchronous operation
    pub fn retain(&self, handle: Handle) -> Result<(), HandleError> {
        if handle.is_null() {
            return Err(HandleError::Undefined { handle });
        }
        match self.slots.get_mut(&handle) {
            Some(mut slot) if slot.refs > 0 => {
                slot.refs += 1;
                Ok(())
            }
            _ => Err(HandleError::Undefined { handle }),
        }
    }

    /// Decrement the reference count. Returns the object when this release
    /// destroyed the entry (count reached zero), `None` while other holders
    /// remain. Destruction is deferred, never forced, while async tasks
    /// still hold their claims.
    pub fn release(&self, handle: Handle) -> Result<Option<Arc<SceneObject>>, HandleError> {
        if handle.is_null() {
            return Err(HandleError::Undefined { handle });
        }
        let now_dead = {
            let mut slot = self
                .slots
                .get_mut(&handle)
                .ok_or(HandleError::Undefined { handle })?;
            if slot.refs == 0 {
                // Entry is mid-destruction on another task
                return Err(HandleError::Undefined { handle });
            }
            slot.refs -= 1;
            slot.refs == 0
        };
        if now_dead {
            if let Some((_, slot)) = self.slots.remove_if(&handle, |_, s| s.refs == 0) {
                return Ok(Some(slot.object));
            }
        }
        Ok(None)
    }

    /// Whether the handle currently resolves
    pub fn defined(&self, handle: Handle) -> bool {
        !handle.is_null()
            && self
                .slots
                .get(&handle)
                .map(|slot| slot.refs > 0)
                .unwrap_or(false)
    }

    /// Current reference count, if the handle is live
    pub fn ref_count(&self, handle: Handle) -> Option<u32> {
        self.slots.get(&handle).map(|slot| slot.refs)
    }

    /// Number of live entries
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::ObjectKind;

    fn renderer() -> Arc<SceneObject> {
        Arc::new(SceneObject::new(ObjectKind::Renderer, "scivis"))
    }

    #[test]
    fn allocated_handles_are_unique_and_nonnull() {
        let table = HandleTable::new();
        let mut seen = std::collections::HashSet::new();
        for _ in 0..256 {
            let h = table.allocate();
            assert!(!h.is_null());
            assert!(seen.insert(h));
        }
    }

    #[test]
    fn bind_then_lookup() {
        let table = HandleTable::new();
        let h = table.allocate();
        table.bind(h, renderer()).unwrap();
        let obj = table.lookup(h).unwrap();
        assert_eq!(obj.kind(), ObjectKind::Renderer);
        assert_eq!(table.ref_count(h), Some(1));
    }

    #[test]
    fn double_bind_rejected() {
        let table = HandleTable::new();
        let h = table.allocate();
        table.bind(h, renderer()).unwrap();
        assert!(matches!(
            table.bind(h, renderer()),
            Err(HandleError::AlreadyBound { .. })
        ));
    }

    #[test]
    fn null_handle_never_resolves() {
        let table = HandleTable::new();
        assert!(matches!(
            table.lookup(Handle::NULL),
            Err(HandleError::Undefined { .. })
        ));
        assert!(matches!(
            table.bind(Handle::NULL, renderer()),
            Err(HandleError::Undefined { .. })
        ));
        assert!(!table.defined(Handle::NULL));
    }

    #[test]
    fn release_to_zero_destroys() {
        let table = HandleTable::new();
        let h = table.allocate();
        table.bind(h, renderer()).unwrap();
        let destroyed = table.release(h).unwrap();
        assert!(destroyed.is_some());
        assert!(!table.defined(h));
        assert!(matches!(
            table.lookup(h),
            Err(HandleError::Undefined { .. })
        ));
    }

    #[test]
    fn retain_defers_destruction() {
        let table = HandleTable::new();
        let h = table.allocate();
        table.bind(h, renderer()).unwrap();
        table.retain(h).unwrap();
        assert_eq!(table.ref_count(h), Some(2));

        // First release: a holder remains, entry stays live
        assert!(table.release(h).unwrap().is_none());
        assert!(table.defined(h));
        assert!(table.lookup(h).is_ok());

        // Final release destroys
        assert!(table.release(h).unwrap().is_some());
        assert!(!table.defined(h));
    }

    #[test]
    fn release_of_undefined_handle_errors() {
        let table = HandleTable::new();
        assert!(matches!(
            table.release(Handle::from_raw(77)),
            Err(HandleError::Undefined { .. })
        ));
    }

    #[test]
    fn concurrent_retain_release_balances() {
        let table = Arc::new(HandleTable::new());
        let h = table.allocate();
        table.bind(h, renderer()).unwrap();

        let mut joins = Vec::new();
        for _ in 0..8 {
            let table = Arc::clone(&table);
            joins.push(std::thread::spawn(move || {
                for _ in 0..100 {
                    table.retain(h).unwrap();
                    table.release(h).unwrap();
                }
            }));
        }
        for join in joins {
            join.join().unwrap();
        }

        assert_eq!(table.ref_count(h), Some(1));
        assert!(table.release(h).unwrap().is_some());
    }
}
