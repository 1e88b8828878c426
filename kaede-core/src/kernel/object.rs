//! Kernel objects and the handle table.
//!
//! Guest code never sees host references; every kernel object lives in a
//! slab arena and is addressed by an opaque integer [`Handle`]. Back
//! references between objects are handle or id lookups, so there is no
//! shared-ownership graph to keep cycles out of.

use slab::Slab;

use crate::kernel::thread::ThreadId;
use crate::service::{ServiceId, SessionId};

/// An opaque integer naming a kernel object. Zero is never a valid handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle(u32);

impl Handle {
    pub fn from_raw(raw: u32) -> Self {
        Handle(raw)
    }

    #[inline]
    pub fn as_raw(self) -> u32 {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelObject {
    /// A client's end of an open service session.
    Session {
        service: ServiceId,
        session: SessionId,
    },
    /// A guest thread.
    Thread(ThreadId),
}

#[derive(Default)]
pub struct HandleTable {
    slots: Slab<KernelObject>,
}

impl HandleTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, object: KernelObject) -> Handle {
        // Slab keys start at zero; shift by one so a zeroed guest word can
        // never name a live object.
        Handle(self.slots.insert(object) as u32 + 1)
    }

    pub fn get(&self, handle: Handle) -> Option<&KernelObject> {
        let key = (handle.0 as usize).checked_sub(1)?;
        self.slots.get(key)
    }

    pub fn remove(&mut self, handle: Handle) -> Option<KernelObject> {
        let key = (handle.0 as usize).checked_sub(1)?;
        self.slots.try_remove(key)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_is_never_a_valid_handle() {
        let mut table = HandleTable::new();
        let h = table.insert(KernelObject::Thread(ThreadId::from_raw(0)));
        assert_ne!(h.as_raw(), 0);
        assert!(table.get(Handle::from_raw(0)).is_none());
        assert!(table.get(h).is_some());
    }

    #[test]
    fn removed_handles_stop_resolving() {
        let mut table = HandleTable::new();
        let h = table.insert(KernelObject::Thread(ThreadId::from_raw(3)));
        assert_eq!(
            table.remove(h),
            Some(KernelObject::Thread(ThreadId::from_raw(3)))
        );
        assert!(table.get(h).is_none());
        assert!(table.remove(h).is_none());
    }
}
