//! System-wide open-file table
//!
//! An open file is one open instance of a vnode: the vnode, a byte offset
//! and the access mode it was opened with. Descriptors name open files
//! through generation-tagged handles, so a handle kept after its slot was
//! recycled no longer resolves.
//!
//! Reference counting rules:
//! - allocate() creates an entry with refcount 1
//! - retain() increments refcount (dup, dup2, fork)
//! - release() decrements refcount; at 0 the vnode is closed and the slot
//!   freed, exactly once
//!
//! Each entry moves Live -> Closing -> Free. The vnode is closed while the
//! entry is Closing, outside every lock, and only then is the slot given
//! back to the arena. No thread can claim the slot before the close is
//! done.

use super::lock;
use crate::vfs::{FileLayer, Vnode};
use log::debug;
use slab::Slab;
use std::io;
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

/// Generation-tagged reference to an open-file slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle {
    index: u32,
    generation: u32,
}

impl Handle {
    pub fn index(&self) -> usize {
        self.index as usize
    }
}

impl std::fmt::Display for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "of{}.{}", self.index, self.generation)
    }
}

/// Access mode an open file was created with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

impl AccessMode {
    pub fn can_read(self) -> bool {
        matches!(self, AccessMode::ReadOnly | AccessMode::ReadWrite)
    }

    pub fn can_write(self) -> bool {
        matches!(self, AccessMode::WriteOnly | AccessMode::ReadWrite)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryState {
    Live,
    Closing,
}

#[derive(Debug)]
struct RefState {
    count: usize,
    state: EntryState,
}

/// One open instance of a vnode
///
/// The offset is shared by every descriptor naming this entry and is not
/// serialized between them: two threads transferring through the same
/// entry at once may both start from the same offset. Callers that share
/// an entry across threads must order their own I/O.
#[derive(Debug)]
pub struct OpenFile {
    node: Arc<dyn Vnode>,
    access: AccessMode,
    offset: AtomicI64,
    refs: Mutex<RefState>,
}

impl OpenFile {
    pub fn node(&self) -> &Arc<dyn Vnode> {
        &self.node
    }

    pub fn access(&self) -> AccessMode {
        self.access
    }

    pub fn offset(&self) -> i64 {
        self.offset.load(Ordering::Relaxed)
    }

    pub fn set_offset(&self, offset: i64) {
        self.offset.store(offset, Ordering::Relaxed);
    }

    pub fn advance(&self, n: usize) {
        self.offset.fetch_add(n as i64, Ordering::Relaxed);
    }

    pub fn refcount(&self) -> usize {
        lock(&self.refs).count
    }
}

struct Slot {
    generation: u32,
    entry: Arc<OpenFile>,
}

/// The bounded system open-file table
pub struct OpenFileTable {
    slots: Mutex<Slab<Slot>>,
    capacity: usize,
    next_generation: AtomicU32,
}

impl OpenFileTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Mutex::new(Slab::with_capacity(capacity)),
            capacity,
            next_generation: AtomicU32::new(1),
        }
    }

    /// Claim a slot for `node` (refcount 1)
    ///
    /// When the table is full the vnode is handed back untouched so the
    /// caller can close it.
    pub fn allocate(
        &self,
        node: Arc<dyn Vnode>,
        access: AccessMode,
        offset: i64,
    ) -> Result<Handle, Arc<dyn Vnode>> {
        let mut slots = lock(&self.slots);
        if slots.len() >= self.capacity {
            return Err(node);
        }

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let index = slots.insert(Slot {
            generation,
            entry: Arc::new(OpenFile {
                node,
                access,
                offset: AtomicI64::new(offset),
                refs: Mutex::new(RefState {
                    count: 1,
                    state: EntryState::Live,
                }),
            }),
        });

        let handle = Handle {
            index: index as u32,
            generation,
        };
        debug!("open file {} allocated ({}/{})", handle, slots.len(), self.capacity);
        Ok(handle)
    }

    /// Resolve a handle; stale handles resolve to `None`
    pub fn get(&self, handle: Handle) -> Option<Arc<OpenFile>> {
        let slots = lock(&self.slots);
        slots
            .get(handle.index())
            .filter(|slot| slot.generation == handle.generation)
            .map(|slot| Arc::clone(&slot.entry))
    }

    /// Add a reference; false if the handle is stale or the entry closing
    pub fn retain(&self, handle: Handle) -> bool {
        let Some(entry) = self.get(handle) else {
            return false;
        };
        let mut refs = lock(&entry.refs);
        if refs.state != EntryState::Live {
            return false;
        }
        refs.count += 1;
        debug!("open file {} retained (refs {})", handle, refs.count);
        true
    }

    /// Drop a reference, closing the vnode on the last one
    ///
    /// Returns whether the entry was freed. The close error, if any, is
    /// reported after the slot has been freed.
    ///
    /// # Panics
    ///
    /// Releasing a stale handle or an entry whose count is already zero
    /// is a bookkeeping bug and panics.
    pub fn release(&self, handle: Handle, fs: &dyn FileLayer) -> io::Result<bool> {
        let entry = self
            .get(handle)
            .unwrap_or_else(|| panic!("release of stale open-file handle {}", handle));

        {
            let mut refs = lock(&entry.refs);
            if refs.count == 0 || refs.state != EntryState::Live {
                panic!("open file {} refcount underflow", handle);
            }
            refs.count -= 1;
            if refs.count > 0 {
                debug!("open file {} released (refs {})", handle, refs.count);
                return Ok(false);
            }
            refs.state = EntryState::Closing;
        }

        let result = fs.close(Arc::clone(&entry.node));

        lock(&self.slots).remove(handle.index());
        debug!("open file {} freed", handle);
        result.map(|()| true)
    }

    /// Live entries
    pub fn len(&self) -> usize {
        lock(&self.slots).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::{MemoryFs, OpenOptions};

    fn open(fs: &MemoryFs, path: &str) -> Arc<dyn Vnode> {
        fs.open(None, path, OpenOptions::new().write(true).create(true), 0)
            .unwrap()
    }

    #[test]
    fn test_allocate_and_release() {
        let fs = MemoryFs::new();
        let table = OpenFileTable::new(4);

        let h = table.allocate(open(&fs, "/a"), AccessMode::ReadWrite, 0).unwrap();
        assert_eq!(table.len(), 1);
        assert_eq!(table.get(h).unwrap().refcount(), 1);

        assert!(table.release(h, &fs).unwrap());
        assert_eq!(table.len(), 0);
        assert_eq!(fs.open_refs(), 0);
    }

    #[test]
    fn test_refcount_keeps_entry_alive() {
        let fs = MemoryFs::new();
        let table = OpenFileTable::new(4);
        let h = table.allocate(open(&fs, "/a"), AccessMode::ReadOnly, 0).unwrap();

        assert!(table.retain(h));
        assert!(!table.release(h, &fs).unwrap());
        assert_eq!(fs.refs_of("/a"), 1);

        assert!(table.release(h, &fs).unwrap());
        assert_eq!(fs.refs_of("/a"), 0);
    }

    #[test]
    fn test_full_table_returns_node() {
        let fs = MemoryFs::new();
        let table = OpenFileTable::new(1);
        let _h = table.allocate(open(&fs, "/a"), AccessMode::ReadOnly, 0).unwrap();

        let node = table
            .allocate(open(&fs, "/b"), AccessMode::ReadOnly, 0)
            .unwrap_err();
        fs.close(node).unwrap();
        assert_eq!(fs.refs_of("/b"), 0);
    }

    #[test]
    fn test_stale_handle_rejected() {
        let fs = MemoryFs::new();
        let table = OpenFileTable::new(2);

        let old = table.allocate(open(&fs, "/a"), AccessMode::ReadOnly, 0).unwrap();
        table.release(old, &fs).unwrap();

        // Same slot, new generation
        let new = table.allocate(open(&fs, "/b"), AccessMode::ReadOnly, 0).unwrap();
        assert_eq!(old.index(), new.index());
        assert!(table.get(old).is_none());
        assert!(!table.retain(old));
        assert!(table.get(new).is_some());
    }

    #[test]
    #[should_panic(expected = "stale open-file handle")]
    fn test_double_release_panics() {
        let fs = MemoryFs::new();
        let table = OpenFileTable::new(2);
        let h = table.allocate(open(&fs, "/a"), AccessMode::ReadOnly, 0).unwrap();
        table.release(h, &fs).unwrap();
        let _ = table.release(h, &fs);
    }

    #[test]
    fn test_shared_offset() {
        let fs = MemoryFs::new();
        let table = OpenFileTable::new(2);
        let h = table.allocate(open(&fs, "/a"), AccessMode::ReadOnly, 5).unwrap();

        let a = table.get(h).unwrap();
        let b = table.get(h).unwrap();
        a.advance(10);
        assert_eq!(b.offset(), 15);
    }

    #[test]
    fn test_access_modes() {
        assert!(AccessMode::ReadOnly.can_read());
        assert!(!AccessMode::ReadOnly.can_write());
        assert!(!AccessMode::WriteOnly.can_read());
        assert!(AccessMode::ReadWrite.can_write());
    }
}
