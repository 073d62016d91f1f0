// Handle Pool
//
// Per-view slab of FileHandles. Released slots go onto a LIFO free list and
// are reused by the next acquire. Each slot carries a generation that is
// bumped on release, so a FileId held past its release never reaches the
// slot's next occupant.

use std::sync::Arc;

use tracing::trace;

use super::handle::{Entry, FileHandle};
use super::{BackingStore, User};

/// Address of an issued handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileId {
    index: u32,
    generation: u32,
}

impl FileId {
    /// Slot index inside the pool
    pub fn index(&self) -> usize {
        self.index as usize
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

struct Slot<S: BackingStore> {
    generation: u32,
    in_use: bool,
    handle: FileHandle<S>,
}

/// Handle pool for a single view
pub struct HandlePool<S: BackingStore> {
    store: Arc<S>,
    slots: Vec<Slot<S>>,
    /// Indices of released slots, most recently released last
    free: Vec<usize>,
}

impl<S: BackingStore> HandlePool<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            slots: Vec::new(),
            free: Vec::new(),
        }
    }

    /// Issue a handle for `path`, reusing a released slot when available
    pub fn acquire(&mut self, path: &str, entry: Entry<S::Node>, user: Arc<User>) -> FileId {
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    in_use: false,
                    handle: FileHandle::new(self.store.clone()),
                });
                self.slots.len() - 1
            }
        };

        let slot = &mut self.slots[index];
        slot.in_use = true;
        slot.handle.bind(path, entry, user);
        trace!("POOL: acquire slot {} gen {} for {}", index, slot.generation, path);

        FileId {
            index: index as u32,
            generation: slot.generation,
        }
    }

    /// Return a handle to the free list
    ///
    /// # Returns
    /// false if `id` is stale (already released)
    pub fn release(&mut self, id: FileId) -> bool {
        let Some(slot) = self.live_slot_mut(id) else {
            return false;
        };
        slot.handle.clear();
        slot.in_use = false;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index());
        trace!("POOL: release slot {}", id.index);
        true
    }

    /// Release every issued handle
    ///
    /// # Returns
    /// Number of handles released
    pub fn release_all(&mut self) -> usize {
        let live: Vec<FileId> = self
            .slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.in_use)
            .map(|(index, slot)| FileId {
                index: index as u32,
                generation: slot.generation,
            })
            .collect();

        for id in &live {
            self.release(*id);
        }
        live.len()
    }

    pub fn get(&self, id: FileId) -> Option<&FileHandle<S>> {
        self.slots
            .get(id.index())
            .filter(|slot| slot.in_use && slot.generation == id.generation)
            .map(|slot| &slot.handle)
    }

    pub fn get_mut(&mut self, id: FileId) -> Option<&mut FileHandle<S>> {
        self.live_slot_mut(id).map(|slot| &mut slot.handle)
    }

    fn live_slot_mut(&mut self, id: FileId) -> Option<&mut Slot<S>> {
        self.slots
            .get_mut(id.index())
            .filter(|slot| slot.in_use && slot.generation == id.generation)
    }

    /// Number of handles currently issued
    pub fn in_use(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    /// Number of released handles waiting for reuse
    pub fn free_len(&self) -> usize {
        self.free.len()
    }

    /// Total number of handle objects ever allocated by this pool
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }
}
