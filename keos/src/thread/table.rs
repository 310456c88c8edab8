//! Bounded storage for thread control blocks.

use super::{Thread, Tid};
use crate::KernelError;
use crossbeam_queue::ArrayQueue;
use std::{
    collections::BTreeMap,
    ops::{Index, IndexMut},
};

/// The thread table.
///
/// Slots are preallocated at boot. Free slot numbers live in a bounded queue,
/// so creating a thread in a full table fails instead of growing the table.
pub struct ThreadTable {
    slots: Vec<Option<Thread>>,
    free: ArrayQueue<usize>,
    index: BTreeMap<Tid, usize>,
}

impl ThreadTable {
    /// Creates a table with room for `capacity` threads.
    pub fn new(capacity: usize) -> Self {
        let free = ArrayQueue::new(capacity.max(1));
        for slot in 0..capacity {
            let _ = free.push(slot);
        }
        Self {
            slots: (0..capacity).map(|_| None).collect(),
            free,
            index: BTreeMap::new(),
        }
    }

    /// Stores `th` in a free slot.
    pub fn insert(&mut self, th: Thread) -> Result<(), KernelError> {
        let slot = self.free.pop().ok_or(KernelError::NoMemory)?;
        self.index.insert(th.tid, slot);
        self.slots[slot] = Some(th);
        Ok(())
    }

    /// Removes the thread `tid` and frees its slot.
    pub fn remove(&mut self, tid: Tid) -> Option<Thread> {
        let slot = self.index.remove(&tid)?;
        let th = self.slots[slot].take();
        let _ = self.free.push(slot);
        th
    }

    /// Looks up the thread `tid`.
    pub fn get(&self, tid: Tid) -> Option<&Thread> {
        self.index
            .get(&tid)
            .and_then(|slot| self.slots[*slot].as_ref())
    }

    /// Looks up the thread `tid` for modification.
    pub fn get_mut(&mut self, tid: Tid) -> Option<&mut Thread> {
        match self.index.get(&tid) {
            Some(slot) => self.slots[*slot].as_mut(),
            None => None,
        }
    }

    /// Iterates over live threads.
    pub fn iter(&self) -> impl Iterator<Item = &Thread> {
        self.slots.iter().flatten()
    }

    /// Iterates over live threads for modification.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Thread> {
        self.slots.iter_mut().flatten()
    }
}

impl Index<Tid> for ThreadTable {
    type Output = Thread;

    #[track_caller]
    fn index(&self, tid: Tid) -> &Thread {
        self.get(tid)
            .unwrap_or_else(|| panic!("No thread with tid {tid}."))
    }
}

impl IndexMut<Tid> for ThreadTable {
    #[track_caller]
    fn index_mut(&mut self, tid: Tid) -> &mut Thread {
        self.get_mut(tid)
            .unwrap_or_else(|| panic!("No thread with tid {tid}."))
    }
}
