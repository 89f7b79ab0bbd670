//! LRU ordering for frame eviction.
//!
//! Tracks the access recency of cached pages so the buffer manager can
//! find a cold frame to drop. Only clean, unpinned frames are actually
//! evictable; this structure just answers "which page was touched
//! longest ago".

use crate::types::PageId;
use std::collections::HashMap;

/// Access-ordered set of page ids
pub struct LruList {
    /// Slot index of each tracked page
    slots: HashMap<PageId, usize>,
    /// Slab of doubly-linked entries for O(1) unlink
    entries: Vec<Entry>,
    /// Most recently touched
    head: Option<usize>,
    /// Least recently touched
    tail: Option<usize>,
    /// Recyclable slab slots
    free: Vec<usize>,
}

#[derive(Clone, Copy)]
struct Entry {
    page_id: PageId,
    prev: Option<usize>,
    next: Option<usize>,
}

impl LruList {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: HashMap::with_capacity(capacity),
            entries: Vec::with_capacity(capacity),
            head: None,
            tail: None,
            free: Vec::new(),
        }
    }

    /// Record an access, inserting the page if it is new
    pub fn touch(&mut self, page_id: PageId) {
        if let Some(&slot) = self.slots.get(&page_id) {
            self.unlink(slot);
            self.link_front(slot);
        } else {
            let entry = Entry {
                page_id,
                prev: None,
                next: None,
            };
            let slot = match self.free.pop() {
                Some(slot) => {
                    self.entries[slot] = entry;
                    slot
                }
                None => {
                    self.entries.push(entry);
                    self.entries.len() - 1
                }
            };
            self.link_front(slot);
            self.slots.insert(page_id, slot);
        }
    }

    /// Drop a page from the order
    pub fn remove(&mut self, page_id: PageId) {
        if let Some(slot) = self.slots.remove(&page_id) {
            self.unlink(slot);
            self.free.push(slot);
        }
    }

    /// The page touched longest ago
    pub fn coldest(&self) -> Option<PageId> {
        self.tail.map(|slot| self.entries[slot].page_id)
    }

    /// Remove and return the page touched longest ago
    pub fn pop_coldest(&mut self) -> Option<PageId> {
        let page_id = self.coldest()?;
        self.remove(page_id);
        Some(page_id)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn clear(&mut self) {
        self.slots.clear();
        self.entries.clear();
        self.free.clear();
        self.head = None;
        self.tail = None;
    }

    fn link_front(&mut self, slot: usize) {
        self.entries[slot].prev = None;
        self.entries[slot].next = self.head;
        if let Some(old_head) = self.head {
            self.entries[old_head].prev = Some(slot);
        }
        self.head = Some(slot);
        if self.tail.is_none() {
            self.tail = Some(slot);
        }
    }

    fn unlink(&mut self, slot: usize) {
        let entry = self.entries[slot];
        match entry.prev {
            Some(prev) => self.entries[prev].next = entry.next,
            None => self.head = entry.next,
        }
        match entry.next {
            Some(next) => self.entries[next].prev = entry.prev,
            None => self.tail = entry.prev,
        }
    }
}
