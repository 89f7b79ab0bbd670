//! Buffer manager.
//!
//! The buffer manager owns every loaded node. The rest of the engine
//! refers to nodes only by page id: new nodes get a transient id from
//! `save`, `read`/`read_mut` materialize pages on demand, and `write`
//! performs the commit-time copy-on-write walk — children before
//! parents, because rewriting a child gives it a new page id that must
//! land in the parent before the parent itself is serialized.

use crate::buffer::lru::LruList;
use crate::error::{IndexError, Result};
use crate::node::Node;
use crate::storage::StorageChannel;
use crate::types::{PageId, TreeConfig};
use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

/// Contract between the tree and the page cache
pub trait BufferManager: Send + Sync {
    /// Adopt a freshly created node, assigning it a transient page id
    fn save(&self, node: Node) -> Result<PageId>;

    /// Fetch a node for reading, loading it from the channel on a miss
    fn read(&self, page_id: PageId) -> Result<NodeGuard<'_>>;

    /// Fetch a node for mutation; the node is marked dirty
    fn read_mut(&self, page_id: PageId) -> Result<NodeGuardMut<'_>>;

    /// Mark a cached node dirty without touching its contents (used for
    /// ancestors of a mutated node, which must be rewritten at commit)
    fn mark_dirty(&self, page_id: PageId) -> Result<()>;

    /// Copy-on-write flush of a node and its dirty descendants; returns
    /// the node's new page id
    fn write(&self, page_id: PageId) -> Result<PageId>;

    /// Drop a node and return its page to the free list
    fn delete(&self, page_id: PageId) -> Result<()>;

    /// Forget all cached nodes, dirty state and pending frees (rollback)
    fn clear(&self);

    /// Hand pages superseded by this transaction to the channel's free
    /// list. Deferred until commit so a rollback never releases pages
    /// the committed tree still references.
    fn release_freed_pages(&self) -> Result<()>;

    /// Identifier of the transaction in progress
    fn transaction_id(&self) -> u64;

    /// Start the next transaction (called on commit and rollback)
    fn next_transaction(&self) -> u64;

    /// Root page recorded by the channel at the last commit
    fn root_page(&self) -> PageId;

    /// Record the root page id in the channel
    fn set_root_page(&self, page_id: PageId) -> Result<()>;

    /// Flush channel state to durable storage
    fn sync(&self) -> Result<()>;
}

/// A cached node plus its pin count
struct Frame {
    node: Node,
    pin_count: u32,
}

/// Buffer manager implementation over a storage channel
pub struct BufferManagerImpl {
    channel: Arc<dyn StorageChannel>,
    cfg: TreeConfig,
    frames: RwLock<HashMap<PageId, Arc<RwLock<Frame>>>>,
    lru: RwLock<LruList>,
    /// Real pages superseded in this transaction, freed at commit
    pending_free: Mutex<Vec<PageId>>,
    capacity: usize,
    next_transient: AtomicU32,
    tx_id: AtomicU64,
}

impl BufferManagerImpl {
    /// Create a buffer manager caching up to `capacity` nodes
    pub fn new(channel: Arc<dyn StorageChannel>, cfg: TreeConfig, capacity: usize) -> Self {
        Self {
            channel,
            cfg,
            frames: RwLock::new(HashMap::with_capacity(capacity)),
            lru: RwLock::new(LruList::new(capacity)),
            pending_free: Mutex::new(Vec::new()),
            capacity,
            next_transient: AtomicU32::new(1),
            tx_id: AtomicU64::new(1),
        }
    }

    /// Number of nodes currently cached
    pub fn cached_count(&self) -> usize {
        self.frames.read().len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Total pages in the underlying channel
    pub fn page_count(&self) -> usize {
        self.channel.page_count()
    }

    fn frame(&self, page_id: PageId) -> Option<Arc<RwLock<Frame>>> {
        self.frames.read().get(&page_id).cloned()
    }

    fn get_frame(&self, page_id: PageId) -> Result<Arc<RwLock<Frame>>> {
        if let Some(frame) = self.frame(page_id) {
            self.lru.write().touch(page_id);
            return Ok(frame);
        }
        if page_id.is_transient() || !page_id.is_valid() || page_id == PageId::HEADER {
            // A transient id with no frame means the node was lost; for a
            // caller holding an old id this is database corruption
            return Err(IndexError::PageNotFound(page_id));
        }
        self.load_page(page_id)
    }

    fn load_page(&self, page_id: PageId) -> Result<Arc<RwLock<Frame>>> {
        let bytes = self.channel.read_page(page_id)?;
        let mut node = Node::read_page(&bytes, self.cfg)?;
        node.set_page_id(page_id);

        self.evict_if_full();

        let frame = Arc::new(RwLock::new(Frame { node, pin_count: 0 }));
        self.frames.write().insert(page_id, Arc::clone(&frame));
        self.lru.write().touch(page_id);
        Ok(frame)
    }

    /// Drop one cold, clean, unpinned frame when at capacity.
    ///
    /// Dirty frames are only written at commit, so when everything is
    /// pinned or dirty the cache grows past its capacity instead of
    /// failing the transaction.
    fn evict_if_full(&self) {
        if self.frames.read().len() < self.capacity {
            return;
        }

        let mut lru = self.lru.write();
        let mut skipped = Vec::new();
        let mut evicted = None;
        while let Some(candidate) = lru.pop_coldest() {
            let frame = match self.frame(candidate) {
                Some(frame) => frame,
                // Stale order entry, the frame is already gone
                None => continue,
            };
            let f = frame.read();
            if f.pin_count == 0 && !f.node.is_dirty() {
                evicted = Some(candidate);
                break;
            }
            skipped.push(candidate);
        }
        // Hot or dirty candidates return to the order, oldest first
        for page_id in skipped.into_iter().rev() {
            lru.touch(page_id);
        }
        drop(lru);

        if let Some(page_id) = evicted {
            self.frames.write().remove(&page_id);
        }
    }

    fn pin(frame: &Arc<RwLock<Frame>>) {
        frame.write().pin_count += 1;
    }
}

impl BufferManager for BufferManagerImpl {
    fn save(&self, mut node: Node) -> Result<PageId> {
        let seq = self.next_transient.fetch_add(1, Ordering::Relaxed);
        let page_id = PageId::transient(seq);
        node.set_page_id(page_id);
        node.mark_dirty();

        self.evict_if_full();
        let frame = Arc::new(RwLock::new(Frame { node, pin_count: 0 }));
        self.frames.write().insert(page_id, frame);
        self.lru.write().touch(page_id);
        Ok(page_id)
    }

    fn read(&self, page_id: PageId) -> Result<NodeGuard<'_>> {
        let frame = self.get_frame(page_id)?;
        Self::pin(&frame);
        Ok(NodeGuard {
            page_id,
            frame,
            manager: self,
        })
    }

    fn read_mut(&self, page_id: PageId) -> Result<NodeGuardMut<'_>> {
        let frame = self.get_frame(page_id)?;
        {
            let mut f = frame.write();
            f.pin_count += 1;
            f.node.mark_dirty();
        }
        Ok(NodeGuardMut {
            page_id,
            frame,
            manager: self,
        })
    }

    fn mark_dirty(&self, page_id: PageId) -> Result<()> {
        let frame = self.get_frame(page_id)?;
        frame.write().node.mark_dirty();
        Ok(())
    }

    fn write(&self, page_id: PageId) -> Result<PageId> {
        let frame = match self.frame(page_id) {
            Some(frame) => frame,
            // Not cached: a transient id would mean the node was lost,
            // a real id means the on-disk copy is already current
            None if page_id.is_transient() => return Err(IndexError::PageNotFound(page_id)),
            None => return Ok(page_id),
        };

        let (dirty, children) = {
            let f = frame.read();
            (f.node.is_dirty(), f.node.children.clone())
        };
        if !dirty {
            return Ok(page_id);
        }

        // Children first: their rewrite renames them, and the new names
        // must be serialized into this node
        for (slot, child) in children.into_iter().enumerate() {
            let new_id = self.write(child)?;
            if new_id != child {
                frame.write().node.replace_child(slot, new_id);
            }
        }

        let new_id = self.channel.allocate_page()?;
        let mut buf = vec![0u8; self.cfg.page_size];
        {
            let mut f = frame.write();
            f.node.set_page_id(new_id);
            f.node.write_page(&mut buf)?;
            f.node.clear_dirty();
        }
        self.channel.write_page(new_id, &buf)?;

        {
            let mut frames = self.frames.write();
            frames.remove(&page_id);
            frames.insert(new_id, frame);
        }
        {
            let mut lru = self.lru.write();
            lru.remove(page_id);
            lru.touch(new_id);
        }
        if !page_id.is_transient() {
            self.pending_free.lock().push(page_id);
        }
        Ok(new_id)
    }

    fn delete(&self, page_id: PageId) -> Result<()> {
        self.frames.write().remove(&page_id);
        self.lru.write().remove(page_id);
        if !page_id.is_transient() && page_id.is_valid() && page_id != PageId::HEADER {
            self.pending_free.lock().push(page_id);
        }
        Ok(())
    }

    fn clear(&self) {
        self.frames.write().clear();
        self.lru.write().clear();
        self.pending_free.lock().clear();
    }

    fn release_freed_pages(&self) -> Result<()> {
        let pages: Vec<PageId> = self.pending_free.lock().drain(..).collect();
        for page_id in pages {
            self.channel.free_page(page_id)?;
        }
        Ok(())
    }

    fn transaction_id(&self) -> u64 {
        self.tx_id.load(Ordering::Acquire)
    }

    fn next_transaction(&self) -> u64 {
        self.tx_id.fetch_add(1, Ordering::AcqRel) + 1
    }

    fn root_page(&self) -> PageId {
        self.channel.root_page()
    }

    fn set_root_page(&self, page_id: PageId) -> Result<()> {
        self.channel.set_root_page(page_id)
    }

    fn sync(&self) -> Result<()> {
        self.channel.sync()
    }
}

/// RAII guard for read access to a node
pub struct NodeGuard<'a> {
    page_id: PageId,
    frame: Arc<RwLock<Frame>>,
    manager: &'a BufferManagerImpl,
}

impl<'a> NodeGuard<'a> {
    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    /// Lock the node for reading
    pub fn node(&self) -> NodeRef<'_> {
        NodeRef {
            guard: self.frame.read(),
        }
    }
}

impl<'a> Drop for NodeGuard<'a> {
    fn drop(&mut self) {
        let mut frame = self.frame.write();
        frame.pin_count = frame.pin_count.saturating_sub(1);
        drop(frame);
        self.manager.lru.write().touch(self.page_id);
    }
}

/// Shared reference to a node behind its frame lock
pub struct NodeRef<'a> {
    guard: RwLockReadGuard<'a, Frame>,
}

impl<'a> std::ops::Deref for NodeRef<'a> {
    type Target = Node;

    fn deref(&self) -> &Self::Target {
        &self.guard.node
    }
}

/// RAII guard for write access to a node
pub struct NodeGuardMut<'a> {
    page_id: PageId,
    frame: Arc<RwLock<Frame>>,
    manager: &'a BufferManagerImpl,
}

impl<'a> NodeGuardMut<'a> {
    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    /// Lock the node for mutation
    pub fn node_mut(&self) -> NodeRefMut<'_> {
        let mut guard = self.frame.write();
        guard.node.mark_dirty();
        NodeRefMut { guard }
    }

    /// Lock the node for reading
    pub fn node(&self) -> NodeRef<'_> {
        NodeRef {
            guard: self.frame.read(),
        }
    }
}

impl<'a> Drop for NodeGuardMut<'a> {
    fn drop(&mut self) {
        let mut frame = self.frame.write();
        frame.pin_count = frame.pin_count.saturating_sub(1);
        drop(frame);
        self.manager.lru.write().touch(self.page_id);
    }
}

/// Exclusive reference to a node behind its frame lock
pub struct NodeRefMut<'a> {
    guard: RwLockWriteGuard<'a, Frame>,
}

impl<'a> std::ops::Deref for NodeRefMut<'a> {
    type Target = Node;

    fn deref(&self) -> &Self::Target {
        &self.guard.node
    }
}

impl<'a> std::ops::DerefMut for NodeRefMut<'a> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.guard.node
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::FileChannel;
    use tempfile::{tempdir, TempDir};

    fn setup(cfg: TreeConfig, capacity: usize) -> (BufferManagerImpl, TempDir) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.idx");
        let channel = Arc::new(FileChannel::open(&path, cfg, false).unwrap());
        (BufferManagerImpl::new(channel, cfg, capacity), dir)
    }

    fn cfg() -> TreeConfig {
        TreeConfig::new(128, true, 8)
    }

    #[test]
    fn test_save_assigns_transient_ids() -> Result<()> {
        let (mgr, _dir) = setup(cfg(), 10);

        let id1 = mgr.save(Node::new_leaf(cfg(), true))?;
        let id2 = mgr.save(Node::new_leaf(cfg(), false))?;
        assert!(id1.is_transient());
        assert!(id2.is_transient());
        assert_ne!(id1, id2);

        let guard = mgr.read(id1)?;
        assert!(guard.node().is_dirty());
        Ok(())
    }

    #[test]
    fn test_write_is_copy_on_write() -> Result<()> {
        let (mgr, _dir) = setup(cfg(), 10);

        let mut leaf = Node::new_leaf(cfg(), true);
        leaf.put(1, 10, false)?;
        let transient = mgr.save(leaf)?;

        let first = mgr.write(transient)?;
        assert!(!first.is_transient());
        assert!(mgr.read(transient).is_err());
        assert!(!mgr.read(first)?.node().is_dirty());

        // A clean node is not rewritten
        assert_eq!(mgr.write(first)?, first);

        // Mutating and rewriting allocates a fresh page; the old one is
        // only released once the transaction's frees are flushed
        mgr.read_mut(first)?.node_mut().put(2, 20, false)?;
        let second = mgr.write(first)?;
        assert_ne!(second, first);
        mgr.release_freed_pages()?;

        mgr.read_mut(second)?.node_mut().put(3, 30, false)?;
        let third = mgr.write(second)?;
        assert_eq!(third, first);
        Ok(())
    }

    #[test]
    fn test_write_propagates_child_renames() -> Result<()> {
        let (mgr, _dir) = setup(cfg(), 10);

        let mut leaf_a = Node::new_leaf(cfg(), false);
        leaf_a.put(1, 10, false)?;
        let mut leaf_b = Node::new_leaf(cfg(), false);
        leaf_b.put(5, 50, false)?;

        let id_a = mgr.save(leaf_a)?;
        let id_b = mgr.save(leaf_b)?;
        let root = Node::new_inner(cfg(), true, 5, 0, id_a, id_b);
        let root_id = mgr.save(root)?;

        let new_root = mgr.write(root_id)?;
        assert!(!new_root.is_transient());

        let guard = mgr.read(new_root)?;
        let node = guard.node();
        assert!(!node.child(0).is_transient());
        assert!(!node.child(1).is_transient());
        assert!(!node.is_dirty());

        // The rewritten children are readable under their new names
        let left = node.child(0);
        drop(node);
        drop(guard);
        assert_eq!(mgr.read(left)?.node().key(0), 1);
        Ok(())
    }

    #[test]
    fn test_read_reloads_after_eviction() -> Result<()> {
        let (mgr, _dir) = setup(cfg(), 2);

        let mut ids = Vec::new();
        for k in 0..4 {
            let mut leaf = Node::new_leaf(cfg(), false);
            leaf.put(k, k * 10, false)?;
            let id = mgr.save(leaf)?;
            ids.push(mgr.write(id)?);
        }
        // Clean frames above capacity were evicted along the way
        assert!(mgr.cached_count() <= 3);

        for (k, &id) in ids.iter().enumerate() {
            let guard = mgr.read(id)?;
            assert_eq!(guard.node().value(0), k as i64 * 10);
        }
        Ok(())
    }

    #[test]
    fn test_dirty_frames_survive_eviction_pressure() -> Result<()> {
        let (mgr, _dir) = setup(cfg(), 2);

        let mut ids = Vec::new();
        for k in 0..5 {
            let mut leaf = Node::new_leaf(cfg(), false);
            leaf.put(k, k, false)?;
            ids.push(mgr.save(leaf)?);
        }
        // All frames are dirty: nothing is evictable, the cache grew
        assert_eq!(mgr.cached_count(), 5);
        for &id in &ids {
            assert!(mgr.read(id)?.node().is_dirty());
        }
        Ok(())
    }

    #[test]
    fn test_delete_frees_the_page() -> Result<()> {
        let (mgr, _dir) = setup(cfg(), 10);

        let id = mgr.save(Node::new_leaf(cfg(), false))?;
        let real = mgr.write(id)?;
        mgr.delete(real)?;
        assert!(mgr.read(real).is_err());

        // After the commit-time release the page is handed out again
        mgr.release_freed_pages()?;
        let id2 = mgr.save(Node::new_leaf(cfg(), false))?;
        assert_eq!(mgr.write(id2)?, real);
        Ok(())
    }

    #[test]
    fn test_clear_forgets_everything() -> Result<()> {
        let (mgr, _dir) = setup(cfg(), 10);

        let transient = mgr.save(Node::new_leaf(cfg(), true))?;
        mgr.clear();
        assert_eq!(mgr.cached_count(), 0);
        assert!(matches!(
            mgr.read(transient),
            Err(IndexError::PageNotFound(_))
        ));
        Ok(())
    }

    #[test]
    fn test_transaction_ids_are_monotonic() {
        let (mgr, _dir) = setup(cfg(), 10);
        let t0 = mgr.transaction_id();
        assert_eq!(mgr.next_transaction(), t0 + 1);
        assert_eq!(mgr.transaction_id(), t0 + 1);
        assert_eq!(mgr.next_transaction(), t0 + 2);
    }
}
