//! # B+-Tree Index Engine
//!
//! A disk-based, paged B+-tree index over 64-bit keys and values,
//! designed as the index core of an object database.
//!
//! ## Architecture
//!
//! The engine is composed of modular, swappable components:
//!
//! - **Prefix Codec** (`prefix`): shared-prefix compression of sorted key runs
//! - **Node Layer** (`node`): leaf/inner nodes and their fixed-size page images
//! - **Storage Layer** (`storage`): page I/O, file header, free-page tracking
//! - **Buffer Manager** (`buffer`): node cache with dirty tracking and
//!   copy-on-write commit
//! - **Tree Layer** (`tree`): B+-tree operations and transaction-aware cursors
//!
//! ## Usage
//!
//! ```rust,ignore
//! use btree_index::{Config, Db};
//!
//! let config = Config::new("objects.idx");
//! let db = Db::open(config)?;
//!
//! db.insert(42, 4200)?;
//! let value = db.search(42)?;
//!
//! for entry in db.range(Some(10), Some(99))? {
//!     let (key, value) = entry?;
//!     println!("{key} -> {value}");
//! }
//!
//! // Persist the tree; the returned root page locates it after reopen
//! let root = db.commit()?;
//! ```

pub mod buffer;
pub mod error;
pub mod node;
pub mod prefix;
pub mod storage;
pub mod tree;
pub mod types;

pub use error::{IndexError, Result};
pub use types::{PageId, TreeConfig, DEFAULT_PAGE_SIZE};

// Re-export main public API
pub use buffer::{BufferManager, BufferManagerImpl};
pub use storage::{FileChannel, StorageChannel};
pub use tree::{BTree, LeafIterator};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

/// Database configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the index file
    pub path: PathBuf,
    /// Buffer manager capacity in number of nodes (default: 1000)
    pub buffer_capacity: usize,
    /// Whether to sync writes immediately (default: false for performance)
    pub sync_on_write: bool,
    /// Tree configuration: page size, uniqueness, value width
    pub tree: TreeConfig,
}

impl Config {
    /// Create a new configuration with default settings
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            path: path.into(),
            buffer_capacity: 1000,
            sync_on_write: false,
            tree: TreeConfig::default(),
        }
    }

    /// Set the buffer manager capacity
    pub fn buffer_capacity(mut self, capacity: usize) -> Self {
        self.buffer_capacity = capacity;
        self
    }

    /// Enable sync on write for durability
    pub fn sync_on_write(mut self, enabled: bool) -> Self {
        self.sync_on_write = enabled;
        self
    }

    /// Set the tree configuration
    pub fn tree(mut self, tree: TreeConfig) -> Self {
        self.tree = tree;
        self
    }
}

/// Node structure for visualization
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TreeNode {
    /// Page id, rendered to keep transient ids readable
    pub page_id: String,
    /// Whether this is a leaf node
    pub is_leaf: bool,
    /// Keys in this node
    pub keys: Vec<i64>,
    /// Values (leaf payloads or non-unique separator values)
    pub values: Vec<i64>,
    /// Child nodes (inner nodes only)
    pub children: Vec<TreeNode>,
}

/// Main database handle for one persistent index tree
///
/// Single writer, many readers: mutating calls take the tree's write
/// lock, lookups and iterator construction take the read lock.
pub struct Db {
    btree: Arc<RwLock<BTree>>,
    pool: Arc<BufferManagerImpl>,
    config: Config,
}

impl Db {
    /// Open or create an index at the configured path
    pub fn open(config: Config) -> Result<Self> {
        let channel = Arc::new(FileChannel::open(
            &config.path,
            config.tree,
            config.sync_on_write,
        )?);
        let pool = Arc::new(BufferManagerImpl::new(
            channel,
            config.tree,
            config.buffer_capacity,
        ));
        let btree = Arc::new(RwLock::new(BTree::new(Arc::clone(&pool), config.tree)?));

        Ok(Self {
            btree,
            pool,
            config,
        })
    }

    /// Get the tree configuration
    pub fn tree_config(&self) -> TreeConfig {
        self.config.tree
    }

    /// Insert an entry, overwriting an existing key in unique mode
    pub fn insert(&self, key: i64, value: i64) -> Result<bool> {
        self.btree.write().insert(key, value)
    }

    /// Insert an entry, failing with `DuplicateKey` if it already exists
    pub fn insert_new(&self, key: i64, value: i64) -> Result<()> {
        if self.btree.write().insert_if_absent(key, value)? {
            Ok(())
        } else {
            Err(IndexError::DuplicateKey(key))
        }
    }

    /// Remove an entry, returning its value
    pub fn remove(&self, key: i64, value: i64) -> Result<i64> {
        self.btree.write().remove(key, value)
    }

    /// Look up the value for a key (unique trees); `KeyNotFound` if absent
    pub fn search(&self, key: i64) -> Result<i64> {
        self.btree.read().search(key)
    }

    /// Look up a key, mapping absence to `None`
    pub fn get(&self, key: i64) -> Result<Option<i64>> {
        match self.btree.read().search(key) {
            Ok(value) => Ok(Some(value)),
            Err(IndexError::KeyNotFound) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Check if an entry exists (unique trees compare the key alone)
    pub fn contains(&self, key: i64, value: i64) -> Result<bool> {
        self.btree.read().contains(key, value)
    }

    /// Ascending iterator over all entries
    pub fn iter(&self) -> Result<LeafIterator> {
        self.btree.read().iter()
    }

    /// Ascending iterator over the inclusive key range `[start, end]`
    pub fn range(&self, start: Option<i64>, end: Option<i64>) -> Result<LeafIterator> {
        self.btree.read().range(start, end)
    }

    /// Ascending iterator from an exact (key, value) lower bound
    pub fn range_from(&self, key: i64, value: i64) -> Result<LeafIterator> {
        self.btree.read().range_from(key, value)
    }

    /// Descending iterator over all entries
    pub fn descending_iter(&self) -> Result<LeafIterator> {
        self.btree.read().descending_iter()
    }

    /// Descending iterator over the inclusive key range `[start, end]`
    pub fn descending_range(&self, start: Option<i64>, end: Option<i64>) -> Result<LeafIterator> {
        self.btree.read().descending_range(start, end)
    }

    /// Current root page id (transient until the first commit)
    pub fn root_page(&self) -> PageId {
        self.btree.read().root_page()
    }

    /// Commit the transaction: write every dirty node copy-on-write
    /// (children before parents), release superseded pages, persist the
    /// new root id, close open cursors and start the next transaction.
    ///
    /// Returns the committed root page id.
    pub fn commit(&self) -> Result<PageId> {
        let mut tree = self.btree.write();
        let root = tree.write_root()?;
        self.pool.release_freed_pages()?;
        self.pool.set_root_page(root)?;
        self.pool.sync()?;
        tree.registry().close_all();
        self.pool.next_transaction();
        Ok(root)
    }

    /// Roll back the transaction: drop every cached node, reload the
    /// committed root, close open cursors and start the next transaction.
    pub fn rollback(&self) -> Result<()> {
        let mut tree = self.btree.write();
        self.pool.clear();
        tree.reload_root()?;
        tree.registry().close_all();
        self.pool.next_transaction();
        Ok(())
    }

    /// Debug trace of a key lookup
    pub fn debug_search(&self, key: i64) -> Result<Vec<String>> {
        self.btree.read().debug_search(key)
    }

    /// Get statistics about the database
    pub fn stats(&self) -> Result<DbStats> {
        let tree = self.btree.read();
        Ok(DbStats {
            page_count: self.pool.page_count(),
            cached_nodes: self.pool.cached_count(),
            buffer_capacity: self.pool.capacity(),
            tree_height: tree.height()?,
            open_iterators: tree.registry().open_count(),
        })
    }

    /// Export the tree structure for visualization
    pub fn export_tree(&self) -> Result<TreeNode> {
        let tree = self.btree.read();
        self.export_node(tree.root_page())
    }

    fn export_node(&self, page_id: PageId) -> Result<TreeNode> {
        let (is_leaf, keys, values, child_ids) = {
            let guard = self.pool.read(page_id)?;
            let node = guard.node();
            let keys: Vec<i64> = (0..node.num_keys()).map(|i| node.key(i)).collect();
            let values: Vec<i64> = (0..node.num_keys()).map(|i| node.value(i)).collect();
            let child_ids: Vec<PageId> = if node.is_leaf() {
                Vec::new()
            } else {
                (0..node.num_children()).map(|i| node.child(i)).collect()
            };
            (node.is_leaf(), keys, values, child_ids)
        };

        let mut children = Vec::with_capacity(child_ids.len());
        for child_id in child_ids {
            children.push(self.export_node(child_id)?);
        }

        Ok(TreeNode {
            page_id: page_id.to_string(),
            is_leaf,
            keys,
            values,
            children,
        })
    }
}

/// Database statistics
#[derive(Debug, Clone)]
pub struct DbStats {
    /// Total number of pages in the index file
    pub page_count: usize,
    /// Nodes currently held by the buffer manager
    pub cached_nodes: usize,
    /// Buffer manager capacity
    pub buffer_capacity: usize,
    /// Height of the tree
    pub tree_height: usize,
    /// Cursors that have not been closed yet
    pub open_iterators: usize,
}
