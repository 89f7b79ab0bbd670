//! Node layer: prefix-compressed B+-tree nodes and their page images.
//!
//! A node keeps its entries in parallel arrays (keys, values, child ids)
//! and caches the shared key prefix and its own serialized size, so that
//! page-budget decisions never require encoding the node first.

mod format;
mod node;

pub use format::NODE_HEADER_SIZE;
pub use node::{Node, NodeKind};
